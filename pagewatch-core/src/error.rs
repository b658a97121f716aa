//! Error types for pagewatch-core
//!
//! Faults raised by the host page are never represented here: they become
//! [`ErrorRecord`](crate::types::ErrorRecord)s. This type only covers failures
//! of the pipeline itself.

use thiserror::Error;

/// Main error type for the pagewatch-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport failure or non-success response from the collector
    #[error("delivery error: {0}")]
    Delivery(String),

    /// A delivery attempt did not complete within the configured timeout
    #[error("delivery timed out after {0}ms")]
    Timeout(u64),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a delivery attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Delivery(_) | Error::Timeout(_))
    }
}

/// Result type alias for pagewatch-core
pub type Result<T> = std::result::Result<T, Error>;

/// Run code on the processing boundary, logging and suppressing any panic.
///
/// Used around user callbacks and per-signal processing so a fault inside the
/// pipeline never unwinds into host code.
pub(crate) fn contain_panic<R>(what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(source = what, reason = %reason, "Suppressed internal fault");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::Delivery("API error (503)".to_string()).is_retryable());
        assert!(Error::Timeout(10_000).is_retryable());
        assert!(!Error::Config("endpoint is required".to_string()).is_retryable());
    }

    #[test]
    fn test_contain_panic() {
        assert_eq!(contain_panic("ok", || 7), Some(7));
        assert_eq!(contain_panic("boom", || -> u32 { panic!("boom") }), None);
    }

    #[test]
    fn test_error_display() {
        let err = Error::Timeout(250);
        assert_eq!(err.to_string(), "delivery timed out after 250ms");
    }
}
