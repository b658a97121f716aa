//! Core domain types for pagewatch
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Capture** | A normalized [`ErrorRecord`] ready for queueing and delivery |
//! | **Batch** | A group of records detached together for one delivery attempt |
//! | **Jank** | Rendering stutter, quantified by long/severe/dropped [`FrameSample`]s |
//! | **Smoothness score** | 0–100 composite of average fps and jank ratios |
//! | **Scroll session** | Frames observed during one continuous scroll gesture |

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form metadata attached to a record
pub type Extra = serde_json::Map<String, serde_json::Value>;

// ============================================
// Error records
// ============================================

/// Kind of captured fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ScriptError,
    RejectedPromise,
    ResourceError,
    NetworkError,
    BlankScreen,
    Custom,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ScriptError => "script-error",
            ErrorKind::RejectedPromise => "rejected-promise",
            ErrorKind::ResourceError => "resource-error",
            ErrorKind::NetworkError => "network-error",
            ErrorKind::BlankScreen => "blank-screen",
            ErrorKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script-error" => Ok(ErrorKind::ScriptError),
            "rejected-promise" => Ok(ErrorKind::RejectedPromise),
            "resource-error" => Ok(ErrorKind::ResourceError),
            "network-error" => Ok(ErrorKind::NetworkError),
            "blank-screen" => Ok(ErrorKind::BlankScreen),
            "custom" => Ok(ErrorKind::Custom),
            _ => Err(format!("unknown error kind: {}", s)),
        }
    }
}

/// A captured fault or synthetic condition, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Random id so the collector can drop redelivered copies
    pub id: Uuid,
    /// Never empty
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    /// Wall-clock milliseconds, non-decreasing within a session
    pub timestamp: u64,
    pub url: String,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colno: Option<u32>,
    /// Groups identical faults (32-char hex)
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Extra>,
}

// ============================================
// Frame sampling
// ============================================

/// One 60 Hz vsync interval in milliseconds
pub const VSYNC_INTERVAL_MS: f64 = 1000.0 / 60.0;

/// One measured frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameSample {
    pub id: u64,
    /// Milliseconds since the previous frame callback
    pub duration: f64,
    /// High-resolution time of this frame callback
    pub timestamp: f64,
    pub is_long: bool,
    pub is_severe: bool,
    pub is_dropped: bool,
}

impl FrameSample {
    /// Classify a frame duration against the configured thresholds.
    pub fn classify(
        id: u64,
        duration: f64,
        timestamp: f64,
        long_threshold: f64,
        severe_threshold: f64,
    ) -> Self {
        Self {
            id,
            duration,
            timestamp,
            is_long: duration > long_threshold,
            is_severe: duration > severe_threshold,
            is_dropped: duration > VSYNC_INTERVAL_MS,
        }
    }
}

/// Derived view of the sampler state at one instant. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub current_fps: f64,
    pub avg_fps: f64,
    pub min_fps: f64,
    pub max_fps: f64,
    pub total_frames: usize,
    pub long_frames: usize,
    pub severe_frames: usize,
    pub dropped_frames: usize,
    /// 0–100
    pub smoothness_score: u32,
    /// Milliseconds since sampling started
    pub duration: f64,
    pub timestamp: f64,
}

/// Metrics for one finished scroll gesture
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollSession {
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub start_offset: f64,
    pub end_offset: f64,
    pub distance: f64,
    pub frame_count: usize,
    pub avg_fps: f64,
    pub min_fps: f64,
    pub dropped_frames: usize,
    pub dropped_ratio: f64,
    /// 0–100
    pub score: u32,
}

// ============================================
// Delivery
// ============================================

/// SDK identification sent with every batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SdkInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl SdkInfo {
    pub const CURRENT: SdkInfo = SdkInfo {
        name: "pagewatch",
        version: env!("CARGO_PKG_VERSION"),
    };
}

/// Request body for one flushed batch
#[derive(Debug, Clone, Serialize)]
pub struct ReportBatch {
    pub errors: Vec<ErrorRecord>,
    pub timestamp: u64,
    pub sdk: SdkInfo,
}

/// Parsed collector response
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeliveryReceipt {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Aggregate counters exposed by the monitor
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStats {
    /// Records accepted by the capture queue since start
    pub total_errors: usize,
    /// Records currently retained in the capture queue
    pub queue_size: usize,
    /// Records not yet successfully delivered
    pub pending_reports: usize,
    pub delivered: usize,
    pub failed_batches: usize,
    pub is_running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_round_trip_str() {
        for kind in [
            ErrorKind::ScriptError,
            ErrorKind::RejectedPromise,
            ErrorKind::ResourceError,
            ErrorKind::NetworkError,
            ErrorKind::BlankScreen,
            ErrorKind::Custom,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert!("panic".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn test_frame_classification() {
        let ok = FrameSample::classify(1, 16.0, 100.0, 50.0, 100.0);
        assert!(!ok.is_long && !ok.is_severe && !ok.is_dropped);

        let dropped = FrameSample::classify(2, 17.0, 117.0, 50.0, 100.0);
        assert!(dropped.is_dropped && !dropped.is_long);

        let severe = FrameSample::classify(3, 150.0, 267.0, 50.0, 100.0);
        assert!(severe.is_long && severe.is_severe && severe.is_dropped);
    }

    #[test]
    fn test_record_wire_format() {
        let record = ErrorRecord {
            id: Uuid::nil(),
            message: "boom".to_string(),
            stack: None,
            kind: ErrorKind::RejectedPromise,
            timestamp: 42,
            url: "https://app.example.com/".to_string(),
            user_agent: "test-agent".to_string(),
            filename: None,
            lineno: None,
            colno: None,
            fingerprint: "00".repeat(16),
            extra: None,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "rejected-promise");
        assert_eq!(json["userAgent"], "test-agent");
        assert!(json.get("stack").is_none());
        assert!(json.get("extra").is_none());
    }
}
