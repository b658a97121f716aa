//! Capture normalization
//!
//! Converts the fault shapes a page can raise into [`ErrorRecord`]s, filters
//! them, and keeps the most recent ones in a bounded FIFO.
//!
//! ## Fingerprints
//!
//! Every record carries a fingerprint so a collector can group repeats of the
//! same fault. It is a 32-character hex digest of
//! `SHA-256(kind + message + first stack frame)`; timestamps, ids and page URL
//! are deliberately excluded.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::blank::BlankCheck;
use crate::error::contain_panic;
use crate::types::{ErrorKind, ErrorRecord, Extra};

/// Tags whose load failures are reported as resource errors
const RESOURCE_TAGS: &[&str] = &["img", "script", "link", "video", "audio", "source", "iframe"];

/// Decides whether a normalized record is kept
pub type ErrorFilter = Arc<dyn Fn(&ErrorRecord) -> bool + Send + Sync>;

/// Receives every accepted record, synchronously after enqueue
pub type ErrorCallback = Arc<dyn Fn(&ErrorRecord) + Send + Sync>;

// ============================================
// Fault shapes
// ============================================

/// A thrown error value as seen by the page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorValue {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

/// Payload of the page's global error slot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptErrorEvent {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub lineno: Option<u32>,
    #[serde(default)]
    pub colno: Option<u32>,
    #[serde(default)]
    pub error: Option<ErrorValue>,
}

/// Why a promise was rejected
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RejectionReason {
    Error(ErrorValue),
    Message(String),
    Value(serde_json::Value),
    #[default]
    Undefined,
}

/// Payload of the page's unhandled-rejection slot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectionEvent {
    #[serde(default)]
    pub reason: RejectionReason,
}

/// A sub-resource that failed to load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceErrorEvent {
    pub tag_name: String,
    /// Resolved `src` or `href`
    #[serde(default)]
    pub src: Option<String>,
}

/// A failed network request reported by the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkErrorEvent {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub status_text: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<f64>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A manually reported error
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomError {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub extra: Option<Extra>,
}

impl CustomError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Build from a Rust error, rendering its source chain as the stack.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut frames = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            frames.push(format!("    caused by: {}", cause));
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            stack: (!frames.is_empty()).then(|| frames.join("\n")),
            extra: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_extra(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.extra
            .get_or_insert_with(Extra::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_extra_map(mut self, extra: Extra) -> Self {
        self.extra.get_or_insert_with(Extra::new).extend(extra);
        self
    }
}

impl From<&str> for CustomError {
    fn from(message: &str) -> Self {
        CustomError::new(message)
    }
}

impl From<String> for CustomError {
    fn from(message: String) -> Self {
        CustomError::new(message)
    }
}

impl From<ErrorValue> for CustomError {
    fn from(error: ErrorValue) -> Self {
        let mut custom = CustomError::new(error.message);
        custom.stack = error.stack;
        if let Some(name) = error.name {
            custom = custom.with_extra("name", name);
        }
        custom
    }
}

/// Any fault signal the normalizer understands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    ScriptError(ScriptErrorEvent),
    RejectedPromise(RejectionEvent),
    ResourceError(ResourceErrorEvent),
    NetworkError(NetworkErrorEvent),
    BlankScreen(BlankCheck),
    Custom(CustomError),
}

impl Signal {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Signal::ScriptError(_) => ErrorKind::ScriptError,
            Signal::RejectedPromise(_) => ErrorKind::RejectedPromise,
            Signal::ResourceError(_) => ErrorKind::ResourceError,
            Signal::NetworkError(_) => ErrorKind::NetworkError,
            Signal::BlankScreen(_) => ErrorKind::BlankScreen,
            Signal::Custom(_) => ErrorKind::Custom,
        }
    }
}

// ============================================
// Normalization
// ============================================

/// Page metadata stamped on every record
#[derive(Debug, Clone)]
pub struct PageContext {
    pub url: String,
    pub user_agent: String,
    pub timestamp: u64,
}

/// Intermediate fields before a record is finalized
#[derive(Default)]
struct Draft {
    message: String,
    stack: Option<String>,
    filename: Option<String>,
    lineno: Option<u32>,
    colno: Option<u32>,
    extra: Option<Extra>,
}

fn extra_of(pairs: impl IntoIterator<Item = (&'static str, serde_json::Value)>) -> Option<Extra> {
    let map: Extra = pairs
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    (!map.is_empty()).then_some(map)
}

/// Convert a signal into a record.
///
/// Returns `None` for signals that are not faults, such as load errors on
/// elements that do not fetch sub-resources.
pub fn normalize(signal: Signal, ctx: &PageContext) -> Option<ErrorRecord> {
    let kind = signal.kind();
    let draft = match signal {
        Signal::ScriptError(event) => script_draft(event),
        Signal::RejectedPromise(event) => rejection_draft(event.reason),
        Signal::ResourceError(event) => resource_draft(event)?,
        Signal::NetworkError(event) => network_draft(event),
        Signal::BlankScreen(check) => blank_draft(&check),
        Signal::Custom(custom) => Draft {
            message: custom.message,
            stack: custom.stack,
            extra: custom.extra,
            ..Default::default()
        },
    };

    let message = if draft.message.trim().is_empty() {
        placeholder_message(kind).to_string()
    } else {
        draft.message
    };
    let fingerprint = compute_fingerprint(kind, &message, draft.stack.as_deref());

    Some(ErrorRecord {
        id: Uuid::new_v4(),
        message,
        stack: draft.stack,
        kind,
        timestamp: ctx.timestamp,
        url: ctx.url.clone(),
        user_agent: ctx.user_agent.clone(),
        filename: draft.filename,
        lineno: draft.lineno,
        colno: draft.colno,
        fingerprint,
        extra: draft.extra,
    })
}

fn placeholder_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::ScriptError => "Unknown script error",
        ErrorKind::RejectedPromise => "Unhandled Promise Rejection",
        ErrorKind::ResourceError => "Resource failed to load",
        ErrorKind::NetworkError => "Network request failed",
        ErrorKind::BlankScreen => "Blank screen detected",
        ErrorKind::Custom => "Unknown error",
    }
}

fn script_draft(event: ScriptErrorEvent) -> Draft {
    let (error_message, stack, name) = match event.error {
        Some(error) => (error.message, error.stack, error.name),
        None => (String::new(), None, None),
    };
    let message = if event.message.is_empty() {
        error_message
    } else {
        event.message
    };

    Draft {
        message,
        stack,
        filename: event.filename,
        lineno: event.lineno,
        colno: event.colno,
        extra: extra_of([("name", name.map(Into::into).unwrap_or_default())]),
    }
}

fn rejection_draft(reason: RejectionReason) -> Draft {
    match reason {
        RejectionReason::Error(error) => Draft {
            message: error.message,
            stack: error.stack,
            extra: extra_of([("name", error.name.map(Into::into).unwrap_or_default())]),
            ..Default::default()
        },
        RejectionReason::Message(message) => Draft {
            message,
            ..Default::default()
        },
        RejectionReason::Value(value) => Draft {
            message: match &value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            extra: extra_of([("reason", value)]),
            ..Default::default()
        },
        RejectionReason::Undefined => Draft::default(),
    }
}

fn resource_draft(event: ResourceErrorEvent) -> Option<Draft> {
    let tag = event.tag_name.to_ascii_lowercase();
    if !RESOURCE_TAGS.contains(&tag.as_str()) {
        return None;
    }
    let source = event.src.clone().unwrap_or_else(|| "unknown source".to_string());

    Some(Draft {
        message: format!("Failed to load {}: {}", tag, source),
        filename: event.src.clone(),
        extra: extra_of([
            ("tagName", tag.into()),
            ("src", event.src.map(Into::into).unwrap_or_default()),
        ]),
        ..Default::default()
    })
}

fn network_draft(event: NetworkErrorEvent) -> Draft {
    let method = event.method.to_ascii_uppercase();
    let message = match (event.status, &event.status_text) {
        (Some(status), Some(text)) if !text.is_empty() => {
            format!("{} {} failed: {} {}", method, event.url, status, text)
        }
        (Some(status), _) => format!("{} {} failed: {}", method, event.url, status),
        (None, _) => format!("{} {} failed", method, event.url),
    };

    Draft {
        message,
        filename: Some(event.url.clone()),
        extra: extra_of([
            ("method", method.into()),
            ("status", event.status.map(Into::into).unwrap_or_default()),
            (
                "statusText",
                event.status_text.map(Into::into).unwrap_or_default(),
            ),
            (
                "duration",
                event.duration_ms.map(Into::into).unwrap_or_default(),
            ),
        ]),
        ..Default::default()
    }
}

fn blank_draft(check: &BlankCheck) -> Draft {
    let extra = match serde_json::to_value(check) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    };
    Draft {
        message: format!(
            "Blank screen detected: {}/{} sample points empty",
            check.blank_points, check.sample_count
        ),
        extra,
        ..Default::default()
    }
}

/// Content hash used to group identical faults
///
/// Returns a 32-character hex digest of SHA-256(kind + message + first stack frame)
pub fn compute_fingerprint(kind: ErrorKind, message: &str, stack: Option<&str>) -> String {
    let top_frame = stack
        .and_then(|s| s.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or_default();
    let hash_input = format!("{}:{}:{}", kind, message, top_frame);

    let mut hasher = Sha256::new();
    hasher.update(hash_input.as_bytes());
    let result = hasher.finalize();

    // Take first 16 bytes (32 hex chars)
    hex::encode(&result[..16])
}

// ============================================
// Capture queue
// ============================================

#[derive(Debug)]
struct CaptureQueue {
    capacity: usize,
    records: VecDeque<ErrorRecord>,
    total: usize,
    last_timestamp: u64,
}

/// Filters records and retains the most recent ones.
///
/// The queue lock is never held while user callbacks run, so a callback may
/// capture again without deadlocking.
pub struct Capturer {
    queue: Mutex<CaptureQueue>,
    filter: Option<ErrorFilter>,
    on_error: Option<ErrorCallback>,
}

impl Capturer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(CaptureQueue {
                capacity: capacity.max(1),
                records: VecDeque::with_capacity(capacity.min(1024)),
                total: 0,
                last_timestamp: 0,
            }),
            filter: None,
            on_error: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<ErrorFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_callback(mut self, on_error: Option<ErrorCallback>) -> Self {
        self.on_error = on_error;
        self
    }

    /// Change capacity, evicting the oldest records if it shrinks.
    pub fn set_capacity(&self, capacity: usize) {
        let mut queue = self.queue.lock();
        queue.capacity = capacity.max(1);
        while queue.records.len() > queue.capacity {
            queue.records.pop_front();
        }
    }

    /// Normalize and admit a signal. Returns the accepted record.
    pub fn capture(&self, signal: Signal, ctx: &PageContext) -> Option<ErrorRecord> {
        let record = normalize(signal, ctx)?;
        self.accept(record)
    }

    /// Filter a record and admit it to the queue.
    ///
    /// Rejected records leave no trace. A panicking filter rejects.
    pub fn accept(&self, mut record: ErrorRecord) -> Option<ErrorRecord> {
        if let Some(filter) = &self.filter {
            let keep = contain_panic("error filter", || filter(&record)).unwrap_or(false);
            if !keep {
                tracing::trace!(kind = %record.kind, "Record rejected by filter");
                return None;
            }
        }

        {
            let mut queue = self.queue.lock();
            record.timestamp = record.timestamp.max(queue.last_timestamp);
            queue.last_timestamp = record.timestamp;

            if queue.records.len() >= queue.capacity {
                if let Some(evicted) = queue.records.pop_front() {
                    tracing::trace!(id = %evicted.id, "Evicted oldest record");
                }
            }
            queue.records.push_back(record.clone());
            queue.total += 1;
        }

        tracing::debug!(kind = %record.kind, message = %record.message, "Captured error");

        if let Some(on_error) = &self.on_error {
            contain_panic("error callback", || on_error(&record));
        }
        Some(record)
    }

    /// Records currently retained, oldest first
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.queue.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().records.is_empty()
    }

    /// Records accepted since creation, including evicted ones
    pub fn total(&self) -> usize {
        self.queue.lock().total
    }

    pub fn clear(&self) {
        self.queue.lock().records.clear();
    }
}
