//! Interfaces supplied by the hosting page
//!
//! The pipeline never talks to a page directly. Everything it consumes from its
//! host (clock, page metadata, viewport geometry, point-based element lookup,
//! frame callbacks) comes through the traits in this module, so the same core
//! runs against a real page binding, the CLI replay harness, or a test double.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::types::VSYNC_INTERVAL_MS;

// ============================================
// Clock
// ============================================

/// Time source for frame timing and record timestamps.
pub trait Clock: Send + Sync {
    /// High-resolution monotonic milliseconds since an arbitrary origin.
    fn now(&self) -> f64;

    /// Wall-clock milliseconds since the Unix epoch.
    fn timestamp_ms(&self) -> u64;
}

/// Clock anchored to the wall clock at construction and advanced by a
/// monotonic instant, so timestamps never go backwards.
///
/// Uses tokio's `Instant`, which follows paused time in tests.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
    origin_epoch_ms: u64,
}

impl SystemClock {
    pub fn new() -> Self {
        let origin_epoch_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self {
            origin: Instant::now(),
            origin_epoch_ms,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }

    fn timestamp_ms(&self) -> u64 {
        self.origin_epoch_ms + self.origin.elapsed().as_millis() as u64
    }
}

// ============================================
// Page
// ============================================

/// Visible viewport geometry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub scroll_x: f64,
    #[serde(default)]
    pub scroll_y: f64,
    #[serde(default = "default_pixel_ratio")]
    pub device_pixel_ratio: f64,
}

fn default_pixel_ratio() -> f64 {
    1.0
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 0.0,
            height: 0.0,
            scroll_x: 0.0,
            scroll_y: 0.0,
            device_pixel_ratio: 1.0,
        }
    }
}

/// Computed rendering facts about the top-most element at a point
#[derive(Debug, Clone, PartialEq)]
pub struct ElementInfo {
    /// Lowercase tag name (`html`, `body`, `div`, ...)
    pub tag_name: String,
    /// Computed `background-color`
    pub background_color: String,
    /// Computed `background-image`, `None` for `none`
    pub background_image: Option<String>,
    pub width: f64,
    pub height: f64,
    /// Computed `display`
    pub display: String,
    /// Computed `visibility`
    pub visibility: String,
    pub opacity: f64,
}

impl ElementInfo {
    /// A visible element of the given tag and size with default styling.
    pub fn visible(tag_name: &str, width: f64, height: f64) -> Self {
        Self {
            tag_name: tag_name.to_ascii_lowercase(),
            background_color: "rgba(0, 0, 0, 0)".to_string(),
            background_image: None,
            width,
            height,
            display: "block".to_string(),
            visibility: "visible".to_string(),
            opacity: 1.0,
        }
    }

    /// Whether this is the outermost page container.
    pub fn is_page_root(&self) -> bool {
        self.tag_name.eq_ignore_ascii_case("html") || self.tag_name.eq_ignore_ascii_case("body")
    }

    /// Not displayed, not visible, or fully transparent.
    pub fn is_hidden(&self) -> bool {
        self.display == "none" || self.visibility == "hidden" || self.opacity <= 0.0
    }
}

/// The page being monitored.
#[async_trait]
pub trait Page: Send + Sync {
    /// Current document URL
    fn url(&self) -> String;

    fn user_agent(&self) -> String;

    /// Resolves once the document has finished loading.
    async fn ready(&self) {}

    fn viewport(&self) -> Viewport {
        Viewport::default()
    }

    /// Top-most rendered element at a viewport coordinate.
    fn element_at(&self, _x: f64, _y: f64) -> Option<ElementInfo> {
        None
    }
}

/// A page with fixed metadata and no rendered content.
#[derive(Debug, Clone)]
pub struct StaticPage {
    pub url: String,
    pub user_agent: String,
    pub viewport: Viewport,
}

impl StaticPage {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for StaticPage {
    fn default() -> Self {
        Self {
            url: "about:blank".to_string(),
            user_agent: format!("pagewatch/{}", env!("CARGO_PKG_VERSION")),
            viewport: Viewport::default(),
        }
    }
}

#[async_trait]
impl Page for StaticPage {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }
}

// ============================================
// Frame source
// ============================================

/// Animation-frame primitive: resolves at the next frame with its timestamp.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn next_frame(&self) -> f64;

    /// Start a new frame chain; the next frame is its first.
    fn restart(&self) {}
}

/// Frame source for hosts without native frame callbacks: a 60 Hz tokio
/// interval stamped with the given clock.
pub struct IntervalFrameSource {
    clock: Arc<dyn Clock>,
    period: Duration,
    chain: AtomicU64,
    interval: tokio::sync::Mutex<Option<(u64, Interval)>>,
}

impl IntervalFrameSource {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_period(clock, Duration::from_secs_f64(VSYNC_INTERVAL_MS / 1000.0))
    }

    pub fn with_period(clock: Arc<dyn Clock>, period: Duration) -> Self {
        Self {
            clock,
            period,
            chain: AtomicU64::new(0),
            interval: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl FrameSource for IntervalFrameSource {
    async fn next_frame(&self) -> f64 {
        let mut guard = self.interval.lock().await;
        let chain = self.chain.load(Ordering::SeqCst);
        if guard.as_ref().map(|(current, _)| *current) != Some(chain) {
            let mut interval = tokio::time::interval(self.period);
            // A stalled loop shows up as one long frame, like a blocked main thread.
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            *guard = Some((chain, interval));
        }
        if let Some((_, interval)) = guard.as_mut() {
            interval.tick().await;
        }
        self.clock.now()
    }

    fn restart(&self) {
        self.chain.fetch_add(1, Ordering::SeqCst);
    }
}
