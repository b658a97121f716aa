//! # pagewatch-core
//!
//! Core library for pagewatch - client-side fault and rendering telemetry for a
//! single page.
//!
//! This library provides:
//! - Normalization of script errors, rejected promises, resource and network
//!   failures and manual reports into one record shape
//! - A debounced, single-flight delivery queue with retries
//! - Frame-timing sampling with smoothness and scroll-session scoring
//! - Blank-viewport detection by random point sampling
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Signals flow one way:
//! - **Hooks:** the host dispatches faults into [`HostHooks`] slots
//! - **Capture:** each signal becomes an [`ErrorRecord`] in a bounded queue
//! - **Delivery:** accepted records are batched and posted to a collector
//!
//! The frame sampler and blank-viewport classifier run alongside and feed the
//! same capture path. [`Monitor`] wires all of it to one page.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pagewatch_core::{Config, Monitor};
//!
//! # async fn run() -> pagewatch_core::Result<()> {
//! let monitor = Monitor::new(Config::load()?)?;
//! monitor.start()?;
//!
//! monitor.capture_message("payment form failed to render");
//! monitor.report_now().await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use capture::{CustomError, Signal};
pub use config::{Config, ConfigPatch};
pub use error::{Error, Result};
pub use hooks::{HookRegistration, HostHooks};
pub use host::{Clock, FrameSource, Page, StaticPage};
pub use monitor::{Monitor, MonitorBuilder};
pub use reporter::{FlushOutcome, Reporter};
pub use transport::{HttpTransport, Transport};
pub use types::*;

// Public modules
pub mod blank;
pub mod capture;
pub mod config;
pub mod error;
pub mod hooks;
pub mod host;
pub mod logging;
pub mod monitor;
pub mod reporter;
pub mod sampler;
pub mod transport;
pub mod types;
