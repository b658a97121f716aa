//! The monitor: wires capture, delivery, frame sampling and blank-viewport
//! detection to one page.
//!
//! ```rust,no_run
//! use pagewatch_core::{Config, Monitor};
//!
//! # async fn run() -> pagewatch_core::Result<()> {
//! let monitor = Monitor::builder().config(Config::load()?).build()?;
//! monitor.start()?;
//! monitor.capture_message("checkout button unresponsive");
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::blank::{spawn_watch, BlankCheck, BlankScreenClassifier};
use crate::capture::{Capturer, CustomError, ErrorCallback, ErrorFilter, PageContext, Signal};
use crate::config::{Config, ConfigPatch};
use crate::error::{contain_panic, Error, Result};
use crate::hooks::{HookRegistration, HostHooks, SignalSink};
use crate::host::{Clock, FrameSource, IntervalFrameSource, Page, StaticPage, SystemClock};
use crate::reporter::{FlushOutcome, Reporter};
use crate::sampler::{
    FrameSampler, PerformanceCallback, SamplerContext, SamplerDriver, ScrollCallback,
};
use crate::transport::{HttpTransport, Transport};
use crate::types::{ErrorRecord, Extra, MonitorStats, PerformanceSnapshot, ScrollSession};

/// Builder for [`Monitor`]
#[derive(Default)]
pub struct MonitorBuilder {
    config: Config,
    filter: Option<ErrorFilter>,
    on_error: Option<ErrorCallback>,
    on_performance_data: Option<PerformanceCallback>,
    on_scroll_session: Option<ScrollCallback>,
    transport: Option<Arc<dyn Transport>>,
    page: Option<Arc<dyn Page>>,
    hooks: Option<Arc<HostHooks>>,
    clock: Option<Arc<dyn Clock>>,
    frame_source: Option<Arc<dyn FrameSource>>,
    rng_seed: Option<u64>,
}

impl MonitorBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Records for which the predicate returns `false` are dropped.
    pub fn filter(
        mut self,
        filter: impl Fn(&ErrorRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&ErrorRecord) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_performance_data(
        mut self,
        callback: impl Fn(&PerformanceSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.on_performance_data = Some(Arc::new(callback));
        self
    }

    pub fn on_scroll_session(
        mut self,
        callback: impl Fn(&ScrollSession) + Send + Sync + 'static,
    ) -> Self {
        self.on_scroll_session = Some(Arc::new(callback));
        self
    }

    /// Replace the HTTP transport. Only used when an endpoint is configured.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn page(mut self, page: Arc<dyn Page>) -> Self {
        self.page = Some(page);
        self
    }

    pub fn hooks(mut self, hooks: Arc<HostHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn frame_source(mut self, frame_source: Arc<dyn FrameSource>) -> Self {
        self.frame_source = Some(frame_source);
        self
    }

    /// Seed blank-viewport sampling for reproducible runs.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<Monitor> {
        let config = self.config;
        config.validate()?;

        let reporter = build_reporter(&config, self.transport.as_ref())?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let frame_source = self.frame_source.unwrap_or_else(|| {
            Arc::new(IntervalFrameSource::new(clock.clone())) as Arc<dyn FrameSource>
        });
        let classifier = match self.rng_seed {
            Some(seed) => BlankScreenClassifier::with_seed(config.blank_screen.clone(), seed),
            None => BlankScreenClassifier::new(config.blank_screen.clone()),
        };

        tracing::debug!(
            delivery = reporter.is_some(),
            blank_screen = config.blank_screen.enabled,
            frame_sampler = config.frame_sampler.enabled,
            "Monitor built"
        );

        Ok(Monitor {
            inner: Arc::new(Inner {
                capturer: Capturer::new(config.max_queue_size)
                    .with_filter(self.filter)
                    .with_callback(self.on_error),
                sampler: Arc::new(Mutex::new(FrameSampler::from_config(&config.frame_sampler))),
                classifier: Arc::new(Mutex::new(classifier)),
                config: Mutex::new(config),
                reporter: Mutex::new(reporter),
                transport_override: self.transport,
                page: self
                    .page
                    .unwrap_or_else(|| Arc::new(StaticPage::default()) as Arc<dyn Page>),
                hooks: self.hooks.unwrap_or_else(HostHooks::new),
                clock,
                frame_source,
                on_performance_data: self.on_performance_data,
                on_scroll_session: self.on_scroll_session,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        })
    }
}

/// A reporter exists exactly when an endpoint is configured.
fn build_reporter(
    config: &Config,
    transport: Option<&Arc<dyn Transport>>,
) -> Result<Option<Reporter>> {
    if !config.delivery.is_ready() {
        return Ok(None);
    }
    let reporter = match transport {
        Some(transport) => Reporter::new(
            config.delivery.clone(),
            config.max_queue_size,
            transport.clone(),
        ),
        None => Reporter::with_http(config.delivery.clone(), config.max_queue_size)?,
    };
    Ok(Some(reporter))
}

/// Installed hooks and running background work
#[derive(Default)]
struct Lifecycle {
    running: bool,
    registration: Option<HookRegistration>,
    sampler: Option<SamplerDriver>,
    blank_watch: Option<JoinHandle<()>>,
    auto_report: Option<JoinHandle<()>>,
}

impl Lifecycle {
    fn stop_blank_watch(&mut self) {
        if let Some(task) = self.blank_watch.take() {
            task.abort();
        }
    }

    fn stop_auto_report(&mut self) {
        if let Some(task) = self.auto_report.take() {
            task.abort();
        }
    }

    fn teardown(&mut self) {
        self.running = false;
        if let Some(registration) = self.registration.take() {
            registration.uninstall();
        }
        if let Some(driver) = self.sampler.take() {
            driver.stop();
        }
        self.stop_blank_watch();
        self.stop_auto_report();
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct Inner {
    config: Mutex<Config>,
    capturer: Capturer,
    reporter: Mutex<Option<Reporter>>,
    transport_override: Option<Arc<dyn Transport>>,
    page: Arc<dyn Page>,
    hooks: Arc<HostHooks>,
    clock: Arc<dyn Clock>,
    frame_source: Arc<dyn FrameSource>,
    classifier: Arc<Mutex<BlankScreenClassifier>>,
    sampler: Arc<Mutex<FrameSampler>>,
    on_performance_data: Option<PerformanceCallback>,
    on_scroll_session: Option<ScrollCallback>,
    lifecycle: Mutex<Lifecycle>,
}

impl Inner {
    fn page_context(&self) -> PageContext {
        PageContext {
            url: self.page.url(),
            user_agent: self.page.user_agent(),
            timestamp: self.clock.timestamp_ms(),
        }
    }

    fn reporter(&self) -> Option<Reporter> {
        self.reporter.lock().clone()
    }

    /// Normalize, queue and forward one signal. Never panics into the caller.
    fn ingest(&self, signal: Signal) -> Option<ErrorRecord> {
        contain_panic("signal processing", || {
            let record = self.capturer.capture(signal, &self.page_context())?;
            if let Some(reporter) = self.reporter() {
                reporter.enqueue([record.clone()]);
            }
            Some(record)
        })
        .flatten()
    }

    /// Route a serializable measurement through capture as a custom record.
    fn report_measurement(&self, message: &str, value: &impl serde::Serialize) {
        let extra: Extra = match serde_json::to_value(value) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Extra::new(),
        };
        self.ingest(Signal::Custom(
            CustomError::new(message).with_extra_map(extra),
        ));
    }

    fn auto_report_enabled(&self) -> bool {
        self.config.lock().frame_sampler.auto_report
    }
}

/// Client-side telemetry monitor for one page. Cheap to clone.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Inner>,
}

impl Monitor {
    pub fn builder() -> MonitorBuilder {
        MonitorBuilder::default()
    }

    /// Monitor with the given configuration and default collaborators.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Install hooks and start enabled subsystems.
    ///
    /// Must be called inside a tokio runtime. Calling it again while running
    /// does nothing.
    pub fn start(&self) -> Result<()> {
        if Handle::try_current().is_err() {
            return Err(Error::Config(
                "Monitor::start must be called inside a tokio runtime".to_string(),
            ));
        }

        let config = self.inner.config.lock().clone();
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.running {
            tracing::info!("Monitor already started");
            return Ok(());
        }
        lifecycle.running = true;
        self.reconcile(&mut lifecycle, &config, None);

        tracing::info!(url = %self.inner.page.url(), "Monitor started");
        Ok(())
    }

    /// Restore hooks and cancel all background work.
    pub fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if !lifecycle.running {
            return;
        }
        lifecycle.teardown();
        if let Some(reporter) = self.inner.reporter() {
            reporter.cancel_timer();
        }
        tracing::info!("Monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().running
    }

    /// Bring each subsystem in line with `config`. `previous` is the config
    /// the running subsystems were started with, if any.
    fn reconcile(&self, lifecycle: &mut Lifecycle, config: &Config, previous: Option<&Config>) {
        if !lifecycle.running {
            return;
        }

        match (config.auto_capture, lifecycle.registration.is_some()) {
            (true, false) => {
                lifecycle.registration = Some(HookRegistration::install(
                    self.inner.hooks.clone(),
                    self.signal_sink(),
                ));
            }
            (false, true) => {
                if let Some(registration) = lifecycle.registration.take() {
                    registration.uninstall();
                }
            }
            _ => {}
        }

        let sampler_changed =
            previous.map_or(false, |p| p.frame_sampler != config.frame_sampler);
        if lifecycle.sampler.is_some() && (!config.frame_sampler.enabled || sampler_changed) {
            if let Some(driver) = lifecycle.sampler.take() {
                driver.stop();
            }
            if !config.frame_sampler.enabled {
                self.inner.sampler.lock().reset();
            }
        }
        if config.frame_sampler.enabled && lifecycle.sampler.is_none() {
            lifecycle.sampler = Some(self.start_sampler(config));
        }

        let wants_auto_report = config.frame_sampler.enabled && config.frame_sampler.auto_report;
        let report_changed = previous.map_or(false, |p| {
            p.frame_sampler.report_interval_ms != config.frame_sampler.report_interval_ms
        });
        if !wants_auto_report || report_changed {
            lifecycle.stop_auto_report();
        }
        if wants_auto_report && lifecycle.auto_report.is_none() {
            lifecycle.auto_report = Some(self.spawn_auto_report(Duration::from_millis(
                config.frame_sampler.report_interval_ms,
            )));
        }

        let blank_enabled_now = previous.map_or(false, |p| !p.blank_screen.enabled);
        if !config.blank_screen.enabled {
            lifecycle.stop_blank_watch();
        } else if lifecycle.blank_watch.is_none() || blank_enabled_now {
            lifecycle.stop_blank_watch();
            lifecycle.blank_watch = Some(self.spawn_blank_watch());
        }
    }

    fn signal_sink(&self) -> SignalSink {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |signal: Signal| {
            if let Some(inner) = weak.upgrade() {
                inner.ingest(signal);
            }
        })
    }

    fn start_sampler(&self, config: &Config) -> SamplerDriver {
        let weak = Arc::downgrade(&self.inner);
        let user_callback = self.inner.on_scroll_session.clone();
        let on_scroll: ScrollCallback = Arc::new(move |session: &ScrollSession| {
            if let Some(callback) = &user_callback {
                contain_panic("scroll session callback", || callback(session));
            }
            if let Some(inner) = weak.upgrade() {
                if inner.auto_report_enabled() {
                    inner.report_measurement("Scroll session", session);
                }
            }
        });

        {
            let mut sampler = self.inner.sampler.lock();
            sampler.set_thresholds(
                config.frame_sampler.long_frame_threshold,
                config.frame_sampler.severe_frame_threshold,
            );
        }

        SamplerDriver::start(
            self.inner.sampler.clone(),
            &config.frame_sampler,
            SamplerContext {
                clock: self.inner.clock.clone(),
                frame_source: self.inner.frame_source.clone(),
                hooks: self.inner.hooks.clone(),
                on_performance: self.inner.on_performance_data.clone(),
                on_scroll: Some(on_scroll),
            },
        )
    }

    fn spawn_auto_report(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let snapshot = inner.sampler.lock().snapshot(inner.clock.now());
                inner.report_measurement("Performance snapshot", &snapshot);
            }
        })
    }

    fn spawn_blank_watch(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        spawn_watch(
            self.inner.classifier.clone(),
            self.inner.page.clone(),
            Arc::new(move |check: BlankCheck| {
                if let Some(inner) = weak.upgrade() {
                    inner.ingest(Signal::BlankScreen(check));
                }
            }),
        )
    }

    /// Capture any signal as if the host had raised it.
    pub fn capture(&self, signal: Signal) -> Option<ErrorRecord> {
        self.inner.ingest(signal)
    }

    /// Manually report an error.
    pub fn capture_error(&self, error: impl Into<CustomError>) -> Option<ErrorRecord> {
        self.inner.ingest(Signal::Custom(error.into()))
    }

    pub fn capture_message(&self, message: &str) -> Option<ErrorRecord> {
        self.capture_error(message)
    }

    /// Flush pending records immediately, bypassing the quiet period.
    pub async fn report_now(&self) -> Result<FlushOutcome> {
        let reporter = self
            .inner
            .reporter()
            .ok_or_else(|| Error::Config("delivery.endpoint is not configured".to_string()))?;
        reporter.cancel_timer();
        Ok(reporter.flush().await)
    }

    /// Classify the viewport now. A blank result is also captured.
    pub fn check_blank_screen(&self) -> bool {
        let check = self.inner.classifier.lock().classify(self.inner.page.as_ref());
        let is_blank = check.is_blank;
        if is_blank {
            self.inner.ingest(Signal::BlankScreen(check));
        }
        is_blank
    }

    /// Current frame metrics, while the frame sampler is running.
    pub fn performance_snapshot(&self) -> Option<PerformanceSnapshot> {
        if self.inner.lifecycle.lock().sampler.is_none() {
            return None;
        }
        let now = self.inner.clock.now();
        Some(self.inner.sampler.lock().snapshot(now))
    }

    /// Records retained in the capture queue, oldest first
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.inner.capturer.records()
    }

    pub fn clear_errors(&self) {
        self.inner.capturer.clear();
    }

    pub fn stats(&self) -> MonitorStats {
        let delivery = self.inner.reporter();
        let delivery_stats = delivery.as_ref().map(|r| r.stats()).unwrap_or_default();
        MonitorStats {
            total_errors: self.inner.capturer.total(),
            queue_size: self.inner.capturer.len(),
            pending_reports: delivery.as_ref().map_or(0, |r| r.pending_count()),
            delivered: delivery_stats.delivered,
            failed_batches: delivery_stats.failed_batches,
            is_running: self.is_running(),
        }
    }

    pub fn config(&self) -> Config {
        self.inner.config.lock().clone()
    }

    pub fn hooks(&self) -> &Arc<HostHooks> {
        &self.inner.hooks
    }

    /// Apply a partial configuration update.
    ///
    /// Invalid results are rejected and leave the current configuration in
    /// place. While running, subsystems are started or stopped to match.
    pub fn update_config(&self, patch: ConfigPatch) -> Result<()> {
        let previous = self.inner.config.lock().clone();
        let mut next = previous.clone();
        next.apply(patch);
        next.validate()?;

        if next.delivery != previous.delivery || next.max_queue_size != previous.max_queue_size {
            self.update_reporter(&next, &previous)?;
        }

        self.inner.capturer.set_capacity(next.max_queue_size);
        self.inner
            .classifier
            .lock()
            .set_config(next.blank_screen.clone());
        *self.inner.config.lock() = next.clone();

        let mut lifecycle = self.inner.lifecycle.lock();
        self.reconcile(&mut lifecycle, &next, Some(&previous));

        tracing::debug!("Configuration updated");
        Ok(())
    }

    fn update_reporter(&self, next: &Config, previous: &Config) -> Result<()> {
        let mut slot = self.inner.reporter.lock();
        match slot.as_ref() {
            Some(reporter) => {
                if self.inner.transport_override.is_none() && next.delivery != previous.delivery {
                    reporter.set_transport(Arc::new(HttpTransport::new(&next.delivery)?));
                }
                reporter.update(next.delivery.clone(), next.max_queue_size);
            }
            None => {
                *slot = build_reporter(next, self.inner.transport_override.as_ref())?;
            }
        }
        Ok(())
    }
}
