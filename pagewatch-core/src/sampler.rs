//! Frame sampling
//!
//! [`FrameSampler`] is the pure state: a ring of classified frame samples, a
//! ring of periodic fps readings, and at most one open scroll session.
//! [`SamplerDriver`] feeds it from three independent tokio tasks: the frame
//! loop, the periodic fps timer, and the scroll-idle timer.
//!
//! ## Smoothness score
//!
//! ```text
//! score = 100 - (50 - min(avg_fps / 60, 1) * 50) - long_ratio * 30 - severe_ratio * 50
//! ```
//!
//! clamped to 0..=100 and rounded. An empty ring scores 100.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::FrameSamplerConfig;
use crate::error::contain_panic;
use crate::hooks::{HostHooks, ListenerId, ScrollEvent};
use crate::host::{Clock, FrameSource};
use crate::types::{FrameSample, PerformanceSnapshot, ScrollSession};

/// Frame samples retained
pub const MAX_FRAME_SAMPLES: usize = 1000;

/// Periodic fps readings retained
pub const MAX_FPS_HISTORY: usize = 60;

/// Quiet time after the last scroll signal that ends a session
pub const SCROLL_IDLE_TIMEOUT: Duration = Duration::from_millis(150);

/// Receives each periodic snapshot
pub type PerformanceCallback = Arc<dyn Fn(&PerformanceSnapshot) + Send + Sync>;

/// Receives each finished scroll session
pub type ScrollCallback = Arc<dyn Fn(&ScrollSession) + Send + Sync>;

#[derive(Debug)]
struct OpenScroll {
    start_time: f64,
    start_offset: f64,
    last_offset: f64,
    samples: Vec<FrameSample>,
}

/// Frame timing state
#[derive(Debug)]
pub struct FrameSampler {
    long_threshold: f64,
    severe_threshold: f64,
    frames: VecDeque<FrameSample>,
    fps_history: VecDeque<f64>,
    next_id: u64,
    started_at: Option<f64>,
    last_frame: Option<f64>,
    last_tick: Option<f64>,
    frames_since_tick: u32,
    current_fps: f64,
    scroll: Option<OpenScroll>,
}

impl FrameSampler {
    pub fn new(long_threshold: f64, severe_threshold: f64) -> Self {
        Self {
            long_threshold,
            severe_threshold,
            frames: VecDeque::with_capacity(MAX_FRAME_SAMPLES),
            fps_history: VecDeque::with_capacity(MAX_FPS_HISTORY),
            next_id: 0,
            started_at: None,
            last_frame: None,
            last_tick: None,
            frames_since_tick: 0,
            current_fps: 0.0,
            scroll: None,
        }
    }

    pub fn from_config(config: &FrameSamplerConfig) -> Self {
        Self::new(config.long_frame_threshold, config.severe_frame_threshold)
    }

    /// New thresholds apply to frames recorded from now on.
    pub fn set_thresholds(&mut self, long_threshold: f64, severe_threshold: f64) {
        self.long_threshold = long_threshold;
        self.severe_threshold = severe_threshold;
    }

    /// Clear rings, counters and any open scroll session.
    pub fn reset(&mut self) {
        *self = Self::new(self.long_threshold, self.severe_threshold);
    }

    /// Record a frame callback at `timestamp`.
    ///
    /// The first callback only anchors timing and yields no sample.
    pub fn record_frame(&mut self, timestamp: f64) -> Option<FrameSample> {
        let Some(previous) = self.last_frame.replace(timestamp) else {
            self.started_at.get_or_insert(timestamp);
            self.last_tick.get_or_insert(timestamp);
            return None;
        };

        let duration = (timestamp - previous).max(0.0);
        let sample = FrameSample::classify(
            self.next_id,
            duration,
            timestamp,
            self.long_threshold,
            self.severe_threshold,
        );
        self.next_id += 1;

        if self.frames.len() >= MAX_FRAME_SAMPLES {
            self.frames.pop_front();
        }
        self.frames.push_back(sample);
        self.frames_since_tick += 1;

        if let Some(scroll) = self.scroll.as_mut() {
            scroll.samples.push(sample);
        }

        Some(sample)
    }

    fn tick_origin(&self, now: f64) -> f64 {
        self.last_tick.unwrap_or(now)
    }

    /// Periodic fps reading: frames since the previous tick over elapsed time.
    pub fn tick(&mut self, now: f64) -> f64 {
        let elapsed = now - self.tick_origin(now);
        if elapsed <= 0.0 {
            return self.current_fps;
        }

        let fps = self.frames_since_tick as f64 / elapsed * 1000.0;
        if self.fps_history.len() >= MAX_FPS_HISTORY {
            self.fps_history.pop_front();
        }
        self.fps_history.push_back(fps);
        self.current_fps = fps;
        self.frames_since_tick = 0;
        self.last_tick = Some(now);
        fps
    }

    /// Fps since the last periodic tick, without touching its bookkeeping.
    ///
    /// Falls back to the last periodic reading when no time has elapsed.
    pub fn instantaneous_fps(&self, now: f64) -> f64 {
        let elapsed = now - self.tick_origin(now);
        if elapsed <= 0.0 {
            return self.current_fps;
        }
        self.frames_since_tick as f64 / elapsed * 1000.0
    }

    /// Mean of the fps history, or the rate implied by the mean frame
    /// duration before the first periodic tick.
    pub fn avg_fps(&self) -> f64 {
        if !self.fps_history.is_empty() {
            return self.fps_history.iter().sum::<f64>() / self.fps_history.len() as f64;
        }
        if self.frames.is_empty() {
            return 0.0;
        }
        let mean = self.frames.iter().map(|f| f.duration).sum::<f64>() / self.frames.len() as f64;
        if mean > 0.0 {
            1000.0 / mean
        } else {
            0.0
        }
    }

    pub fn smoothness_score(&self) -> u32 {
        let total = self.frames.len();
        if total == 0 {
            return 100;
        }

        let long_ratio = self.frames.iter().filter(|f| f.is_long).count() as f64 / total as f64;
        let severe_ratio =
            self.frames.iter().filter(|f| f.is_severe).count() as f64 / total as f64;
        let fps_factor = (self.avg_fps() / 60.0).min(1.0);

        let score = 100.0 - (50.0 - fps_factor * 50.0) - long_ratio * 30.0 - severe_ratio * 50.0;
        score.clamp(0.0, 100.0).round() as u32
    }

    pub fn snapshot(&self, now: f64) -> PerformanceSnapshot {
        let avg_fps = self.avg_fps();
        let (min_fps, max_fps) = if self.fps_history.is_empty() {
            (avg_fps, avg_fps)
        } else {
            self.fps_history
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &fps| {
                    (lo.min(fps), hi.max(fps))
                })
        };

        PerformanceSnapshot {
            current_fps: self.instantaneous_fps(now),
            avg_fps,
            min_fps,
            max_fps,
            total_frames: self.frames.len(),
            long_frames: self.frames.iter().filter(|f| f.is_long).count(),
            severe_frames: self.frames.iter().filter(|f| f.is_severe).count(),
            dropped_frames: self.frames.iter().filter(|f| f.is_dropped).count(),
            smoothness_score: self.smoothness_score(),
            duration: self.started_at.map(|start| now - start).unwrap_or(0.0),
            timestamp: now,
        }
    }

    pub fn frames(&self) -> impl Iterator<Item = &FrameSample> {
        self.frames.iter()
    }

    pub fn is_scrolling(&self) -> bool {
        self.scroll.is_some()
    }

    /// Note a scroll position change. Returns `true` when it opened a session.
    pub fn scroll_signal(&mut self, now: f64, offset: f64) -> bool {
        match self.scroll.as_mut() {
            Some(scroll) => {
                scroll.last_offset = offset;
                false
            }
            None => {
                self.scroll = Some(OpenScroll {
                    start_time: now,
                    start_offset: offset,
                    last_offset: offset,
                    samples: Vec::new(),
                });
                true
            }
        }
    }

    /// Close the open scroll session and compute its metrics.
    pub fn end_scroll(&mut self, now: f64) -> Option<ScrollSession> {
        let scroll = self.scroll.take()?;
        let frame_count = scroll.samples.len();

        let (avg_fps, min_fps, dropped_frames, dropped_ratio) = if frame_count == 0 {
            (0.0, 0.0, 0, 0.0)
        } else {
            let mean =
                scroll.samples.iter().map(|s| s.duration).sum::<f64>() / frame_count as f64;
            let max = scroll
                .samples
                .iter()
                .map(|s| s.duration)
                .fold(0.0_f64, f64::max);
            let dropped = scroll.samples.iter().filter(|s| s.is_dropped).count();
            (
                if mean > 0.0 { 1000.0 / mean } else { 0.0 },
                if max > 0.0 { 1000.0 / max } else { 0.0 },
                dropped,
                dropped as f64 / frame_count as f64,
            )
        };

        let score = (100.0 * (1.0 - dropped_ratio)).round().max(0.0) as u32;

        Some(ScrollSession {
            start_time: scroll.start_time,
            end_time: now,
            duration: now - scroll.start_time,
            start_offset: scroll.start_offset,
            end_offset: scroll.last_offset,
            distance: (scroll.last_offset - scroll.start_offset).abs(),
            frame_count,
            avg_fps,
            min_fps,
            dropped_frames,
            dropped_ratio,
            score,
        })
    }

    /// Drop the open scroll session without reporting it.
    pub fn cancel_scroll(&mut self) {
        self.scroll = None;
    }

    /// End the current frame chain. Rings and history are kept; the next
    /// frame only re-anchors timing.
    pub fn detach(&mut self) {
        self.last_frame = None;
        self.last_tick = None;
        self.frames_since_tick = 0;
        self.cancel_scroll();
    }
}

// ============================================
// Driver
// ============================================

#[derive(Default)]
struct IdleTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl IdleTimer {
    fn cancel(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Collaborators a driver runs against
#[derive(Clone)]
pub struct SamplerContext {
    pub clock: Arc<dyn Clock>,
    pub frame_source: Arc<dyn FrameSource>,
    pub hooks: Arc<HostHooks>,
    pub on_performance: Option<PerformanceCallback>,
    pub on_scroll: Option<ScrollCallback>,
}

/// Running frame loop, fps timer and scroll listener.
///
/// Must be started inside a tokio runtime. Dropping the driver stops it.
pub struct SamplerDriver {
    sampler: Arc<Mutex<FrameSampler>>,
    hooks: Arc<HostHooks>,
    tasks: Vec<JoinHandle<()>>,
    scroll_listener: Option<ListenerId>,
    idle: Arc<Mutex<IdleTimer>>,
}

impl SamplerDriver {
    pub fn start(
        sampler: Arc<Mutex<FrameSampler>>,
        config: &FrameSamplerConfig,
        ctx: SamplerContext,
    ) -> Self {
        let runtime = Handle::current();
        let mut tasks = Vec::with_capacity(2);

        sampler.lock().detach();
        ctx.frame_source.restart();

        let frame_sampler = sampler.clone();
        let source = ctx.frame_source.clone();
        tasks.push(runtime.spawn(async move {
            loop {
                let timestamp = source.next_frame().await;
                frame_sampler.lock().record_frame(timestamp);
            }
        }));

        let period = Duration::from_millis(config.update_interval_ms);
        let tick_sampler = sampler.clone();
        let clock = ctx.clock.clone();
        let on_performance = ctx.on_performance.clone();
        tasks.push(runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let now = clock.now();
                let snapshot = {
                    let mut sampler = tick_sampler.lock();
                    sampler.tick(now);
                    sampler.snapshot(now)
                };
                tracing::trace!(
                    fps = snapshot.current_fps,
                    score = snapshot.smoothness_score,
                    "Frame sampler tick"
                );
                if let Some(callback) = &on_performance {
                    contain_panic("performance callback", || callback(&snapshot));
                }
            }
        }));

        let idle = Arc::new(Mutex::new(IdleTimer::default()));
        let scroll_listener = config.monitor_scroll.then(|| {
            let listener_sampler = sampler.clone();
            let idle = idle.clone();
            let clock = ctx.clock.clone();
            let on_scroll = ctx.on_scroll.clone();
            ctx.hooks.scroll.add(Arc::new(move |event: &ScrollEvent| {
                let now = clock.now();
                if listener_sampler.lock().scroll_signal(now, event.offset) {
                    tracing::trace!(offset = event.offset, "Scroll session started");
                }

                let mut timer = idle.lock();
                timer.cancel();
                let generation = timer.generation;

                let sampler = listener_sampler.clone();
                let idle_for_task = idle.clone();
                let clock = clock.clone();
                let on_scroll = on_scroll.clone();
                timer.handle = Some(runtime.spawn(async move {
                    tokio::time::sleep(SCROLL_IDLE_TIMEOUT).await;
                    if idle_for_task.lock().generation != generation {
                        return;
                    }
                    let session = sampler.lock().end_scroll(clock.now());
                    if let Some(session) = session {
                        tracing::debug!(
                            frames = session.frame_count,
                            score = session.score,
                            "Scroll session ended"
                        );
                        if let Some(callback) = &on_scroll {
                            contain_panic("scroll session callback", || callback(&session));
                        }
                    }
                }));
            }))
        });

        tracing::debug!(
            update_interval_ms = config.update_interval_ms,
            monitor_scroll = config.monitor_scroll,
            "Frame sampler started"
        );

        Self {
            sampler,
            hooks: ctx.hooks,
            tasks,
            scroll_listener,
            idle,
        }
    }

    pub fn sampler(&self) -> &Arc<Mutex<FrameSampler>> {
        &self.sampler
    }

    /// Abort all tasks and the scroll-idle timer.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(id) = self.scroll_listener.take() {
            self.hooks.scroll.remove(id);
        }
        self.idle.lock().cancel();
        self.sampler.lock().detach();
        tracing::debug!("Frame sampler stopped");
    }
}

impl Drop for SamplerDriver {
    fn drop(&mut self) {
        if !self.tasks.is_empty() || self.scroll_listener.is_some() {
            self.shutdown();
        }
    }
}
