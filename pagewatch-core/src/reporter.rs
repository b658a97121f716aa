//! Delivery queue
//!
//! Accepted records wait in a pending list until a quiet period passes with no
//! new arrivals, then the whole list goes out as one batch. At most one batch
//! is in flight. A batch that exhausts its retries is put back at the front of
//! the list, ahead of anything that arrived meanwhile.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use crate::transport::{HttpTransport, Transport};
use crate::types::{DeliveryReceipt, ErrorRecord, ReportBatch, SdkInfo};

/// Result of one flush
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing pending, or a batch was already in flight
    Skipped,
    Delivered {
        count: usize,
        receipt: DeliveryReceipt,
    },
    /// Every attempt failed; the batch is pending again
    Requeued { count: usize },
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    /// Records acknowledged by the collector
    pub delivered: usize,
    /// Batches that exhausted their attempts
    pub failed_batches: usize,
    /// Individual send attempts, including retries
    pub attempts: usize,
}

struct State {
    config: DeliveryConfig,
    capacity: usize,
    pending: VecDeque<ErrorRecord>,
    flushing: bool,
    in_flight: usize,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    stats: DeliveryStats,
}

impl State {
    fn trim(&mut self) {
        while self.pending.len() > self.capacity {
            if let Some(dropped) = self.pending.pop_front() {
                tracing::warn!(id = %dropped.id, "Pending list full; dropped oldest record");
            }
        }
    }

    fn cancel_timer(&mut self) {
        self.timer_generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Shared {
    state: Mutex<State>,
    transport: Mutex<Arc<dyn Transport>>,
}

/// Debounced, single-flight batch reporter. Cheap to clone.
#[derive(Clone)]
pub struct Reporter {
    shared: Arc<Shared>,
}

impl Reporter {
    pub fn new(config: DeliveryConfig, capacity: usize, transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    config,
                    capacity: capacity.max(1),
                    pending: VecDeque::new(),
                    flushing: false,
                    in_flight: 0,
                    timer: None,
                    timer_generation: 0,
                    stats: DeliveryStats::default(),
                }),
                transport: Mutex::new(transport),
            }),
        }
    }

    /// Reporter that posts to `config.endpoint` over HTTP.
    pub fn with_http(config: DeliveryConfig, capacity: usize) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::new(config, capacity, Arc::new(transport)))
    }

    /// Append records and restart the quiet-period timer.
    ///
    /// Outside a tokio runtime the records are kept but no flush is scheduled.
    pub fn enqueue(&self, records: impl IntoIterator<Item = ErrorRecord>) {
        let mut state = self.shared.state.lock();
        let before = state.pending.len();
        state.pending.extend(records);
        if state.pending.len() == before {
            return;
        }
        state.trim();

        match Handle::try_current() {
            Ok(runtime) => self.schedule(&mut state, &runtime),
            Err(_) => tracing::debug!("No async runtime; flush not scheduled"),
        }
    }

    fn schedule(&self, state: &mut State, runtime: &Handle) {
        state.cancel_timer();
        let generation = state.timer_generation;
        let delay = state.config.flush_interval();
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);

        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            {
                let mut state = shared.state.lock();
                if state.timer_generation != generation {
                    return;
                }
                state.timer = None;
            }
            Reporter { shared }.flush().await;
        }));
    }

    /// Abort a pending quiet-period timer.
    pub fn cancel_timer(&self) {
        self.shared.state.lock().cancel_timer();
    }

    /// Send everything pending now.
    ///
    /// The attempt runs on its own task so it completes even if this future
    /// is dropped.
    pub async fn flush(&self) -> FlushOutcome {
        let (batch, config, transport) = {
            let mut state = self.shared.state.lock();
            if state.flushing || state.pending.is_empty() {
                return FlushOutcome::Skipped;
            }
            state.flushing = true;
            let batch: Vec<ErrorRecord> = state.pending.drain(..).collect();
            state.in_flight = batch.len();
            (batch, state.config.clone(), self.shared.transport.lock().clone())
        };
        let count = batch.len();
        // The task owns the batch; a panicking transport would take it down too.
        let retained = batch.clone();

        let shared = self.shared.clone();
        let attempt = tokio::spawn(deliver(shared, batch, config, transport));
        match attempt.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, count, "Delivery task failed; batch requeued");
                let mut state = self.shared.state.lock();
                state.flushing = false;
                state.in_flight = 0;
                state.stats.failed_batches += 1;
                for record in retained.into_iter().rev() {
                    state.pending.push_front(record);
                }
                state.trim();
                FlushOutcome::Requeued { count }
            }
        }
    }

    /// Records not yet delivered, including an in-flight batch
    ///
    /// The pending list and the in-flight batch are each capped at the queue
    /// capacity, so while a batch is in flight this can reach twice the
    /// capacity.
    pub fn pending_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.pending.len() + state.in_flight
    }

    /// Records waiting for the next flush, front first
    pub fn pending(&self) -> Vec<ErrorRecord> {
        self.shared.state.lock().pending.iter().cloned().collect()
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.state.lock().flushing
    }

    pub fn stats(&self) -> DeliveryStats {
        self.shared.state.lock().stats
    }

    /// Apply new delivery settings; takes effect from the next flush.
    pub fn update(&self, config: DeliveryConfig, capacity: usize) {
        let mut state = self.shared.state.lock();
        state.config = config;
        state.capacity = capacity.max(1);
        state.trim();
    }

    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.shared.transport.lock() = transport;
    }
}

async fn deliver(
    shared: Arc<Shared>,
    batch: Vec<ErrorRecord>,
    config: DeliveryConfig,
    transport: Arc<dyn Transport>,
) -> FlushOutcome {
    let report = ReportBatch {
        errors: batch,
        timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        sdk: SdkInfo::CURRENT,
    };
    let count = report.errors.len();
    let max_attempts = config.max_retries.max(1);

    let mut attempt = 0;
    let result = loop {
        attempt += 1;
        shared.state.lock().stats.attempts += 1;

        let result = match tokio::time::timeout(config.timeout(), transport.send(&report)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(config.timeout_ms)),
        };

        match result {
            Ok(receipt) => break Ok(receipt),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = config.backoff(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Delivery attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => break Err(e),
        }
    };

    let mut state = shared.state.lock();
    state.flushing = false;
    state.in_flight = 0;

    match result {
        Ok(receipt) => {
            state.stats.delivered += count;
            tracing::info!(count, id = ?receipt.id, "Delivered error batch");

            // Records that arrived during the attempt lost their timer to the guard.
            if !state.pending.is_empty() && state.timer.is_none() {
                if let Ok(runtime) = Handle::try_current() {
                    Reporter {
                        shared: shared.clone(),
                    }
                    .schedule(&mut state, &runtime);
                }
            }
            FlushOutcome::Delivered { count, receipt }
        }
        Err(e) => {
            state.stats.failed_batches += 1;
            for record in report.errors.into_iter().rev() {
                state.pending.push_front(record);
            }
            state.trim();
            tracing::error!(
                count,
                attempts = attempt,
                error = %e,
                "Delivery failed; batch requeued"
            );
            FlushOutcome::Requeued { count }
        }
    }
}
