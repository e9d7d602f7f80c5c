// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The current transaction of each thread and the call-in API used by
//! instrumentation.
//!
//! Instrumented call sites never see an error: every function here returns
//! `bool` or `Option` and logs the reason for a refusal.

use crate::attributes::HostValue;
use crate::config::TracerConfig;
use crate::errors::TracerError;
use crate::harvest::HarvestCycle;
use crate::metric::Metric;
use crate::sampling::{AdaptiveSampler, SamplingPolicy};
use crate::segment::SegmentHandle;
use crate::transaction::{Clock, SystemClock, TransactionKind, TransactionTracer};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

struct ActiveTransaction {
    tracer: TransactionTracer,
    harvest: Arc<HarvestCycle>,
}

thread_local! {
    static CURRENT: RefCell<Option<ActiveTransaction>> = const { RefCell::new(None) };
}

/// Shared state of one instrumented application.
#[derive(Debug, Clone)]
pub struct Agent {
    config: Arc<TracerConfig>,
    sampler: Arc<dyn SamplingPolicy>,
    clock: Arc<dyn Clock>,
    harvest: Arc<HarvestCycle>,
}

impl Agent {
    pub fn new(config: TracerConfig) -> Self {
        let sampler = Arc::new(AdaptiveSampler::new(
            config.sampling_target,
            config.sampling_window,
        ));
        Self::with_parts(config, sampler, Arc::new(SystemClock::default()))
    }

    pub fn with_parts(
        config: TracerConfig,
        sampler: Arc<dyn SamplingPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let harvest = Arc::new(HarvestCycle::new(&config));
        Self {
            config: Arc::new(config),
            sampler,
            clock,
            harvest,
        }
    }

    pub fn config(&self) -> &Arc<TracerConfig> {
        &self.config
    }

    pub fn harvest(&self) -> &Arc<HarvestCycle> {
        &self.harvest
    }

    /// Starts a transaction on the calling thread. Fails if one is already
    /// active there.
    pub fn begin_transaction(&self, kind: TransactionKind) -> Result<TransactionGuard, TracerError> {
        let mut tracer = TransactionTracer::new(
            Arc::clone(&self.config),
            Arc::clone(&self.sampler),
            Arc::clone(&self.clock),
            kind,
        );
        tracer.start()?;
        let guid = tracer.guid().to_owned();

        CURRENT
            .try_with(|current| {
                let mut current = current.borrow_mut();
                if current.is_some() {
                    return Err(TracerError::AlreadyActive);
                }
                *current = Some(ActiveTransaction {
                    tracer,
                    harvest: Arc::clone(&self.harvest),
                });
                Ok(())
            })
            .map_err(|_| TracerError::NoActiveTransaction)??;

        Ok(TransactionGuard {
            guid,
            _not_send: PhantomData,
        })
    }
}

/// Ends its transaction when dropped, unless it was already ended.
#[derive(Debug)]
#[must_use = "dropping the guard ends the transaction"]
pub struct TransactionGuard {
    guid: String,
    // The transaction lives in thread-local storage of the creating thread.
    _not_send: PhantomData<*const ()>,
}

impl TransactionGuard {
    pub fn guid(&self) -> &str {
        &self.guid
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        let still_current = current_guid().as_deref() == Some(self.guid.as_str());
        if still_current {
            end_transaction(true);
        }
    }
}

fn current_guid() -> Option<String> {
    CURRENT
        .try_with(|current| {
            current
                .borrow()
                .as_ref()
                .map(|active| active.tracer.guid().to_owned())
        })
        .ok()
        .flatten()
}

fn take_current() -> Option<ActiveTransaction> {
    CURRENT
        .try_with(|current| current.borrow_mut().take())
        .ok()
        .flatten()
}

fn with_current<R>(
    operation: &'static str,
    f: impl FnOnce(&mut TransactionTracer) -> Result<R, TracerError>,
) -> Option<R> {
    let result = CURRENT
        .try_with(|current| match current.borrow_mut().as_mut() {
            Some(active) => f(&mut active.tracer),
            None => Err(TracerError::NoActiveTransaction),
        })
        .unwrap_or(Err(TracerError::NoActiveTransaction));
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            debug!("{operation} refused: {err}");
            None
        }
    }
}

pub fn is_transaction_active() -> bool {
    current_guid().is_some()
}

pub fn set_transaction_name(name: &str) -> bool {
    with_current("set_transaction_name", |txn| txn.set_name(name)).is_some()
}

pub fn start_segment(name: &str) -> Option<SegmentHandle> {
    with_current("start_segment", |txn| txn.start_segment(name))
}

pub fn stop_segment(handle: SegmentHandle) -> bool {
    with_current("stop_segment", |txn| txn.stop_segment(handle)).is_some()
}

pub fn add_custom_attribute(key: impl Into<HostValue>, value: impl Into<HostValue>) -> bool {
    let (key, value) = (key.into(), value.into());
    with_current("add_custom_attribute", |txn| {
        txn.add_custom_attribute(key, value)
    })
    .is_some()
}

pub fn record_custom_metric(name: &str, value_ms: f64) -> bool {
    with_current("record_custom_metric", |txn| {
        txn.record_custom_metric(name, value_ms)
    })
    .is_some()
}

pub fn record_custom_event<I>(event_type: &str, attributes: I) -> bool
where
    I: IntoIterator<Item = (String, HostValue)>,
{
    with_current("record_custom_event", |txn| {
        txn.record_custom_event(event_type, attributes)
    })
    .is_some()
}

pub fn notice_error(message: &str, class: &str) -> bool {
    with_current("notice_error", |txn| txn.notice_error(message, class)).is_some()
}

pub fn ignore_transaction() -> bool {
    with_current("ignore_transaction", TransactionTracer::ignore).is_some()
}

/// Ends the current transaction. With `keep_trace` false the transaction
/// is discarded as if it had been ignored.
pub fn end_transaction(keep_trace: bool) -> bool {
    let Some(mut active) = take_current() else {
        debug!("end_transaction refused: {}", TracerError::NoActiveTransaction);
        return false;
    };
    if !keep_trace {
        return active.tracer.discard().is_ok();
    }
    match active.tracer.end() {
        Ok(Some(finalized)) => {
            active.harvest.absorb(finalized);
            true
        }
        Ok(None) => true,
        Err(err) => {
            debug!("end_transaction refused: {err}");
            false
        }
    }
}

/// Metrics recorded so far by the current transaction; empty without one.
pub fn get_metric_table(scoped: bool) -> Vec<Metric> {
    with_current("get_metric_table", |txn| Ok(txn.get_metric_table(scoped))).unwrap_or_default()
}
