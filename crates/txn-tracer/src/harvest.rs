// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Application-wide aggregation between harvests.
//!
//! Finalized transactions are absorbed from any thread. Each data kind is
//! drained independently so that events can ship on a faster cycle than
//! metrics and traces.

use crate::config::TracerConfig;
use crate::metric::{Metric, SharedMetricTable};
use crate::reservoir::{ReservoirSnapshot, SharedReservoir};
use crate::sql::{SlowSqlSample, SlowSqlTable};
use crate::transaction::{ErrorTrace, Event, FinalizedTransaction, TransactionTrace};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Forced and synthetics traces kept per harvest, on top of the slowest one.
pub const MAX_FORCED_TRACES: usize = 20;
pub const MAX_ERROR_TRACES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Custom,
    Analytics,
    Span,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Custom,
        EventKind::Analytics,
        EventKind::Span,
        EventKind::Error,
    ];
}

/// Metrics drained for one harvest window. Times are Unix seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsHarvest {
    pub period_start: u64,
    pub period_stop: u64,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Default)]
struct TraceBucket {
    slowest: Option<TransactionTrace>,
    forced: Vec<TransactionTrace>,
}

impl TraceBucket {
    fn offer(&mut self, trace: TransactionTrace) {
        if trace.force_persist && self.forced.len() < MAX_FORCED_TRACES {
            self.forced.push(trace);
            return;
        }
        match &self.slowest {
            Some(slowest) if slowest.duration >= trace.duration => {
                debug!("dropping trace {}: a slower one is kept", trace.guid);
            }
            _ => self.slowest = Some(trace),
        }
    }

    fn drain(&mut self) -> Vec<TransactionTrace> {
        let mut traces = std::mem::take(&mut self.forced);
        traces.extend(self.slowest.take());
        traces
    }
}

#[derive(Debug)]
pub struct HarvestCycle {
    metrics: SharedMetricTable,
    metrics_period_start: Mutex<u64>,
    custom_events: SharedReservoir<Event>,
    analytics_events: SharedReservoir<Event>,
    span_events: SharedReservoir<Event>,
    error_events: SharedReservoir<Event>,
    traces: Mutex<TraceBucket>,
    error_traces: Mutex<Vec<ErrorTrace>>,
    slow_sqls: Mutex<SlowSqlTable>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

impl HarvestCycle {
    pub fn new(config: &TracerConfig) -> Self {
        Self {
            metrics: SharedMetricTable::new(config.max_metrics),
            metrics_period_start: Mutex::new(unix_now_secs()),
            custom_events: SharedReservoir::new(config.custom_events_capacity()),
            analytics_events: SharedReservoir::new(config.analytics_events_capacity()),
            span_events: SharedReservoir::new(config.span_events_capacity()),
            error_events: SharedReservoir::new(config.error_events_capacity()),
            traces: Mutex::new(TraceBucket::default()),
            error_traces: Mutex::new(Vec::new()),
            slow_sqls: Mutex::new(SlowSqlTable::default()),
        }
    }

    fn reservoir(&self, kind: EventKind) -> &SharedReservoir<Event> {
        match kind {
            EventKind::Custom => &self.custom_events,
            EventKind::Analytics => &self.analytics_events,
            EventKind::Span => &self.span_events,
            EventKind::Error => &self.error_events,
        }
    }

    /// Merges a finished transaction into the current windows.
    pub fn absorb(&self, txn: FinalizedTransaction) {
        self.metrics.merge(txn.metrics);
        self.analytics_events.add(txn.analytics_event);
        self.custom_events.extend(txn.custom_events);
        self.span_events.extend(txn.span_events);
        if let Some(event) = txn.error_event {
            self.error_events.add(event);
        }
        if let Some(error) = txn.error_trace {
            let mut errors = lock(&self.error_traces);
            if errors.len() < MAX_ERROR_TRACES {
                errors.push(error);
            } else {
                debug!("error trace limit reached, dropping error for {}", txn.guid);
            }
        }
        if let Some(trace) = txn.trace {
            lock(&self.traces).offer(trace);
        }
        if !txn.slow_sqls.is_empty() {
            let mut table = lock(&self.slow_sqls);
            for sample in txn.slow_sqls {
                table.add(sample);
            }
        }
    }

    /// Records a metric outside of any transaction.
    pub fn record_custom_metric(&self, name: &str, value_ms: f64) -> bool {
        self.metrics.record_custom(name, value_ms)
    }

    pub fn drain_metrics(&self) -> MetricsHarvest {
        let period_stop = unix_now_secs();
        let period_start = std::mem::replace(&mut *lock(&self.metrics_period_start), period_stop);
        MetricsHarvest {
            period_start,
            period_stop,
            metrics: self.metrics.drain(),
        }
    }

    /// Merges metrics that could not be delivered into the current window,
    /// which then also covers the failed window's period.
    pub fn restore_metrics(&self, harvest: MetricsHarvest) {
        self.metrics.restore(harvest.metrics);
        let mut start = lock(&self.metrics_period_start);
        *start = (*start).min(harvest.period_start);
    }

    /// `None` when the kind is disabled by a zero capacity.
    pub fn drain_events(&self, kind: EventKind) -> Option<ReservoirSnapshot<Event>> {
        self.reservoir(kind).drain()
    }

    pub fn events_seen(&self, kind: EventKind) -> u64 {
        self.reservoir(kind).events_seen()
    }

    pub fn drain_traces(&self) -> Vec<TransactionTrace> {
        lock(&self.traces).drain()
    }

    pub fn drain_error_traces(&self) -> Vec<ErrorTrace> {
        std::mem::take(&mut *lock(&self.error_traces))
    }

    pub fn drain_slow_sqls(&self) -> Vec<SlowSqlSample> {
        lock(&self.slow_sqls).drain()
    }

    pub fn pending_metrics(&self) -> usize {
        self.metrics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricTable;
    use crate::sampling::SamplingDecision;
    use crate::segment::Segment;
    use std::time::Duration;

    fn trace(guid: &str, ms: u64, forced: bool) -> TransactionTrace {
        TransactionTrace {
            start_ms: 0,
            duration: Duration::from_millis(ms),
            name: "WebTransaction/Uri/index".to_string(),
            request_uri: None,
            root: Segment::new("ROOT", Duration::ZERO, Duration::from_millis(ms)),
            guid: guid.to_string(),
            force_persist: forced,
            synthetics_resource_id: None,
            user_attributes: Default::default(),
            agent_attributes: Default::default(),
            intrinsics: Default::default(),
        }
    }

    fn finalized(trace: Option<TransactionTrace>) -> FinalizedTransaction {
        let mut metrics = MetricTable::default();
        metrics.record_custom("Custom/work", 1000.0);
        FinalizedTransaction {
            name: "WebTransaction/Uri/index".to_string(),
            guid: "abc".to_string(),
            duration: Duration::from_millis(10),
            decision: SamplingDecision {
                priority: 1.5,
                sampled: true,
            },
            metrics,
            analytics_event: Event::new("Transaction", 0),
            custom_events: vec![Event::new("Purchase", 0), Event::new("Purchase", 0)],
            span_events: vec![Event::new("Span", 0)],
            error_event: None,
            error_trace: None,
            trace,
            slow_sqls: Vec::new(),
        }
    }

    #[test]
    fn test_absorb_and_drain() {
        let harvest = HarvestCycle::new(&TracerConfig::default());
        harvest.absorb(finalized(None));
        harvest.absorb(finalized(None));

        let metrics = harvest.drain_metrics();
        assert_eq!(metrics.metrics.len(), 1);
        assert_eq!(metrics.metrics[0].data.count, 2);
        assert!(metrics.period_start <= metrics.period_stop);
        assert!(harvest.drain_metrics().metrics.is_empty());

        let custom = harvest.drain_events(EventKind::Custom).expect("enabled");
        assert_eq!(custom.events_seen, 4);
        assert_eq!(custom.items.len(), 4);
        let analytics = harvest.drain_events(EventKind::Analytics).expect("enabled");
        assert_eq!(analytics.events_seen, 2);
        let errors = harvest.drain_events(EventKind::Error).expect("enabled");
        assert_eq!(errors.events_seen, 0);
    }

    #[test]
    fn test_disabled_kinds_drain_to_none() {
        let config = TracerConfig {
            distributed_tracing_enabled: false,
            ..TracerConfig::default()
        };
        let harvest = HarvestCycle::new(&config);
        harvest.absorb(finalized(None));
        assert!(harvest.drain_events(EventKind::Span).is_none());
        assert_eq!(harvest.events_seen(EventKind::Span), 0);
    }

    #[test]
    fn test_trace_bucket_keeps_slowest_and_forced() {
        let harvest = HarvestCycle::new(&TracerConfig::default());
        harvest.absorb(finalized(Some(trace("fast", 2100, false))));
        harvest.absorb(finalized(Some(trace("slow", 3000, false))));
        harvest.absorb(finalized(Some(trace("medium", 2500, false))));
        harvest.absorb(finalized(Some(trace("synthetic", 5, true))));

        let guids: Vec<String> = harvest.drain_traces().into_iter().map(|t| t.guid).collect();
        assert_eq!(guids, vec!["synthetic", "slow"]);
        assert!(harvest.drain_traces().is_empty());
    }

    #[test]
    fn test_error_traces_capped() {
        let harvest = HarvestCycle::new(&TracerConfig::default());
        for i in 0..25 {
            let mut txn = finalized(None);
            txn.error_trace = Some(ErrorTrace {
                timestamp_ms: i,
                txn_name: txn.name.clone(),
                message: "boom".to_string(),
                class: "Error".to_string(),
                request_uri: None,
                user_attributes: Default::default(),
                agent_attributes: Default::default(),
                intrinsics: Default::default(),
                guid: format!("txn-{i}"),
            });
            harvest.absorb(txn);
        }
        assert_eq!(harvest.drain_error_traces().len(), MAX_ERROR_TRACES);
        assert!(harvest.drain_error_traces().is_empty());
    }

    #[test]
    fn test_restore_metrics_is_additive() {
        let harvest = HarvestCycle::new(&TracerConfig::default());
        harvest.absorb(finalized(None));
        let failed = harvest.drain_metrics();
        let failed_start = failed.period_start;

        harvest.absorb(finalized(None));
        harvest.restore_metrics(failed);

        let next = harvest.drain_metrics();
        assert_eq!(next.metrics[0].data.count, 2);
        assert_eq!(next.period_start, failed_start);
    }
}
