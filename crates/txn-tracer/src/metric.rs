// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named timer/counter aggregation.
//!
//! Every measurement is merged into the entry keyed by `(name, scope)`.
//! Scoped entries belong to a transaction name; each scoped write also lands
//! in the unscoped entry of the same name.

use hashbrown::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

pub const METRICS_DROPPED: &str = "Supportability/MetricsDropped";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: String,
    pub scope: Option<String>,
}

impl MetricKey {
    pub fn unscoped(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            scope: None,
        }
    }

    pub fn scoped(name: &str, scope: &str) -> Self {
        Self {
            name: name.to_owned(),
            scope: Some(scope.to_owned()),
        }
    }
}

/// Aggregated values of one metric. Times are in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricData {
    pub count: u64,
    pub total: f64,
    pub exclusive: f64,
    pub min: f64,
    pub max: f64,
    pub sum_of_squares: f64,
}

/// Apdex zone of a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApdexZone {
    Satisfying,
    Tolerating,
    Frustrating,
}

impl ApdexZone {
    pub fn classify(duration: Duration, apdex_t: Duration, is_error: bool) -> Self {
        if is_error || duration > apdex_t * 4 {
            ApdexZone::Frustrating
        } else if duration > apdex_t {
            ApdexZone::Tolerating
        } else {
            ApdexZone::Satisfying
        }
    }
}

impl MetricData {
    pub fn from_value(value: f64, exclusive: f64) -> Self {
        Self {
            count: 1,
            total: value,
            exclusive,
            min: value,
            max: value,
            sum_of_squares: value * value,
        }
    }

    /// A count-only entry: `[count, 0, 0, 0, 0, 0]`.
    pub fn from_count(count: u64) -> Self {
        Self {
            count,
            total: 0.0,
            exclusive: 0.0,
            min: 0.0,
            max: 0.0,
            sum_of_squares: 0.0,
        }
    }

    pub fn from_timing(value: Duration, exclusive: Duration) -> Self {
        Self::from_value(value.as_secs_f64(), exclusive.as_secs_f64())
    }

    /// Apdex data reuses the fields as
    /// `[satisfied, tolerating, frustrating, apdex_t, apdex_t, 0]`.
    pub fn apdex(zone: ApdexZone, apdex_t: Duration) -> Self {
        let t = apdex_t.as_secs_f64();
        let (satisfied, tolerating, frustrating) = match zone {
            ApdexZone::Satisfying => (1, 0.0, 0.0),
            ApdexZone::Tolerating => (0, 1.0, 0.0),
            ApdexZone::Frustrating => (0, 0.0, 1.0),
        };
        Self {
            count: satisfied,
            total: tolerating,
            exclusive: frustrating,
            min: t,
            max: t,
            sum_of_squares: 0.0,
        }
    }

    pub fn merge(&mut self, other: &MetricData) {
        self.count += other.count;
        self.total += other.total;
        self.exclusive += other.exclusive;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum_of_squares += other.sum_of_squares;
    }

    /// `[count, total, exclusive, min, max, sum_of_squares]`
    #[allow(clippy::cast_precision_loss)]
    pub fn to_array(&self) -> [f64; 6] {
        [
            self.count as f64,
            self.total,
            self.exclusive,
            self.min,
            self.max,
            self.sum_of_squares,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub scope: Option<String>,
    pub data: MetricData,
}

#[derive(Debug, Clone, Copy)]
struct MetricEntry {
    data: MetricData,
    forced: bool,
}

/// Metric aggregation for one transaction or one harvest window.
///
/// Unforced metrics beyond `max_unforced` distinct keys are folded into
/// [`METRICS_DROPPED`], which counts the dropped recordings; forced metrics
/// are always kept.
#[derive(Debug, Clone)]
pub struct MetricTable {
    entries: HashMap<MetricKey, MetricEntry>,
    max_unforced: usize,
    unforced: usize,
}

impl Default for MetricTable {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl MetricTable {
    pub fn new(max_unforced: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_unforced,
            unforced: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a timing. A scoped write also updates the unscoped entry.
    pub fn record(&mut self, name: &str, scope: Option<&str>, value: Duration, exclusive: Duration) {
        self.record_data(name, scope, MetricData::from_timing(value, exclusive), false);
    }

    /// Like [`MetricTable::record`], but never dropped by the size limit.
    pub fn record_forced(
        &mut self,
        name: &str,
        scope: Option<&str>,
        value: Duration,
        exclusive: Duration,
    ) {
        self.record_data(name, scope, MetricData::from_timing(value, exclusive), true);
    }

    /// Records a custom metric given in milliseconds. Returns `false` for a
    /// non-finite value.
    pub fn record_custom(&mut self, name: &str, value_ms: f64) -> bool {
        if !value_ms.is_finite() {
            debug!("rejecting non-finite value for custom metric {name}");
            return false;
        }
        let secs = value_ms / 1000.0;
        self.merge_entry(
            MetricKey::unscoped(name),
            MetricData::from_value(secs, secs),
            false,
        );
        true
    }

    pub fn record_apdex(&mut self, name: &str, zone: ApdexZone, apdex_t: Duration) {
        self.merge_entry(
            MetricKey::unscoped(name),
            MetricData::apdex(zone, apdex_t),
            true,
        );
    }

    /// Adds `count` to a forced, count-only metric.
    pub fn record_count(&mut self, name: &str, count: u64) {
        self.merge_entry(
            MetricKey::unscoped(name),
            MetricData::from_count(count),
            true,
        );
    }

    fn record_data(&mut self, name: &str, scope: Option<&str>, data: MetricData, forced: bool) {
        if let Some(scope) = scope {
            self.merge_entry(MetricKey::scoped(name, scope), data, forced);
        }
        self.merge_entry(MetricKey::unscoped(name), data, forced);
    }

    fn merge_entry(&mut self, key: MetricKey, data: MetricData, forced: bool) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.data.merge(&data);
            return;
        }

        if !forced {
            if self.unforced >= self.max_unforced {
                self.merge_dropped(data.count);
                return;
            }
            self.unforced += 1;
        }
        self.entries.insert(key, MetricEntry { data, forced });
    }

    fn merge_dropped(&mut self, count: u64) {
        let key = MetricKey::unscoped(METRICS_DROPPED);
        let data = MetricData::from_count(count);
        match self.entries.get_mut(&key) {
            Some(entry) => entry.data.merge(&data),
            None => {
                self.entries.insert(key, MetricEntry { data, forced: true });
            }
        }
    }

    /// Merges every entry of `other` into this table.
    pub fn merge(&mut self, other: MetricTable) {
        for (key, entry) in other.entries {
            self.merge_entry(key, entry.data, entry.forced);
        }
    }

    pub fn get(&self, name: &str, scope: Option<&str>) -> Option<&MetricData> {
        let key = MetricKey {
            name: name.to_owned(),
            scope: scope.map(str::to_owned),
        };
        self.entries.get(&key).map(|entry| &entry.data)
    }

    /// Scoped or unscoped metrics, sorted by name then scope.
    pub fn metrics(&self, scoped: bool) -> Vec<Metric> {
        let mut metrics: Vec<Metric> = self
            .entries
            .iter()
            .filter(|(key, _)| key.scope.is_some() == scoped)
            .map(|(key, entry)| Metric {
                name: key.name.clone(),
                scope: key.scope.clone(),
                data: entry.data,
            })
            .collect();
        metrics.sort_by(|a, b| (&a.name, &a.scope).cmp(&(&b.name, &b.scope)));
        metrics
    }

    /// Every metric, sorted by name then scope, leaving the table empty.
    pub fn drain(&mut self) -> Vec<Metric> {
        self.unforced = 0;
        let mut metrics: Vec<Metric> = self
            .entries
            .drain()
            .map(|(key, entry)| Metric {
                name: key.name,
                scope: key.scope,
                data: entry.data,
            })
            .collect();
        metrics.sort_by(|a, b| (&a.name, &a.scope).cmp(&(&b.name, &b.scope)));
        metrics
    }

    /// Rebuilds a table from drained metrics, e.g. to merge back a failed
    /// harvest. Restored entries are treated as forced so a retry never
    /// loses data to the size limit.
    pub fn from_metrics(metrics: Vec<Metric>) -> Self {
        let mut table = Self::default();
        for metric in metrics {
            table.merge_entry(
                MetricKey {
                    name: metric.name,
                    scope: metric.scope,
                },
                metric.data,
                true,
            );
        }
        table
    }
}

/// The application-wide table that finalized transactions merge into.
#[derive(Debug)]
pub struct SharedMetricTable {
    inner: Mutex<MetricTable>,
    max_unforced: usize,
}

impl SharedMetricTable {
    pub fn new(max_unforced: usize) -> Self {
        Self {
            inner: Mutex::new(MetricTable::new(max_unforced)),
            max_unforced,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricTable> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn merge(&self, table: MetricTable) {
        self.lock().merge(table);
    }

    pub fn record_custom(&self, name: &str, value_ms: f64) -> bool {
        self.lock().record_custom(name, value_ms)
    }

    /// Swaps in an empty table and returns everything recorded so far.
    /// A merge either lands before the swap or in the new table.
    pub fn drain(&self) -> Vec<Metric> {
        let mut previous = {
            let mut guard = self.lock();
            std::mem::replace(&mut *guard, MetricTable::new(self.max_unforced))
        };
        previous.drain()
    }

    /// Merges undelivered metrics back into the current window.
    pub fn restore(&self, metrics: Vec<Metric>) {
        self.lock().merge(MetricTable::from_metrics(metrics));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
