// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background loop that drains the harvest and ships it.
//!
//! Events go out on the fast cycle. Metrics, traces, error traces and slow
//! queries go out on the slow cycle. Metrics that fail to ship with a
//! retryable error are merged back into the next window; everything else is
//! sent at most once.

use crate::collector::{Collector, HarvestMethod};
use crate::config::TracerConfig;
use crate::harvest::{EventKind, HarvestCycle};
use crate::payload;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Harvester {
    harvest: Arc<HarvestCycle>,
    collector: Arc<dyn Collector>,
    run_id: String,
    event_period: Duration,
    harvest_period: Duration,
}

impl Harvester {
    pub fn new(
        harvest: Arc<HarvestCycle>,
        collector: Arc<dyn Collector>,
        config: &TracerConfig,
        run_id: &str,
    ) -> Self {
        Self {
            harvest,
            collector,
            run_id: run_id.to_owned(),
            event_period: config.event_harvest_period,
            harvest_period: config.harvest_period,
        }
    }

    /// Ships every enabled event kind. Disabled kinds send nothing.
    pub async fn harvest_events(&self) {
        for kind in EventKind::ALL {
            let snapshot = self.harvest.drain_events(kind);
            let Some(payload) = payload::encode_events(&self.run_id, snapshot.as_ref()) else {
                continue;
            };
            let method = HarvestMethod::from(kind);
            if let Err(err) = self.collector.send(method, &payload).await {
                warn!("dropping {} after failed harvest: {err}", method.as_str());
            }
        }
    }

    pub async fn harvest_metrics(&self) {
        let metrics = self.harvest.drain_metrics();
        if metrics.metrics.is_empty() {
            return;
        }
        let payload = payload::encode_metrics(&self.run_id, &metrics);
        match self.collector.send(HarvestMethod::MetricData, &payload).await {
            Ok(()) => debug!("harvested {} metrics", metrics.metrics.len()),
            Err(err) if err.is_retryable() => {
                warn!(
                    "keeping {} metrics for the next harvest: {err}",
                    metrics.metrics.len()
                );
                self.harvest.restore_metrics(metrics);
            }
            Err(err) => warn!("dropping {} metrics: {err}", metrics.metrics.len()),
        }
    }

    pub async fn harvest_traces(&self) {
        let traces = self.harvest.drain_traces();
        if !traces.is_empty() {
            let payload = payload::encode_traces(&self.run_id, &traces);
            self.send_once(HarvestMethod::TransactionSampleData, &payload)
                .await;
        }

        let errors = self.harvest.drain_error_traces();
        if !errors.is_empty() {
            let payload = payload::encode_errors(&self.run_id, &errors);
            self.send_once(HarvestMethod::ErrorData, &payload).await;
        }

        let slow_sqls = self.harvest.drain_slow_sqls();
        if !slow_sqls.is_empty() {
            let payload = payload::encode_slow_sqls(&slow_sqls);
            self.send_once(HarvestMethod::SqlTraceData, &payload).await;
        }
    }

    async fn send_once(&self, method: HarvestMethod, payload: &serde_json::Value) {
        if let Err(err) = self.collector.send(method, payload).await {
            warn!("dropping {} after failed harvest: {err}", method.as_str());
        }
    }

    pub async fn harvest_slow(&self) {
        self.harvest_metrics().await;
        self.harvest_traces().await;
    }

    pub async fn harvest_all(&self) {
        self.harvest_events().await;
        self.harvest_slow().await;
    }

    /// Runs both cycles until `cancel` fires, then harvests one last time.
    pub async fn run(self, cancel: CancellationToken) {
        let mut fast = interval(self.event_period);
        let mut slow = interval(self.harvest_period);
        // discard first ticks, which are instantaneous
        fast.tick().await;
        slow.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("harvester shutting down, running final harvest");
                    self.harvest_all().await;
                    break;
                }
                _ = fast.tick() => self.harvest_events().await,
                _ = slow.tick() => self.harvest_slow().await,
            }
        }
    }
}
