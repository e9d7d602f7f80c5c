// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport of harvest payloads to the collector.

use crate::config::TracerConfig;
use crate::errors::CollectorError;
use crate::harvest::EventKind;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Number of attempts, without delay between them.
    Immediate(u64),
    /// Number of attempts and the delay in milliseconds that grows with
    /// each retry.
    LinearBackoff(u64, u64),
}

impl RetryStrategy {
    pub fn attempts(&self) -> u64 {
        match self {
            RetryStrategy::Immediate(attempts) | RetryStrategy::LinearBackoff(attempts, _) => {
                (*attempts).max(1)
            }
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u64) -> Option<Duration> {
        match self {
            RetryStrategy::Immediate(_) => None,
            RetryStrategy::LinearBackoff(_, delay_ms) => {
                Some(Duration::from_millis(delay_ms.saturating_mul(attempt)))
            }
        }
    }
}

/// Collector endpoints, one per payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HarvestMethod {
    MetricData,
    AnalyticEventData,
    CustomEventData,
    SpanEventData,
    ErrorEventData,
    TransactionSampleData,
    ErrorData,
    SqlTraceData,
}

impl HarvestMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HarvestMethod::MetricData => "metric_data",
            HarvestMethod::AnalyticEventData => "analytic_event_data",
            HarvestMethod::CustomEventData => "custom_event_data",
            HarvestMethod::SpanEventData => "span_event_data",
            HarvestMethod::ErrorEventData => "error_event_data",
            HarvestMethod::TransactionSampleData => "transaction_sample_data",
            HarvestMethod::ErrorData => "error_data",
            HarvestMethod::SqlTraceData => "sql_trace_data",
        }
    }
}

impl From<EventKind> for HarvestMethod {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Custom => HarvestMethod::CustomEventData,
            EventKind::Analytics => HarvestMethod::AnalyticEventData,
            EventKind::Span => HarvestMethod::SpanEventData,
            EventKind::Error => HarvestMethod::ErrorEventData,
        }
    }
}

#[async_trait]
pub trait Collector: Send + Sync {
    async fn send(&self, method: HarvestMethod, payload: &Value) -> Result<(), CollectorError>;
}

/// Posts zstd-compressed JSON to
/// `{host}/agent_listener/invoke_raw_method?method=<method>&run_id=<run_id>`.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: reqwest::Client,
    host: String,
    run_id: String,
    license_key: Option<String>,
    retry_strategy: RetryStrategy,
    compression_level: i32,
}

impl HttpCollector {
    pub fn new(config: &TracerConfig, run_id: &str) -> Result<Self, CollectorError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CollectorError::Destination(None, e.to_string()))?;
        Ok(Self {
            client,
            host: config.collector_host.trim_end_matches('/').to_string(),
            run_id: run_id.to_owned(),
            license_key: config.license_key.clone(),
            retry_strategy: config.retry_strategy.clone(),
            compression_level: config.compression_level,
        })
    }

    pub fn url(&self, method: HarvestMethod) -> String {
        format!(
            "{}/agent_listener/invoke_raw_method?method={}&run_id={}",
            self.host,
            method.as_str(),
            self.run_id
        )
    }

    fn encode(&self, payload: &Value) -> Result<Vec<u8>, CollectorError> {
        let body = serde_json::to_vec(payload).map_err(|e| CollectorError::Payload(e.to_string()))?;
        zstd::stream::encode_all(body.as_slice(), self.compression_level)
            .map_err(|e| CollectorError::Payload(e.to_string()))
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn send(&self, method: HarvestMethod, payload: &Value) -> Result<(), CollectorError> {
        let body = self.encode(payload)?;
        let url = self.url(method);
        let attempts = self.retry_strategy.attempts();
        let mut last_status = None;

        for attempt in 1..=attempts {
            let mut request = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Content-Encoding", "zstd")
                .body(body.clone());
            if let Some(license_key) = &self.license_key {
                request = request.header("X-License-Key", license_key);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("{} delivered after {attempt} attempt(s)", method.as_str());
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    if status.is_client_error() {
                        error!("{status}: collector rejected {}: {text:?}", method.as_str());
                        return Err(CollectorError::Destination(Some(status), text));
                    }
                    debug!("{status}: {} attempt {attempt} failed: {text:?}", method.as_str());
                    last_status = Some(status);
                }
                Err(err) => {
                    debug!("{} attempt {attempt} failed: {err}", method.as_str());
                    last_status = err.status();
                }
            }

            if attempt < attempts {
                if let Some(delay) = self.retry_strategy.delay(attempt) {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(CollectorError::Destination(
            last_status,
            format!("Failed to send request after {attempts} attempts"),
        ))
    }
}
