// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::attributes::{AttributeConfig, AttributeRule, Destinations};
use crate::collector::RetryStrategy;
use crate::errors::ConfigError;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_COLLECTOR_HOST: &str = "https://collector.newrelic.com";
const DEFAULT_APDEX_T: Duration = Duration::from_millis(500);
const DEFAULT_EXPLAIN_THRESHOLD: Duration = Duration::from_millis(500);
const DEFAULT_HARVEST_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_EVENT_HARVEST_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_MAX_METRICS: usize = 2000;

/// Hard ceiling for `custom_insights_events.max_samples_stored`.
pub const MAX_CUSTOM_EVENTS_PER_MINUTE: usize = 100_000;

/// How SQL text is captured on datastore segments and slow queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordSql {
    Off,
    Obfuscated,
    Raw,
}

impl FromStr for RecordSql {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(RecordSql::Off),
            "obfuscated" => Ok(RecordSql::Obfuscated),
            "raw" => Ok(RecordSql::Raw),
            other => Err(format!("unknown record_sql mode '{other}'")),
        }
    }
}

/// Data categories that high security mode or a server-side policy may
/// restrict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub custom_parameters: bool,
    pub custom_events: bool,
    pub allow_raw_exception_messages: bool,
    pub record_sql: RecordSql,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            custom_parameters: true,
            custom_events: true,
            allow_raw_exception_messages: true,
            record_sql: RecordSql::Raw,
        }
    }
}

impl SecurityPolicy {
    /// The policy high security mode enforces regardless of local settings.
    pub fn high_security() -> Self {
        Self {
            custom_parameters: false,
            custom_events: false,
            allow_raw_exception_messages: false,
            record_sql: RecordSql::Obfuscated,
        }
    }

    /// Combines two policies, keeping the more restrictive setting of each.
    pub fn restrict(&self, other: &SecurityPolicy) -> SecurityPolicy {
        SecurityPolicy {
            custom_parameters: self.custom_parameters && other.custom_parameters,
            custom_events: self.custom_events && other.custom_events,
            allow_raw_exception_messages: self.allow_raw_exception_messages
                && other.allow_raw_exception_messages,
            record_sql: self.record_sql.min(other.record_sql),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceThreshold {
    /// Four times the apdex target.
    ApdexF,
    Fixed(Duration),
}

#[derive(Debug, Clone)]
pub struct TransactionTracerConfig {
    pub enabled: bool,
    pub threshold: TraceThreshold,
    pub record_sql: RecordSql,
    /// Datastore segments at least this slow become slow-SQL samples.
    pub explain_threshold: Duration,
    /// Childless, attribute-less segments shorter than this are pruned from
    /// the trace tree. Metrics are unaffected.
    pub min_expensive_node: Duration,
}

impl Default for TransactionTracerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: TraceThreshold::ApdexF,
            record_sql: RecordSql::Obfuscated,
            explain_threshold: DEFAULT_EXPLAIN_THRESHOLD,
            min_expensive_node: Duration::ZERO,
        }
    }
}

/// Per-minute event limits; the per-harvest reservoir capacity is derived
/// from these and the event harvest period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLimits {
    pub custom_events: usize,
    pub analytics_events: usize,
    pub span_events: usize,
    pub error_events: usize,
}

impl Default for EventLimits {
    fn default() -> Self {
        Self {
            custom_events: 30_000,
            analytics_events: 10_000,
            span_events: 2_000,
            error_events: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub app_name: String,
    pub license_key: Option<String>,
    pub collector_host: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub high_security: bool,
    /// Locally configured policy; see [`TracerConfig::effective_security`].
    pub security: SecurityPolicy,
    pub apdex_t: Duration,
    pub transaction_tracer: TransactionTracerConfig,
    pub attributes: Arc<AttributeConfig>,
    pub distributed_tracing_enabled: bool,
    pub span_events_enabled: bool,
    pub event_limits: EventLimits,
    /// Period of the fast harvest that ships events.
    pub event_harvest_period: Duration,
    /// Period of the slow harvest that ships metrics, traces, errors and SQL.
    pub harvest_period: Duration,
    pub max_metrics: usize,
    pub sampling_target: u64,
    pub sampling_window: Duration,
    pub request_timeout: Duration,
    pub retry_strategy: RetryStrategy,
    pub compression_level: i32,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            app_name: "Rust Application".to_string(),
            license_key: None,
            collector_host: DEFAULT_COLLECTOR_HOST.to_string(),
            log_level: "info".to_string(),
            high_security: false,
            security: SecurityPolicy::default(),
            apdex_t: DEFAULT_APDEX_T,
            transaction_tracer: TransactionTracerConfig::default(),
            attributes: Arc::new(AttributeConfig::default()),
            distributed_tracing_enabled: true,
            span_events_enabled: true,
            event_limits: EventLimits::default(),
            event_harvest_period: DEFAULT_EVENT_HARVEST_PERIOD,
            harvest_period: DEFAULT_HARVEST_PERIOD,
            max_metrics: DEFAULT_MAX_METRICS,
            sampling_target: 10,
            sampling_window: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
            retry_strategy: RetryStrategy::Immediate(1),
            compression_level: 3,
        }
    }
}

impl TracerConfig {
    /// Create configuration from `NEW_RELIC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let app_name = env::var("NEW_RELIC_APP_NAME").unwrap_or(defaults.app_name);
        let license_key = env::var("NEW_RELIC_LICENSE_KEY").ok();
        let collector_host = env::var("NEW_RELIC_HOST").unwrap_or(defaults.collector_host);
        let log_level = env::var("NEW_RELIC_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);
        let high_security = env_bool("NEW_RELIC_HIGH_SECURITY", false)?;

        let apdex_t = match env::var("NEW_RELIC_APDEX_T") {
            Ok(value) => {
                let secs: f64 = parse_value("NEW_RELIC_APDEX_T", &value)?;
                Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Parse {
                    key: "NEW_RELIC_APDEX_T",
                    value,
                    reason: e.to_string(),
                })?
            }
            Err(_) => defaults.apdex_t,
        };

        let mut transaction_tracer = TransactionTracerConfig {
            enabled: env_bool(
                "NEW_RELIC_TRANSACTION_TRACER_ENABLED",
                defaults.transaction_tracer.enabled,
            )?,
            ..TransactionTracerConfig::default()
        };
        if let Ok(value) = env::var("NEW_RELIC_TRANSACTION_TRACER_THRESHOLD") {
            transaction_tracer.threshold = parse_threshold(&value)?;
        }
        if let Ok(value) = env::var("NEW_RELIC_TRANSACTION_TRACER_RECORD_SQL") {
            transaction_tracer.record_sql =
                parse_value("NEW_RELIC_TRANSACTION_TRACER_RECORD_SQL", &value)?;
        }
        if let Ok(value) = env::var("NEW_RELIC_TRANSACTION_TRACER_EXPLAIN_THRESHOLD") {
            transaction_tracer.explain_threshold =
                parse_duration("NEW_RELIC_TRANSACTION_TRACER_EXPLAIN_THRESHOLD", &value)?;
        }
        if let Ok(value) = env::var("NEW_RELIC_TRANSACTION_TRACER_MIN_EXPENSIVE_NODE") {
            transaction_tracer.min_expensive_node =
                parse_duration("NEW_RELIC_TRANSACTION_TRACER_MIN_EXPENSIVE_NODE", &value)?;
        }

        let mut security = SecurityPolicy {
            custom_parameters: env_bool(
                "NEW_RELIC_SECURITY_POLICIES_CUSTOM_PARAMETERS",
                defaults.security.custom_parameters,
            )?,
            custom_events: env_bool(
                "NEW_RELIC_SECURITY_POLICIES_CUSTOM_EVENTS",
                defaults.security.custom_events,
            )?,
            allow_raw_exception_messages: env_bool(
                "NEW_RELIC_SECURITY_POLICIES_ALLOW_RAW_EXCEPTION_MESSAGES",
                defaults.security.allow_raw_exception_messages,
            )?,
            ..defaults.security.clone()
        };
        if let Ok(value) = env::var("NEW_RELIC_SECURITY_POLICIES_RECORD_SQL") {
            security.record_sql = parse_value("NEW_RELIC_SECURITY_POLICIES_RECORD_SQL", &value)?;
        }

        let mut attributes = AttributeConfig::default();
        if !env_bool("NEW_RELIC_ATTRIBUTES_ENABLED", true)? {
            attributes.disabled = Destinations::ALL;
        }
        for (key, include) in [
            ("NEW_RELIC_ATTRIBUTES_INCLUDE", true),
            ("NEW_RELIC_ATTRIBUTES_EXCLUDE", false),
        ] {
            if let Ok(value) = env::var(key) {
                attributes.rules.extend(parse_rules(&value, include));
            }
        }

        let mut event_limits = defaults.event_limits;
        for (key, slot) in [
            (
                "NEW_RELIC_CUSTOM_INSIGHTS_EVENTS_MAX_SAMPLES_STORED",
                &mut event_limits.custom_events,
            ),
            (
                "NEW_RELIC_TRANSACTION_EVENTS_MAX_SAMPLES_STORED",
                &mut event_limits.analytics_events,
            ),
            (
                "NEW_RELIC_SPAN_EVENTS_MAX_SAMPLES_STORED",
                &mut event_limits.span_events,
            ),
            (
                "NEW_RELIC_ERROR_COLLECTOR_MAX_EVENT_SAMPLES_STORED",
                &mut event_limits.error_events,
            ),
        ] {
            if let Ok(value) = env::var(key) {
                *slot = parse_value(key, &value)?;
            }
        }

        let config = Self {
            app_name,
            license_key,
            collector_host,
            log_level,
            high_security,
            security,
            apdex_t,
            transaction_tracer,
            attributes: Arc::new(attributes),
            distributed_tracing_enabled: env_bool(
                "NEW_RELIC_DISTRIBUTED_TRACING_ENABLED",
                defaults.distributed_tracing_enabled,
            )?,
            span_events_enabled: env_bool(
                "NEW_RELIC_SPAN_EVENTS_ENABLED",
                defaults.span_events_enabled,
            )?,
            event_limits,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::Invalid("app name cannot be empty".to_string()));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.apdex_t.is_zero() {
            return Err(ConfigError::Invalid(
                "apdex_t must be greater than 0".to_string(),
            ));
        }

        if self.event_harvest_period.is_zero() || self.event_harvest_period > self.harvest_period
        {
            return Err(ConfigError::Invalid(format!(
                "event harvest period {:?} must be non-zero and at most the harvest period {:?}",
                self.event_harvest_period, self.harvest_period
            )));
        }

        Ok(())
    }

    /// The policy actually enforced: local settings, narrowed by high
    /// security mode when it is on.
    pub fn effective_security(&self) -> SecurityPolicy {
        let mut policy = self.security.clone();
        if self.high_security {
            policy = policy.restrict(&SecurityPolicy::high_security());
        }
        policy
    }

    /// SQL capture mode after security settings are applied.
    pub fn effective_record_sql(&self) -> RecordSql {
        self.transaction_tracer
            .record_sql
            .min(self.effective_security().record_sql)
    }

    pub fn trace_threshold(&self) -> Duration {
        match self.transaction_tracer.threshold {
            TraceThreshold::ApdexF => self.apdex_t * 4,
            TraceThreshold::Fixed(threshold) => threshold,
        }
    }

    /// Scales a per-minute limit to one event harvest.
    pub fn per_harvest_capacity(&self, per_minute: usize) -> usize {
        let period_ms = self.event_harvest_period.as_millis();
        let scaled = (per_minute as u128 * period_ms) / 60_000;
        usize::try_from(scaled).unwrap_or(usize::MAX)
    }

    pub fn custom_events_capacity(&self) -> usize {
        if !self.effective_security().custom_events {
            return 0;
        }
        let per_minute = self
            .event_limits
            .custom_events
            .min(MAX_CUSTOM_EVENTS_PER_MINUTE);
        self.per_harvest_capacity(per_minute)
    }

    pub fn analytics_events_capacity(&self) -> usize {
        self.per_harvest_capacity(self.event_limits.analytics_events)
    }

    pub fn span_events_capacity(&self) -> usize {
        if !self.distributed_tracing_enabled || !self.span_events_enabled {
            return 0;
        }
        self.per_harvest_capacity(self.event_limits.span_events)
    }

    pub fn error_events_capacity(&self) -> usize {
        self.per_harvest_capacity(self.event_limits.error_events)
    }
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Ok(true),
            "0" | "false" | "off" | "no" => Ok(false),
            _ => Err(ConfigError::Parse {
                key,
                value,
                reason: "expected a boolean".to_string(),
            }),
        },
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Parse {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Accepts `250ms`, `2s` or a bare number of milliseconds.
fn parse_duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let trimmed = value.trim();
    if let Some(ms) = trimmed.strip_suffix("ms") {
        return parse_value::<u64>(key, ms).map(Duration::from_millis);
    }
    if let Some(secs) = trimmed.strip_suffix('s') {
        let secs: f64 = parse_value(key, secs)?;
        return Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Parse {
            key,
            value: value.to_string(),
            reason: e.to_string(),
        });
    }
    parse_value::<u64>(key, trimmed).map(Duration::from_millis)
}

fn parse_threshold(value: &str) -> Result<TraceThreshold, ConfigError> {
    if value.trim().eq_ignore_ascii_case("apdex_f") {
        return Ok(TraceThreshold::ApdexF);
    }
    parse_duration("NEW_RELIC_TRANSACTION_TRACER_THRESHOLD", value).map(TraceThreshold::Fixed)
}

fn parse_rules(value: &str, include: bool) -> Vec<AttributeRule> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| {
            if include {
                AttributeRule::include(pattern, Destinations::ALL)
            } else {
                AttributeRule::exclude(pattern, Destinations::ALL)
            }
        })
        .collect()
}
