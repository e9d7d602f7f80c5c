// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One transaction from start to finalize.
//!
//! A [`TransactionTracer`] is owned by a single execution context. It
//! collects segments, attributes, custom metrics, custom events and errors
//! while the transaction runs; [`TransactionTracer::end`] turns all of it into
//! a [`FinalizedTransaction`] ready to be absorbed by the harvest.

use crate::attributes::{
    redact_message, AttributeConfig, AttributeMap, AttributeStore, Destinations, HostValue,
    TypedScalar, MAX_KEY_BYTES,
};
use crate::config::{RecordSql, SecurityPolicy, TracerConfig, MAX_CUSTOM_EVENTS_PER_MINUTE};
use crate::errors::{AttributeError, TracerError};
use crate::metric::{ApdexZone, Metric, MetricTable};
use crate::sampling::{InboundTrace, SamplingDecision, SamplingPolicy, TransactionSummary};
use crate::segment::{
    prune, DatastoreSegment, ExternalSegment, Segment, SegmentHandle, SegmentKind, SegmentTree,
};
use crate::sql::{captured_sql, SlowSqlParams, SlowSqlSample};
use rand::Rng;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const ROOT_SEGMENT_NAME: &str = "ROOT";
pub const SOFT_ERRORS_METRIC: &str = "Supportability/Transaction/SoftErrors";

const UNKNOWN_URI: &str = "<unknown>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Active,
    Ignored,
    Finalizing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Web,
    Background,
}

impl TransactionKind {
    fn prefix(self) -> &'static str {
        match self {
            TransactionKind::Web => "WebTransaction",
            TransactionKind::Background => "OtherTransaction",
        }
    }

    fn rollup(self) -> &'static str {
        match self {
            TransactionKind::Web => "WebTransaction",
            TransactionKind::Background => "OtherTransaction/all",
        }
    }

    fn all_suffix(self) -> &'static str {
        match self {
            TransactionKind::Web => "allWeb",
            TransactionKind::Background => "allOther",
        }
    }

    fn default_name(self) -> &'static str {
        match self {
            TransactionKind::Web => "Uri/unknown",
            TransactionKind::Background => "Custom/unknown",
        }
    }
}

/// Monotonic time source.
pub trait Clock: Debug + Send + Sync {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }

    pub fn set(&self, to: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An event with its three attribute categories. `type` and `timestamp`
/// live in the intrinsics.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub intrinsics: AttributeMap,
    pub user: AttributeMap,
    pub agent: AttributeMap,
}

impl Event {
    pub fn new(event_type: &str, timestamp_ms: u64) -> Self {
        let mut intrinsics = AttributeMap::new();
        intrinsics.insert("type".to_string(), event_type.into());
        intrinsics.insert(
            "timestamp".to_string(),
            TypedScalar::Int(i64::try_from(timestamp_ms).unwrap_or(i64::MAX)),
        );
        Self {
            intrinsics,
            user: AttributeMap::new(),
            agent: AttributeMap::new(),
        }
    }

    pub fn event_type(&self) -> Option<&str> {
        self.intrinsics.get("type").and_then(TypedScalar::as_str)
    }

    fn intrinsic(&mut self, key: &str, value: impl Into<TypedScalar>) {
        self.intrinsics.insert(key.to_owned(), value.into());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub message: String,
    pub class: String,
    pub at: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorTrace {
    pub timestamp_ms: u64,
    pub txn_name: String,
    pub message: String,
    pub class: String,
    pub request_uri: Option<String>,
    pub user_attributes: AttributeMap,
    pub agent_attributes: AttributeMap,
    pub intrinsics: AttributeMap,
    pub guid: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionTrace {
    pub start_ms: u64,
    pub duration: Duration,
    pub name: String,
    pub request_uri: Option<String>,
    pub root: Segment,
    pub guid: String,
    pub force_persist: bool,
    pub synthetics_resource_id: Option<String>,
    pub user_attributes: AttributeMap,
    pub agent_attributes: AttributeMap,
    pub intrinsics: AttributeMap,
}

/// Everything a finished transaction hands to the harvest.
#[derive(Debug)]
pub struct FinalizedTransaction {
    pub name: String,
    pub guid: String,
    pub duration: Duration,
    pub decision: SamplingDecision,
    pub metrics: MetricTable,
    pub analytics_event: Event,
    pub custom_events: Vec<Event>,
    pub span_events: Vec<Event>,
    pub error_event: Option<Event>,
    pub error_trace: Option<ErrorTrace>,
    pub trace: Option<TransactionTrace>,
    pub slow_sqls: Vec<SlowSqlSample>,
}

pub struct TransactionTracer {
    config: Arc<TracerConfig>,
    policy: SecurityPolicy,
    record_sql: RecordSql,
    sampler: Arc<dyn SamplingPolicy>,
    clock: Arc<dyn Clock>,
    kind: TransactionKind,
    state: TransactionState,
    guid: String,
    trace_id: String,
    name: String,
    request_uri: Option<String>,
    started_at: Duration,
    start_epoch: Duration,
    tree: SegmentTree,
    attributes: AttributeStore,
    metrics: MetricTable,
    custom_events: Vec<Event>,
    error: Option<ErrorInfo>,
    force_trace: bool,
    synthetics_resource_id: Option<String>,
    inbound: Option<InboundTrace>,
}

impl Debug for TransactionTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTracer")
            .field("guid", &self.guid)
            .field("name", &self.full_name())
            .field("state", &self.state)
            .field("segments", &self.tree.len())
            .finish_non_exhaustive()
    }
}

impl TransactionTracer {
    /// Creates an idle transaction; [`TransactionTracer::start`] activates it.
    pub fn new(
        config: Arc<TracerConfig>,
        sampler: Arc<dyn SamplingPolicy>,
        clock: Arc<dyn Clock>,
        kind: TransactionKind,
    ) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            policy: config.effective_security(),
            record_sql: config.effective_record_sql(),
            attributes: AttributeStore::new(Arc::clone(&config.attributes)),
            config,
            sampler,
            clock,
            kind,
            state: TransactionState::Idle,
            guid: generate_id(&mut rng),
            trace_id: format!("{}{}", generate_id(&mut rng), generate_id(&mut rng)),
            name: kind.default_name().to_string(),
            request_uri: None,
            started_at: Duration::ZERO,
            start_epoch: Duration::ZERO,
            tree: SegmentTree::new(ROOT_SEGMENT_NAME),
            metrics: MetricTable::default(),
            custom_events: Vec::new(),
            error: None,
            force_trace: false,
            synthetics_resource_id: None,
            inbound: None,
        }
    }

    pub fn start(&mut self) -> Result<(), TracerError> {
        if self.state != TransactionState::Idle {
            return Err(TracerError::AlreadyActive);
        }
        self.started_at = self.clock.now();
        self.start_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.state = TransactionState::Active;
        debug!("transaction {} started", self.guid);
        Ok(())
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// The full name, e.g. `WebTransaction/Action/list`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.kind.prefix(), self.name)
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.started_at)
    }

    pub fn soft_errors(&self) -> u64 {
        self.tree.soft_errors()
    }

    /// Recording is allowed while active and, discarded later, while ignored.
    fn ensure_recording(&self) -> Result<(), TracerError> {
        match self.state {
            TransactionState::Active | TransactionState::Ignored => Ok(()),
            actual => Err(TracerError::InvalidState {
                expected: TransactionState::Active,
                actual,
            }),
        }
    }

    /// Sets the name below the kind prefix, e.g. `Action/list`.
    pub fn set_name(&mut self, name: &str) -> Result<(), TracerError> {
        self.ensure_recording()?;
        let prefix = self.kind.prefix();
        let name = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(name)
            .trim_matches('/');
        if name.is_empty() {
            debug!("ignoring empty transaction name");
            return Ok(());
        }
        self.name = name.to_owned();
        Ok(())
    }

    pub fn set_request_uri(&mut self, uri: &str) -> Result<(), TracerError> {
        self.ensure_recording()?;
        self.request_uri = Some(uri.to_owned());
        self.attributes.set_agent(
            "request.uri",
            uri,
            Destinations::TXN_TRACE | Destinations::ERROR,
        )?;
        Ok(())
    }

    /// Marks the transaction as a synthetics request; its trace is always kept.
    pub fn set_synthetics_resource_id(&mut self, id: &str) -> Result<(), TracerError> {
        self.ensure_recording()?;
        self.synthetics_resource_id = Some(id.to_owned());
        Ok(())
    }

    pub fn force_trace(&mut self) -> Result<(), TracerError> {
        self.ensure_recording()?;
        self.force_trace = true;
        Ok(())
    }

    /// Continues an upstream trace. Returns `false` when distributed tracing
    /// is off or a trace was already accepted.
    pub fn accept_inbound_trace(&mut self, inbound: InboundTrace) -> Result<bool, TracerError> {
        self.ensure_recording()?;
        if !self.config.distributed_tracing_enabled || self.inbound.is_some() {
            return Ok(false);
        }
        if inbound.trace_id.is_empty() {
            debug!("inbound trace without a trace id, ignoring it");
            return Ok(false);
        }
        self.trace_id = inbound.trace_id.clone();
        self.inbound = Some(inbound);
        Ok(true)
    }

    pub fn start_segment(&mut self, name: &str) -> Result<SegmentHandle, TracerError> {
        self.start_kind(name, SegmentKind::Generic)
    }

    pub fn start_datastore_segment(
        &mut self,
        datastore: DatastoreSegment,
    ) -> Result<SegmentHandle, TracerError> {
        let name = datastore.metric_name();
        self.start_kind(&name, SegmentKind::Datastore(datastore))
    }

    pub fn start_external_segment(
        &mut self,
        external: ExternalSegment,
    ) -> Result<SegmentHandle, TracerError> {
        let name = external.metric_name();
        self.start_kind(&name, SegmentKind::External(external))
    }

    fn start_kind(&mut self, name: &str, kind: SegmentKind) -> Result<SegmentHandle, TracerError> {
        self.ensure_recording()?;
        let now = self.elapsed();
        self.tree.start_segment(name, kind, now)
    }

    pub fn stop_segment(&mut self, handle: SegmentHandle) -> Result<(), TracerError> {
        self.stop_segment_with(handle, AttributeMap::new())
    }

    pub fn stop_segment_with(
        &mut self,
        handle: SegmentHandle,
        attributes: AttributeMap,
    ) -> Result<(), TracerError> {
        self.ensure_recording()?;
        let now = self.elapsed();
        self.tree.stop_segment(handle, attributes, now)
    }

    pub fn current_segment(&self) -> SegmentHandle {
        self.tree.current()
    }

    pub fn add_custom_attribute(
        &mut self,
        key: HostValue,
        value: HostValue,
    ) -> Result<(), TracerError> {
        self.ensure_recording()?;
        self.attributes
            .set_user(key, value, Destinations::DEFAULT_USER, &self.policy)?;
        Ok(())
    }

    pub fn add_agent_attribute(
        &mut self,
        key: &str,
        value: impl Into<TypedScalar>,
        destinations: Destinations,
    ) -> Result<(), TracerError> {
        self.ensure_recording()?;
        self.attributes.set_agent(key, value, destinations)?;
        Ok(())
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    /// Records a custom metric in milliseconds.
    pub fn record_custom_metric(&mut self, name: &str, value_ms: f64) -> Result<(), TracerError> {
        self.ensure_recording()?;
        if !self.metrics.record_custom(name, value_ms) {
            return Err(AttributeError::NonFinite.into());
        }
        Ok(())
    }

    /// Metrics recorded so far in this transaction. Stopped segments are
    /// scoped to the current transaction name.
    pub fn get_metric_table(&self, scoped: bool) -> Vec<Metric> {
        let mut table = self.metrics.clone();
        let name = self.full_name();
        for subtree in self.tree.stopped_subtrees() {
            for segment in subtree.iter() {
                record_segment_metrics(&mut table, segment, &name, self.kind.all_suffix());
            }
        }
        table.metrics(scoped)
    }

    /// Queues a custom event. Non-scalar attribute values are skipped.
    pub fn record_custom_event<I>(&mut self, event_type: &str, attributes: I) -> Result<(), TracerError>
    where
        I: IntoIterator<Item = (String, HostValue)>,
    {
        self.ensure_recording()?;
        if !self.policy.custom_events {
            return Err(AttributeError::Blocked.into());
        }
        if !is_valid_event_type(event_type) {
            return Err(TracerError::InvalidEventType(event_type.to_owned()));
        }
        let limit = self
            .config
            .event_limits
            .custom_events
            .min(MAX_CUSTOM_EVENTS_PER_MINUTE);
        if self.custom_events.len() >= limit {
            debug!("custom event limit of {limit} reached for this transaction");
            return Ok(());
        }

        let mut event = Event::new(event_type, self.epoch_ms(self.elapsed()));
        for (key, value) in attributes {
            if key.is_empty() || key.len() > MAX_KEY_BYTES {
                debug!("skipping custom event attribute with invalid key '{key}'");
                continue;
            }
            match TypedScalar::try_from(value) {
                Ok(value) => {
                    event.user.insert(key, value.truncated());
                }
                Err(err) => debug!("skipping custom event attribute {key}: {err}"),
            }
        }
        self.custom_events.push(event);
        Ok(())
    }

    /// Keeps the most recent error.
    pub fn notice_error(&mut self, message: &str, class: &str) -> Result<(), TracerError> {
        self.ensure_recording()?;
        self.error = Some(ErrorInfo {
            message: message.to_owned(),
            class: class.to_owned(),
            at: self.elapsed(),
        });
        Ok(())
    }

    pub fn ignore(&mut self) -> Result<(), TracerError> {
        self.ensure_recording()?;
        self.state = TransactionState::Ignored;
        Ok(())
    }

    /// Closes the transaction without producing any output.
    pub fn discard(&mut self) -> Result<(), TracerError> {
        self.ensure_recording()?;
        self.state = TransactionState::Closed;
        debug!("transaction {} discarded", self.guid);
        Ok(())
    }

    /// Finalizes the transaction. Returns `None` when it was ignored.
    pub fn end(&mut self) -> Result<Option<FinalizedTransaction>, TracerError> {
        match self.state {
            TransactionState::Active => {}
            TransactionState::Ignored => {
                self.state = TransactionState::Closed;
                debug!("transaction {} ignored, dropping its data", self.guid);
                return Ok(None);
            }
            actual => {
                return Err(TracerError::InvalidState {
                    expected: TransactionState::Active,
                    actual,
                })
            }
        }
        self.state = TransactionState::Finalizing;

        let now = self.elapsed();
        let mut root = self.tree.finalize(now)?;
        annotate(&mut root, self.record_sql);

        let name = self.full_name();
        let duration = root.duration();
        let is_error = self.error.is_some();
        let decision = self.sampler.compute_sampling_decision(&TransactionSummary {
            name: &name,
            duration,
            is_error,
            inbound: self.inbound.as_ref(),
        });

        let metrics = self.build_metrics(&root, &name, is_error);
        let analytics_event = self.analytics_event(&root, &name, decision, is_error);
        let span_events = if self.config.distributed_tracing_enabled
            && self.config.span_events_enabled
            && decision.sampled
        {
            self.span_events(&root, &name, decision)
        } else {
            Vec::new()
        };
        let slow_sqls = self.slow_sqls(&root, &name);
        let (error_trace, error_event) = match self.error.take() {
            Some(error) => {
                let (trace, event) = self.error_outputs(error, &name, duration, decision);
                (Some(trace), Some(event))
            }
            None => (None, None),
        };
        let trace = self.trace(root, &name, decision);

        self.state = TransactionState::Closed;
        debug!(
            "transaction {} finalized: {name} in {duration:?}, sampled={}",
            self.guid, decision.sampled
        );

        Ok(Some(FinalizedTransaction {
            name,
            guid: self.guid.clone(),
            duration,
            decision,
            metrics,
            analytics_event,
            custom_events: std::mem::take(&mut self.custom_events),
            span_events,
            error_event,
            error_trace,
            trace,
            slow_sqls,
        }))
    }

    fn epoch_ms(&self, offset: Duration) -> u64 {
        u64::try_from((self.start_epoch + offset).as_millis()).unwrap_or(u64::MAX)
    }

    fn build_metrics(&mut self, root: &Segment, name: &str, is_error: bool) -> MetricTable {
        let mut metrics = std::mem::take(&mut self.metrics);
        let all = self.kind.all_suffix();

        for segment in root.iter().skip(1) {
            record_segment_metrics(&mut metrics, segment, name, all);
        }

        let duration = root.duration();
        let total_time = total_time(root);
        let suffix = &self.name;
        metrics.record_forced(self.kind.rollup(), None, duration, duration);
        metrics.record_forced(name, None, duration, duration);
        let total_prefix = format!("{}TotalTime", self.kind.prefix());
        metrics.record_forced(&total_prefix, None, total_time, total_time);
        metrics.record_forced(
            &format!("{total_prefix}/{suffix}"),
            None,
            total_time,
            total_time,
        );
        if self.kind == TransactionKind::Web {
            metrics.record_forced("HttpDispatcher", None, duration, duration);
            let zone = ApdexZone::classify(duration, self.config.apdex_t, is_error);
            metrics.record_apdex("Apdex", zone, self.config.apdex_t);
            metrics.record_apdex(&format!("Apdex/{suffix}"), zone, self.config.apdex_t);
        }

        if is_error {
            metrics.record_count("Errors/all", 1);
            metrics.record_count(&format!("Errors/{all}"), 1);
            metrics.record_count(&format!("Errors/{name}"), 1);
        }

        let soft_errors = self.tree.soft_errors();
        if soft_errors > 0 {
            metrics.record_count(SOFT_ERRORS_METRIC, soft_errors);
        }
        metrics
    }

    fn analytics_event(
        &self,
        root: &Segment,
        name: &str,
        decision: SamplingDecision,
        is_error: bool,
    ) -> Event {
        let duration = root.duration();
        let mut event = Event::new("Transaction", self.epoch_ms(Duration::ZERO));
        event.intrinsic("name", name);
        event.intrinsic("duration", duration.as_secs_f64());
        event.intrinsic("totalTime", total_time(root).as_secs_f64());
        event.intrinsic("guid", self.guid.as_str());
        event.intrinsic("traceId", self.trace_id.as_str());
        event.intrinsic("priority", decision.priority);
        event.intrinsic("sampled", decision.sampled);
        event.intrinsic("error", is_error);
        if self.kind == TransactionKind::Web {
            let zone = ApdexZone::classify(duration, self.config.apdex_t, is_error);
            event.intrinsic("nr.apdexPerfZone", zone_letter(zone));
        }
        if let Some(id) = &self.synthetics_resource_id {
            event.intrinsic("nr.syntheticsResourceId", id.as_str());
        }
        event.user = self
            .attributes
            .user_attributes(Destinations::TXN_EVENT, &self.policy);
        event.agent = self.attributes.agent_attributes(Destinations::TXN_EVENT);
        event
    }

    fn span_events(&self, root: &Segment, name: &str, decision: SamplingDecision) -> Vec<Event> {
        let mut rng = rand::thread_rng();
        let mut events = Vec::with_capacity(root.count());
        let inbound_parent = self
            .inbound
            .as_ref()
            .and_then(|inbound| inbound.parent_span_id.clone());
        let mut stack: Vec<(&Segment, Option<String>)> = vec![(root, inbound_parent)];

        while let Some((segment, parent_id)) = stack.pop() {
            let span_id = generate_id(&mut rng);
            let is_root = events.is_empty();
            let mut event = Event::new("Span", self.epoch_ms(segment.start));
            event.intrinsic("traceId", self.trace_id.as_str());
            event.intrinsic("guid", span_id.as_str());
            event.intrinsic("transactionId", self.guid.as_str());
            event.intrinsic("sampled", decision.sampled);
            event.intrinsic("priority", decision.priority);
            event.intrinsic("duration", segment.duration().as_secs_f64());
            if let Some(parent_id) = parent_id {
                event.intrinsic("parentId", parent_id);
            }

            if is_root {
                event.intrinsic("name", name);
                event.intrinsic("category", "generic");
                event.intrinsic("nr.entryPoint", true);
                event.user = self
                    .attributes
                    .user_attributes(Destinations::SPAN, &self.policy);
                event.agent = self.attributes.agent_attributes(Destinations::SPAN);
            } else {
                event.intrinsic("name", segment.name.as_str());
                match &segment.kind {
                    SegmentKind::Generic => event.intrinsic("category", "generic"),
                    SegmentKind::Datastore(datastore) => {
                        event.intrinsic("category", "datastore");
                        event.intrinsic("component", datastore.product.as_str());
                        event.intrinsic("span.kind", "client");
                    }
                    SegmentKind::External(external) => {
                        event.intrinsic("category", "http");
                        event.intrinsic("component", "http");
                        event.intrinsic("span.kind", "client");
                        if let Some(method) = &external.method {
                            event.intrinsic("http.method", method.as_str());
                        }
                    }
                }
                event.agent = segment.attributes.clone();
                self.config
                    .attributes
                    .retain_for(&mut event.agent, Destinations::SPAN);
            }

            for child in segment.children.iter().rev() {
                stack.push((child, Some(span_id.clone())));
            }
            events.push(event);
        }
        events
    }

    fn slow_sqls(&self, root: &Segment, name: &str) -> Vec<SlowSqlSample> {
        let tracer = &self.config.transaction_tracer;
        if !tracer.enabled || self.record_sql == RecordSql::Off {
            return Vec::new();
        }
        let uri = self.request_uri.as_deref().unwrap_or(UNKNOWN_URI);
        root.iter()
            .filter_map(|segment| {
                let SegmentKind::Datastore(datastore) = &segment.kind else {
                    return None;
                };
                if segment.duration() < tracer.explain_threshold {
                    return None;
                }
                let sql = captured_sql(datastore.query.as_deref()?, self.record_sql)?;
                Some(SlowSqlSample::new(
                    name,
                    uri,
                    sql,
                    &datastore.metric_name(),
                    segment.duration(),
                    SlowSqlParams {
                        backtrace: Vec::new(),
                        host: datastore.host.clone(),
                        port_path_or_id: datastore.port_path_or_id.clone(),
                        database_name: datastore.database_name.clone(),
                        explain_plan: None,
                    },
                ))
            })
            .collect()
    }

    fn error_outputs(
        &self,
        error: ErrorInfo,
        name: &str,
        duration: Duration,
        decision: SamplingDecision,
    ) -> (ErrorTrace, Event) {
        let message = redact_message(&error.message, &self.policy);
        let timestamp_ms = self.epoch_ms(error.at);
        let user = self
            .attributes
            .user_attributes(Destinations::ERROR, &self.policy);
        let agent = self.attributes.agent_attributes(Destinations::ERROR);

        let mut event = Event::new("TransactionError", timestamp_ms);
        event.intrinsic("error.class", error.class.as_str());
        event.intrinsic("error.message", message.as_str());
        event.intrinsic("transactionName", name);
        event.intrinsic("duration", duration.as_secs_f64());
        event.intrinsic("nr.transactionGuid", self.guid.as_str());
        event.intrinsic("traceId", self.trace_id.as_str());
        event.intrinsic("priority", decision.priority);
        event.intrinsic("sampled", decision.sampled);
        event.user = user.clone();
        event.agent = agent.clone();

        let mut intrinsics = AttributeMap::new();
        intrinsics.insert("guid".to_string(), self.guid.as_str().into());
        intrinsics.insert("traceId".to_string(), self.trace_id.as_str().into());
        intrinsics.insert("priority".to_string(), decision.priority.into());
        intrinsics.insert("sampled".to_string(), decision.sampled.into());

        let trace = ErrorTrace {
            timestamp_ms,
            txn_name: name.to_owned(),
            message,
            class: error.class,
            request_uri: self.request_uri.clone(),
            user_attributes: user,
            agent_attributes: agent,
            intrinsics,
            guid: self.guid.clone(),
        };
        (trace, event)
    }

    fn trace(
        &self,
        mut root: Segment,
        name: &str,
        decision: SamplingDecision,
    ) -> Option<TransactionTrace> {
        let tracer = &self.config.transaction_tracer;
        let duration = root.duration();
        let force_persist = self.force_trace || self.synthetics_resource_id.is_some();
        if !tracer.enabled || !(force_persist || duration > self.config.trace_threshold()) {
            return None;
        }
        route_segment_attributes(&mut root, &self.config.attributes);

        let mut intrinsics = AttributeMap::new();
        intrinsics.insert("guid".to_string(), self.guid.as_str().into());
        intrinsics.insert("traceId".to_string(), self.trace_id.as_str().into());
        intrinsics.insert("priority".to_string(), decision.priority.into());
        intrinsics.insert("sampled".to_string(), decision.sampled.into());
        intrinsics.insert(
            "totalTime".to_string(),
            total_time(&root).as_secs_f64().into(),
        );

        Some(TransactionTrace {
            start_ms: self.epoch_ms(Duration::ZERO),
            duration,
            name: name.to_owned(),
            request_uri: self.request_uri.clone(),
            root: prune(root, tracer.min_expensive_node),
            guid: self.guid.clone(),
            force_persist,
            synthetics_resource_id: self.synthetics_resource_id.clone(),
            user_attributes: self
                .attributes
                .user_attributes(Destinations::TXN_TRACE, &self.policy),
            agent_attributes: self.attributes.agent_attributes(Destinations::TXN_TRACE),
            intrinsics,
        })
    }
}

fn route_segment_attributes(segment: &mut Segment, config: &AttributeConfig) {
    config.retain_for(&mut segment.attributes, Destinations::TXN_SEGMENT);
    for child in &mut segment.children {
        route_segment_attributes(child, config);
    }
}

/// Records the scoped metric of one segment plus its unscoped rollups.
fn record_segment_metrics(metrics: &mut MetricTable, segment: &Segment, scope: &str, all: &str) {
    let duration = segment.duration();
    let exclusive = segment.exclusive();
    match &segment.kind {
        SegmentKind::Generic => {
            metrics.record(&segment.name, Some(scope), duration, exclusive);
        }
        SegmentKind::Datastore(datastore) => {
            metrics.record(&datastore.metric_name(), Some(scope), duration, exclusive);
            if datastore.statement_metric().is_some() {
                metrics.record(&datastore.operation_metric(), None, duration, exclusive);
            }
            let product = &datastore.product;
            for rollup in [
                "Datastore/all".to_string(),
                format!("Datastore/{all}"),
                format!("Datastore/{product}/all"),
                format!("Datastore/{product}/{all}"),
            ] {
                metrics.record(&rollup, None, duration, exclusive);
            }
        }
        SegmentKind::External(external) => {
            metrics.record(&external.metric_name(), Some(scope), duration, exclusive);
            metrics.record("External/all", None, duration, exclusive);
            metrics.record(&format!("External/{all}"), None, duration, exclusive);
        }
    }
}

/// Adds the captured details of datastore and external calls as segment
/// attributes.
fn annotate(segment: &mut Segment, record_sql: RecordSql) {
    match &segment.kind {
        SegmentKind::Generic => {}
        SegmentKind::Datastore(datastore) => {
            let attributes = &mut segment.attributes;
            if let Some(sql) = datastore
                .query
                .as_deref()
                .and_then(|query| captured_sql(query, record_sql))
            {
                attributes.insert("sql".to_string(), sql.into());
            }
            for (key, value) in [
                ("host", &datastore.host),
                ("port_path_or_id", &datastore.port_path_or_id),
                ("database_name", &datastore.database_name),
            ] {
                if let Some(value) = value {
                    attributes.insert(key.to_string(), value.as_str().into());
                }
            }
        }
        SegmentKind::External(external) => {
            segment
                .attributes
                .insert("uri".to_string(), external.uri.as_str().into());
            if let Some(method) = &external.method {
                segment
                    .attributes
                    .insert("procedure".to_string(), method.as_str().into());
            }
        }
    }
    for child in &mut segment.children {
        annotate(child, record_sql);
    }
}

fn total_time(root: &Segment) -> Duration {
    root.iter().map(Segment::exclusive).sum()
}

fn zone_letter(zone: ApdexZone) -> &'static str {
    match zone {
        ApdexZone::Satisfying => "S",
        ApdexZone::Tolerating => "T",
        ApdexZone::Frustrating => "F",
    }
}

fn is_valid_event_type(event_type: &str) -> bool {
    !event_type.is_empty()
        && event_type.len() <= MAX_KEY_BYTES
        && event_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | ' '))
}

fn generate_id<R: Rng>(rng: &mut R) -> String {
    format!("{:016x}", rng.gen::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeRule;
    use crate::config::TraceThreshold;
    use crate::sampling::ConstantSampler;

    struct Fixture {
        clock: Arc<ManualClock>,
        txn: TransactionTracer,
    }

    fn fixture_with(config: TracerConfig, kind: TransactionKind) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let mut txn = TransactionTracer::new(
            Arc::new(config),
            Arc::new(ConstantSampler { sampled: true }),
            clock.clone(),
            kind,
        );
        txn.start().expect("start");
        Fixture { clock, txn }
    }

    fn fixture() -> Fixture {
        fixture_with(TracerConfig::default(), TransactionKind::Web)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_state_machine() {
        let Fixture { mut txn, .. } = fixture();
        assert_eq!(txn.state(), TransactionState::Active);
        assert_eq!(txn.start(), Err(TracerError::AlreadyActive));

        txn.ignore().expect("ignore");
        assert_eq!(txn.state(), TransactionState::Ignored);
        assert!(txn.start_segment("still accepted").is_ok());
        assert!(txn.end().expect("end").is_none());
        assert_eq!(txn.state(), TransactionState::Closed);

        assert_eq!(
            txn.start_segment("late"),
            Err(TracerError::InvalidState {
                expected: TransactionState::Active,
                actual: TransactionState::Closed,
            })
        );
        assert!(txn.end().is_err());
    }

    #[test]
    fn test_segment_and_rollup_metrics() {
        let Fixture { clock, mut txn } = fixture();
        txn.set_name("Action/list").expect("name");
        let outer = txn.start_segment("Custom/outer").expect("outer");
        clock.advance(ms(100));
        let inner = txn.start_segment("Custom/inner").expect("inner");
        clock.advance(ms(300));
        txn.stop_segment(inner).expect("stop inner");
        clock.advance(ms(100));
        txn.stop_segment(outer).expect("stop outer");
        clock.advance(ms(100));

        let finalized = txn.end().expect("end").expect("output");
        let name = "WebTransaction/Action/list";
        assert_eq!(finalized.name, name);
        assert_eq!(finalized.duration, ms(600));

        let metrics = &finalized.metrics;
        let outer = metrics.get("Custom/outer", Some(name)).expect("scoped");
        assert_eq!(outer.count, 1);
        assert!((outer.total - 0.5).abs() < 1e-9);
        assert!((outer.exclusive - 0.2).abs() < 1e-9);
        assert!(metrics.get("Custom/outer", None).is_some());
        assert!(metrics.get("Custom/inner", Some(name)).is_some());

        for rollup in [
            "WebTransaction",
            name,
            "HttpDispatcher",
            "WebTransactionTotalTime",
            "WebTransactionTotalTime/Action/list",
        ] {
            let data = metrics.get(rollup, None).expect(rollup);
            assert!((data.total - 0.6).abs() < 1e-9, "{rollup}");
        }
        // 600ms against apdex_t 500ms is tolerating.
        let apdex = metrics.get("Apdex", None).expect("apdex");
        assert_eq!(apdex.to_array(), [0.0, 1.0, 0.0, 0.5, 0.5, 0.0]);
        assert!(metrics.get("Apdex/Action/list", None).is_some());
        assert!(metrics.get("Errors/all", None).is_none());
    }

    #[test]
    fn test_background_rollups_and_errors() {
        let Fixture { clock, mut txn } =
            fixture_with(TracerConfig::default(), TransactionKind::Background);
        txn.set_name("OtherTransaction/Job/reindex").expect("name");
        clock.advance(ms(20));
        txn.notice_error("first", "RuntimeException").expect("error");
        txn.notice_error("disk full", "IOException").expect("error");

        let finalized = txn.end().expect("end").expect("output");
        let name = "OtherTransaction/Job/reindex";
        let metrics = &finalized.metrics;
        assert!(metrics.get("OtherTransaction/all", None).is_some());
        assert!(metrics.get("OtherTransactionTotalTime/Job/reindex", None).is_some());
        assert!(metrics.get("HttpDispatcher", None).is_none());
        assert!(metrics.get("Apdex", None).is_none());
        assert_eq!(metrics.get("Errors/all", None).map(|d| d.count), Some(1));
        assert!(metrics.get("Errors/allOther", None).is_some());
        assert!(metrics.get(&format!("Errors/{name}"), None).is_some());

        let trace = finalized.error_trace.expect("error trace");
        assert_eq!(trace.message, "disk full");
        assert_eq!(trace.class, "IOException");
        let event = finalized.error_event.expect("error event");
        assert_eq!(event.event_type(), Some("TransactionError"));
        assert_eq!(
            event.intrinsics.get("error.class"),
            Some(&TypedScalar::from("IOException"))
        );
    }

    #[test]
    fn test_error_message_redacted_in_high_security() {
        let config = TracerConfig {
            high_security: true,
            ..TracerConfig::default()
        };
        let Fixture { mut txn, .. } = fixture_with(config, TransactionKind::Web);
        txn.notice_error("password=hunter2", "AuthError").expect("error");
        assert_eq!(
            txn.add_custom_attribute("user".into(), "bob".into()),
            Err(TracerError::Attribute(AttributeError::Blocked))
        );

        let finalized = txn.end().expect("end").expect("output");
        let trace = finalized.error_trace.expect("error trace");
        assert_eq!(trace.message, crate::attributes::REDACTED_MESSAGE);
        assert!(finalized.analytics_event.user.is_empty());
    }

    #[test]
    fn test_trace_eligibility() {
        let config = TracerConfig {
            transaction_tracer: crate::config::TransactionTracerConfig {
                threshold: TraceThreshold::Fixed(ms(100)),
                ..Default::default()
            },
            ..TracerConfig::default()
        };

        let Fixture { clock, mut txn } = fixture_with(config.clone(), TransactionKind::Web);
        clock.advance(ms(50));
        assert!(txn.end().expect("end").expect("output").trace.is_none());

        let Fixture { clock, mut txn } = fixture_with(config.clone(), TransactionKind::Web);
        clock.advance(ms(150));
        let trace = txn.end().expect("end").expect("output").trace.expect("trace");
        assert!(!trace.force_persist);
        assert_eq!(trace.root.name, ROOT_SEGMENT_NAME);

        let Fixture { clock, mut txn } = fixture_with(config, TransactionKind::Web);
        txn.set_synthetics_resource_id("synth-1").expect("synthetics");
        clock.advance(ms(1));
        let finalized = txn.end().expect("end").expect("output");
        let trace = finalized.trace.expect("forced trace");
        assert!(trace.force_persist);
        assert_eq!(trace.synthetics_resource_id.as_deref(), Some("synth-1"));
        assert_eq!(
            finalized
                .analytics_event
                .intrinsics
                .get("nr.syntheticsResourceId"),
            Some(&TypedScalar::from("synth-1"))
        );
    }

    #[test]
    fn test_open_segments_closed_at_end() {
        let Fixture { clock, mut txn } = fixture();
        txn.force_trace().expect("force");
        txn.start_segment("Custom/never_stopped").expect("start");
        clock.advance(ms(40));

        let trace = txn.end().expect("end").expect("output").trace.expect("trace");
        assert_eq!(trace.root.children.len(), 1);
        assert_eq!(trace.root.children[0].stop, ms(40));
    }

    #[test]
    fn test_double_stop_counts_soft_error() {
        let Fixture { mut txn, .. } = fixture();
        let segment = txn.start_segment("Custom/once").expect("start");
        txn.stop_segment(segment).expect("stop");
        assert_eq!(
            txn.stop_segment(segment),
            Err(TracerError::AlreadyStopped(segment.index()))
        );
        assert_eq!(txn.soft_errors(), 1);

        let finalized = txn.end().expect("end").expect("output");
        assert_eq!(
            finalized.metrics.get(SOFT_ERRORS_METRIC, None).map(|d| d.count),
            Some(1)
        );
    }

    #[test]
    fn test_datastore_segment_outputs() {
        let Fixture { clock, mut txn } = fixture();
        txn.set_request_uri("/users").expect("uri");
        let query = txn
            .start_datastore_segment(DatastoreSegment {
                product: "MySQL".to_string(),
                collection: Some("users".to_string()),
                operation: "select".to_string(),
                query: Some("SELECT * FROM users WHERE id = 7".to_string()),
                host: Some("db1".to_string()),
                ..Default::default()
            })
            .expect("start");
        clock.advance(ms(700));
        txn.stop_segment(query).expect("stop");

        let finalized = txn.end().expect("end").expect("output");
        let metrics = &finalized.metrics;
        let scope = finalized.name.as_str();
        assert!(metrics
            .get("Datastore/statement/MySQL/users/select", Some(scope))
            .is_some());
        for name in [
            "Datastore/operation/MySQL/select",
            "Datastore/all",
            "Datastore/allWeb",
            "Datastore/MySQL/all",
            "Datastore/MySQL/allWeb",
        ] {
            assert!(metrics.get(name, None).is_some(), "{name}");
        }

        assert_eq!(finalized.slow_sqls.len(), 1);
        let slow = &finalized.slow_sqls[0];
        assert_eq!(slow.sql, "SELECT * FROM users WHERE id = ?");
        assert_eq!(slow.uri, "/users");
        assert_eq!(slow.params.host.as_deref(), Some("db1"));

        let span = finalized
            .span_events
            .iter()
            .find(|span| span.intrinsics.get("category") == Some(&TypedScalar::from("datastore")))
            .expect("datastore span");
        assert_eq!(
            span.agent.get("sql"),
            Some(&TypedScalar::from("SELECT * FROM users WHERE id = ?"))
        );
    }

    #[test]
    fn test_segment_attributes_follow_exclude_rules() {
        let config = TracerConfig {
            attributes: Arc::new(AttributeConfig {
                disabled: Destinations::NONE,
                rules: vec![AttributeRule::exclude("sql", Destinations::ALL)],
            }),
            ..TracerConfig::default()
        };
        let Fixture { clock, mut txn } = fixture_with(config, TransactionKind::Web);
        txn.force_trace().expect("force");
        let query = txn
            .start_datastore_segment(DatastoreSegment {
                product: "MySQL".to_string(),
                operation: "select".to_string(),
                query: Some("SELECT * FROM users WHERE id = 7".to_string()),
                host: Some("db1".to_string()),
                ..Default::default()
            })
            .expect("start");
        clock.advance(ms(700));
        txn.stop_segment(query).expect("stop");

        let finalized = txn.end().expect("end").expect("output");
        let span = finalized
            .span_events
            .iter()
            .find(|span| span.intrinsics.get("category") == Some(&TypedScalar::from("datastore")))
            .expect("datastore span");
        assert!(!span.agent.contains_key("sql"));
        assert_eq!(span.agent.get("host"), Some(&TypedScalar::from("db1")));

        let trace = finalized.trace.expect("forced trace");
        let segment = trace
            .root
            .iter()
            .find(|segment| matches!(segment.kind, SegmentKind::Datastore(_)))
            .expect("datastore segment");
        assert!(!segment.attributes.contains_key("sql"));
        assert!(segment.attributes.contains_key("host"));
        assert_eq!(finalized.slow_sqls.len(), 1);
    }

    #[test]
    fn test_span_events_follow_tree() {
        let Fixture { clock, mut txn } = fixture();
        let external = txn
            .start_external_segment(ExternalSegment {
                host: "api.example.com".to_string(),
                method: Some("GET".to_string()),
                uri: "https://api.example.com/v1".to_string(),
            })
            .expect("start");
        clock.advance(ms(10));
        txn.stop_segment(external).expect("stop");

        let finalized = txn.end().expect("end").expect("output");
        assert!(finalized
            .metrics
            .get("External/api.example.com/all", Some(finalized.name.as_str()))
            .is_some());
        assert!(finalized.metrics.get("External/allWeb", None).is_some());

        let spans = &finalized.span_events;
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].intrinsics.get("nr.entryPoint"), Some(&TypedScalar::Bool(true)));
        assert!(spans[0].intrinsics.get("parentId").is_none());
        assert_eq!(
            spans[1].intrinsics.get("parentId"),
            spans[0].intrinsics.get("guid")
        );
        assert_eq!(
            spans[1].intrinsics.get("http.method"),
            Some(&TypedScalar::from("GET"))
        );
    }

    #[test]
    fn test_unsampled_transaction_has_no_spans() {
        let clock = Arc::new(ManualClock::default());
        let mut txn = TransactionTracer::new(
            Arc::new(TracerConfig::default()),
            Arc::new(ConstantSampler { sampled: false }),
            clock,
            TransactionKind::Web,
        );
        txn.start().expect("start");
        txn.start_segment("Custom/a").expect("segment");
        let finalized = txn.end().expect("end").expect("output");
        assert!(finalized.span_events.is_empty());
        assert!(!finalized.decision.sampled);
    }

    #[test]
    fn test_inbound_trace_id_is_kept() {
        let Fixture { mut txn, .. } = fixture();
        let inbound = InboundTrace {
            trace_id: "0af7651916cd43dd8448eb211c80319c".to_string(),
            parent_span_id: Some("b7ad6b7169203331".to_string()),
            priority: Some(1.25),
            sampled: Some(true),
        };
        assert_eq!(txn.accept_inbound_trace(inbound.clone()), Ok(true));
        assert_eq!(txn.accept_inbound_trace(inbound), Ok(false));
        assert_eq!(txn.trace_id(), "0af7651916cd43dd8448eb211c80319c");

        let finalized = txn.end().expect("end").expect("output");
        assert_eq!(finalized.decision.priority, 1.25);
        assert_eq!(
            finalized.span_events[0].intrinsics.get("parentId"),
            Some(&TypedScalar::from("b7ad6b7169203331"))
        );
    }

    #[test]
    fn test_custom_events() {
        let Fixture { mut txn, .. } = fixture();
        txn.record_custom_event(
            "Purchase",
            vec![
                ("amount".to_string(), HostValue::Double(9.5)),
                ("tags".to_string(), HostValue::Array(vec![])),
            ],
        )
        .expect("event");
        assert_eq!(
            txn.record_custom_event("bad-type!", Vec::new()),
            Err(TracerError::InvalidEventType("bad-type!".to_string()))
        );

        let finalized = txn.end().expect("end").expect("output");
        assert_eq!(finalized.custom_events.len(), 1);
        let event = &finalized.custom_events[0];
        assert_eq!(event.event_type(), Some("Purchase"));
        assert_eq!(event.user.get("amount"), Some(&TypedScalar::Float(9.5)));
        assert!(!event.user.contains_key("tags"));
    }

    #[test]
    fn test_custom_metric_and_metric_table() {
        let Fixture { mut txn, .. } = fixture();
        for value in [1000.0, 4000.0, 2000.0] {
            txn.record_custom_metric("Custom/latency", value).expect("metric");
        }
        assert!(txn.record_custom_metric("Custom/latency", f64::NAN).is_err());

        let unscoped = txn.get_metric_table(false);
        assert_eq!(unscoped.len(), 1);
        assert_eq!(
            unscoped[0].data.to_array(),
            [3.0, 7.0, 7.0, 1.0, 4.0, 21.0]
        );
        assert!(txn.get_metric_table(true).is_empty());
    }

    #[test]
    fn test_metric_table_includes_stopped_segments() {
        let Fixture { clock, mut txn } = fixture();
        txn.set_name("Action/list").expect("name");
        let work = txn.start_segment("Custom/work").expect("segment");
        clock.advance(ms(30));
        let running = txn.start_segment("Custom/running").expect("segment");
        assert!(txn.get_metric_table(true).is_empty());

        clock.advance(ms(10));
        txn.stop_segment(running).expect("stop");
        txn.stop_segment(work).expect("stop");

        let scoped = txn.get_metric_table(true);
        let work = scoped
            .iter()
            .find(|m| m.name == "Custom/work")
            .expect("scoped metric");
        assert_eq!(work.scope.as_deref(), Some("WebTransaction/Action/list"));
        assert_eq!(work.data.count, 1);
        assert!(scoped.iter().any(|m| m.name == "Custom/running"));
        assert!(txn.get_metric_table(false).is_empty());

        // Reading the live table leaves the finalized metrics unchanged.
        let finalized = txn.end().expect("end").expect("output");
        let data = finalized
            .metrics
            .get("Custom/work", Some("WebTransaction/Action/list"))
            .expect("finalized");
        assert_eq!(data.count, 1);
    }

    #[test]
    fn test_discard_produces_nothing() {
        let Fixture { mut txn, .. } = fixture();
        txn.discard().expect("discard");
        assert_eq!(txn.state(), TransactionState::Closed);
        assert!(txn.end().is_err());
    }
}
