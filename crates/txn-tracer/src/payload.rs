// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON shapes of the harvest payloads.
//!
//! - metrics: `[run_id, start, stop, [[{name, scope?}, [count, total, exclusive, min, max, sum_of_squares]], ...]]`
//! - events: `[run_id, {reservoir_size, events_seen}, [[intrinsics, user, agent], ...]]`,
//!   absent when the event kind is disabled
//! - traces: `[run_id, [[start, duration, name, uri, [root, string_table], guid, null, force_persist, null, synthetics_id], ...]]`
//!   where a segment is `[start, stop, name, attributes, [children]]`
//! - slow SQL: `[[txn_name, uri, sql_id, sql, metric_name, count, total, min, max, params], ...]`
//! - errors: `[run_id, [[timestamp, txn_name, message, class, attributes, guid], ...]]`

use crate::attributes::{AttributeMap, TypedScalar};
use crate::errors::PayloadError;
use crate::harvest::MetricsHarvest;
use crate::reservoir::ReservoirSnapshot;
use crate::segment::Segment;
use crate::sql::SlowSqlSample;
use crate::string_table::{parse_reference, StringTable};
use crate::transaction::{ErrorTrace, Event, TransactionTrace, ROOT_SEGMENT_NAME};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct MetricSpec<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct EventHeader {
    reservoir_size: usize,
    events_seen: u64,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[allow(clippy::cast_precision_loss)]
fn millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

pub fn encode_metrics(run_id: &str, harvest: &MetricsHarvest) -> Value {
    let metrics: Vec<Value> = harvest
        .metrics
        .iter()
        .map(|metric| {
            json!([
                MetricSpec {
                    name: &metric.name,
                    scope: metric.scope.as_deref(),
                },
                metric.data.to_array(),
            ])
        })
        .collect();
    json!([run_id, harvest.period_start, harvest.period_stop, metrics])
}

fn encode_event(event: &Event) -> Value {
    json!([event.intrinsics, event.user, event.agent])
}

/// `None` when the reservoir is disabled; the section is then left out of
/// the harvest rather than sent empty.
pub fn encode_events(run_id: &str, snapshot: Option<&ReservoirSnapshot<Event>>) -> Option<Value> {
    let snapshot = snapshot?;
    let events: Vec<Value> = snapshot.items.iter().map(encode_event).collect();
    Some(json!([
        run_id,
        EventHeader {
            reservoir_size: snapshot.reservoir_size,
            events_seen: snapshot.events_seen,
        },
        events,
    ]))
}

/// Encodes a segment tree, interning every name except the root's.
pub fn encode_segment(segment: &Segment, table: &mut StringTable) -> Value {
    let name = if segment.name == ROOT_SEGMENT_NAME {
        Value::from(ROOT_SEGMENT_NAME)
    } else {
        Value::from(table.reference(&segment.name))
    };
    let children: Vec<Value> = segment
        .children
        .iter()
        .map(|child| encode_segment(child, table))
        .collect();
    json!([
        millis(segment.start),
        millis(segment.stop),
        name,
        segment.attributes,
        children,
    ])
}

fn encode_trace(trace: &TransactionTrace) -> Value {
    let mut table = StringTable::new();
    let mut root = encode_segment(&trace.root, &mut table);
    // Transaction-level attributes ride on the root segment.
    if let Some(attributes) = root.get_mut(3).and_then(Value::as_object_mut) {
        for map in [
            &trace.agent_attributes,
            &trace.user_attributes,
            &trace.intrinsics,
        ] {
            for (key, value) in map {
                attributes
                    .entry(key.clone())
                    .or_insert_with(|| json!(value));
            }
        }
    }
    json!([
        trace.start_ms,
        millis(trace.duration),
        trace.name,
        trace.request_uri,
        [root, table],
        trace.guid,
        Value::Null,
        trace.force_persist,
        Value::Null,
        trace.synthetics_resource_id,
    ])
}

pub fn encode_traces(run_id: &str, traces: &[TransactionTrace]) -> Value {
    let traces: Vec<Value> = traces.iter().map(encode_trace).collect();
    json!([run_id, traces])
}

pub fn encode_slow_sqls(samples: &[SlowSqlSample]) -> Value {
    let rows: Vec<Value> = samples
        .iter()
        .map(|sample| {
            json!([
                sample.txn_name,
                sample.uri,
                sample.sql_id,
                sample.sql,
                sample.metric_name,
                sample.count,
                millis_f64(sample.total),
                millis_f64(sample.min),
                millis_f64(sample.max),
                sample.params,
            ])
        })
        .collect();
    Value::Array(rows)
}

pub fn encode_errors(run_id: &str, errors: &[ErrorTrace]) -> Value {
    let errors: Vec<Value> = errors
        .iter()
        .map(|error| {
            json!([
                error.timestamp_ms,
                error.txn_name,
                error.message,
                error.class,
                {
                    "stack_trace": [],
                    "agentAttributes": error.agent_attributes,
                    "userAttributes": error.user_attributes,
                    "intrinsics": error.intrinsics,
                    "request_uri": error.request_uri,
                },
                error.guid,
            ])
        })
        .collect();
    json!([run_id, errors])
}

/// Reads the `[root, string_table]` pair of an encoded trace back into a
/// segment tree.
pub fn decode_trace_data(value: &Value) -> Result<Segment, PayloadError> {
    let pair = value
        .as_array()
        .filter(|pair| pair.len() == 2)
        .ok_or_else(|| PayloadError::MalformedSegment("expected [root, string_table]".into()))?;
    let strings = pair[1]
        .as_array()
        .ok_or_else(|| PayloadError::MalformedSegment("string table is not an array".into()))?
        .iter()
        .map(|s| {
            s.as_str()
                .map(str::to_owned)
                .ok_or_else(|| PayloadError::MalformedSegment(format!("non-string entry {s}")))
        })
        .collect::<Result<Vec<String>, _>>()?;
    decode_segment(&pair[0], &StringTable::from_wire(strings))
}

/// Reads one encoded segment, resolving name back-references in `table`.
pub fn decode_segment(value: &Value, table: &StringTable) -> Result<Segment, PayloadError> {
    let malformed = |reason: &str| PayloadError::MalformedSegment(format!("{reason}: {value}"));
    let parts = value
        .as_array()
        .filter(|parts| parts.len() == 5)
        .ok_or_else(|| malformed("expected [start, stop, name, attributes, children]"))?;

    let start = decode_millis(&parts[0]).ok_or_else(|| malformed("bad start"))?;
    let stop = decode_millis(&parts[1]).ok_or_else(|| malformed("bad stop"))?;
    let raw_name = parts[2].as_str().ok_or_else(|| malformed("bad name"))?;
    let name = match parse_reference(raw_name) {
        Some(index) => table
            .get(index)
            .ok_or(PayloadError::UnknownReference(index))?,
        None => raw_name,
    };
    let attributes = decode_attributes(&parts[3]).ok_or_else(|| malformed("bad attributes"))?;
    let children = parts[4]
        .as_array()
        .ok_or_else(|| malformed("bad children"))?
        .iter()
        .map(|child| decode_segment(child, table))
        .collect::<Result<Vec<Segment>, _>>()?;

    let mut segment = Segment::new(name, start, stop).with_children(children);
    segment.attributes = attributes;
    Ok(segment)
}

fn decode_millis(value: &Value) -> Option<Duration> {
    if let Some(ms) = value.as_u64() {
        return Some(Duration::from_millis(ms));
    }
    value
        .as_f64()
        .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
}

fn decode_attributes(value: &Value) -> Option<AttributeMap> {
    let object: &Map<String, Value> = value.as_object()?;
    object
        .iter()
        .map(|(key, value)| {
            let scalar = match value {
                Value::String(s) => TypedScalar::String(s.clone()),
                Value::Bool(b) => TypedScalar::Bool(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => TypedScalar::Int(i),
                    None => TypedScalar::Float(n.as_f64()?),
                },
                _ => return None,
            };
            Some((key.clone(), scalar))
        })
        .collect()
}
