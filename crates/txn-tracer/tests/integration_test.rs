// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{agent, ms, started_tracer};
use mockito::{Matcher, Server};
use std::sync::Arc;
use txn_tracer::attributes::HostValue;
use txn_tracer::collector::{Collector, HarvestMethod, HttpCollector, RetryStrategy};
use txn_tracer::config::{EventLimits, TracerConfig};
use txn_tracer::context;
use txn_tracer::harvest::{EventKind, HarvestCycle};
use txn_tracer::harvester::Harvester;
use txn_tracer::payload;
use txn_tracer::transaction::TransactionKind;

#[test]
fn custom_events_are_sampled_down_to_harvest_capacity() {
    let config = TracerConfig {
        event_limits: EventLimits {
            custom_events: 100_000,
            ..EventLimits::default()
        },
        ..TracerConfig::default()
    };
    let (agent, _clock) = agent(config);

    let guard = agent
        .begin_transaction(TransactionKind::Background)
        .expect("begin");
    for i in 0..20_000_i64 {
        assert!(context::record_custom_event(
            "Purchase",
            vec![("index".to_string(), HostValue::Long(i))],
        ));
    }
    drop(guard);

    let harvest = agent.harvest();
    assert_eq!(harvest.events_seen(EventKind::Custom), 20_000);
    let snapshot = harvest.drain_events(EventKind::Custom).expect("enabled");
    assert_eq!(snapshot.events_seen, 20_000);
    assert_eq!(snapshot.reservoir_size, 8_333);
    assert_eq!(snapshot.items.len(), 8_333);

    let encoded = payload::encode_events("run-1", Some(&snapshot)).expect("section");
    assert_eq!(encoded[1]["events_seen"], 20_000);
    assert_eq!(encoded[2].as_array().map(Vec::len), Some(8_333));
}

#[test]
fn ignored_transaction_contributes_nothing() {
    let (agent, clock) = agent(TracerConfig::default());

    let _guard = agent
        .begin_transaction(TransactionKind::Web)
        .expect("begin");
    let segment = context::start_segment("Custom/work").expect("segment");
    clock.advance(ms(30));
    context::stop_segment(segment);
    context::record_custom_metric("Custom/metric", 12.0);
    context::record_custom_event("Purchase", Vec::new());
    context::notice_error("boom", "RuntimeError");
    assert!(context::ignore_transaction());
    assert!(context::end_transaction(true));
    assert!(!context::is_transaction_active());

    let harvest = agent.harvest();
    assert!(harvest.drain_metrics().metrics.is_empty());
    for kind in EventKind::ALL {
        assert_eq!(harvest.events_seen(kind), 0, "{kind:?}");
    }
    assert!(harvest.drain_traces().is_empty());
    assert!(harvest.drain_error_traces().is_empty());
}

#[test]
fn encoded_trace_reads_back_in_pre_order() {
    let (mut txn, clock) = started_tracer(TracerConfig::default());
    txn.set_name("Action/checkout").expect("name");
    txn.force_trace().expect("force");

    let older = txn.start_segment("older").expect("older");
    clock.advance(ms(10));
    let grandchild = txn.start_segment("grandchild").expect("grandchild");
    clock.advance(ms(5));
    txn.stop_segment(grandchild).expect("stop grandchild");
    txn.stop_segment(older).expect("stop older");
    let younger = txn.start_segment("younger").expect("younger");
    clock.advance(ms(20));
    txn.stop_segment(younger).expect("stop younger");

    let trace = txn
        .end()
        .expect("end")
        .expect("output")
        .trace
        .expect("forced trace");
    let encoded = payload::encode_traces("run-1", std::slice::from_ref(&trace));
    let sample = &encoded[1][0];
    assert_eq!(sample[2], "WebTransaction/Action/checkout");
    assert_eq!(sample[7], true);

    let root = payload::decode_trace_data(&sample[4]).expect("decode");
    let names: Vec<&str> = root.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["ROOT", "older", "grandchild", "younger"]);
    assert_eq!(root.children[0].stop, ms(15));
    assert_eq!(root.children[1].start, ms(15));
    assert_eq!(root.stop, ms(35));
}

#[test]
fn zero_capacity_leaves_section_out() {
    let config = TracerConfig {
        span_events_enabled: false,
        event_limits: EventLimits {
            error_events: 0,
            ..EventLimits::default()
        },
        ..TracerConfig::default()
    };
    let (agent, _clock) = agent(config);
    let guard = agent
        .begin_transaction(TransactionKind::Web)
        .expect("begin");
    context::notice_error("boom", "RuntimeError");
    drop(guard);

    let harvest = agent.harvest();
    for kind in [EventKind::Span, EventKind::Error] {
        assert!(payload::encode_events("run-1", harvest.drain_events(kind).as_ref()).is_none());
    }
    let analytics = harvest.drain_events(EventKind::Analytics);
    assert!(payload::encode_events("run-1", analytics.as_ref()).is_some());
}

fn collector_config(host: String, retry_strategy: RetryStrategy) -> TracerConfig {
    TracerConfig {
        collector_host: host,
        license_key: Some("mock-license-key".to_string()),
        retry_strategy,
        ..TracerConfig::default()
    }
}

fn metric_query() -> Matcher {
    Matcher::AllOf(vec![
        Matcher::UrlEncoded("method".into(), "metric_data".into()),
        Matcher::UrlEncoded("run_id".into(), "run-1".into()),
    ])
}

#[tokio::test]
async fn collector_ships_compressed_payload() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/agent_listener/invoke_raw_method")
        .match_query(metric_query())
        .match_header("Content-Encoding", "zstd")
        .match_header("Content-Type", "application/json")
        .match_header("X-License-Key", "mock-license-key")
        .with_status(200)
        .create_async()
        .await;

    let config = collector_config(server.url(), RetryStrategy::Immediate(1));
    let collector = HttpCollector::new(&config, "run-1").expect("collector");
    let result = collector
        .send(HarvestMethod::MetricData, &serde_json::json!(["run-1", 0, 60, []]))
        .await;

    assert!(result.is_ok(), "{result:?}");
    mock.assert_async().await;
}

#[tokio::test]
async fn collector_retries_server_errors_and_harvester_merges_metrics_back() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/agent_listener/invoke_raw_method")
        .match_query(metric_query())
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let config = collector_config(server.url(), RetryStrategy::Immediate(3));
    let (agent, clock) = agent(config.clone());
    let guard = agent
        .begin_transaction(TransactionKind::Web)
        .expect("begin");
    clock.advance(ms(10));
    assert!(context::record_custom_metric("Custom/work", 40.0));
    drop(guard);

    let collector: Arc<dyn Collector> =
        Arc::new(HttpCollector::new(&config, "run-1").expect("collector"));
    let harvester = Harvester::new(agent.harvest().clone(), collector, &config, "run-1");
    harvester.harvest_metrics().await;
    mock.assert_async().await;

    let pending = agent.harvest().drain_metrics();
    let work = pending
        .metrics
        .iter()
        .find(|m| m.name == "Custom/work")
        .expect("metric kept for the next harvest");
    assert_eq!(work.data.count, 1);
}

#[tokio::test]
async fn collector_does_not_retry_client_errors() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/agent_listener/invoke_raw_method")
        .match_query(metric_query())
        .with_status(413)
        .expect(1)
        .create_async()
        .await;

    let config = collector_config(server.url(), RetryStrategy::Immediate(3));
    let harvest = Arc::new(HarvestCycle::new(&config));
    assert!(harvest.record_custom_metric("Custom/oversized", 1.0));

    let collector: Arc<dyn Collector> =
        Arc::new(HttpCollector::new(&config, "run-1").expect("collector"));
    let harvester = Harvester::new(harvest.clone(), collector, &config, "run-1");
    harvester.harvest_metrics().await;

    mock.assert_async().await;
    assert_eq!(harvest.pending_metrics(), 0);
}

#[tokio::test]
async fn collector_linear_backoff_recovers() {
    let mut server = Server::new_async().await;
    let failing = server
        .mock("POST", "/agent_listener/invoke_raw_method")
        .match_query(metric_query())
        .with_status(500)
        .expect(1)
        .create_async()
        .await;
    let succeeding = server
        .mock("POST", "/agent_listener/invoke_raw_method")
        .match_query(metric_query())
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = collector_config(server.url(), RetryStrategy::LinearBackoff(3, 1));
    let collector = HttpCollector::new(&config, "run-1").expect("collector");
    let result = collector
        .send(HarvestMethod::MetricData, &serde_json::json!(["run-1", 0, 60, []]))
        .await;

    assert!(result.is_ok(), "{result:?}");
    failing.assert_async().await;
    succeeding.assert_async().await;
}
