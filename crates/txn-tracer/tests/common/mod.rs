// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use txn_tracer::config::TracerConfig;
use txn_tracer::context::Agent;
use txn_tracer::sampling::ConstantSampler;
use txn_tracer::transaction::{ManualClock, TransactionKind, TransactionTracer};

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// An agent that samples everything and whose clock only moves on demand.
pub fn agent(config: TracerConfig) -> (Agent, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let agent = Agent::with_parts(
        config,
        Arc::new(ConstantSampler { sampled: true }),
        clock.clone(),
    );
    (agent, clock)
}

pub fn started_tracer(config: TracerConfig) -> (TransactionTracer, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let mut tracer = TransactionTracer::new(
        Arc::new(config),
        Arc::new(ConstantSampler { sampled: true }),
        clock.clone(),
        TransactionKind::Web,
    );
    tracer.start().expect("start");
    (tracer, clock)
}
