// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Distributed tracing priority and sampling decisions.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Trace context received from an upstream service.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InboundTrace {
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub priority: Option<f64>,
    pub sampled: Option<bool>,
}

impl InboundTrace {
    /// The upstream decision, when it carried both halves of one.
    pub fn decision(&self) -> Option<SamplingDecision> {
        match (self.priority, self.sampled) {
            (Some(priority), Some(sampled)) if priority.is_finite() => {
                Some(SamplingDecision { priority, sampled })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingDecision {
    pub priority: f64,
    pub sampled: bool,
}

/// What a sampling policy gets to see of a finishing transaction.
#[derive(Debug, Clone, Copy)]
pub struct TransactionSummary<'a> {
    pub name: &'a str,
    pub duration: Duration,
    pub is_error: bool,
    pub inbound: Option<&'a InboundTrace>,
}

pub trait SamplingPolicy: Debug + Send + Sync {
    fn compute_sampling_decision(&self, summary: &TransactionSummary<'_>) -> SamplingDecision;
}

/// Samples everything or nothing with a fixed priority.
#[derive(Debug, Clone, Copy)]
pub struct ConstantSampler {
    pub sampled: bool,
}

impl SamplingPolicy for ConstantSampler {
    fn compute_sampling_decision(&self, summary: &TransactionSummary<'_>) -> SamplingDecision {
        if let Some(decision) = summary.inbound.and_then(InboundTrace::decision) {
            return decision;
        }
        SamplingDecision {
            priority: if self.sampled { 1.0 } else { 0.0 },
            sampled: self.sampled,
        }
    }
}

#[derive(Debug)]
struct WindowState {
    rng: StdRng,
    window_start: Option<Instant>,
    first_window: bool,
    seen: u64,
    sampled: u64,
    previous_seen: u64,
}

/// Aims for `target` sampled transactions per `window`.
///
/// The first window samples the first `target` arrivals. Later windows
/// sample with probability `target / previous_seen` until the target is
/// met, then back off exponentially.
#[derive(Debug)]
pub struct AdaptiveSampler {
    target: u64,
    window: Duration,
    state: Mutex<WindowState>,
}

impl AdaptiveSampler {
    pub fn new(target: u64, window: Duration) -> Self {
        Self::from_rng(target, window, StdRng::from_entropy())
    }

    pub fn with_seed(target: u64, window: Duration, seed: u64) -> Self {
        Self::from_rng(target, window, StdRng::seed_from_u64(seed))
    }

    fn from_rng(target: u64, window: Duration, rng: StdRng) -> Self {
        Self {
            target,
            window,
            state: Mutex::new(WindowState {
                rng,
                window_start: None,
                first_window: true,
                seen: 0,
                sampled: 0,
                previous_seen: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decides at an explicit instant.
    pub fn decide_at(&self, now: Instant, inbound: Option<&InboundTrace>) -> SamplingDecision {
        let mut state = self.lock();
        self.roll_window(&mut state, now);
        state.seen += 1;

        if let Some(decision) = inbound.and_then(InboundTrace::decision) {
            if decision.sampled {
                state.sampled += 1;
            }
            return decision;
        }

        let sampled = self.should_sample(&mut state);
        if sampled {
            state.sampled += 1;
        }
        let priority = truncate_priority(state.rng.gen::<f64>()) + if sampled { 1.0 } else { 0.0 };
        SamplingDecision { priority, sampled }
    }

    fn roll_window(&self, state: &mut WindowState, now: Instant) {
        let Some(start) = state.window_start else {
            state.window_start = Some(now);
            return;
        };
        if now.saturating_duration_since(start) < self.window {
            return;
        }
        state.previous_seen = state.seen;
        state.seen = 0;
        state.sampled = 0;
        state.first_window = false;
        state.window_start = Some(now);
    }

    #[allow(clippy::cast_precision_loss)]
    fn should_sample(&self, state: &mut WindowState) -> bool {
        if self.target == 0 {
            return false;
        }
        if state.first_window {
            return state.sampled < self.target;
        }
        if state.previous_seen == 0 {
            return state.sampled < self.target;
        }
        let target = self.target as f64;
        let previous = state.previous_seen as f64;
        let ratio = if state.sampled < self.target {
            target / previous
        } else {
            let sampled = state.sampled as f64;
            (target.powf(target / sampled) - target.sqrt()) / previous
        };
        state.rng.gen::<f64>() < ratio
    }
}

impl SamplingPolicy for AdaptiveSampler {
    fn compute_sampling_decision(&self, summary: &TransactionSummary<'_>) -> SamplingDecision {
        self.decide_at(Instant::now(), summary.inbound)
    }
}

/// Keeps six decimal places.
pub fn truncate_priority(priority: f64) -> f64 {
    (priority * 1_000_000.0).floor() / 1_000_000.0
}
