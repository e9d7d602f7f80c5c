// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-request transaction tracing: segment trees, metrics, sampled events,
//! transaction traces and the harvest that ships them.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod attributes;
pub mod collector;
pub mod config;
pub mod context;
pub mod environment;
pub mod errors;
pub mod harvest;
pub mod harvester;
pub mod logger;
pub mod metric;
pub mod payload;
pub mod reservoir;
pub mod sampling;
pub mod segment;
pub mod sql;
pub mod string_table;
pub mod transaction;
