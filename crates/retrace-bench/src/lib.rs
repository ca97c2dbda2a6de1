// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A configurable topology of RPC services for benchmarking retroactive
//! tracing.
//!
//! Each service runs N handler threads; every handler owns a private
//! completion queue and drives its requests as explicit state machines
//! (admission, CPU work, child fan-out, reply, trigger evaluation).
//! The [`client`] module generates closed- or open-loop load against a
//! service and reports latency statistics.

pub mod client;
pub mod rpc;
pub mod server;
pub mod topology;
pub mod wire;
pub mod work;

/// Built-in configuration used when the `standalone` service is named
/// on the command line.
pub mod standalone {
    pub const SERVICE_NAME: &str = "service1";
    pub const TOPOLOGY_JSON: &str = include_str!("../../../config/single_server_topology.json");
    pub const ADDRESSES_JSON: &str = include_str!("../../../config/single_server_addresses.json");
}

/// Default matrix benchmark table mapping `exec` targets to `(m, n, k)`.
pub const MATRIX_BENCHMARKS_CSV: &str = include_str!("../../../config/matrix_benchmarks.csv");
