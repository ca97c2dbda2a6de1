// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use std::time::Instant;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Event timestamp source: monotonic nanoseconds since process start.
/// Only meaningful within one host, like the raw cycle counters it
/// stands in for.
pub(crate) fn ticks() -> u64 {
    PROCESS_START.elapsed().as_nanos() as u64
}
