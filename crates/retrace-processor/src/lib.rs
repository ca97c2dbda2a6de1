// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Offline reconstruction of retroactive traces.
//!
//! The collector's log file holds buffers from many traces and many
//! agents, in arbitrary order and possibly incomplete. This crate
//! groups them by trace and agent, chains fragments back into
//! contiguous event streams, and classifies every trace against the
//! invariants the services uphold when recording.

pub mod buffers;
pub mod report;
pub mod trace;

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

use crate::buffers::RawBuffer;
use crate::report::Report;
use crate::trace::{evaluate_trace, TraceStatus};

/// Groups buffers by trace id, classifies each trace, and accumulates
/// the outcome histogram.
pub fn process_records(records: Vec<RawBuffer>, warn_on_malformed: bool) -> Report {
    let mut grouped: BTreeMap<u64, Vec<RawBuffer>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.header.trace_id).or_default().push(record);
    }
    debug!("{} traces total", grouped.len());

    let mut report = Report::default();
    for (trace_id, buffers) in grouped {
        let outcome = evaluate_trace(&buffers);
        if warn_on_malformed && outcome.status != TraceStatus::Valid {
            warn!(
                "Trace {trace_id} status is {}: {}",
                outcome.status.code(),
                outcome.status.description()
            );
        } else {
            debug!(
                "Trace {trace_id} status is {}: {}",
                outcome.status.code(),
                outcome.status.description()
            );
        }
        report.add_trace(&outcome);
    }
    report
}

/// Reads and classifies one buffer log file.
pub fn process_file<P: AsRef<Path>>(path: P, warn_on_malformed: bool) -> io::Result<(usize, Report)> {
    let records = buffers::read_buffers_from_path(path)?;
    let count = records.len();
    Ok((count, process_records(records, warn_on_malformed)))
}
