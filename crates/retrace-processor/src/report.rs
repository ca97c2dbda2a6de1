// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The outcome histogram: every trace contributes to each
//! `(interval, trigger)` pair it touched, to an `All` aggregate along
//! both axes, and to an `x` bucket when it carried no interval or
//! trigger attribute at all.

use std::collections::BTreeMap;

use crate::trace::{TraceOutcome, TraceStatus};

/// Aggregate bucket along an axis.
pub const ALL_SENTINEL: i64 = -10;
/// Bucket for traces without any value on an axis.
pub const NONE_SENTINEL: i64 = -9;

#[derive(Debug, Default)]
pub struct Report {
    outcomes: BTreeMap<(i64, i64), BTreeMap<TraceStatus, u64>>,
}

impl Report {
    pub fn add_trace(&mut self, outcome: &TraceOutcome) {
        let mut intervals = outcome.intervals.clone();
        if intervals.is_empty() {
            intervals.insert(NONE_SENTINEL);
        }
        intervals.insert(ALL_SENTINEL);

        let mut triggers = outcome.triggers.clone();
        if triggers.is_empty() {
            triggers.insert(NONE_SENTINEL);
        }
        triggers.insert(ALL_SENTINEL);

        for interval in &intervals {
            for trigger in &triggers {
                *self
                    .outcomes
                    .entry((*interval, *trigger))
                    .or_default()
                    .entry(outcome.status)
                    .or_default() += 1;
            }
        }
    }

    pub fn count(&self, interval: i64, trigger: i64, status: TraceStatus) -> u64 {
        self.outcomes
            .get(&(interval, trigger))
            .and_then(|statuses| statuses.get(&status))
            .copied()
            .unwrap_or(0)
    }

    /// Total traces, from the `(All, All)` bucket.
    pub fn total(&self) -> u64 {
        self.outcomes
            .get(&(ALL_SENTINEL, ALL_SENTINEL))
            .map(|statuses| statuses.values().sum())
            .unwrap_or(0)
    }

    /// Prints the histogram. Intervals are normalized by subtracting
    /// the smallest non-negative interval seen.
    pub fn print(&self) {
        let min_interval = self
            .outcomes
            .keys()
            .map(|(interval, _)| *interval)
            .filter(|interval| *interval >= 0)
            .min()
            .unwrap_or(0);

        println!(
            "{:>4}{:>8}{:>7}{:>8}{:>7} Description",
            "I", "Trigger", "Status", "Count", "Pct"
        );
        for ((interval, trigger), statuses) in &self.outcomes {
            let interval_name = match *interval {
                ALL_SENTINEL => "All".to_string(),
                NONE_SENTINEL => "x".to_string(),
                value => (value - min_interval).to_string(),
            };
            let trigger_name = match *trigger {
                ALL_SENTINEL => "All".to_string(),
                NONE_SENTINEL => "x".to_string(),
                value => value.to_string(),
            };

            let total: u64 = statuses.values().sum();
            for (status, count) in statuses {
                let pct = (100 * count) as f64 / total as f64;
                println!(
                    "{:>4}{:>8}{:>7}{:>8}{:>7.2} {}",
                    interval_name,
                    trigger_name,
                    status.code(),
                    count,
                    pct,
                    status.description()
                );
            }
        }
    }
}
