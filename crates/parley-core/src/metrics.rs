// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pipeline counters.
//!
//! Every increment is also emitted as a structured event on the `metrics`
//! tracing target, so a log pipeline can aggregate them without scraping.
//! [`Metrics::render`] produces the Prometheus text exposition format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counted pipeline events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    IncomingMessage,
    InvalidMessage,
    LoadError,
    SaveError,
    SaveCollision,
    SaveCollisionTriesLeftExhausted,
    ScenarioError,
    BadAnswer,
    OutgoingMessage,
    PostprocessError,
    NothingFound,
    UnsupportedOperation,
}

impl Counter {
    pub const ALL: [Counter; 12] = [
        Counter::IncomingMessage,
        Counter::InvalidMessage,
        Counter::LoadError,
        Counter::SaveError,
        Counter::SaveCollision,
        Counter::SaveCollisionTriesLeftExhausted,
        Counter::ScenarioError,
        Counter::BadAnswer,
        Counter::OutgoingMessage,
        Counter::PostprocessError,
        Counter::NothingFound,
        Counter::UnsupportedOperation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Counter::IncomingMessage => "incoming_message",
            Counter::InvalidMessage => "invalid_message",
            Counter::LoadError => "load_error",
            Counter::SaveError => "save_error",
            Counter::SaveCollision => "save_collision",
            Counter::SaveCollisionTriesLeftExhausted => "save_collision_tries_left_exhausted",
            Counter::ScenarioError => "scenario_error",
            Counter::BadAnswer => "bad_answer",
            Counter::OutgoingMessage => "outgoing_message",
            Counter::PostprocessError => "postprocess_error",
            Counter::NothingFound => "nothing_found",
            Counter::UnsupportedOperation => "unsupported_operation",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Process-wide counter set.
#[derive(Debug)]
pub struct Metrics {
    prefix: String,
    counters: [AtomicU64; Counter::ALL.len()],
    duration_micros: AtomicU64,
    duration_count: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new("parley")
    }
}

impl Metrics {
    /// Create counters whose exported names start with `prefix_`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            duration_micros: AtomicU64::new(0),
            duration_count: AtomicU64::new(0),
        }
    }

    pub fn inc(&self, counter: Counter) {
        let value = self.counters[counter.index()].fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(target: "metrics", metric = counter.name(), value, "counter");
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Record the wall time of one handled request.
    pub fn observe_request(&self, elapsed: Duration) {
        self.duration_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.duration_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            target: "metrics",
            metric = "request_duration",
            micros = elapsed.as_micros() as u64,
            "histogram"
        );
    }

    pub fn request_count(&self) -> u64 {
        self.duration_count.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for counter in Counter::ALL {
            let name = format!("{}_{}_total", self.prefix, counter.name());
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", self.get(counter));
        }
        let name = format!("{}_request_duration_seconds", self.prefix);
        let sum = self.duration_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(out, "# TYPE {name} summary");
        let _ = writeln!(out, "{name}_sum {sum}");
        let _ = writeln!(out, "{name}_count {}", self.request_count());
        out
    }
}
