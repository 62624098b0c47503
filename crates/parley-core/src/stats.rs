// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nested timing spans attributed to subsystems.
//!
//! A [`StatsTimer`] appends one [`Stats`] entry to a per-user [`StatsLog`] when
//! it finishes, and moves every entry recorded since it started under itself.
//! The log therefore forms a forest: outer timers own the entries of the timers
//! that ran inside them, and [`Stats::time`] reports self time so that summing
//! one level of the tree yields the wall-clock time of that level.
//!
//! Timers started by futures running concurrently on the same user must not
//! steal each other's entries. Each future wrapped in [`in_new_scope`] gets its
//! own ownership scope; a timer only adopts entries from its own scope.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::Instant;

tokio::task_local! {
    static SCOPE: u64;
}

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// Run `fut` in a fresh stats scope, so its timers become siblings of timers
/// running concurrently elsewhere on the same log.
pub async fn in_new_scope<F: Future>(fut: F) -> F::Output {
    let id = NEXT_SCOPE.fetch_add(1, Ordering::Relaxed);
    SCOPE.scope(id, fut).await
}

fn current_scope() -> Option<u64> {
    SCOPE.try_with(|id| *id).ok()
}

/// One timed span.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    /// Subsystem the span is attributed to.
    pub system: String,
    /// Optional subsystem version.
    pub version: Option<String>,
    /// Spans that ran inside this one.
    pub inner_stats: Vec<Stats>,
    total: Duration,
    seq: u64,
    scope: Option<u64>,
}

impl Stats {
    /// Wall-clock duration of the span, including nested spans.
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Sum of the total durations of the direct children.
    pub fn inner_sum(&self) -> Duration {
        self.inner_stats.iter().map(Stats::total).sum()
    }

    /// Self time: total minus the time spent in direct children.
    pub fn time(&self) -> Duration {
        self.total.saturating_sub(self.inner_sum())
    }

    /// `{system, version, time_ms, inner_stats}` representation.
    pub fn to_json(&self) -> Value {
        json!({
            "system": self.system,
            "version": self.version,
            "time_ms": self.time().as_micros() as f64 / 1000.0,
            "inner_stats": self.inner_stats.iter().map(Stats::to_json).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Default)]
struct LogInner {
    entries: Vec<Stats>,
    next_seq: u64,
}

/// Shared list of top-level spans for one user.
#[derive(Debug, Clone, Default)]
pub struct StatsLog {
    inner: Arc<Mutex<LogInner>>,
}

impl StatsLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Snapshot of the top-level entries.
    pub fn entries(&self) -> Vec<Stats> {
        self.lock().entries.clone()
    }

    /// Number of top-level entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return all top-level entries.
    pub fn take(&self) -> Vec<Stats> {
        std::mem::take(&mut self.lock().entries)
    }

    /// JSON array of the top-level entries.
    pub fn to_json(&self) -> Value {
        Value::Array(self.lock().entries.iter().map(Stats::to_json).collect())
    }

    fn mark(&self) -> u64 {
        self.lock().next_seq
    }

    fn record(
        &self,
        system: String,
        version: Option<String>,
        total: Duration,
        mark: u64,
        scope: Option<u64>,
    ) -> Duration {
        let mut inner = self.lock();
        let (children, rest): (Vec<Stats>, Vec<Stats>) = std::mem::take(&mut inner.entries)
            .into_iter()
            .partition(|entry| entry.seq >= mark && entry.scope == scope);
        inner.entries = rest;

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let stats = Stats {
            system,
            version,
            inner_stats: children,
            total,
            seq,
            scope,
        };
        let self_time = stats.time();
        inner.entries.push(stats);
        self_time
    }
}

/// Running span; records itself on [`finish`](Self::finish) or drop.
#[derive(Debug)]
pub struct StatsTimer {
    system: Option<String>,
    version: Option<String>,
    log: StatsLog,
    start: Instant,
    mark: u64,
    scope: Option<u64>,
    done: bool,
}

impl StatsTimer {
    /// Start timing. Without a `system` label nothing is recorded.
    pub fn start(system: Option<&str>, log: &StatsLog) -> Self {
        Self {
            system: system.map(str::to_string),
            version: None,
            log: log.clone(),
            start: Instant::now(),
            mark: log.mark(),
            scope: current_scope(),
            done: false,
        }
    }

    /// Attach a version label to the recorded entry.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Stop timing and return the self time, if a system label was given.
    pub fn finish(mut self) -> Option<Duration> {
        self.complete()
    }

    fn complete(&mut self) -> Option<Duration> {
        if self.done {
            return None;
        }
        self.done = true;
        let system = self.system.take()?;
        let total = self.start.elapsed();
        Some(
            self.log
                .record(system, self.version.take(), total, self.mark, self.scope),
        )
    }
}

impl Drop for StatsTimer {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Time `fut` as one span attributed to `system`.
pub async fn timed<F: Future>(system: &str, log: &StatsLog, fut: F) -> F::Output {
    let timer = StatsTimer::start(Some(system), log);
    let output = fut.await;
    timer.finish();
    output
}
