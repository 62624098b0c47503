// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for parley-core integration tests.
//!
//! Provides TestContext for building a pipeline over a scriptable adapter.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use parley_core::adapters::{self, Adapter, AdapterError, MemoryAdapter, MemoryAdapterConfig};
use parley_core::clock::ManualClock;
use parley_core::pipeline::{Pipeline, PipelineBuilder, PipelineSettings};
use parley_core::scenario::Scenario;

/// Memory adapter with scripted failures and interleavings.
pub struct FlakyAdapter {
    inner: MemoryAdapter,
    failing_gets: AtomicUsize,
    transient_gets: AtomicUsize,
    failing_saves: AtomicUsize,
    interleave: Mutex<Vec<Vec<u8>>>,
    alive: AtomicBool,
    pub gets: AtomicUsize,
    pub saves: AtomicUsize,
    pub replaces: AtomicUsize,
}

impl FlakyAdapter {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            inner: MemoryAdapter::new(MemoryAdapterConfig::default(), clock),
            failing_gets: AtomicUsize::new(0),
            transient_gets: AtomicUsize::new(0),
            failing_saves: AtomicUsize::new(0),
            interleave: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            gets: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            replaces: AtomicUsize::new(0),
        }
    }

    /// The next `n` loads fail with a backend error.
    pub fn fail_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// The next `n` loads fail with a transient error.
    pub fn transient_gets(&self, n: usize) {
        self.transient_gets.store(n, Ordering::SeqCst);
    }

    /// The next `n` writes fail with a backend error.
    pub fn fail_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Before the next conditional write, another writer stores `blob`.
    pub fn interleave_save(&self, blob: impl Into<Vec<u8>>) {
        self.interleave.lock().unwrap().push(blob.into());
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Blob currently stored for `id`.
    pub async fn stored(&self, id: &str) -> Option<Value> {
        let blob = self.inner.get(id).await.unwrap()?;
        Some(serde_json::from_slice(&blob).unwrap())
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Adapter for FlakyAdapter {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, id: &str) -> adapters::Result<Option<Vec<u8>>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.transient_gets) {
            return Err(AdapterError::Transient("scripted".into()));
        }
        if Self::take(&self.failing_gets) {
            return Err(AdapterError::Backend("scripted".into()));
        }
        self.inner.get(id).await
    }

    async fn save(&self, id: &str, blob: &[u8]) -> adapters::Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.failing_saves) {
            return Err(AdapterError::Backend("scripted".into()));
        }
        self.inner.save(id, blob).await
    }

    async fn replace_if_equals(
        &self,
        id: &str,
        sample: Option<&[u8]>,
        blob: &[u8],
    ) -> adapters::Result<bool> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        let interleaved = self.interleave.lock().unwrap().pop();
        if let Some(other) = interleaved {
            self.inner.save(id, &other).await?;
        }
        if Self::take(&self.failing_saves) {
            return Err(AdapterError::Backend("scripted".into()));
        }
        self.inner.replace_if_equals(id, sample, blob).await
    }

    async fn is_alive(&self) -> adapters::Result<bool> {
        Ok(self.alive.load(Ordering::SeqCst))
    }
}

/// Pipeline over a [`FlakyAdapter`] with a manual clock.
pub struct TestContext {
    pub pipeline: Arc<Pipeline>,
    pub adapter: Arc<FlakyAdapter>,
    pub clock: Arc<ManualClock>,
}

impl TestContext {
    pub fn new(scenario: Arc<dyn Scenario>) -> Self {
        Self::with(scenario, |builder| builder)
    }

    pub fn with_settings(scenario: Arc<dyn Scenario>, settings: PipelineSettings) -> Self {
        Self::with(scenario, |builder| builder.settings(settings))
    }

    /// Build with extra builder configuration.
    pub fn with(
        scenario: Arc<dyn Scenario>,
        configure: impl FnOnce(PipelineBuilder) -> PipelineBuilder,
    ) -> Self {
        let clock = ManualClock::new(1_000.0);
        let adapter = Arc::new(FlakyAdapter::new(clock.clone()));
        let builder = Pipeline::builder()
            .adapter(adapter.clone())
            .scenario(scenario)
            .clock(clock.clone());
        let pipeline = configure(builder).build().unwrap();
        Self {
            pipeline: Arc::new(pipeline),
            adapter,
            clock,
        }
    }
}

/// A `MESSAGE_TO_SKILL` message from user `u` on channel `B2C`.
pub fn skill_message(message_id: i64, text: &str) -> Value {
    json!({
        "messageId": message_id,
        "messageName": "MESSAGE_TO_SKILL",
        "sessionId": "s",
        "uuid": {"userId": "u", "userChannel": "B2C"},
        "payload": {"message": {"original_text": text}}
    })
}

pub fn to_bytes(message: &Value) -> Vec<u8> {
    serde_json::to_vec(message).unwrap()
}
