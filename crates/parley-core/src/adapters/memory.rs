// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-local TTL cache adapter.
//!
//! Bounded by the total length of stored blobs. When a write pushes the cache
//! over budget the least recently used entries are evicted; expired entries
//! are dropped when touched.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{Adapter, AdapterError, Result};
use crate::clock::SharedClock;

/// Default byte budget (256 MiB).
pub const DEFAULT_MAX_BYTES: usize = 256 * 1024 * 1024;

/// Default entry lifetime (12 hours).
pub const DEFAULT_TTL_SECS: u64 = 12 * 60 * 60;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryAdapterConfig {
    /// Upper bound on the summed blob length.
    pub max_bytes: usize,
    /// Lifetime of an entry after its last write.
    pub ttl_secs: u64,
}

impl Default for MemoryAdapterConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

#[derive(Debug)]
struct Entry {
    blob: Vec<u8>,
    expires_at: f64,
    tick: u64,
}

#[derive(Debug, Default)]
struct Cache {
    entries: HashMap<String, Entry>,
    // Recency order: smallest tick is least recently used.
    order: BTreeMap<u64, String>,
    bytes: usize,
    next_tick: u64,
}

impl Cache {
    fn remove(&mut self, id: &str) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.tick);
        self.bytes -= entry.blob.len();
        Some(entry)
    }

    fn live(&mut self, id: &str, now: f64) -> Option<&mut Entry> {
        let expired = self.entries.get(id)?.expires_at <= now;
        if expired {
            self.remove(id);
            return None;
        }
        let tick = self.bump();
        let entry = self.entries.get_mut(id)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, id.to_string());
        Some(entry)
    }

    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn insert(&mut self, id: &str, blob: Vec<u8>, expires_at: f64, max_bytes: usize) {
        self.remove(id);
        let tick = self.bump();
        self.bytes += blob.len();
        self.order.insert(tick, id.to_string());
        self.entries.insert(
            id.to_string(),
            Entry {
                blob,
                expires_at,
                tick,
            },
        );
        while self.bytes > max_bytes {
            let Some((_, victim)) = self.order.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&victim) {
                self.bytes -= entry.blob.len();
                debug!(id = %victim, size = entry.blob.len(), "Evicted user blob");
            }
        }
    }
}

/// In-memory adapter.
pub struct MemoryAdapter {
    config: MemoryAdapterConfig,
    cache: Mutex<Cache>,
    clock: SharedClock,
}

impl std::fmt::Debug for MemoryAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAdapter")
            .field("config", &self.config)
            .field("bytes", &self.bytes_used())
            .finish()
    }
}

impl MemoryAdapter {
    pub fn new(config: MemoryAdapterConfig, clock: SharedClock) -> Self {
        Self {
            config,
            cache: Mutex::new(Cache::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of stored entries, including ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summed length of stored blobs.
    pub fn bytes_used(&self) -> usize {
        self.lock().bytes
    }

    fn store(&self, cache: &mut Cache, id: &str, blob: &[u8]) -> Result<()> {
        if blob.len() > self.config.max_bytes {
            return Err(AdapterError::Backend(format!(
                "blob of {} bytes exceeds cache budget of {} bytes",
                blob.len(),
                self.config.max_bytes
            )));
        }
        let expires_at = self.clock.now_secs() + self.config.ttl_secs as f64;
        cache.insert(id, blob.to_vec(), expires_at, self.config.max_bytes);
        Ok(())
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now_secs();
        Ok(self.lock().live(id, now).map(|entry| entry.blob.clone()))
    }

    async fn save(&self, id: &str, blob: &[u8]) -> Result<()> {
        let mut cache = self.lock();
        self.store(&mut cache, id, blob)
    }

    async fn replace_if_equals(
        &self,
        id: &str,
        sample: Option<&[u8]>,
        blob: &[u8],
    ) -> Result<bool> {
        let now = self.clock.now_secs();
        let mut cache = self.lock();
        let current = cache.live(id, now).map(|entry| entry.blob.as_slice());
        if current != sample {
            return Ok(false);
        }
        self.store(&mut cache, id, blob)?;
        Ok(true)
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        let now = self.clock.now_secs();
        Ok(self.lock().live(path, now).is_some())
    }

    async fn is_alive(&self) -> Result<bool> {
        Ok(true)
    }
}
