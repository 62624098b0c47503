// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User state store adapters.
//!
//! This module defines the adapter abstraction and its backends. Blobs are
//! opaque bytes addressed by the composite user id.
//!
//! | Backend | Config `type` | Notes |
//! |---------|---------------|-------|
//! | [`MemoryAdapter`] | `memory` | Process-local, byte-bounded LRU with TTL |
//! | [`ReplicatedAdapter`] | `replicated` | Redis behind Sentinel-style discovery |

pub mod memory;
pub mod replicated;

pub use self::memory::{MemoryAdapter, MemoryAdapterConfig};
pub use self::replicated::{ReplicatedAdapter, ReplicatedAdapterConfig};

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::clock::SharedClock;

/// Result type for adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Adapter failures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum AdapterError {
    /// Temporary failure; the operation may succeed if retried.
    #[error("transient adapter error: {0}")]
    Transient(String),

    /// Permanent backend failure.
    #[error("adapter backend error: {0}")]
    Backend(String),

    /// The backend did not answer within the socket timeout.
    #[error("adapter operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The adapter does not implement the operation.
    #[error("unsupported adapter operation: {0}")]
    Unsupported(&'static str),

    /// The current primary could not be resolved.
    #[error("primary discovery failed: {0}")]
    Discovery(String),

    /// A value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl AdapterError {
    /// Whether retrying the same call may help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Storage backend for user blobs.
///
/// All operations are asynchronous; [`is_async`](Adapter::is_async) exists so
/// the runtime can refuse adapters that would block the event loop.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Name used in logs and health output.
    fn name(&self) -> &'static str;

    fn is_async(&self) -> bool {
        true
    }

    /// Prepare connections. Called once before the first request.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Stored blob for `id`, if any.
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Store `blob` under `id` unconditionally.
    async fn save(&self, id: &str, blob: &[u8]) -> Result<()>;

    /// Store `blob` only if the current value equals `sample`.
    ///
    /// `sample == None` means "only if absent". Returns whether the write
    /// happened.
    async fn replace_if_equals(&self, id: &str, sample: Option<&[u8]>, blob: &[u8])
    -> Result<bool>;

    async fn path_exists(&self, _path: &str) -> Result<bool> {
        Err(AdapterError::Unsupported("path_exists"))
    }

    async fn is_alive(&self) -> Result<bool> {
        Err(AdapterError::Unsupported("is_alive"))
    }

    /// Release connections. Called once during shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Adapter selection, tagged by `type`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterConfig {
    Memory(MemoryAdapterConfig),
    Replicated(ReplicatedAdapterConfig),
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::Memory(MemoryAdapterConfig::default())
    }
}

impl AdapterConfig {
    /// Instantiate the configured backend.
    pub fn build(&self, clock: SharedClock) -> Arc<dyn Adapter> {
        match self {
            Self::Memory(config) => Arc::new(MemoryAdapter::new(config.clone(), clock)),
            Self::Replicated(config) => Arc::new(ReplicatedAdapter::new(config.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_tagged_by_type() {
        let config: AdapterConfig = serde_json::from_value(json!({"type": "memory"})).unwrap();
        assert_eq!(config, AdapterConfig::Memory(MemoryAdapterConfig::default()));

        let config: AdapterConfig = serde_json::from_value(json!({
            "type": "replicated",
            "sentinels": [["10.0.0.1", 26379]],
            "service_name": "users"
        }))
        .unwrap();
        match config {
            AdapterConfig::Replicated(c) => {
                assert_eq!(c.sentinels, vec![("10.0.0.1".to_string(), 26379)]);
                assert_eq!(c.service_name, "users");
            }
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_value::<AdapterConfig>(json!({"type": "ignite"})).is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(AdapterError::Transient("x".into()).is_transient());
        assert!(AdapterError::Timeout(std::time::Duration::from_millis(5)).is_transient());
        assert!(!AdapterError::Unsupported("is_alive").is_transient());
    }
}
