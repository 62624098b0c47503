// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record transports feeding the pipeline.
//!
//! A [`MessageSource`] yields keyed records, a [`MessageSink`] accepts them.
//! [`KafkaLoop`] drives a source through the pipeline and writes replies to a
//! sink. The in-process [`ChannelTransport`] and the `rdkafka` backend (feature
//! `kafka`) implement the same traits.

mod channel;
#[cfg(feature = "kafka")]
pub mod kafka;
mod kafka_loop;

pub use channel::{ChannelSink, ChannelSource, ChannelTransport};
pub use kafka_loop::KafkaLoop;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use crate::frame::FrameError;
use crate::message::Headers;

/// Inbound keyed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRecord {
    pub key: Option<String>,
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

/// Outbound keyed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    pub key: Option<String>,
    pub topic: String,
    pub payload: Bytes,
    pub headers: Headers,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport backend error: {0}")]
    Backend(String),

    #[error("failed to encode outgoing record: {0}")]
    Encode(#[from] FrameError),
}

/// Source of inbound records.
#[async_trait]
pub trait MessageSource: Send {
    /// Next record, or `None` once the source is exhausted.
    async fn recv(&mut self) -> Result<Option<IncomingRecord>, TransportError>;
}

#[async_trait]
impl<S: MessageSource + ?Sized> MessageSource for Box<S> {
    async fn recv(&mut self) -> Result<Option<IncomingRecord>, TransportError> {
        (**self).recv().await
    }
}

/// Destination of outbound records.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, record: OutgoingRecord) -> Result<(), TransportError>;
}

/// Maps a command's `topic_key` to a concrete topic name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicRouter {
    default_topic: String,
    topics: HashMap<String, String>,
}

impl TopicRouter {
    pub fn new(default_topic: impl Into<String>, topics: HashMap<String, String>) -> Self {
        Self {
            default_topic: default_topic.into(),
            topics,
        }
    }

    /// Topic for `topic_key`; unknown or missing keys go to the default topic.
    pub fn resolve(&self, topic_key: Option<&str>) -> &str {
        match topic_key {
            None => &self.default_topic,
            Some(key) => match self.topics.get(key) {
                Some(topic) => topic,
                None => {
                    warn!(topic_key = key, default = %self.default_topic, "Unknown topic key, using default topic");
                    &self.default_topic
                }
            },
        }
    }
}
