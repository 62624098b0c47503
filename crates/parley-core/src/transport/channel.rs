// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process transport over tokio channels.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{IncomingRecord, MessageSink, MessageSource, OutgoingRecord, TransportError};

/// Receiving half handed to [`KafkaLoop`](super::KafkaLoop).
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<IncomingRecord>,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<IncomingRecord>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Sending half the loop writes replies to.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<OutgoingRecord>,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, record: OutgoingRecord) -> Result<(), TransportError> {
        self.tx.send(record).await.map_err(|_| TransportError::Closed)
    }
}

/// Both ends of an in-process transport.
///
/// `inbox` feeds `source`; replies written to `sink` arrive on `outbox`.
/// Dropping every `inbox` sender ends the source.
#[derive(Debug)]
pub struct ChannelTransport {
    pub inbox: mpsc::Sender<IncomingRecord>,
    pub source: ChannelSource,
    pub sink: ChannelSink,
    pub outbox: mpsc::Receiver<OutgoingRecord>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> Self {
        let (inbox, rx) = mpsc::channel(capacity);
        let (tx, outbox) = mpsc::channel(capacity);
        Self {
            inbox,
            source: ChannelSource { rx },
            sink: ChannelSink { tx },
            outbox,
        }
    }
}
