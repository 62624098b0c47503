// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kafka source and sink backed by `rdkafka`.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers as _, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tracing::info;

use super::{IncomingRecord, MessageSink, MessageSource, OutgoingRecord, TransportError};
use crate::config::KafkaSettings;
use crate::message::Headers;

fn backend(err: rdkafka::error::KafkaError) -> TransportError {
    TransportError::Backend(err.to_string())
}

/// Consumer subscribed to the configured topics.
pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    pub fn new(settings: &KafkaSettings) -> Result<Self, TransportError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", settings.brokers.join(","))
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(backend)?;
        let topics: Vec<&str> = settings.consumer_topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(backend)?;
        info!(topics = ?topics, group = %settings.group_id, "Kafka consumer subscribed");
        Ok(Self { consumer })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn recv(&mut self) -> Result<Option<IncomingRecord>, TransportError> {
        let message = self.consumer.recv().await.map_err(backend)?;
        let mut headers = Headers::new();
        if let Some(raw) = message.headers() {
            for header in raw.iter() {
                if let Some(value) = header.value {
                    headers.insert(header.key, value.to_vec());
                }
            }
        }
        Ok(Some(IncomingRecord {
            key: message
                .key()
                .and_then(|k| std::str::from_utf8(k).ok())
                .map(str::to_string),
            topic: message.topic().to_string(),
            payload: message.payload().unwrap_or_default().to_vec(),
            headers,
        }))
    }
}

/// Producer writing replies.
pub struct KafkaSink {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaSink {
    pub fn new(settings: &KafkaSettings) -> Result<Self, TransportError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", settings.brokers.join(","))
            .set("message.timeout.ms", settings.send_timeout_ms.to_string())
            .create()
            .map_err(backend)?;
        Ok(Self {
            producer,
            timeout: Duration::from_millis(settings.send_timeout_ms),
        })
    }
}

#[async_trait]
impl MessageSink for KafkaSink {
    async fn send(&self, record: OutgoingRecord) -> Result<(), TransportError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in record.headers.iter() {
            headers = headers.insert(Header {
                key,
                value: Some(value),
            });
        }
        let mut outgoing: FutureRecord<'_, str, [u8]> = FutureRecord::to(&record.topic)
            .payload(record.payload.as_ref())
            .headers(headers);
        if let Some(key) = record.key.as_deref() {
            outgoing = outgoing.key(key);
        }
        self.producer
            .send(outgoing, Timeout::After(self.timeout))
            .await
            .map(|_| ())
            .map_err(|(err, _)| backend(err))
    }
}
