// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Consume-process-produce loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{IncomingRecord, MessageSink, MessageSource, OutgoingRecord, TopicRouter, TransportError};
use crate::pipeline::{Outcome, Pipeline};
use crate::stats;

/// Default bound on records processed concurrently.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Reads records from a source, runs each through the pipeline in its own
/// task, and writes every reply to the sink.
///
/// Rejected messages and empty results produce no record. On shutdown the
/// loop stops reading, waits for in-flight tasks, then closes the adapter.
pub struct KafkaLoop<S> {
    source: S,
    sink: Arc<dyn MessageSink>,
    pipeline: Arc<Pipeline>,
    router: Arc<TopicRouter>,
    max_in_flight: usize,
}

impl<S> std::fmt::Debug for KafkaLoop<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaLoop")
            .field("router", &self.router)
            .field("max_in_flight", &self.max_in_flight)
            .finish()
    }
}

impl<S: MessageSource + 'static> KafkaLoop<S> {
    pub fn new(
        source: S,
        sink: Arc<dyn MessageSink>,
        pipeline: Arc<Pipeline>,
        router: TopicRouter,
    ) -> Self {
        Self {
            source,
            sink,
            pipeline,
            router: Arc::new(router),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Run until the source is exhausted or `shutdown` turns true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        let mut tasks = JoinSet::new();
        info!(max_in_flight = self.max_in_flight, "Consumer loop started");

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Consumer loop received shutdown signal");
                            break;
                        }
                    }

                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(err) = joined {
                            error!(error = %err, "Record task panicked");
                        }
                    }

                    record = self.source.recv(), if tasks.len() < self.max_in_flight => {
                        match record {
                            Ok(Some(record)) => {
                                let pipeline = self.pipeline.clone();
                                let sink = self.sink.clone();
                                let router = self.router.clone();
                                tasks.spawn(stats::in_new_scope(handle_record(
                                    pipeline, sink, router, record,
                                )));
                            }
                            Ok(None) => {
                                info!("Source exhausted");
                                break;
                            }
                            Err(err) => {
                                warn!(error = %err, "Failed to receive record");
                            }
                        }
                    }
                }
            }
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(in_flight, "Draining in-flight records");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Record task panicked");
            }
        }

        if let Err(err) = self.pipeline.adapter().close().await {
            warn!(error = %err, "Adapter close failed");
        }
        info!("Consumer loop stopped");
        Ok(())
    }
}

async fn handle_record(
    pipeline: Arc<Pipeline>,
    sink: Arc<dyn MessageSink>,
    router: Arc<TopicRouter>,
    record: IncomingRecord,
) {
    debug!(key = ?record.key, topic = %record.topic, size = record.payload.len(), "Record received");
    let processed = pipeline
        .process_raw(&record.payload, record.headers, false)
        .await;

    if let Outcome::Replies(replies) = &processed.outcome {
        for reply in replies {
            let payload = match reply.to_bytes() {
                Ok(payload) => payload,
                Err(err) => {
                    error!(error = %err, "Failed to encode reply");
                    continue;
                }
            };
            let outgoing = OutgoingRecord {
                key: reply.kafka_key.clone().or_else(|| record.key.clone()),
                topic: router.resolve(reply.topic_key.as_deref()).to_string(),
                payload,
                headers: reply.headers.clone(),
            };
            let topic = outgoing.topic.clone();
            match sink.send(outgoing).await {
                Ok(()) => {
                    pipeline
                        .metrics()
                        .inc(crate::metrics::Counter::OutgoingMessage);
                }
                Err(err) => error!(error = %err, %topic, "Failed to send reply"),
            }
        }
    }

    if let Some(user) = &processed.user {
        pipeline.postprocess(&processed.message, user).await;
    }
}
