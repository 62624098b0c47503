// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for parley.
//!
//! [`Runtime`] runs a [`Pipeline`] behind one transport (the HTTP message
//! server or a record stream such as Kafka) plus an optional health server,
//! inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use parley_core::runtime::{Runtime, Transport};
//!
//! let runtime = Runtime::builder()
//!     .pipeline(pipeline)
//!     .transport(Transport::Http { addr: "0.0.0.0:8080".parse()? })
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... run your application ...
//!
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::pipeline::Pipeline;
use crate::server::{self, HealthState};
use crate::transport::{KafkaLoop, MessageSink, MessageSource, TopicRouter};

/// Transport the runtime serves messages on.
pub enum Transport {
    /// Inline HTTP replies.
    Http { addr: SocketAddr },
    /// Keyed records from `source`, replies to `sink`.
    Stream {
        source: Box<dyn MessageSource>,
        sink: Arc<dyn MessageSink>,
        router: TopicRouter,
        max_in_flight: usize,
    },
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Http { addr } => f.debug_struct("Http").field("addr", addr).finish(),
            Transport::Stream {
                router,
                max_in_flight,
                ..
            } => f
                .debug_struct("Stream")
                .field("router", router)
                .field("max_in_flight", max_in_flight)
                .finish(),
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Http {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Health server settings.
#[derive(Debug, Clone)]
pub struct HealthServer {
    pub addr: SocketAddr,
    pub monitoring: bool,
    pub debug_envs: Vec<String>,
}

/// Builder for creating a [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    pipeline: Option<Arc<Pipeline>>,
    transport: Transport,
    health: Option<HealthServer>,
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("pipeline", &self.pipeline.as_ref().map(|_| "..."))
            .field("transport", &self.transport)
            .field("health", &self.health)
            .finish()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pipeline (required).
    pub fn pipeline(mut self, pipeline: Arc<Pipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Set the transport.
    ///
    /// Default: HTTP on `0.0.0.0:8080`
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Serve the health router on its own listener.
    pub fn health(mut self, health: HealthServer) -> Self {
        self.health = Some(health);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<RuntimeConfig> {
        let pipeline = self
            .pipeline
            .ok_or_else(|| anyhow::anyhow!("pipeline is required"))?;
        Ok(RuntimeConfig {
            pipeline,
            transport: self.transport,
            health: self.health,
        })
    }
}

/// Configuration for a [`Runtime`].
#[derive(Debug)]
pub struct RuntimeConfig {
    pipeline: Arc<Pipeline>,
    transport: Transport,
    health: Option<HealthServer>,
}

impl RuntimeConfig {
    /// Bind listeners and spawn the transport and health tasks.
    pub async fn start(self) -> Result<Runtime> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline = self.pipeline;

        let health_handle = match self.health {
            Some(health) => {
                let listener = TcpListener::bind(health.addr).await?;
                info!(addr = %listener.local_addr()?, "Health server starting");
                let router = server::health_router(HealthState {
                    pipeline: pipeline.clone(),
                    monitoring: health.monitoring,
                    debug_envs: health.debug_envs.into(),
                });
                let shutdown = shutdown_rx.clone();
                Some(tokio::spawn(async move {
                    server::serve(listener, router, shutdown).await?;
                    Ok(())
                }))
            }
            None => None,
        };

        let (main_handle, http_addr) = match self.transport {
            Transport::Http { addr } => {
                let listener = TcpListener::bind(addr).await?;
                let local = listener.local_addr()?;
                let router = server::message_router(pipeline.clone());
                let pipeline = pipeline.clone();
                let handle = tokio::spawn(async move {
                    server::serve(listener, router, shutdown_rx).await?;
                    pipeline.drain().await;
                    if let Err(err) = pipeline.adapter().close().await {
                        warn!(error = %err, "Adapter close failed");
                    }
                    Ok(())
                });
                (handle, Some(local))
            }
            Transport::Stream {
                source,
                sink,
                router,
                max_in_flight,
            } => {
                let consumer = KafkaLoop::new(source, sink, pipeline.clone(), router)
                    .max_in_flight(max_in_flight);
                let handle = tokio::spawn(async move {
                    consumer.run(shutdown_rx).await?;
                    Ok(())
                });
                (handle, None)
            }
        };

        info!(http_addr = ?http_addr, "Runtime started");

        Ok(Runtime {
            main_handle,
            health_handle,
            shutdown_tx,
            pipeline,
            http_addr,
        })
    }
}

/// A running parley instance.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct Runtime {
    main_handle: JoinHandle<Result<()>>,
    health_handle: Option<JoinHandle<Result<()>>>,
    shutdown_tx: watch::Sender<bool>,
    pipeline: Arc<Pipeline>,
    http_addr: Option<SocketAddr>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Bound address of the HTTP message server, if serving HTTP.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting messages, waits for in-flight work and closes the
    /// adapter.
    pub async fn shutdown(self) -> Result<()> {
        info!("Runtime shutting down...");

        let _ = self.shutdown_tx.send(true);

        let result = join("transport", self.main_handle).await;
        if let Some(handle) = self.health_handle {
            if let Err(e) = join("health", handle).await {
                warn!("Health server error during shutdown: {}", e);
            }
        }
        if result.is_ok() {
            info!("Runtime shutdown complete");
        }
        result
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.main_handle.is_finished()
    }
}

async fn join(name: &str, handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("{} task error during shutdown: {}", name, e);
            Err(e)
        }
        Err(e) => {
            error!("{} task panicked: {}", name, e);
            Err(anyhow::anyhow!("{} task panicked: {}", name, e))
        }
    }
}
