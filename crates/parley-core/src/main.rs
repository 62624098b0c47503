// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parley - Assistant Request Runtime
//!
//! Serves the echo scenario over HTTP or Kafka, with the user state adapter,
//! masking and validation configured from `PARLEY_SETTINGS_PATH`.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use parley_core::clock;
use parley_core::config::{Config, KafkaSettings, LogFormat, Mode};
use parley_core::runtime::{HealthServer, Runtime, Transport};
use parley_core::scenario::EchoScenario;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    init_tracing()?;

    info!("Starting Parley");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let settings = &config.settings;

    info!(
        mode = ?config.mode,
        http_addr = %config.http_addr,
        settings_path = ?config.settings_path,
        adapter = ?settings.db_adapter,
        "Configuration loaded"
    );

    let pipeline = settings
        .connect_pipeline(Arc::new(EchoScenario), clock::system())
        .await?;

    let transport = match config.mode {
        Mode::Http => Transport::Http {
            addr: config.http_addr,
        },
        Mode::Kafka => kafka_transport(&settings.kafka)?,
    };

    let mut builder = Runtime::builder()
        .pipeline(Arc::new(pipeline))
        .transport(transport);
    if settings.health_check.enabled {
        builder = builder.health(HealthServer {
            addr: settings.health_check.addr(),
            monitoring: settings.monitoring.enabled,
            debug_envs: settings.health_check.debug_envs.clone(),
        });
    }
    let runtime = builder.build()?.start().await?;

    info!("Parley initialized successfully");

    // Wait for shutdown signal
    shutdown_signal().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}

fn init_tracing() -> Result<()> {
    // Read ahead of Config so configuration errors are logged in the right format.
    let format: LogFormat = std::env::var("PARLEY_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    let filter = EnvFilter::from_default_env()
        .add_directive("parley_core=info".parse()?)
        .add_directive("parley=info".parse()?);

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

#[cfg(feature = "kafka")]
fn kafka_transport(settings: &KafkaSettings) -> Result<Transport> {
    use parley_core::transport::TopicRouter;
    use parley_core::transport::kafka::{KafkaSink, KafkaSource};

    Ok(Transport::Stream {
        source: Box::new(KafkaSource::new(settings)?),
        sink: Arc::new(KafkaSink::new(settings)?),
        router: TopicRouter::new(settings.default_topic.clone(), settings.topics.clone()),
        max_in_flight: settings.max_in_flight,
    })
}

#[cfg(not(feature = "kafka"))]
fn kafka_transport(_settings: &KafkaSettings) -> Result<Transport> {
    anyhow::bail!("PARLEY_MODE=kafka requires a build with the `kafka` feature")
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
