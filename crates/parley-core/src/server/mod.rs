// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP servers for parley.
//!
//! Provides two router components:
//! - Message router: accepts protocol messages over HTTP and replies inline
//! - Health router: liveness, adapter health, metrics and debug endpoints,
//!   served on a separate listener when `health_check.enabled`

mod health;
mod http;

pub use health::{HealthState, health_router};
pub use http::{SMART_APP_PREFIX, message_router, promote_headers};

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::adapters::AdapterError;
use crate::metrics::Counter;
use crate::pipeline::Pipeline;

/// Serve `app` on `listener` until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "HTTP server listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // A dropped sender also ends the server.
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

async fn health() -> &'static str {
    "ok"
}

async fn health_db_adapter(State(pipeline): State<Arc<Pipeline>>) -> (StatusCode, String) {
    match pipeline.adapter().is_alive().await {
        Ok(true) => (StatusCode::OK, "ok".to_string()),
        Ok(false) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("adapter '{}' is not alive", pipeline.adapter().name()),
        ),
        Err(err) => {
            if matches!(err, AdapterError::Unsupported(_)) {
                pipeline.metrics().inc(Counter::UnsupportedOperation);
            }
            warn!(adapter = pipeline.adapter().name(), error = %err, "Adapter health check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
