// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Liveness server.

use std::sync::Arc;

use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Map, Value};

use crate::pipeline::Pipeline;

/// Shared state of the health router.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub pipeline: Arc<Pipeline>,
    /// Serve `/metrics`.
    pub monitoring: bool,
    /// Environment variables reported by `/debug_envs`.
    pub debug_envs: Arc<[String]>,
}

impl FromRef<HealthState> for Arc<Pipeline> {
    fn from_ref(state: &HealthState) -> Self {
        state.pipeline.clone()
    }
}

/// Build the health router.
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(super::health))
        .route("/health_db_adapter", get(super::health_db_adapter))
        .route("/metrics", get(metrics))
        .route("/debug_envs", get(debug_envs))
        .with_state(state)
}

async fn metrics(State(state): State<HealthState>) -> Response {
    if !state.monitoring {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.pipeline.metrics().render(),
    )
        .into_response()
}

async fn debug_envs(State(state): State<HealthState>) -> Json<Map<String, Value>> {
    let envs = state
        .debug_envs
        .iter()
        .map(|name| {
            let value = std::env::var(name).map(Value::String).unwrap_or(Value::Null);
            (name.clone(), value)
        })
        .collect();
    Json(envs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryAdapter, MemoryAdapterConfig};
    use crate::clock::ManualClock;
    use crate::metrics::Counter;
    use crate::scenario::EchoScenario;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state(monitoring: bool) -> HealthState {
        let pipeline = Pipeline::builder()
            .adapter(Arc::new(MemoryAdapter::new(
                MemoryAdapterConfig::default(),
                ManualClock::new(0.0),
            )))
            .scenario(Arc::new(EchoScenario))
            .build()
            .unwrap();
        HealthState {
            pipeline: Arc::new(pipeline),
            monitoring,
            debug_envs: Arc::from(vec!["PARLEY_SURELY_UNSET_VARIABLE".to_string()]),
        }
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_metrics_rendered_when_monitoring() {
        let state = state(true);
        state.pipeline.metrics().inc(Counter::IncomingMessage);
        let (status, body) = get_body(health_router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("parley_incoming_message_total 1"));
    }

    #[tokio::test]
    async fn test_metrics_hidden_without_monitoring() {
        let (status, _) = get_body(health_router(state(false)), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_debug_envs_reports_unset_as_null() {
        let (status, body) = get_body(health_router(state(true)), "/debug_envs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"PARLEY_SURELY_UNSET_VARIABLE":null}"#);
    }

    #[tokio::test]
    async fn test_liveness_and_adapter_health() {
        let router = health_router(state(true));
        assert_eq!(
            get_body(router.clone(), "/health").await,
            (StatusCode::OK, "ok".to_string())
        );
        assert_eq!(
            get_body(router, "/health_db_adapter").await,
            (StatusCode::OK, "ok".to_string())
        );
    }
}
