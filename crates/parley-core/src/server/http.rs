// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message endpoint.
//!
//! Every request body is one protocol message; the reply is returned inline:
//!
//! | Outcome                  | Status | Body                               |
//! |--------------------------|--------|------------------------------------|
//! | exactly one reply        | 200    | the reply                          |
//! | no reply                 | 204    | `NOTHING_FOUND`                    |
//! | malformed or invalid     | 400    | `ERROR` `{code:-1, "Invalid Message"}` |
//! | bad or multiple replies  | 500    | `BAD_ANSWER`                       |

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use bytes::Bytes;
use tracing::{error, warn};

use crate::frame::Frame;
use crate::message::Headers;
use crate::metrics::Counter;
use crate::outgoing::{Command, Encoding, OutgoingMessage};
use crate::pipeline::{Outcome, Pipeline, Processed};
use crate::stats;

/// Prefix of request headers carrying protocol headers.
pub const SMART_APP_PREFIX: &str = "smart-app-";

/// Build the message router.
pub fn message_router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/health", get(super::health))
        .route("/health_db_adapter", get(super::health_db_adapter))
        .route("/", any(handle_message))
        .route("/{*tail}", any(handle_message))
        .with_state(pipeline)
}

/// Extract protocol headers: `Smart-App-X-Y: v` becomes `x_y: v`.
pub fn promote_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().strip_prefix(SMART_APP_PREFIX)?;
            if name.is_empty() {
                return None;
            }
            Some((name.replace('-', "_"), value.as_bytes().to_vec()))
        })
        .collect()
}

async fn handle_message(
    State(pipeline): State<Arc<Pipeline>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    stats::in_new_scope(respond(pipeline, headers, body)).await
}

async fn respond(pipeline: Arc<Pipeline>, headers: HeaderMap, body: Bytes) -> Response {
    let Processed {
        message,
        outcome,
        user,
    } = pipeline
        .process_raw(&body, promote_headers(&headers), true)
        .await;

    let (status, reply) = match outcome {
        Outcome::Replies(mut replies) if replies.len() == 1 => match replies.pop() {
            Some(reply) => (StatusCode::OK, reply),
            None => (
                StatusCode::INTERNAL_SERVER_ERROR,
                pipeline.compose(&message, Command::bad_answer()),
            ),
        },
        Outcome::Replies(replies) => {
            pipeline.metrics().inc(Counter::BadAnswer);
            error!(
                count = replies.len(),
                message_id = message.message_id(),
                "Scenario produced several replies for an HTTP request"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                pipeline.compose(&message, Command::bad_answer()),
            )
        }
        Outcome::NothingFound => (
            StatusCode::NO_CONTENT,
            pipeline.compose(&message, Command::nothing_found()),
        ),
        Outcome::Rejected(rejection) => {
            warn!(error = %rejection, "Rejecting HTTP request");
            (
                StatusCode::BAD_REQUEST,
                pipeline.compose(&message, Command::invalid_message()),
            )
        }
        Outcome::BadAnswer(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            pipeline.compose(&message, Command::bad_answer()),
        ),
    };

    let response = render(status, &reply);
    pipeline.metrics().inc(Counter::OutgoingMessage);

    if let Some(user) = user {
        pipeline.spawn_postprocess(message, user);
    }
    response
}

fn render(status: StatusCode, reply: &OutgoingMessage) -> Response {
    let body = match reply.to_bytes() {
        Ok(body) => body,
        Err(err) => {
            error!(error = %err, "Failed to encode reply");
            return encode_failure(reply.encoding, &err.to_string());
        }
    };
    let content_type = match reply.encoding {
        Encoding::Json => "application/json",
        Encoding::Binary => "application/octet-stream",
    };

    let mut response = (status, body).into_response();
    let out = response.headers_mut();
    out.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    for (name, value) in reply.headers.iter() {
        let header = format!("{SMART_APP_PREFIX}{}", name.replace('_', "-"));
        match (
            HeaderName::from_bytes(header.as_bytes()),
            HeaderValue::from_bytes(value),
        ) {
            (Ok(name), Ok(value)) => {
                out.insert(name, value);
            }
            _ => warn!(header = %header, "Skipping header that is not valid HTTP"),
        }
    }
    response
}

// Binary consumers get the failure as an error frame.
fn encode_failure(encoding: Encoding, description: &str) -> Response {
    let status = StatusCode::INTERNAL_SERVER_ERROR;
    match encoding {
        Encoding::Json => status.into_response(),
        Encoding::Binary => match Frame::error(description) {
            Ok(frame) => (
                status,
                [(CONTENT_TYPE, "application/octet-stream")],
                frame.encode(),
            )
                .into_response(),
            Err(_) => status.into_response(),
        },
    }
}
