// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound protocol envelope.

use serde_json::{Map, Value};
use thiserror::Error;

use super::{CALLBACK_ID_HEADER, Headers, ProtocolMessage};
use crate::masking::Masker;

/// Raised when a frame is not a JSON object.
#[derive(Debug, Error)]
pub enum MalformedMessage {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is valid JSON but not an object.
    #[error("message must be a JSON object")]
    NotAnObject,
}

/// Parsed inbound message with typed access to the well-known keys.
#[derive(Debug, Clone)]
pub struct Envelope {
    raw: Map<String, Value>,
    headers: Headers,
    callback_id: Option<String>,
    callback_from_message_id: bool,
}

impl Envelope {
    /// Parse a raw frame.
    pub fn parse(bytes: &[u8], headers: Headers) -> Result<Self, MalformedMessage> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(raw) => Ok(Self::from_map(raw, headers)),
            _ => Err(MalformedMessage::NotAnObject),
        }
    }

    /// Wrap an already parsed field map.
    pub fn from_map(raw: Map<String, Value>, headers: Headers) -> Self {
        Self {
            raw,
            headers,
            callback_id: None,
            callback_from_message_id: false,
        }
    }

    /// Derive the callback id from `messageId` when no headers were supplied.
    ///
    /// Used by the HTTP transport, where the caller correlates by request.
    pub fn with_http_callback(mut self) -> Self {
        self.callback_from_message_id = true;
        self
    }

    /// Override the callback id.
    pub fn set_callback_id(&mut self, callback_id: impl Into<String>) {
        self.callback_id = Some(callback_id.into());
    }

    /// Callback correlation id, if any source provides one.
    pub fn callback_id(&self) -> Option<String> {
        if let Some(id) = &self.callback_id {
            return Some(id.clone());
        }
        if let Some(id) = self.headers.get_str(CALLBACK_ID_HEADER) {
            return Some(id.to_string());
        }
        if self.callback_from_message_id && self.headers.is_empty() {
            return self.message_id().map(|id| id.to_string());
        }
        None
    }

    /// Per-user monotonic message id.
    pub fn message_id(&self) -> Option<i64> {
        self.raw.get("messageId").and_then(Value::as_i64)
    }

    /// Session id.
    pub fn session_id(&self) -> Option<&str> {
        self.raw.get("sessionId").and_then(Value::as_str)
    }

    /// The `uuid` sub-map.
    pub fn uuid(&self) -> Option<&Map<String, Value>> {
        self.raw.get("uuid").and_then(Value::as_object)
    }

    fn uuid_str(&self, key: &str) -> Option<&str> {
        self.uuid()?.get(key).and_then(Value::as_str)
    }

    /// `uuid.userId`.
    pub fn user_id(&self) -> Option<&str> {
        self.uuid_str("userId")
    }

    /// `uuid.userChannel`.
    pub fn user_channel(&self) -> Option<&str> {
        self.uuid_str("userChannel")
    }

    /// `uuid.sub`.
    pub fn sub(&self) -> Option<&str> {
        self.uuid_str("sub")
    }

    /// `uuid.sid`.
    pub fn sid(&self) -> Option<&str> {
        self.uuid_str("sid")
    }

    /// Composite user key `{userId}_{userChannel}`.
    pub fn db_uid(&self) -> Option<String> {
        Some(format!("{}_{}", self.user_id()?, self.user_channel()?))
    }

    /// Underlying field map.
    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    /// Stable JSON text of the field map (non-ASCII kept as is).
    pub fn as_str(&self) -> String {
        Value::Object(self.raw.clone()).to_string()
    }

    /// Masked JSON text, safe for logs.
    pub fn masked_value(&self, masker: &Masker) -> String {
        masker.mask_to_string(&Value::Object(self.raw.clone()))
    }
}

impl ProtocolMessage for Envelope {
    fn field(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }
}
