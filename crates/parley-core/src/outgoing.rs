// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scenario commands and the outgoing envelopes built from them.

use bytes::Bytes;
use serde_json::{Map, Value, json};

use crate::frame::{Frame, FrameError};
use crate::message::{CALLBACK_ID_HEADER, Envelope, Headers, ProtocolMessage};

pub const ANSWER_TO_USER: &str = "ANSWER_TO_USER";
pub const NOTHING_FOUND: &str = "NOTHING_FOUND";
pub const ERROR: &str = "ERROR";
pub const BAD_ANSWER: &str = "BAD_ANSWER";

/// Payload key whose map is merged into the envelope root.
pub const ROOT_NODES: &str = "root_nodes";

/// How an outgoing message is serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// UTF-8 JSON text.
    #[default]
    Json,
    /// JSON wrapped in a length-prefixed [`Frame`].
    Binary,
}

/// One reply produced by a scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub payload: Map<String, Value>,
    /// Routing hints (`topic_key`, `kafka_key`); never serialized.
    pub request_data: Map<String, Value>,
    pub encoding: Encoding,
}

impl Command {
    /// Create a command; a non-object payload is stored under `value`.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other)]),
        };
        Self {
            name: name.into(),
            payload,
            request_data: Map::new(),
            encoding: Encoding::Json,
        }
    }

    pub fn nothing_found() -> Self {
        Self::new(NOTHING_FOUND, Value::Null)
    }

    pub fn error(code: i64, description: &str) -> Self {
        Self::new(ERROR, json!({"code": code, "description": description}))
    }

    /// Reply to a message that failed inbound validation.
    pub fn invalid_message() -> Self {
        Self::error(-1, "Invalid Message")
    }

    /// Reply used when the produced answer cannot be sent.
    pub fn bad_answer() -> Self {
        Self::new(BAD_ANSWER, json!({"code": -1, "description": "Bad Answer"}))
    }

    pub fn with_request_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.request_data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Logical topic selected by `request_data.topic_key`.
    pub fn topic_key(&self) -> Option<&str> {
        self.request_data.get("topic_key").and_then(Value::as_str)
    }

    /// Record key override from `request_data.kafka_key`.
    pub fn kafka_key(&self) -> Option<&str> {
        self.request_data.get("kafka_key").and_then(Value::as_str)
    }
}

/// Fully composed outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub body: Map<String, Value>,
    pub headers: Headers,
    pub encoding: Encoding,
    pub topic_key: Option<String>,
    pub kafka_key: Option<String>,
}

impl OutgoingMessage {
    /// Body as JSON text.
    pub fn as_str(&self) -> String {
        Value::Object(self.body.clone()).to_string()
    }

    /// Serialize according to [`Encoding`].
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let body = Value::Object(self.body.clone());
        match self.encoding {
            Encoding::Json => Ok(Bytes::from(serde_json::to_vec(&body)?)),
            Encoding::Binary => Ok(Frame::json(&body)?.encode()),
        }
    }

    pub fn callback_id(&self) -> Option<&str> {
        self.headers.get_str(CALLBACK_ID_HEADER)
    }
}

impl ProtocolMessage for OutgoingMessage {
    fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Builds outgoing envelopes from an inbound message and a command.
#[derive(Debug, Clone, Default)]
pub struct Composer {
    forward_payload_fields: Vec<String>,
}

impl Composer {
    /// `forward_payload_fields` are copied from the inbound payload when the
    /// command payload does not set them.
    pub fn new(forward_payload_fields: Vec<String>) -> Self {
        Self {
            forward_payload_fields,
        }
    }

    pub fn compose(&self, incoming: &Envelope, command: Command) -> OutgoingMessage {
        let topic_key = command.topic_key().map(str::to_string);
        let kafka_key = command.kafka_key().map(str::to_string);
        let Command {
            name,
            mut payload,
            encoding,
            ..
        } = command;

        if let Some(inbound) = incoming.payload() {
            for field in &self.forward_payload_fields {
                if payload.contains_key(field) {
                    continue;
                }
                if let Some(value) = inbound.get(field) {
                    payload.insert(field.clone(), value.clone());
                }
            }
        }

        let root_nodes = match payload.remove(ROOT_NODES) {
            Some(Value::Object(nodes)) => nodes,
            Some(other) => {
                payload.insert(ROOT_NODES.to_string(), other);
                Map::new()
            }
            None => Map::new(),
        };

        let raw = incoming.raw();
        let mut body = Map::new();
        body.insert(
            "messageId".into(),
            raw.get("messageId").cloned().unwrap_or(Value::Null),
        );
        body.insert(
            "sessionId".into(),
            raw.get("sessionId").cloned().unwrap_or(Value::Null),
        );
        body.insert("messageName".into(), Value::String(name));
        body.insert("payload".into(), Value::Object(payload));
        body.insert(
            "uuid".into(),
            raw.get("uuid").cloned().unwrap_or(Value::Null),
        );
        body.extend(root_nodes);

        let mut headers = incoming.headers().clone();
        if let Some(callback_id) = incoming.callback_id() {
            headers.insert(CALLBACK_ID_HEADER, callback_id);
        }

        OutgoingMessage {
            body,
            headers,
            encoding,
            topic_key,
            kafka_key,
        }
    }
}
