// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-request user object and its persisted blob.
//!
//! The blob is UTF-8 JSON:
//!
//! ```text
//! {"variables": {...}, "mid_variables": {...}, "data": {...}}
//! ```
//!
//! Stores marked unsavable are omitted from the blob.

use std::fmt;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::clock::SharedClock;
use crate::message::Envelope;
use crate::stats::StatsLog;
use crate::variables::{MidVariables, VariableStore, Variables};

/// A stored blob could not be turned into a user.
#[derive(Debug, Error)]
pub enum UserBlobError {
    #[error("user blob is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("user blob must be a JSON object")]
    NotAnObject,
}

/// Builds users with shared TTL settings and clock.
#[derive(Clone)]
pub struct UserFactory {
    mid_variables_ttl: Duration,
    clock: SharedClock,
}

impl fmt::Debug for UserFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserFactory")
            .field("mid_variables_ttl", &self.mid_variables_ttl)
            .finish()
    }
}

impl UserFactory {
    pub fn new(mid_variables_ttl: Duration, clock: SharedClock) -> Self {
        Self {
            mid_variables_ttl,
            clock,
        }
    }

    /// Fresh user with no stored state.
    pub fn empty(&self, id: Option<String>) -> User {
        User {
            id,
            variables: Variables::new(self.clock.clone()),
            mid_variables: MidVariables::new(self.mid_variables_ttl, self.clock.clone()),
            data: Map::new(),
            do_not_save: false,
            load_error: false,
            inner_stats: StatsLog::new(),
        }
    }

    /// Empty user flagged as the result of a failed load.
    pub fn after_load_error(&self, id: Option<String>) -> User {
        let mut user = self.empty(id);
        user.load_error = true;
        user
    }

    /// Restore a user from a stored blob.
    pub fn from_blob(&self, id: String, blob: &[u8]) -> Result<User, UserBlobError> {
        let Value::Object(mut root) = serde_json::from_slice(blob)? else {
            return Err(UserBlobError::NotAnObject);
        };
        let data = match root.remove("data") {
            Some(Value::Object(data)) => data,
            _ => Map::new(),
        };
        Ok(User {
            id: Some(id),
            variables: Variables::from_raw(root.get("variables"), self.clock.clone()),
            mid_variables: MidVariables::from_raw(
                root.get("mid_variables"),
                self.mid_variables_ttl,
                self.clock.clone(),
            ),
            data,
            do_not_save: false,
            load_error: false,
            inner_stats: StatsLog::new(),
        })
    }
}

/// State of one user for the duration of one request.
#[derive(Debug)]
pub struct User {
    id: Option<String>,
    pub variables: Variables,
    pub mid_variables: MidVariables,
    /// Scenario-owned state.
    pub data: Map<String, Value>,
    /// Skip persisting this user at the end of the request.
    pub do_not_save: bool,
    load_error: bool,
    inner_stats: StatsLog,
}

impl User {
    /// Composite user id, absent when the message carried none.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn load_error(&self) -> bool {
        self.load_error
    }

    /// Timing spans recorded while handling the current request.
    pub fn inner_stats(&self) -> &StatsLog {
        &self.inner_stats
    }

    /// Scope per-message variables to `message`'s `messageId`.
    pub fn for_message(&mut self, message: &Envelope) {
        if let Some(message_id) = message.message_id() {
            self.mid_variables.set_message_id(message_id);
        }
    }

    /// Serialize to the stored blob format.
    pub fn to_blob(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut root = Map::new();
        if let Some(raw) = self.variables.raw() {
            root.insert("variables".into(), raw);
        }
        if let Some(raw) = self.mid_variables.raw() {
            root.insert("mid_variables".into(), raw);
        }
        root.insert("data".into(), Value::Object(self.data.clone()));
        serde_json::to_vec(&Value::Object(root))
    }
}
