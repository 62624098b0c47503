// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TTL variable stores kept inside the user state.
//!
//! Two stores share the [`VariableStore`] contract:
//!
//! | Store | Keyed by | Default TTL |
//! |-------|----------|-------------|
//! | [`Variables`] | variable name | 24 hours |
//! | [`MidVariables`] | inbound `messageId`, then variable name | `vps_waiting_timeout` |
//!
//! Every entry carries an absolute expiry in seconds since the Unix epoch.
//! Expired entries are swept on read, so a value is never observed after its
//! expiry even if nobody called [`VariableStore::expire`] explicitly.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::clock::SharedClock;

/// Default TTL for user variables.
pub const DEFAULT_VARIABLES_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default TTL for per-message variables when no setting overrides it.
pub const DEFAULT_MID_VARIABLES_TTL: Duration = Duration::from_millis(2_000);

/// Errors raised by variable stores.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VariablesError {
    /// The store does not implement the operation.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// Per-message operation attempted before a message id was bound.
    #[error("no message id bound to per-message variables")]
    NoMessageId,
}

/// Shared contract of the TTL variable stores.
pub trait VariableStore {
    /// Store `value` under `key`, expiring after `ttl` (or the store default).
    fn set(&mut self, key: &str, value: Value, ttl: Option<Duration>)
    -> Result<(), VariablesError>;

    /// Current value of `key`, or `None` if absent or expired.
    fn get(&mut self, key: &str) -> Option<Value>;

    /// Current value of `key`, or `default` if absent or expired.
    fn get_or(&mut self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Replace the value of `key`, keeping its expiry when the key exists.
    fn update(
        &mut self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), VariablesError>;

    /// Remove `key`.
    fn delete(&mut self, key: &str);

    /// Remove everything.
    fn clear(&mut self);

    /// Drop every entry whose expiry is at or before now.
    fn expire(&mut self);

    /// Live values keyed by name.
    fn values(&mut self) -> Map<String, Value>;

    /// Internal `(value, expiry)` representation, or `None` if the store must not be persisted.
    fn raw(&self) -> Option<Value>;
}

/// Plain TTL variable store.
pub struct Variables {
    items: BTreeMap<String, (Value, f64)>,
    default_ttl: Duration,
    savable: bool,
    clock: SharedClock,
}

impl std::fmt::Debug for Variables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variables")
            .field("items", &self.items)
            .field("default_ttl", &self.default_ttl)
            .field("savable", &self.savable)
            .finish()
    }
}

impl Variables {
    /// Create an empty, savable store.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            items: BTreeMap::new(),
            default_ttl: DEFAULT_VARIABLES_TTL,
            savable: true,
            clock,
        }
    }

    /// Restore a store from its [`raw`](VariableStore::raw) form.
    ///
    /// Malformed entries are skipped.
    pub fn from_raw(raw: Option<&Value>, clock: SharedClock) -> Self {
        let mut store = Self::new(clock);
        if let Some(Value::Object(map)) = raw {
            for (key, entry) in map {
                if let Some((value, expiry)) = parse_entry(entry) {
                    store.items.insert(key.clone(), (value, expiry));
                }
            }
        }
        store
    }

    /// Override the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Mark the store as transient: [`raw`](VariableStore::raw) returns `None`.
    pub fn unsavable(mut self) -> Self {
        self.savable = false;
        self
    }

    /// Absolute expiry of `key`, if present.
    pub fn expiry_of(&self, key: &str) -> Option<f64> {
        self.items.get(key).map(|(_, expiry)| *expiry)
    }

    fn deadline(&self, ttl: Option<Duration>) -> f64 {
        self.clock.now_secs() + ttl.unwrap_or(self.default_ttl).as_secs_f64()
    }
}

impl VariableStore for Variables {
    fn set(
        &mut self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), VariablesError> {
        let expiry = self.deadline(ttl);
        self.items.insert(key.to_string(), (value, expiry));
        Ok(())
    }

    fn get(&mut self, key: &str) -> Option<Value> {
        self.expire();
        self.items.get(key).map(|(value, _)| value.clone())
    }

    fn update(
        &mut self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), VariablesError> {
        self.expire();
        match self.items.get_mut(key) {
            Some(entry) => {
                entry.0 = value;
                Ok(())
            }
            None => self.set(key, value, ttl),
        }
    }

    fn delete(&mut self, key: &str) {
        self.items.remove(key);
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn expire(&mut self) {
        let now = self.clock.now_secs();
        self.items.retain(|_, (_, expiry)| *expiry > now);
    }

    fn values(&mut self) -> Map<String, Value> {
        self.expire();
        self.items
            .iter()
            .map(|(key, (value, _))| (key.clone(), value.clone()))
            .collect()
    }

    fn raw(&self) -> Option<Value> {
        if !self.savable {
            return None;
        }
        let map = self
            .items
            .iter()
            .map(|(key, (value, expiry))| (key.clone(), entry_value(value.clone(), *expiry)))
            .collect();
        Some(Value::Object(map))
    }
}

/// Variables scoped to a single inbound message.
///
/// The outer map is keyed by the stringified `messageId`; each outer entry holds
/// a map of variables and a single expiry shared by all of them.
pub struct MidVariables {
    items: BTreeMap<String, (Map<String, Value>, f64)>,
    message_id: Option<String>,
    default_ttl: Duration,
    savable: bool,
    clock: SharedClock,
}

impl std::fmt::Debug for MidVariables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidVariables")
            .field("items", &self.items)
            .field("message_id", &self.message_id)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl MidVariables {
    /// Create an empty store with the given default TTL.
    pub fn new(default_ttl: Duration, clock: SharedClock) -> Self {
        Self {
            items: BTreeMap::new(),
            message_id: None,
            default_ttl,
            savable: true,
            clock,
        }
    }

    /// Restore a store from its raw form.
    pub fn from_raw(raw: Option<&Value>, default_ttl: Duration, clock: SharedClock) -> Self {
        let mut store = Self::new(default_ttl, clock);
        if let Some(Value::Object(map)) = raw {
            for (mid, entry) in map {
                if let Some((Value::Object(inner), expiry)) = parse_entry(entry) {
                    store.items.insert(mid.clone(), (inner, expiry));
                }
            }
        }
        store
    }

    /// Mark the store as transient.
    pub fn unsavable(mut self) -> Self {
        self.savable = false;
        self
    }

    /// Bind the store to the message currently being processed.
    pub fn set_message_id(&mut self, message_id: impl ToString) {
        self.message_id = Some(message_id.to_string());
    }

    /// Message id the store is bound to.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Expiry of the current message's entry.
    pub fn current_expiry(&self) -> Option<f64> {
        let mid = self.message_id.as_ref()?;
        self.items.get(mid).map(|(_, expiry)| *expiry)
    }

    /// Drop every variable recorded for the current message.
    pub fn delete_for_current_message(&mut self) {
        if let Some(mid) = &self.message_id {
            self.items.remove(mid);
        }
    }

    fn current(&mut self) -> Option<&mut Map<String, Value>> {
        self.expire();
        let mid = self.message_id.as_ref()?;
        self.items.get_mut(mid).map(|(inner, _)| inner)
    }
}

impl VariableStore for MidVariables {
    fn set(
        &mut self,
        _key: &str,
        _value: Value,
        _ttl: Option<Duration>,
    ) -> Result<(), VariablesError> {
        Err(VariablesError::UnsupportedOperation("set"))
    }

    fn get(&mut self, key: &str) -> Option<Value> {
        self.current().and_then(|inner| inner.get(key).cloned())
    }

    /// An explicit `ttl` moves the expiry of the whole message entry to
    /// `now + ttl`; without one the stored expiry is kept.
    fn update(
        &mut self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), VariablesError> {
        self.expire();
        let mid = self.message_id.clone().ok_or(VariablesError::NoMessageId)?;
        let now = self.clock.now_secs();
        let default_ttl = self.default_ttl;
        let entry = self
            .items
            .entry(mid)
            .or_insert_with(|| (Map::new(), now + ttl.unwrap_or(default_ttl).as_secs_f64()));
        entry.0.insert(key.to_string(), value);
        if let Some(ttl) = ttl {
            entry.1 = now + ttl.as_secs_f64();
        }
        Ok(())
    }

    fn delete(&mut self, key: &str) {
        if let Some(inner) = self.current() {
            inner.remove(key);
        }
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn expire(&mut self) {
        let now = self.clock.now_secs();
        self.items.retain(|_, (_, expiry)| *expiry > now);
    }

    fn values(&mut self) -> Map<String, Value> {
        self.current().cloned().unwrap_or_default()
    }

    fn raw(&self) -> Option<Value> {
        if !self.savable {
            return None;
        }
        let map = self
            .items
            .iter()
            .map(|(mid, (inner, expiry))| {
                (mid.clone(), entry_value(Value::Object(inner.clone()), *expiry))
            })
            .collect();
        Some(Value::Object(map))
    }
}

fn entry_value(value: Value, expiry: f64) -> Value {
    Value::Array(vec![value, Value::from(expiry)])
}

fn parse_entry(entry: &Value) -> Option<(Value, f64)> {
    match entry {
        Value::Array(pair) if pair.len() == 2 => Some((pair[0].clone(), pair[1].as_f64()?)),
        _ => None,
    }
}
