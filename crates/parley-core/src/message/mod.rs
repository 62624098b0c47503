// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound protocol messages and their validation.
//!
//! Message schemas are opaque to the runtime: an [`Envelope`] keeps the raw
//! field map and only exposes typed accessors for the handful of well-known
//! keys the pipeline routes on.

mod envelope;
pub mod schema;
pub mod validators;

pub use envelope::{Envelope, MalformedMessage};
pub use schema::JsonSchemaValidator;
pub use validators::{
    FailureMode, FieldType, HeadersRequiredValidator, RequiredFieldsValidator, ValidationError,
    Validator, ValidatorChain,
};

use serde_json::{Map, Value};

/// Header carrying the callback correlation id.
pub const CALLBACK_ID_HEADER: &str = "app_callback_id";

/// Case-preserving header list with byte-string values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, Vec<u8>)>);

impl Headers {
    /// Create an empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name`, replacing an existing value with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Raw value of `name`.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Value of `name` if it is valid UTF-8.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Iterate headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: Into<String>, V: Into<Vec<u8>>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// Capability set validators work against.
pub trait ProtocolMessage {
    /// Raw value of a top-level field.
    fn field(&self, key: &str) -> Option<&Value>;

    /// Transport headers.
    fn headers(&self) -> &Headers;

    fn message_name(&self) -> Option<&str> {
        self.field("messageName").and_then(Value::as_str)
    }

    fn payload(&self) -> Option<&Map<String, Value>> {
        self.field("payload").and_then(Value::as_object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_replace_and_preserve_case() {
        let mut headers = Headers::new();
        headers.insert("App-Key", "a");
        headers.insert("app-key", "b");
        headers.insert("App-Key", "c");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get_str("App-Key"), Some("c"));
        assert_eq!(headers.get_str("app-key"), Some("b"));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn test_non_utf8_header_value() {
        let headers: Headers = [("raw", vec![0xff, 0xfe])].into_iter().collect();
        assert_eq!(headers.get("raw"), Some(&[0xff, 0xfe][..]));
        assert_eq!(headers.get_str("raw"), None);
    }
}
