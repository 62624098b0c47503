// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pluggable inbound message validators.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::ProtocolMessage;

/// Fields required when a message name has no entry of its own.
pub const DEFAULT_REQUIRED_FIELDS: &[&str] =
    &["messageId", "messageName", "sessionId", "uuid", "payload"];

/// Why a message was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// Headers were required but none were received.
    #[error("headers are required but none were received")]
    MissingHeaders,

    /// A required field is absent.
    #[error("{message_name}: missing required field '{field}'")]
    MissingField { message_name: String, field: String },

    /// A field has the wrong JSON type.
    #[error("field '{field}' must be of type {expected}")]
    WrongType { field: String, expected: FieldType },

    /// The payload does not satisfy the message schema.
    #[error("{message_name}: payload rejected by schema: {reason}")]
    Schema { message_name: String, reason: String },
}

/// JSON type a field is expected to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    String,
    Map,
    List,
    Bool,
}

impl FieldType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::String => value.is_string(),
            FieldType::Map => value.is_object(),
            FieldType::List => value.is_array(),
            FieldType::Bool => value.is_boolean(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Int => "int",
            FieldType::String => "string",
            FieldType::Map => "map",
            FieldType::List => "list",
            FieldType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// A single validation rule.
pub trait Validator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn validate(&self, message: &dyn ProtocolMessage) -> Result<(), ValidationError>;
}

/// Rejects messages without headers when headers are mandatory.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadersRequiredValidator {
    required: bool,
}

impl HeadersRequiredValidator {
    pub fn new(required: bool) -> Self {
        Self { required }
    }
}

impl Validator for HeadersRequiredValidator {
    fn name(&self) -> &'static str {
        "headers_required"
    }

    fn validate(&self, message: &dyn ProtocolMessage) -> Result<(), ValidationError> {
        if self.required && message.headers().is_empty() {
            return Err(ValidationError::MissingHeaders);
        }
        Ok(())
    }
}

/// Checks the per-message-name required key set and the field type table.
#[derive(Debug, Clone)]
pub struct RequiredFieldsValidator {
    by_name: HashMap<String, Vec<String>>,
    default_fields: Vec<String>,
    types: HashMap<String, FieldType>,
}

impl Default for RequiredFieldsValidator {
    fn default() -> Self {
        Self {
            by_name: HashMap::new(),
            default_fields: DEFAULT_REQUIRED_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            types: HashMap::from([
                ("messageId".to_string(), FieldType::Int),
                ("messageName".to_string(), FieldType::String),
                ("sessionId".to_string(), FieldType::String),
                ("payload".to_string(), FieldType::Map),
                ("uuid".to_string(), FieldType::Map),
            ]),
        }
    }
}

impl RequiredFieldsValidator {
    /// Override the required set for one message name.
    pub fn with_required(
        mut self,
        message_name: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.by_name.insert(
            message_name.into(),
            fields.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Set or replace the expected type of `field`.
    pub fn with_type(mut self, field: impl Into<String>, field_type: FieldType) -> Self {
        self.types.insert(field.into(), field_type);
        self
    }

    fn required_for(&self, message_name: Option<&str>) -> &[String] {
        message_name
            .and_then(|name| self.by_name.get(name))
            .unwrap_or(&self.default_fields)
    }
}

impl Validator for RequiredFieldsValidator {
    fn name(&self) -> &'static str {
        "required_fields"
    }

    fn validate(&self, message: &dyn ProtocolMessage) -> Result<(), ValidationError> {
        let message_name = message.message_name();
        for field in self.required_for(message_name) {
            let Some(value) = message.field(field) else {
                return Err(ValidationError::MissingField {
                    message_name: message_name.unwrap_or_default().to_string(),
                    field: field.clone(),
                });
            };
            match self.types.get(field) {
                Some(expected) if !expected.matches(value) => {
                    return Err(ValidationError::WrongType {
                        field: field.clone(),
                        expected: *expected,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// What a [`ValidatorChain`] does with a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Return the first failure.
    #[default]
    Raise,
    /// Log the failure and accept the message.
    LogAndContinue,
}

/// Ordered list of validators.
#[derive(Clone, Default)]
pub struct ValidatorChain {
    validators: Vec<Arc<dyn Validator>>,
    mode: FailureMode,
}

impl fmt::Debug for ValidatorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorChain")
            .field(
                "validators",
                &self.validators.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .field("mode", &self.mode)
            .finish()
    }
}

impl ValidatorChain {
    pub fn new(mode: FailureMode) -> Self {
        Self {
            validators: Vec::new(),
            mode,
        }
    }

    /// Append a validator; validators run in insertion order.
    pub fn push(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Append a validator shared with another chain.
    pub fn push_shared(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Run every validator in order, stopping at the first failure in
    /// [`FailureMode::Raise`].
    pub fn validate(&self, message: &dyn ProtocolMessage) -> Result<(), ValidationError> {
        for validator in &self.validators {
            if let Err(err) = validator.validate(message) {
                match self.mode {
                    FailureMode::Raise => return Err(err),
                    FailureMode::LogAndContinue => {
                        warn!(validator = validator.name(), error = %err, "Message failed validation");
                    }
                }
            }
        }
        Ok(())
    }
}
