// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON-schema payload validation keyed by `messageName`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use super::{ProtocolMessage, ValidationError, Validator};

/// Failure to load or compile a schema.
#[derive(Debug, Error)]
pub enum SchemaLoadError {
    #[error("failed to read schema {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("schema {path} is not valid JSON: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("schema for {message_name} does not compile: {reason}")]
    Compile {
        message_name: String,
        reason: String,
    },
}

/// Validates `payload` against a schema compiled per message name.
///
/// Messages whose name has no schema pass.
#[derive(Default)]
pub struct JsonSchemaValidator {
    schemas: HashMap<String, jsonschema::Validator>,
}

impl fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.schemas.keys().collect();
        names.sort();
        f.debug_struct("JsonSchemaValidator")
            .field("schemas", &names)
            .finish()
    }
}

impl JsonSchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `schema` for `message_name`.
    pub fn insert(
        &mut self,
        message_name: impl Into<String>,
        schema: &Value,
    ) -> Result<(), SchemaLoadError> {
        let message_name = message_name.into();
        let compiled =
            jsonschema::validator_for(schema).map_err(|err| SchemaLoadError::Compile {
                message_name: message_name.clone(),
                reason: err.to_string(),
            })?;
        self.schemas.insert(message_name, compiled);
        Ok(())
    }

    /// Load every `<messageName>.json` file in `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, SchemaLoadError> {
        let io_err = |source| SchemaLoadError::Io {
            path: dir.display().to_string(),
            source,
        };
        let mut validator = Self::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(message_name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = std::fs::read_to_string(&path).map_err(|source| SchemaLoadError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let schema: Value =
                serde_json::from_str(&text).map_err(|source| SchemaLoadError::Json {
                    path: path.display().to_string(),
                    source,
                })?;
            validator.insert(message_name, &schema)?;
            debug!(message_name, "Compiled message schema");
        }
        info!(count = validator.len(), dir = %dir.display(), "Message schemas loaded");
        Ok(validator)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl Validator for JsonSchemaValidator {
    fn name(&self) -> &'static str {
        "json_schema"
    }

    fn validate(&self, message: &dyn ProtocolMessage) -> Result<(), ValidationError> {
        let Some(message_name) = message.message_name() else {
            return Ok(());
        };
        let Some(schema) = self.schemas.get(message_name) else {
            return Ok(());
        };
        let payload = message.field("payload").cloned().unwrap_or(Value::Null);
        let reasons: Vec<String> = schema
            .iter_errors(&payload)
            .map(|err| err.to_string())
            .collect();
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::Schema {
                message_name: message_name.to_string(),
                reason: reasons.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Envelope, Headers};
    use serde_json::json;

    fn message(name: &str, payload: Value) -> Envelope {
        Envelope::from_map(
            json!({"messageName": name, "payload": payload})
                .as_object()
                .unwrap()
                .clone(),
            Headers::new(),
        )
    }

    fn greeting_schema() -> Value {
        json!({
            "type": "object",
            "required": ["pronounceText"],
            "properties": {"pronounceText": {"type": "string"}}
        })
    }

    #[test]
    fn test_payload_checked_against_named_schema() {
        let mut validator = JsonSchemaValidator::new();
        validator.insert("ANSWER_TO_USER", &greeting_schema()).unwrap();

        assert_eq!(
            validator.validate(&message("ANSWER_TO_USER", json!({"pronounceText": "hi"}))),
            Ok(())
        );
        let err = validator
            .validate(&message("ANSWER_TO_USER", json!({"pronounceText": 3})))
            .unwrap_err();
        assert!(matches!(err, ValidationError::Schema { ref message_name, .. } if message_name == "ANSWER_TO_USER"));
    }

    #[test]
    fn test_unknown_message_name_passes() {
        let validator = JsonSchemaValidator::new();
        assert_eq!(validator.validate(&message("OTHER", json!(1))), Ok(()));
    }

    #[test]
    fn test_from_dir_loads_json_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ANSWER_TO_USER.json"),
            greeting_schema().to_string(),
        )
        .unwrap();
        std::fs::write(dir.path().join("README.txt"), "ignored").unwrap();

        let validator = JsonSchemaValidator::from_dir(dir.path()).unwrap();
        assert_eq!(validator.len(), 1);
        assert!(
            validator
                .validate(&message("ANSWER_TO_USER", json!({})))
                .is_err()
        );
    }

    #[test]
    fn test_invalid_schema_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("BROKEN.json"), "{not json").unwrap();
        assert!(matches!(
            JsonSchemaValidator::from_dir(dir.path()),
            Err(SchemaLoadError::Json { .. })
        ));
    }
}
