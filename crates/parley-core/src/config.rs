// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables and the settings file.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::adapters::AdapterConfig;
use crate::clock::SharedClock;
use crate::masking::{DEFAULT_MASKING_FIELDS, DEFAULT_PRESERVE_DEPTH, Masker};
use crate::message::schema::SchemaLoadError;
use crate::message::{FailureMode, JsonSchemaValidator, ValidatorChain};
use crate::metrics::Metrics;
use crate::outgoing::Composer;
use crate::pipeline::{
    Pipeline, PipelineBuilder, PipelineSettings, ScenarioErrorReply, default_incoming_validators,
};
use crate::scenario::Scenario;

/// Transport the binary serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Http,
    Kafka,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Mode::Http),
            "kafka" => Ok(Mode::Kafka),
            _ => Err(ConfigError::Invalid("PARLEY_MODE", "must be 'http' or 'kafka'")),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::Invalid(
                "PARLEY_LOG_FORMAT",
                "must be 'text' or 'json'",
            )),
        }
    }
}

/// Parley configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Settings file the template settings were read from
    pub settings_path: Option<PathBuf>,
    /// Transport to serve
    pub mode: Mode,
    /// Address of the message HTTP server
    pub http_addr: SocketAddr,
    pub log_format: LogFormat,
    pub settings: TemplateSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `PARLEY_SETTINGS_PATH`: JSON settings file (default: built-in settings)
    /// - `PARLEY_MODE`: `http` or `kafka` (default: `http`)
    /// - `PARLEY_HTTP_ADDR`: HTTP bind address (default: `0.0.0.0:8080`)
    /// - `PARLEY_LOG_FORMAT`: `text` or `json` (default: `text`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings_path = std::env::var("PARLEY_SETTINGS_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let mode: Mode = std::env::var("PARLEY_MODE")
            .unwrap_or_else(|_| "http".to_string())
            .parse()?;

        let http_addr: SocketAddr = std::env::var("PARLEY_HTTP_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("PARLEY_HTTP_ADDR", "must be a socket address"))?;

        let log_format: LogFormat = std::env::var("PARLEY_LOG_FORMAT")
            .unwrap_or_else(|_| "text".to_string())
            .parse()?;

        let settings = match &settings_path {
            Some(path) => TemplateSettings::from_file(path)?,
            None => TemplateSettings::default(),
        };
        if mode == Mode::Kafka {
            settings.kafka.validate()?;
        }

        Ok(Self {
            settings_path,
            mode,
            http_addr,
            log_format,
            settings,
        })
    }
}

/// Liveness server settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthCheckSettings {
    pub enabled: bool,
    pub port: u16,
    pub interface: IpAddr,
    /// Environment variables exposed at `/debug_envs`.
    pub debug_envs: Vec<String>,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8000,
            interface: IpAddr::from([0, 0, 0, 0]),
            debug_envs: Vec::new(),
        }
    }
}

impl HealthCheckSettings {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitoringSettings {
    pub enabled: bool,
    /// Prefix of exported metric names.
    pub prefix: String,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "parley".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub group_id: String,
    pub consumer_topics: Vec<String>,
    /// Topic used when a reply names no `topic_key`.
    pub default_topic: String,
    /// `topic_key` to topic name.
    pub topics: HashMap<String, String>,
    pub send_timeout_ms: u64,
    pub max_in_flight: usize,
}

impl KafkaSettings {
    /// Check the settings a consumer cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::Missing("kafka.brokers"));
        }
        if self.consumer_topics.is_empty() {
            return Err(ConfigError::Missing("kafka.consumer_topics"));
        }
        if self.default_topic.is_empty() {
            return Err(ConfigError::Missing("kafka.default_topic"));
        }
        Ok(())
    }
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            group_id: "parley".to_string(),
            consumer_topics: vec!["parley-in".to_string()],
            default_topic: "parley-out".to_string(),
            topics: HashMap::new(),
            send_timeout_ms: 5_000,
            max_in_flight: 256,
        }
    }
}

/// Masked fields as `{field: depth}` or a list of names at the default depth.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MaskingFields {
    Depths(HashMap<String, i32>),
    Names(Vec<String>),
}

impl Default for MaskingFields {
    fn default() -> Self {
        Self::Names(DEFAULT_MASKING_FIELDS.iter().map(|f| f.to_string()).collect())
    }
}

impl MaskingFields {
    pub fn depths(&self) -> Vec<(String, i32)> {
        match self {
            Self::Depths(map) => map.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            Self::Names(names) => names
                .iter()
                .map(|name| (name.clone(), DEFAULT_PRESERVE_DEPTH))
                .collect(),
        }
    }
}

/// The `template_settings` object of the settings file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TemplateSettings {
    pub db_adapter: AdapterConfig,
    pub user_save_collisions_tries: u32,
    /// Default TTL of per-message variables, in milliseconds.
    pub vps_waiting_timeout: u64,
    pub health_check: HealthCheckSettings,
    pub monitoring: MonitoringSettings,
    pub masking_fields: MaskingFields,
    pub masking_whitelist: Vec<String>,
    pub card_masking_fields: Option<Vec<String>>,
    pub forward_payload_fields: Vec<String>,
    pub require_headers: bool,
    pub adapter_get_tries: u32,
    pub scenario_error_reply: ScenarioErrorReply,
    pub kafka: KafkaSettings,
    pub message_schemas_path: Option<PathBuf>,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            db_adapter: AdapterConfig::default(),
            user_save_collisions_tries: 1,
            vps_waiting_timeout: 2_000,
            health_check: HealthCheckSettings::default(),
            monitoring: MonitoringSettings::default(),
            masking_fields: MaskingFields::default(),
            masking_whitelist: Vec::new(),
            card_masking_fields: None,
            forward_payload_fields: Vec::new(),
            require_headers: false,
            adapter_get_tries: 1,
            scenario_error_reply: ScenarioErrorReply::default(),
            kafka: KafkaSettings::default(),
            message_schemas_path: None,
        }
    }
}

impl TemplateSettings {
    /// Read `template_settings` from a JSON settings file.
    ///
    /// A file without the key yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        let mut root: Value = serde_json::from_str(text)?;
        match root.get_mut("template_settings").map(Value::take) {
            Some(settings) => serde_json::from_value(settings),
            None => Ok(Self::default()),
        }
    }

    pub fn mid_variables_ttl(&self) -> Duration {
        Duration::from_millis(self.vps_waiting_timeout)
    }

    pub fn masker(&self) -> Masker {
        let mut masker = Masker::new(self.masking_fields.depths())
            .with_whitelist(self.masking_whitelist.iter().cloned());
        if let Some(fields) = &self.card_masking_fields {
            masker = masker.with_card_fields(fields.iter().cloned());
        }
        masker
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            user_save_collisions_tries: self.user_save_collisions_tries,
            adapter_get_tries: self.adapter_get_tries,
            scenario_error_reply: self.scenario_error_reply,
        }
    }

    /// Incoming and outgoing validator chains. Payload schemas from
    /// `message_schemas_path` apply to both directions.
    pub fn validators(&self) -> Result<(ValidatorChain, ValidatorChain), SchemaLoadError> {
        let mut incoming = default_incoming_validators(self.require_headers);
        let mut outgoing = ValidatorChain::new(FailureMode::Raise);
        if let Some(dir) = &self.message_schemas_path {
            let schemas = Arc::new(JsonSchemaValidator::from_dir(dir)?);
            incoming = incoming.push_shared(schemas.clone());
            outgoing = outgoing.push_shared(schemas);
        }
        Ok((incoming, outgoing))
    }

    /// A pipeline builder carrying everything but the adapter and scenario.
    pub fn pipeline_builder(&self) -> Result<PipelineBuilder, SchemaLoadError> {
        let (incoming, outgoing) = self.validators()?;
        Ok(PipelineBuilder::new()
            .incoming_validators(incoming)
            .outgoing_validators(outgoing)
            .composer(Composer::new(self.forward_payload_fields.clone()))
            .masker(self.masker())
            .metrics(Arc::new(Metrics::new(self.monitoring.prefix.clone())))
            .mid_variables_ttl(self.mid_variables_ttl())
            .settings(self.pipeline_settings()))
    }

    /// Build and connect the configured adapter, then a pipeline running
    /// `scenario` over it.
    pub async fn connect_pipeline(
        &self,
        scenario: Arc<dyn Scenario>,
        clock: SharedClock,
    ) -> crate::Result<Pipeline> {
        let adapter = self.db_adapter.build(clock.clone());
        adapter.connect().await?;
        info!(adapter = adapter.name(), "Adapter connected");
        Ok(self
            .pipeline_builder()?
            .adapter(adapter)
            .scenario(scenario)
            .clock(clock)
            .build()?)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is missing or empty.
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),

    /// The settings file could not be read.
    #[error("failed to read settings file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid.
    #[error("invalid settings file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryAdapterConfig;
    use serde_json::json;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Sets env vars for a test and restores them on drop
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_all(&mut self) {
            for key in [
                "PARLEY_SETTINGS_PATH",
                "PARLEY_MODE",
                "PARLEY_HTTP_ADDR",
                "PARLEY_LOG_FORMAT",
            ] {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        let config = Config::from_env().unwrap();

        assert_eq!(config.mode, Mode::Http);
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.settings_path.is_none());
        assert_eq!(config.settings, TemplateSettings::default());
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            json!({"template_settings": {"user_save_collisions_tries": 3}}).to_string(),
        )
        .unwrap();

        guard.set("PARLEY_SETTINGS_PATH", path.to_str().unwrap());
        guard.set("PARLEY_MODE", "KAFKA");
        guard.set("PARLEY_HTTP_ADDR", "127.0.0.1:9000");
        guard.set("PARLEY_LOG_FORMAT", "json");

        let config = Config::from_env().unwrap();

        assert_eq!(config.mode, Mode::Kafka);
        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.settings.user_save_collisions_tries, 3);
    }

    #[test]
    fn test_config_invalid_mode() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();
        guard.set("PARLEY_MODE", "grpc");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("PARLEY_MODE", _)));
    }

    #[test]
    fn test_config_invalid_http_addr() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();
        guard.set("PARLEY_HTTP_ADDR", "not_an_addr");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("PARLEY_HTTP_ADDR", _)));
    }

    #[test]
    fn test_config_missing_settings_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();
        guard.set("PARLEY_SETTINGS_PATH", "/nonexistent/parley/settings.json");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/parley/settings.json"));
    }

    #[test]
    fn test_template_settings_full_document() {
        let settings = TemplateSettings::from_json_str(
            &json!({
                "template_settings": {
                    "db_adapter": {"type": "memory", "max_bytes": 1024},
                    "user_save_collisions_tries": 0,
                    "vps_waiting_timeout": 1500,
                    "health_check": {"enabled": true, "port": 9100, "interface": "127.0.0.1"},
                    "monitoring": {"enabled": false},
                    "masking_fields": {"token": 1},
                    "masking_whitelist": ["profileId"],
                    "forward_payload_fields": ["projectName"],
                    "require_headers": true,
                    "adapter_get_tries": 3,
                    "scenario_error_reply": "error",
                    "kafka": {"brokers": ["k1:9092", "k2:9092"], "topics": {"push": "push-out"}}
                }
            })
            .to_string(),
        )
        .unwrap();

        assert_eq!(
            settings.db_adapter,
            AdapterConfig::Memory(MemoryAdapterConfig {
                max_bytes: 1024,
                ..MemoryAdapterConfig::default()
            })
        );
        assert_eq!(settings.mid_variables_ttl(), Duration::from_millis(1500));
        assert_eq!(settings.health_check.addr().to_string(), "127.0.0.1:9100");
        assert!(!settings.monitoring.enabled);
        assert_eq!(settings.monitoring.prefix, "parley");
        assert_eq!(settings.masking_fields.depths(), vec![("token".to_string(), 1)]);
        assert_eq!(settings.kafka.brokers.len(), 2);
        assert_eq!(settings.kafka.group_id, "parley");
        let pipeline = settings.pipeline_settings();
        assert_eq!(pipeline.user_save_collisions_tries, 0);
        assert_eq!(pipeline.adapter_get_tries, 3);
        assert_eq!(pipeline.scenario_error_reply, ScenarioErrorReply::Error);
    }

    #[test]
    fn test_masking_fields_list_uses_default_depth() {
        let settings = TemplateSettings::from_json_str(
            &json!({"template_settings": {"masking_fields": ["secret"]}}).to_string(),
        )
        .unwrap();
        assert_eq!(
            settings.masking_fields.depths(),
            vec![("secret".to_string(), DEFAULT_PRESERVE_DEPTH)]
        );
        let masked = settings.masker().mask(&json!({"secret": "x", "token": "y"}));
        assert_eq!(masked, json!({"secret": "***", "token": "y"}));
    }

    #[test]
    fn test_schemas_extend_both_chains() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("MESSAGE_TO_SKILL.json"),
            json!({"type": "object", "required": ["message"]}).to_string(),
        )
        .unwrap();
        let settings = TemplateSettings {
            message_schemas_path: Some(dir.path().to_path_buf()),
            ..TemplateSettings::default()
        };
        let (incoming, outgoing) = settings.validators().unwrap();
        assert_eq!(incoming.len(), 3);
        assert_eq!(outgoing.len(), 1);

        let (incoming, outgoing) = TemplateSettings::default().validators().unwrap();
        assert_eq!(incoming.len(), 2);
        assert!(outgoing.is_empty());
    }

    #[test]
    fn test_missing_schema_dir_fails() {
        let settings = TemplateSettings {
            message_schemas_path: Some(PathBuf::from("/nonexistent/parley/schemas")),
            ..TemplateSettings::default()
        };
        assert!(settings.pipeline_builder().is_err());
    }

    #[test]
    fn test_document_without_template_settings() {
        let settings = TemplateSettings::from_json_str("{}").unwrap();
        assert_eq!(settings, TemplateSettings::default());
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("kafka.brokers");
        assert_eq!(missing.to_string(), "missing required setting: kafka.brokers");

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }

    #[test]
    fn test_kafka_mode_requires_brokers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            json!({"template_settings": {"kafka": {"brokers": []}}}).to_string(),
        )
        .unwrap();
        guard.set("PARLEY_SETTINGS_PATH", path.to_str().unwrap());

        // HTTP mode does not look at the Kafka section.
        assert!(Config::from_env().is_ok());

        guard.set("PARLEY_MODE", "kafka");
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("kafka.brokers"))));
    }

    #[test]
    fn test_kafka_settings_validate() {
        assert!(KafkaSettings::default().validate().is_ok());

        let no_topics = KafkaSettings {
            consumer_topics: Vec::new(),
            ..KafkaSettings::default()
        };
        assert!(matches!(
            no_topics.validate(),
            Err(ConfigError::Missing("kafka.consumer_topics"))
        ));

        let no_default = KafkaSettings {
            default_topic: String::new(),
            ..KafkaSettings::default()
        };
        assert!(matches!(
            no_default.validate(),
            Err(ConfigError::Missing("kafka.default_topic"))
        ));
    }

    #[tokio::test]
    async fn test_connect_pipeline_over_memory_adapter() {
        let settings = TemplateSettings {
            db_adapter: AdapterConfig::Memory(MemoryAdapterConfig::default()),
            ..TemplateSettings::default()
        };
        let pipeline = settings
            .connect_pipeline(
                Arc::new(crate::scenario::EchoScenario),
                crate::clock::ManualClock::new(0.0),
            )
            .await
            .unwrap();
        assert_eq!(pipeline.adapter().name(), "memory");
        assert_eq!(pipeline.settings(), &settings.pipeline_settings());
    }

    #[tokio::test]
    async fn test_connect_pipeline_reports_schema_errors() {
        let settings = TemplateSettings {
            message_schemas_path: Some(PathBuf::from("/nonexistent/parley/schemas")),
            ..TemplateSettings::default()
        };
        let err = settings
            .connect_pipeline(
                Arc::new(crate::scenario::EchoScenario),
                crate::clock::ManualClock::new(0.0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Schema(_)));
    }
}
