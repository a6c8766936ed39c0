use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fmt, fs, path::Path, time::Duration};
use thiserror::Error;

use crate::{topics, Error, InternalResult};

/// STOMP connection to a GridAPPS-D style broker.
pub const CONNECTION_TYPE_GRIDAPPSD: &str = "CONNECTION_TYPE_GRIDAPPSD";
/// In-process broker shared through a [`crate::bus::TransportRegistry`].
pub const CONNECTION_TYPE_MEMORY: &str = "CONNECTION_TYPE_MEMORY";

pub const ARG_ADDRESS: &str = "GRIDAPPSD_ADDRESS";
pub const ARG_USER: &str = "GRIDAPPSD_USER";
pub const ARG_PASSWORD: &str = "GRIDAPPSD_PASSWORD";
pub const ARG_USE_TOKEN_AUTH: &str = "GRIDAPPSD_USE_TOKEN_AUTH";
pub const ARG_APPLICATION_ID: &str = "GRIDAPPSD_APPLICATION_ID";

const DEFAULT_ADDRESS: &str = "tcp://gridappsd:61613";
const REQUIRED_KEYS: [&str; 3] = ["id", "connection_type", "connection_args"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Missing keys for connection {key}")]
    MissingKey { key: String },
    #[error("Message bus id must not be empty")]
    EmptyBusId,
    #[error("Duplicate message bus id: {id}")]
    DuplicateBus { id: String },
    #[error("Unknown connection type: {connection_type}")]
    UnknownConnectionType { connection_type: String },
    #[error("Bus {bus} is missing connection argument {key}")]
    MissingConnectionArg { bus: String, key: String },
    #[error("Either upstream or downstream bus must be specified")]
    NoBusDefined,
    #[error("Agent {agent_id} has no topology and no bus to request it from")]
    NoTopologySource { agent_id: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Describes one message bus: which transport to use and how to reach it.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBusDefinition {
    id: String,
    connection_type: String,
    connection_args: BTreeMap<String, Value>,
    #[serde(default)]
    is_ot_bus: bool,
}

impl MessageBusDefinition {
    pub fn new(
        id: impl Into<String>,
        connection_type: impl Into<String>,
        connection_args: BTreeMap<String, Value>,
    ) -> ConfigResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(ConfigError::EmptyBusId);
        }
        Ok(Self {
            id,
            connection_type: connection_type.into(),
            connection_args,
            is_ot_bus: false,
        })
    }

    /// Validates a raw record. Keys are checked in the order
    /// `id`, `connection_type`, `connection_args`.
    pub fn from_value(value: Value) -> ConfigResult<Self> {
        let record = value
            .as_object()
            .ok_or_else(|| ConfigError::Invalid("connection record must be a map".to_string()))?;
        for key in REQUIRED_KEYS {
            if !record.contains_key(key) {
                return Err(ConfigError::MissingKey {
                    key: key.to_string(),
                });
            }
        }
        let definition: Self =
            serde_json::from_value(value).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if definition.id.is_empty() {
            return Err(ConfigError::EmptyBusId);
        }
        Ok(definition)
    }

    /// Builds a GridAPPS-D bus definition for `area_id` from the process environment.
    pub fn from_env(area_id: &str) -> ConfigResult<Self> {
        let mut args = BTreeMap::new();
        let address = std::env::var(ARG_ADDRESS).unwrap_or_else(|_| DEFAULT_ADDRESS.to_string());
        args.insert(ARG_ADDRESS.to_string(), Value::String(address));
        for key in [ARG_USER, ARG_PASSWORD, ARG_APPLICATION_ID, ARG_USE_TOKEN_AUTH] {
            if let Ok(v) = std::env::var(key) {
                args.insert(key.to_string(), Value::String(v));
            }
        }
        Ok(Self::new(area_id, CONNECTION_TYPE_GRIDAPPSD, args)?.with_ot_bus(true))
    }

    pub fn with_ot_bus(mut self, is_ot_bus: bool) -> Self {
        self.is_ot_bus = is_ot_bus;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_type(&self) -> &str {
        &self.connection_type
    }

    pub fn connection_args(&self) -> &BTreeMap<String, Value> {
        &self.connection_args
    }

    pub fn is_ot_bus(&self) -> bool {
        self.is_ot_bus
    }

    /// Connection argument rendered as a string. Nulls count as absent.
    pub fn arg(&self, key: &str) -> Option<String> {
        match self.connection_args.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn require_arg(&self, key: &str) -> ConfigResult<String> {
        self.arg(key).ok_or_else(|| ConfigError::MissingConnectionArg {
            bus: self.id.clone(),
            key: key.to_string(),
        })
    }

    pub fn flag(&self, key: &str) -> bool {
        match self.connection_args.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
            _ => false,
        }
    }
}

impl fmt::Debug for MessageBusDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: BTreeMap<&str, &Value> = self
            .connection_args
            .iter()
            .filter(|(k, _)| k.as_str() != ARG_PASSWORD)
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        f.debug_struct("MessageBusDefinition")
            .field("id", &self.id)
            .field("connection_type", &self.connection_type)
            .field("connection_args", &args)
            .field("is_ot_bus", &self.is_ot_bus)
            .finish()
    }
}

/// The set of bus definitions loaded from one document, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct MessageBusDefinitions {
    definitions: Vec<MessageBusDefinition>,
}

impl MessageBusDefinitions {
    pub fn new(definitions: Vec<MessageBusDefinition>) -> ConfigResult<Self> {
        let mut set = Self::default();
        for definition in definitions {
            set.insert(definition)?;
        }
        Ok(set)
    }

    /// Reads the `connections` key, which holds either one record or a list.
    /// A document without that key is read as a single record.
    pub fn from_value(document: Value) -> ConfigResult<Self> {
        let connections = match document {
            Value::Object(mut map) if map.contains_key("connections") => {
                map.remove("connections").unwrap_or(Value::Null)
            }
            other => other,
        };
        let records = match connections {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        let definitions = records
            .into_iter()
            .map(MessageBusDefinition::from_value)
            .collect::<ConfigResult<Vec<_>>>()?;
        Self::new(definitions)
    }

    pub fn from_yaml_str(s: &str) -> ConfigResult<Self> {
        let document: Value =
            serde_yaml_bw::from_str(s).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::from_value(document)
    }

    pub fn from_json_str(s: &str) -> ConfigResult<Self> {
        let document: Value =
            serde_json::from_str(s).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::from_value(document)
    }

    /// `.json` files are read as JSON, everything else as YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::Invalid(format!("Failed to read {}: {}", path.display(), e))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    pub fn insert(&mut self, definition: MessageBusDefinition) -> ConfigResult<()> {
        if self.get(definition.id()).is_some() {
            return Err(ConfigError::DuplicateBus {
                id: definition.id().to_string(),
            });
        }
        self.definitions.push(definition);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&MessageBusDefinition> {
        self.definitions.iter().find(|d| d.id() == id)
    }

    pub fn first(&self) -> Option<&MessageBusDefinition> {
        self.definitions.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageBusDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    #[serde(default)]
    pub bus_client: BusClientConfig,

    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    #[serde(default)]
    pub cim_profile: CimProfile,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            bus_client: BusClientConfig::default(),
            bootstrap: BootstrapConfig::default(),
            cim_profile: CimProfile::default(),
        }
    }
}

impl FieldConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> InternalResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("Failed to read config file: {}", e)))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> InternalResult<Self> {
        serde_json::from_str(s)
            .map_err(|e| Error::Internal(format!("Failed to parse config file: {}", e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusClientConfig {
    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,

    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,

    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for BusClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            dispatch_workers: default_dispatch_workers(),
            auth: AuthConfig::default(),
        }
    }
}

/// Token handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_topic")]
    pub token_topic: String,

    #[serde(default = "default_auth_retries")]
    pub retries: u32,

    #[serde(default = "default_auth_retry_interval", with = "duration_ms")]
    pub retry_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_topic: default_token_topic(),
            retries: default_auth_retries(),
            retry_interval: default_auth_retry_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_bootstrap_timeout", with = "duration_ms")]
    pub request_timeout: Duration,

    #[serde(default = "default_bootstrap_backoff", with = "duration_ms")]
    pub retry_backoff: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_bootstrap_timeout(),
            retry_backoff: default_bootstrap_backoff(),
        }
    }
}

/// Identity of an agent application. An `app_id` containing
/// `context_manager` selects the context-manager role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub app_id: String,
    #[serde(default)]
    pub description: String,
}

impl AgentConfig {
    pub fn new(app_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            description: description.into(),
        }
    }
}

/// CIM data profile the agents interpret topology and measurements with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CimProfile {
    #[serde(default = "default_cim_profile")]
    pub profile: String,

    #[serde(default = "default_iec61970_301")]
    pub iec61970_301: u32,
}

impl Default for CimProfile {
    fn default() -> Self {
        Self {
            profile: default_cim_profile(),
            iec61970_301: default_iec61970_301(),
        }
    }
}

// デフォルト値の定義
fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_dispatch_workers() -> usize {
    1
}
fn default_token_topic() -> String {
    topics::TOKEN_TOPIC.to_string()
}
fn default_auth_retries() -> u32 {
    10
}
fn default_auth_retry_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_bootstrap_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_bootstrap_backoff() -> Duration {
    Duration::from_secs(5)
}
fn default_cim_profile() -> String {
    "cimhub_2023".to_string()
}
fn default_iec61970_301() -> u32 {
    7
}

// Duration型のシリアライズ/デシリアライズヘルパー
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_missing_keys_are_reported_in_order() {
        let err = MessageBusDefinition::from_value(json!({"connection_type": "x"})).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingKey {
                key: "id".to_string()
            }
        );

        let err = MessageBusDefinition::from_value(json!({"id": "a", "connection_type": "x"}))
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing keys for connection connection_args");
    }

    #[test]
    fn test_single_record_and_list() {
        let single = MessageBusDefinitions::from_json_str(
            r#"{"connections": {"id": "feeder1", "connection_type": "CONNECTION_TYPE_MEMORY", "connection_args": {}}}"#,
        )
        .unwrap();
        assert_eq!(single.len(), 1);
        assert!(!single.get("feeder1").unwrap().is_ot_bus());

        let yaml = r#"
connections:
  - id: feeder1
    is_ot_bus: true
    connection_type: CONNECTION_TYPE_GRIDAPPSD
    connection_args:
      GRIDAPPSD_ADDRESS: tcp://localhost:61613
      GRIDAPPSD_USER: system
      GRIDAPPSD_PASSWORD: manager
      GRIDAPPSD_USE_TOKEN_AUTH: true
  - id: switch_area_1
    connection_type: CONNECTION_TYPE_GRIDAPPSD
    connection_args:
      GRIDAPPSD_ADDRESS: tcp://localhost:61613
"#;
        let list = MessageBusDefinitions::from_yaml_str(yaml).unwrap();
        assert_eq!(list.len(), 2);
        let feeder = list.get("feeder1").unwrap();
        assert!(feeder.is_ot_bus());
        assert!(feeder.flag(ARG_USE_TOKEN_AUTH));
        assert_eq!(feeder.arg(ARG_USER).as_deref(), Some("system"));
        assert!(!format!("{:?}", feeder).contains("manager"));
    }

    #[test]
    fn test_duplicate_bus_ids_rejected() {
        let doc = json!({"connections": [
            {"id": "a", "connection_type": "t", "connection_args": {}},
            {"id": "a", "connection_type": "t", "connection_args": {}},
        ]});
        assert_eq!(
            MessageBusDefinitions::from_value(doc).unwrap_err(),
            ConfigError::DuplicateBus {
                id: "a".to_string()
            }
        );
    }

    #[test]
    fn test_empty_id_rejected() {
        let doc = json!({"id": "", "connection_type": "t", "connection_args": {}});
        assert_eq!(
            MessageBusDefinition::from_value(doc).unwrap_err(),
            ConfigError::EmptyBusId
        );
    }

    #[test]
    fn test_field_config_defaults() {
        let config = FieldConfig::from_str(r#"{"bus_client": {"request_timeout": 250}}"#).unwrap();
        assert_eq!(config.bus_client.request_timeout, Duration::from_millis(250));
        assert_eq!(config.bus_client.auth.retries, 10);
        assert_eq!(config.bus_client.auth.token_topic, "/topic/pnnl.goss.token.topic");
        assert_eq!(config.bootstrap.retry_backoff, Duration::from_secs(5));
        assert_eq!(config.cim_profile.iec61970_301, 7);
    }
}
