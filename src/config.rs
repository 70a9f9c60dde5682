//! Configuration loading and types for clusterd.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! node: its identity and metadata, the opaque index configuration handed
//! to the consensus layer, lifecycle deadlines, logging, and observability.

use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use crate::errors::ConfigError;

/// Free-form node metadata. Must carry `grpc_addr` and `http_addr`.
pub type Metadata = serde_json::Map<String, Value>;

/// Index configuration, opaque to the manager and forwarded to the
/// consensus layer.
pub type IndexConfig = serde_json::Map<String, Value>;

/// Metadata key holding the RPC transport listen address.
pub const GRPC_ADDR_KEY: &str = "grpc_addr";

/// Metadata key holding the HTTP transport listen address.
pub const HTTP_ADDR_KEY: &str = "http_addr";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Node identity and cluster membership settings.
    #[serde(default)]
    pub node: NodeConfig,

    /// Index configuration forwarded untouched to the consensus layer.
    #[serde(default)]
    pub index: IndexConfig,

    /// Startup/shutdown deadlines.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// HTTP access log settings.
    #[serde(default)]
    pub access_log: AccessLogConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Node identity.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Node identifier, unique within the cluster.
    #[serde(default = "default_node_id")]
    pub id: String,

    /// RPC address of an existing member to join. Empty means bootstrap a
    /// new cluster.
    #[serde(default)]
    pub peer_addr: String,

    /// Metadata registered with the cluster (listen addresses and anything
    /// else operators want to publish).
    #[serde(default = "default_metadata")]
    pub metadata: Metadata,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            peer_addr: String::new(),
            metadata: default_metadata(),
        }
    }
}

/// Lifecycle deadlines in milliseconds. `0` disables a deadline.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Deadline for the join handshake with the peer.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Deadline for the consensus layer to report ready.
    #[serde(default)]
    pub consensus_start_timeout_ms: u64,

    /// How long `stop` waits for background start tasks to wind down before
    /// aborting them.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl LifecycleConfig {
    pub fn join_timeout(&self) -> Option<Duration> {
        millis(self.join_timeout_ms)
    }

    pub fn consensus_start_timeout(&self) -> Option<Duration> {
        millis(self.consensus_start_timeout_ms)
    }

    pub fn stop_grace(&self) -> Option<Duration> {
        millis(self.stop_grace_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: default_join_timeout_ms(),
            consensus_start_timeout_ms: 0,
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// HTTP access log configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Listen addresses ---------------------------------------------------------

/// Listen addresses pulled out of node metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddrs {
    /// RPC transport listen address.
    pub grpc_addr: String,
    /// HTTP transport listen address.
    pub http_addr: String,
}

impl ListenAddrs {
    /// Extract and validate both listen addresses from `metadata`.
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, ConfigError> {
        Ok(Self {
            grpc_addr: required_str(metadata, GRPC_ADDR_KEY)?.to_string(),
            http_addr: required_str(metadata, HTTP_ADDR_KEY)?.to_string(),
        })
    }
}

fn required_str<'a>(metadata: &'a Metadata, key: &'static str) -> Result<&'a str, ConfigError> {
    match metadata.get(key) {
        None => Err(ConfigError::MissingKey { key }),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ConfigError::EmptyValue { key }),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(ConfigError::NotAString {
            key,
            found: json_kind(other),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_node_id() -> String {
    "node1".to_string()
}

fn default_metadata() -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(
        GRPC_ADDR_KEY.to_string(),
        Value::String("127.0.0.1:5100".to_string()),
    );
    metadata.insert(
        HTTP_ADDR_KEY.to_string(),
        Value::String("127.0.0.1:8100".to_string()),
    );
    metadata
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn metadata(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => panic!("metadata must be an object"),
        }
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.node.id, "node1");
        assert!(config.node.peer_addr.is_empty());
        assert!(config.index.is_empty());
        assert_eq!(config.lifecycle.join_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.lifecycle.consensus_start_timeout(), None);
        assert_eq!(config.logging.level, "info");
        assert!(config.access_log.enabled);
        assert!(config.observability.metrics);

        let addrs = ListenAddrs::from_metadata(&config.node.metadata).unwrap();
        assert_eq!(addrs.grpc_addr, "127.0.0.1:5100");
        assert_eq!(addrs.http_addr, "127.0.0.1:8100");
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
node:
  id: node-2
  peer_addr: "node-1:7000"
  metadata:
    grpc_addr: "0.0.0.0:7001"
    http_addr: "0.0.0.0:8001"
    zone: eu-west-1a
    weight: 3
index:
  index_mapping:
    default_analyzer: standard
  index_type: upside_down
lifecycle:
  join_timeout_ms: 0
  consensus_start_timeout_ms: 2500
logging:
  level: debug
  format: json
access_log:
  enabled: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.node.id, "node-2");
        assert_eq!(config.node.peer_addr, "node-1:7000");
        assert_eq!(config.node.metadata["zone"], json!("eu-west-1a"));
        assert_eq!(config.node.metadata["weight"], json!(3));
        assert_eq!(config.index["index_type"], json!("upside_down"));
        assert_eq!(
            config.index["index_mapping"]["default_analyzer"],
            json!("standard")
        );
        assert_eq!(config.lifecycle.join_timeout(), None);
        assert_eq!(
            config.lifecycle.consensus_start_timeout(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.lifecycle.stop_grace(), Some(Duration::from_secs(5)));
        assert_eq!(config.logging.format, "json");
        assert!(!config.access_log.enabled);
    }

    #[test]
    fn test_listen_addrs_missing_grpc_addr() {
        let md = metadata(json!({ "http_addr": "127.0.0.1:8000" }));
        assert_eq!(
            ListenAddrs::from_metadata(&md),
            Err(ConfigError::MissingKey { key: GRPC_ADDR_KEY })
        );
    }

    #[test]
    fn test_listen_addrs_missing_http_addr() {
        let md = metadata(json!({ "grpc_addr": "127.0.0.1:5000" }));
        assert_eq!(
            ListenAddrs::from_metadata(&md),
            Err(ConfigError::MissingKey { key: HTTP_ADDR_KEY })
        );
    }

    #[test]
    fn test_listen_addrs_wrong_type() {
        let md = metadata(json!({ "grpc_addr": 5000, "http_addr": "127.0.0.1:8000" }));
        assert_eq!(
            ListenAddrs::from_metadata(&md),
            Err(ConfigError::NotAString {
                key: GRPC_ADDR_KEY,
                found: "a number"
            })
        );
    }

    #[test]
    fn test_listen_addrs_blank_value() {
        let md = metadata(json!({ "grpc_addr": "127.0.0.1:5000", "http_addr": "  " }));
        assert_eq!(
            ListenAddrs::from_metadata(&md),
            Err(ConfigError::EmptyValue { key: HTTP_ADDR_KEY })
        );
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node:\n  id: from-file\n  peer_addr: \"10.0.0.1:5100\"").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.node.id, "from-file");
        assert_eq!(config.node.peer_addr, "10.0.0.1:5100");
        // Metadata section omitted entirely, so the default addresses apply.
        assert!(ListenAddrs::from_metadata(&config.node.metadata).is_ok());
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/definitely/not/here/clusterd.yaml").is_err());
    }
}
