//! YAML configuration loaded from the `-f <config-path>` flag shared by all
//! three binaries. Mirrors the reference implementation's `ServerConf`
//! shape (registry/cache/record-store/analytics endpoints, plus per-worker
//! capacity and tunables) using the same untagged-duration / serde-default
//! pattern the teacher's `yaml_config.rs` established for its own config.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Duration expressed either as bare seconds or a `"30s"`/`"5m"` string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlexDuration {
    Seconds(u64),
    String(String),
}

impl FlexDuration {
    pub fn as_secs(&self) -> Result<u64, ConfigError> {
        match self {
            FlexDuration::Seconds(s) => Ok(*s),
            FlexDuration::String(s) => parse_duration_string(s)
                .map_err(|e| ConfigError::Invalid(format!("invalid duration '{s}': {e}"))),
        }
    }
}

/// Parses strings like `"30s"`, `"5m"`, `"2h"`, `"1d"`.
pub fn parse_duration_string(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string cannot be empty".to_string());
    }
    let unit = s.chars().last().unwrap();
    let (value_str, multiplier) = match unit {
        's' => (&s[..s.len() - 1], 1u64),
        'm' => (&s[..s.len() - 1], 60),
        'h' => (&s[..s.len() - 1], 3600),
        'd' => (&s[..s.len() - 1], 86400),
        d if d.is_ascii_digit() => (s, 1),
        other => return Err(format!("unknown duration unit '{other}'")),
    };
    let value: u64 = value_str
        .parse()
        .map_err(|_| format!("invalid numeric value '{value_str}'"))?;
    Ok(value * multiplier)
}

fn default_registry_namespace() -> String {
    "/grpc-mirco".to_string()
}

fn default_lease_ttl() -> FlexDuration {
    FlexDuration::Seconds(10)
}

fn default_max_result_chan_size() -> usize {
    10_000
}

fn default_rps_result_chan_blowup() -> u64 {
    2
}

fn default_report_goroutine_num() -> usize {
    3
}

fn default_error_cut_length() -> usize {
    256
}

fn default_max_timeout_secs() -> u64 {
    5
}

fn default_default_max_connections() -> u32 {
    100
}

/// Registry (etcd) endpoints and this app's advertised identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_registry_namespace")]
    pub namespace: String,
    pub app_name: String,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: FlexDuration,
}

/// Redis-backed queue/cache endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub url: String,
}

/// Durable record-store DSN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordStoreConfig {
    pub dsn: String,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

/// Columnar analytics store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    pub addrs: Vec<String>,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub table_name: String,
}

/// Worker-tunable constants, mirroring `WorkerStressConf` in the reference
/// implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTuning {
    #[serde(default = "default_max_result_chan_size")]
    pub max_result_chan_size: usize,
    #[serde(default = "default_rps_result_chan_blowup")]
    pub rps_result_chan_blowup: u64,
    #[serde(default = "default_report_goroutine_num")]
    pub report_goroutine_num: usize,
    #[serde(default = "default_error_cut_length")]
    pub error_cut_length: usize,
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_default_max_connections")]
    pub default_max_connections: u32,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        Self {
            max_result_chan_size: default_max_result_chan_size(),
            rps_result_chan_blowup: default_rps_result_chan_blowup(),
            report_goroutine_num: default_report_goroutine_num(),
            error_cut_length: default_error_cut_length(),
            max_timeout_secs: default_max_timeout_secs(),
            default_max_connections: default_default_max_connections(),
        }
    }
}

/// This node's advertised address and capacity, published to the registry
/// and used as the self-attribution key in `Peck`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub addr: String,
    #[serde(default)]
    pub max_rps_num: u64,
    #[serde(default)]
    pub max_concurrency_num: u64,
}

/// Top-level config loaded from the `-f <config-path>` YAML file, shared by
/// the controller, worker, and integrator binaries (each reads only the
/// sections it needs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub registry: RegistryConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub record_store: Option<RecordStoreConfig>,
    #[serde(default)]
    pub analytics: Option<AnalyticsConfig>,
    #[serde(default)]
    pub node: Option<NodeIdentity>,
    #[serde(default)]
    pub worker: WorkerTuning,
    #[serde(default)]
    pub bind_addr: Option<String>,
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: ServerConfig =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "registry.endpoints must not be empty".into(),
            ));
        }
        if self.cache.url.is_empty() {
            return Err(ConfigError::Invalid("cache.url must not be empty".into()));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        ServerConfig {
            registry: RegistryConfig {
                endpoints: vec!["http://127.0.0.1:2379".into()],
                namespace: default_registry_namespace(),
                app_name: "peckmesh".into(),
                lease_ttl: default_lease_ttl(),
            },
            cache: CacheConfig {
                url: "redis://127.0.0.1:6379".into(),
            },
            record_store: None,
            analytics: None,
            node: Some(NodeIdentity {
                addr: "127.0.0.1:7100".into(),
                max_rps_num: 100,
                max_concurrency_num: 100,
            }),
            worker: WorkerTuning::default(),
            bind_addr: Some("0.0.0.0:7100".into()),
            metrics_addr: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_seconds_and_suffixed_strings() {
        assert_eq!(parse_duration_string("30").unwrap(), 30);
        assert_eq!(parse_duration_string("30s").unwrap(), 30);
        assert_eq!(parse_duration_string("5m").unwrap(), 300);
        assert_eq!(parse_duration_string("2h").unwrap(), 7200);
        assert_eq!(parse_duration_string("1d").unwrap(), 86400);
    }

    #[test]
    fn rejects_empty_and_unknown_unit() {
        assert!(parse_duration_string("").is_err());
        assert!(parse_duration_string("5x").is_err());
    }

    #[test]
    fn loads_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
registry:
  endpoints: ["http://127.0.0.1:2379"]
  app_name: worker-1
cache:
  url: "redis://127.0.0.1:6379"
node:
  addr: "10.0.0.1:7100"
  max_rps_num: 500
  max_concurrency_num: 500
"#,
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.registry.endpoints, vec!["http://127.0.0.1:2379"]);
        assert_eq!(config.registry.namespace, "/grpc-mirco");
        assert_eq!(config.worker.max_result_chan_size, 10_000);
        assert_eq!(config.node.unwrap().max_rps_num, 500);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = ServerConfig::from_file("/nonexistent/path.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn empty_registry_endpoints_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
registry:
  endpoints: []
  app_name: worker-1
cache:
  url: "redis://127.0.0.1:6379"
"#,
        )
        .unwrap();
        let err = ServerConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
