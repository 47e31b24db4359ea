use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::trace;

use crate::adapters::BackendConfig;
#[cfg(feature = "kafka")]
use crate::adapters::KafkaConfig;
use crate::cluster::{HeartbeatConfig, Instance, MembershipConfig, Role};
use crate::point::ValidatorConfig;
use crate::queue::{QueueConfig, SenderConfig};
use crate::routing::{RoutingConfig, RuleSet};
use crate::rpc::PoolConfig;
use crate::statsd::StatsdConfig;

/// Files tried in order when no `-f` is given
pub const SCAN_ORDER: [&str; 4] = [
    "etc/transfer.local.toml",
    "etc/transfer.toml",
    "etc/transfer.local.json",
    "etc/transfer.json",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file found (tried {})", .0.join(", "))]
    NotFound(Vec<String>),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub listen: ListenConfig,
    pub ingest: IngestConfig,
    pub pool: PoolConfig,
    pub queue: QueueConfig,
    pub sender: SenderConfig,
    /// Idle destinations older than this are removed
    #[serde(with = "humantime_serde")]
    pub queue_gc_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_drain_deadline: Duration,
    pub membership: MembershipConfig,
    pub discovery: DiscoveryConfig,
    pub heartbeat: HeartbeatConfig,
    pub routing: RoutingConfig,
    /// Rules served when `routing.addrs` is empty
    pub rules: RuleSet,
    pub storage: StorageConfig,
    pub aggregation: AggregationConfig,
    pub statsd: StatsdConfig,
    pub stats: StatsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            listen: ListenConfig::default(),
            ingest: IngestConfig::default(),
            pool: PoolConfig::default(),
            queue: QueueConfig::default(),
            sender: SenderConfig::default(),
            queue_gc_ttl: Duration::from_secs(3600),
            shutdown_drain_deadline: Duration::from_secs(10),
            membership: MembershipConfig::default(),
            discovery: DiscoveryConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            routing: RoutingConfig::default(),
            rules: RuleSet::default(),
            storage: StorageConfig::default(),
            aggregation: AggregationConfig::default(),
            statsd: StatsdConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// `TRANSFER_LOG` wins over the file
    pub fn level_filter(&self) -> LevelFilter {
        let level = crate::util::get_log_level().unwrap_or_else(|| self.level.clone());
        LevelFilter::from_str(level.trim()).unwrap_or(LevelFilter::INFO)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Binary RPC listener
    pub rpc: Option<String>,
    /// HTTP listener
    pub http: Option<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            rpc: Some("0.0.0.0:8002".to_string()),
            http: Some("0.0.0.0:8003".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub min_step: u32,
    pub lowercase_tag_keys: bool,
    /// Largest accepted HTTP body, after decompression
    pub max_body_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_step: ValidatorConfig::default().min_step,
            lowercase_tag_keys: false,
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

impl IngestConfig {
    pub fn validator(&self) -> ValidatorConfig {
        ValidatorConfig {
            min_step: self.min_step,
            lowercase_tag_keys: self.lowercase_tag_keys,
            ..ValidatorConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Control-plane addresses; empty means the static members below
    pub addrs: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(rename = "static")]
    pub members: HashMap<Role, Vec<Instance>>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            timeout: Duration::from_secs(3),
            members: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backends: Vec<BackendConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backends: vec![BackendConfig::Rpc],
        }
    }
}

/// Transport for aggregation packets
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusConfig {
    /// Aggregation rules are matched but nothing is published
    #[default]
    None,
    /// Detector instances from membership, sharded by rule id
    Detector,
    #[cfg(feature = "kafka")]
    Kafka(KafkaConfig),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Feed counter deltas back through the dispatcher as points
    pub push_self: bool,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            push_self: false,
        }
    }
}

impl Config {
    /// Load `path`, or the first file of [`SCAN_ORDER`] that exists
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => SCAN_ORDER
                .iter()
                .map(PathBuf::from)
                .find(|p| p.is_file())
                .ok_or_else(|| ConfigError::NotFound(SCAN_ORDER.iter().map(|s| s.to_string()).collect()))?,
        };
        let config = read_config_file(&path)?;
        Ok((config, path))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, addr) in [
            ("listen.rpc", &self.listen.rpc),
            ("listen.http", &self.listen.http),
            ("statsd.listen", &self.statsd.listen),
        ] {
            if let Some(addr) = addr {
                addr.parse::<SocketAddr>()
                    .map_err(|e| ConfigError::Invalid(format!("{name} {addr:?}: {e}")))?;
            }
        }

        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue.capacity must be positive".into()));
        }
        if self.sender.batch_size == 0 || self.sender.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "sender.batch_size and sender.max_concurrency must be positive".into(),
            ));
        }
        if self.membership.replicas == 0 {
            return Err(ConfigError::Invalid("membership.replicas must be positive".into()));
        }

        let mut keys = HashSet::new();
        for backend in &self.storage.backends {
            let key = backend.destination_key().unwrap_or_else(|| "rpc".to_string());
            if !keys.insert(key.clone()) {
                return Err(ConfigError::Invalid(format!("storage backend {key} configured twice")));
            }
        }

        for instances in self.discovery.members.values() {
            if let Some(instance) = instances.iter().find(|i| i.node.is_empty() || i.addr.is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "static member {:?}/{:?} needs both node and addr",
                    instance.node, instance.addr
                )));
            }
        }

        Ok(())
    }
}

/// Parse a config file, JSON or TOML by extension
pub fn read_config_file(path: &Path) -> Result<Config, ConfigError> {
    let file_content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let config: Config = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&file_content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?,
        _ => serde_json::from_str(&file_content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?,
    };

    config.validate()?;
    trace!("loaded config: {config:?}");
    Ok(config)
}
