// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Mesh Configuration Types
//
// Defines the configuration schema for a meshbus node, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Node identity (broker domain, channel prefix, gateway role)
// - Transport backend (in-process or TCP broker), reconnect policy, health
//   ping deadline and per-subscriber buffering
// - Registry liveness and trust learning parameters
// - Store-and-forward retry, concurrency and persistence
// - Dead letter, circuit breaker and sweeper settings
// - Observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::agent::{DomainId, TrustPolicy};
use crate::domain::backoff::BackoffPolicy;
use crate::domain::circuit_breaker::CircuitBreakerConfig;
use crate::domain::repository::StorageBackend;
use crate::domain::transport::Channels;

pub const API_VERSION: &str = "meshbus/v1";
pub const KIND: &str = "MeshConfig";

/// Top-level Kubernetes-style mesh configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfigManifest {
    /// API version (must be "meshbus/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "MeshConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: MeshConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Content under spec:
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfigSpec {
    #[serde(default)]
    pub node: NodeIdentity,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub help: HelpConfig,

    #[serde(default)]
    pub store_forward: StoreForwardConfig,

    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    /// Broker domain this node serves
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Prefix shared by every channel on the substrate
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Answer cross-domain forwards for the domain. Exactly one node per
    /// domain should; agent processes joining through a broker run without.
    #[serde(default = "default_gateway")]
    pub gateway: bool,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            channel_prefix: default_channel_prefix(),
            gateway: default_gateway(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportBackend {
    /// Channels live inside this process
    #[default]
    Memory,
    /// Channels live in a `meshbus broker` reached over TCP
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    #[serde(default)]
    pub backend: TransportBackend,

    /// Broker address (`host:port`), required by the tcp backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,

    /// Reconnect policy for `connect()`
    #[serde(default = "default_reconnect")]
    pub reconnect: BackoffPolicy,

    /// Deadline for a health-check ping
    #[serde(with = "humantime_serde", default = "default_ping_timeout")]
    pub ping_timeout: Duration,

    /// Payloads buffered per local subscriber. A subscriber that falls further
    /// behind loses the oldest ones (counted in `meshbus_transport_dropped_total`).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: TransportBackend::Memory,
            broker: None,
            reconnect: default_reconnect(),
            ping_timeout: default_ping_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Agents silent for longer than this drop out of search results
    #[serde(with = "humantime_serde", default = "default_liveness_window")]
    pub liveness_window: Duration,

    /// `k` in the asymmetric trust update
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Exponential decay rate toward neutral trust, per hour of silence
    #[serde(default = "default_decay_per_hour")]
    pub decay_per_hour: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_window: default_liveness_window(),
            learning_rate: default_learning_rate(),
            decay_per_hour: default_decay_per_hour(),
        }
    }
}

impl RegistryConfig {
    pub fn trust_policy(&self) -> TrustPolicy {
        TrustPolicy {
            learning_rate: self.learning_rate,
            decay_per_hour: self.decay_per_hour,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelpConfig {
    #[serde(default = "default_help_timeout_minutes")]
    pub default_timeout_minutes: u32,
}

impl Default for HelpConfig {
    fn default() -> Self {
        Self {
            default_timeout_minutes: default_help_timeout_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreForwardConfig {
    /// Attempts before an entry is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff")]
    pub backoff: BackoffPolicy,

    /// Upper bound on concurrent remote delivery attempts
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// How long to wait for the remote domain's ack
    #[serde(with = "humantime_serde", default = "default_ack_timeout")]
    pub ack_timeout: Duration,

    /// sled database directory; in-memory when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<String>,
}

impl Default for StoreForwardConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: default_retry_backoff(),
            max_in_flight: default_max_in_flight(),
            ack_timeout: default_ack_timeout(),
            state_path: None,
        }
    }
}

impl StoreForwardConfig {
    pub fn storage_backend(&self) -> StorageBackend {
        match &self.state_path {
            Some(path) => StorageBackend::Sled {
                path: PathBuf::from(path),
            },
            None => StorageBackend::InMemory,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterConfig {
    /// Automatic replays allowed per message before it needs manual review
    #[serde(default = "default_replay_limit")]
    pub replay_limit: u32,

    /// Entries handled per sweeper pass; 0 disables automatic processing
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            replay_limit: default_replay_limit(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweeperConfig {
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_domain() -> String {
    "local".to_string()
}

fn default_channel_prefix() -> String {
    "meshbus".to_string()
}

fn default_gateway() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_reconnect() -> BackoffPolicy {
    BackoffPolicy::default().with_max_attempts(10)
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_liveness_window() -> Duration {
    Duration::from_secs(300)
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_decay_per_hour() -> f64 {
    0.01
}

fn default_help_timeout_minutes() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff() -> BackoffPolicy {
    BackoffPolicy::default().with_jitter(0.2)
}

fn default_max_in_flight() -> usize {
    16
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_replay_limit() -> u32 {
    3
}

fn default_batch_size() -> usize {
    50
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for MeshConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "meshbus-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: MeshConfigSpec::default(),
        }
    }
}

impl MeshConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. MESHBUS_CONFIG_PATH environment variable
    /// 2. ./meshbus-config.yaml (working directory)
    /// 3. ~/.meshbus/config.yaml (user home)
    /// 4. /etc/meshbus/config.yaml (system, Unix) or C:\ProgramData\Meshbus\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("MESHBUS_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./meshbus-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".meshbus").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/meshbus/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Meshbus\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(domain) = std::env::var("MESHBUS_DOMAIN") {
            if domain.trim().is_empty() {
                tracing::warn!("Ignoring empty MESHBUS_DOMAIN override");
            } else {
                tracing::info!("Environment override: MESHBUS_DOMAIN={}", domain);
                self.spec.node.domain = domain;
            }
        }

        if let Ok(broker) = std::env::var("MESHBUS_BROKER") {
            if broker.trim().is_empty() {
                tracing::warn!("Ignoring empty MESHBUS_BROKER override");
            } else {
                tracing::info!("Environment override: MESHBUS_BROKER={}", broker);
                self.spec.transport.backend = TransportBackend::Tcp;
                self.spec.transport.broker = Some(broker);
            }
        }

        if let Ok(path) = std::env::var("MESHBUS_STATE_PATH") {
            if path.trim().is_empty() {
                tracing::info!("Environment override: MESHBUS_STATE_PATH empty, using in-memory state");
                self.spec.store_forward.state_path = None;
            } else {
                tracing::info!("Environment override: MESHBUS_STATE_PATH={}", path);
                self.spec.store_forward.state_path = Some(path);
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let node = &self.spec.node;
        if node.domain.is_empty() {
            anyhow::bail!("spec.node.domain cannot be empty");
        }
        if node.domain.contains('.') || node.domain.contains('@') {
            anyhow::bail!("spec.node.domain '{}' must not contain '.' or '@'", node.domain);
        }
        if node.channel_prefix.is_empty() {
            anyhow::bail!("spec.node.channelPrefix cannot be empty");
        }

        let registry = &self.spec.registry;
        if !(0.0..=1.0).contains(&registry.learning_rate) {
            anyhow::bail!("spec.registry.learningRate must be within [0, 1], got {}", registry.learning_rate);
        }
        if !registry.decay_per_hour.is_finite() || registry.decay_per_hour < 0.0 {
            anyhow::bail!("spec.registry.decayPerHour must be a non-negative number");
        }
        if registry.liveness_window.is_zero() {
            anyhow::bail!("spec.registry.livenessWindow must be greater than zero");
        }

        let sf = &self.spec.store_forward;
        if sf.max_retries == 0 {
            anyhow::bail!("spec.storeForward.maxRetries must be at least 1");
        }
        if sf.max_in_flight == 0 {
            anyhow::bail!("spec.storeForward.maxInFlight must be at least 1");
        }
        validate_backoff("spec.storeForward.backoff", &sf.backoff)?;
        validate_backoff("spec.transport.reconnect", &self.spec.transport.reconnect)?;

        let transport = &self.spec.transport;
        if transport.backend == TransportBackend::Tcp && transport.broker.as_deref().is_none_or(str::is_empty) {
            anyhow::bail!("spec.transport.broker is required when spec.transport.backend is 'tcp'");
        }
        if transport.channel_capacity == 0 {
            anyhow::bail!("spec.transport.channelCapacity must be at least 1");
        }

        if self.spec.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("spec.circuitBreaker.failureThreshold must be at least 1");
        }

        if self.spec.sweeper.interval.is_zero() {
            anyhow::bail!("spec.sweeper.interval must be greater than zero");
        }

        if let Some(logging) = self.spec.observability.as_ref().and_then(|o| o.logging.as_ref()) {
            if !matches!(logging.format.as_str(), "json" | "text") {
                anyhow::bail!("spec.observability.logging.format must be 'json' or 'text'");
            }
        }

        Ok(())
    }

    pub fn domain(&self) -> DomainId {
        DomainId::new(self.spec.node.domain.clone())
    }

    pub fn channels(&self) -> Channels {
        Channels::new(self.spec.node.channel_prefix.clone())
    }
}

fn validate_backoff(field: &str, policy: &BackoffPolicy) -> anyhow::Result<()> {
    if !policy.factor.is_finite() || policy.factor < 1.0 {
        anyhow::bail!("{}.factor must be >= 1.0", field);
    }
    if !(0.0..=1.0).contains(&policy.jitter) {
        anyhow::bail!("{}.jitter must be within [0, 1]", field);
    }
    if policy.cap < policy.base {
        anyhow::bail!("{}.cap must not be smaller than base", field);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = MeshConfigManifest::default();
        assert_eq!(manifest.api_version, "meshbus/v1");
        assert_eq!(manifest.kind, "MeshConfig");
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.node.domain, "local");
        assert_eq!(manifest.spec.registry.liveness_window, Duration::from_secs(300));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
apiVersion: meshbus/v1
kind: MeshConfig
metadata:
  name: edge-1
spec:
  node:
    domain: eu-west
  storeForward:
    maxRetries: 3
    ackTimeout: 2s
    backoff:
      base: 50ms
      cap: 1s
  circuitBreaker:
    failureThreshold: 2
    recoveryTimeout: 1m
"#;
        let manifest = MeshConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.domain(), DomainId::new("eu-west"));
        assert_eq!(manifest.spec.node.channel_prefix, "meshbus");
        assert_eq!(manifest.spec.store_forward.max_retries, 3);
        assert_eq!(manifest.spec.store_forward.ack_timeout, Duration::from_secs(2));
        assert_eq!(manifest.spec.store_forward.backoff.base, Duration::from_millis(50));
        assert_eq!(manifest.spec.store_forward.backoff.factor, 2.0);
        assert_eq!(manifest.spec.circuit_breaker.recovery_timeout, Duration::from_secs(60));
        assert_eq!(manifest.spec.help.default_timeout_minutes, 10);
        assert_eq!(manifest.spec.store_forward.storage_backend(), StorageBackend::InMemory);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut manifest = MeshConfigManifest::default();
        manifest.metadata.name = "test-node".to_string();
        manifest.spec.store_forward.state_path = Some("/var/lib/meshbus".to_string());
        manifest.spec.observability = Some(ObservabilityConfig {
            logging: Some(LoggingConfig {
                level: "debug".to_string(),
                format: "json".to_string(),
            }),
        });

        let yaml = serde_yaml::to_string(&manifest).unwrap();
        let parsed = MeshConfigManifest::from_yaml_str(&yaml).unwrap();

        assert_eq!(parsed.metadata.name, "test-node");
        assert_eq!(
            parsed.spec.store_forward.storage_backend(),
            StorageBackend::Sled {
                path: PathBuf::from("/var/lib/meshbus")
            }
        );
        assert_eq!(parsed.spec.transport.reconnect, manifest.spec.transport.reconnect);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshbus-config.yaml");
        let manifest = MeshConfigManifest::default();
        manifest.to_yaml_file(&path).unwrap();

        let loaded = MeshConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.api_version, API_VERSION);
        assert!(MeshConfigManifest::load_or_default(Some(dir.path().join("missing.yaml"))).is_err());
    }

    #[test]
    fn test_validation() {
        let mut manifest = MeshConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.node.domain = "bad.domain".to_string();
        assert!(manifest.validate().is_err());
        manifest.spec.node.domain = "local".to_string();

        manifest.spec.registry.learning_rate = 1.5;
        assert!(manifest.validate().is_err());
        manifest.spec.registry.learning_rate = 0.1;

        manifest.spec.store_forward.max_retries = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.store_forward.max_retries = 3;

        manifest.spec.store_forward.backoff.jitter = 2.0;
        assert!(manifest.validate().is_err());
        manifest.spec.store_forward.backoff.jitter = 0.0;

        manifest.spec.circuit_breaker.failure_threshold = 0;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_tcp_backend_needs_a_broker() {
        let yaml = r#"
apiVersion: meshbus/v1
kind: MeshConfig
metadata:
  name: agent-1
spec:
  node:
    domain: eu-west
    gateway: false
  transport:
    backend: tcp
    broker: 127.0.0.1:7400
    channelCapacity: 64
"#;
        let mut manifest = MeshConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.spec.transport.backend, TransportBackend::Tcp);
        assert_eq!(manifest.spec.transport.broker.as_deref(), Some("127.0.0.1:7400"));
        assert_eq!(manifest.spec.transport.channel_capacity, 64);
        assert!(!manifest.spec.node.gateway);
        assert!(manifest.validate().is_ok());

        manifest.spec.transport.broker = None;
        assert!(manifest.validate().is_err());
        assert!(MeshConfigManifest::default().spec.node.gateway);
    }
}
