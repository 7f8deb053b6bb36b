//! Configuration management for a Meridian node.
//!
//! This module handles loading, validation, and conversion of the node
//! configuration from TOML files and command-line arguments.

use meridian_discovery::{InstanceTable, RegistrarConfig, ResolverConfig};
use meridian_gateway::GatewayConfig;
use meridian_remote::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity and role of this process
    pub node: NodeSettings,
    /// Client-facing settings, used by the gateway and standalone roles
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Registration and resolution of service instances
    #[serde(default)]
    pub discovery: DiscoverySettings,
    /// Inter-process bus selection
    #[serde(default)]
    pub messaging: MessagingSettings,
    /// Entry handler settings
    #[serde(default)]
    pub entry: EntrySettings,
    /// Static topology; when non-empty it replaces discovery on the gateway
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    /// Logging configuration settings
    pub logging: LoggingSettings,
}

/// What this process runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// WebSocket gateway only
    Gateway,
    /// Service worker only
    Worker,
    /// Gateway plus the built-in hall worker in one process
    #[default]
    Standalone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Process id; also the bus subject and the registered address
    pub server_id: String,
    /// Service name a worker registers under (e.g. `hall`)
    pub server_type: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Lease ttl in seconds
    pub ttl: i64,
    pub version: String,
    pub weight: u32,
    /// Full resync period of each resolver in seconds
    pub resync_interval: u64,
    /// Server types the gateway resolves
    pub watch: Vec<String>,
    /// etcd endpoints; empty keeps discovery inside this process
    pub endpoints: Vec<String>,
    /// Connect timeout for the coordination store in seconds
    pub dial_timeout: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            ttl: 10,
            version: String::new(),
            weight: 1,
            resync_interval: 60,
            watch: vec!["hall".to_string()],
            endpoints: Vec::new(),
            dial_timeout: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    /// In-process bus; only meaningful for the standalone role
    #[default]
    Local,
    /// NATS broker; requires the `nats` feature
    Nats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSettings {
    pub bus: BusKind,
    pub nats_url: String,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            bus: BusKind::Local,
            nats_url: "nats://127.0.0.1:4222".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntrySettings {
    /// Gold granted to newly created users
    pub start_gold: i64,
    /// Accepted tokens and the user id each one stands for
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

/// Token seeded into freshly generated configs so a local client can log in.
pub const DEV_TOKEN: &str = "dev-token";

impl Default for EntrySettings {
    fn default() -> Self {
        Self {
            start_gold: 1000,
            tokens: HashMap::from([(DEV_TOKEN.to_string(), "dev-user".to_string())]),
        }
    }
}

/// One statically known process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub id: String,
    pub server_type: String,
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                server_id: "connector-1".to_string(),
                server_type: "connector".to_string(),
                role: Role::Standalone,
            },
            gateway: GatewayConfig::default(),
            discovery: DiscoverySettings::default(),
            messaging: MessagingSettings::default(),
            entry: EntrySettings::default(),
            servers: Vec::new(),
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path`, writing the default file if it is missing.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Validates the configuration for consistency and correctness.
    pub fn validate(&self) -> Result<(), String> {
        if self.node.server_id.is_empty() {
            return Err("node.server_id cannot be empty".to_string());
        }
        if self.node.server_type.is_empty() {
            return Err("node.server_type cannot be empty".to_string());
        }
        if self.node.role != Role::Worker {
            self.gateway_config()
                .validate()
                .map_err(|e| format!("Invalid gateway settings: {e}"))?;
        }
        if self.node.role == Role::Worker && self.messaging.bus == BusKind::Local {
            return Err("A worker on the local bus can never be reached; use bus = \"nats\"".to_string());
        }
        if self.node.role == Role::Gateway
            && self.servers.is_empty()
            && self.discovery.endpoints.is_empty()
        {
            return Err(
                "The gateway role needs discovery.endpoints or at least one [[servers]] entry"
                    .to_string(),
            );
        }
        if self.discovery.ttl <= 0 {
            return Err("discovery.ttl must be greater than 0".to_string());
        }
        if self.discovery.dial_timeout == 0 {
            return Err("discovery.dial_timeout must be greater than 0".to_string());
        }
        if self.discovery.resync_interval == 0 {
            return Err("discovery.resync_interval must be greater than 0".to_string());
        }
        if self.messaging.bus == BusKind::Nats && self.messaging.nats_url.is_empty() {
            return Err("messaging.nats_url cannot be empty".to_string());
        }
        if let Some(entry) = self.servers.iter().find(|s| s.id.is_empty() || s.server_type.is_empty()) {
            return Err(format!("Incomplete [[servers]] entry: {entry:?}"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }
        Ok(())
    }

    /// Gateway settings with the node's server id applied.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            server_id: self.node.server_id.clone(),
            ..self.gateway.clone()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(self.node.server_id.clone(), self.node.server_type.clone())
    }

    /// Registrar settings for a worker with the given process id and type.
    pub fn registrar_config(&self, process_id: &str, server_type: &str) -> RegistrarConfig {
        RegistrarConfig {
            version: self.discovery.version.clone(),
            weight: self.discovery.weight,
            ttl: self.discovery.ttl,
            ..RegistrarConfig::new(server_type, process_id)
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            resync_interval: self.discovery.resync_interval,
            ..ResolverConfig::default()
        }
    }

    /// Whether discovery goes through an external coordination store.
    pub fn uses_external_store(&self) -> bool {
        !self.discovery.endpoints.is_empty()
    }

    /// The `[[servers]]` topology as an instance table, if any is configured.
    pub fn static_instances(&self) -> Option<InstanceTable> {
        if self.servers.is_empty() {
            return None;
        }
        Some(InstanceTable::from_static(
            self.servers
                .iter()
                .map(|s| (s.server_type.clone(), s.id.clone())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.role, Role::Standalone);
        assert_eq!(config.gateway_config().server_id, "connector-1");
        assert_eq!(config.gateway.pong_wait_ms, 10_000);
        assert_eq!(config.entry.tokens.get(DEV_TOKEN).map(String::as_str), Some("dev-user"));
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file_creates_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gateway.toml");
        tokio::fs::write(
            &path,
            r#"
[node]
server_id = "connector-2"
server_type = "connector"
role = "gateway"

[gateway]
bind_address = "0.0.0.0:13000"
load_balancer = "weighted_random"

[messaging]
bus = "nats"

[[servers]]
id = "hall-1"
serverType = "hall"

[[servers]]
id = "hall-2"
serverType = "hall"

[logging]
level = "debug"
"#,
        )
        .await
        .unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.role, Role::Gateway);
        assert_eq!(config.gateway_config().server_id, "connector-2");
        assert_eq!(config.gateway.bind_address.port(), 13000);
        assert_eq!(config.gateway.heartbeat_secs, 3);
        assert_eq!(config.messaging.nats_url, "nats://127.0.0.1:4222");
        assert_eq!(config.discovery.ttl, 10);

        let table = config.static_instances().unwrap();
        assert_eq!(table.instances("hall").unwrap().len(), 2);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.node.role = Role::Worker;
        assert!(config.validate().is_err(), "worker on the local bus");
        config.messaging.bus = BusKind::Nats;
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.node.role = Role::Gateway;
        assert!(config.validate().is_err(), "gateway without topology");
        config.discovery.endpoints = vec!["127.0.0.1:2379".to_string()];
        assert!(config.validate().is_ok(), "gateway discovering through etcd");
        assert!(config.uses_external_store());

        let mut config = AppConfig::default();
        config.discovery.ttl = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.servers.push(ServerEntry {
            id: String::new(),
            server_type: "hall".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_registrar_config_carries_discovery_settings() {
        let mut config = AppConfig::default();
        config.discovery.version = "v2".to_string();
        config.discovery.weight = 5;

        let registrar = config.registrar_config("hall-1", "hall");
        assert_eq!(registrar.name, "hall");
        assert_eq!(registrar.addr, "hall-1");
        assert_eq!(registrar.version, "v2");
        assert_eq!(registrar.weight, 5);
        assert_eq!(registrar.ttl, 10);
    }
}
