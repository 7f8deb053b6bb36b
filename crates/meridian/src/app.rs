//! Main application logic and lifecycle management.
//!
//! The `Application` assembles the components a role needs, runs them until
//! a shutdown signal arrives, and tears them down in reverse order.

use crate::{
    cli::CliArgs,
    config::{AppConfig, BusKind, Role},
    handlers,
    logging::display_banner,
    signals::{wait_for_signal, wait_for_signal_silent, ShutdownState},
};
use anyhow::{bail, Context};
use meridian_discovery::{AddressSink, CoordinationStore, InstanceTable, MemoryStore, Registrar, Resolver};
use meridian_gateway::{EntryHandler, GatewayServer, MemoryUserStore, Router, StaticTokenVerifier};
use meridian_remote::{LocalBus, MessageBus, WorkerHandle, WorkerNode};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Process id of the built-in hall worker in standalone mode.
const STANDALONE_HALL_ID: &str = "hall-1";

/// Everything a running node owns.
#[derive(Default)]
struct Components {
    gateway: Option<Arc<GatewayServer>>,
    gateway_task: Option<JoinHandle<()>>,
    workers: Vec<WorkerHandle>,
    resolvers: Vec<Resolver>,
}

pub struct Application {
    /// Loaded application configuration
    config: AppConfig,
}

impl Application {
    /// Loads configuration, applies CLI overrides and validates the result.
    ///
    /// # Process
    ///
    /// 1. Load configuration from file (creating default if missing)
    /// 2. Apply command-line argument overrides
    /// 3. Validate merged configuration
    /// 4. Display startup banner
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        apply_overrides(&mut config, &args)?;

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        display_banner();
        Ok(Self { config })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Runs the node until SIGINT/SIGTERM, then shuts it down.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        self.log_configuration_summary();

        let bus = build_bus(&self.config).await?;
        let store = build_store(&self.config).await?;
        let components = self.start(Arc::clone(&bus), store).await?;

        info!("✅ Meridian node {} is now running!", self.config.node.server_id);
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let shutdown_state = ShutdownState::new();
        wait_for_signal(&shutdown_state).await?;

        tokio::spawn(async move {
            if let Err(e) = wait_for_signal_silent().await {
                error!("Failed to set up merciless shutdown signal handler: {e}");
                return;
            }
            warn!("Shutdown handler received again! I'll make this quick.");
            std::process::exit(1);
        });

        stop(components).await;
        bus.close().await;
        shutdown_state.complete_shutdown();

        info!("👋 Meridian node {} shutdown complete", self.config.node.server_id);
        Ok(())
    }

    async fn start(
        &self,
        bus: Arc<dyn MessageBus>,
        store: Option<Arc<dyn CoordinationStore>>,
    ) -> anyhow::Result<Components> {
        let mut components = Components::default();
        let result = match self.config.node.role {
            Role::Gateway => self.start_gateway(bus, &mut components, store).await,
            Role::Worker => self.start_worker(bus, &mut components, store).await,
            Role::Standalone => {
                let store: Arc<dyn CoordinationStore> = match store {
                    Some(store) => store,
                    None => Arc::new(MemoryStore::new()),
                };
                self.start_standalone(bus, &mut components, store).await
            }
        };
        if let Err(e) = result {
            stop(components).await;
            return Err(e);
        }
        Ok(components)
    }

    /// Gateway plus the hall worker. Without configured endpoints the two
    /// find each other through an in-process store.
    async fn start_standalone(
        &self,
        bus: Arc<dyn MessageBus>,
        components: &mut Components,
        store: Arc<dyn CoordinationStore>,
    ) -> anyhow::Result<()> {
        let mut node = WorkerNode::new(
            meridian_remote::WorkerConfig::new(STANDALONE_HALL_ID, "hall"),
            Arc::clone(&bus),
        );
        handlers::install_hall(&mut node);
        let registrar = Registrar::new(
            Arc::clone(&store),
            self.config.registrar_config(STANDALONE_HALL_ID, "hall"),
        )?;
        let worker = node
            .with_registrar(registrar)
            .start()
            .await
            .context("failed to start the hall worker")?;
        components.workers.push(worker);

        self.start_gateway(bus, components, Some(store)).await
    }

    async fn start_gateway(
        &self,
        bus: Arc<dyn MessageBus>,
        components: &mut Components,
        store: Option<Arc<dyn CoordinationStore>>,
    ) -> anyhow::Result<()> {
        let instances = match (self.config.static_instances(), store) {
            (Some(table), _) => {
                info!("📋 Using static topology: {:?}", table.server_types());
                Arc::new(table)
            }
            (None, Some(store)) => {
                let table = Arc::new(InstanceTable::new());
                for server_type in &self.config.discovery.watch {
                    let sink: Arc<dyn AddressSink> = table.clone();
                    let resolver = Resolver::build(
                        Arc::clone(&store),
                        server_type.clone(),
                        sink,
                        self.config.resolver_config(),
                    )
                    .await
                    .with_context(|| format!("failed to resolve {server_type}"))?;
                    components.resolvers.push(resolver);
                }
                table
            }
            (None, None) => bail!("the gateway role needs discovery endpoints or a [[servers]] topology"),
        };

        if self.config.entry.tokens.is_empty() {
            warn!("⚠️ No entry tokens configured; every entryHandler.entry will be refused");
        }

        let gateway_config = self.config.gateway_config();
        let mut router = Router::from_config(&gateway_config, instances, Arc::clone(&bus));
        Arc::new(
            EntryHandler::new(
                Arc::new(StaticTokenVerifier::new(self.config.entry.tokens.clone())),
                Arc::new(MemoryUserStore::new()),
            )
            .with_start_gold(self.config.entry.start_gold),
        )
        .install(&mut router);

        let server = Arc::new(GatewayServer::new(gateway_config, router, bus));
        let listener = server.bind().await?;
        let serving = Arc::clone(&server);
        components.gateway_task = Some(tokio::spawn(async move {
            if let Err(e) = serving.serve(listener).await {
                error!("❌ Gateway error: {:?}", e);
            }
        }));
        components.gateway = Some(server);
        Ok(())
    }

    async fn start_worker(
        &self,
        bus: Arc<dyn MessageBus>,
        components: &mut Components,
        store: Option<Arc<dyn CoordinationStore>>,
    ) -> anyhow::Result<()> {
        let node_settings = &self.config.node;
        let mut node = WorkerNode::new(self.config.worker_config(), bus);
        match node_settings.server_type.as_str() {
            "hall" => handlers::install_hall(&mut node),
            other => warn!("⚠️ No built-in handlers for server type {}", other),
        }
        match store {
            Some(store) => {
                let registrar = Registrar::new(
                    store,
                    self.config
                        .registrar_config(&node_settings.server_id, &node_settings.server_type),
                )?;
                node = node.with_registrar(registrar);
            }
            None => warn!(
                "⚠️ No discovery endpoints; {} is only reachable through static [[servers]] lists",
                node_settings.server_id
            ),
        }
        let worker = node.start().await.context("failed to start worker")?;
        components.workers.push(worker);
        Ok(())
    }

    fn log_configuration_summary(&self) {
        let config = &self.config;
        info!("📋 Configuration Summary:");
        info!("  🆔 Server id: {} ({})", config.node.server_id, config.node.server_type);
        info!("  🎭 Role: {:?}", config.node.role);
        info!("  📨 Bus: {:?}", config.messaging.bus);
        if config.uses_external_store() {
            info!("  🔭 Discovery: etcd at {:?}", config.discovery.endpoints);
        }
        if config.node.role != Role::Worker {
            info!("  🌐 Bind address: {}", config.gateway.bind_address);
            info!(
                "  ⏱️ Heartbeat {}s | pong wait {}ms",
                config.gateway.heartbeat_secs, config.gateway.pong_wait_ms
            );
            info!("  ⚖️ Load balancer: {:?}", config.gateway.load_balancer);
        }
    }
}

fn apply_overrides(config: &mut AppConfig, args: &CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(role) = args.role {
        config.node.role = role;
    }
    if let Some(server_id) = &args.server_id {
        config.node.server_id = server_id.clone();
    }
    if let Some(bind_address) = &args.bind_address {
        config.gateway.bind_address = bind_address
            .parse()
            .map_err(|e| format!("Invalid bind address {bind_address}: {e}"))?;
    }
    if let Some(log_level) = &args.log_level {
        config.logging.level = log_level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
    Ok(())
}

async fn build_bus(config: &AppConfig) -> anyhow::Result<Arc<dyn MessageBus>> {
    match config.messaging.bus {
        BusKind::Local => Ok(Arc::new(LocalBus::new())),
        #[cfg(feature = "nats")]
        BusKind::Nats => {
            let bus = meridian_remote::NatsBus::connect(&config.messaging.nats_url)
                .await
                .with_context(|| format!("failed to connect to {}", config.messaging.nats_url))?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(feature = "nats"))]
        BusKind::Nats => bail!("bus = \"nats\" requires building with the `nats` feature"),
    }
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Option<Arc<dyn CoordinationStore>>> {
    if !config.uses_external_store() {
        return Ok(None);
    }
    connect_store(config).await.map(Some)
}

#[cfg(feature = "etcd")]
async fn connect_store(config: &AppConfig) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    let store = meridian_discovery::EtcdStore::connect(
        &config.discovery.endpoints,
        std::time::Duration::from_secs(config.discovery.dial_timeout),
    )
    .await
    .with_context(|| format!("failed to connect to etcd at {:?}", config.discovery.endpoints))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "etcd"))]
async fn connect_store(_config: &AppConfig) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    bail!("discovery.endpoints requires building with the `etcd` feature")
}

/// Stops the gateway first so no new requests arrive, then the workers.
async fn stop(mut components: Components) {
    if let Some(gateway) = components.gateway.take() {
        let _ = gateway.shutdown().await;
    }
    if let Some(task) = components.gateway_task.take() {
        if tokio::time::timeout(std::time::Duration::from_secs(8), task).await.is_err() {
            warn!("⏰ Gateway did not stop within timeout");
        }
    }
    for resolver in &components.resolvers {
        resolver.close().await;
    }
    for worker in &mut components.workers {
        worker.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeSettings;

    #[test]
    fn overrides_win_over_file_settings() {
        let mut config = AppConfig::default();
        let args = CliArgs {
            role: Some(Role::Gateway),
            server_id: Some("connector-9".into()),
            bind_address: Some("0.0.0.0:14000".into()),
            log_level: Some("debug".into()),
            json_logs: true,
            ..CliArgs::default()
        };
        apply_overrides(&mut config, &args).unwrap();

        assert_eq!(config.node.role, Role::Gateway);
        assert_eq!(config.gateway_config().server_id, "connector-9");
        assert_eq!(config.gateway.bind_address.port(), 14000);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
    }

    #[test]
    fn bad_bind_override_is_rejected() {
        let mut config = AppConfig::default();
        let args = CliArgs {
            bind_address: Some("nowhere".into()),
            ..CliArgs::default()
        };
        assert!(apply_overrides(&mut config, &args).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn standalone_node_starts_and_stops() {
        let mut config = AppConfig::default();
        config.gateway.bind_address = "127.0.0.1:0".parse().unwrap();
        let app = Application { config };

        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
        let components = app.start(Arc::clone(&bus), None).await.unwrap();
        assert_eq!(components.workers.len(), 1);
        assert_eq!(components.resolvers.len(), 1);
        assert!(components.gateway.is_some());

        stop(components).await;
    }

    #[tokio::test]
    async fn gateway_role_without_topology_fails() {
        let mut config = AppConfig::default();
        config.node.role = Role::Gateway;
        let app = Application { config };

        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
        assert!(app.start(bus, None).await.is_err());
    }

    fn node(server_id: &str, server_type: &str, role: Role) -> Application {
        let mut config = AppConfig::default();
        config.node = NodeSettings {
            server_id: server_id.to_string(),
            server_type: server_type.to_string(),
            role,
        };
        config.gateway.bind_address = "127.0.0.1:0".parse().unwrap();
        Application { config }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_registers_itself_in_the_shared_store() {
        let store = Arc::new(MemoryStore::new());
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());

        let worker = node("hall-7", "hall", Role::Worker);
        let components = worker.start(bus, Some(store.clone())).await.unwrap();
        assert!(store.contains_key("/hall/hall-7"));

        stop(components).await;
        assert!(!store.contains_key("/hall/hall-7"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gateway_discovers_a_separately_started_worker() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());

        let worker = node("hall-7", "hall", Role::Worker)
            .start(Arc::clone(&bus), Some(Arc::clone(&store)))
            .await
            .unwrap();

        // No [[servers]] list: the resolver only succeeds if it finds hall-7
        let gateway = node("connector-2", "connector", Role::Gateway)
            .start(Arc::clone(&bus), Some(Arc::clone(&store)))
            .await
            .unwrap();
        assert_eq!(gateway.resolvers.len(), 1);
        assert!(gateway.gateway.is_some());

        stop(gateway).await;
        stop(worker).await;
    }

    #[cfg(not(feature = "etcd"))]
    #[tokio::test]
    async fn endpoints_without_etcd_support_are_refused() {
        let mut config = AppConfig::default();
        config.discovery.endpoints = vec!["127.0.0.1:1".to_string()];
        config.discovery.dial_timeout = 1;
        assert!(build_store(&config).await.is_err());

        assert!(build_store(&AppConfig::default()).await.unwrap().is_none());
    }
}
