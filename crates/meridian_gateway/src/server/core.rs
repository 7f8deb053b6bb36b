//! Core gateway server implementation.
//!
//! The [`GatewayServer`] accepts WebSocket clients, subscribes to the bus
//! under its own server id and runs the connection manager's intake loops.
//! It carries no application logic; handlers live in the router and in the
//! workers behind it.

use crate::{
    config::GatewayConfig,
    connection::ConnectionManager,
    error::ServerError,
    messaging::Router,
    server::handlers::handle_connection,
};
use meridian_remote::MessageBus;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

pub struct GatewayServer {
    config: Arc<GatewayConfig>,
    connection_manager: Arc<ConnectionManager>,
    bus: Arc<dyn MessageBus>,
    /// Latched shutdown flag; a late subscriber still sees it
    shutdown_sender: watch::Sender<bool>,
}

impl GatewayServer {
    /// Creates a new gateway.
    ///
    /// # Arguments
    ///
    /// * `config` - Gateway configuration, shared read-only from here on
    /// * `router` - Fully configured router; local handlers must be installed
    /// * `bus` - Bus the gateway subscribes to and publishes through
    pub fn new(config: GatewayConfig, router: Router, bus: Arc<dyn MessageBus>) -> Self {
        let config = Arc::new(config);
        let (shutdown_sender, _) = watch::channel(false);
        Self {
            connection_manager: Arc::new(ConnectionManager::new(
                Arc::clone(&config),
                Arc::new(router),
            )),
            config,
            bus,
            shutdown_sender,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn connection_manager(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.connection_manager)
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(self.config.bind_address)
            .await
            .map_err(|e| ServerError::Network(format!("Failed to bind {}: {e}", self.config.bind_address)))
    }

    /// Binds the configured address and serves until [`GatewayServer::shutdown`].
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serves clients on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr: Option<SocketAddr> = listener.local_addr().ok();
        info!(
            "🚀 Gateway {} listening on {}",
            self.config.server_id,
            local_addr.map_or_else(|| self.config.bind_address.to_string(), |a| a.to_string())
        );

        let inbox = self.bus.subscribe(&self.config.server_id).await?;
        let intake = self.connection_manager.start(inbox);

        let shutdown_receiver = self.shutdown_sender.subscribe();
        let accept_loop = {
            let connection_manager = Arc::clone(&self.connection_manager);
            async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            let connection_manager = Arc::clone(&connection_manager);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, connection_manager).await {
                                    error!("Connection error: {:?}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            break;
                        }
                    }
                }
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = stopped(shutdown_receiver) => {
                info!("Internal shutdown signal received");
            }
        }

        info!("🧹 Performing gateway cleanup...");
        self.connection_manager.close_all().await;
        for task in intake {
            task.abort();
        }
        info!("✅ Gateway {} stopped", self.config.server_id);
        Ok(())
    }

    /// Initiates server shutdown.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        info!("🛑 Shutting down gateway {}", self.config.server_id);
        self.shutdown_sender.send_replace(true);
        Ok(())
    }
}

/// Resolves once the flag is set, including when it was set before the call.
async fn stopped(mut receiver: watch::Receiver<bool>) {
    let _ = receiver.wait_for(|stopped| *stopped).await;
}
