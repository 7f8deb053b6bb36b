//! # Meridian - Main Entry Point
//!
//! One binary for every process of a Meridian deployment: the WebSocket
//! gateway, a service worker, or both in a single standalone process. This
//! entry point handles CLI parsing, configuration loading, and application
//! lifecycle management.
//!
//! ## Quick Start
//!
//! ```bash
//! # Gateway plus hall worker in one process, local bus
//! meridian
//!
//! # Split deployment over NATS and etcd (build with --features nats,etcd)
//! meridian --config hall.toml --role worker --server-id hall-1
//! meridian --config gateway.toml --role gateway --bind 0.0.0.0:12000
//!
//! # JSON logging for production
//! meridian --json-logs
//! ```
//!
//! ## Configuration
//!
//! The node loads configuration from a TOML file (default: `config.toml`).
//! If the file doesn't exist, a default configuration will be created.
//!
//! ## Signal Handling
//!
//! The node shuts down gracefully on SIGINT (Ctrl+C) and, on Unix, SIGTERM.
//! A second signal exits immediately.

use tracing::error;

mod app;
mod cli;
mod config;
mod handlers;
mod logging;
mod signals;

use app::Application;
use cli::CliArgs;

pub use config::{AppConfig, BusKind, LoggingSettings, Role, ServerEntry};
pub use handlers::install_hall;

/// Main entry point for a Meridian node.
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or runtime
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Load configuration to get logging settings
    let mut config = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default();
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}
