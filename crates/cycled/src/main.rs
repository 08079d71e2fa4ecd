//! Main application entry point for the cycle server daemon.
//!
//! Loads configuration, initializes logging and runs either the cycle
//! server or an agent relay until a termination signal arrives.

mod cli;
mod config;
mod demo;
mod signals;

use anyhow::{anyhow, Context};
use cli::{CliArgs, Mode};
use config::{AppConfig, LoggingSettings};
use cycle_server::{AgentServer, RelayServer};
use demo::EchoSimulation;
use signals::wait_for_shutdown_signal;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
fn setup_logging(config: &LoggingSettings) -> anyhow::Result<()> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    }

    info!("🔧 Logging initialized with level: {}", log_level);
    Ok(())
}

/// What the daemon is running.
enum Service {
    Server(AgentServer),
    Relay(RelayServer),
}

impl Service {
    fn stop(self) -> anyhow::Result<()> {
        match self {
            Service::Server(mut server) => server.stop()?,
            Service::Relay(mut relay) => relay.stop()?,
        }
        Ok(())
    }
}

/// Loaded configuration plus the selected mode.
pub struct Application {
    config: AppConfig,
    mode: Mode,
}

impl Application {
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        // Logging comes up only after the configuration is known.
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        config.apply_cli(&args);

        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

        setup_logging(&config.logging)?;
        info!(
            "🚀 cycled v{} | config: {}",
            env!("CARGO_PKG_VERSION"),
            args.config_path.display()
        );

        Ok(Self {
            config,
            mode: args.mode,
        })
    }

    fn start(&self) -> anyhow::Result<Service> {
        match self.mode {
            Mode::Server => {
                let server_config = self.config.to_server_config()?;
                info!("📋 Configuration Summary:");
                info!("  🌐 Bind address: {}", server_config.bind_address);
                info!("  👥 Max connections: {}", server_config.max_connections);
                info!(
                    "  🔁 Sync mode: {} | Multi-threaded: {}",
                    server_config.sync_mode, server_config.multi_threaded
                );
                info!("  ⏱️ Cycle interval: {:?}", server_config.cycle_interval);

                let mut server = AgentServer::new(server_config, Arc::new(EchoSimulation::new()))?;
                let addr = server.start().context("Failed to start cycle server")?;
                info!("✅ Cycle server accepting agents on {}", addr);
                Ok(Service::Server(server))
            }
            Mode::Relay { .. } => {
                let relay_config = self.config.to_relay_config()?;
                let upstream = relay_config.upstream_address;
                let period = relay_config.period;

                let mut relay = RelayServer::new(relay_config)?;
                let addr = relay.start().context("Failed to start relay")?;
                info!(
                    "✅ Relay accepting agents on {} → {} every {:?}",
                    addr, upstream, period
                );
                Ok(Service::Relay(relay))
            }
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let service = self.start()?;
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        wait_for_shutdown_signal().await?;
        info!("🛑 Shutdown signal received, stopping...");

        // Stopping joins the cycle and acceptor threads.
        tokio::task::spawn_blocking(move || service.stop())
            .await
            .context("Shutdown task failed")??;

        info!("👋 Shutdown complete");
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let app = match Application::new(args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("❌ Application error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}
