//! # Payment Channel Node Runtime
//!
//! The main entry point for the payment channel node.
//!
//! ## Architecture
//!
//! ```text
//!   env ──→ NodeConfig ──→ ServiceContainer
//!                               │
//!             ┌─────────────────┼──────────────────┐
//!             ↓                 ↓                  ↓
//!       InMemoryChain    ChannelService      KeyringSigner
//!                               │
//!                   ┌───────────┴───────────┐
//!                   ↓                       ↓
//!              Supervisor            EventDispatcher
//!           (deadline sweep)      (per-address event log)
//! ```
//!
//! ## Startup Sequence
//!
//! 1. Load configuration from the environment
//! 2. Initialize structured logging
//! 3. Wire adapters and the channel service
//! 4. Spawn the supervisor
//! 5. Wait for Ctrl+C
//!
//! ## Shutdown Sequence
//!
//! 1. Signal the supervisor to stop and wait for it
//! 2. Close the event dispatcher so open subscriptions end

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use channel_core::{ChannelApi, Supervisor};
use channel_telemetry::init_logging;
use node_runtime::{NodeConfig, ServiceContainer};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The node runtime: the wired service plus its background tasks.
pub struct NodeRuntime {
    /// Service container with the channel service and adapters.
    container: Arc<ServiceContainer>,
    /// Supervisor task, present once started.
    supervisor: Option<JoinHandle<()>>,
    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl NodeRuntime {
    /// Create a new node runtime with configuration.
    pub fn new(config: NodeConfig) -> Result<Self> {
        info!("Creating payment channel node runtime");

        let container =
            Arc::new(ServiceContainer::new(config).context("Failed to wire channel service")?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            container,
            supervisor: None,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Start background tasks.
    pub async fn start(&mut self) -> Result<()> {
        info!("===========================================");
        info!("  Payment Channel Node v{}", channel_core::VERSION);
        info!("===========================================");

        let settings = self.container.service.settings().await;
        let channel = &self.container.config.channel;
        info!(
            own_address = ?settings.own_address,
            lib_sig_address = ?settings.lib_sig_address,
            vpc_address = ?settings.vpc_address,
            "Node settings"
        );
        info!(
            confirmation_secs = channel.confirmation_timeout.as_secs(),
            negotiation_secs = channel.negotiation_timeout.as_secs(),
            response_secs = channel.response_timeout.as_secs(),
            proposal_secs = channel.proposal_timeout.as_secs(),
            auto_fallback = channel.auto_fallback,
            "Channel timings"
        );

        let supervisor = Supervisor::new(self.container.service.clone());
        self.supervisor = Some(supervisor.spawn(self.shutdown_rx.clone()));

        info!("Supervisor running");
        Ok(())
    }

    /// Shutdown the node gracefully.
    pub async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal: {}", e);
        }

        if let Some(handle) = self.supervisor.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Supervisor task failed: {}", e),
                Err(_) => warn!("Supervisor did not stop within 5s"),
            }
        }

        let channels = self.container.service.get_channels().await;
        let open = channels.iter().filter(|c| !c.status.is_terminal()).count();
        if open > 0 {
            warn!(open, "Shutting down with unsettled channels");
        }

        self.container.service.events().close();
        info!("Shutdown complete");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_env().context("Invalid node configuration")?;
    init_logging(&config.telemetry).context("Failed to initialize logging")?;

    let mut runtime = NodeRuntime::new(config)?;
    runtime.start().await?;

    info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    runtime.shutdown().await;

    Ok(())
}
