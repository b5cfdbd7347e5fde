//! # Service Container
//!
//! Builds the channel service and its adapters from a [`NodeConfig`].
//!
//! ## Wiring
//!
//! - `InMemoryChain` stands in for the blockchain adapter
//! - `KeyringSigner` holds the node's key when `PCN_SIGNING_KEY` is set
//! - `SystemTimeSource` drives every deadline

pub mod config;

pub use config::{ConfigError, NodeConfig};

use std::sync::Arc;

use channel_core::{ChannelService, InMemoryChain, KeyringSigner, SystemTimeSource};
use tracing::{info, warn};

/// Service type run by the node binary.
pub type NodeService = ChannelService<InMemoryChain, SystemTimeSource, KeyringSigner>;

/// Wired service and the handles the runtime keeps.
pub struct ServiceContainer {
    /// Configuration the container was built from.
    pub config: NodeConfig,
    /// Channel service.
    pub service: Arc<NodeService>,
    /// Chain adapter shared with the service.
    pub chain: Arc<InMemoryChain>,
}

impl ServiceContainer {
    /// Wire adapters and the service.
    ///
    /// With a signing key and no own address, the key's address becomes the
    /// own address.
    pub fn new(config: NodeConfig) -> Result<Self, ConfigError> {
        let chain = Arc::new(InMemoryChain::new());
        let signer = Arc::new(KeyringSigner::new());
        let mut settings = config.settings.clone();

        if let Some(secret) = config.signing_key {
            let derived = signer
                .import(secret)
                .map_err(|e| ConfigError::KeyRejected(e.to_string()))?;
            match settings.own_address {
                Some(configured) if configured != derived => {
                    return Err(ConfigError::SigningKeyMismatch {
                        configured,
                        derived,
                    });
                }
                Some(_) => {}
                None => settings.own_address = Some(derived),
            }
            info!(address = %derived, "Signing key loaded");
        } else {
            warn!("No PCN_SIGNING_KEY set; the node cannot sign channel states");
        }

        if settings.vpc_address.is_none() {
            warn!("No PCN_VPC_ADDRESS set; VPC registration and closing are unavailable");
        }

        let service = ChannelService::new(
            config.channel.clone(),
            chain.clone(),
            Arc::new(SystemTimeSource),
            signer,
        )
        .with_settings(settings);

        Ok(Self {
            config,
            service: Arc::new(service),
            chain,
        })
    }
}
