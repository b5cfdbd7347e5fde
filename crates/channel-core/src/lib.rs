//! # channel-core
//!
//! Lifecycle core of an off-chain payment channel node.
//!
//! ## Overview
//!
//! This crate provides:
//! - **MSContract**: Bilateral on-chain root channel (create, confirm, refund, close)
//! - **VPC**: Virtual channels nested in an MSContract, opened off-chain
//! - **State Updates**: Signed propose/respond handshake advancing a channel's version
//! - **Supervisor**: Deadline sweep with fallbacks when a counterparty goes silent
//!
//! ## Architecture
//!
//! ```text
//! RPC transport ──ChannelApi──→ ChannelService ──BlockchainAdapter──→ chain
//!                                   │    │
//!                                   │    ├── StateUpdateEngine
//!                                   │    └── StateSigner (local keys)
//!                                   │
//!                     ChannelRegistry + EventDispatcher ──→ subscribers
//!                                   ↑
//!                               Supervisor (tick)
//! ```
//!
//! ## Deadlines
//!
//! | Phase | Deadline | Fallback |
//! |-------|----------|----------|
//! | MSContract `PendingConfirm` | confirmation | `refund_channel` |
//! | VPC `Proposed` / `Negotiated` | negotiation | `finalize_register` |
//! | `Closing` | response | `finalize_close_ms_contract` / `execute_close_virtual_channel` |
//! | pending proposal | proposal | discarded |
//!
//! ## Example
//!
//! ```rust,ignore
//! use channel_core::{ChannelApi, ChannelConfig, ChannelService, InMemoryChain, KeyringSigner};
//! use channel_core::ports::SystemTimeSource;
//!
//! let service = ChannelService::new(
//!     ChannelConfig::from_env(),
//!     Arc::new(InMemoryChain::new()),
//!     Arc::new(SystemTimeSource),
//!     Arc::new(KeyringSigner::new()),
//! );
//!
//! let channel = service.create_new_ms_channel(alice, bob).await?;
//! let stream = service.confirm_channel(channel.id, amount).await?;
//! ```

pub mod adapters;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ports;
pub mod registry;
pub mod service;
pub mod supervisor;

pub use adapters::{ChainOp, ChainRecord, InMemoryChain, KeyringSigner, ManualClock};
pub use config::{ChannelConfig, RetryPolicy};
pub use engine::{ProposalOutcome, ProposalTicket, StateUpdateEngine};
pub use error::{ChannelError, ChannelResult};
pub use ports::inbound::{ChannelApi, NodeSettings, StateResponse, VpcProposal};
pub use ports::outbound::{
    AdapterError, BlockchainAdapter, SignerError, StateSigner, SystemTimeSource, TimeSource,
    TxReceipt,
};
pub use registry::{ChainCall, ChannelGuard, ChannelRegistry};
pub use service::ChannelService;
pub use supervisor::{Supervisor, SweepReport};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
