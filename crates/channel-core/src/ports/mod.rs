//! Ports (hexagonal architecture boundaries).

pub mod inbound;
pub mod outbound;

pub use inbound::{ChannelApi, NodeSettings, StateResponse, VpcProposal};
pub use outbound::{
    AdapterError, BlockchainAdapter, SignerError, StateSigner, SystemTimeSource, TimeSource,
    TxReceipt,
};
