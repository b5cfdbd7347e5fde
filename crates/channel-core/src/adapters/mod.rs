//! Adapters implementing the outbound ports.

pub mod chain;
pub mod clock;
pub mod signer;

pub use chain::{ChainOp, ChainRecord, InMemoryChain};
pub use clock::ManualClock;
pub use signer::KeyringSigner;
