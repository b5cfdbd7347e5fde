//! # Shared Types Crate
//!
//! Channel data model shared across the node: participant addresses,
//! channel identifiers, signed channel states and the two lifecycle
//! state machines (MSContract and VPC).
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: every crate that touches a channel uses
//!   these types; no crate redefines them.
//! - **Signature slots are a tagged variant**: a state is `Unsigned`,
//!   `SignedByProposer` or `SignedByBoth`. There is no representation for
//!   "both slots empty but claimed confirmed".
//! - **Snapshots are plain values**: `Channel` is `Clone` and serializable so
//!   it can be handed to subscribers without sharing locks.

pub mod channel;
pub mod entities;
pub mod errors;

pub use channel::*;
pub use entities::*;
pub use errors::*;
