//! # Integration Tests Crate
//!
//! End-to-end tests driving the channel node through its RPC surface with
//! an in-memory chain, a manual clock and a keyring holding both
//! participants' keys.
//!
//! ## Structure
//!
//! ```text
//! integration-tests/
//! ├── src/
//! │   ├── lib.rs          # This file
//! │   ├── harness.rs      # TestNode fixture and signing helpers
//! │   ├── flows.rs        # Lifecycle scenarios
//! │   └── properties.rs   # Invariants under reordering and concurrency
//! ```
//!
//! ## Flows
//!
//! 1. **MSContract → VPC → payment → close → settle**: funds return to the parent
//! 2. **Missed confirmation**: refund exactly once
//! 3. **Propose/respond**: counterparty answers from its event log
//! 4. **Dispute**: settlement waits for the response window
//! 5. **Adapter failure**: `Failed` reaches both participants, channel unchanged

#[cfg(test)]
mod harness;

pub mod flows;
pub mod properties;
