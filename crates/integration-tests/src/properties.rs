//! # Channel Properties
//!
//! Invariants that must hold whatever order operations arrive in:
//!
//! - Confirmed versions never go backwards
//! - Acceptance requires both slots to verify over the same payload
//! - One outstanding proposal per channel, even under concurrent proposers
//! - An MSContract with an unsettled VPC cannot close
//! - Forced registration after a missed negotiation deadline, and settling
//!   or abandoning an unconfirmed VPC without the counterparty
//! - Stream resume replays missed entries in order
//! - Blocked funds never exceed the parent's commitment
