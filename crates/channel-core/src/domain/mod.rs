//! Domain layer - signing payload, identifiers, business rules.

pub mod identifiers;
pub mod invariants;
pub mod signing;

pub use identifiers::{derive_channel_id, derive_sid, fresh_nonce};
pub use invariants::{
    invariant_balances_within_funds, invariant_funds_within_commitment,
    invariant_no_active_children, invariant_single_proposal, invariant_version_continuity,
};
pub use signing::{
    state_digest, verify_confirmed, verify_proposal, verify_slot, with_counter_signature,
    STATE_DOMAIN_TAG,
};
