//! # State Signing
//!
//! Digest and signature checks over the signed payload of a state.
//!
//! ```text
//! digest = keccak256("pcn-state-v1" || channel_id || version_be64 || balance_a_be256 || balance_b_be256)
//! ```
//!
//! A signature slot is valid when the address recovered from it equals the
//! participant owning that slot.

use crate::error::{ChannelError, ChannelResult};
use shared_crypto::{keccak256_many, recover_address, Hash, RecoverableSignature};
use shared_types::{ChannelState, Participants, Party, Signature, StateSignatures, U256};

/// Domain tag prefixed to every state digest.
pub const STATE_DOMAIN_TAG: &[u8] = b"pcn-state-v1";

/// Digest of the signed payload of `state`. Signatures are not included.
pub fn state_digest(state: &ChannelState) -> Hash {
    let version = state.version.to_be_bytes();
    let balance_a = u256_bytes(state.balances.a);
    let balance_b = u256_bytes(state.balances.b);

    keccak256_many(&[
        STATE_DOMAIN_TAG,
        state.channel_id.as_bytes(),
        &version,
        &balance_a,
        &balance_b,
    ])
}

fn u256_bytes(value: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    out
}

/// Check that `signature` over `state` was produced by `party`.
pub fn verify_slot(
    participants: &Participants,
    party: Party,
    state: &ChannelState,
    signature: &Signature,
) -> ChannelResult<()> {
    let digest = state_digest(state);
    let recovered = recover_address(&digest, &RecoverableSignature::from_bytes(signature.0))
        .map_err(|e| ChannelError::signature(format!("slot {}: {}", party, e)))?;

    let expected = participants.address(party);
    if recovered != expected.0 {
        return Err(ChannelError::signature(format!(
            "slot {} not signed by {}",
            party, expected
        )));
    }
    Ok(())
}

/// Verify a proposal: exactly the proposer's slot, and it must check out.
///
/// Returns the proposer.
pub fn verify_proposal(participants: &Participants, state: &ChannelState) -> ChannelResult<Party> {
    match &state.signatures {
        StateSignatures::SignedByProposer {
            proposer,
            signature,
        } => {
            verify_slot(participants, *proposer, state, signature)?;
            Ok(*proposer)
        }
        StateSignatures::Unsigned => Err(ChannelError::signature("proposal is unsigned")),
        StateSignatures::SignedByBoth { .. } => Err(ChannelError::signature(
            "proposal must carry only the proposer's signature",
        )),
    }
}

/// Verify a confirmed state: both slots filled and both check out.
pub fn verify_confirmed(participants: &Participants, state: &ChannelState) -> ChannelResult<()> {
    match &state.signatures {
        StateSignatures::SignedByBoth { a, b } => {
            verify_slot(participants, Party::A, state, a)?;
            verify_slot(participants, Party::B, state, b)
        }
        _ => Err(ChannelError::signature(
            "confirmed state requires both signatures",
        )),
    }
}

/// Combine a proposer-signed state with the counterparty's signature.
pub fn with_counter_signature(
    proposal: &ChannelState,
    counter_signature: Signature,
) -> ChannelResult<ChannelState> {
    let StateSignatures::SignedByProposer {
        proposer,
        signature,
    } = &proposal.signatures
    else {
        return Err(ChannelError::signature(
            "only a proposer-signed state can be counter-signed",
        ));
    };

    let signatures = match proposer {
        Party::A => StateSignatures::SignedByBoth {
            a: *signature,
            b: counter_signature,
        },
        Party::B => StateSignatures::SignedByBoth {
            a: counter_signature,
            b: *signature,
        },
    };
    Ok(proposal.clone().with_signatures(signatures))
}
