//! # Domain Invariants
//!
//! Business rules checked before any channel mutation.

use crate::error::{ChannelError, ChannelResult};
use shared_types::{Amount, Balances, Channel, Timestamp};

/// Invariant: version continuity.
///
/// A proposal must carry exactly the next version.
pub fn invariant_version_continuity(channel: &Channel, proposed: u64) -> ChannelResult<()> {
    let expected = channel.next_version();
    if proposed != expected {
        return Err(ChannelError::VersionConflict {
            expected,
            actual: proposed,
        });
    }
    Ok(())
}

/// Invariant: single outstanding proposal.
///
/// An expired proposal does not block; the caller discards it first.
pub fn invariant_single_proposal(channel: &Channel, now: Timestamp) -> ChannelResult<()> {
    match &channel.pending_proposal {
        Some(pending) if !pending.is_expired(now) => Err(ChannelError::ProposalInFlight {
            channel_id: channel.id,
            version: pending.state.version,
        }),
        _ => Ok(()),
    }
}

/// Invariant: blocked funds stay within the commitment.
///
/// Returns the new blocked total of `parent` after adding `blocked`.
pub fn invariant_funds_within_commitment(
    parent: &Channel,
    blocked: &Balances,
) -> ChannelResult<Amount> {
    let available = parent.funds.available();
    let requested = blocked.total().ok_or(ChannelError::FundsExceeded {
        requested: Amount::MAX,
        available,
    })?;

    if requested > available {
        return Err(ChannelError::FundsExceeded {
            requested,
            available,
        });
    }
    Ok(parent.funds.blocked + requested)
}

/// Invariant: state balances fit the channel's funds.
pub fn invariant_balances_within_funds(channel: &Channel, balances: &Balances) -> ChannelResult<()> {
    let available = channel.funds.committed;
    match balances.total() {
        Some(total) if total <= available => Ok(()),
        Some(total) => Err(ChannelError::FundsExceeded {
            requested: total,
            available,
        }),
        None => Err(ChannelError::FundsExceeded {
            requested: Amount::MAX,
            available,
        }),
    }
}

/// Invariant: no active nested channel.
///
/// An MSContract can only close once every VPC under it has settled.
pub fn invariant_no_active_children(parent: &Channel, children: &[Channel]) -> ChannelResult<()> {
    let active = children
        .iter()
        .filter(|c| c.is_active_child_of(&parent.id))
        .count();
    if active > 0 {
        return Err(ChannelError::invalid_state(
            "close_ms_contract",
            format!("{} virtual channel(s) not settled", active),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{
        Address, ChannelId, ChannelState, ChannelStatus, Participants, PendingProposal, Party,
        VpcStatus, U256,
    };

    fn parent(committed: u64, blocked: u64) -> Channel {
        let participants = Participants::new(Address::new([1u8; 20]), Address::new([2u8; 20]));
        let mut ch = Channel::new_ms_contract(ChannelId::new([1u8; 32]), participants, 0, 10);
        ch.funds.committed = U256::from(committed);
        ch.funds.blocked = U256::from(blocked);
        ch
    }

    fn child_of(parent: &Channel, status: VpcStatus) -> Channel {
        let state = ChannelState::unsigned(ChannelId::new([2u8; 32]), 0, Balances::default());
        let proposal = PendingProposal {
            state,
            proposer: Party::A,
            deadline: 10,
        };
        let mut ch = Channel::new_vpc(
            ChannelId::new([2u8; 32]),
            parent.id,
            parent.participants,
            proposal,
            U256::from(10),
            0,
        );
        ch.status = ChannelStatus::Vpc(status);
        ch
    }

    #[test]
    fn test_version_continuity() {
        let ch = parent(100, 0);
        assert!(invariant_version_continuity(&ch, 0).is_ok());
        assert_eq!(
            invariant_version_continuity(&ch, 2),
            Err(ChannelError::VersionConflict {
                expected: 0,
                actual: 2
            })
        );
    }

    #[test]
    fn test_single_proposal_allows_expired() {
        let mut ch = parent(100, 0);
        ch.pending_proposal = Some(PendingProposal {
            state: ChannelState::unsigned(ch.id, 0, Balances::default()),
            proposer: Party::A,
            deadline: 50,
        });

        assert!(matches!(
            invariant_single_proposal(&ch, 50),
            Err(ChannelError::ProposalInFlight { .. })
        ));
        assert!(invariant_single_proposal(&ch, 51).is_ok());
    }

    #[test]
    fn test_funds_within_commitment() {
        let ch = parent(100, 80);
        let ok = Balances::new(U256::from(10), U256::from(10));
        assert_eq!(invariant_funds_within_commitment(&ch, &ok).unwrap(), U256::from(100));

        let too_much = Balances::new(U256::from(15), U256::from(10));
        assert!(matches!(
            invariant_funds_within_commitment(&ch, &too_much),
            Err(ChannelError::FundsExceeded { .. })
        ));
    }

    #[test]
    fn test_funds_overflow_rejected() {
        let ch = parent(100, 0);
        let overflow = Balances::new(U256::MAX, U256::one());
        assert!(invariant_funds_within_commitment(&ch, &overflow).is_err());
    }

    #[test]
    fn test_balances_within_funds() {
        let ch = parent(100, 0);
        assert!(invariant_balances_within_funds(&ch, &Balances::new(U256::from(60), U256::from(40))).is_ok());
        assert!(invariant_balances_within_funds(&ch, &Balances::new(U256::from(60), U256::from(41))).is_err());
    }

    #[test]
    fn test_no_active_children() {
        let p = parent(100, 10);
        let settled = child_of(&p, VpcStatus::Settled);
        let active = child_of(&p, VpcStatus::Active);

        assert!(invariant_no_active_children(&p, &[settled.clone()]).is_ok());
        assert!(matches!(
            invariant_no_active_children(&p, &[settled, active]),
            Err(ChannelError::InvalidState { .. })
        ));
    }
}
