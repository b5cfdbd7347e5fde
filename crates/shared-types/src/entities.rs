//! # Core Domain Entities
//!
//! Identifiers and value types that appear inside channel states.
//!
//! ## Clusters
//!
//! - **Identity**: `Address`, `Party`
//! - **Identifiers**: `ChannelId`, `Sid`
//! - **Value**: `Amount`, `Balances`
//! - **Authentication**: `Signature`

use crate::errors::ParseError;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes, DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::str::FromStr;

// Re-export U256 from primitive-types for use across all crates
pub use primitive_types::U256;

/// A 32-byte Keccak-256 hash.
pub type Hash = [u8; 32];

/// Non-negative on-chain value (256-bit).
pub type Amount = U256;

/// Wall-clock time in milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Fixed-size byte identifiers rendered as `0x`-prefixed lowercase hex.
macro_rules! hex_identifier {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
            SerializeDisplay, DeserializeFromStr,
        )]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Byte length of this identifier.
            pub const LEN: usize = $len;

            /// Wrap raw bytes.
            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Borrow the raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let digits = s.strip_prefix("0x").unwrap_or(s);
                let decoded =
                    hex::decode(digits).map_err(|e| ParseError::InvalidHex(e.to_string()))?;
                let bytes: [u8; $len] =
                    decoded
                        .as_slice()
                        .try_into()
                        .map_err(|_| ParseError::InvalidLength {
                            expected: $len,
                            actual: decoded.len(),
                        })?;
                Ok(Self(bytes))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }
    };
}

hex_identifier!(
    /// A 20-byte chain address identifying a participant.
    Address,
    20
);

hex_identifier!(
    /// Identifier of a channel in the registry.
    ///
    /// MSContracts get a fresh random-derived id; a VPC uses its `Sid`.
    ChannelId,
    32
);

hex_identifier!(
    /// Identifier of a virtual payment channel: `keccak256(alice || bob || nonce)`.
    Sid,
    32
);

impl From<Sid> for ChannelId {
    fn from(sid: Sid) -> Self {
        ChannelId(sid.0)
    }
}

/// One of the two channel participants.
///
/// `A` is the channel creator (Alice), `B` the counterparty (Bob).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Party {
    /// Creator of the channel.
    A,
    /// Counterparty of the channel.
    B,
}

impl Party {
    /// The other participant.
    pub fn counterparty(self) -> Party {
        match self {
            Party::A => Party::B,
            Party::B => Party::A,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::A => f.write_str("A"),
            Party::B => f.write_str("B"),
        }
    }
}

/// The two participant addresses of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participants {
    /// Participant A.
    pub a: Address,
    /// Participant B.
    pub b: Address,
}

impl Participants {
    /// Create a participant pair.
    pub fn new(a: Address, b: Address) -> Self {
        Self { a, b }
    }

    /// Address of the given party.
    pub fn address(&self, party: Party) -> Address {
        match party {
            Party::A => self.a,
            Party::B => self.b,
        }
    }

    /// Which party (if any) owns `address`.
    pub fn party_of(&self, address: &Address) -> Option<Party> {
        if *address == self.a {
            Some(Party::A)
        } else if *address == self.b {
            Some(Party::B)
        } else {
            None
        }
    }

    /// Both addresses, A first.
    pub fn both(&self) -> [Address; 2] {
        [self.a, self.b]
    }
}

/// Per-participant balances (or blocked amounts for a VPC).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    /// Amount held by participant A.
    pub a: Amount,
    /// Amount held by participant B.
    pub b: Amount,
}

impl Balances {
    /// Create balances from two amounts.
    pub fn new(a: Amount, b: Amount) -> Self {
        Self { a, b }
    }

    /// Sum of both sides, `None` on overflow.
    pub fn total(&self) -> Option<Amount> {
        self.a.checked_add(self.b)
    }

    /// Balance of the given party.
    pub fn of(&self, party: Party) -> Amount {
        match party {
            Party::A => self.a,
            Party::B => self.b,
        }
    }
}

/// Recoverable secp256k1 signature over a state digest (r || s || v).
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde_as(as = "Bytes")] pub [u8; 65]);

impl Signature {
    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{}..)", hex::encode(&self.0[..8]))
    }
}
