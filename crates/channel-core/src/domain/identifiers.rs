//! Channel identifier derivation.

use rand::rngs::OsRng;
use rand::RngCore;
use shared_crypto::keccak256_many;
use shared_types::{Address, ChannelId, Sid};

/// Domain tag for MSContract ids.
const MS_CONTRACT_TAG: &[u8] = b"pcn-msc";

/// Draw a 32-byte nonce from the OS CSPRNG.
pub fn fresh_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// `Sid = keccak256(alice || bob || nonce)`.
pub fn derive_sid(alice: &Address, bob: &Address, nonce: &[u8; 32]) -> Sid {
    Sid::new(keccak256_many(&[alice.as_bytes(), bob.as_bytes(), nonce]))
}

/// MSContract id: `keccak256("pcn-msc" || alice || bob || nonce)`.
pub fn derive_channel_id(alice: &Address, bob: &Address, nonce: &[u8; 32]) -> ChannelId {
    ChannelId::new(keccak256_many(&[
        MS_CONTRACT_TAG,
        alice.as_bytes(),
        bob.as_bytes(),
        nonce,
    ]))
}
