//! # ECDSA Signatures (secp256k1)
//!
//! Recoverable ECDSA signatures over 32-byte prehashed digests.
//!
//! ## Security Properties
//!
//! - RFC 6979 deterministic nonces (no RNG dependency for signing)
//! - Low-S normalization (EIP-2)
//! - Signer identity is the recovered Ethereum-style address, so a
//!   signature can be checked against a participant without knowing
//!   the participant's public key
//! - The secret scalar lives only in k256's `SigningKey`, which wipes
//!   itself on drop; byte copies handed in or out are wiped as well

use crate::hashing::{keccak256, Hash};
use crate::CryptoError;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use zeroize::{Zeroize, Zeroizing};

/// Ethereum-style address (last 20 bytes of keccak256(pubkey)).
pub type EthAddress = [u8; 20];

/// Recoverable ECDSA signature (65 bytes, r || s || v).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoverableSignature([u8; 65]);

impl RecoverableSignature {
    /// Create from bytes (65 bytes).
    pub fn from_bytes(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    /// Consume into raw bytes.
    pub fn to_bytes(self) -> [u8; 65] {
        self.0
    }

    fn split(&self) -> (&[u8], u8) {
        (&self.0[..64], self.0[64])
    }
}

/// secp256k1 ECDSA keypair.
pub struct Secp256k1KeyPair {
    signing_key: SigningKey,
}

impl Secp256k1KeyPair {
    /// Generate random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        Self { signing_key }
    }

    /// Create from secret key bytes (32 bytes). The given copy is wiped.
    pub fn from_bytes(mut bytes: [u8; 32]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_bytes((&bytes).into());
        bytes.zeroize();
        let signing_key = signing_key.map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self { signing_key })
    }

    /// Address controlled by this keypair.
    pub fn address(&self) -> EthAddress {
        address_from_verifying_key(self.signing_key.verifying_key())
    }

    /// Sign a 32-byte digest (deterministic RFC 6979).
    pub fn sign_prehash(&self, digest: &Hash) -> Result<RecoverableSignature, CryptoError> {
        let (sig, recovery_id): (Signature, RecoveryId) = self
            .signing_key
            .sign_prehash_recoverable(digest)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;

        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&sig.to_bytes());
        bytes[64] = recovery_id.to_byte();
        Ok(RecoverableSignature(bytes))
    }

    /// Get secret key bytes (for serialization), wiped when dropped.
    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes().into())
    }
}

/// Derive the Ethereum-style address of a public key.
pub fn address_from_verifying_key(key: &VerifyingKey) -> EthAddress {
    let encoded = key.to_encoded_point(false);
    // Skip the 0x04 uncompressed-point prefix
    let hash = keccak256(&encoded.as_bytes()[1..]);

    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

/// Recover the address that produced `signature` over `digest`.
pub fn recover_address(
    digest: &Hash,
    signature: &RecoverableSignature,
) -> Result<EthAddress, CryptoError> {
    let (rs, v) = signature.split();
    let recovery_id = parse_recovery_id(v)?;

    let sig = Signature::from_slice(rs).map_err(|_| CryptoError::InvalidSignatureFormat)?;

    // High-S signatures are malleable; reject them outright (EIP-2)
    if sig.normalize_s().is_some() {
        return Err(CryptoError::InvalidSignatureFormat);
    }

    let key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)
        .map_err(|_| CryptoError::RecoveryFailed)?;

    Ok(address_from_verifying_key(&key))
}

/// Accepts both raw (0/1) and Ethereum (27/28) recovery ids.
fn parse_recovery_id(v: u8) -> Result<RecoveryId, CryptoError> {
    let normalized = match v {
        0 | 1 => v,
        27 | 28 => v - 27,
        other => return Err(CryptoError::InvalidRecoveryId(other)),
    };
    RecoveryId::from_byte(normalized).ok_or(CryptoError::InvalidRecoveryId(v))
}
