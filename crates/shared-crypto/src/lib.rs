//! # Shared Crypto - Channel State Signatures
//!
//! ## Components
//!
//! | Module | Algorithm | Use Case |
//! |--------|-----------|----------|
//! | `hashing` | Keccak-256 | State digests, Sid / ChannelId derivation |
//! | `ecdsa` | secp256k1 (recoverable) | Signing and verifying channel states |
//!
//! ## Security Properties
//!
//! - **secp256k1**: RFC 6979 deterministic nonces, low-S normalization (EIP-2)
//! - **Addresses**: last 20 bytes of Keccak-256 over the uncompressed public key

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ecdsa;
pub mod errors;
pub mod hashing;

// Re-exports
pub use ecdsa::{recover_address, EthAddress, RecoverableSignature, Secp256k1KeyPair};
pub use errors::CryptoError;
pub use hashing::{keccak256, keccak256_many, Hash};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
