//! In-memory keyring implementing `StateSigner`.

use crate::ports::outbound::{SignerError, StateSigner};
use parking_lot::RwLock;
use shared_crypto::{Hash, Secp256k1KeyPair};
use shared_types::{Address, Signature};
use std::collections::HashMap;

/// Holds secp256k1 keys in memory, indexed by address.
#[derive(Default)]
pub struct KeyringSigner {
    keys: RwLock<HashMap<Address, Secp256k1KeyPair>>,
}

impl KeyringSigner {
    /// Create an empty keyring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key; returns its address.
    pub fn insert(&self, key: Secp256k1KeyPair) -> Address {
        let address = Address::new(key.address());
        self.keys.write().insert(address, key);
        address
    }

    /// Generate and add a fresh key; returns its address.
    pub fn generate(&self) -> Address {
        self.insert(Secp256k1KeyPair::generate())
    }

    /// Add a key from its 32 secret bytes.
    pub fn import(&self, secret: [u8; 32]) -> Result<Address, SignerError> {
        let key = Secp256k1KeyPair::from_bytes(secret)
            .map_err(|e| SignerError::Failed(e.to_string()))?;
        Ok(self.insert(key))
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Whether the keyring is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

impl StateSigner for KeyringSigner {
    fn sign_digest(&self, address: &Address, digest: &Hash) -> Result<Signature, SignerError> {
        let keys = self.keys.read();
        let key = keys
            .get(address)
            .ok_or(SignerError::UnknownAddress(*address))?;
        let signature = key
            .sign_prehash(digest)
            .map_err(|e| SignerError::Failed(e.to_string()))?;
        Ok(Signature(signature.to_bytes()))
    }

    fn holds(&self, address: &Address) -> bool {
        self.keys.read().contains_key(address)
    }
}
