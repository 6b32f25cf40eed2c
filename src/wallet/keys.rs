//! Key pairs
//!
//! Keys do not affect consensus; a wallet bug here cannot change supply.

use crate::crypto::{PrivateKey, PublicKey, SignatureError};

/// A signing key with its public half and address
#[derive(Debug, Clone)]
pub struct KeyPair {
    private_key: PrivateKey,
    pub public_key: PublicKey,
    pub address: String,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self::from_private_key(PrivateKey::generate())
    }

    /// Deterministic keypair, used for reproducible test networks
    pub fn from_seed(seed: &[u8]) -> Result<Self, SignatureError> {
        PrivateKey::from_seed(seed).map(Self::from_private_key)
    }

    /// Import from private key bytes
    pub fn from_private_key_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        PrivateKey::from_bytes(bytes).map(Self::from_private_key)
    }

    pub fn from_private_key(private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key();
        let address = public_key.to_address();
        Self {
            private_key,
            public_key,
            address,
        }
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Export private key bytes
    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.private_key.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_keys_are_stable() {
        let a = KeyPair::from_seed(b"miner").unwrap();
        let b = KeyPair::from_seed(b"miner").unwrap();
        assert_eq!(a.public_key, b.public_key);
        assert_eq!(a.address, b.address);
        assert_ne!(a.public_key, KeyPair::from_seed(b"other").unwrap().public_key);
    }

    #[test]
    fn test_address_round_trips_to_key() {
        let pair = KeyPair::generate();
        assert!(pair.address.starts_with(crate::constants::ADDRESS_PREFIX));
        assert_eq!(PublicKey::from_address(&pair.address).unwrap(), pair.public_key);

        let imported = KeyPair::from_private_key_bytes(&pair.private_key_bytes()).unwrap();
        assert_eq!(imported.public_key, pair.public_key);
    }
}
