//! Schnorr signatures over secp256k1
//!
//! One-time output keys are x-only secp256k1 public keys. Every
//! transaction input carries one signature over the transaction prefix hash.

use k256::schnorr::signature::{Signer, Verifier};
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{double_hash, hash_bytes, Hash};
use crate::constants::ADDRESS_PREFIX;

/// Signature errors
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid private key")]
    InvalidPrivateKey,
}

/// Address decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must start with {0}")]
    InvalidPrefix(&'static str),
    #[error("invalid base58 encoding")]
    InvalidEncoding,
    #[error("invalid address length {0}")]
    InvalidLength(usize),
    #[error("address checksum mismatch")]
    InvalidChecksum,
}

/// 32-byte private key
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

/// 32-byte public key (x-only for Schnorr)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "pubkey_serde")] pub [u8; 32]);

/// 64-byte Schnorr signature
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrSignature(#[serde(with = "sig_serde")] pub [u8; 64]);

mod pubkey_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid public key length"))
    }
}

mod sig_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid signature length"))
    }
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        PrivateKey(SigningKey::random(&mut OsRng))
    }

    /// Create from 32 bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        SigningKey::from_bytes(bytes)
            .map(PrivateKey)
            .map_err(|_| SignatureError::InvalidPrivateKey)
    }

    /// Deterministic key derived from an arbitrary seed
    pub fn from_seed(seed: &[u8]) -> Result<Self, SignatureError> {
        Self::from_bytes(&hash_bytes(seed).0)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes().into())
    }

    /// Sign a message hash
    pub fn sign(&self, message: &Hash) -> SchnorrSignature {
        let signature: Signature = self.0.sign(&message.0);
        SchnorrSignature(signature.to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes().into()
    }
}

impl PublicKey {
    /// Create from 32 bytes, rejecting points not on the curve
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        VerifyingKey::from_bytes(bytes).map_err(|_| SignatureError::InvalidPublicKey)?;
        Ok(PublicKey(*bytes))
    }

    /// Verify a signature over `message`
    pub fn verify(&self, message: &Hash, signature: &SchnorrSignature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig) = Signature::try_from(signature.0.as_slice()) else {
            return false;
        };
        verifying_key.verify(&message.0, &sig).is_ok()
    }

    /// Address = prefix + base58(pubkey || checksum[0..4])
    pub fn to_address(&self) -> String {
        let checksum = double_hash(&self.0);
        let mut payload = Vec::with_capacity(36);
        payload.extend_from_slice(&self.0);
        payload.extend_from_slice(&checksum.0[0..4]);
        format!("{}{}", ADDRESS_PREFIX, bs58::encode(&payload).into_string())
    }

    /// Parse an address produced by [`PublicKey::to_address`]
    pub fn from_address(address: &str) -> Result<Self, AddressError> {
        let encoded = address
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or(AddressError::InvalidPrefix(ADDRESS_PREFIX))?;
        let decoded = bs58::decode(encoded)
            .into_vec()
            .map_err(|_| AddressError::InvalidEncoding)?;
        if decoded.len() != 36 {
            return Err(AddressError::InvalidLength(decoded.len()));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded[0..32]);
        if decoded[32..36] != double_hash(&key).0[0..4] {
            return Err(AddressError::InvalidChecksum);
        }
        Ok(PublicKey(key))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl SchnorrSignature {
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        SchnorrSignature(*bytes)
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl std::fmt::Debug for SchnorrSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let private = PrivateKey::generate();
        let message = hash_bytes(b"prefix");
        let signature = private.sign(&message);

        assert!(private.public_key().verify(&message, &signature));
        assert!(!private.public_key().verify(&hash_bytes(b"other"), &signature));
    }

    #[test]
    fn test_wrong_key_fails() {
        let signer = PrivateKey::generate();
        let other = PrivateKey::generate();
        let message = hash_bytes(b"prefix");

        assert!(!other.public_key().verify(&message, &signer.sign(&message)));
    }

    #[test]
    fn test_seeded_keys_are_stable() {
        let a = PrivateKey::from_seed(b"miner").unwrap();
        let b = PrivateKey::from_seed(b"miner").unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(PrivateKey::from_bytes(&a.to_bytes()).unwrap().public_key(), a.public_key());
    }

    #[test]
    fn test_address_roundtrip() {
        let key = PrivateKey::generate().public_key();
        let address = key.to_address();

        assert!(address.starts_with(ADDRESS_PREFIX));
        assert_eq!(PublicKey::from_address(&address).unwrap(), key);
    }

    #[test]
    fn test_address_rejects_tampering() {
        let address = PrivateKey::generate().public_key().to_address();
        assert_eq!(
            PublicKey::from_address(&address[2..]),
            Err(AddressError::InvalidPrefix(ADDRESS_PREFIX))
        );

        let mut chars: Vec<char> = address.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '2' { '3' } else { '2' };
        let tampered: String = chars.into_iter().collect();
        assert!(PublicKey::from_address(&tampered).is_err());
    }
}
