//! Transaction construction and signing
//!
//! The builder does no input selection or balance tracking: callers name
//! the outputs they spend and the key that owns each one.

use crate::crypto::{Hash, KeyImage, PrivateKey, PublicKey};
use crate::validation::{Transaction, TxInput, TxOutput, TX_VERSION_1, TX_VERSION_2};

/// Builds and signs a transaction
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    version: u8,
    unlock_time: u64,
    inputs: Vec<TxInput>,
    signers: Vec<PrivateKey>,
    outputs: Vec<TxOutput>,
    extra: Vec<u8>,
}

impl TransactionBuilder {
    fn with_version(version: u8) -> Self {
        Self {
            version,
            unlock_time: 0,
            inputs: Vec::new(),
            signers: Vec::new(),
            outputs: Vec::new(),
            extra: Vec::new(),
        }
    }

    /// Transaction spending outputs by (transaction hash, index)
    pub fn v1() -> Self {
        Self::with_version(TX_VERSION_1)
    }

    /// Transaction spending outputs through rings
    pub fn v2() -> Self {
        Self::with_version(TX_VERSION_2)
    }

    /// Spend output `index` of `tx_hash`, signed by `owner`
    pub fn spend_output(mut self, tx_hash: Hash, index: u32, owner: PrivateKey) -> Self {
        self.inputs.push(TxInput::ToOutput {
            tx_hash,
            output_index: index,
        });
        self.signers.push(owner);
        self
    }

    /// Spend the ring member whose key image is `key_image`
    ///
    /// `ring` holds global output indexes; the validator requires them
    /// strictly ascending.
    pub fn spend_ring(mut self, amount: u64, ring: Vec<u32>, key_image: KeyImage, owner: PrivateKey) -> Self {
        self.inputs.push(TxInput::ToKey {
            amount,
            ring,
            key_image,
        });
        self.signers.push(owner);
        self
    }

    pub fn pay(mut self, key: PublicKey, amount: u64) -> Self {
        self.outputs.push(TxOutput::new(amount, key));
        self
    }

    /// Lock `amount` as a deposit for `term` blocks
    pub fn deposit(mut self, key: PublicKey, amount: u64, term: u32) -> Self {
        self.outputs.push(TxOutput::deposit(amount, key, term));
        self
    }

    pub fn unlock_time(mut self, unlock_time: u64) -> Self {
        self.unlock_time = unlock_time;
        self
    }

    pub fn extra(mut self, extra: Vec<u8>) -> Self {
        self.extra = extra;
        self
    }

    /// Sign every input over the prefix hash with its own key
    pub fn build(self) -> Transaction {
        let mut tx = Transaction {
            version: self.version,
            unlock_time: self.unlock_time,
            inputs: self.inputs,
            outputs: self.outputs,
            extra: self.extra,
            signatures: Vec::new(),
        };
        let prefix_hash = tx.prefix_hash();
        tx.signatures = self.signers.iter().map(|key| key.sign(&prefix_hash)).collect();
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;

    #[test]
    fn test_each_input_signed_by_its_owner() {
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();
        let tx = TransactionBuilder::v1()
            .spend_output(hash_bytes(b"a"), 0, alice.clone())
            .spend_output(hash_bytes(b"b"), 3, bob.clone())
            .pay(alice.public_key(), 10)
            .unlock_time(5)
            .build();

        let message = tx.prefix_hash();
        assert_eq!(tx.signatures.len(), 2);
        assert!(alice.public_key().verify(&message, &tx.signatures[0]));
        assert!(bob.public_key().verify(&message, &tx.signatures[1]));
        assert!(!alice.public_key().verify(&message, &tx.signatures[1]));
    }

    #[test]
    fn test_ring_input_and_deposit_output() {
        let owner = PrivateKey::generate();
        let image = hash_bytes(b"image");
        let tx = TransactionBuilder::v2()
            .spend_ring(500, vec![1, 2, 7], image, owner.clone())
            .deposit(owner.public_key(), 400, 30)
            .extra(vec![1, 2])
            .build();

        assert_eq!(tx.version, TX_VERSION_2);
        assert_eq!(tx.key_images(), vec![image]);
        assert!(tx.creates_deposit());
        assert_eq!(tx.extra, vec![1, 2]);
    }
}
