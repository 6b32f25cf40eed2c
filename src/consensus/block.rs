//! Block structure
//!
//! The block id and the proof-of-work hash are both taken over the
//! hashing blob: header || merkle root of transaction hashes || tx count.

use serde::{Deserialize, Serialize};

use crate::crypto::{compute_merkle_root, double_hash, hash_bytes, Hash};
use crate::error::CoreResult;
use crate::serialization::{Reader, Writer};
use crate::validation::Transaction;

/// Smallest encoded transaction, bounds the transaction count prefix
const MIN_TX_SIZE: usize = 1 + 8 + 4 + 4 + 4 + 4;

/// Block header
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub major_version: u8,
    pub minor_version: u8,
    /// Seconds since the unix epoch
    pub timestamp: u64,
    pub prev_hash: Hash,
    pub nonce: u64,
    /// Difficulty this block claims to satisfy
    pub difficulty: u64,
}

impl BlockHeader {
    pub fn write(&self, w: &mut Writer) {
        w.u8(self.major_version)
            .u8(self.minor_version)
            .u64(self.timestamp)
            .hash(&self.prev_hash)
            .u64(self.nonce)
            .u64(self.difficulty);
    }

    pub fn read(r: &mut Reader<'_>) -> CoreResult<Self> {
        Ok(Self {
            major_version: r.u8()?,
            minor_version: r.u8()?,
            timestamp: r.u64()?,
            prev_hash: r.hash()?,
            nonce: r.u64()?,
            difficulty: r.u64()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write(&mut w);
        w.into_bytes()
    }
}

/// A complete block: header plus transactions, the first being the coinbase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    pub fn tx_hashes(&self) -> Vec<Hash> {
        self.transactions.iter().map(Transaction::hash).collect()
    }

    pub fn merkle_root(&self) -> Hash {
        compute_merkle_root(&self.tx_hashes())
    }

    /// Bytes the block id and proof of work are computed over
    pub fn hashing_blob(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.header.write(&mut w);
        w.hash(&self.merkle_root()).u32(self.transactions.len() as u32);
        w.into_bytes()
    }

    /// Block id
    pub fn hash(&self) -> Hash {
        hash_bytes(&self.hashing_blob())
    }

    /// Hash compared against the difficulty
    pub fn pow_hash(&self) -> Hash {
        double_hash(&self.hashing_blob())
    }

    pub fn prev_hash(&self) -> &Hash {
        &self.header.prev_hash
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.header.write(&mut w);
        w.len(self.transactions.len());
        for tx in &self.transactions {
            tx.write(&mut w);
        }
        w.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let mut r = Reader::new(bytes);
        let header = BlockHeader::read(&mut r)?;
        let count = r.len(MIN_TX_SIZE)?;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::read(&mut r)?);
        }
        r.finish()?;
        Ok(Self {
            header,
            transactions,
        })
    }

    /// Encoded size in bytes
    pub fn size(&self) -> u64 {
        self.to_bytes().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PublicKey;
    use crate::validation::TxOutput;

    fn sample_block(nonce: u64) -> Block {
        let header = BlockHeader {
            major_version: 3,
            minor_version: 0,
            timestamp: 1_600_000_000,
            prev_hash: hash_bytes(b"parent"),
            nonce,
            difficulty: 1,
        };
        let coinbase = Transaction::coinbase(5, 6, vec![TxOutput::new(100, PublicKey([7u8; 32]))]);
        Block::new(header, vec![coinbase])
    }

    #[test]
    fn test_header_encoding_size() {
        // versions (2) + timestamp (8) + prev (32) + nonce (8) + difficulty (8)
        assert_eq!(sample_block(0).header.to_bytes().len(), 58);
    }

    #[test]
    fn test_block_decode_inverts_encode() {
        let block = sample_block(9);
        assert_eq!(Block::from_bytes(&block.to_bytes()).unwrap(), block);
    }

    #[test]
    fn test_hash_covers_nonce_and_transactions() {
        let block = sample_block(1);
        assert_ne!(block.hash(), sample_block(2).hash());

        let mut altered = block.clone();
        altered.transactions[0].outputs[0].amount += 1;
        assert_ne!(altered.hash(), block.hash());
        assert_ne!(block.pow_hash(), block.hash());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample_block(0).to_bytes();
        bytes.push(0);
        assert!(Block::from_bytes(&bytes).is_err());
    }
}
