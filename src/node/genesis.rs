//! Genesis block generation
//!
//! The genesis block is derived from the currency parameters alone, so every
//! node built from the same parameters agrees on it byte for byte. It is
//! never validated: its coinbase pays the height-0 reward to an unspendable
//! all-zero key.

use crate::consensus::{Block, BlockHeader, Currency};
use crate::crypto::{Hash, PublicKey};

/// Create the genesis block for `currency`
pub fn create_genesis_block(currency: &Currency) -> Block {
    let reward = currency.block_reward(0, 0);
    let coinbase = currency.construct_miner_tx(0, reward, PublicKey([0u8; 32]));

    let header = BlockHeader {
        major_version: currency.major_version_at(0),
        minor_version: 0,
        timestamp: currency.genesis_timestamp,
        prev_hash: Hash::zero(),
        nonce: currency.genesis_nonce,
        difficulty: currency.minimum_difficulty,
    };

    Block::new(header, vec![coinbase])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::CurrencyBuilder;

    #[test]
    fn test_genesis_is_deterministic() {
        let currency = Currency::mainnet();
        assert_eq!(create_genesis_block(&currency), create_genesis_block(&currency));
    }

    #[test]
    fn test_genesis_follows_parameters() {
        let currency = CurrencyBuilder::new().genesis_timestamp(42).build().unwrap();
        let genesis = create_genesis_block(&currency);

        assert_eq!(genesis.header.timestamp, 42);
        assert!(genesis.header.prev_hash.is_zero());
        assert_eq!(genesis.transactions.len(), 1);
        assert_eq!(genesis.transactions[0].coinbase_height(), Some(0));
        assert_eq!(genesis.transactions[0].output_amount(), Some(currency.block_reward(0, 0)));
        assert_ne!(genesis.hash(), Currency::mainnet().genesis_hash());
    }
}
