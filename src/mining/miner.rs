//! Block miner implementation
//!
//! Searches nonces on a template until the proof-of-work check passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::consensus::{check_proof_of_work, Block};
use crate::crypto::{double_hash, PublicKey};

/// Offset of the nonce in the hashing blob: versions, timestamp, previous hash
const NONCE_OFFSET: usize = 1 + 1 + 8 + 32;

/// Mining result
#[derive(Debug)]
pub enum MiningResult {
    /// Successfully mined a block
    Success(Block),
    /// Mining was interrupted
    Interrupted,
}

/// Block miner
#[derive(Clone)]
pub struct Miner {
    /// Key paid by the coinbase of mined blocks
    reward_key: PublicKey,
    /// Stop signal
    stop_signal: Arc<AtomicBool>,
}

impl Miner {
    /// Create a new miner
    pub fn new(reward_key: PublicKey) -> Self {
        Self {
            reward_key,
            stop_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn reward_key(&self) -> PublicKey {
        self.reward_key
    }

    /// Get a stop signal handle
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    /// Stop mining
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Reset stop signal
    pub fn reset(&self) {
        self.stop_signal.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    /// Mine a block (find valid nonce)
    ///
    /// Starts from the template's nonce. Only the nonce bytes of the hashing
    /// blob change between attempts.
    pub fn mine_block(&self, block: Block) -> MiningResult {
        self.mine_with_progress(block, u64::MAX, |_| {})
    }

    /// Mine with progress callback
    pub fn mine_with_progress<F>(&self, mut block: Block, progress_interval: u64, mut callback: F) -> MiningResult
    where
        F: FnMut(u64), // nonce count
    {
        let mut blob = block.hashing_blob();
        let difficulty = block.header.difficulty;
        let mut nonce = block.header.nonce;
        let mut iterations = 0u64;

        loop {
            if self.stop_signal.load(Ordering::SeqCst) {
                return MiningResult::Interrupted;
            }

            blob[NONCE_OFFSET..NONCE_OFFSET + 8].copy_from_slice(&nonce.to_le_bytes());
            if check_proof_of_work(&double_hash(&blob), difficulty) {
                block.header.nonce = nonce;
                return MiningResult::Success(block);
            }

            nonce = nonce.wrapping_add(1);
            iterations += 1;
            if iterations % progress_interval.max(1) == 0 {
                callback(iterations);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{BlockHeader, Currency};
    use crate::crypto::hash_bytes;

    fn template(difficulty: u64) -> Block {
        let currency = Currency::mainnet();
        let header = BlockHeader {
            major_version: 3,
            minor_version: 0,
            timestamp: 1_700_000_000,
            prev_hash: hash_bytes(b"tip"),
            nonce: 0,
            difficulty,
        };
        Block::new(header, vec![currency.construct_miner_tx(9, 100, PublicKey([1; 32]))])
    }

    #[test]
    fn test_nonce_offset_matches_header_layout() {
        let mut block = template(1);
        block.header.nonce = 0x0102_0304_0506_0708;
        let blob = block.hashing_blob();
        assert_eq!(&blob[NONCE_OFFSET..NONCE_OFFSET + 8], &block.header.nonce.to_le_bytes());
    }

    #[test]
    fn test_mined_block_satisfies_difficulty() {
        let miner = Miner::new(PublicKey([1; 32]));
        match miner.mine_block(template(64)) {
            MiningResult::Success(block) => {
                assert!(check_proof_of_work(&block.pow_hash(), 64));
            }
            MiningResult::Interrupted => panic!("miner was not stopped"),
        }
    }

    #[test]
    fn test_miner_stop_signal() {
        let miner = Miner::new(PublicKey([1; 32]));
        let signal = miner.stop_signal();

        assert!(!signal.load(Ordering::SeqCst));

        miner.stop();
        assert!(signal.load(Ordering::SeqCst));
        assert!(matches!(miner.mine_block(template(u64::MAX)), MiningResult::Interrupted));

        miner.reset();
        assert!(!signal.load(Ordering::SeqCst));
    }
}
