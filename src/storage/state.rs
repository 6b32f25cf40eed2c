//! Main chain state
//!
//! Blocks in height order with the indexes validation needs: block hash to
//! height, every output by global index and by outpoint, spent key images,
//! and transaction locations. Only ever mutated at the tip.

use std::collections::HashMap;

use crate::consensus::{Block, BlockDelta, ChainSample, Currency, ParentContext};
use crate::crypto::{derive_key_image, Hash, KeyImage};
use crate::validation::{ChainView, OutputRecord, Transaction};

/// A main-chain block with its applied delta
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub block: Block,
    pub delta: BlockDelta,
    /// Global index of the first output created by this block
    pub first_output: u32,
}

#[derive(Debug, Clone, Copy)]
struct TxLocation {
    height: u64,
    index: usize,
}

/// Complete chain state
#[derive(Debug)]
pub struct ChainState {
    entries: Vec<BlockEntry>,
    by_hash: HashMap<Hash, u64>,
    outputs: Vec<OutputRecord>,
    outpoints: HashMap<(Hash, u32), u32>,
    spent: HashMap<KeyImage, u64>,
    transactions: HashMap<Hash, TxLocation>,
}

impl ChainState {
    /// Create a new chain state from genesis
    pub fn new(genesis: Block) -> Self {
        let delta = BlockDelta::for_genesis(&genesis);
        let mut state = Self {
            entries: Vec::new(),
            by_hash: HashMap::new(),
            outputs: Vec::new(),
            outpoints: HashMap::new(),
            spent: HashMap::new(),
            transactions: HashMap::new(),
        };
        state.push_block(genesis, delta);
        state
    }

    /// Append a validated block at the tip
    pub fn push_block(&mut self, block: Block, delta: BlockDelta) {
        let height = self.entries.len() as u64;
        debug_assert_eq!(delta.height, height);
        let first_output = self.outputs.len() as u32;

        for (index, (tx, tx_hash)) in block.transactions.iter().zip(&delta.tx_hashes).enumerate() {
            for (i, output) in tx.outputs.iter().enumerate() {
                let global_index = self.outputs.len() as u32;
                let index_in_tx = i as u32;
                self.outputs.push(OutputRecord {
                    global_index,
                    tx_hash: *tx_hash,
                    index_in_tx,
                    amount: output.amount,
                    key: output.key,
                    deposit_term: output.deposit_term,
                    unlock_time: tx.unlock_time,
                    height,
                    key_image: derive_key_image(tx_hash, index_in_tx),
                });
                self.outpoints.insert((*tx_hash, index_in_tx), global_index);
            }
            self.transactions.insert(*tx_hash, TxLocation { height, index });
        }
        for image in &delta.key_images {
            self.spent.insert(*image, height);
        }

        self.by_hash.insert(delta.hash, height);
        self.entries.push(BlockEntry {
            block,
            delta,
            first_output,
        });
    }

    /// Remove the tip block. Genesis is never removed.
    pub fn pop_block(&mut self) -> Option<(Block, BlockDelta)> {
        if self.entries.len() <= 1 {
            return None;
        }
        let entry = self.entries.pop()?;

        for record in self.outputs.drain(entry.first_output as usize..) {
            self.outpoints.remove(&(record.tx_hash, record.index_in_tx));
        }
        for image in &entry.delta.key_images {
            self.spent.remove(image);
        }
        for tx_hash in &entry.delta.tx_hashes {
            self.transactions.remove(tx_hash);
        }
        self.by_hash.remove(&entry.delta.hash);

        Some((entry.block, entry.delta))
    }

    /// Height of the tip
    pub fn height(&self) -> u64 {
        self.entries.len() as u64 - 1
    }

    pub fn top(&self) -> &BlockEntry {
        // genesis is pushed in `new` and never popped
        &self.entries[self.entries.len() - 1]
    }

    pub fn top_hash(&self) -> Hash {
        self.top().delta.hash
    }

    pub fn entry(&self, height: u64) -> Option<&BlockEntry> {
        self.entries.get(usize::try_from(height).ok()?)
    }

    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    pub fn height_of(&self, hash: &Hash) -> Option<u64> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains_block(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Transaction and the height of the block containing it
    pub fn transaction(&self, tx_hash: &Hash) -> Option<(&Transaction, u64)> {
        let location = self.transactions.get(tx_hash)?;
        let entry = self.entry(location.height)?;
        entry
            .block
            .transactions
            .get(location.index)
            .map(|tx| (tx, location.height))
    }

    /// Spent key images with the height that spent them
    pub fn spent_images(&self) -> &HashMap<KeyImage, u64> {
        &self.spent
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Samples of the last `count` blocks ending at `height`, oldest first
    pub fn samples_up_to(&self, height: u64, count: usize) -> Vec<ChainSample> {
        let end = (height as usize + 1).min(self.entries.len());
        let start = end.saturating_sub(count);
        self.entries[start..end].iter().map(|e| e.delta.sample()).collect()
    }

    /// Context for the block after `height`
    pub fn context_after(&self, currency: &Currency, height: u64) -> Option<ParentContext> {
        let parent = self.entry(height)?;
        let samples = self.samples_up_to(height, currency.history_depth());
        Some(ParentContext::from_samples(
            currency,
            height + 1,
            parent.delta.hash,
            &samples,
        ))
    }

    /// Context for the next block on the tip
    pub fn parent_context(&self, currency: &Currency) -> ParentContext {
        let samples = self.samples_up_to(self.height(), currency.history_depth());
        ParentContext::from_samples(currency, self.height() + 1, self.top_hash(), &samples)
    }
}

impl ChainView for ChainState {
    fn output(&self, tx_hash: &Hash, index: u32) -> Option<&OutputRecord> {
        let global = self.outpoints.get(&(*tx_hash, index))?;
        self.outputs.get(*global as usize)
    }

    fn output_at(&self, global_index: u32) -> Option<&OutputRecord> {
        self.outputs.get(global_index as usize)
    }

    fn is_spent(&self, key_image: &KeyImage) -> bool {
        self.spent.contains_key(key_image)
    }

    fn has_transaction(&self, tx_hash: &Hash) -> bool {
        self.transactions.contains_key(tx_hash)
    }
}
