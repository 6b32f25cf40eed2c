//! Block tree: main chain, alternative branches and fork choice
//!
//! The main chain is the branch with the greatest cumulative difficulty;
//! ties keep the incumbent. Side-chain blocks get header, coinbase and size
//! checks when stored and full validation only when their branch overtakes
//! the main chain.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::ChainState;
use crate::consensus::{
    validate_alternative_block, validate_block, Block, BlockDelta, ChainSample, Currency, ParentContext,
};
use crate::crypto::Hash;
use crate::error::{CoreError, CoreResult};
use crate::validation::Transaction;

/// Rejected block hashes remembered to short-circuit their descendants
const REJECTED_CACHE_SIZE: usize = 10_000;

/// A block stored on a side branch
#[derive(Debug, Clone)]
pub struct AltBlock {
    pub block: Block,
    pub hash: Hash,
    pub height: u64,
    /// Provisional: interest from the branch is only known after full validation
    pub sample: ChainSample,
}

/// Result of [`Blockchain::add_block`]
#[derive(Debug, Clone)]
pub enum AddOutcome {
    /// The block became the new tip
    ExtendedMain(BlockDelta),
    /// Stored on a side branch that does not outweigh the main chain
    Alternative { height: u64 },
    /// A side branch overtook the main chain
    Reorganized {
        /// Former main-chain blocks, ascending
        detached: Vec<(Block, BlockDelta)>,
        /// Blocks now on the main chain, ascending
        attached: Vec<(Block, BlockDelta)>,
        /// Height of the first replaced block
        fork_height: u64,
    },
    AlreadyKnown,
}

/// Where a block hash sits in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BlockStatus {
    MainChain { height: u64 },
    Alternative { height: u64 },
    /// Received and being validated
    Pending,
    Rejected,
    Unknown,
}

/// The block tree
#[derive(Debug)]
pub struct Blockchain {
    currency: Arc<Currency>,
    state: ChainState,
    alternatives: HashMap<Hash, AltBlock>,
    rejected: HashSet<Hash>,
    rejected_order: VecDeque<Hash>,
}

impl Blockchain {
    /// Chain holding only the genesis block
    pub fn new(currency: Arc<Currency>) -> Self {
        let state = ChainState::new(currency.genesis_block());
        Self {
            currency,
            state,
            alternatives: HashMap::new(),
            rejected: HashSet::new(),
            rejected_order: VecDeque::new(),
        }
    }

    pub fn currency(&self) -> &Arc<Currency> {
        &self.currency
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn top_height(&self) -> u64 {
        self.state.height()
    }

    pub fn top_hash(&self) -> Hash {
        self.state.top_hash()
    }

    pub fn parent_context(&self) -> ParentContext {
        self.state.parent_context(&self.currency)
    }

    /// Difficulty the next main-chain block must carry
    pub fn next_difficulty(&self) -> u64 {
        self.parent_context().expected_difficulty
    }

    pub fn alternative_count(&self) -> usize {
        self.alternatives.len()
    }

    /// Add a block received from the network or the miner
    pub fn add_block(&mut self, block: Block, now: u64) -> CoreResult<AddOutcome> {
        let hash = block.hash();
        if self.state.contains_block(&hash) || self.alternatives.contains_key(&hash) {
            return Ok(AddOutcome::AlreadyKnown);
        }
        if self.rejected.contains(&hash) {
            return Err(CoreError::MalformedStructure(format!("block {} was rejected before", hash)));
        }
        let prev = *block.prev_hash();
        if self.rejected.contains(&prev) {
            self.mark_rejected(hash);
            return Err(CoreError::MalformedStructure(format!(
                "block {} builds on rejected block {}",
                hash, prev
            )));
        }

        if prev == self.top_hash() {
            let ctx = self.parent_context();
            let delta = validate_block(&self.currency, &block, &ctx, &self.state, now)?;
            self.state.push_block(block, delta.clone());
            if !self.alternatives.is_empty() {
                self.prune_alternatives();
            }
            debug!(height = delta.height, hash = %hash, "extended main chain");
            return Ok(AddOutcome::ExtendedMain(delta));
        }

        self.add_alternative(block, hash, now)
    }

    /// Push a block validated against the current tip outside the write path
    pub fn commit_validated(&mut self, block: Block, delta: BlockDelta) -> CoreResult<()> {
        if *block.prev_hash() != self.top_hash() || delta.height != self.top_height() + 1 {
            return Err(CoreError::MalformedStructure(format!(
                "block {} no longer extends the tip",
                delta.hash
            )));
        }
        self.state.push_block(block, delta);
        if !self.alternatives.is_empty() {
            self.prune_alternatives();
        }
        Ok(())
    }

    /// Walk side branches back to the main chain
    ///
    /// Returns the main-chain height the branch forks from and the branch
    /// ending at `tip`, oldest first.
    fn branch_to(&self, tip: &Hash) -> CoreResult<(u64, Vec<Hash>)> {
        let mut branch = Vec::new();
        let mut cursor = *tip;
        loop {
            if let Some(height) = self.state.height_of(&cursor) {
                branch.reverse();
                return Ok((height, branch));
            }
            match self.alternatives.get(&cursor) {
                Some(alt) => {
                    branch.push(cursor);
                    cursor = *alt.block.prev_hash();
                }
                None => {
                    return Err(CoreError::UnknownParent(format!("block {} is unknown", cursor)));
                }
            }
        }
    }

    fn check_fork_point(&self, fork_parent: u64) -> CoreResult<()> {
        let top = self.top_height();
        if top.saturating_sub(fork_parent) > self.currency.max_alternative_chain_depth {
            return Err(CoreError::StaleParent(format!(
                "fork at height {} is deeper than {} below the tip",
                fork_parent, self.currency.max_alternative_chain_depth
            )));
        }
        if let Some((checkpoint, _)) = self.currency.last_checkpoint_at_or_below(top) {
            if fork_parent < checkpoint {
                return Err(CoreError::StaleParent(format!(
                    "fork at height {} is below checkpoint {}",
                    fork_parent, checkpoint
                )));
            }
        }
        Ok(())
    }

    /// Context for a block on top of the side branch ending at `prev`
    fn branch_context(&self, fork_parent: u64, branch: &[Hash], prev: Hash) -> ParentContext {
        let depth = self.currency.history_depth();
        let mut samples = self.state.samples_up_to(fork_parent, depth);
        samples.extend(branch.iter().filter_map(|h| self.alternatives.get(h)).map(|alt| alt.sample));
        let start = samples.len().saturating_sub(depth);
        let height = fork_parent + branch.len() as u64 + 1;
        ParentContext::from_samples(&self.currency, height, prev, &samples[start..])
    }

    fn add_alternative(&mut self, block: Block, hash: Hash, now: u64) -> CoreResult<AddOutcome> {
        let prev = *block.prev_hash();
        let (fork_parent, mut branch) = self.branch_to(&prev)?;
        self.check_fork_point(fork_parent)?;

        let ctx = self.branch_context(fork_parent, &branch, prev);
        validate_alternative_block(&self.currency, &block, &ctx, now)?;

        let reward = self.currency.block_reward(ctx.height, ctx.already_generated_coins);
        let sample = ChainSample {
            height: ctx.height,
            timestamp: block.header.timestamp,
            cumulative_difficulty: ctx.cumulative_difficulty + block.header.difficulty as u128,
            size: block.size(),
            already_generated_coins: ctx.already_generated_coins.saturating_add(reward),
            total_deposits: ctx.total_deposits,
        };
        let height = ctx.height;
        self.alternatives.insert(
            hash,
            AltBlock {
                block,
                hash,
                height,
                sample,
            },
        );
        debug!(height, hash = %hash, fork_parent, "stored alternative block");

        if sample.cumulative_difficulty <= self.state.top().delta.cumulative_difficulty {
            return Ok(AddOutcome::Alternative { height });
        }

        branch.push(hash);
        self.reorganize(fork_parent, branch, now)
    }

    /// Switch the main chain to the side branch `branch` forking after `fork_parent`
    fn reorganize(&mut self, fork_parent: u64, branch: Vec<Hash>, now: u64) -> CoreResult<AddOutcome> {
        let mut detached = Vec::new();
        while self.top_height() > fork_parent {
            match self.state.pop_block() {
                Some(popped) => detached.push(popped),
                None => break,
            }
        }
        detached.reverse();

        let mut attached: Vec<(Block, BlockDelta)> = Vec::with_capacity(branch.len());
        for (position, hash) in branch.iter().enumerate() {
            let alt = match self.alternatives.remove(hash) {
                Some(alt) => alt,
                None => {
                    let err = CoreError::UnknownParent(format!("branch block {} vanished", hash));
                    self.restore_main(attached, detached);
                    return Err(err);
                }
            };
            let ctx = self.parent_context();
            match validate_block(&self.currency, &alt.block, &ctx, &self.state, now) {
                Ok(delta) => {
                    self.state.push_block(alt.block.clone(), delta.clone());
                    attached.push((alt.block, delta));
                }
                Err(err) => {
                    warn!(hash = %hash, error = %err, "alternative branch failed validation, keeping main chain");
                    for bad in &branch[position..] {
                        self.alternatives.remove(bad);
                        self.mark_rejected(*bad);
                    }
                    self.restore_main(attached, detached);
                    return Err(err);
                }
            }
        }

        for (block, delta) in &detached {
            self.alternatives.insert(
                delta.hash,
                AltBlock {
                    block: block.clone(),
                    hash: delta.hash,
                    height: delta.height,
                    sample: delta.sample(),
                },
            );
        }
        let fork_height = fork_parent + 1;
        info!(
            fork_height,
            detached = detached.len(),
            attached = attached.len(),
            top = self.top_height(),
            "switched to alternative chain"
        );
        self.prune_alternatives();

        Ok(AddOutcome::Reorganized {
            detached,
            attached,
            fork_height,
        })
    }

    /// Undo a partial switch: valid attached blocks go back to the side
    /// branch and the saved main chain is re-applied
    fn restore_main(&mut self, attached: Vec<(Block, BlockDelta)>, detached: Vec<(Block, BlockDelta)>) {
        for _ in 0..attached.len() {
            self.state.pop_block();
        }
        for (block, delta) in attached {
            self.alternatives.insert(
                delta.hash,
                AltBlock {
                    hash: delta.hash,
                    height: delta.height,
                    sample: delta.sample(),
                    block,
                },
            );
        }
        for (block, delta) in detached {
            self.state.push_block(block, delta);
        }
    }

    /// Remember `hash` as invalid, together with any stored descendants
    pub fn mark_rejected(&mut self, hash: Hash) {
        let mut pending = vec![hash];
        while let Some(hash) = pending.pop() {
            if self.rejected.insert(hash) {
                self.rejected_order.push_back(hash);
            }
            let children: Vec<Hash> = self
                .alternatives
                .values()
                .filter(|alt| *alt.block.prev_hash() == hash)
                .map(|alt| alt.hash)
                .collect();
            for child in children {
                self.alternatives.remove(&child);
                pending.push(child);
            }
        }
        while self.rejected_order.len() > REJECTED_CACHE_SIZE {
            if let Some(old) = self.rejected_order.pop_front() {
                self.rejected.remove(&old);
            }
        }
    }

    /// Drop side blocks that can no longer win
    pub fn prune_alternatives(&mut self) {
        let top = self.top_height();
        let depth = self.currency.max_alternative_chain_depth;
        let checkpoint = self
            .currency
            .last_checkpoint_at_or_below(top)
            .map_or(0, |(height, _)| height);

        let stale: Vec<Hash> = self
            .alternatives
            .values()
            .filter(|alt| {
                alt.height.saturating_add(depth) < top
                    || alt.height <= checkpoint
                    || self.branch_to(&alt.hash).is_err()
            })
            .map(|alt| alt.hash)
            .collect();
        for hash in stale {
            self.alternatives.remove(&hash);
        }
    }

    /// Pop main-chain blocks until `height` is the tip
    ///
    /// Returns the removed blocks, ascending. They are discarded rather than
    /// kept as side blocks.
    pub fn rollback_to(&mut self, height: u64) -> CoreResult<Vec<(Block, BlockDelta)>> {
        let top = self.top_height();
        if height >= top {
            return Ok(Vec::new());
        }
        if let Some((checkpoint, _)) = self.currency.last_checkpoint_at_or_below(top) {
            if height < checkpoint {
                return Err(CoreError::RollbackRefused(format!(
                    "height {} is below checkpoint {}",
                    height, checkpoint
                )));
            }
        }

        let mut removed = Vec::with_capacity((top - height) as usize);
        while self.top_height() > height {
            match self.state.pop_block() {
                Some(popped) => removed.push(popped),
                None => break,
            }
        }
        removed.reverse();
        self.prune_alternatives();
        info!(from = top, to = height, "rolled back main chain");
        Ok(removed)
    }

    pub fn block_hash(&self, height: u64) -> Option<Hash> {
        self.state.entry(height).map(|e| e.delta.hash)
    }

    pub fn block_by_height(&self, height: u64) -> Option<&Block> {
        self.state.entry(height).map(|e| &e.block)
    }

    /// Main-chain or side-branch block
    pub fn block_by_hash(&self, hash: &Hash) -> Option<&Block> {
        match self.state.height_of(hash) {
            Some(height) => self.block_by_height(height),
            None => self.alternatives.get(hash).map(|alt| &alt.block),
        }
    }

    /// Up to `count` main-chain blocks starting at `start`
    pub fn blocks_range(&self, start: u64, count: usize) -> Vec<&Block> {
        let entries = self.state.entries();
        let start = (start as usize).min(entries.len());
        let end = start.saturating_add(count).min(entries.len());
        entries[start..end].iter().map(|e| &e.block).collect()
    }

    pub fn block_status(&self, hash: &Hash) -> BlockStatus {
        if let Some(height) = self.state.height_of(hash) {
            BlockStatus::MainChain { height }
        } else if let Some(alt) = self.alternatives.get(hash) {
            BlockStatus::Alternative { height: alt.height }
        } else if self.rejected.contains(hash) {
            BlockStatus::Rejected
        } else {
            BlockStatus::Unknown
        }
    }

    pub fn transaction(&self, tx_hash: &Hash) -> Option<(&Transaction, u64)> {
        self.state.transaction(tx_hash)
    }

    pub fn difficulty_at_height(&self, height: u64) -> Option<u64> {
        self.state.entry(height).map(|e| e.delta.difficulty)
    }

    pub fn coins_emitted_at_height(&self, height: u64) -> Option<u64> {
        self.state.entry(height).map(|e| e.delta.already_generated_coins)
    }

    pub fn deposit_amount_at_height(&self, height: u64) -> Option<u64> {
        self.state.entry(height).map(|e| e.delta.total_deposits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{check_proof_of_work, CurrencyBuilder};
    use crate::crypto::PublicKey;
    use crate::error::ErrorKind;

    fn test_currency() -> Arc<Currency> {
        Arc::new(
            CurrencyBuilder::new()
                .minimum_difficulty(1)
                .max_alternative_chain_depth(5)
                .build()
                .unwrap(),
        )
    }

    fn block_on(chain: &Blockchain, ctx: &ParentContext, miner: u8, time_offset: u64) -> Block {
        let currency = chain.currency();
        let reward = currency.block_reward(ctx.height, ctx.already_generated_coins);
        let coinbase = currency.construct_miner_tx(ctx.height, reward, PublicKey([miner; 32]));
        let header = crate::consensus::BlockHeader {
            major_version: ctx.major_version,
            minor_version: 0,
            timestamp: currency.genesis_timestamp + ctx.height * currency.difficulty_target + time_offset,
            prev_hash: ctx.prev_hash,
            nonce: 0,
            difficulty: ctx.expected_difficulty,
        };
        let block = Block::new(header, vec![coinbase]);
        assert!(check_proof_of_work(&block.pow_hash(), block.header.difficulty));
        block
    }

    fn extend(chain: &mut Blockchain, miner: u8) -> Block {
        let block = block_on(chain, &chain.parent_context(), miner, 0);
        let now = block.header.timestamp;
        assert!(matches!(chain.add_block(block.clone(), now).unwrap(), AddOutcome::ExtendedMain(_)));
        block
    }

    fn far_future(chain: &Blockchain) -> u64 {
        chain.currency().genesis_timestamp + 1_000_000
    }

    #[test]
    fn test_extend_and_query() {
        let mut chain = Blockchain::new(test_currency());
        let b1 = extend(&mut chain, 1);
        assert_eq!(chain.top_height(), 1);
        assert_eq!(chain.block_hash(1), Some(b1.hash()));
        assert_eq!(chain.block_status(&b1.hash()), BlockStatus::MainChain { height: 1 });
        assert!(matches!(chain.add_block(b1, far_future(&chain)).unwrap(), AddOutcome::AlreadyKnown));
    }

    #[test]
    fn test_unknown_parent() {
        let mut chain = Blockchain::new(test_currency());
        let mut ctx = chain.parent_context();
        ctx.prev_hash = Hash([3u8; 32]);
        let orphan = block_on(&chain, &ctx, 1, 0);
        let err = chain.add_block(orphan, far_future(&chain)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownParent);
    }

    #[test]
    fn test_heavier_branch_switches_and_ties_keep_incumbent() {
        let mut chain = Blockchain::new(test_currency());
        let a1 = extend(&mut chain, 1);
        let genesis_ctx = chain.state().context_after(chain.currency(), 0).unwrap();

        // same height: tie, incumbent stays
        let b1 = block_on(&chain, &genesis_ctx, 2, 1);
        let now = far_future(&chain);
        assert!(matches!(chain.add_block(b1.clone(), now).unwrap(), AddOutcome::Alternative { height: 1 }));
        assert_eq!(chain.top_hash(), a1.hash());

        let b1_ctx = chain.branch_context(0, &[b1.hash()], b1.hash());
        let b2 = block_on(&chain, &b1_ctx, 2, 1);
        match chain.add_block(b2.clone(), now).unwrap() {
            AddOutcome::Reorganized {
                detached,
                attached,
                fork_height,
            } => {
                assert_eq!(fork_height, 1);
                assert_eq!(detached.len(), 1);
                assert_eq!(detached[0].0, a1);
                assert_eq!(attached.len(), 2);
            }
            other => panic!("expected reorganization, got {:?}", other),
        }
        assert_eq!(chain.top_hash(), b2.hash());
        assert_eq!(chain.block_status(&a1.hash()), BlockStatus::Alternative { height: 1 });
    }

    #[test]
    fn test_invalid_branch_is_rejected_and_main_restored() {
        let mut chain = Blockchain::new(test_currency());
        let a1 = extend(&mut chain, 1);
        let genesis_ctx = chain.state().context_after(chain.currency(), 0).unwrap();
        let now = far_future(&chain);

        // header-valid but overpaying coinbase only fails full validation
        let mut b1 = block_on(&chain, &genesis_ctx, 2, 1);
        b1.transactions[0].outputs[0].amount += 1;
        chain.add_block(b1.clone(), now).unwrap();

        let b1_ctx = chain.branch_context(0, &[b1.hash()], b1.hash());
        let b2 = block_on(&chain, &b1_ctx, 2, 1);
        let err = chain.add_block(b2.clone(), now).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedStructure);

        assert_eq!(chain.top_hash(), a1.hash());
        assert_eq!(chain.block_status(&b1.hash()), BlockStatus::Rejected);
        assert_eq!(chain.block_status(&b2.hash()), BlockStatus::Rejected);
    }

    #[test]
    fn test_deep_fork_is_stale() {
        let mut chain = Blockchain::new(test_currency());
        extend(&mut chain, 1);
        let ctx = chain.state().context_after(chain.currency(), 1).unwrap();
        for _ in 0..6 {
            extend(&mut chain, 1);
        }
        let late = block_on(&chain, &ctx, 9, 1);
        let err = chain.add_block(late, far_future(&chain)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleParent);
    }

    #[test]
    fn test_rollback_respects_checkpoints() {
        let mut chain = Blockchain::new(test_currency());
        for _ in 0..4 {
            extend(&mut chain, 1);
        }
        assert!(chain.rollback_to(10).unwrap().is_empty());

        let removed = chain.rollback_to(2).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].1.height, 3);
        assert_eq!(chain.top_height(), 2);
        assert_eq!(chain.block_status(&removed[0].1.hash), BlockStatus::Unknown);
    }
}
