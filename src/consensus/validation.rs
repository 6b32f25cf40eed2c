//! Block validation
//!
//! Pure functions: a block is checked against a [`ParentContext`] built from
//! the chain it extends and a [`ChainView`] of that chain's outputs. The
//! result is a [`BlockDelta`] the store applies; nothing is mutated here.

use std::collections::HashSet;

use crate::consensus::{Block, Currency, BLOCK_MINOR_VERSION_MAX};
use crate::crypto::{Hash, KeyImage};
use crate::error::{CoreError, CoreResult};
use crate::validation::{
    check_structure, validate_transaction, ChainView, SpendContext, ValidationMode, TX_VERSION_1,
};

/// Proof-of-work check
///
/// The hash is read as a little-endian 256-bit integer; the block is valid
/// when `hash * difficulty` does not overflow 2^256.
pub fn check_proof_of_work(hash: &Hash, difficulty: u64) -> bool {
    if difficulty == 0 {
        return false;
    }
    let mut carry: u128 = 0;
    for limb in hash.0.chunks_exact(8) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(limb);
        let product = u64::from_le_bytes(bytes) as u128 * difficulty as u128 + carry;
        carry = product >> 64;
    }
    carry == 0
}

/// Median of `values`; the mean of the two middle values for even counts
pub fn median(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        ((sorted[mid - 1] as u128 + sorted[mid] as u128) / 2) as u64
    } else {
        sorted[mid]
    }
}

/// Per-block figures a [`ParentContext`] is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSample {
    pub height: u64,
    pub timestamp: u64,
    pub cumulative_difficulty: u128,
    pub size: u64,
    pub already_generated_coins: u64,
    pub total_deposits: u64,
}

/// Everything about the parent chain a new block is checked against
#[derive(Debug, Clone)]
pub struct ParentContext {
    /// Height of the new block
    pub height: u64,
    pub prev_hash: Hash,
    pub major_version: u8,
    /// Trailing timestamps for the median check, oldest first
    pub timestamps: Vec<u64>,
    pub expected_difficulty: u64,
    /// Cumulative difficulty of the parent
    pub cumulative_difficulty: u128,
    pub already_generated_coins: u64,
    pub total_deposits: u64,
    /// Median size of the trailing reward window
    pub median_size: u64,
}

impl ParentContext {
    /// Build the context for a block at `height` on top of `samples`
    ///
    /// `samples` are the trailing blocks of the parent chain, oldest first,
    /// ending with the parent. Passing [`Currency::history_depth`] blocks is
    /// enough; fewer is fine near genesis.
    pub fn from_samples(currency: &Currency, height: u64, prev_hash: Hash, samples: &[ChainSample]) -> Self {
        let major_version = currency.major_version_at(height);

        let ts_window = currency.timestamp_check_window(major_version);
        let timestamps = samples[samples.len().saturating_sub(ts_window)..]
            .iter()
            .map(|s| s.timestamp)
            .collect();

        // genesis carries an arbitrary timestamp and stays out of retargeting
        let retarget: Vec<&ChainSample> = samples.iter().filter(|s| s.height > 0).collect();
        let count = currency.difficulty_blocks_count(major_version);
        let retarget = &retarget[retarget.len().saturating_sub(count)..];
        let window_timestamps: Vec<u64> = retarget.iter().map(|s| s.timestamp).collect();
        let window_difficulties: Vec<u128> = retarget.iter().map(|s| s.cumulative_difficulty).collect();
        let expected_difficulty =
            currency.next_difficulty(major_version, &window_timestamps, &window_difficulties);

        let sizes: Vec<u64> = samples[samples.len().saturating_sub(currency.reward_blocks_window)..]
            .iter()
            .map(|s| s.size)
            .collect();

        let parent = samples.last();
        Self {
            height,
            prev_hash,
            major_version,
            timestamps,
            expected_difficulty,
            cumulative_difficulty: parent.map_or(0, |p| p.cumulative_difficulty),
            already_generated_coins: parent.map_or(0, |p| p.already_generated_coins),
            total_deposits: parent.map_or(0, |p| p.total_deposits),
            median_size: median(&sizes),
        }
    }

    /// Size limit for the new block
    pub fn max_block_size(&self, currency: &Currency) -> u64 {
        currency.max_block_size(self.height, self.median_size)
    }

    /// Earliest timestamp the new block may carry
    pub fn minimum_timestamp(&self) -> u64 {
        median(&self.timestamps)
    }
}

/// What applying a validated block changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDelta {
    pub hash: Hash,
    pub height: u64,
    pub size: u64,
    pub difficulty: u64,
    pub cumulative_difficulty: u128,
    pub timestamp: u64,
    /// Base reward, excluding fees
    pub reward: u64,
    pub fees: u64,
    /// Deposit interest released by transactions in this block
    pub interest: u64,
    /// Coins emitted up to and including this block
    pub already_generated_coins: u64,
    pub deposits_created: u64,
    pub deposits_spent: u64,
    /// Principal locked in deposits after this block
    pub total_deposits: u64,
    pub key_images: Vec<KeyImage>,
    pub tx_hashes: Vec<Hash>,
}

impl BlockDelta {
    /// Delta of the genesis block, which is never validated
    pub fn for_genesis(block: &Block) -> Self {
        let reward = block
            .coinbase()
            .and_then(|tx| tx.output_amount())
            .unwrap_or(0);
        Self {
            hash: block.hash(),
            height: 0,
            size: block.size(),
            difficulty: block.header.difficulty,
            cumulative_difficulty: block.header.difficulty as u128,
            timestamp: block.header.timestamp,
            reward,
            fees: 0,
            interest: 0,
            already_generated_coins: reward,
            deposits_created: 0,
            deposits_spent: 0,
            total_deposits: 0,
            key_images: Vec::new(),
            tx_hashes: block.tx_hashes(),
        }
    }

    pub fn sample(&self) -> ChainSample {
        ChainSample {
            height: self.height,
            timestamp: self.timestamp,
            cumulative_difficulty: self.cumulative_difficulty,
            size: self.size,
            already_generated_coins: self.already_generated_coins,
            total_deposits: self.total_deposits,
        }
    }
}

/// Checks that need no chain state, run before any lock is taken
pub fn check_block_stateless(currency: &Currency, block: &Block) -> CoreResult<()> {
    if block.transactions.is_empty() {
        return Err(CoreError::MalformedStructure("block has no coinbase".into()));
    }
    if block.header.minor_version > BLOCK_MINOR_VERSION_MAX {
        return Err(CoreError::MalformedStructure(format!(
            "minor version {}",
            block.header.minor_version
        )));
    }
    if !check_proof_of_work(&block.pow_hash(), block.header.difficulty) {
        return Err(CoreError::InvalidProofOfWork(format!(
            "hash {} misses difficulty {}",
            block.pow_hash(),
            block.header.difficulty
        )));
    }
    for tx in block.transactions.iter().skip(1) {
        check_structure(currency, tx)?;
    }
    Ok(())
}

fn check_header(currency: &Currency, block: &Block, ctx: &ParentContext, now: u64) -> CoreResult<Hash> {
    let header = &block.header;
    if header.prev_hash != ctx.prev_hash {
        return Err(CoreError::MalformedStructure(format!(
            "previous hash {} does not match {}",
            header.prev_hash, ctx.prev_hash
        )));
    }
    if header.major_version != ctx.major_version {
        return Err(CoreError::MalformedStructure(format!(
            "major version {} at height {}, expected {}",
            header.major_version, ctx.height, ctx.major_version
        )));
    }
    if header.minor_version > BLOCK_MINOR_VERSION_MAX {
        return Err(CoreError::MalformedStructure(format!(
            "minor version {}",
            header.minor_version
        )));
    }

    let future_limit = now.saturating_add(currency.block_future_time_limit(ctx.major_version));
    if header.timestamp > future_limit {
        return Err(CoreError::TimestampOutOfRange(format!(
            "timestamp {} beyond {}",
            header.timestamp, future_limit
        )));
    }
    if ctx.timestamps.len() >= currency.timestamp_check_window(ctx.major_version) {
        let minimum = ctx.minimum_timestamp();
        if header.timestamp < minimum {
            return Err(CoreError::TimestampOutOfRange(format!(
                "timestamp {} below median {}",
                header.timestamp, minimum
            )));
        }
    }

    if header.difficulty != ctx.expected_difficulty {
        return Err(CoreError::InvalidDifficulty(format!(
            "block claims {}, expected {}",
            header.difficulty, ctx.expected_difficulty
        )));
    }
    if !check_proof_of_work(&block.pow_hash(), header.difficulty) {
        return Err(CoreError::InvalidProofOfWork(format!(
            "hash misses difficulty {}",
            header.difficulty
        )));
    }

    let hash = block.hash();
    if let Some(expected) = currency.checkpoint_at(ctx.height) {
        if *expected != hash {
            return Err(CoreError::MalformedStructure(format!(
                "block {} conflicts with checkpoint at height {}",
                hash, ctx.height
            )));
        }
    }
    Ok(hash)
}

/// Coinbase shape; returns the coinbase output sum
fn check_coinbase(currency: &Currency, block: &Block, height: u64) -> CoreResult<u64> {
    let coinbase = block
        .coinbase()
        .ok_or_else(|| CoreError::MalformedStructure("block has no coinbase".into()))?;
    if !coinbase.is_coinbase() || coinbase.version != TX_VERSION_1 {
        return Err(CoreError::MalformedStructure("first transaction is not a coinbase".into()));
    }
    if coinbase.coinbase_height() != Some(height) {
        return Err(CoreError::MalformedStructure(format!(
            "coinbase height {:?}, expected {}",
            coinbase.coinbase_height(),
            height
        )));
    }
    let unlock = height + currency.mined_money_unlock_window;
    if coinbase.unlock_time != unlock {
        return Err(CoreError::MalformedStructure(format!(
            "coinbase unlock time {}, expected {}",
            coinbase.unlock_time, unlock
        )));
    }
    if coinbase.outputs.is_empty() {
        return Err(CoreError::MalformedStructure("coinbase has no outputs".into()));
    }
    if coinbase
        .outputs
        .iter()
        .any(|o| o.amount == 0 || o.deposit_term.is_some())
    {
        return Err(CoreError::MalformedStructure(
            "coinbase outputs must be positive plain amounts".into(),
        ));
    }
    let total = coinbase
        .output_amount()
        .ok_or_else(|| CoreError::Overflow("coinbase outputs overflow".into()))?;

    if block.transactions.iter().skip(1).any(|tx| tx.is_coinbase()) {
        return Err(CoreError::MalformedStructure("more than one coinbase".into()));
    }
    Ok(total)
}

fn check_size(currency: &Currency, block: &Block, ctx: &ParentContext) -> CoreResult<u64> {
    let size = block.size();
    let limit = ctx.max_block_size(currency);
    if size > limit {
        return Err(CoreError::SizeExceeded(format!("block size {} exceeds {}", size, limit)));
    }
    Ok(size)
}

/// Checks applied to a block stored on a side chain
///
/// Transactions are only validated once the branch becomes the main chain.
pub fn validate_alternative_block(
    currency: &Currency,
    block: &Block,
    ctx: &ParentContext,
    now: u64,
) -> CoreResult<Hash> {
    let hash = check_header(currency, block, ctx, now)?;
    check_coinbase(currency, block, ctx.height)?;
    check_size(currency, block, ctx)?;
    Ok(hash)
}

/// Fully validate `block` as the next main-chain block
pub fn validate_block(
    currency: &Currency,
    block: &Block,
    ctx: &ParentContext,
    view: &dyn ChainView,
    now: u64,
) -> CoreResult<BlockDelta> {
    let hash = check_header(currency, block, ctx, now)?;
    let coinbase_total = check_coinbase(currency, block, ctx.height)?;
    let size = check_size(currency, block, ctx)?;

    let spend = SpendContext {
        height: ctx.height,
        time: block.header.timestamp,
        mode: ValidationMode::Strict,
    };
    let mut claimed: HashSet<KeyImage> = HashSet::new();
    let mut seen_txs: HashSet<Hash> = HashSet::new();
    let mut key_images = Vec::new();
    let mut fees: u64 = 0;
    let mut interest: u64 = 0;
    let mut deposits_created: u64 = 0;
    let mut deposits_spent: u64 = 0;

    let tx_hashes = block.tx_hashes();
    for (tx, tx_hash) in block.transactions.iter().zip(&tx_hashes).skip(1) {
        if view.has_transaction(tx_hash) || !seen_txs.insert(*tx_hash) {
            return Err(CoreError::MalformedStructure(format!(
                "transaction {} already included",
                tx_hash
            )));
        }
        let verdict = validate_transaction(currency, tx, view, &spend, &claimed)?;
        fees = fees
            .checked_add(verdict.fee)
            .ok_or_else(|| CoreError::Overflow("block fees overflow".into()))?;
        interest = interest.saturating_add(verdict.interest);
        deposits_created = deposits_created.saturating_add(verdict.deposits_created);
        deposits_spent = deposits_spent.saturating_add(verdict.deposits_spent);
        for image in verdict.key_images {
            claimed.insert(image);
            key_images.push(image);
        }
    }

    let reward = currency.block_reward(ctx.height, ctx.already_generated_coins);
    let expected = reward
        .checked_add(fees)
        .ok_or_else(|| CoreError::Overflow("reward plus fees overflows".into()))?;
    if coinbase_total != expected {
        return Err(CoreError::MalformedStructure(format!(
            "invalid reward: coinbase pays {}, expected {}",
            coinbase_total, expected
        )));
    }

    Ok(BlockDelta {
        hash,
        height: ctx.height,
        size,
        difficulty: block.header.difficulty,
        cumulative_difficulty: ctx.cumulative_difficulty + block.header.difficulty as u128,
        timestamp: block.header.timestamp,
        reward,
        fees,
        interest,
        already_generated_coins: ctx
            .already_generated_coins
            .saturating_add(reward)
            .saturating_add(interest),
        deposits_created,
        deposits_spent,
        total_deposits: ctx
            .total_deposits
            .saturating_add(deposits_created)
            .saturating_sub(deposits_spent),
        key_images,
        tx_hashes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{BlockHeader, CurrencyBuilder};
    use crate::crypto::{derive_key_image, hash_bytes, PrivateKey, PublicKey};
    use crate::error::ErrorKind;
    use crate::validation::OutputRecord;
    use crate::wallet::TransactionBuilder;

    struct EmptyView;

    impl ChainView for EmptyView {
        fn output(&self, _tx_hash: &Hash, _index: u32) -> Option<&OutputRecord> {
            None
        }
        fn output_at(&self, _global_index: u32) -> Option<&OutputRecord> {
            None
        }
        fn is_spent(&self, _key_image: &KeyImage) -> bool {
            false
        }
        fn has_transaction(&self, _tx_hash: &Hash) -> bool {
            false
        }
    }

    fn context_on_genesis(currency: &Currency) -> ParentContext {
        let genesis = currency.genesis_block();
        let sample = BlockDelta::for_genesis(&genesis).sample();
        ParentContext::from_samples(currency, 1, genesis.hash(), &[sample])
    }

    fn child_block(currency: &Currency, ctx: &ParentContext, coinbase_amount: u64) -> Block {
        let header = BlockHeader {
            major_version: ctx.major_version,
            minor_version: 0,
            timestamp: currency.genesis_timestamp + currency.difficulty_target,
            prev_hash: ctx.prev_hash,
            nonce: 0,
            difficulty: ctx.expected_difficulty,
        };
        let coinbase = currency.construct_miner_tx(ctx.height, coinbase_amount, PublicKey([5u8; 32]));
        Block::new(header, vec![coinbase])
    }

    #[test]
    fn test_pow_boundaries() {
        assert!(check_proof_of_work(&Hash([0xff; 32]), 1));
        assert!(!check_proof_of_work(&Hash([0xff; 32]), 2));
        assert!(check_proof_of_work(&Hash::zero(), u64::MAX));
        assert!(!check_proof_of_work(&Hash::zero(), 0));

        // most significant limb is the last one
        let mut hash = [0u8; 32];
        hash[31] = 0x7f;
        assert!(check_proof_of_work(&Hash(hash), 2));
        hash[31] = 0x80;
        assert!(!check_proof_of_work(&Hash(hash), 2));
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[]), 0);
        assert_eq!(median(&[5, 1, 3]), 3);
        assert_eq!(median(&[4, 1, 3, 2]), 2);
        assert_eq!(median(&[u64::MAX, u64::MAX]), u64::MAX);
    }

    #[test]
    fn test_context_skips_genesis_for_difficulty() {
        let currency = CurrencyBuilder::new().minimum_difficulty(7).build().unwrap();
        let ctx = context_on_genesis(&currency);
        assert_eq!(ctx.expected_difficulty, 7);
        assert_eq!(ctx.timestamps, vec![currency.genesis_timestamp]);
        assert_eq!(ctx.already_generated_coins, currency.block_reward(0, 0));
    }

    #[test]
    fn test_first_block_accepted() {
        let currency = Currency::mainnet();
        let ctx = context_on_genesis(&currency);
        let reward = currency.block_reward(1, ctx.already_generated_coins);
        let block = child_block(&currency, &ctx, reward);
        let now = block.header.timestamp;

        let delta = validate_block(&currency, &block, &ctx, &EmptyView, now).unwrap();
        assert_eq!(delta.height, 1);
        assert_eq!(delta.reward, reward);
        assert_eq!(delta.already_generated_coins, ctx.already_generated_coins + reward);
        assert_eq!(delta.cumulative_difficulty, ctx.cumulative_difficulty + 1);
    }

    #[test]
    fn test_reward_must_match_exactly() {
        let currency = Currency::mainnet();
        let ctx = context_on_genesis(&currency);
        let reward = currency.block_reward(1, ctx.already_generated_coins);

        for amount in [reward - 1, reward + 1] {
            let block = child_block(&currency, &ctx, amount);
            let err = validate_block(&currency, &block, &ctx, &EmptyView, block.header.timestamp).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedStructure);
            assert!(err.detail().contains("invalid reward"));
        }
    }

    #[test]
    fn test_header_rules() {
        let currency = Currency::mainnet();
        let ctx = context_on_genesis(&currency);
        let reward = currency.block_reward(1, ctx.already_generated_coins);
        let block = child_block(&currency, &ctx, reward);

        let mut wrong_difficulty = block.clone();
        wrong_difficulty.header.difficulty = 2;
        let err = validate_alternative_block(&currency, &wrong_difficulty, &ctx, block.header.timestamp).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDifficulty);

        let far_past_now = block.header.timestamp - currency.block_future_time_limit(ctx.major_version) - 1;
        let err = validate_alternative_block(&currency, &block, &ctx, far_past_now).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimestampOutOfRange);

        let mut wrong_version = block.clone();
        wrong_version.header.major_version = 9;
        let err = validate_alternative_block(&currency, &wrong_version, &ctx, block.header.timestamp).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedStructure);
    }

    #[test]
    fn test_coinbase_unlock_and_height_enforced() {
        let currency = Currency::mainnet();
        let ctx = context_on_genesis(&currency);
        let reward = currency.block_reward(1, ctx.already_generated_coins);

        let mut block = child_block(&currency, &ctx, reward);
        block.transactions[0].unlock_time += 1;
        assert!(validate_alternative_block(&currency, &block, &ctx, block.header.timestamp).is_err());

        let mut block = child_block(&currency, &ctx, reward);
        block.transactions[0] = currency.construct_miner_tx(2, reward, PublicKey([5u8; 32]));
        assert!(validate_alternative_block(&currency, &block, &ctx, block.header.timestamp).is_err());
    }

    /// View holding a single unspent output
    struct OneOutput(OutputRecord);

    impl ChainView for OneOutput {
        fn output(&self, tx_hash: &Hash, index: u32) -> Option<&OutputRecord> {
            (self.0.tx_hash == *tx_hash && self.0.index_in_tx == index).then_some(&self.0)
        }
        fn output_at(&self, global_index: u32) -> Option<&OutputRecord> {
            (self.0.global_index == global_index).then_some(&self.0)
        }
        fn is_spent(&self, _key_image: &KeyImage) -> bool {
            false
        }
        fn has_transaction(&self, _tx_hash: &Hash) -> bool {
            false
        }
    }

    #[test]
    fn test_same_output_twice_in_block_rejected() {
        let currency = Currency::mainnet();
        let ctx = context_on_genesis(&currency);
        let owner = PrivateKey::generate();
        let source = hash_bytes(b"funding");
        let view = OneOutput(OutputRecord {
            global_index: 0,
            tx_hash: source,
            index_in_tx: 0,
            amount: 10_000,
            key: owner.public_key(),
            deposit_term: None,
            unlock_time: 0,
            height: 0,
            key_image: derive_key_image(&source, 0),
        });
        let pay_to = |to: PublicKey| {
            TransactionBuilder::v1()
                .spend_output(source, 0, owner.clone())
                .pay(to, 9_000)
                .build()
        };
        let first = pay_to(PrivateKey::generate().public_key());
        let second = pay_to(PrivateKey::generate().public_key());
        assert_ne!(first.hash(), second.hash());

        let reward = currency.block_reward(1, ctx.already_generated_coins);
        let mut single = child_block(&currency, &ctx, reward + 1_000);
        single.transactions.push(first.clone());
        assert!(validate_block(&currency, &single, &ctx, &view, single.header.timestamp).is_ok());

        let mut doubled = child_block(&currency, &ctx, reward + 2_000);
        doubled.transactions.push(first);
        doubled.transactions.push(second);
        let err = validate_block(&currency, &doubled, &ctx, &view, doubled.header.timestamp).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DoubleSpend);
    }

    #[test]
    fn test_checkpoint_mismatch_rejected() {
        let currency = CurrencyBuilder::new()
            .checkpoint(1, Hash([9u8; 32]))
            .build()
            .unwrap();
        let ctx = context_on_genesis(&currency);
        let reward = currency.block_reward(1, ctx.already_generated_coins);
        let block = child_block(&currency, &ctx, reward);

        let err = validate_alternative_block(&currency, &block, &ctx, block.header.timestamp).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedStructure);
    }
}
