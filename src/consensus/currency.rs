//! Network parameters and the rules derived from them
//!
//! A [`Currency`] is immutable once built and shared behind an `Arc`.
//! Tests and testnets start from [`CurrencyBuilder::new`] and override
//! individual parameters.

use std::collections::BTreeMap;
use thiserror::Error;

use super::difficulty::{next_difficulty_legacy, next_difficulty_lwma3, LegacyParams, LwmaParams};
use super::Block;
use crate::constants::*;
use crate::crypto::{Hash, PublicKey};
use crate::validation::{Transaction, TxOutput};

pub const BLOCK_MAJOR_VERSION_1: u8 = 1;
pub const BLOCK_MAJOR_VERSION_2: u8 = 2;
pub const BLOCK_MAJOR_VERSION_3: u8 = 3;
pub const BLOCK_MINOR_VERSION_MAX: u8 = 1;

/// Invalid parameter combinations rejected by [`CurrencyBuilder::build`]
#[derive(Debug, Error)]
pub enum CurrencyError {
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Consensus parameters of one network
#[derive(Debug, Clone)]
pub struct Currency {
    pub difficulty_target: u64,
    pub difficulty_window: usize,
    pub difficulty_cut: usize,
    pub difficulty_lag: usize,
    pub difficulty_window_v3: usize,
    pub minimum_difficulty: u64,

    pub timestamp_check_window: usize,
    pub timestamp_check_window_v3: usize,
    pub block_future_time_limit: u64,
    pub block_future_time_limit_v3: u64,

    pub mined_money_unlock_window: u64,
    pub locked_tx_allowed_delta_blocks: u64,
    pub locked_tx_allowed_delta_seconds: u64,

    pub reward_blocks_window: usize,
    pub block_granted_full_reward_zone: u64,
    pub coinbase_blob_reserved_size: u64,
    pub max_block_size_initial: u64,
    pub max_block_size_growth_numerator: u64,
    pub max_block_size_growth_denominator: u64,
    pub max_tx_size: u64,

    pub fusion_tx_max_size: u64,
    pub fusion_tx_min_input_count: usize,
    pub fusion_tx_min_in_out_count_ratio: usize,

    pub minimum_fee: u64,
    pub minimum_fee_banking: u64,

    pub money_supply: u64,
    pub start_block_reward: u64,
    pub reward_increase: u64,
    pub reward_increase_interval: u64,
    pub max_block_reward: u64,

    pub deposit_min_amount: u64,
    pub deposit_min_term: u32,
    pub deposit_max_term: u32,
    pub deposit_max_total_rate: u64,

    pub upgrade_height_v2: u64,
    pub upgrade_height_v3: u64,

    pub mempool_tx_livetime: u64,
    pub mempool_tx_from_alt_block_livetime: u64,
    pub periods_to_forget_tx_deleted_from_pool: u64,

    pub max_alternative_chain_depth: u64,

    pub genesis_timestamp: u64,
    pub genesis_nonce: u64,
    /// Heights whose block hash is fixed; the chain below the highest one is final
    pub checkpoints: BTreeMap<u64, Hash>,

    genesis_hash: Hash,
}

impl Currency {
    /// Mainnet parameters
    pub fn mainnet() -> Self {
        // default parameters satisfy every builder check
        match CurrencyBuilder::new().build() {
            Ok(currency) => currency,
            Err(e) => unreachable!("default parameters rejected: {}", e),
        }
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }

    /// The genesis block, built deterministically from the parameters
    pub fn genesis_block(&self) -> Block {
        crate::node::create_genesis_block(self)
    }

    /// Block major version required at `height`
    pub fn major_version_at(&self, height: u64) -> u8 {
        if height >= self.upgrade_height_v3 {
            BLOCK_MAJOR_VERSION_3
        } else if height >= self.upgrade_height_v2 {
            BLOCK_MAJOR_VERSION_2
        } else {
            BLOCK_MAJOR_VERSION_1
        }
    }

    pub fn timestamp_check_window(&self, major_version: u8) -> usize {
        if major_version >= BLOCK_MAJOR_VERSION_3 {
            self.timestamp_check_window_v3
        } else {
            self.timestamp_check_window
        }
    }

    pub fn block_future_time_limit(&self, major_version: u8) -> u64 {
        if major_version >= BLOCK_MAJOR_VERSION_3 {
            self.block_future_time_limit_v3
        } else {
            self.block_future_time_limit
        }
    }

    /// Number of trailing blocks the difficulty of the next block depends on
    pub fn difficulty_blocks_count(&self, major_version: u8) -> usize {
        if major_version >= BLOCK_MAJOR_VERSION_3 {
            self.difficulty_window_v3 + 1
        } else {
            self.difficulty_window + self.difficulty_lag
        }
    }

    /// Trailing blocks needed to build the validation context of a new block
    pub fn history_depth(&self) -> usize {
        self.difficulty_blocks_count(BLOCK_MAJOR_VERSION_1)
            .max(self.difficulty_blocks_count(BLOCK_MAJOR_VERSION_3))
            .max(self.timestamp_check_window)
            .max(self.timestamp_check_window_v3)
            .max(self.reward_blocks_window)
    }

    /// Difficulty for a block of `major_version` given the trailing window
    pub fn next_difficulty(
        &self,
        major_version: u8,
        timestamps: &[u64],
        cumulative_difficulties: &[u128],
    ) -> u64 {
        if major_version >= BLOCK_MAJOR_VERSION_3 {
            let params = LwmaParams {
                target: self.difficulty_target,
                window: self.difficulty_window_v3,
                minimum_difficulty: self.minimum_difficulty,
            };
            next_difficulty_lwma3(&params, timestamps, cumulative_difficulties)
        } else {
            let params = LegacyParams {
                target: self.difficulty_target,
                window: self.difficulty_window,
                cut: self.difficulty_cut,
                minimum_difficulty: self.minimum_difficulty,
            };
            next_difficulty_legacy(&params, timestamps, cumulative_difficulties)
        }
    }

    /// Base reward at `height`, before fees
    ///
    /// Grows by `reward_increase` every `reward_increase_interval` blocks up to
    /// `max_block_reward`, and never emits past `money_supply`.
    pub fn block_reward(&self, height: u64, already_generated_coins: u64) -> u64 {
        let steps = height / self.reward_increase_interval.max(1);
        let scheduled = steps
            .checked_mul(self.reward_increase)
            .and_then(|inc| inc.checked_add(self.start_block_reward))
            .map_or(self.max_block_reward, |r| r.min(self.max_block_reward));
        scheduled.min(self.money_supply.saturating_sub(already_generated_coins))
    }

    /// Upper bound on the cumulative size of a block at `height`
    pub fn max_block_cumulative_size(&self, height: u64) -> u64 {
        let growth = (height as u128 * self.max_block_size_growth_numerator as u128
            / self.max_block_size_growth_denominator.max(1) as u128) as u64;
        self.max_block_size_initial.saturating_add(growth)
    }

    /// Size limit for a block at `height` given the median of recent block sizes
    pub fn max_block_size(&self, height: u64, median_size: u64) -> u64 {
        let by_median = median_size.max(self.block_granted_full_reward_zone).saturating_mul(2);
        by_median.min(self.max_block_cumulative_size(height))
    }

    /// Interest released when a deposit of `amount` locked for `term` blocks is spent
    pub fn calculate_interest(&self, amount: u64, term: u32) -> u64 {
        let numerator = amount as u128 * self.deposit_max_total_rate as u128 * term as u128;
        let denominator = 100u128 * self.deposit_max_term.max(1) as u128;
        (numerator / denominator) as u64
    }

    /// Minimum fee for `tx`; deposit-creating transactions pay the banking fee
    pub fn minimum_fee_for(&self, tx: &Transaction) -> u64 {
        if tx.creates_deposit() {
            self.minimum_fee_banking
        } else {
            self.minimum_fee
        }
    }

    /// Consolidation shape that is exempt from the minimum fee
    pub fn is_fusion_transaction(&self, tx: &Transaction, size: u64) -> bool {
        !tx.is_coinbase()
            && size <= self.fusion_tx_max_size
            && tx.inputs.len() >= self.fusion_tx_min_input_count
            && tx.inputs.len() >= tx.outputs.len() * self.fusion_tx_min_in_out_count_ratio
            && !tx.creates_deposit()
    }

    /// Whether an output with `unlock_time` may be spent in a block at `height`
    /// produced at unix time `time`
    pub fn is_unlocked(&self, unlock_time: u64, height: u64, time: u64) -> bool {
        if unlock_time < MAX_BLOCK_NUMBER {
            height.saturating_add(self.locked_tx_allowed_delta_blocks).saturating_sub(1) >= unlock_time
        } else {
            time.saturating_add(self.locked_tx_allowed_delta_seconds) >= unlock_time
        }
    }

    /// Whether a deposit created at `created_height` has matured by `height`
    pub fn is_deposit_matured(&self, created_height: u64, term: u32, height: u64) -> bool {
        created_height.saturating_add(term as u64) <= height
    }

    pub fn is_deposit_term_valid(&self, term: u32) -> bool {
        (self.deposit_min_term..=self.deposit_max_term).contains(&term)
    }

    /// Reward transaction paying `amount` to `miner` at `height`
    pub fn construct_miner_tx(&self, height: u64, amount: u64, miner: PublicKey) -> Transaction {
        Transaction::coinbase(
            height,
            height + self.mined_money_unlock_window,
            vec![TxOutput::new(amount, miner)],
        )
    }

    /// Highest checkpoint at or below `height`
    pub fn last_checkpoint_at_or_below(&self, height: u64) -> Option<(u64, Hash)> {
        self.checkpoints
            .range(..=height)
            .next_back()
            .map(|(h, hash)| (*h, *hash))
    }

    pub fn checkpoint_at(&self, height: u64) -> Option<&Hash> {
        self.checkpoints.get(&height)
    }
}

/// Builder for [`Currency`], seeded with the mainnet constants
#[derive(Debug, Clone)]
pub struct CurrencyBuilder {
    currency: Currency,
}

impl Default for CurrencyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrencyBuilder {
    pub fn new() -> Self {
        Self {
            currency: Currency {
                difficulty_target: DIFFICULTY_TARGET,
                difficulty_window: DIFFICULTY_WINDOW,
                difficulty_cut: DIFFICULTY_CUT,
                difficulty_lag: DIFFICULTY_LAG,
                difficulty_window_v3: DIFFICULTY_WINDOW_V3,
                minimum_difficulty: MINIMUM_DIFFICULTY,
                timestamp_check_window: TIMESTAMP_CHECK_WINDOW,
                timestamp_check_window_v3: TIMESTAMP_CHECK_WINDOW_V3,
                block_future_time_limit: BLOCK_FUTURE_TIME_LIMIT,
                block_future_time_limit_v3: BLOCK_FUTURE_TIME_LIMIT_V3,
                mined_money_unlock_window: MINED_MONEY_UNLOCK_WINDOW,
                locked_tx_allowed_delta_blocks: LOCKED_TX_ALLOWED_DELTA_BLOCKS,
                locked_tx_allowed_delta_seconds: LOCKED_TX_ALLOWED_DELTA_SECONDS,
                reward_blocks_window: REWARD_BLOCKS_WINDOW,
                block_granted_full_reward_zone: BLOCK_GRANTED_FULL_REWARD_ZONE,
                coinbase_blob_reserved_size: COINBASE_BLOB_RESERVED_SIZE,
                max_block_size_initial: MAX_BLOCK_SIZE_INITIAL,
                max_block_size_growth_numerator: MAX_BLOCK_SIZE_GROWTH_SPEED_NUMERATOR,
                max_block_size_growth_denominator: MAX_BLOCK_SIZE_GROWTH_SPEED_DENOMINATOR,
                max_tx_size: MAX_TX_SIZE,
                fusion_tx_max_size: FUSION_TX_MAX_SIZE,
                fusion_tx_min_input_count: FUSION_TX_MIN_INPUT_COUNT,
                fusion_tx_min_in_out_count_ratio: FUSION_TX_MIN_IN_OUT_COUNT_RATIO,
                minimum_fee: MINIMUM_FEE,
                minimum_fee_banking: MINIMUM_FEE_BANKING,
                money_supply: MONEY_SUPPLY,
                start_block_reward: START_BLOCK_REWARD,
                reward_increase: REWARD_INCREASE,
                reward_increase_interval: REWARD_INCREASE_INTERVAL,
                max_block_reward: MAX_BLOCK_REWARD,
                deposit_min_amount: DEPOSIT_MIN_AMOUNT,
                deposit_min_term: DEPOSIT_MIN_TERM,
                deposit_max_term: DEPOSIT_MAX_TERM,
                deposit_max_total_rate: DEPOSIT_MAX_TOTAL_RATE,
                upgrade_height_v2: UPGRADE_HEIGHT_V2,
                upgrade_height_v3: UPGRADE_HEIGHT_V3,
                mempool_tx_livetime: MEMPOOL_TX_LIVETIME,
                mempool_tx_from_alt_block_livetime: MEMPOOL_TX_FROM_ALT_BLOCK_LIVETIME,
                periods_to_forget_tx_deleted_from_pool: NUMBER_OF_PERIODS_TO_FORGET_TX_DELETED_FROM_POOL,
                max_alternative_chain_depth: MAX_ALTERNATIVE_CHAIN_DEPTH,
                genesis_timestamp: GENESIS_TIMESTAMP,
                genesis_nonce: GENESIS_NONCE,
                checkpoints: BTreeMap::new(),
                genesis_hash: Hash::zero(),
            },
        }
    }

    /// Testnet: same rules, distinct genesis
    pub fn testnet() -> Self {
        Self::new().genesis_nonce(GENESIS_NONCE + 1)
    }

    pub fn difficulty_target(mut self, seconds: u64) -> Self {
        self.currency.difficulty_target = seconds;
        self.currency.locked_tx_allowed_delta_seconds = seconds * self.currency.locked_tx_allowed_delta_blocks;
        self
    }

    pub fn difficulty_window_v3(mut self, window: usize) -> Self {
        self.currency.difficulty_window_v3 = window;
        self
    }

    pub fn minimum_difficulty(mut self, difficulty: u64) -> Self {
        self.currency.minimum_difficulty = difficulty;
        self
    }

    pub fn mined_money_unlock_window(mut self, blocks: u64) -> Self {
        self.currency.mined_money_unlock_window = blocks;
        self
    }

    pub fn minimum_fee(mut self, fee: u64) -> Self {
        self.currency.minimum_fee = fee;
        self
    }

    pub fn upgrade_heights(mut self, v2: u64, v3: u64) -> Self {
        self.currency.upgrade_height_v2 = v2;
        self.currency.upgrade_height_v3 = v3;
        self
    }

    pub fn deposit_terms(mut self, min_term: u32, max_term: u32) -> Self {
        self.currency.deposit_min_term = min_term;
        self.currency.deposit_max_term = max_term;
        self
    }

    pub fn mempool_livetimes(mut self, peer: u64, from_alt_block: u64) -> Self {
        self.currency.mempool_tx_livetime = peer;
        self.currency.mempool_tx_from_alt_block_livetime = from_alt_block;
        self
    }

    pub fn max_alternative_chain_depth(mut self, depth: u64) -> Self {
        self.currency.max_alternative_chain_depth = depth;
        self
    }

    pub fn checkpoint(mut self, height: u64, hash: Hash) -> Self {
        self.currency.checkpoints.insert(height, hash);
        self
    }

    pub fn genesis_timestamp(mut self, timestamp: u64) -> Self {
        self.currency.genesis_timestamp = timestamp;
        self
    }

    pub fn genesis_nonce(mut self, nonce: u64) -> Self {
        self.currency.genesis_nonce = nonce;
        self
    }

    /// Validate the parameters and derive the genesis block
    pub fn build(self) -> Result<Currency, CurrencyError> {
        let mut currency = self.currency;

        let invalid = |name: &'static str, reason: &str| CurrencyError::InvalidParameter {
            name,
            reason: reason.to_string(),
        };
        if currency.difficulty_target == 0 {
            return Err(invalid("difficulty_target", "must be positive"));
        }
        if currency.minimum_difficulty == 0 {
            return Err(invalid("minimum_difficulty", "must be positive"));
        }
        if 2 * currency.difficulty_cut + 2 > currency.difficulty_window {
            return Err(invalid("difficulty_cut", "cut leaves fewer than two samples"));
        }
        if currency.deposit_min_term == 0 || currency.deposit_min_term > currency.deposit_max_term {
            return Err(invalid("deposit_min_term", "must be in 1..=deposit_max_term"));
        }
        if currency.upgrade_height_v2 > currency.upgrade_height_v3 {
            return Err(invalid("upgrade_height_v2", "must not exceed upgrade_height_v3"));
        }
        if currency.max_alternative_chain_depth == 0 {
            return Err(invalid("max_alternative_chain_depth", "must be positive"));
        }

        let genesis = crate::node::create_genesis_block(&currency);
        currency.genesis_hash = genesis.hash();
        match currency.checkpoints.get(&0) {
            Some(hash) if *hash != currency.genesis_hash => {
                return Err(invalid("checkpoints", "height 0 does not match the genesis block"));
            }
            Some(_) => {}
            None => {
                currency.checkpoints.insert(0, currency.genesis_hash);
            }
        }

        Ok(currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reward_schedule_steps_and_caps() {
        let currency = Currency::mainnet();
        assert_eq!(currency.block_reward(0, 0), 5 * COIN);
        assert_eq!(currency.block_reward(REWARD_INCREASE_INTERVAL - 1, 0), 5 * COIN);
        assert_eq!(currency.block_reward(REWARD_INCREASE_INTERVAL, 0), 5 * COIN + COIN / 4);
        assert_eq!(currency.block_reward(u64::MAX, 0), MAX_BLOCK_REWARD);
    }

    #[test]
    fn test_reward_never_exceeds_remaining_supply() {
        let currency = Currency::mainnet();
        assert_eq!(currency.block_reward(10, MONEY_SUPPLY - 7), 7);
        assert_eq!(currency.block_reward(10, MONEY_SUPPLY), 0);
    }

    #[test]
    fn test_versions_follow_upgrade_heights() {
        let currency = CurrencyBuilder::new().upgrade_heights(10, 20).build().unwrap();
        assert_eq!(currency.major_version_at(0), BLOCK_MAJOR_VERSION_1);
        assert_eq!(currency.major_version_at(10), BLOCK_MAJOR_VERSION_2);
        assert_eq!(currency.major_version_at(25), BLOCK_MAJOR_VERSION_3);
        assert_eq!(currency.timestamp_check_window(BLOCK_MAJOR_VERSION_3), 11);
        assert_eq!(currency.difficulty_blocks_count(BLOCK_MAJOR_VERSION_2), 735);
    }

    #[test]
    fn test_height_and_time_locks() {
        let currency = Currency::mainnet();
        assert!(!currency.is_unlocked(10, 9, 0));
        assert!(currency.is_unlocked(10, 10, 0));

        let unlock_at = MAX_BLOCK_NUMBER + 1_000;
        assert!(!currency.is_unlocked(unlock_at, 1, unlock_at - LOCKED_TX_ALLOWED_DELTA_SECONDS - 1));
        assert!(currency.is_unlocked(unlock_at, 1, unlock_at - LOCKED_TX_ALLOWED_DELTA_SECONDS));
    }

    #[test]
    fn test_block_size_limit() {
        let currency = Currency::mainnet();
        assert_eq!(currency.max_block_size(0, 0), 2 * BLOCK_GRANTED_FULL_REWARD_ZONE);
        assert_eq!(currency.max_block_size(0, 10_000_000), MAX_BLOCK_SIZE_INITIAL);
    }

    #[test]
    fn test_full_term_deposit_earns_max_rate() {
        let currency = Currency::mainnet();
        assert_eq!(currency.calculate_interest(100 * COIN, DEPOSIT_MAX_TERM), 4 * COIN);
        assert_eq!(currency.calculate_interest(100 * COIN, DEPOSIT_MAX_TERM / 12), 4 * COIN / 12);
    }

    #[test]
    fn test_genesis_checkpoint_is_installed() {
        let currency = Currency::mainnet();
        assert_eq!(currency.checkpoint_at(0), Some(&currency.genesis_hash()));
        assert_eq!(currency.genesis_block().hash(), currency.genesis_hash());

        let testnet = CurrencyBuilder::testnet().build().unwrap();
        assert_ne!(testnet.genesis_hash(), currency.genesis_hash());
    }

    #[test]
    fn test_bad_parameters_rejected() {
        assert!(CurrencyBuilder::new().deposit_terms(10, 5).build().is_err());
        assert!(CurrencyBuilder::new().checkpoint(0, Hash([1u8; 32])).build().is_err());
    }
}
