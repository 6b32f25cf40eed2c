//! Lithe Core Library
//!
//! Consensus and transaction-pool engine for a CryptoNote-style
//! proof-of-work currency: block and transaction validation, LWMA-3
//! difficulty, fork choice with alternative chains, and the mempool.
//!
//! The [`node::Core`] facade is the single entry point used by the P2P
//! layer, the miner, and the RPC server.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod error;
pub mod mempool;
pub mod mining;
pub mod node;
pub mod rpc;
pub mod serialization;
pub mod storage;
pub mod validation;
pub mod wallet;

pub use error::{CoreError, CoreResult, ErrorKind};

/// Network constants. Every value can be overridden per instance through
/// [`consensus::CurrencyBuilder`], which is how testnets and tests run.
pub mod constants {
    /// Heights below this value are block heights, above are unix timestamps
    pub const MAX_BLOCK_NUMBER: u64 = 500_000_000;

    /// Smallest display unit
    pub const POINT: u64 = 1_000;
    /// One coin in atomic units (5 decimal places)
    pub const COIN: u64 = 100_000;
    pub const DISPLAY_DECIMAL_POINT: u8 = 5;

    /// Total emission cap in atomic units
    pub const MONEY_SUPPLY: u64 = 100_000_000_000_000;

    pub const START_BLOCK_REWARD: u64 = 5 * COIN;
    pub const REWARD_INCREASE: u64 = COIN / 4;
    pub const REWARD_INCREASE_INTERVAL: u64 = 21_900;
    pub const MAX_BLOCK_REWARD: u64 = 20 * COIN;

    pub const MINIMUM_FEE: u64 = 100;
    /// Minimum fee for transactions that create deposits
    pub const MINIMUM_FEE_BANKING: u64 = 1_000;
    pub const DEFAULT_DUST_THRESHOLD: u64 = 10;

    /// Target block time in seconds
    pub const DIFFICULTY_TARGET: u64 = 120;
    pub const MINIMUM_DIFFICULTY: u64 = 1;
    /// Legacy CryptoNote window (block versions 1 and 2)
    pub const DIFFICULTY_WINDOW: usize = 720;
    pub const DIFFICULTY_CUT: usize = 60;
    pub const DIFFICULTY_LAG: usize = 15;
    /// LWMA-3 window (block version 3)
    pub const DIFFICULTY_WINDOW_V3: usize = 60;

    pub const BLOCK_FUTURE_TIME_LIMIT: u64 = 60 * 60 * 2;
    pub const BLOCK_FUTURE_TIME_LIMIT_V3: u64 = 360;
    pub const TIMESTAMP_CHECK_WINDOW: usize = 30;
    pub const TIMESTAMP_CHECK_WINDOW_V3: usize = 11;

    pub const MINED_MONEY_UNLOCK_WINDOW: u64 = 15;
    pub const LOCKED_TX_ALLOWED_DELTA_BLOCKS: u64 = 1;
    pub const LOCKED_TX_ALLOWED_DELTA_SECONDS: u64 = DIFFICULTY_TARGET * LOCKED_TX_ALLOWED_DELTA_BLOCKS;

    pub const REWARD_BLOCKS_WINDOW: usize = 100;
    pub const BLOCK_GRANTED_FULL_REWARD_ZONE: u64 = 100_000;
    pub const COINBASE_BLOB_RESERVED_SIZE: u64 = 600;
    pub const MAX_BLOCK_SIZE_INITIAL: u64 = BLOCK_GRANTED_FULL_REWARD_ZONE * 10;
    pub const MAX_BLOCK_SIZE_GROWTH_SPEED_NUMERATOR: u64 = 100 * 1024;
    pub const MAX_BLOCK_SIZE_GROWTH_SPEED_DENOMINATOR: u64 = 365 * 24 * 60 * 60 / DIFFICULTY_TARGET;
    pub const MAX_TX_SIZE: u64 = BLOCK_GRANTED_FULL_REWARD_ZONE / 4 - COINBASE_BLOB_RESERVED_SIZE;

    pub const FUSION_TX_MAX_SIZE: u64 = MAX_TX_SIZE * 2;
    pub const FUSION_TX_MIN_INPUT_COUNT: usize = 12;
    pub const FUSION_TX_MIN_IN_OUT_COUNT_RATIO: usize = 4;

    pub const DEPOSIT_MIN_AMOUNT: u64 = COIN;
    pub const DEPOSIT_MIN_TERM: u32 = 21_900;
    pub const DEPOSIT_MAX_TERM: u32 = 12 * 21_900;
    /// Yearly rate in percent paid on a full-term deposit
    pub const DEPOSIT_MAX_TOTAL_RATE: u64 = 4;

    pub const UPGRADE_HEIGHT_V2: u64 = 1;
    pub const UPGRADE_HEIGHT_V3: u64 = 2;

    /// Seconds a peer-relayed transaction may sit in the pool
    pub const MEMPOOL_TX_LIVETIME: u64 = 60 * 60 * 12;
    /// Seconds a transaction returned from a detached block may sit in the pool
    pub const MEMPOOL_TX_FROM_ALT_BLOCK_LIVETIME: u64 = 60 * 60 * 24;
    pub const NUMBER_OF_PERIODS_TO_FORGET_TX_DELETED_FROM_POOL: u64 = 7;

    /// Forks deeper than this below the tip are not tracked
    pub const MAX_ALTERNATIVE_CHAIN_DEPTH: u64 = 720;

    pub const GENESIS_TIMESTAMP: u64 = 1_527_078_920;
    pub const GENESIS_NONCE: u64 = 10_000;

    /// Address prefix used by [`crate::crypto::PublicKey::to_address`]
    pub const ADDRESS_PREFIX: &str = "LX";
    pub const CURRENCY_NAME: &str = "lithe";

    pub const BLOCKS_FILENAME: &str = "blocks";
    pub const POOL_FILENAME: &str = "poolstate";
}
