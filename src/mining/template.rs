//! Block templates
//!
//! A template is a complete block on the current tip with nonce zero. The
//! miner only has to search nonces.

use serde::Serialize;

use crate::consensus::{Block, BlockHeader};
use crate::crypto::PublicKey;
use crate::error::{CoreError, CoreResult};
use crate::mempool::TxPool;
use crate::storage::Blockchain;
use crate::validation::{SpendContext, ValidationMode};

/// Header bytes plus the transaction count prefix
const BLOCK_OVERHEAD: u64 = 58 + 4;

/// A candidate block ready for nonce search
#[derive(Debug, Clone, Serialize)]
pub struct BlockTemplate {
    pub block: Block,
    pub height: u64,
    pub difficulty: u64,
    /// Base reward, excluding fees
    pub reward: u64,
    pub fees: u64,
    pub size_limit: u64,
}

/// Assemble a template on the current tip paying `miner`
pub fn build_template(chain: &Blockchain, pool: &TxPool, miner: PublicKey, now: u64) -> CoreResult<BlockTemplate> {
    let currency = chain.currency();
    let ctx = chain.parent_context();
    let timestamp = now.max(ctx.minimum_timestamp());
    let size_limit = ctx.max_block_size(currency);
    let budget = size_limit
        .saturating_sub(currency.coinbase_blob_reserved_size)
        .saturating_sub(BLOCK_OVERHEAD);

    let spend = SpendContext {
        height: ctx.height,
        time: timestamp,
        mode: ValidationMode::Strict,
    };
    let selected = pool.select_for_template(budget, chain.state(), &spend);

    let fees = selected
        .iter()
        .try_fold(0u64, |sum, entry| sum.checked_add(entry.fee))
        .ok_or_else(|| CoreError::Overflow("template fees overflow".into()))?;
    let reward = currency.block_reward(ctx.height, ctx.already_generated_coins);
    let payout = reward
        .checked_add(fees)
        .ok_or_else(|| CoreError::Overflow("template payout overflows".into()))?;

    let mut transactions = Vec::with_capacity(selected.len() + 1);
    transactions.push(currency.construct_miner_tx(ctx.height, payout, miner));
    transactions.extend(selected.into_iter().map(|entry| entry.tx.clone()));

    let header = BlockHeader {
        major_version: ctx.major_version,
        minor_version: 0,
        timestamp,
        prev_hash: ctx.prev_hash,
        nonce: 0,
        difficulty: ctx.expected_difficulty,
    };

    Ok(BlockTemplate {
        block: Block::new(header, transactions),
        height: ctx.height,
        difficulty: ctx.expected_difficulty,
        reward,
        fees,
        size_limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{validate_block, Currency};
    use std::sync::Arc;

    #[test]
    fn test_empty_template_is_valid_block() {
        let currency = Arc::new(Currency::mainnet());
        let chain = Blockchain::new(currency.clone());
        let pool = TxPool::new(currency.clone());
        let now = currency.genesis_timestamp + currency.difficulty_target;

        let template = build_template(&chain, &pool, PublicKey([4u8; 32]), now).unwrap();
        assert_eq!(template.height, 1);
        assert_eq!(template.fees, 0);
        assert_eq!(template.block.header.timestamp, now);

        let ctx = chain.parent_context();
        let delta = validate_block(&currency, &template.block, &ctx, chain.state(), now).unwrap();
        assert_eq!(delta.reward, template.reward);
    }

    #[test]
    fn test_timestamp_never_below_median() {
        let currency = Arc::new(Currency::mainnet());
        let chain = Blockchain::new(currency.clone());
        let pool = TxPool::new(currency.clone());

        let template = build_template(&chain, &pool, PublicKey([4u8; 32]), 0).unwrap();
        assert_eq!(template.block.header.timestamp, currency.genesis_timestamp);
    }
}
