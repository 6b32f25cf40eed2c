//! Core facade
//!
//! One writer and many readers: all chain and pool state sits behind a
//! single `RwLock`. Expensive stateless checks run before any lock, and a
//! block extending the tip is fully validated under the read lock so the
//! write lock is held only to commit. Events are published after the lock
//! is released.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use super::{Clock, CoreEvent, EventSink};
use crate::consensus::{check_block_stateless, validate_block, Block, BlockDelta, Currency};
use crate::crypto::{Hash, KeyImage, PublicKey};
use crate::error::{CoreError, CoreResult};
use crate::mempool::{PoolStats, TxOrigin, TxPool};
use crate::mining::{build_template, BlockTemplate};
use crate::storage::{AddOutcome, BlockStatus, Blockchain, ChainDb, ChainState};
use crate::validation::{
    check_structure, validate_transaction, NoConflicts, SpendContext, Transaction, ValidationMode,
};

/// Result of [`Core::add_block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AddBlockResult {
    /// New main-chain tip
    Accepted { hash: Hash, height: u64 },
    /// Stored on a side branch
    AcceptedAlternative { hash: Hash, height: u64 },
    /// The block's branch became the main chain
    SwitchedChain { hash: Hash, height: u64, fork_height: u64 },
    /// Already stored, or being processed by another caller
    AlreadyExists,
}

/// Where a transaction was found
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "location", rename_all = "snake_case")]
pub enum TransactionLocation {
    InBlock { height: u64 },
    InPool,
}

/// Chain and pool summary
#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    pub height: u64,
    pub top_hash: Hash,
    pub next_difficulty: u64,
    pub cumulative_difficulty: u128,
    pub already_generated_coins: u64,
    pub total_deposits: u64,
    pub output_count: usize,
    pub spent_key_images: usize,
    pub alternative_blocks: usize,
    pub pool: PoolStats,
}

struct CoreState {
    chain: Blockchain,
    pool: TxPool,
}

/// Removes a block hash from the pending set when processing ends
struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<Hash>>,
    hash: Hash,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.hash);
    }
}

/// The consensus and transaction-pool engine
pub struct Core {
    currency: Arc<Currency>,
    inner: RwLock<CoreState>,
    db: Option<ChainDb>,
    clock: Arc<dyn Clock>,
    events: EventSink,
    pending: Mutex<HashSet<Hash>>,
    /// Set after a storage failure; every later mutation is refused
    halted: AtomicBool,
}

impl Core {
    /// In-memory core holding only the genesis block
    pub fn new(currency: Arc<Currency>, clock: Arc<dyn Clock>) -> Self {
        Self::with_state(currency.clone(), Blockchain::new(currency.clone()), TxPool::new(currency), None, clock)
    }

    fn with_state(
        currency: Arc<Currency>,
        chain: Blockchain,
        pool: TxPool,
        db: Option<ChainDb>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            currency,
            inner: RwLock::new(CoreState { chain, pool }),
            db,
            clock,
            events: EventSink::default(),
            pending: Mutex::new(HashSet::new()),
            halted: AtomicBool::new(false),
        }
    }

    /// Open the chain stored at `path`, creating it if empty
    ///
    /// Stored blocks are replayed through full validation, the derived
    /// indexes are checked and rebuilt if they disagree, and the saved pool
    /// is revalidated.
    pub fn open<P: AsRef<Path>>(currency: Arc<Currency>, path: P, clock: Arc<dyn Clock>) -> CoreResult<Self> {
        let db = ChainDb::open(path)?;
        let blocks = db.load_blocks()?;
        let mut chain = Blockchain::new(currency.clone());

        match blocks.first() {
            None => {
                let genesis = chain.state().top();
                db.append_block(&genesis.block, &genesis.delta)?;
            }
            Some(genesis) if genesis.hash() != currency.genesis_hash() => {
                return Err(CoreError::StorageCorruption(format!(
                    "stored genesis {} does not match {}",
                    genesis.hash(),
                    currency.genesis_hash()
                )));
            }
            Some(_) => {}
        }

        let stored = blocks.len();
        for (height, block) in blocks.into_iter().enumerate().skip(1) {
            // stored blocks already passed the future-time check
            match chain.add_block(block, u64::MAX) {
                Ok(AddOutcome::ExtendedMain(_)) => {}
                Ok(other) => {
                    return Err(CoreError::StorageCorruption(format!(
                        "stored block at height {} does not extend the chain: {:?}",
                        height, other
                    )));
                }
                Err(err) => {
                    return Err(CoreError::StorageCorruption(format!(
                        "stored block at height {} is invalid: {}",
                        height, err
                    )));
                }
            }
        }

        if !db.verify_index(chain.state())? {
            warn!("block index disagrees with stored blocks");
            db.rebuild_index(chain.state())?;
        }
        if !db.verify_spent(chain.state())? {
            warn!("spent key images disagree with stored blocks");
            db.rebuild_spent(chain.state())?;
        }

        let now = clock.now();
        let mut pool = TxPool::new(currency.clone());
        let ctx = pool_context(&chain, now);
        let saved = db.load_pool()?;
        let saved_count = saved.len();
        for entry in saved {
            let restored = validate_transaction(&currency, &entry.tx, chain.state(), &ctx, &NoConflicts)
                .and_then(|verdict| pool.insert(entry.tx, verdict, entry.origin, entry.arrival, chain.state(), &ctx));
            if let Err(err) = restored {
                debug!(error = %err, "dropping saved pool transaction");
            }
        }

        info!(
            height = chain.top_height(),
            blocks = stored,
            pool = pool.len(),
            dropped = saved_count - pool.len(),
            "chain opened"
        );
        Ok(Self::with_state(currency, chain, pool, Some(db), clock))
    }

    pub fn currency(&self) -> &Arc<Currency> {
        &self.currency
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn check_halted(&self) -> CoreResult<()> {
        if self.is_halted() {
            return Err(CoreError::StorageCorruption(
                "core halted after a storage failure".into(),
            ));
        }
        Ok(())
    }

    /// Run a storage write; a failure halts the core
    fn persist(&self, write: impl FnOnce(&ChainDb) -> CoreResult<()>) -> CoreResult<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        write(db).map_err(|err| {
            self.halted.store(true, Ordering::SeqCst);
            error!(error = %err, "storage write failed, halting");
            err
        })
    }

    fn begin_pending(&self, hash: Hash) -> Option<PendingGuard<'_>> {
        if !self.pending.lock().insert(hash) {
            return None;
        }
        Some(PendingGuard {
            pending: &self.pending,
            hash,
        })
    }

    /// Decode and add a block from the network or the miner
    pub fn add_block(&self, raw: &[u8]) -> CoreResult<AddBlockResult> {
        self.check_halted()?;
        let block = Block::from_bytes(raw)?;
        self.add_block_parsed(block)
    }

    #[instrument(skip_all, fields(hash))]
    pub fn add_block_parsed(&self, block: Block) -> CoreResult<AddBlockResult> {
        self.check_halted()?;
        check_block_stateless(&self.currency, &block)?;
        let hash = block.hash();
        tracing::Span::current().record("hash", tracing::field::display(&hash));

        let Some(_guard) = self.begin_pending(hash) else {
            return Ok(AddBlockResult::AlreadyExists);
        };
        let now = self.clock.now();

        let prevalidated = {
            let state = self.inner.read();
            match state.chain.block_status(&hash) {
                BlockStatus::MainChain { .. } | BlockStatus::Alternative { .. } => {
                    return Ok(AddBlockResult::AlreadyExists);
                }
                _ => {}
            }
            if *block.prev_hash() == state.chain.top_hash() {
                let ctx = state.chain.parent_context();
                Some(validate_block(&self.currency, &block, &ctx, state.chain.state(), now)?)
            } else {
                None
            }
        };

        let mut events = Vec::new();
        let result = {
            let mut guard = self.inner.write();
            let state = &mut *guard;
            let outcome = match prevalidated {
                Some(delta) if *block.prev_hash() == state.chain.top_hash() => {
                    state.chain.commit_validated(block, delta.clone())?;
                    AddOutcome::ExtendedMain(delta)
                }
                _ => state.chain.add_block(block, now)?,
            };
            self.apply_outcome(state, outcome, hash, now, &mut events)?
        };

        self.events.publish(events);
        Ok(result)
    }

    /// Propagate a chain change to the pool and storage
    fn apply_outcome(
        &self,
        state: &mut CoreState,
        outcome: AddOutcome,
        hash: Hash,
        now: u64,
        events: &mut Vec<CoreEvent>,
    ) -> CoreResult<AddBlockResult> {
        match outcome {
            AddOutcome::AlreadyKnown => Ok(AddBlockResult::AlreadyExists),
            AddOutcome::Alternative { height } => {
                events.push(CoreEvent::AlternativeBlockAdded { hash, height });
                Ok(AddBlockResult::AcceptedAlternative { hash, height })
            }
            AddOutcome::ExtendedMain(delta) => {
                let removed = state.pool.on_block_accepted(&delta);
                let top = state.chain.state().top();
                self.persist(|db| db.append_block(&top.block, &delta))?;

                info!(height = delta.height, txs = delta.tx_hashes.len(), "block added");
                events.push(CoreEvent::BlockAdded {
                    hash,
                    height: delta.height,
                });
                if !removed.is_empty() {
                    events.push(CoreEvent::TransactionsRemoved { hashes: removed });
                }
                Ok(AddBlockResult::Accepted {
                    hash,
                    height: delta.height,
                })
            }
            AddOutcome::Reorganized {
                detached,
                attached,
                fork_height,
            } => {
                self.persist(|db| {
                    for (_, delta) in detached.iter().rev() {
                        db.remove_top_block(delta)?;
                    }
                    for (block, delta) in &attached {
                        db.append_block(block, delta)?;
                    }
                    Ok(())
                })?;

                let mut removed = Vec::new();
                for (_, delta) in &attached {
                    removed.extend(state.pool.on_block_accepted(delta));
                }
                let detached_blocks: Vec<Block> = detached.into_iter().map(|(block, _)| block).collect();
                let ctx = pool_context(&state.chain, now);
                let returned = state
                    .pool
                    .on_block_detached(&detached_blocks, state.chain.state(), &ctx, now);

                let height = state.chain.top_height();
                warn!(
                    fork_height,
                    height,
                    detached = detached_blocks.len(),
                    returned = returned.len(),
                    "chain switched"
                );
                events.push(CoreEvent::ChainSwitched {
                    fork_height,
                    top_hash: hash,
                    top_height: height,
                });
                if !removed.is_empty() {
                    events.push(CoreEvent::TransactionsRemoved { hashes: removed });
                }
                events.extend(returned.into_iter().map(|hash| CoreEvent::TransactionAdded { hash }));
                Ok(AddBlockResult::SwitchedChain {
                    hash,
                    height,
                    fork_height,
                })
            }
        }
    }

    /// Decode and admit a transaction
    ///
    /// `from_pool` marks a transaction relayed from a peer's pool rather than
    /// submitted by a local wallet; both enter with the peer lifetime.
    pub fn add_transaction(&self, raw: &[u8], from_pool: bool) -> CoreResult<Hash> {
        self.check_halted()?;
        let tx = Transaction::from_bytes(raw)?;
        self.add_transaction_parsed(tx, from_pool)
    }

    #[instrument(skip_all, fields(hash, from_pool))]
    pub fn add_transaction_parsed(&self, tx: Transaction, from_pool: bool) -> CoreResult<Hash> {
        self.check_halted()?;
        check_structure(&self.currency, &tx)?;
        let hash = tx.hash();
        let span = tracing::Span::current();
        span.record("hash", tracing::field::display(&hash));
        span.record("from_pool", from_pool);
        let now = self.clock.now();

        let (verdict, validated_on) = {
            let state = self.inner.read();
            if state.pool.contains(&hash) || state.chain.state().transaction(&hash).is_some() {
                return Err(CoreError::AlreadyExists(format!("transaction {} is known", hash)));
            }
            let ctx = pool_context(&state.chain, now);
            let verdict = validate_transaction(&self.currency, &tx, state.chain.state(), &ctx, &NoConflicts)?;
            (verdict, state.chain.top_hash())
        };

        {
            let mut guard = self.inner.write();
            let state = &mut *guard;
            let ctx = pool_context(&state.chain, now);
            let verdict = if state.chain.top_hash() == validated_on {
                verdict
            } else {
                validate_transaction(&self.currency, &tx, state.chain.state(), &ctx, &NoConflicts)?
            };
            state.pool.insert(tx, verdict, TxOrigin::Peer, now, state.chain.state(), &ctx)?;
        }

        self.events.publish(vec![CoreEvent::TransactionAdded { hash }]);
        Ok(hash)
    }

    /// Remove main-chain blocks above `height`
    ///
    /// Refused below the last checkpoint. The removed blocks are discarded,
    /// their transactions go back to the pool when they still validate, and
    /// every other pooled transaction is flagged for revalidation.
    pub fn rollback_chain_to(&self, height: u64) -> CoreResult<usize> {
        self.check_halted()?;
        let now = self.clock.now();
        let mut events = Vec::new();
        let removed = {
            let mut guard = self.inner.write();
            let state = &mut *guard;
            let removed = state.chain.rollback_to(height)?;
            if removed.is_empty() {
                return Ok(0);
            }
            self.persist(|db| {
                for (_, delta) in removed.iter().rev() {
                    db.remove_top_block(delta)?;
                }
                Ok(())
            })?;
            state.pool.flag_all();

            let count = removed.len();
            let blocks: Vec<Block> = removed.into_iter().map(|(block, _)| block).collect();
            let ctx = pool_context(&state.chain, now);
            let returned = state
                .pool
                .on_block_detached(&blocks, state.chain.state(), &ctx, now);
            info!(height, removed = count, returned = returned.len(), "chain rolled back");

            events.push(CoreEvent::ChainRolledBack { height });
            events.extend(returned.into_iter().map(|hash| CoreEvent::TransactionAdded { hash }));
            count
        };

        self.events.publish(events);
        Ok(removed)
    }

    /// Drop expired and no longer valid pool entries
    pub fn evict_expired(&self) -> CoreResult<Vec<Hash>> {
        self.check_halted()?;
        let now = self.clock.now();
        let removed = {
            let mut guard = self.inner.write();
            let state = &mut *guard;
            let ctx = pool_context(&state.chain, now);
            state.pool.evict_expired(now, state.chain.state(), &ctx)
        };
        if !removed.is_empty() {
            self.events.publish(vec![CoreEvent::TransactionsRemoved {
                hashes: removed.clone(),
            }]);
        }
        Ok(removed)
    }

    /// Template on the current tip paying `address`
    pub fn build_block_template(&self, address: &str) -> CoreResult<BlockTemplate> {
        let key = PublicKey::from_address(address)
            .map_err(|e| CoreError::MalformedStructure(format!("reward address: {}", e)))?;
        self.build_block_template_for_key(key)
    }

    pub fn build_block_template_for_key(&self, key: PublicKey) -> CoreResult<BlockTemplate> {
        self.check_halted()?;
        let now = self.clock.now();
        let state = self.inner.read();
        build_template(&state.chain, &state.pool, key, now)
    }

    /// Save the pool snapshot and flush storage
    pub fn flush(&self) -> CoreResult<()> {
        let snapshot = self.inner.read().pool.snapshot();
        self.persist(|db| {
            db.save_pool(&snapshot)?;
            db.flush()
        })
    }

    pub fn top_height(&self) -> u64 {
        self.inner.read().chain.top_height()
    }

    pub fn top_hash(&self) -> Hash {
        self.inner.read().chain.top_hash()
    }

    pub fn block_hash(&self, height: u64) -> Option<Hash> {
        self.inner.read().chain.block_hash(height)
    }

    pub fn block_by_height(&self, height: u64) -> Option<Block> {
        self.inner.read().chain.block_by_height(height).cloned()
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.inner.read().chain.block_by_hash(hash).cloned()
    }

    /// Up to `count` main-chain blocks from `start`
    pub fn blocks(&self, start: u64, count: usize) -> Vec<Block> {
        self.inner
            .read()
            .chain
            .blocks_range(start, count)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn block_status(&self, hash: &Hash) -> BlockStatus {
        if self.pending.lock().contains(hash) {
            return BlockStatus::Pending;
        }
        self.inner.read().chain.block_status(hash)
    }

    /// Main-chain or pooled transaction
    pub fn transaction(&self, hash: &Hash) -> Option<(Transaction, TransactionLocation)> {
        let state = self.inner.read();
        if let Some((tx, height)) = state.chain.transaction(hash) {
            return Some((tx.clone(), TransactionLocation::InBlock { height }));
        }
        state
            .pool
            .get(hash)
            .map(|entry| (entry.tx.clone(), TransactionLocation::InPool))
    }

    /// Pooled transactions, highest fee rate first
    pub fn pool_transactions(&self) -> Vec<Transaction> {
        self.inner.read().pool.transactions().into_iter().cloned().collect()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.read().pool.len()
    }

    pub fn pool_contains(&self, hash: &Hash) -> bool {
        self.inner.read().pool.contains(hash)
    }

    pub fn is_key_image_spent(&self, image: &KeyImage) -> bool {
        self.inner.read().chain.state().spent_images().contains_key(image)
    }

    /// Every key image spent on the main chain, sorted
    pub fn spent_key_images(&self) -> Vec<KeyImage> {
        let mut images: Vec<KeyImage> = self
            .inner
            .read()
            .chain
            .state()
            .spent_images()
            .keys()
            .copied()
            .collect();
        images.sort_unstable();
        images
    }

    pub fn difficulty_at_height(&self, height: u64) -> Option<u64> {
        self.inner.read().chain.difficulty_at_height(height)
    }

    pub fn coins_emitted_at_height(&self, height: u64) -> Option<u64> {
        self.inner.read().chain.coins_emitted_at_height(height)
    }

    pub fn deposit_amount_at_height(&self, height: u64) -> Option<u64> {
        self.inner.read().chain.deposit_amount_at_height(height)
    }

    pub fn next_difficulty(&self) -> u64 {
        self.inner.read().chain.next_difficulty()
    }

    pub fn stats(&self) -> CoreStats {
        let state = self.inner.read();
        let chain: &ChainState = state.chain.state();
        let top: &BlockDelta = &chain.top().delta;
        CoreStats {
            height: top.height,
            top_hash: top.hash,
            next_difficulty: state.chain.next_difficulty(),
            cumulative_difficulty: top.cumulative_difficulty,
            already_generated_coins: top.already_generated_coins,
            total_deposits: top.total_deposits,
            output_count: chain.output_count(),
            spent_key_images: chain.spent_images().len(),
            alternative_blocks: state.chain.alternative_count(),
            pool: state.pool.stats(),
        }
    }
}

/// Spend context for pool admission: the next height at local time
fn pool_context(chain: &Blockchain, now: u64) -> SpendContext {
    SpendContext {
        height: chain.top_height() + 1,
        time: now,
        mode: ValidationMode::Pool,
    }
}
