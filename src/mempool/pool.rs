//! Transaction pool
//!
//! Holds validated transactions waiting for a block. Key features:
//!
//! - At most one pooled transaction per key image
//! - Entries are flagged for revalidation whenever the chain moves and are
//!   rechecked lazily: on conflict, at eviction, and at template assembly
//! - Transactions from detached blocks return with a longer lifetime
//! - Recently evicted hashes are remembered so peers cannot replay them

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::FeeOrdering;
use crate::consensus::{Block, BlockDelta, Currency};
use crate::crypto::{Hash, KeyImage};
use crate::error::{CoreError, CoreResult};
use crate::validation::{
    validate_transaction, ChainView, NoConflicts, SpendContext, Transaction, TxVerdict, ValidationMode,
};

/// How a transaction entered the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOrigin {
    /// Relayed by a peer or submitted locally
    Peer,
    /// Returned from a block that left the main chain
    DetachedBlock,
}

/// A pooled transaction
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub tx: Transaction,
    pub hash: Hash,
    pub fee: u64,
    pub size: u64,
    /// Unix time the transaction entered the pool
    pub arrival: u64,
    pub origin: TxOrigin,
    pub key_images: Vec<KeyImage>,
    /// Set when the chain changed since the entry was last validated
    pub needs_revalidation: bool,
    pub fusion: bool,
}

impl PoolEntry {
    fn ordering(&self) -> FeeOrdering {
        FeeOrdering::new(self.hash, self.fee, self.size, self.arrival)
    }
}

/// Persisted form of a pool entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshotEntry {
    pub tx: Transaction,
    pub arrival: u64,
    pub origin: TxOrigin,
}

/// Pool statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub tx_count: usize,
    pub total_size: u64,
    pub total_fees: u64,
    pub flagged: usize,
}

/// Transaction pool
#[derive(Debug)]
pub struct TxPool {
    currency: Arc<Currency>,
    entries: HashMap<Hash, PoolEntry>,
    /// Key image to the pooled transaction consuming it
    images: HashMap<KeyImage, Hash>,
    /// Hashes evicted by timeout, with the time of eviction
    recently_deleted: HashMap<Hash, u64>,
}

impl TxPool {
    pub fn new(currency: Arc<Currency>) -> Self {
        Self {
            currency,
            entries: HashMap::new(),
            images: HashMap::new(),
            recently_deleted: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&PoolEntry> {
        self.entries.get(hash)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PoolEntry> {
        self.entries.values()
    }

    /// Transactions in priority order
    pub fn transactions(&self) -> Vec<&Transaction> {
        self.ordered().into_iter().map(|entry| &entry.tx).collect()
    }

    pub fn is_image_claimed(&self, image: &KeyImage) -> bool {
        self.images.contains_key(image)
    }

    pub fn was_recently_deleted(&self, hash: &Hash) -> bool {
        self.recently_deleted.contains_key(hash)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            tx_count: self.entries.len(),
            total_size: self.entries.values().map(|e| e.size).sum(),
            total_fees: self.entries.values().map(|e| e.fee).sum(),
            flagged: self.entries.values().filter(|e| e.needs_revalidation).count(),
        }
    }

    fn ordered(&self) -> Vec<&PoolEntry> {
        let order: BTreeSet<FeeOrdering> = self.entries.values().map(PoolEntry::ordering).collect();
        order.iter().filter_map(|key| self.entries.get(&key.hash)).collect()
    }

    fn still_valid(&self, entry: &PoolEntry, view: &dyn ChainView, ctx: &SpendContext) -> bool {
        validate_transaction(&self.currency, &entry.tx, view, ctx, &NoConflicts).is_ok()
    }

    fn remove(&mut self, hash: &Hash) -> Option<PoolEntry> {
        let entry = self.entries.remove(hash)?;
        for image in &entry.key_images {
            if self.images.get(image) == Some(hash) {
                self.images.remove(image);
            }
        }
        Some(entry)
    }

    /// Admit a transaction that passed [`validate_transaction`] against the
    /// current chain
    ///
    /// A conflicting incumbent is replaced only when it is flagged and no
    /// longer valid at `ctx`.
    #[instrument(skip_all, fields(tx = %verdict.hash, ?origin))]
    pub fn insert(
        &mut self,
        tx: Transaction,
        verdict: TxVerdict,
        origin: TxOrigin,
        now: u64,
        view: &dyn ChainView,
        ctx: &SpendContext,
    ) -> CoreResult<Hash> {
        let hash = verdict.hash;
        if self.entries.contains_key(&hash) {
            return Err(CoreError::AlreadyExists(format!("transaction {} is pooled", hash)));
        }
        if origin == TxOrigin::Peer && self.recently_deleted.contains_key(&hash) {
            return Err(CoreError::AlreadyExists(format!(
                "transaction {} was recently evicted",
                hash
            )));
        }

        let mut stale_incumbents = Vec::new();
        for image in &verdict.key_images {
            let Some(incumbent_hash) = self.images.get(image) else {
                continue;
            };
            let replaceable = self
                .entries
                .get(incumbent_hash)
                .map_or(true, |incumbent| {
                    incumbent.needs_revalidation && !self.still_valid(incumbent, view, ctx)
                });
            if !replaceable {
                return Err(CoreError::DoubleSpend(format!(
                    "key image {} is claimed by pooled transaction {}",
                    image, incumbent_hash
                )));
            }
            stale_incumbents.push(*incumbent_hash);
        }
        for stale in stale_incumbents {
            if self.remove(&stale).is_some() {
                debug!(replaced = %stale, "dropped invalid conflicting transaction");
            }
        }

        for image in &verdict.key_images {
            self.images.insert(*image, hash);
        }
        if origin == TxOrigin::DetachedBlock {
            self.recently_deleted.remove(&hash);
        }
        self.entries.insert(
            hash,
            PoolEntry {
                tx,
                hash,
                fee: verdict.fee,
                size: verdict.size,
                arrival: now,
                origin,
                key_images: verdict.key_images,
                needs_revalidation: false,
                fusion: verdict.fusion,
            },
        );
        debug!(fee = verdict.fee, size = verdict.size, "transaction added to pool");
        Ok(hash)
    }

    /// Drop transactions included in or conflicting with a new main-chain
    /// block and flag the rest
    ///
    /// Returns the removed hashes.
    pub fn on_block_accepted(&mut self, delta: &BlockDelta) -> Vec<Hash> {
        let mut removed: Vec<Hash> = delta
            .tx_hashes
            .iter()
            .filter(|hash| self.remove(hash).is_some())
            .copied()
            .collect();

        let conflicting: HashSet<Hash> = delta
            .key_images
            .iter()
            .filter_map(|image| self.images.get(image).copied())
            .collect();
        for hash in conflicting {
            if self.remove(&hash).is_some() {
                removed.push(hash);
            }
        }

        for entry in self.entries.values_mut() {
            entry.needs_revalidation = true;
        }
        removed
    }

    /// Return the transactions of detached blocks to the pool
    ///
    /// Each is validated against the chain as it is now; invalid ones are
    /// dropped. Returns the hashes added.
    pub fn on_block_detached(
        &mut self,
        blocks: &[Block],
        view: &dyn ChainView,
        ctx: &SpendContext,
        now: u64,
    ) -> Vec<Hash> {
        let mut added = Vec::new();
        for tx in blocks.iter().flat_map(|block| block.transactions.iter().skip(1)) {
            let verdict = match validate_transaction(&self.currency, tx, view, ctx, &NoConflicts) {
                Ok(verdict) => verdict,
                Err(err) => {
                    debug!(error = %err, "dropping transaction from detached block");
                    continue;
                }
            };
            if self.entries.contains_key(&verdict.hash) {
                continue;
            }
            match self.insert(tx.clone(), verdict, TxOrigin::DetachedBlock, now, view, ctx) {
                Ok(hash) => added.push(hash),
                Err(err) => debug!(error = %err, "detached transaction not re-added"),
            }
        }
        added
    }

    /// Mark every entry for revalidation
    pub fn flag_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.needs_revalidation = true;
        }
    }

    /// Pick transactions for a block template, highest fee rate first
    ///
    /// Read-only: entries that no longer validate are skipped here and
    /// removed by the next eviction pass.
    pub fn select_for_template(
        &self,
        max_size: u64,
        view: &dyn ChainView,
        ctx: &SpendContext,
    ) -> Vec<&PoolEntry> {
        let strict = SpendContext {
            mode: ValidationMode::Strict,
            ..*ctx
        };
        let mut selected = Vec::new();
        let mut claimed: HashSet<KeyImage> = HashSet::new();
        let mut total_size: u64 = 0;

        for entry in self.ordered() {
            if total_size + entry.size > max_size {
                continue;
            }
            if entry.key_images.iter().any(|image| claimed.contains(image)) {
                continue;
            }
            if validate_transaction(&self.currency, &entry.tx, view, &strict, &claimed).is_err() {
                continue;
            }
            claimed.extend(entry.key_images.iter().copied());
            total_size += entry.size;
            selected.push(entry);
        }
        selected
    }

    fn livetime(&self, origin: TxOrigin) -> u64 {
        match origin {
            TxOrigin::Peer => self.currency.mempool_tx_livetime,
            TxOrigin::DetachedBlock => self.currency.mempool_tx_from_alt_block_livetime,
        }
    }

    /// Remove expired entries and flagged entries that no longer validate
    ///
    /// Returns the removed hashes.
    pub fn evict_expired(&mut self, now: u64, view: &dyn ChainView, ctx: &SpendContext) -> Vec<Hash> {
        let expired: Vec<Hash> = self
            .entries
            .values()
            .filter(|entry| now.saturating_sub(entry.arrival) > self.livetime(entry.origin))
            .map(|entry| entry.hash)
            .collect();
        for hash in &expired {
            self.remove(hash);
            self.recently_deleted.insert(*hash, now);
        }

        let mut invalid = Vec::new();
        let flagged: Vec<Hash> = self
            .entries
            .values()
            .filter(|entry| entry.needs_revalidation)
            .map(|entry| entry.hash)
            .collect();
        for hash in flagged {
            let valid = match self.entries.get(&hash) {
                Some(entry) => self.still_valid(entry, view, ctx),
                None => continue,
            };
            if valid {
                if let Some(entry) = self.entries.get_mut(&hash) {
                    entry.needs_revalidation = false;
                }
            } else {
                self.remove(&hash);
                invalid.push(hash);
            }
        }

        let forget_after = self.currency.periods_to_forget_tx_deleted_from_pool * self.currency.mempool_tx_livetime;
        self.recently_deleted
            .retain(|_, deleted_at| now.saturating_sub(*deleted_at) <= forget_after);

        if !expired.is_empty() || !invalid.is_empty() {
            info!(
                expired = expired.len(),
                invalid = invalid.len(),
                remaining = self.entries.len(),
                "pool eviction"
            );
        }
        let mut removed = expired;
        removed.extend(invalid);
        removed
    }

    /// Entries in arrival order, for persistence
    pub fn snapshot(&self) -> Vec<PoolSnapshotEntry> {
        let mut entries: Vec<&PoolEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| (entry.arrival, entry.hash));
        entries
            .into_iter()
            .map(|entry| PoolSnapshotEntry {
                tx: entry.tx.clone(),
                arrival: entry.arrival,
                origin: entry.origin,
            })
            .collect()
    }
}
