//! Database persistence layer using Sled
//!
//! Only the main chain is stored: blocks keyed by big-endian height, plus a
//! hash index and the spent key images. Both indexes are derived data and
//! are checked against the blocks on open. Side branches are not persisted.

use std::path::Path;

use sled::{Db, Tree};
use tracing::warn;

use crate::consensus::{Block, BlockDelta};
use crate::crypto::Hash;
use crate::error::{CoreError, CoreResult};
use crate::mempool::PoolSnapshotEntry;
use crate::storage::ChainState;

const POOL_KEY: &[u8] = b"snapshot";
const SCHEMA_KEY: &[u8] = b"schema";
const SCHEMA_VERSION: u32 = 1;

fn storage_error(context: &str, err: impl std::fmt::Display) -> CoreError {
    CoreError::StorageCorruption(format!("{}: {}", context, err))
}

fn height_from_key(key: &[u8]) -> CoreResult<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| CoreError::StorageCorruption(format!("bad height key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Database wrapper
#[derive(Debug, Clone)]
pub struct ChainDb {
    db: Db,
    blocks: Tree,
    block_index: Tree,
    spent: Tree,
    meta: Tree,
    pool: Tree,
}

impl ChainDb {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let db = sled::open(path).map_err(|e| storage_error("open database", e))?;
        let open = |name: &str| db.open_tree(name).map_err(|e| storage_error(name, e));
        let chain_db = Self {
            blocks: open(crate::constants::BLOCKS_FILENAME)?,
            block_index: open("block_index")?,
            spent: open("spent")?,
            meta: open("meta")?,
            pool: open(crate::constants::POOL_FILENAME)?,
            db,
        };

        match chain_db.meta.get(SCHEMA_KEY).map_err(|e| storage_error("meta", e))? {
            Some(bytes) if bytes.as_ref() != SCHEMA_VERSION.to_le_bytes() => {
                return Err(CoreError::StorageCorruption("unsupported schema version".into()));
            }
            Some(_) => {}
            None => {
                chain_db
                    .meta
                    .insert(SCHEMA_KEY, &SCHEMA_VERSION.to_le_bytes())
                    .map_err(|e| storage_error("meta", e))?;
            }
        }
        Ok(chain_db)
    }

    /// Number of stored blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Persist a new main-chain tip
    pub fn append_block(&self, block: &Block, delta: &BlockDelta) -> CoreResult<()> {
        let key = delta.height.to_be_bytes();
        let value = bincode::serialize(block).map_err(|e| storage_error("encode block", e))?;
        self.blocks.insert(key, value).map_err(|e| storage_error("blocks", e))?;
        self.block_index
            .insert(delta.hash.0, &key)
            .map_err(|e| storage_error("block_index", e))?;
        for image in &delta.key_images {
            self.spent.insert(image.0, &key).map_err(|e| storage_error("spent", e))?;
        }
        Ok(())
    }

    /// Remove the stored tip
    pub fn remove_top_block(&self, delta: &BlockDelta) -> CoreResult<()> {
        self.blocks
            .remove(delta.height.to_be_bytes())
            .map_err(|e| storage_error("blocks", e))?;
        self.block_index
            .remove(delta.hash.0)
            .map_err(|e| storage_error("block_index", e))?;
        for image in &delta.key_images {
            self.spent.remove(image.0).map_err(|e| storage_error("spent", e))?;
        }
        Ok(())
    }

    /// All stored blocks in height order; heights must be contiguous from 0
    pub fn load_blocks(&self) -> CoreResult<Vec<Block>> {
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for (expected, item) in self.blocks.iter().enumerate() {
            let (key, value) = item.map_err(|e| storage_error("blocks", e))?;
            let height = height_from_key(&key)?;
            if height != expected as u64 {
                return Err(CoreError::StorageCorruption(format!(
                    "block store has a gap: found height {} where {} was expected",
                    height, expected
                )));
            }
            let block: Block = bincode::deserialize(&value)
                .map_err(|e| storage_error(&format!("decode block {}", height), e))?;
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Whether the hash index matches the replayed chain exactly
    pub fn verify_index(&self, state: &ChainState) -> CoreResult<bool> {
        if self.block_index.len() != state.entries().len() {
            return Ok(false);
        }
        for (height, entry) in state.entries().iter().enumerate() {
            let stored = self
                .block_index
                .get(entry.delta.hash.0)
                .map_err(|e| storage_error("block_index", e))?;
            match stored {
                Some(bytes) if height_from_key(&bytes)? == height as u64 => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    pub fn rebuild_index(&self, state: &ChainState) -> CoreResult<()> {
        warn!("rebuilding block index");
        self.block_index.clear().map_err(|e| storage_error("block_index", e))?;
        for (height, entry) in state.entries().iter().enumerate() {
            self.block_index
                .insert(entry.delta.hash.0, &(height as u64).to_be_bytes())
                .map_err(|e| storage_error("block_index", e))?;
        }
        Ok(())
    }

    /// Whether the spent-image tree matches the replayed chain exactly
    pub fn verify_spent(&self, state: &ChainState) -> CoreResult<bool> {
        let spent = state.spent_images();
        if self.spent.len() != spent.len() {
            return Ok(false);
        }
        for item in self.spent.iter() {
            let (key, value) = item.map_err(|e| storage_error("spent", e))?;
            let image: [u8; 32] = match key.as_ref().try_into() {
                Ok(bytes) => bytes,
                Err(_) => return Ok(false),
            };
            if spent.get(&Hash(image)) != Some(&height_from_key(&value)?) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn rebuild_spent(&self, state: &ChainState) -> CoreResult<()> {
        warn!("rebuilding spent key image index");
        self.spent.clear().map_err(|e| storage_error("spent", e))?;
        for (image, height) in state.spent_images() {
            self.spent
                .insert(image.0, &height.to_be_bytes())
                .map_err(|e| storage_error("spent", e))?;
        }
        Ok(())
    }

    pub fn save_pool(&self, entries: &[PoolSnapshotEntry]) -> CoreResult<()> {
        let value = bincode::serialize(entries).map_err(|e| storage_error("encode pool", e))?;
        self.pool.insert(POOL_KEY, value).map_err(|e| storage_error("pool", e))?;
        Ok(())
    }

    /// Saved pool snapshot; an unreadable snapshot is dropped, not fatal
    pub fn load_pool(&self) -> CoreResult<Vec<PoolSnapshotEntry>> {
        let bytes = match self.pool.get(POOL_KEY).map_err(|e| storage_error("pool", e))? {
            Some(bytes) => bytes,
            None => return Ok(Vec::new()),
        };
        match bincode::deserialize(&bytes) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!(error = %e, "discarding unreadable pool snapshot");
                Ok(Vec::new())
            }
        }
    }

    pub fn flush(&self) -> CoreResult<()> {
        self.db.flush().map_err(|e| storage_error("flush", e))?;
        Ok(())
    }
}
