// src/bft/chain.rs
// Append-only finalized chain. Written only by the engine task, read by
// BLOCK_REQ handlers and sync.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use super::block::{Block, GENESIS_PARENT};
use super::qc::QuorumCertificate;
use crate::storage::JsonDirStore;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub block: Block,
    pub qc: QuorumCertificate,
}

impl ChainRecord {
    pub fn height(&self) -> u64 {
        self.block.height
    }

    pub fn block_id(&self) -> &str {
        &self.qc.block_id
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("height {got} does not extend tip {tip}")]
    NotNext { tip: u64, got: u64 },
    #[error("persist failed: {0}")]
    Persist(String),
}

pub struct FinalizedChain {
    store: Option<JsonDirStore>,
    records: RwLock<BTreeMap<u64, ChainRecord>>,
}

fn height_key(height: u64) -> String {
    format!("{:020}", height)
}

impl FinalizedChain {
    /// Chain kept only in memory.
    pub fn in_memory() -> Self {
        Self {
            store: None,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open `<dir>` and load every contiguous, correctly linked record from
    /// height 1. Loading stops at the first gap or broken link.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        let store = JsonDirStore::open(dir)?;
        let mut records = BTreeMap::new();
        let mut parent = GENESIS_PARENT.to_string();
        for key in store.keys()? {
            let expected = records.len() as u64 + 1;
            if key != height_key(expected) {
                log::warn!("chain store: gap before {}, ignoring the rest", key);
                break;
            }
            let rec: ChainRecord = match store.get(&key)? {
                Some(r) => r,
                None => break,
            };
            if rec.height() != expected
                || rec.qc.height != expected
                || rec.block.parent_id != parent
            {
                log::warn!("chain store: record {} does not link, ignoring the rest", key);
                break;
            }
            parent = rec.block_id().to_string();
            records.insert(expected, rec);
        }
        log::info!(
            "chain store {} loaded {} finalized blocks",
            dir.display(),
            records.len()
        );
        Ok(Self {
            store: Some(store),
            records: RwLock::new(records),
        })
    }

    pub fn finalized_height(&self) -> u64 {
        self.records.read().keys().next_back().copied().unwrap_or(0)
    }

    pub fn tip(&self) -> Option<ChainRecord> {
        self.records.read().values().next_back().cloned()
    }

    /// `parent_id` the next block must carry.
    pub fn tip_block_id(&self) -> String {
        self.records
            .read()
            .values()
            .next_back()
            .map(|r| r.block_id().to_string())
            .unwrap_or_else(|| GENESIS_PARENT.to_string())
    }

    pub fn get(&self, height: u64) -> Option<ChainRecord> {
        self.records.read().get(&height).cloned()
    }

    /// Append the record for `tip + 1`, persisting before it becomes visible.
    pub fn append(&self, record: ChainRecord) -> Result<(), ChainError> {
        let mut records = self.records.write();
        let tip = records.keys().next_back().copied().unwrap_or(0);
        if record.height() != tip + 1 {
            return Err(ChainError::NotNext {
                tip,
                got: record.height(),
            });
        }
        if let Some(store) = &self.store {
            store
                .put(&height_key(record.height()), &record)
                .map_err(|e| ChainError::Persist(e.to_string()))?;
        }
        records.insert(record.height(), record);
        Ok(())
    }
}
