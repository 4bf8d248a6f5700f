// src/bft/block.rs
use serde::{Deserialize, Serialize};

use crate::crypto::canonical::sha256_hex;

/// `parent_id` of the block at height 1.
pub const GENESIS_PARENT: &str = "genesis";

const MAX_ID_LEN: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub proposer_val_id: String,
    pub parent_id: String,
    /// Commitment to the application payload; execution lives outside the core.
    pub body_hash: String,
    pub ts_ms: u64,
}

impl Block {
    pub fn new(height: u64, round: u64, proposer: &str, parent_id: &str, ts_ms: u64) -> Self {
        Block {
            height,
            proposer_val_id: proposer.to_string(),
            parent_id: parent_id.to_string(),
            body_hash: empty_body_hash(parent_id, height, round),
            ts_ms,
        }
    }

    pub fn check_shape(&self) -> Result<(), String> {
        if self.height == 0 {
            return Err("block height must be >= 1".into());
        }
        if self.proposer_val_id.is_empty() || self.proposer_val_id.len() > MAX_ID_LEN {
            return Err("bad proposer_val_id".into());
        }
        if self.parent_id.is_empty() || self.parent_id.len() > MAX_ID_LEN {
            return Err("bad parent_id".into());
        }
        if self.body_hash.len() > MAX_ID_LEN {
            return Err("body_hash too long".into());
        }
        Ok(())
    }
}

/// Body hash of a block that carries no application payload.
pub fn empty_body_hash(parent_id: &str, height: u64, round: u64) -> String {
    sha256_hex(format!("glyph-empty-body:{}:{}:{}", parent_id, height, round).as_bytes())
}

/// `h{H}-r{R}-P{proposer}`
pub fn canonical_block_id(height: u64, round: u64, proposer: &str) -> String {
    format!("h{}-r{}-P{}", height, round, proposer)
}

/// Inverse of [`canonical_block_id`]: `(height, round, proposer)`.
pub fn parse_block_id(block_id: &str) -> Option<(u64, u64, String)> {
    if block_id.len() > MAX_ID_LEN {
        return None;
    }
    let rest = block_id.strip_prefix('h')?;
    let (height, rest) = split_number(rest)?;
    let rest = rest.strip_prefix("-r")?;
    let (round, rest) = split_number(rest)?;
    let proposer = rest.strip_prefix("-P")?;
    if proposer.is_empty() {
        return None;
    }
    Some((height, round, proposer.to_string()))
}

fn split_number(s: &str) -> Option<(u64, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 || (end > 1 && s.starts_with('0')) {
        return None;
    }
    let n = s[..end].parse().ok()?;
    Some((n, &s[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_round_trips_through_parser() {
        let id = canonical_block_id(12, 3, "val-2");
        assert_eq!(id, "h12-r3-Pval-2");
        assert_eq!(parse_block_id(&id), Some((12, 3, "val-2".to_string())));
    }

    #[test]
    fn parser_rejects_near_misses() {
        for bad in ["", "h-r0-Pa", "h1-r0-P", "h1r0-Pa", "x1-r0-Pa", "h01-r0-Pa", "h1-r-1-Pa"] {
            assert_eq!(parse_block_id(bad), None, "{}", bad);
        }
    }

    #[test]
    fn new_block_is_well_formed() {
        let b = Block::new(1, 0, "val1", GENESIS_PARENT, 5);
        assert!(b.check_shape().is_ok());
        assert_eq!(b.body_hash.len(), 64);
        let mut zero = b.clone();
        zero.height = 0;
        assert!(zero.check_shape().is_err());
    }
}
