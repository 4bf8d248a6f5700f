// src/bft/messages.rs
use serde::{Deserialize, Serialize};

use super::block::{canonical_block_id, parse_block_id, Block};
use super::validator_set::ValidatorSet;
use crate::crypto::canonical::{canonical_p2p_sign_bytes, sha256_hex};
use crate::error::P2pError;
use crate::network::envelope::MsgType;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: u64,
    pub proposer: String,
    pub block_id: String,
    pub block: Block,
    pub ts_ms: u64,
    #[serde(default)]
    pub sig_hex: String,
}

impl Proposal {
    /// Fork-choice fingerprint: sha256 of the canonical signed bytes.
    pub fn fingerprint(&self, chain_id: &str) -> String {
        let value = serde_json::to_value(self).unwrap_or_default();
        sha256_hex(&canonical_p2p_sign_bytes(
            MsgType::Proposal.as_str(),
            chain_id,
            &value,
        ))
    }

    /// Checks that hold regardless of local consensus state.
    pub fn check_shape(&self, validators: &ValidatorSet) -> Result<(), P2pError> {
        if self.height == 0 {
            return Err(P2pError::Malformed("proposal height must be >= 1".into()));
        }
        self.block.check_shape().map_err(P2pError::Malformed)?;
        let leader = validators
            .leader(self.height, self.round)
            .ok_or_else(|| P2pError::Malformed("empty validator set".into()))?;
        if self.proposer != leader {
            return Err(P2pError::Conflict(format!(
                "proposer {} is not leader {} of ({}, {})",
                self.proposer, leader, self.height, self.round
            )));
        }
        let expected = canonical_block_id(self.height, self.round, &self.proposer);
        if self.block_id != expected {
            return Err(P2pError::Conflict(format!(
                "block_id {} is not canonical (expected {})",
                self.block_id, expected
            )));
        }
        if self.block.height != self.height || self.block.proposer_val_id != self.proposer {
            return Err(P2pError::Malformed(
                "block header does not match proposal".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteType {
    Prevote,
    Precommit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub height: u64,
    pub round: u64,
    pub voter: String,
    pub vote_type: VoteType,
    pub block_id: String,
    pub ts_ms: u64,
    #[serde(default)]
    pub sig_hex: String,
}

impl Vote {
    pub fn check_shape(&self, validators: &ValidatorSet) -> Result<(), P2pError> {
        if self.height == 0 {
            return Err(P2pError::Malformed("vote height must be >= 1".into()));
        }
        if !validators.contains(&self.voter) {
            return Err(P2pError::Malformed(format!("unknown voter {}", self.voter)));
        }
        check_certified_block_id(&self.block_id, self.height, self.round, validators)
    }
}

/// A vote or QC at `(height, round)` may reference the canonical block of that
/// round or one carried forward from an earlier round of the same height.
pub fn check_certified_block_id(
    block_id: &str,
    height: u64,
    round: u64,
    validators: &ValidatorSet,
) -> Result<(), P2pError> {
    let (h, r, proposer) = parse_block_id(block_id)
        .ok_or_else(|| P2pError::Malformed(format!("non-canonical block_id {}", block_id)))?;
    if h != height || r > round {
        return Err(P2pError::Malformed(format!(
            "block_id {} does not belong to ({}, {})",
            block_id, height, round
        )));
    }
    if validators.leader(h, r) != Some(proposer.as_str()) {
        return Err(P2pError::Malformed(format!(
            "block_id {} names a proposer that did not lead its round",
            block_id
        )));
    }
    Ok(())
}
