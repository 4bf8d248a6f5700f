// src/bft/qc.rs
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::block::{parse_block_id, Block};
use super::messages::{check_certified_block_id, VoteType};
use super::validator_set::ValidatorSet;
use crate::error::P2pError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub height: u64,
    pub round: u64,
    pub vote_type: VoteType,
    pub block_id: String,
    pub voters: Vec<String>,
    pub ts_ms: u64,
}

impl QuorumCertificate {
    /// Same finalization: height, round and block agree. Voter subsets may
    /// legitimately differ between honest nodes.
    pub fn certifies_same(&self, other: &QuorumCertificate) -> bool {
        self.height == other.height
            && self.round == other.round
            && self.block_id == other.block_id
    }
}

/// Create a PRECOMMIT QC from the voters that formed the quorum.
pub fn form_qc(
    height: u64,
    round: u64,
    block_id: &str,
    voters: impl IntoIterator<Item = String>,
    ts_ms: u64,
) -> QuorumCertificate {
    let mut voters: Vec<String> = voters.into_iter().collect();
    voters.sort();
    voters.dedup();
    QuorumCertificate {
        height,
        round,
        vote_type: VoteType::Precommit,
        block_id: block_id.to_string(),
        voters,
        ts_ms,
    }
}

/// Structural validity independent of local chain state.
pub fn verify_structure(qc: &QuorumCertificate, validators: &ValidatorSet) -> Result<(), P2pError> {
    if qc.vote_type != VoteType::Precommit {
        return Err(P2pError::Malformed("QC vote_type must be PRECOMMIT".into()));
    }
    if qc.height == 0 {
        return Err(P2pError::Malformed("QC height must be >= 1".into()));
    }
    let mut seen = HashSet::new();
    for voter in &qc.voters {
        if !seen.insert(voter.as_str()) {
            return Err(P2pError::Malformed(format!("duplicate QC voter {}", voter)));
        }
        if !validators.contains(voter) {
            return Err(P2pError::Malformed(format!("unknown QC voter {}", voter)));
        }
    }
    let power = validators.power_of_set(&qc.voters);
    if power < validators.quorum() {
        return Err(P2pError::Malformed(format!(
            "QC voting power {} below quorum {}",
            power,
            validators.quorum()
        )));
    }
    check_certified_block_id(&qc.block_id, qc.height, qc.round, validators)
}

/// The QC certifies `block` and `block` extends `parent_id`.
pub fn verify_links_block(
    qc: &QuorumCertificate,
    block: &Block,
    parent_id: &str,
) -> Result<(), P2pError> {
    block.check_shape().map_err(P2pError::Malformed)?;
    if block.height != qc.height {
        return Err(P2pError::Malformed(format!(
            "block height {} does not match QC height {}",
            block.height, qc.height
        )));
    }
    match parse_block_id(&qc.block_id) {
        Some((_, _, proposer)) if proposer == block.proposer_val_id => {}
        _ => {
            return Err(P2pError::Malformed(
                "QC block_id does not name the block proposer".into(),
            ))
        }
    }
    if block.parent_id != parent_id {
        return Err(P2pError::Conflict(format!(
            "block {} parent {} does not extend local tip {}",
            block.height, block.parent_id, parent_id
        )));
    }
    Ok(())
}

/// Where a peer-advertised tip sits relative to ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipPosition {
    Ahead,
    Same,
}

/// Classify an already structurally valid `qc` against the local `last_qc`.
/// Regressions and conflicting finalizations are errors (400).
pub fn compare_tip(
    qc: &QuorumCertificate,
    local: Option<&QuorumCertificate>,
) -> Result<TipPosition, P2pError> {
    let local = match local {
        Some(l) => l,
        None => return Ok(TipPosition::Ahead),
    };
    if (qc.height, qc.round) < (local.height, local.round) {
        return Err(P2pError::Conflict(format!(
            "QC ({}, {}) regresses local tip ({}, {})",
            qc.height, qc.round, local.height, local.round
        )));
    }
    if qc.height == local.height {
        if qc.block_id != local.block_id {
            return Err(P2pError::Conflict(format!(
                "QC finalizes {} at height {} but local chain has {}",
                qc.block_id, qc.height, local.block_id
            )));
        }
        return Ok(TipPosition::Same);
    }
    Ok(TipPosition::Ahead)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> ValidatorSet {
        ValidatorSet::parse_csv("val1:1,val2:1,val3:1,val4:1").unwrap()
    }

    fn qc(h: u64, r: u64, voters: &[&str]) -> QuorumCertificate {
        let leader = set().leader(h, r).unwrap().to_string();
        form_qc(
            h,
            r,
            &super::super::block::canonical_block_id(h, r, &leader),
            voters.iter().map(|s| s.to_string()),
            0,
        )
    }

    #[test]
    fn structure_requires_quorum_and_precommit() {
        let v = set();
        assert!(verify_structure(&qc(2, 0, &["val1", "val2", "val3"]), &v).is_ok());
        assert!(verify_structure(&qc(2, 0, &["val1", "val2"]), &v).is_err());
        assert!(verify_structure(&qc(2, 0, &[]), &v).is_err());
        let mut prevote = qc(2, 0, &["val1", "val2", "val3"]);
        prevote.vote_type = VoteType::Prevote;
        assert!(verify_structure(&prevote, &v).is_err());
        let mut dup = qc(2, 0, &["val1", "val2"]);
        dup.voters.push("val1".into());
        assert!(verify_structure(&dup, &v).is_err());
        let mut wrong_leader = qc(2, 0, &["val1", "val2", "val3"]);
        wrong_leader.block_id = "h2-r0-Pval1".into();
        assert!(verify_structure(&wrong_leader, &v).is_err());
    }

    #[test]
    fn tip_comparison_rejects_regression_and_conflict() {
        let local = qc(3, 1, &["val1", "val2", "val3"]);
        assert_eq!(compare_tip(&qc(4, 0, &["val1"]), Some(&local)), Ok(TipPosition::Ahead));
        assert_eq!(compare_tip(&local.clone(), Some(&local)), Ok(TipPosition::Same));
        assert!(compare_tip(&qc(2, 5, &["val1"]), Some(&local)).is_err());
        assert!(compare_tip(&qc(3, 0, &["val1"]), Some(&local)).is_err());
        assert!(compare_tip(&qc(3, 2, &["val1"]), Some(&local)).is_err());
        assert_eq!(compare_tip(&local, None), Ok(TipPosition::Ahead));
    }

    #[test]
    fn block_link_checks_parent_and_proposer() {
        let q = qc(1, 0, &["val1", "val2", "val3"]);
        let block = Block::new(1, 0, "val1", "genesis", 1);
        assert!(verify_links_block(&q, &block, "genesis").is_ok());
        assert!(verify_links_block(&q, &block, "h0-r0-Pval4").is_err());
        let other = Block::new(1, 0, "val2", "genesis", 1);
        assert!(verify_links_block(&q, &other, "genesis").is_err());
    }
}
