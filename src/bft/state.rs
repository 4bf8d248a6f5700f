// src/bft/state.rs
// Per-height arena of proposals and votes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use super::messages::{Proposal, VoteType};

/// Most distinct proposal variants kept for one (height, round).
pub const MAX_PROPOSALS_PER_ROUND: usize = 16;

/// Equivocation evidence record
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Equivocation {
    pub validator: String,
    pub height: u64,
    pub round: u64,
    pub vote_type: VoteType,
    pub existing: String,
    pub conflicting: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VoteBookError {
    #[error("equivocation: {0:?}")]
    Equivocation(Equivocation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    New,
    Duplicate,
}

/// Votes of one type at one (height, round).
#[derive(Debug, Default)]
pub struct VoteTally {
    by_voter: HashMap<String, String>,
    power_by_block: HashMap<String, u64>,
}

impl VoteTally {
    /// Record a vote and detect equivocation.
    pub fn record(
        &mut self,
        voter: &str,
        block_id: &str,
        power: u64,
    ) -> Result<Recorded, String> {
        if let Some(existing) = self.by_voter.get(voter) {
            if existing != block_id {
                return Err(existing.clone());
            }
            return Ok(Recorded::Duplicate);
        }
        self.by_voter.insert(voter.to_string(), block_id.to_string());
        *self.power_by_block.entry(block_id.to_string()).or_insert(0) += power;
        Ok(Recorded::New)
    }

    pub fn voted(&self, voter: &str) -> Option<&str> {
        self.by_voter.get(voter).map(String::as_str)
    }

    pub fn power_for(&self, block_id: &str) -> u64 {
        self.power_by_block.get(block_id).copied().unwrap_or(0)
    }

    /// First block (by id, for determinism) whose power reaches `quorum`.
    pub fn quorum_block(&self, quorum: u64) -> Option<&str> {
        self.power_by_block
            .iter()
            .filter(|(_, p)| **p >= quorum)
            .map(|(b, _)| b.as_str())
            .min()
    }

    pub fn voters_for(&self, block_id: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .by_voter
            .iter()
            .filter(|(_, b)| b.as_str() == block_id)
            .map(|(v, _)| v.clone())
            .collect();
        out.sort();
        out
    }
}

#[derive(Debug, Default)]
pub struct RoundState {
    /// fingerprint -> proposal
    pub proposals: BTreeMap<String, Proposal>,
    pub prevotes: VoteTally,
    pub precommits: VoteTally,
    /// Block that first reached a PREVOTE quorum in this round.
    pub prevote_quorum: Option<String>,
    pub sent_prevote: bool,
    pub sent_precommit: bool,
}

impl RoundState {
    /// Fork-choice winner: lexicographically smallest fingerprint.
    pub fn candidate(&self) -> Option<(&String, &Proposal)> {
        self.proposals.iter().next()
    }

    pub fn proposal_block_id(&self) -> Option<&str> {
        self.candidate().map(|(_, p)| p.block_id.as_str())
    }

    pub fn tally(&self, vote_type: VoteType) -> &VoteTally {
        match vote_type {
            VoteType::Prevote => &self.prevotes,
            VoteType::Precommit => &self.precommits,
        }
    }

    pub fn tally_mut(&mut self, vote_type: VoteType) -> &mut VoteTally {
        match vote_type {
            VoteType::Prevote => &mut self.prevotes,
            VoteType::Precommit => &mut self.precommits,
        }
    }
}

/// Everything seen for a single height. Dropped when the height finalizes.
#[derive(Debug)]
pub struct HeightArena {
    pub height: u64,
    pub rounds: BTreeMap<u64, RoundState>,
}

impl HeightArena {
    pub fn new(height: u64) -> Self {
        Self {
            height,
            rounds: BTreeMap::new(),
        }
    }

    pub fn round(&self, round: u64) -> Option<&RoundState> {
        self.rounds.get(&round)
    }

    pub fn round_mut(&mut self, round: u64) -> &mut RoundState {
        self.rounds.entry(round).or_default()
    }

    /// Record a vote, turning a conflicting second vote into evidence.
    pub fn record_vote(
        &mut self,
        round: u64,
        vote_type: VoteType,
        voter: &str,
        block_id: &str,
        power: u64,
    ) -> Result<Recorded, VoteBookError> {
        let height = self.height;
        self.round_mut(round)
            .tally_mut(vote_type)
            .record(voter, block_id, power)
            .map_err(|existing| {
                VoteBookError::Equivocation(Equivocation {
                    validator: voter.to_string(),
                    height,
                    round,
                    vote_type,
                    existing,
                    conflicting: block_id.to_string(),
                })
            })
    }

    /// Any proposal at this height carrying `block_id`, preferring the
    /// smallest fingerprint.
    pub fn find_block_proposal(&self, block_id: &str) -> Option<&Proposal> {
        self.rounds
            .values()
            .flat_map(|r| r.proposals.values())
            .find(|p| p.block_id == block_id)
    }

    /// Was a PREVOTE quorum for `block_id` seen at any round >= `from_round`?
    pub fn prevote_quorum_since(&self, block_id: &str, from_round: u64) -> Option<u64> {
        self.rounds
            .range(from_round..)
            .find(|(_, r)| r.prevote_quorum.as_deref() == Some(block_id))
            .map(|(round, _)| *round)
    }
}
