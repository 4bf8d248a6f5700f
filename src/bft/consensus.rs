// src/bft/consensus.rs
// Single-writer consensus state machine. Pure and synchronous: every input
// carries the current time, and side effects are returned as `Action`s.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::block::{canonical_block_id, Block};
use super::chain::{ChainError, ChainRecord, FinalizedChain};
use super::messages::{Proposal, Vote, VoteType};
use super::qc::{form_qc, verify_links_block, verify_structure, QuorumCertificate};
use super::state::{HeightArena, Recorded, VoteBookError, MAX_PROPOSALS_PER_ROUND};
use super::validator_set::{Validator, ValidatorSet};
use crate::error::P2pError;

/// Votes further than this many rounds ahead of the local round are ignored.
pub const MAX_ROUNDS_AHEAD: u64 = 64;
/// Messages for height H+1 held until H finalizes.
pub const MAX_BUFFERED_NEXT_HEIGHT: usize = 1024;

#[derive(Clone, Debug)]
pub struct CoreParams {
    pub chain_id: String,
    pub validators: ValidatorSet,
    pub self_val_id: Option<String>,
    pub round_timeout_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Propose,
    Prevote,
    Precommit,
    Commit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub height: u64,
    pub round: u64,
    pub block_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundMessage {
    Proposal(Proposal),
    Vote(Vote),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Broadcast(OutboundMessage),
    Finalized { height: u64, block_id: String },
    /// A peer is at least at `height`; fetch what we are missing.
    NeedCatchup { height: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Duplicate,
    Buffered,
}

/// Read-only view published after every transition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConsensusSnapshot {
    pub val_id: Option<String>,
    pub height: u64,
    pub round: u64,
    pub step: Option<Step>,
    pub leader: String,
    pub have_proposal: bool,
    pub proposal_fp: Option<String>,
    pub proposal_block_id: Option<String>,
    pub lock: Option<Lock>,
    pub last_qc: Option<QuorumCertificate>,
    pub finalized_height: u64,
    pub validators: Vec<Validator>,
}

enum Pending {
    Proposal(Proposal),
    Vote(Vote),
}

pub struct ConsensusCore {
    params: CoreParams,
    chain: Arc<FinalizedChain>,
    height: u64,
    round: u64,
    step: Step,
    round_started_ms: u64,
    lock: Option<Lock>,
    last_qc: Option<QuorumCertificate>,
    arena: HeightArena,
    next_height: Vec<Pending>,
    catchup_hint: u64,
    actions: Vec<Action>,
}

impl ConsensusCore {
    pub fn new(params: CoreParams, chain: Arc<FinalizedChain>) -> Self {
        let last_qc = chain.tip().map(|r| r.qc);
        let height = chain.finalized_height() + 1;
        Self {
            params,
            chain,
            height,
            round: 0,
            step: Step::Propose,
            round_started_ms: 0,
            lock: None,
            last_qc,
            arena: HeightArena::new(height),
            next_height: Vec::new(),
            catchup_hint: 0,
            actions: Vec::new(),
        }
    }

    /// Enter `(FH + 1, 0)`.
    pub fn start(&mut self, now_ms: u64) {
        info!(
            "consensus starting at height {} (finalized {}) as {:?}",
            self.height,
            self.chain.finalized_height(),
            self.params.self_val_id
        );
        self.enter_round(self.round, now_ms);
    }

    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn lock(&self) -> Option<&Lock> {
        self.lock.as_ref()
    }

    pub fn last_qc(&self) -> Option<&QuorumCertificate> {
        self.last_qc.as_ref()
    }

    pub fn finalized_height(&self) -> u64 {
        self.chain.finalized_height()
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.params.validators
    }

    pub fn snapshot(&self) -> ConsensusSnapshot {
        let current = self.arena.round(self.round);
        let candidate = current.and_then(|r| r.candidate());
        ConsensusSnapshot {
            val_id: self.params.self_val_id.clone(),
            height: self.height,
            round: self.round,
            step: Some(self.step),
            leader: self.leader(self.round).unwrap_or_default().to_string(),
            have_proposal: candidate.is_some(),
            proposal_fp: candidate.map(|(fp, _)| fp.clone()),
            proposal_block_id: candidate.map(|(_, p)| p.block_id.clone()),
            lock: self.lock.clone(),
            last_qc: self.last_qc.clone(),
            finalized_height: self.chain.finalized_height(),
            validators: self.params.validators.validators().to_vec(),
        }
    }

    fn leader(&self, round: u64) -> Option<&str> {
        self.params.validators.leader(self.height, round)
    }

    fn self_voter(&self) -> Option<(String, u64)> {
        let me = self.params.self_val_id.as_ref()?;
        let power = self.params.validators.power_of(me)?;
        Some((me.clone(), power))
    }

    fn enter_round(&mut self, round: u64, now_ms: u64) {
        self.round = round;
        self.step = Step::Propose;
        self.round_started_ms = now_ms;
        debug!("entering ({}, {})", self.height, round);
        let is_leader = match (&self.params.self_val_id, self.leader(round)) {
            (Some(me), Some(leader)) => me == leader,
            _ => false,
        };
        let already_proposed = self
            .arena
            .round(round)
            .map(|r| !r.proposals.is_empty())
            .unwrap_or(false);
        if is_leader && !already_proposed {
            self.propose(now_ms);
        }
        self.progress(now_ms);
    }

    fn propose(&mut self, now_ms: u64) {
        let me = match &self.params.self_val_id {
            Some(me) => me.clone(),
            None => return,
        };
        let parent = self.chain.tip_block_id();
        let block = Block::new(self.height, self.round, &me, &parent, now_ms);
        let proposal = Proposal {
            height: self.height,
            round: self.round,
            proposer: me.clone(),
            block_id: canonical_block_id(self.height, self.round, &me),
            block,
            ts_ms: now_ms,
            sig_hex: String::new(),
        };
        let fp = proposal.fingerprint(&self.params.chain_id);
        info!(
            "proposing {} at ({}, {})",
            proposal.block_id, self.height, self.round
        );
        self.arena
            .round_mut(self.round)
            .proposals
            .insert(fp, proposal.clone());
        self.actions
            .push(Action::Broadcast(OutboundMessage::Proposal(proposal)));
    }

    fn request_catchup(&mut self, height: u64) {
        if height > self.catchup_hint {
            self.catchup_hint = height;
            self.actions.push(Action::NeedCatchup { height });
        }
    }

    fn buffer_next(&mut self, msg: Pending) -> Result<Admission, P2pError> {
        if self.next_height.len() >= MAX_BUFFERED_NEXT_HEIGHT {
            return Err(P2pError::Stale("next-height buffer full".into()));
        }
        self.next_height.push(msg);
        Ok(Admission::Buffered)
    }

    pub fn on_proposal(&mut self, p: Proposal, now_ms: u64) -> Result<Admission, P2pError> {
        p.check_shape(&self.params.validators)?;
        if p.height < self.height {
            return Err(P2pError::Stale(format!(
                "proposal for finalized height {}",
                p.height
            )));
        }
        if p.height == self.height + 1 {
            return self.buffer_next(Pending::Proposal(p));
        }
        if p.height > self.height + 1 {
            self.request_catchup(p.height - 1);
            return Err(P2pError::Stale(format!(
                "proposal for height {} while at {}",
                p.height, self.height
            )));
        }

        let tip = self.chain.tip_block_id();
        if p.block.parent_id != tip {
            return Err(P2pError::Conflict(format!(
                "proposal {} parent {} does not extend tip {}",
                p.block_id, p.block.parent_id, tip
            )));
        }

        let fp = p.fingerprint(&self.params.chain_id);
        let round = p.round;
        {
            let rs = self.arena.round_mut(round);
            if rs.proposals.contains_key(&fp) {
                return Ok(Admission::Duplicate);
            }
            if let Some(existing) = rs.proposal_block_id() {
                if existing != p.block_id {
                    return Err(P2pError::Conflict(format!(
                        "({}, {}) already has proposal {}",
                        p.height, round, existing
                    )));
                }
            }
            if rs.proposals.len() >= MAX_PROPOSALS_PER_ROUND {
                return Err(P2pError::Stale("too many proposal variants".into()));
            }
            debug!("proposal {} fp {} at ({}, {})", p.block_id, fp, p.height, round);
            rs.proposals.insert(fp, p);
        }

        if round < self.round {
            // kept so a late commit for that round can find its block
            self.progress(now_ms);
            return Err(P2pError::Stale(format!(
                "proposal for past round {} (at {})",
                round, self.round
            )));
        }
        if round > self.round {
            info!(
                "round hint: fast-forward ({}, {}) -> ({}, {})",
                self.height, self.round, self.height, round
            );
            self.enter_round(round, now_ms);
        } else {
            self.progress(now_ms);
        }
        Ok(Admission::Accepted)
    }

    pub fn on_vote(&mut self, v: Vote, now_ms: u64) -> Result<Admission, P2pError> {
        v.check_shape(&self.params.validators)?;
        if v.height < self.height {
            return Err(P2pError::Stale(format!("vote for finalized height {}", v.height)));
        }
        if v.height == self.height + 1 {
            return self.buffer_next(Pending::Vote(v));
        }
        if v.height > self.height + 1 {
            self.request_catchup(v.height - 1);
            return Err(P2pError::Stale(format!(
                "vote for height {} while at {}",
                v.height, self.height
            )));
        }
        if v.round > self.round.saturating_add(MAX_ROUNDS_AHEAD) {
            return Err(P2pError::Stale(format!("vote round {} too far ahead", v.round)));
        }
        if v.vote_type == VoteType::Precommit {
            if let Some(lock) = &self.lock {
                let justified = self
                    .arena
                    .round(v.round)
                    .and_then(|r| r.prevote_quorum.as_deref())
                    == Some(v.block_id.as_str());
                if v.round > lock.round && !justified {
                    return Err(P2pError::Conflict(format!(
                        "PRECOMMIT for {} at round {} without a PREVOTE quorum",
                        v.block_id, v.round
                    )));
                }
            }
        }

        let power = self.params.validators.power_of(&v.voter).unwrap_or(0);
        match self
            .arena
            .record_vote(v.round, v.vote_type, &v.voter, &v.block_id, power)
        {
            Ok(Recorded::Duplicate) => Ok(Admission::Duplicate),
            Ok(Recorded::New) => {
                self.progress(now_ms);
                Ok(Admission::Accepted)
            }
            Err(VoteBookError::Equivocation(ev)) => {
                warn!(
                    "equivocation by {} at ({}, {}) {:?}: {} vs {}",
                    ev.validator, ev.height, ev.round, ev.vote_type, ev.existing, ev.conflicting
                );
                Err(P2pError::Conflict(format!(
                    "{} already voted {} at ({}, {})",
                    ev.validator, ev.existing, ev.height, ev.round
                )))
            }
        }
    }

    pub fn on_tick(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.round_started_ms) >= self.params.round_timeout_ms {
            info!(
                "round timeout at ({}, {}), moving to round {}",
                self.height,
                self.round,
                self.round + 1
            );
            self.enter_round(self.round.saturating_add(1), now_ms);
        }
    }

    /// Append a block and QC fetched from a peer. Must be exactly `FH + 1`.
    pub fn apply_synced(
        &mut self,
        record: ChainRecord,
        now_ms: u64,
    ) -> Result<Admission, P2pError> {
        verify_structure(&record.qc, &self.params.validators)?;
        let fh = self.chain.finalized_height();
        let h = record.qc.height;
        if h <= fh {
            return match self.chain.get(h) {
                Some(existing) if existing.qc.block_id == record.qc.block_id => Err(
                    P2pError::Stale(format!("height {} already finalized", h)),
                ),
                _ => Err(P2pError::Conflict(format!(
                    "synced block {} conflicts with finalized height {}",
                    record.qc.block_id, h
                ))),
            };
        }
        if h > fh + 1 {
            return Err(P2pError::Malformed(format!(
                "synced height {} leaves a gap after {}",
                h, fh
            )));
        }
        verify_links_block(&record.qc, &record.block, &self.chain.tip_block_id())?;
        self.commit(record, now_ms)
            .map_err(|e| P2pError::Busy(e.to_string()))?;
        Ok(Admission::Accepted)
    }

    /// Drive the current height forward until nothing changes.
    fn progress(&mut self, now_ms: u64) {
        let quorum = self.params.validators.quorum();
        loop {
            for (round, block_id) in self.commit_candidates(quorum) {
                if self.finalize(round, &block_id, now_ms) {
                    return;
                }
            }

            for rs in self.arena.rounds.values_mut() {
                if rs.prevote_quorum.is_none() {
                    rs.prevote_quorum = rs.prevotes.quorum_block(quorum).map(str::to_string);
                }
            }

            let mut changed = false;
            let round = self.round;
            let sent_prevote = self
                .arena
                .round(round)
                .map(|r| r.sent_prevote)
                .unwrap_or(false);
            if !sent_prevote {
                if let Some(block_id) = self.choose_prevote(round) {
                    self.cast(VoteType::Prevote, &block_id, now_ms);
                    self.arena.round_mut(round).sent_prevote = true;
                    if self.step == Step::Propose {
                        self.step = Step::Prevote;
                    }
                    changed = true;
                }
            }

            let (sent_precommit, pol) = match self.arena.round(round) {
                Some(r) => (r.sent_precommit, r.prevote_quorum.clone()),
                None => (false, None),
            };
            if !sent_precommit {
                if let Some(block_id) = pol {
                    if self.lock.as_ref().map(|l| &l.block_id) != Some(&block_id) {
                        info!("locking {} at ({}, {})", block_id, self.height, round);
                    }
                    self.lock = Some(Lock {
                        height: self.height,
                        round,
                        block_id: block_id.clone(),
                    });
                    self.cast(VoteType::Precommit, &block_id, now_ms);
                    self.arena.round_mut(round).sent_precommit = true;
                    self.step = Step::Precommit;
                    changed = true;
                }
            }

            if !changed {
                return;
            }
        }
    }

    /// The block this node prevotes at `round`, if any.
    fn choose_prevote(&self, round: u64) -> Option<String> {
        let candidate = self.arena.round(round)?.proposal_block_id()?.to_string();
        match &self.lock {
            None => Some(candidate),
            Some(lock) if lock.block_id == candidate => Some(candidate),
            Some(lock) => {
                if self
                    .arena
                    .prevote_quorum_since(&candidate, lock.round)
                    .is_some()
                {
                    Some(candidate)
                } else {
                    Some(lock.block_id.clone())
                }
            }
        }
    }

    fn cast(&mut self, vote_type: VoteType, block_id: &str, now_ms: u64) {
        let (me, power) = match self.self_voter() {
            Some(v) => v,
            None => return,
        };
        let round = self.round;
        if let Err(VoteBookError::Equivocation(ev)) =
            self.arena
                .record_vote(round, vote_type, &me, block_id, power)
        {
            error!("refusing to equivocate: {:?}", ev);
            debug_assert!(false, "local equivocation {:?}", ev);
            return;
        }
        let vote = Vote {
            height: self.height,
            round,
            voter: me,
            vote_type,
            block_id: block_id.to_string(),
            ts_ms: now_ms,
            sig_hex: String::new(),
        };
        debug!("{:?} {} at ({}, {})", vote_type, block_id, self.height, round);
        self.actions.push(Action::Broadcast(OutboundMessage::Vote(vote)));
    }

    /// Every round holding a precommit quorum, lowest first. A round whose
    /// block is unknown or does not link must not shadow the later ones.
    fn commit_candidates(&self, quorum: u64) -> Vec<(u64, String)> {
        self.arena
            .rounds
            .iter()
            .filter_map(|(round, rs)| {
                rs.precommits
                    .quorum_block(quorum)
                    .map(|b| (*round, b.to_string()))
            })
            .collect()
    }

    /// Returns true when the height advanced.
    fn finalize(&mut self, round: u64, block_id: &str, now_ms: u64) -> bool {
        let block = match self.arena.find_block_proposal(block_id) {
            Some(p) => p.block.clone(),
            None => {
                debug!("commit quorum for {} but block unknown", block_id);
                self.request_catchup(self.height);
                return false;
            }
        };
        let voters = self
            .arena
            .round(round)
            .map(|r| r.precommits.voters_for(block_id))
            .unwrap_or_default();
        let qc = form_qc(self.height, round, block_id, voters, now_ms);
        if let Err(e) = verify_links_block(&qc, &block, &self.chain.tip_block_id()) {
            error!("committed block {} does not link: {}", block_id, e);
            self.request_catchup(self.height);
            return false;
        }
        match self.commit(ChainRecord { block, qc }, now_ms) {
            Ok(()) => true,
            Err(e) => {
                error!("finalize {} failed: {}", block_id, e);
                false
            }
        }
    }

    fn commit(&mut self, record: ChainRecord, now_ms: u64) -> Result<(), ChainError> {
        let height = record.height();
        let block_id = record.block_id().to_string();
        let qc = record.qc.clone();
        self.chain.append(record)?;
        self.step = Step::Commit;
        info!(
            "finalized height {} block {} (round {}, {} voters)",
            height,
            block_id,
            qc.round,
            qc.voters.len()
        );
        self.last_qc = Some(qc);
        self.lock = None;
        self.actions.push(Action::Finalized { height, block_id });
        self.advance_height(now_ms);
        Ok(())
    }

    fn advance_height(&mut self, now_ms: u64) {
        self.height = self.chain.finalized_height() + 1;
        self.arena = HeightArena::new(self.height);
        self.enter_round(0, now_ms);

        let buffered = std::mem::take(&mut self.next_height);
        for msg in buffered {
            let res = match msg {
                Pending::Proposal(p) if p.height == self.height => self.on_proposal(p, now_ms),
                Pending::Vote(v) if v.height == self.height => self.on_vote(v, now_ms),
                _ => continue,
            };
            if let Err(e) = res {
                debug!("buffered message dropped on replay: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(me: &str) -> ConsensusCore {
        let params = CoreParams {
            chain_id: "glyph-test".into(),
            validators: ValidatorSet::parse_csv("val1:1,val2:1,val3:1,val4:1").unwrap(),
            self_val_id: Some(me.into()),
            round_timeout_ms: 1_000,
        };
        ConsensusCore::new(params, Arc::new(FinalizedChain::in_memory()))
    }

    fn broadcasts(actions: &[Action]) -> Vec<OutboundMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn leader_proposes_and_prevotes_on_start() {
        let mut c = core("val1");
        c.start(0);
        let out = broadcasts(&c.take_actions());
        assert!(matches!(&out[0], OutboundMessage::Proposal(p) if p.block_id == "h1-r0-Pval1"));
        assert!(matches!(&out[1], OutboundMessage::Vote(v)
            if v.vote_type == VoteType::Prevote && v.block_id == "h1-r0-Pval1"));
        assert_eq!(c.step(), Step::Prevote);
    }

    #[test]
    fn timeout_advances_round_and_keeps_height() {
        let mut c = core("val4");
        c.start(0);
        c.on_tick(999);
        assert_eq!(c.round(), 0);
        c.on_tick(1_000);
        assert_eq!((c.height(), c.round()), (1, 1));
        assert_eq!(c.snapshot().leader, "val2");
    }

    #[test]
    fn far_future_messages_request_catchup() {
        let mut c = core("val4");
        c.start(0);
        c.take_actions();
        let v = Vote {
            height: 5,
            round: 0,
            voter: "val2".into(),
            vote_type: VoteType::Prevote,
            block_id: "h5-r0-Pval1".into(),
            ts_ms: 0,
            sig_hex: String::new(),
        };
        assert!(matches!(c.on_vote(v, 1), Err(P2pError::Stale(_))));
        assert_eq!(c.take_actions(), vec![Action::NeedCatchup { height: 4 }]);
    }
}
