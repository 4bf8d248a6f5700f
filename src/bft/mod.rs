pub mod block;
pub mod chain;
pub mod consensus;
pub mod engine;
pub mod leader_rotation;
pub mod messages;
pub mod qc;
pub mod state;
pub mod validator_set;

pub use block::{canonical_block_id, parse_block_id, Block};
pub use chain::{ChainRecord, FinalizedChain};
pub use consensus::{
    Action, Admission, ConsensusCore, ConsensusSnapshot, CoreParams, Lock, OutboundMessage, Step,
};
pub use engine::{spawn_engine, EngineHandle};
pub use messages::{Proposal, Vote, VoteType};
pub use qc::QuorumCertificate;
pub use validator_set::{Validator, ValidatorSet};
