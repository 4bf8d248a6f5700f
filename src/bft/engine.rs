// src/bft/engine.rs
// Engine actor: owns the `ConsensusCore`, serializes every transition and
// publishes a status snapshot after each one.

use log::{debug, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;

use super::chain::ChainRecord;
use super::consensus::{Action, Admission, ConsensusCore, ConsensusSnapshot, OutboundMessage};
use super::messages::{Proposal, Vote};
use crate::error::P2pError;
use crate::now_ms;

type Reply = oneshot::Sender<Result<Admission, P2pError>>;

pub enum EngineInput {
    Proposal { proposal: Proposal, reply: Reply },
    Vote { vote: Vote, reply: Reply },
    Synced { record: ChainRecord, reply: Reply },
    Tick,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub tick_ms: u64,
    pub inbox_capacity: usize,
    /// Upper bound on how long an ingress handler waits for a verdict.
    pub reply_timeout: Duration,
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineInput>,
    status: Arc<RwLock<ConsensusSnapshot>>,
    reply_timeout: Duration,
}

impl EngineHandle {
    async fn request<F>(&self, make: F) -> Result<Admission, P2pError>
    where
        F: FnOnce(Reply) -> EngineInput,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let input = make(reply_tx);
        let exchange = async {
            self.tx
                .send(input)
                .await
                .map_err(|_| P2pError::Busy("consensus engine stopped".into()))?;
            reply_rx
                .await
                .map_err(|_| P2pError::Busy("consensus engine dropped request".into()))?
        };
        match tokio::time::timeout(self.reply_timeout, exchange).await {
            Ok(res) => res,
            Err(_) => Err(P2pError::Busy("consensus engine did not answer in time".into())),
        }
    }

    pub async fn submit_proposal(&self, proposal: Proposal) -> Result<Admission, P2pError> {
        self.request(|reply| EngineInput::Proposal { proposal, reply })
            .await
    }

    pub async fn submit_vote(&self, vote: Vote) -> Result<Admission, P2pError> {
        self.request(|reply| EngineInput::Vote { vote, reply }).await
    }

    pub async fn apply_synced(&self, record: ChainRecord) -> Result<Admission, P2pError> {
        self.request(|reply| EngineInput::Synced { record, reply })
            .await
    }

    /// Latest published snapshot; never waits on the engine.
    pub fn snapshot(&self) -> ConsensusSnapshot {
        self.status.read().clone()
    }
}

struct EngineTask {
    core: ConsensusCore,
    status: Arc<RwLock<ConsensusSnapshot>>,
    outbound: mpsc::Sender<OutboundMessage>,
    catchup: Arc<Notify>,
}

impl EngineTask {
    fn flush(&mut self) {
        for action in self.core.take_actions() {
            match action {
                Action::Broadcast(msg) => {
                    if let Err(e) = self.outbound.try_send(msg) {
                        warn!("outbound queue rejected message: {}", e);
                    }
                }
                Action::NeedCatchup { height } => {
                    debug!("engine requests catchup towards height {}", height);
                    self.catchup.notify_one();
                }
                Action::Finalized { .. } => {}
            }
        }
        *self.status.write() = self.core.snapshot();
    }

    fn handle(&mut self, input: EngineInput) {
        let now = now_ms();
        match input {
            EngineInput::Proposal { proposal, reply } => {
                let res = self.core.on_proposal(proposal, now);
                self.flush();
                let _ = reply.send(res);
            }
            EngineInput::Vote { vote, reply } => {
                let res = self.core.on_vote(vote, now);
                self.flush();
                let _ = reply.send(res);
            }
            EngineInput::Synced { record, reply } => {
                let res = self.core.apply_synced(record, now);
                self.flush();
                let _ = reply.send(res);
            }
            EngineInput::Tick => {
                self.core.on_tick(now);
                self.flush();
            }
        }
    }
}

/// Start the engine task and its timer task.
pub fn spawn_engine(
    core: ConsensusCore,
    cfg: EngineConfig,
    outbound: mpsc::Sender<OutboundMessage>,
    catchup: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
) -> (EngineHandle, Vec<JoinHandle<()>>) {
    let (tx, mut rx) = mpsc::channel(cfg.inbox_capacity.max(1));
    let status = Arc::new(RwLock::new(core.snapshot()));
    let handle = EngineHandle {
        tx: tx.clone(),
        status: status.clone(),
        reply_timeout: cfg.reply_timeout,
    };

    let mut task = EngineTask {
        core,
        status,
        outbound,
        catchup,
    };
    let mut stop = shutdown.clone();
    let engine = tokio::spawn(async move {
        task.core.start(now_ms());
        task.flush();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                input = rx.recv() => match input {
                    Some(input) => task.handle(input),
                    None => break,
                },
            }
        }
        info!("consensus engine stopped at height {}", task.core.height());
    });

    let mut stop = shutdown;
    let tick_ms = cfg.tick_ms.max(1);
    let timer = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = interval.tick() => {
                    // a full inbox already keeps the engine busy; skip this tick
                    let _ = tx.try_send(EngineInput::Tick);
                }
            }
        }
    });

    (handle, vec![engine, timer])
}
