// src/sync.rs
// QC-driven catchup: ask peers for their finalized tip, pick the highest one
// backed by a valid QC, then fetch and apply the missing blocks in order.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::bft::qc::{compare_tip, verify_structure, TipPosition};
use crate::bft::{Block, ChainRecord, EngineHandle, QuorumCertificate, ValidatorSet};
use crate::error::P2pError;
use crate::network::envelope::{BlockReqPayload, MsgType, SyncReqPayload, SyncRespPayload};
use crate::network::{Broadcaster, PeerStore};
use crate::now_ms;

/// Tip a peer reports in its SYNC_REQ answer.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerTip {
    pub finalized_height: u64,
    #[serde(default)]
    pub round: u64,
    #[serde(default)]
    pub last_qc: Option<QuorumCertificate>,
}

#[derive(Debug, Deserialize)]
struct BlockReply {
    block: Block,
    qc: QuorumCertificate,
}

/// Check a peer tip without touching local state.
pub fn validate_tip(
    tip: &PeerTip,
    validators: &ValidatorSet,
    local: Option<&QuorumCertificate>,
) -> Result<Option<QuorumCertificate>, P2pError> {
    let qc = match &tip.last_qc {
        Some(qc) => qc,
        None if tip.finalized_height == 0 => return Ok(None),
        None => return Err(P2pError::Malformed("finalized_height without last_qc".into())),
    };
    verify_structure(qc, validators)?;
    if qc.height != tip.finalized_height {
        return Err(P2pError::Malformed(format!(
            "QC height {} does not match finalized_height {}",
            qc.height, tip.finalized_height
        )));
    }
    match compare_tip(qc, local)? {
        TipPosition::Ahead => Ok(Some(qc.clone())),
        TipPosition::Same => Ok(None),
    }
}

pub struct CatchupService {
    broadcaster: Arc<Broadcaster>,
    peers: Arc<PeerStore>,
    engine: EngineHandle,
    validators: ValidatorSet,
}

impl CatchupService {
    pub fn new(
        broadcaster: Arc<Broadcaster>,
        peers: Arc<PeerStore>,
        engine: EngineHandle,
        validators: ValidatorSet,
    ) -> Arc<Self> {
        Arc::new(Self {
            broadcaster,
            peers,
            engine,
            validators,
        })
    }

    async fn sync_req(&self, base_url: &str, local_fh: u64) -> Result<PeerTip> {
        let now = now_ms();
        let req = SyncReqPayload {
            msg_id: uuid::Uuid::new_v4().to_string(),
            finalized_height: local_fh,
            ts_ms: now,
            sig_hex: String::new(),
        };
        let env = self.broadcaster.identity().seal(
            self.broadcaster.keystore(),
            MsgType::SyncReq,
            &req,
            now,
        )?;
        let reply = self
            .broadcaster
            .transport()
            .post_json(base_url, MsgType::SyncReq.path(), &serde_json::to_value(&env)?)
            .await?;
        if !reply.is_success() {
            bail!("SYNC_REQ answered {}: {}", reply.status, reply.body);
        }
        let payload = reply
            .body
            .get("payload")
            .cloned()
            .ok_or_else(|| anyhow!("SYNC_REQ reply without payload"))?;
        serde_json::from_value(payload).context("decode SYNC_REQ reply")
    }

    async fn block_req(&self, base_url: &str, height: u64) -> Result<ChainRecord> {
        let now = now_ms();
        let req = BlockReqPayload {
            height,
            msg_id: uuid::Uuid::new_v4().to_string(),
            ts_ms: now,
            sig_hex: String::new(),
        };
        let env = self.broadcaster.identity().seal(
            self.broadcaster.keystore(),
            MsgType::BlockReq,
            &req,
            now,
        )?;
        let reply = self
            .broadcaster
            .transport()
            .post_json(base_url, MsgType::BlockReq.path(), &serde_json::to_value(&env)?)
            .await?;
        if !reply.is_success() {
            bail!("BLOCK_REQ {} answered {}: {}", height, reply.status, reply.body);
        }
        let decoded: BlockReply =
            serde_json::from_value(reply.body).context("decode BLOCK_REQ reply")?;
        if decoded.qc.height != height || decoded.block.height != height {
            bail!("BLOCK_REQ {} returned height {}", height, decoded.qc.height);
        }
        Ok(ChainRecord {
            block: decoded.block,
            qc: decoded.qc,
        })
    }

    /// Tell a lagging peer about our tip.
    async fn announce_tip(&self, base_url: &str) -> Result<()> {
        let snap = self.engine.snapshot();
        let now = now_ms();
        let payload = SyncRespPayload {
            finalized_height: snap.finalized_height,
            round: snap.round,
            last_qc: snap.last_qc,
            ts_ms: now,
            sig_hex: String::new(),
        };
        let env = self.broadcaster.identity().seal(
            self.broadcaster.keystore(),
            MsgType::SyncResp,
            &payload,
            now,
        )?;
        self.broadcaster
            .transport()
            .post_json(base_url, MsgType::SyncResp.path(), &serde_json::to_value(&env)?)
            .await?;
        Ok(())
    }

    /// One catchup pass. Returns how many blocks were applied.
    pub async fn run_once(&self) -> Result<u64> {
        let targets = self.peers.targets();
        if targets.is_empty() {
            return Ok(0);
        }
        let snap = self.engine.snapshot();
        let local_fh = snap.finalized_height;
        let replies = futures::future::join_all(
            targets.iter().map(|url| self.sync_req(url, local_fh)),
        )
        .await;

        // (height, round, url) of every peer validly ahead of us
        let mut ahead: Vec<(u64, u64, String)> = Vec::new();
        for (url, reply) in targets.iter().zip(replies) {
            let tip = match reply {
                Ok(tip) => tip,
                Err(e) => {
                    debug!("SYNC_REQ to {} failed: {:#}", url, e);
                    continue;
                }
            };
            if tip.finalized_height < local_fh {
                if let Err(e) = self.announce_tip(url).await {
                    debug!("tip announcement to {} failed: {:#}", url, e);
                }
                continue;
            }
            match validate_tip(&tip, &self.validators, snap.last_qc.as_ref()) {
                Ok(Some(qc)) => ahead.push((qc.height, qc.round, url.clone())),
                Ok(None) => {}
                Err(e) => warn!("ignoring tip from {}: {}", url, e),
            }
        }
        if ahead.is_empty() {
            return Ok(0);
        }
        ahead.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        let target = ahead[0].0;
        info!(
            "catching up from {} to {} via {} peer(s)",
            local_fh,
            target,
            ahead.len()
        );

        let mut applied = 0;
        for height in (local_fh + 1)..=target {
            let record = self.fetch(&ahead, height).await?;
            match self.engine.apply_synced(record).await {
                Ok(_) => applied += 1,
                // finalized locally in the meantime
                Err(P2pError::Stale(_)) => continue,
                Err(e) => bail!("applying synced height {}: {}", height, e),
            }
        }
        Ok(applied)
    }

    async fn fetch(&self, sources: &[(u64, u64, String)], height: u64) -> Result<ChainRecord> {
        let mut last_err = anyhow!("no peer has height {}", height);
        for (tip, _, url) in sources {
            if *tip < height {
                continue;
            }
            match self.block_req(url, height).await {
                Ok(record) => return Ok(record),
                Err(e) => {
                    debug!("BLOCK_REQ {} from {} failed: {:#}", height, url, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

/// Run catchup at startup, every `every`, and whenever `trigger` fires.
pub fn spawn_catchup_loop(
    service: Arc<CatchupService>,
    every: Duration,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
                _ = trigger.notified() => {}
            }
            match service.run_once().await {
                Ok(0) => {}
                Ok(n) => info!("catchup applied {} block(s)", n),
                Err(e) => warn!("catchup pass failed: {:#}", e),
            }
        }
    })
}
