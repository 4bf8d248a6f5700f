// src/network/api.rs
// HTTP surface of the P2P layer. Every POST endpoint runs the same pipeline:
// parse -> authenticate -> lane (dedup, rate, queue) -> handler.

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;

use super::auth::{authenticate, require_author, AuthPolicy};
use super::envelope::{
    BlockReqPayload, Envelope, LocalIdentity, MsgType, StatusReqPayload, SyncReqPayload,
    SyncRespPayload,
};
use super::handshake::accept_hello;
use super::ingress::{DropPolicy, IngressLanes, LaneOutcome};
use super::peer_store::{PeerRecord, PeerStore};
use crate::bft::{Admission, EngineHandle, FinalizedChain, Proposal, ValidatorSet, Vote};
use crate::error::P2pError;
use crate::now_ms;
use crate::sync::{validate_tip, PeerTip};

/// Shared state handed to every handler.
pub struct P2pContext {
    pub identity: LocalIdentity,
    pub validators: ValidatorSet,
    pub peers: Arc<PeerStore>,
    pub lanes: IngressLanes,
    pub auth: AuthPolicy,
    pub engine: EngineHandle,
    pub chain: Arc<FinalizedChain>,
    pub catchup: Arc<Notify>,
}

pub fn router(ctx: Arc<P2pContext>) -> Router {
    Router::new()
        .route("/p2p/hello", post(hello))
        .route("/p2p/peers", get(list_peers))
        .route("/p2p/proposal", post(proposal))
        .route("/p2p/vote", post(vote))
        .route("/p2p/sync_req", post(sync_req))
        .route("/p2p/sync_resp", post(sync_resp))
        .route("/p2p/block_req", post(block_req))
        .route("/p2p/status", post(status))
        .route("/p2p/consensus_status", get(consensus_status))
        .layer(Extension(ctx))
}

fn lane_response(policy: DropPolicy, msg_type: MsgType, outcome: LaneOutcome) -> Response {
    match outcome {
        LaneOutcome::Done(body) => Json(body).into_response(),
        LaneOutcome::Duplicate(cached) => {
            let mut body = json!({"ok": true, "accepted": false, "dedup": true});
            if let Some(payload) = cached.as_ref().and_then(|c| c.get("payload")) {
                body["payload"] = payload.clone();
            }
            Json(body).into_response()
        }
        LaneOutcome::Full => refuse(policy, format!("{} lane full", msg_type)),
        LaneOutcome::RateLimited => refuse(policy, format!("{} rate limit exceeded", msg_type)),
    }
}

fn refuse(policy: DropPolicy, reason: String) -> Response {
    match policy {
        DropPolicy::Reject429 => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"ok": false, "error": "busy", "detail": reason})),
        )
            .into_response(),
        DropPolicy::DropNew => P2pError::Busy(reason).into_response(),
    }
}

async fn ingest<F, Fut>(ctx: &P2pContext, msg_type: MsgType, body: &[u8], handler: F) -> Response
where
    F: FnOnce(Envelope, Option<PeerRecord>) -> Fut,
    Fut: Future<Output = Result<Value, P2pError>>,
{
    let now = now_ms();
    let env = match Envelope::parse(body, msg_type) {
        Ok(env) => env,
        Err(e) => return e.into_response(),
    };
    let peer = if msg_type == MsgType::Hello {
        None
    } else {
        match authenticate(&env, &ctx.auth, &ctx.peers, now) {
            Ok(peer) => peer,
            Err(e) => {
                log::debug!("{} from {} rejected: {}", msg_type, env.from_node_id, e);
                return e.into_response();
            }
        }
    };
    let owned = env.clone();
    match ctx
        .lanes
        .process(&env, now, move || handler(owned, peer))
        .await
    {
        Ok(outcome) => lane_response(ctx.lanes.drop_policy, msg_type, outcome),
        Err(e) => e.into_response(),
    }
}

fn admission_body(admission: Admission) -> Value {
    match admission {
        Admission::Accepted => json!({"ok": true, "accepted": true}),
        Admission::Buffered => json!({"ok": true, "accepted": true, "buffered": true}),
        Admission::Duplicate => json!({"ok": true, "accepted": false, "duplicate": true}),
    }
}

async fn hello(Extension(ctx): Extension<Arc<P2pContext>>, body: Bytes) -> Response {
    let c = ctx.clone();
    ingest(&ctx, MsgType::Hello, &body, |env, _| async move {
        accept_hello(&env, &c.identity.chain_id, &c.peers, &c.validators, now_ms())?;
        Ok(json!({
            "ok": true,
            "accepted": true,
            "node_id": c.identity.node_id,
            "val_id": c.identity.val_id,
        }))
    })
    .await
}

async fn list_peers(Extension(ctx): Extension<Arc<P2pContext>>) -> Json<Value> {
    Json(json!({"ok": true, "peers": ctx.peers.list()}))
}

async fn proposal(Extension(ctx): Extension<Arc<P2pContext>>, body: Bytes) -> Response {
    let c = ctx.clone();
    ingest(&ctx, MsgType::Proposal, &body, |env, peer| async move {
        let p: Proposal = env.decode_payload()?;
        require_author(peer.as_ref(), &p.proposer)?;
        let admission = c.engine.submit_proposal(p).await?;
        Ok(admission_body(admission))
    })
    .await
}

async fn vote(Extension(ctx): Extension<Arc<P2pContext>>, body: Bytes) -> Response {
    let c = ctx.clone();
    ingest(&ctx, MsgType::Vote, &body, |env, peer| async move {
        let v: Vote = env.decode_payload()?;
        require_author(peer.as_ref(), &v.voter)?;
        let admission = c.engine.submit_vote(v).await?;
        Ok(admission_body(admission))
    })
    .await
}

async fn sync_req(Extension(ctx): Extension<Arc<P2pContext>>, body: Bytes) -> Response {
    let c = ctx.clone();
    ingest(&ctx, MsgType::SyncReq, &body, |env, _| async move {
        let req: SyncReqPayload = env.decode_payload()?;
        let snap = c.engine.snapshot();
        if req.finalized_height > snap.finalized_height {
            c.catchup.notify_one();
        }
        Ok(json!({
            "ok": true,
            "payload": {
                "finalized_height": snap.finalized_height,
                "round": snap.round,
                "last_qc": snap.last_qc,
            }
        }))
    })
    .await
}

async fn sync_resp(Extension(ctx): Extension<Arc<P2pContext>>, body: Bytes) -> Response {
    let c = ctx.clone();
    ingest(&ctx, MsgType::SyncResp, &body, |env, _| async move {
        let resp: SyncRespPayload = env.decode_payload()?;
        let tip = PeerTip {
            finalized_height: resp.finalized_height,
            round: resp.round,
            last_qc: resp.last_qc,
        };
        let local = c.engine.snapshot().last_qc;
        match validate_tip(&tip, &c.validators, local.as_ref())? {
            Some(qc) => {
                log::info!(
                    "peer {} advertises finalized height {}; catching up",
                    env.from_node_id,
                    qc.height
                );
                c.catchup.notify_one();
                Ok(json!({"ok": true, "accepted": true, "applied": true}))
            }
            None => Ok(json!({"ok": true, "accepted": true, "applied": false})),
        }
    })
    .await
}

async fn block_req(Extension(ctx): Extension<Arc<P2pContext>>, body: Bytes) -> Response {
    let c = ctx.clone();
    ingest(&ctx, MsgType::BlockReq, &body, |env, _| async move {
        let req: BlockReqPayload = env.decode_payload()?;
        let record = c
            .chain
            .get(req.height)
            .ok_or_else(|| P2pError::NotFound(format!("no finalized block at {}", req.height)))?;
        Ok(json!({
            "ok": true,
            "height": record.height(),
            "header": {
                "height": record.block.height,
                "block_id": record.qc.block_id,
                "parent_id": record.block.parent_id,
                "proposer_val_id": record.block.proposer_val_id,
            },
            "block": record.block,
            "qc": record.qc,
        }))
    })
    .await
}

async fn status(Extension(ctx): Extension<Arc<P2pContext>>, body: Bytes) -> Response {
    let c = ctx.clone();
    ingest(&ctx, MsgType::Status, &body, |env, _| async move {
        let _req: StatusReqPayload = env.decode_payload()?;
        let mut payload = serde_json::to_value(c.engine.snapshot())
            .map_err(|e| P2pError::Malformed(e.to_string()))?;
        payload["node_id"] = json!(c.identity.node_id);
        payload["chain_id"] = json!(c.identity.chain_id);
        Ok(json!({"ok": true, "payload": payload}))
    })
    .await
}

async fn consensus_status(Extension(ctx): Extension<Arc<P2pContext>>) -> Json<Value> {
    let mut body = serde_json::to_value(ctx.engine.snapshot()).unwrap_or_else(|_| json!({}));
    body["ok"] = json!(true);
    body["node_id"] = json!(ctx.identity.node_id);
    body["peers"] = json!(ctx.peers.len());
    body["p2p_ingress"] = ctx.lanes.status();
    Json(body)
}
