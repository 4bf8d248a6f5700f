// tests/p2p_ingress.rs
// One node (val4) driven through its HTTP router by test peers acting as
// val1..val3.
mod common;

use axum::http::StatusCode;
use axum::Router;
use serde_json::Value;
use std::time::Duration;
use tempfile::TempDir;

use common::*;
use glyphchain::bft::block::canonical_block_id;
use glyphchain::bft::qc::form_qc;
use glyphchain::bft::{Block, Proposal, Vote, VoteType};
use glyphchain::network::envelope::{
    BlockReqPayload, MsgType, StatusReqPayload, SyncReqPayload, SyncRespPayload,
};
use glyphchain::node::Node;

const VALIDATORS: &str = "val1,val2,val3,val4";

struct Harness {
    node: Node,
    router: Router,
    peers: Vec<TestPeer>,
    _dir: TempDir,
}

async fn harness(extra: &[(&str, &str)], say_hello: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut env = vec![("CONSENSUS_ROUND_TIMEOUT_MS", "600000")];
    env.extend_from_slice(extra);
    let cfg = node_config(4, VALIDATORS, "[]", dir.path(), &env);
    let net = LoopbackNet::new();
    let node = Node::start(cfg, net).await.unwrap();
    let router = node.router();
    let peers: Vec<TestPeer> = (1..=3).map(TestPeer::new).collect();
    if say_hello {
        for p in &peers {
            let (status, body) = post(&router, "/p2p/hello", &p.hello()).await;
            assert_eq!(status, StatusCode::OK, "{}", body);
            assert_eq!(body["ok"], true);
        }
    }
    Harness {
        node,
        router,
        peers,
        _dir: dir,
    }
}

fn proposal(h: u64, r: u64, proposer: &str, parent: &str, ts: u64) -> Proposal {
    Proposal {
        height: h,
        round: r,
        proposer: proposer.into(),
        block_id: canonical_block_id(h, r, proposer),
        block: Block::new(h, r, proposer, parent, ts),
        ts_ms: ts,
        sig_hex: String::new(),
    }
}

fn vote(h: u64, r: u64, voter: &str, vote_type: VoteType, block_id: &str) -> Vote {
    Vote {
        height: h,
        round: r,
        voter: voter.into(),
        vote_type,
        block_id: block_id.into(),
        ts_ms: glyphchain::now_ms(),
        sig_hex: String::new(),
    }
}

impl Harness {
    async fn send_vote(&self, peer: usize, v: &Vote) -> (StatusCode, Value) {
        let env = self.peers[peer].seal(MsgType::Vote, v);
        post(&self.router, "/p2p/vote", &env).await
    }

    async fn send_proposal(&self, peer: usize, p: &Proposal) -> (StatusCode, Value) {
        let env = self.peers[peer].seal(MsgType::Proposal, p);
        post(&self.router, "/p2p/proposal", &env).await
    }

    async fn status(&self) -> Value {
        get(&self.router, "/p2p/consensus_status").await.1
    }

    /// Finalize `height` (round 0, led by a test peer). With `delayed`, the
    /// precommits arrive before any peer prevote.
    async fn finalize(&self, height: u64, parent: &str, delayed: bool) -> String {
        let leader = ((height - 1) % 4) as usize;
        assert!(leader < 3, "height {} is led by the node itself", height);
        let p = proposal(height, 0, &format!("val{}", leader + 1), parent, 1_000 + height);
        let (status, body) = self.send_proposal(leader, &p).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["accepted"], true);

        if !delayed {
            for i in 0..2 {
                let v = vote(height, 0, &format!("val{}", i + 1), VoteType::Prevote, &p.block_id);
                let (status, body) = self.send_vote(i, &v).await;
                assert_eq!(status, StatusCode::OK, "{}", body);
            }
            let snap = self.status().await;
            assert_eq!(snap["lock"]["block_id"], p.block_id.as_str());
            assert_eq!(snap["step"], "Precommit");
        }
        let voters = if delayed { 3 } else { 2 };
        for i in 0..voters {
            let v = vote(height, 0, &format!("val{}", i + 1), VoteType::Precommit, &p.block_id);
            let (status, body) = self.send_vote(i, &v).await;
            assert_eq!(status, StatusCode::OK, "{}", body);
        }
        let snap = self.status().await;
        assert_eq!(snap["finalized_height"], height);
        assert_eq!(snap["last_qc"]["block_id"], p.block_id.as_str());
        p.block_id
    }

    async fn stop(self) {
        self.node.shutdown(Duration::from_secs(1)).await;
    }
}

#[tokio::test]
async fn competing_and_replayed_proposals() {
    let h = harness(&[], true).await;
    let a = proposal(1, 0, "val1", "genesis", 1_000);
    let env_a = h.peers[0].seal(MsgType::Proposal, &a);

    let (status, body) = post(&h.router, "/p2p/proposal", &env_a).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);

    let (status, body) = post(&h.router, "/p2p/proposal", &env_a).await;
    assert_eq!(status, StatusCode::OK, "replay must not be an error");
    assert_eq!(body["accepted"], false);

    // a different block for (1, 0) from a validator that does not lead it
    let b = proposal(1, 0, "val2", "genesis", 1_000);
    let (status, body) = h.send_proposal(1, &b).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
    assert_eq!(body["ok"], false);

    let mut forged_id = proposal(1, 0, "val1", "genesis", 1_500);
    forged_id.block_id = "h1-r0-Pval1-alt".into();
    let (status, _) = h.send_proposal(0, &forged_id).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // the leader's block must extend the finalized tip
    let detached = proposal(1, 0, "val1", "h7-r0-Pval3", 1_700);
    let (status, body) = h.send_proposal(0, &detached).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
    assert_eq!(body["ok"], false);

    // a second body for the same canonical block: the lowest fingerprint wins
    let variant = proposal(1, 0, "val1", "genesis", 2_000);
    let (status, body) = h.send_proposal(0, &variant).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let expected = std::cmp::min(a.fingerprint(CHAIN_ID), variant.fingerprint(CHAIN_ID));
    let snap = h.status().await;
    assert_eq!(snap["proposal_fp"], expected.as_str());
    assert_eq!(snap["proposal_block_id"], "h1-r0-Pval1");
    assert_eq!(snap["have_proposal"], true);
    h.stop().await;
}

#[tokio::test]
async fn finalizes_and_serves_blocks() {
    let h = harness(&[], true).await;
    let b1 = h.finalize(1, "genesis", false).await;
    assert_eq!(b1, "h1-r0-Pval1");

    // precommits ahead of prevotes still finalize
    let b2 = h.finalize(2, &b1, true).await;
    let snap = h.status().await;
    assert_eq!(snap["height"], 3);
    assert_eq!(snap["round"], 0);
    assert!(snap["lock"].is_null());

    let req = BlockReqPayload {
        height: 2,
        msg_id: "b-2".into(),
        ts_ms: 1,
        sig_hex: String::new(),
    };
    let (status, body) = post(&h.router, "/p2p/block_req", &h.peers[0].seal(MsgType::BlockReq, &req)).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["height"], 2);
    assert_eq!(body["qc"]["block_id"], b2.as_str());
    assert_eq!(body["block"]["parent_id"], b1.as_str());
    assert_eq!(body["header"]["block_id"], b2.as_str());

    let missing = BlockReqPayload {
        height: 99,
        msg_id: "b-99".into(),
        ts_ms: 1,
        sig_hex: String::new(),
    };
    let (status, body) =
        post(&h.router, "/p2p/block_req", &h.peers[0].seal(MsgType::BlockReq, &missing)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let sync = SyncReqPayload {
        msg_id: "s-1".into(),
        finalized_height: 0,
        ts_ms: 1,
        sig_hex: String::new(),
    };
    let (status, body) = post(&h.router, "/p2p/sync_req", &h.peers[1].seal(MsgType::SyncReq, &sync)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["payload"]["finalized_height"], 2);
    assert_eq!(body["payload"]["last_qc"]["block_id"], b2.as_str());

    // votes for finalized heights are stale, not errors
    let late = vote(1, 0, "val3", VoteType::Precommit, &b1);
    let (status, body) = h.send_vote(2, &late).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stale"], true);
    h.stop().await;
}

fn sync_resp(h: u64, r: u64, voters: &[&str]) -> SyncRespPayload {
    let leader = format!("val{}", ((h - 1 + r) % 4) + 1);
    SyncRespPayload {
        finalized_height: h,
        round: r,
        last_qc: Some(form_qc(
            h,
            r,
            &canonical_block_id(h, r, &leader),
            voters.iter().map(|s| s.to_string()),
            1,
        )),
        ts_ms: glyphchain::now_ms(),
        sig_hex: String::new(),
    }
}

#[tokio::test]
async fn invalid_sync_resp_leaves_tip_untouched() {
    let h = harness(&[], true).await;
    let b1 = h.finalize(1, "genesis", false).await;
    h.finalize(2, &b1, false).await;
    let before = h.status().await;
    let quorum = ["val1", "val2", "val3"];

    let empty = sync_resp(5, 0, &[]);
    let mut wrong_height = sync_resp(5, 0, &quorum);
    wrong_height.finalized_height = 6;
    let regressing = sync_resp(1, 0, &quorum);
    let mut prevote_qc = sync_resp(5, 0, &quorum);
    if let Some(qc) = prevote_qc.last_qc.as_mut() {
        qc.vote_type = VoteType::Prevote;
    }
    let mut conflicting = sync_resp(2, 0, &quorum);
    if let Some(qc) = conflicting.last_qc.as_mut() {
        qc.round = 1;
        qc.block_id = canonical_block_id(2, 1, "val3");
    }

    for (i, bad) in [empty, wrong_height, regressing, prevote_qc, conflicting]
        .iter()
        .enumerate()
    {
        let env = h.peers[i % 3].seal(MsgType::SyncResp, bad);
        let (status, body) = post(&h.router, "/p2p/sync_resp", &env).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "case {}: {}", i, body);
    }
    let after = h.status().await;
    assert_eq!(after["finalized_height"], before["finalized_height"]);
    assert_eq!(after["last_qc"], before["last_qc"]);

    // our own tip: valid, nothing to apply
    let same: SyncRespPayload = SyncRespPayload {
        finalized_height: 2,
        round: 0,
        last_qc: serde_json::from_value(before["last_qc"].clone()).unwrap(),
        ts_ms: 7,
        sig_hex: String::new(),
    };
    let (status, body) = post(&h.router, "/p2p/sync_resp", &h.peers[0].seal(MsgType::SyncResp, &same)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], false);

    let ahead = sync_resp(7, 0, &quorum);
    let (status, body) = post(&h.router, "/p2p/sync_resp", &h.peers[1].seal(MsgType::SyncResp, &ahead)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], true);
    // no peer can serve the blocks, so the tip stays where it was
    assert_eq!(h.status().await["finalized_height"], 2);
    h.stop().await;
}

#[tokio::test]
async fn authentication_and_shape_failures() {
    let h = harness(&[], false).await;
    let block_id = "h1-r0-Pval1";
    let prevote = vote(1, 0, "val1", VoteType::Prevote, block_id);

    let (status, _) = h.send_vote(0, &prevote).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "VOTE before HELLO");

    let (status, _) = post(&h.router, "/p2p/hello", &h.peers[0].hello()).await;
    assert_eq!(status, StatusCode::OK);

    let impostor = TestPeer {
        ident: h.peers[0].ident.clone(),
        key: keystore(7),
    };
    let (status, _) = post(&h.router, "/p2p/vote", &impostor.seal(MsgType::Vote, &prevote)).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "wrong key");

    let (status, _) = post(&h.router, "/p2p/hello", &impostor.hello()).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "rebinding a pinned node id");

    let other = vote(1, 0, "val2", VoteType::Prevote, block_id);
    let (status, _) = h.send_vote(0, &other).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "voting as another validator");

    let mut other_chain = h.peers[0].seal(MsgType::Vote, &prevote);
    other_chain.chain_id = "another-chain".into();
    let (status, _) = post(&h.router, "/p2p/vote", &other_chain).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let mut unsigned = h.peers[0].seal(MsgType::Vote, &prevote);
    unsigned.payload.as_object_mut().unwrap().remove("sig_hex");
    let (status, _) = post(&h.router, "/p2p/vote", &unsigned).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = post_raw(&h.router, "/p2p/vote", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "malformed");

    let (status, _) = post(&h.router, "/p2p/vote", &h.peers[0].hello()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "HELLO sent to the VOTE endpoint");

    let wrong_leader = vote(1, 0, "val1", VoteType::Prevote, "h1-r0-Pval3");
    let (status, _) = h.send_vote(0, &wrong_leader).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = h.send_vote(0, &prevote).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["accepted"], true);

    // equivocation at (1, 1): the round's own block, then a carried-forward one
    let r1 = vote(1, 1, "val1", VoteType::Prevote, "h1-r1-Pval2");
    let (status, _) = h.send_vote(0, &r1).await;
    assert_eq!(status, StatusCode::OK);
    let r1_other = vote(1, 1, "val1", VoteType::Prevote, block_id);
    let (status, body) = h.send_vote(0, &r1_other).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "conflict");

    let (status, body) = get(&h.router, "/p2p/peers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["peers"][0]["node_id"], "t1");
    assert_eq!(body["peers"][0]["hello_ok"], true);
    h.stop().await;
}

#[tokio::test]
async fn status_replies_are_cached_per_msg_id() {
    let h = harness(&[], true).await;
    let req = StatusReqPayload {
        msg_id: "m-1".into(),
        ts_ms: 1,
        sig_hex: String::new(),
    };
    let (status, first) = post(&h.router, "/p2p/status", &h.peers[0].seal(MsgType::Status, &req)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["payload"]["node_id"], "node4");
    assert_eq!(first["payload"]["height"], 1);

    // same msg_id, different timestamp: served from the cache
    let again = StatusReqPayload { ts_ms: 2, ..req };
    let (status, second) = post(&h.router, "/p2p/status", &h.peers[0].seal(MsgType::Status, &again)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["dedup"], true);
    assert_eq!(second["payload"], first["payload"]);

    let snap = h.status().await;
    assert_eq!(snap["p2p_ingress"]["lanes"]["STATUS"]["counters"]["accepted"], 1);
    assert_eq!(snap["p2p_ingress"]["lanes"]["STATUS"]["counters"]["dropped_dup"], 1);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_vote_flood_is_absorbed() {
    let h = harness(&[("P2P_LANE_MAX_QUEUE_VOTE", "32")], true).await;
    let env = h.peers[0].seal(
        MsgType::Vote,
        &vote(1, 0, "val1", VoteType::Prevote, "h1-r0-Pval1"),
    );
    let calls = (0..1000).map(|_| post(&h.router, "/p2p/vote", &env));
    let results = futures::future::join_all(calls).await;
    assert!(results.iter().all(|(status, _)| *status == StatusCode::OK));

    let snap = h.status().await;
    let counters = &snap["p2p_ingress"]["lanes"]["VOTE"]["counters"];
    assert_eq!(counters["accepted"], 1);
    assert_eq!(counters["dropped_dup"], 999);
    assert_eq!(snap["p2p_ingress"]["lanes"]["VOTE"]["max_queue"], 32);

    // the flood did not cost the engine its progress
    assert_eq!(snap["finalized_height"], 0);
    let b1 = h.finalize(1, "genesis", false).await;
    let b2 = h.finalize(2, &b1, false).await;
    let snap = h.status().await;
    assert_eq!(snap["finalized_height"], 2);
    assert_eq!(snap["last_qc"]["block_id"], b2.as_str());
    h.stop().await;
}

#[tokio::test]
async fn full_lane_answers_busy_or_429() {
    let req = StatusReqPayload {
        msg_id: "m-busy".into(),
        ts_ms: 1,
        sig_hex: String::new(),
    };

    let h = harness(&[("P2P_LANE_MAX_QUEUE_STATUS", "0")], true).await;
    let (status, body) = post(&h.router, "/p2p/status", &h.peers[0].seal(MsgType::Status, &req)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], false);
    assert_eq!(body["busy"], true);
    let snap = h.status().await;
    assert_eq!(snap["p2p_ingress"]["lanes"]["STATUS"]["counters"]["dropped_full"], 1);
    h.stop().await;

    let h = harness(
        &[
            ("P2P_LANE_MAX_QUEUE_STATUS", "0"),
            ("P2P_LANE_DROP_POLICY", "reject_429"),
        ],
        true,
    )
    .await;
    let (status, _) = post(&h.router, "/p2p/status", &h.peers[0].seal(MsgType::Status, &req)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    h.stop().await;
}
