// tests/common/mod.rs
// Shared helpers: deterministic keys, signed envelopes, router calls and an
// in-process transport that routes peer requests to other nodes' routers.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

use glyphchain::config::NodeConfig;
use glyphchain::crypto::Keystore;
use glyphchain::network::envelope::{Envelope, LocalIdentity, MsgType};
use glyphchain::network::handshake::build_hello;
use glyphchain::network::{PeerReply, PeerTransport};
use glyphchain::now_ms;

pub const CHAIN_ID: &str = "glyph-test";

/// Routes `post_json` to attached routers; detached nodes are unreachable.
#[derive(Default)]
pub struct LoopbackNet {
    routers: DashMap<String, parking_lot::Mutex<Router>>,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, base_url: &str, router: Router) {
        self.routers
            .insert(base_url.to_string(), parking_lot::Mutex::new(router));
    }

    pub fn detach(&self, base_url: &str) {
        self.routers.remove(base_url);
    }
}

#[async_trait]
impl PeerTransport for LoopbackNet {
    async fn post_json(&self, base_url: &str, path: &str, body: &Value) -> Result<PeerReply> {
        let router = self
            .routers
            .get(base_url)
            .map(|r| r.value().lock().clone())
            .ok_or_else(|| anyhow!("{} unreachable", base_url))?;
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body)?))?;
        let resp = router.oneshot(req).await?;
        let status = resp.status().as_u16();
        let bytes = hyper::body::to_bytes(resp.into_body()).await?;
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Ok(PeerReply { status, body })
    }
}

pub fn keystore(seed: u8) -> Keystore {
    Keystore::from_hex(&hex::encode([seed; 32])).unwrap()
}

/// A test-side peer acting as validator `val{i}`.
pub struct TestPeer {
    pub ident: LocalIdentity,
    pub key: Keystore,
}

impl TestPeer {
    pub fn new(i: u8) -> Self {
        TestPeer {
            ident: LocalIdentity {
                chain_id: CHAIN_ID.into(),
                node_id: format!("t{}", i),
                val_id: Some(format!("val{}", i)),
                base_url: format!("http://t{}.test", i),
            },
            key: keystore(100 + i),
        }
    }

    pub fn hello(&self) -> Envelope {
        build_hello(&self.ident, &self.key, now_ms())
    }

    pub fn seal<T: Serialize>(&self, msg_type: MsgType, payload: &T) -> Envelope {
        self.ident.seal(&self.key, msg_type, payload, now_ms()).unwrap()
    }
}

pub async fn post<T: Serialize>(router: &Router, path: &str, body: &T) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    read(router.clone().oneshot(req).await.unwrap()).await
}

pub async fn post_raw(router: &Router, path: &str, body: &'static str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    read(router.clone().oneshot(req).await.unwrap()).await
}

pub async fn get(router: &Router, path: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    read(router.clone().oneshot(req).await.unwrap()).await
}

async fn read(resp: axum::response::Response) -> (StatusCode, Value) {
    let status = resp.status();
    let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

/// Config for `val{i}` built through the same path as the binary.
pub fn node_config(
    i: u8,
    validators: &str,
    peers_json: &str,
    state_dir: &Path,
    extra: &[(&str, &str)],
) -> NodeConfig {
    let mut env: HashMap<String, String> = HashMap::new();
    let base = [
        ("CHAIN_ID", CHAIN_ID.to_string()),
        ("VALIDATORS", validators.to_string()),
        ("SELF_VAL_ID", format!("val{}", i)),
        ("NODE_ID", format!("node{}", i)),
        ("BASE_URL", format!("http://node{}.test", i)),
        ("P2P_PRIVKEY_HEX", hex::encode([i; 32])),
        ("P2P_PEERS_JSON", peers_json.to_string()),
        ("STATE_DIR", state_dir.display().to_string()),
        ("CONSENSUS_TICK_MS", "10".to_string()),
        ("CONSENSUS_ROUND_TIMEOUT_MS", "400".to_string()),
        ("CONSENSUS_SYNC_EVERY_MS", "100".to_string()),
        ("P2P_HTTP_TIMEOUT_MS", "2000".to_string()),
    ];
    for (k, v) in base {
        env.insert(k.to_string(), v);
    }
    for (k, v) in extra {
        env.insert(k.to_string(), v.to_string());
    }
    NodeConfig::from_lookup(|k| env.get(k).cloned()).unwrap().0
}

pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut f: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    f()
}
