// src/network/peer_store.rs
// Authenticated peer records. Concurrent map; each record is updated under
// its shard lock only.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::envelope::HelloPayload;
use crate::bft::ValidatorSet;
use crate::error::P2pError;
use crate::storage::write_atomic;

pub const MAX_KNOWN_PEERS: usize = 1024;
/// Key prefix for bootstrap entries whose node id is not known yet.
const URL_KEY_PREFIX: &str = "url:";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub node_id: String,
    #[serde(default)]
    pub val_id: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub pubkey_hex: Option<String>,
    #[serde(default)]
    pub hello_ok: bool,
    #[serde(default)]
    pub last_seen_ms: u64,
}

impl PeerRecord {
    fn unbound(node_id: &str) -> Self {
        PeerRecord {
            node_id: node_id.to_string(),
            val_id: None,
            base_url: None,
            pubkey_hex: None,
            hello_ok: false,
            last_seen_ms: 0,
        }
    }
}

/// One entry of `P2P_PEERS_JSON`: either a bare base URL or an object.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BootstrapPeer {
    Url(String),
    Entry {
        #[serde(default)]
        node_id: Option<String>,
        base_url: String,
        #[serde(default)]
        pubkey_hex: Option<String>,
    },
}

impl BootstrapPeer {
    pub fn parse_list(json: &str) -> Result<Vec<BootstrapPeer>> {
        serde_json::from_str(json).context("P2P_PEERS_JSON must be a JSON array")
    }

    pub fn base_url(&self) -> &str {
        match self {
            BootstrapPeer::Url(u) => u,
            BootstrapPeer::Entry { base_url, .. } => base_url,
        }
    }
}

pub struct PeerStore {
    peers: DashMap<String, PeerRecord>,
    self_node_id: String,
    self_base_url: String,
    path: Option<PathBuf>,
}

impl PeerStore {
    pub fn new(self_node_id: &str, self_base_url: &str, path: Option<PathBuf>) -> Self {
        Self {
            peers: DashMap::new(),
            self_node_id: self_node_id.to_string(),
            self_base_url: self_base_url.trim_end_matches('/').to_string(),
            path,
        }
    }

    pub fn seed(&self, bootstrap: &[BootstrapPeer]) {
        for peer in bootstrap {
            let url = peer.base_url().trim_end_matches('/').to_string();
            if url.is_empty() || url == self.self_base_url {
                continue;
            }
            let (key, pubkey) = match peer {
                BootstrapPeer::Entry {
                    node_id: Some(id),
                    pubkey_hex,
                    ..
                } => (id.clone(), pubkey_hex.clone()),
                BootstrapPeer::Entry { pubkey_hex, .. } => {
                    (format!("{}{}", URL_KEY_PREFIX, url), pubkey_hex.clone())
                }
                BootstrapPeer::Url(_) => (format!("{}{}", URL_KEY_PREFIX, url), None),
            };
            if key == self.self_node_id {
                continue;
            }
            let mut rec = self
                .peers
                .entry(key.clone())
                .or_insert_with(|| PeerRecord::unbound(&key));
            rec.base_url = Some(url);
            if pubkey.is_some() {
                rec.pubkey_hex = pubkey;
            }
        }
    }

    /// Restore persisted records. HELLO bindings do not survive a restart.
    pub fn load(&self) -> Result<usize> {
        let path = match &self.path {
            Some(p) if p.exists() => p,
            _ => return Ok(0),
        };
        let raw = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let records: Vec<PeerRecord> = serde_json::from_slice(&raw)
            .with_context(|| format!("decode {}", path.display()))?;
        let mut n = 0;
        for mut rec in records {
            if rec.node_id == self.self_node_id {
                continue;
            }
            rec.hello_ok = false;
            self.peers.insert(rec.node_id.clone(), rec);
            n += 1;
        }
        Ok(n)
    }

    pub fn save(&self) -> Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        let json = serde_json::to_vec_pretty(&self.list())?;
        write_atomic(path, &json)
    }

    pub fn get(&self, node_id: &str) -> Option<PeerRecord> {
        self.peers.get(node_id).map(|r| r.clone())
    }

    /// Note inbound traffic, creating an unbound record on first contact.
    pub fn touch(&self, node_id: &str, now_ms: u64) {
        if node_id == self.self_node_id {
            return;
        }
        if let Some(mut rec) = self.peers.get_mut(node_id) {
            rec.last_seen_ms = now_ms;
            return;
        }
        if self.peers.len() < MAX_KNOWN_PEERS {
            let mut rec = PeerRecord::unbound(node_id);
            rec.last_seen_ms = now_ms;
            self.peers.entry(node_id.to_string()).or_insert(rec);
        }
    }

    /// Apply a HELLO whose signature has already been verified.
    pub fn bind_hello(
        &self,
        hello: &HelloPayload,
        validators: &ValidatorSet,
        now_ms: u64,
    ) -> Result<(), P2pError> {
        if hello.node_id == self.self_node_id {
            return Err(P2pError::AuthFailed("HELLO claims our own node id".into()));
        }
        if let Some(val_id) = &hello.val_id {
            if !validators.contains(val_id) {
                return Err(P2pError::AuthFailed(format!("{} is not a validator", val_id)));
            }
        }
        if let Some(existing) = self.peers.get(&hello.node_id) {
            if let Some(pinned) = &existing.pubkey_hex {
                if pinned != &hello.pubkey_hex {
                    log::warn!("HELLO for {} with a different key rejected", hello.node_id);
                    return Err(P2pError::AuthFailed(format!(
                        "node {} is bound to another key",
                        hello.node_id
                    )));
                }
            }
        }
        if let Some(val_id) = &hello.val_id {
            let clash = self.peers.iter().any(|r| {
                r.node_id != hello.node_id
                    && r.hello_ok
                    && r.val_id.as_deref() == Some(val_id.as_str())
                    && r.pubkey_hex.as_deref() != Some(hello.pubkey_hex.as_str())
            });
            if clash {
                log::warn!("HELLO from {} claims validator {} bound elsewhere", hello.node_id, val_id);
                return Err(P2pError::AuthFailed(format!(
                    "validator {} is bound to another node",
                    val_id
                )));
            }
        }

        let base_url = hello.base_url.trim_end_matches('/').to_string();
        self.peers
            .retain(|key, rec| !(key.starts_with(URL_KEY_PREFIX) && rec.base_url.as_deref() == Some(base_url.as_str())));
        let mut rec = self
            .peers
            .entry(hello.node_id.clone())
            .or_insert_with(|| PeerRecord::unbound(&hello.node_id));
        rec.val_id = hello.val_id.clone();
        rec.base_url = Some(base_url);
        rec.pubkey_hex = Some(hello.pubkey_hex.clone());
        rec.hello_ok = true;
        rec.last_seen_ms = now_ms;
        drop(rec);

        if let Err(e) = self.save() {
            log::warn!("failed to persist peers: {}", e);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self.peers.iter().map(|r| r.clone()).collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    /// Distinct base URLs to broadcast to, excluding ourselves.
    pub fn targets(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .peers
            .iter()
            .filter_map(|r| r.base_url.clone())
            .filter(|u| *u != self.self_base_url)
            .collect();
        urls.sort();
        urls.dedup();
        urls
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
