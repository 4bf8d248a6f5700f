// src/node_identity.rs
use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::storage::write_atomic;

/// Persisted identity of this node: which key it signs with and what it
/// announces in HELLO.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,

    #[serde(default)]
    pub val_id: Option<String>,

    pub base_url: String,

    pub pubkey_hex: String,

    /// Timestamp when the node first started with this state directory
    pub first_started: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_started: Option<String>,
}

/// Node id used when none is configured.
pub fn default_node_id(pubkey_hex: &str) -> String {
    format!("n-{}", &pubkey_hex[..pubkey_hex.len().min(16)])
}

impl NodeIdentity {
    /// Load the identity file, or create it on first start. The key a node
    /// announced before cannot silently change: peers have pinned it.
    pub fn load_or_create(
        path: &Path,
        node_id: Option<&str>,
        val_id: Option<&str>,
        base_url: &str,
        pubkey_hex: &str,
    ) -> Result<Self> {
        let now = Utc::now().to_rfc3339();
        let identity = if path.exists() {
            let json = fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            let mut identity: NodeIdentity = serde_json::from_str(&json)
                .with_context(|| format!("decode {}", path.display()))?;
            if identity.pubkey_hex != pubkey_hex {
                bail!(
                    "{} is bound to key {} but the node key is {}; remove it to rotate keys",
                    path.display(),
                    identity.pubkey_hex,
                    pubkey_hex
                );
            }
            if let Some(configured) = node_id {
                if configured != identity.node_id {
                    log::warn!(
                        "NODE_ID {} replaces stored node id {}",
                        configured,
                        identity.node_id
                    );
                    identity.node_id = configured.to_string();
                }
            }
            identity.val_id = val_id.map(str::to_string);
            identity.base_url = base_url.to_string();
            identity.last_started = Some(now);
            identity
        } else {
            NodeIdentity {
                node_id: node_id
                    .map(str::to_string)
                    .unwrap_or_else(|| default_node_id(pubkey_hex)),
                val_id: val_id.map(str::to_string),
                base_url: base_url.to_string(),
                pubkey_hex: pubkey_hex.to_string(),
                first_started: now.clone(),
                last_started: Some(now),
            }
        };
        identity.save(path)?;
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)
    }
}
