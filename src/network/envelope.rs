// src/network/envelope.rs
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::bft::qc::QuorumCertificate;
use crate::crypto::canonical::{canonical_json, sha256_hex, SIG_FIELD};
use crate::crypto::Keystore;
use crate::error::P2pError;

/// Relay depth beyond which an envelope is refused.
pub const MAX_HOPS: u32 = 8;
const MAX_FIELD_LEN: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgType {
    Hello,
    Proposal,
    Vote,
    SyncReq,
    SyncResp,
    BlockReq,
    Status,
}

impl MsgType {
    pub const ALL: [MsgType; 7] = [
        MsgType::Hello,
        MsgType::Proposal,
        MsgType::Vote,
        MsgType::SyncReq,
        MsgType::SyncResp,
        MsgType::BlockReq,
        MsgType::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Hello => "HELLO",
            MsgType::Proposal => "PROPOSAL",
            MsgType::Vote => "VOTE",
            MsgType::SyncReq => "SYNC_REQ",
            MsgType::SyncResp => "SYNC_RESP",
            MsgType::BlockReq => "BLOCK_REQ",
            MsgType::Status => "STATUS",
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            MsgType::Hello => "/p2p/hello",
            MsgType::Proposal => "/p2p/proposal",
            MsgType::Vote => "/p2p/vote",
            MsgType::SyncReq => "/p2p/sync_req",
            MsgType::SyncResp => "/p2p/sync_resp",
            MsgType::BlockReq => "/p2p/block_req",
            MsgType::Status => "/p2p/status",
        }
    }

    /// Lanes whose answers are cached per `msg_id`.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, MsgType::SyncReq | MsgType::Status)
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MsgType,
    pub from_node_id: String,
    #[serde(default)]
    pub from_val_id: Option<String>,
    pub chain_id: String,
    #[serde(default)]
    pub ts_ms: u64,
    #[serde(default)]
    pub hops: u32,
    pub payload: Value,
}

impl Envelope {
    /// Parse a request body that must carry `expected`.
    pub fn parse(body: &[u8], expected: MsgType) -> Result<Self, P2pError> {
        let env: Envelope = serde_json::from_slice(body)
            .map_err(|e| P2pError::Malformed(format!("bad envelope: {}", e)))?;
        if env.msg_type != expected {
            return Err(P2pError::Malformed(format!(
                "{} envelope sent to {} endpoint",
                env.msg_type, expected
            )));
        }
        if env.from_node_id.is_empty() || env.from_node_id.len() > MAX_FIELD_LEN {
            return Err(P2pError::Malformed("bad from_node_id".into()));
        }
        if env.hops > MAX_HOPS {
            return Err(P2pError::Malformed(format!("hops {} > {}", env.hops, MAX_HOPS)));
        }
        if !env.payload.is_object() {
            return Err(P2pError::Malformed("payload must be an object".into()));
        }
        Ok(env)
    }

    pub fn sig_hex(&self) -> Option<&str> {
        self.payload.get(SIG_FIELD).and_then(Value::as_str)
    }

    pub fn msg_id(&self) -> Option<&str> {
        self.payload
            .get("msg_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty() && s.len() <= MAX_FIELD_LEN)
    }

    /// Hash over type, sender and the signed payload.
    pub fn content_hash(&self) -> String {
        let mut basis = serde_json::Map::new();
        basis.insert("type".into(), Value::String(self.msg_type.as_str().into()));
        basis.insert("from".into(), Value::String(self.from_node_id.clone()));
        basis.insert("payload".into(), self.payload.clone());
        sha256_hex(canonical_json(&Value::Object(basis)).as_bytes())
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, P2pError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| P2pError::Malformed(format!("bad {} payload: {}", self.msg_type, e)))
    }
}

/// Sender identity stamped on outbound envelopes.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    pub chain_id: String,
    pub node_id: String,
    pub val_id: Option<String>,
    pub base_url: String,
}

impl LocalIdentity {
    /// Sign `payload` and wrap it in an envelope.
    pub fn seal<T: Serialize>(
        &self,
        keystore: &Keystore,
        msg_type: MsgType,
        payload: &T,
        ts_ms: u64,
    ) -> anyhow::Result<Envelope> {
        let payload = keystore.sign_payload(msg_type.as_str(), &self.chain_id, payload)?;
        Ok(self.wrap(msg_type, payload, ts_ms))
    }

    pub fn wrap(&self, msg_type: MsgType, payload: Value, ts_ms: u64) -> Envelope {
        Envelope {
            msg_type,
            from_node_id: self.node_id.clone(),
            from_val_id: self.val_id.clone(),
            chain_id: self.chain_id.clone(),
            ts_ms,
            hops: 0,
            payload,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub node_id: String,
    #[serde(default)]
    pub val_id: Option<String>,
    pub base_url: String,
    pub pubkey_hex: String,
    #[serde(default)]
    pub sig_hex: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReqPayload {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub finalized_height: u64,
    #[serde(default)]
    pub ts_ms: u64,
    #[serde(default)]
    pub sig_hex: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRespPayload {
    pub finalized_height: u64,
    #[serde(default)]
    pub round: u64,
    #[serde(default)]
    pub last_qc: Option<QuorumCertificate>,
    #[serde(default)]
    pub ts_ms: u64,
    #[serde(default)]
    pub sig_hex: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReqPayload {
    pub height: u64,
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub ts_ms: u64,
    #[serde(default)]
    pub sig_hex: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReqPayload {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub ts_ms: u64,
    #[serde(default)]
    pub sig_hex: String,
}
