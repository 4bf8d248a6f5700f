// src/network/auth.rs
// Envelope authentication for every type except HELLO.

use super::envelope::{Envelope, MsgType};
use super::peer_store::{PeerRecord, PeerStore};
use crate::crypto::{canonical_p2p_sign_bytes, verify_ed25519_hex};
use crate::error::P2pError;

#[derive(Clone, Debug)]
pub struct AuthPolicy {
    pub chain_id: String,
    /// BLOCK_REQ must carry a signature.
    pub require_signed_block_req: bool,
    /// BLOCK_REQ sender must have completed HELLO.
    pub require_hello_for_block_req: bool,
}

impl AuthPolicy {
    fn needs_hello(&self, msg_type: MsgType) -> bool {
        match msg_type {
            MsgType::Proposal | MsgType::Vote => true,
            MsgType::BlockReq => self.require_hello_for_block_req,
            _ => false,
        }
    }
}

/// Authenticate `env` against the peer store. Returns the sender's record,
/// or `None` for an unsigned BLOCK_REQ the policy lets through.
pub fn authenticate(
    env: &Envelope,
    policy: &AuthPolicy,
    peers: &PeerStore,
    now_ms: u64,
) -> Result<Option<PeerRecord>, P2pError> {
    if env.chain_id != policy.chain_id {
        return Err(P2pError::AuthFailed(format!(
            "chain_id {} does not match {}",
            env.chain_id, policy.chain_id
        )));
    }
    let sig = match env.sig_hex() {
        Some(s) if !s.is_empty() => s,
        _ => {
            if env.msg_type == MsgType::BlockReq
                && !policy.require_signed_block_req
                && !policy.require_hello_for_block_req
            {
                peers.touch(&env.from_node_id, now_ms);
                return Ok(None);
            }
            return Err(P2pError::AuthFailed(format!("{} is not signed", env.msg_type)));
        }
    };

    let peer = peers.get(&env.from_node_id).ok_or_else(|| {
        P2pError::AuthFailed(format!("unknown peer {}", env.from_node_id))
    })?;
    let pubkey = peer.pubkey_hex.as_deref().ok_or_else(|| {
        P2pError::AuthFailed(format!("no key bound for {}", env.from_node_id))
    })?;
    if policy.needs_hello(env.msg_type) && !peer.hello_ok {
        return Err(P2pError::AuthFailed(format!(
            "{} requires a completed HELLO from {}",
            env.msg_type, env.from_node_id
        )));
    }
    let msg = canonical_p2p_sign_bytes(env.msg_type.as_str(), &env.chain_id, &env.payload);
    if !verify_ed25519_hex(pubkey, sig, &msg) {
        log::debug!("bad {} signature from {}", env.msg_type, env.from_node_id);
        return Err(P2pError::AuthFailed(format!(
            "bad {} signature from {}",
            env.msg_type, env.from_node_id
        )));
    }
    if let (Some(claimed), Some(bound)) = (&env.from_val_id, &peer.val_id) {
        if claimed != bound {
            return Err(P2pError::AuthFailed(format!(
                "{} claims {} but is bound to {}",
                env.from_node_id, claimed, bound
            )));
        }
    }
    peers.touch(&env.from_node_id, now_ms);
    Ok(Some(peer))
}

/// The authenticated sender must be the validator that authored the message.
pub fn require_author(peer: Option<&PeerRecord>, author: &str) -> Result<(), P2pError> {
    match peer.and_then(|p| p.val_id.as_deref()) {
        Some(v) if v == author => Ok(()),
        Some(v) => Err(P2pError::AuthFailed(format!(
            "peer bound to {} cannot send messages authored by {}",
            v, author
        ))),
        None => Err(P2pError::AuthFailed(format!(
            "peer is not bound to validator {}",
            author
        ))),
    }
}
