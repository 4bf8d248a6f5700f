// src/network/handshake.rs
// HELLO: a node proves ownership of its key and binds node id, validator id
// and base URL to it.

use super::envelope::{Envelope, HelloPayload, LocalIdentity, MsgType};
use super::peer_store::PeerStore;
use crate::bft::ValidatorSet;
use crate::crypto::{canonical_hello_sign_bytes, verify_ed25519_hex, Keystore};
use crate::error::P2pError;

/// Build our signed HELLO envelope.
pub fn build_hello(identity: &LocalIdentity, keystore: &Keystore, ts_ms: u64) -> Envelope {
    let sig_hex = keystore.sign_hello(
        &identity.chain_id,
        &identity.node_id,
        identity.val_id.as_deref(),
        &identity.base_url,
    );
    let payload = HelloPayload {
        node_id: identity.node_id.clone(),
        val_id: identity.val_id.clone(),
        base_url: identity.base_url.clone(),
        pubkey_hex: keystore.pubkey_hex().to_string(),
        sig_hex,
    };
    let value = serde_json::to_value(&payload).unwrap_or_default();
    identity.wrap(MsgType::Hello, value, ts_ms)
}

/// Verify an inbound HELLO and bind the sender in `peers`.
pub fn accept_hello(
    env: &Envelope,
    chain_id: &str,
    peers: &PeerStore,
    validators: &ValidatorSet,
    now_ms: u64,
) -> Result<HelloPayload, P2pError> {
    if env.chain_id != chain_id {
        return Err(P2pError::AuthFailed(format!(
            "HELLO for chain {} (expected {})",
            env.chain_id, chain_id
        )));
    }
    let hello: HelloPayload = env.decode_payload()?;
    if hello.node_id != env.from_node_id {
        return Err(P2pError::AuthFailed(format!(
            "HELLO payload node {} differs from sender {}",
            hello.node_id, env.from_node_id
        )));
    }
    if hello.base_url.is_empty() || url::Url::parse(&hello.base_url).is_err() {
        return Err(P2pError::Malformed(format!("bad base_url {:?}", hello.base_url)));
    }
    if hello.sig_hex.is_empty() {
        return Err(P2pError::AuthFailed("HELLO is not signed".into()));
    }
    let msg = canonical_hello_sign_bytes(
        &env.chain_id,
        &hello.node_id,
        hello.val_id.as_deref(),
        &hello.base_url,
        &hello.pubkey_hex,
    );
    if !verify_ed25519_hex(&hello.pubkey_hex, &hello.sig_hex, &msg) {
        return Err(P2pError::AuthFailed(format!(
            "bad HELLO signature from {}",
            hello.node_id
        )));
    }
    peers.bind_hello(&hello, validators, now_ms)?;
    log::info!(
        "HELLO from {} ({:?}) at {}",
        hello.node_id,
        hello.val_id,
        hello.base_url
    );
    Ok(hello)
}
