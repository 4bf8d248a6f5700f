// src/crypto/keys.rs
use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

use super::canonical::{canonical_hello_sign_bytes, canonical_p2p_sign_bytes, SIG_FIELD};

/// Verify a signature over `msg` using `pubkey` (32 bytes) and signature bytes.
/// Returns `true` if signature verifies.
pub fn verify_bytes(pubkey: &[u8], msg: &[u8], sig_bytes: &[u8]) -> bool {
    let vk = match <&[u8; 32]>::try_from(pubkey) {
        Ok(pubkey_array) => match VerifyingKey::from_bytes(pubkey_array) {
            Ok(v) => v,
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    let sig = match <&[u8; 64]>::try_from(sig_bytes) {
        Ok(sig_array) => Signature::from_bytes(sig_array),
        Err(_) => return false,
    };
    vk.verify_strict(msg, &sig).is_ok()
}

/// Sign `msg` with the 32-byte secret seed (raw bytes). Returns signature bytes.
/// Returns None for invalid seed length.
pub fn sign_bytes(secret_seed: &[u8], msg: &[u8]) -> Option<Vec<u8>> {
    let seed = <&[u8; 32]>::try_from(secret_seed).ok()?;
    let sk = SigningKey::from_bytes(seed);
    let sig: Signature = sk.sign(msg);
    Some(sig.to_bytes().to_vec())
}

/// Derive verifying (public) key bytes from a 32-byte seed.
pub fn public_from_seed(seed: &[u8]) -> Option<Vec<u8>> {
    let seed = <&[u8; 32]>::try_from(seed).ok()?;
    let sk = SigningKey::from_bytes(seed);
    Some(VerifyingKey::from(&sk).to_bytes().to_vec())
}

/// Holds the node's long-term P2P signing key.
pub struct Keystore {
    signing: SigningKey,
    pubkey_hex: String,
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystore")
            .field("pubkey_hex", &self.pubkey_hex)
            .finish_non_exhaustive()
    }
}

impl Keystore {
    pub fn from_signing_key(signing: SigningKey) -> Self {
        let pubkey_hex = hex::encode(signing.verifying_key().to_bytes());
        Self {
            signing,
            pubkey_hex,
        }
    }

    /// Accepts either a 32-byte seed or a 64-byte keypair, hex encoded.
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let raw = hex::decode(secret_hex.trim()).context("P2P private key is not hex")?;
        let signing = match raw.len() {
            32 => {
                let seed: [u8; 32] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("invalid seed bytes"))?;
                SigningKey::from_bytes(&seed)
            }
            64 => {
                let pair: [u8; 64] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("invalid keypair bytes"))?;
                SigningKey::from_keypair_bytes(&pair)
                    .map_err(|e| anyhow!("invalid keypair bytes: {}", e))?
            }
            n => return Err(anyhow!("P2P private key must be 32 or 64 bytes, got {}", n)),
        };
        Ok(Self::from_signing_key(signing))
    }

    /// Load the key file at `path`, generating it on first start.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return super::read_key_file(path);
        }
        log::info!("generating new P2P key at {}", path.display());
        super::write_new_key_file(path)
    }

    pub fn pubkey_hex(&self) -> &str {
        &self.pubkey_hex
    }

    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn sign_hex(&self, msg: &[u8]) -> String {
        hex::encode(self.signing.sign(msg).to_bytes())
    }

    /// Serialize `payload`, sign its canonical bytes and embed `sig_hex`.
    pub fn sign_payload<T: Serialize>(
        &self,
        msg_type: &str,
        chain_id: &str,
        payload: &T,
    ) -> Result<Value> {
        let mut value = serde_json::to_value(payload)?;
        let sig = self.sign_hex(&canonical_p2p_sign_bytes(msg_type, chain_id, &value));
        match value.as_object_mut() {
            Some(map) => {
                map.insert(SIG_FIELD.to_string(), Value::String(sig));
            }
            None => return Err(anyhow!("{} payload must be a JSON object", msg_type)),
        }
        Ok(value)
    }

    pub fn sign_hello(
        &self,
        chain_id: &str,
        node_id: &str,
        val_id: Option<&str>,
        base_url: &str,
    ) -> String {
        self.sign_hex(&canonical_hello_sign_bytes(
            chain_id,
            node_id,
            val_id,
            base_url,
            &self.pubkey_hex,
        ))
    }
}
