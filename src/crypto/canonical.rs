// src/crypto/canonical.rs
// Canonical byte encodings that signatures and fingerprints are computed over.
//
// Canonical JSON: object keys sorted lexicographically (byte order), no
// insignificant whitespace, strings escaped by serde_json. Top-level
// `sig_hex` is never part of the signed bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub const SIG_FIELD: &str = "sig_hex";

const P2P_DOMAIN: &str = "glyph-p2p/v1";
const HELLO_DOMAIN: &str = "glyph-hello/v1";

/// Serialize `value` as canonical JSON.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json never fails to encode a plain string
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Copy of `payload` without the top-level signature field.
pub fn strip_sig(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut m = map.clone();
            m.remove(SIG_FIELD);
            Value::Object(m)
        }
        other => other.clone(),
    }
}

/// Bytes signed for every envelope type except HELLO.
pub fn canonical_p2p_sign_bytes(msg_type: &str, chain_id: &str, payload: &Value) -> Vec<u8> {
    let body = canonical_json(&strip_sig(payload));
    format!("{}\n{}\n{}\n{}", P2P_DOMAIN, msg_type, chain_id, body).into_bytes()
}

/// Bytes a node signs to bind its node id, validator id and address to its key.
pub fn canonical_hello_sign_bytes(
    chain_id: &str,
    node_id: &str,
    val_id: Option<&str>,
    base_url: &str,
    pubkey_hex: &str,
) -> Vec<u8> {
    let binding = serde_json::json!({
        "base_url": base_url,
        "chain_id": chain_id,
        "node_id": node_id,
        "pubkey_hex": pubkey_hex,
        "val_id": val_id,
    });
    format!("{}\n{}", HELLO_DOMAIN, canonical_json(&binding)).into_bytes()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let v = json!({"b": 1, "a": {"z": [3, {"y": true, "x": null}], "c": "s"}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"c":"s","z":[3,{"x":null,"y":true}]},"b":1}"#
        );
    }

    #[test]
    fn sign_bytes_ignore_signature_and_key_order() {
        let a = json!({"height": 3, "round": 1, "sig_hex": "aa"});
        let b = json!({"sig_hex": "bb", "round": 1, "height": 3});
        assert_eq!(
            canonical_p2p_sign_bytes("VOTE", "glyph-test", &a),
            canonical_p2p_sign_bytes("VOTE", "glyph-test", &b)
        );
        assert_ne!(
            canonical_p2p_sign_bytes("VOTE", "glyph-test", &a),
            canonical_p2p_sign_bytes("PROPOSAL", "glyph-test", &a)
        );
        assert_ne!(
            canonical_p2p_sign_bytes("VOTE", "glyph-test", &a),
            canonical_p2p_sign_bytes("VOTE", "other-chain", &a)
        );
    }

    #[test]
    fn hello_bytes_cover_every_binding_field() {
        let base = canonical_hello_sign_bytes("c", "n1", Some("val1"), "http://a", "ab");
        assert_ne!(base, canonical_hello_sign_bytes("c", "n1", None, "http://a", "ab"));
        assert_ne!(base, canonical_hello_sign_bytes("c", "n1", Some("val1"), "http://b", "ab"));
        assert_ne!(base, canonical_hello_sign_bytes("c", "n2", Some("val1"), "http://a", "ab"));
    }
}
