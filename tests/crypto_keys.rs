// tests/crypto_keys.rs
use glyphchain::crypto::{canonical_hello_sign_bytes, canonical_p2p_sign_bytes, keys, Keystore};
use glyphchain::crypto::verify_ed25519_hex;
use serde_json::json;

#[test]
fn key_sign_verify() {
    let seed: [u8; 32] = [42u8; 32];

    let pubkey = keys::public_from_seed(&seed).expect("should derive pubkey");
    assert_eq!(pubkey.len(), 32, "pubkey should be 32 bytes");

    let msg = b"hello glyph";
    let sig = keys::sign_bytes(&seed, msg).expect("should sign");
    assert_eq!(sig.len(), 64, "signature should be 64 bytes");

    assert!(keys::verify_bytes(&pubkey, msg, &sig), "signature should verify");
    assert!(
        !keys::verify_bytes(&pubkey, b"wrong message", &sig),
        "signature should not verify with wrong message"
    );
    let wrong_pubkey: [u8; 32] = [99u8; 32];
    assert!(
        !keys::verify_bytes(&wrong_pubkey, msg, &sig),
        "signature should not verify with wrong pubkey"
    );
}

#[test]
fn signed_payload_verifies_against_canonical_bytes() {
    let key = Keystore::from_hex(&hex::encode([3u8; 32])).unwrap();
    let payload = json!({"voter": "val1", "height": 4, "round": 0, "block_id": "h4-r0-Pval4"});
    let signed = key.sign_payload("VOTE", "glyph-test", &payload).unwrap();
    let sig = signed["sig_hex"].as_str().unwrap();

    // field order and the embedded signature do not change the signed bytes
    let reordered = json!({"round": 0, "block_id": "h4-r0-Pval4", "height": 4, "voter": "val1", "sig_hex": sig});
    let bytes = canonical_p2p_sign_bytes("VOTE", "glyph-test", &reordered);
    assert!(verify_ed25519_hex(key.pubkey_hex(), sig, &bytes));

    let other_chain = canonical_p2p_sign_bytes("VOTE", "other", &reordered);
    assert!(!verify_ed25519_hex(key.pubkey_hex(), sig, &other_chain));
    let other_type = canonical_p2p_sign_bytes("PROPOSAL", "glyph-test", &reordered);
    assert!(!verify_ed25519_hex(key.pubkey_hex(), sig, &other_type));

    assert!(!verify_ed25519_hex("zz", sig, &bytes));
    assert!(!verify_ed25519_hex(key.pubkey_hex(), "00", &bytes));
}

#[test]
fn hello_signature_binds_identity() {
    let key = Keystore::from_hex(&hex::encode([5u8; 32])).unwrap();
    let sig = key.sign_hello("glyph-test", "n1", Some("val1"), "http://n1.test");
    let bytes = canonical_hello_sign_bytes(
        "glyph-test",
        "n1",
        Some("val1"),
        "http://n1.test",
        key.pubkey_hex(),
    );
    assert!(verify_ed25519_hex(key.pubkey_hex(), &sig, &bytes));

    let moved = canonical_hello_sign_bytes(
        "glyph-test",
        "n1",
        Some("val1"),
        "http://elsewhere.test",
        key.pubkey_hex(),
    );
    assert!(!verify_ed25519_hex(key.pubkey_hex(), &sig, &moved));
    let observer = canonical_hello_sign_bytes("glyph-test", "n1", None, "http://n1.test", key.pubkey_hex());
    assert!(!verify_ed25519_hex(key.pubkey_hex(), &sig, &observer));
}
