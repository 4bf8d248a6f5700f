pub mod canonical;
pub mod keys;

pub use canonical::{canonical_hello_sign_bytes, canonical_json, canonical_p2p_sign_bytes};
pub use keys::Keystore;

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::fs;
use std::path::Path;

use crate::storage::write_atomic;

/// Verify an ed25519 signature given hex pubkey and hex signature.
/// Any decoding problem counts as a failed verification.
pub fn verify_ed25519_hex(pubkey_hex: &str, sig_hex: &str, message: &[u8]) -> bool {
    match (hex::decode(pubkey_hex), hex::decode(sig_hex)) {
        (Ok(pk), Ok(sig)) => keys::verify_bytes(&pk, message, &sig),
        _ => false,
    }
}

/// Create a fresh node key and store its 32-byte seed, hex encoded, at
/// `path`. The file holds the same value `P2P_PRIVKEY_HEX` accepts.
pub fn write_new_key_file(path: &Path) -> Result<Keystore> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create key dir {}", parent.display()))?;
    }
    let key = Keystore::from_signing_key(SigningKey::generate(&mut OsRng));
    write_atomic(path, key.seed_hex().as_bytes())?;
    set_owner_only(path);
    Ok(key)
}

/// Read a key file written by [`write_new_key_file`] (or by hand).
pub fn read_key_file(path: &Path) -> Result<Keystore> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read key file {}", path.display()))?;
    Keystore::from_hex(&raw).with_context(|| format!("key file {}", path.display()))
}

/// 0600 on Unix; no-op elsewhere.
pub fn set_owner_only(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            log::warn!("could not restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_file_round_trips_and_is_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("p2p_key");
        let written = write_new_key_file(&path).unwrap();
        let read = read_key_file(&path).unwrap();
        assert_eq!(written.pubkey_hex(), read.pubkey_hex());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        fs::write(&path, "not a key").unwrap();
        assert!(read_key_file(&path).is_err());
    }

    #[test]
    fn bad_hex_never_verifies() {
        assert!(!verify_ed25519_hex("xyz", "00", b"m"));
        assert!(!verify_ed25519_hex("00", "xyz", b"m"));
    }
}
