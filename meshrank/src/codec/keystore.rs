//! Channel-key store. DESIGN NOTES §9: `KeyStore | null` is modeled as
//! `Option<KeyStore>` rather than a nullable reference. The store itself is
//! a copy-on-reload immutable map (`spec.md` §5): each reload builds a new
//! `KeyStore` and swaps it in, readers never see a half-updated table.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use std::collections::HashMap;
use std::time::SystemTime;

#[derive(Clone, Debug, serde::Deserialize)]
struct ChannelKeyFileEntry {
    #[serde(rename = "hashByte")]
    hash_byte: String,
    name: String,
    #[serde(rename = "secretHex")]
    secret_hex: String,
}

#[derive(Clone, Debug, serde::Deserialize)]
struct ChannelKeyFile {
    channels: Vec<ChannelKeyFileEntry>,
}

#[derive(Clone, Debug)]
pub struct ChannelEntry {
    pub name: String,
    pub secret: [u8; 32],
}

/// Built once per configuration load; reloaded when the channel-keys file's
/// modification time changes (`spec.md` §4.1).
#[derive(Clone, Debug, Default)]
pub struct KeyStore {
    by_hash: HashMap<u8, ChannelEntry>,
}

impl KeyStore {
    pub fn lookup(&self, hash_byte: u8) -> Option<&ChannelEntry> {
        self.by_hash.get(&hash_byte)
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// `buildKeyStore({channelSecrets: [32-hex-string]}) -> KeyStore`. This
    /// variant builds from the on-disk channel-keys file format in
    /// `spec.md` §6: `{channels:[{hashByte, name, secretHex}]}`. Invalid
    /// secrets (not 32 hex) are skipped with a diagnostic line, not a
    /// hard failure — one bad channel entry must not take down the whole
    /// store.
    pub fn build_from_json(json: &str) -> Self {
        let mut by_hash = HashMap::new();
        let parsed: ChannelKeyFile = match serde_json::from_str(json) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error=%e, "channel_keys_file_parse_failed");
                return Self { by_hash };
            }
        };
        for entry in parsed.channels {
            let Ok(hash_bytes) = hex::decode(entry.hash_byte.trim()) else {
                tracing::warn!(hash = %entry.hash_byte, "channel_key_bad_hash_byte");
                continue;
            };
            let Some(&hash_byte) = hash_bytes.first() else {
                tracing::warn!(hash = %entry.hash_byte, "channel_key_empty_hash_byte");
                continue;
            };
            let Ok(secret_bytes) = hex::decode(entry.secret_hex.trim()) else {
                tracing::warn!(channel = %entry.name, "channel_key_secret_not_hex");
                continue;
            };
            let Ok(secret) = <[u8; 32]>::try_from(secret_bytes.as_slice()) else {
                tracing::warn!(channel = %entry.name, len = secret_bytes.len(), "channel_key_secret_wrong_length");
                continue;
            };
            by_hash.insert(
                hash_byte,
                ChannelEntry {
                    name: entry.name,
                    secret,
                },
            );
        }
        Self { by_hash }
    }
}

/// Reloads the key store from disk only when the file's mtime has changed
/// since the last load, returning the (possibly unchanged) store and the
/// mtime observed. Callers own the copy-on-reload swap.
pub fn reload_if_changed(
    path: &str,
    last_mtime: Option<SystemTime>,
    current: &KeyStore,
) -> (KeyStore, Option<SystemTime>) {
    let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    if mtime.is_some() && mtime == last_mtime {
        return (current.clone(), mtime);
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => (KeyStore::build_from_json(&contents), mtime),
        Err(e) => {
            tracing::warn!(error=%e, path, "channel_keys_file_read_failed");
            (current.clone(), last_mtime)
        }
    }
}

/// Derives a 12-byte nonce for group-channel decryption from the channel
/// secret and the frame's own MAC bytes, so distinct frames on the same
/// channel never reuse a nonce under the same key.
fn derive_nonce(mac: u16) -> Nonce {
    let mut n = [0u8; 12];
    n[0..2].copy_from_slice(&mac.to_le_bytes());
    Nonce::clone_from_slice(&n)
}

/// Decrypts a group-text ciphertext for the given channel entry. Any
/// authentication failure (wrong key, corrupted frame) surfaces as
/// `None` so the caller can report `CodecError::DecryptFailed`.
pub fn decrypt_group_text(entry: &ChannelEntry, mac: u16, ciphertext: &[u8]) -> Option<Vec<u8>> {
    let key = Key::from_slice(&entry.secret);
    let cipher = ChaCha20Poly1305::new(key);
    let nonce = derive_nonce(mac);
    cipher.decrypt(&nonce, ciphertext).ok()
}
