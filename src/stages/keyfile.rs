//! Encryption key material.
//!
//! One keyfile under the application's private data directory, 32 random
//! bytes hex-encoded, mode 0600. Generated on first use; after that it is
//! read-only. A key that fails to parse is surfaced as a precondition
//! failure rather than regenerated, since every existing archive is bound
//! to it.

use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use zeroize::Zeroizing;

use crate::utils::errors::{AgentError, Result};

pub const KEY_LEN: usize = 32;

/// Symmetric stream key, zeroized on drop.
pub struct StreamKey(Zeroizing<[u8; KEY_LEN]>);

impl std::fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StreamKey").field(&"<redacted>").finish()
    }
}

impl StreamKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    #[cfg(test)]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        StreamKey(Zeroizing::new(bytes))
    }
}

/// Load the keyfile, generating it on first use.
pub fn load_or_generate(path: &Path) -> Result<StreamKey> {
    if path.exists() {
        return load(path);
    }
    generate(path)?;
    load(path)
}

pub fn load(path: &Path) -> Result<StreamKey> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        AgentError::Precondition(format!("keyfile {} unreadable: {}", path.display(), e))
    })?;
    let decoded = decode_hex(text.trim()).ok_or_else(|| {
        AgentError::Precondition(format!(
            "keyfile {} is not {} hex-encoded bytes",
            path.display(),
            KEY_LEN
        ))
    })?;
    Ok(StreamKey(decoded))
}

fn generate(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(key.as_mut());

    let encoded = encode_hex(&key[..]);
    std::fs::write(path, format!("{}\n", encoded))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "Generated new backup encryption key");
    Ok(())
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(text: &str) -> Option<Zeroizing<[u8; KEY_LEN]>> {
    if text.len() != KEY_LEN * 2 || !text.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
        let hex = std::str::from_utf8(chunk).ok()?;
        out[i] = u8::from_str_radix(hex, 16).ok()?;
    }
    Some(out)
}
