//! Symmetric stream encryption stage.
//!
//! Framed ChaCha20-Poly1305. Layout on the wire:
//!
//! ```text
//! "SNAPENC1" (8 bytes) | salt (8 bytes)
//! [u32-be ciphertext length | ciphertext] ...
//! trailer: authenticated empty frame
//! ```
//!
//! The nonce for frame `n` is `salt || n` (big-endian u32), so frames can
//! neither be reordered nor replayed across streams. A wrong key fails the
//! first frame's tag; a truncated stream is detected by the missing
//! trailer. At most one frame is held in memory on either side.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::keyfile::StreamKey;
use crate::utils::errors::{AgentError, Result};

/// First bytes of every archive; also what `verify_object` probes for.
pub const MAGIC: &[u8; 8] = b"SNAPENC1";

pub const HEADER_LEN: usize = 16;

/// Maximum plaintext per frame. The pipeline feeds ~256 KiB chunks, so this
/// is headroom, not a target.
pub const MAX_FRAME_PLAINTEXT: usize = 1024 * 1024;

const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 8;

pub struct FrameEncryptor {
    cipher: ChaCha20Poly1305,
    salt: [u8; SALT_LEN],
    counter: u32,
}

impl FrameEncryptor {
    pub fn new(key: &StreamKey) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self::with_salt(key, salt)
    }

    fn with_salt(key: &StreamKey, salt: [u8; SALT_LEN]) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        FrameEncryptor {
            cipher,
            salt,
            counter: 0,
        }
    }

    /// Stream header; must be written before any frame.
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[..MAGIC.len()].copy_from_slice(MAGIC);
        header[MAGIC.len()..].copy_from_slice(&self.salt);
        header
    }

    /// Seal one chunk of plaintext into a length-prefixed frame.
    pub fn seal_frame(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > MAX_FRAME_PLAINTEXT {
            return Err(AgentError::Crypto(format!(
                "frame plaintext {} exceeds {} bytes",
                plaintext.len(),
                MAX_FRAME_PLAINTEXT
            )));
        }
        let nonce = self.next_nonce()?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| AgentError::Crypto("frame encryption failed".into()))?;

        let mut frame = Vec::with_capacity(4 + ciphertext.len());
        frame.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Authenticated end-of-stream marker.
    pub fn seal_trailer(&mut self) -> Result<Vec<u8>> {
        self.seal_frame(&[])
    }

    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..SALT_LEN].copy_from_slice(&self.salt);
        nonce[SALT_LEN..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| AgentError::Crypto("frame counter overflow".into()))?;
        Ok(nonce)
    }
}

pub struct FrameDecryptor {
    cipher: ChaCha20Poly1305,
    salt: [u8; SALT_LEN],
    counter: u32,
    finished: bool,
}

impl std::fmt::Debug for FrameDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecryptor")
            .field("counter", &self.counter)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl FrameDecryptor {
    /// Read and check the stream header; wrong magic means the object is not
    /// one of ours (or was written by an incompatible version).
    pub async fn read_header<R>(key: &StreamKey, reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        reader
            .read_exact(&mut header)
            .await
            .map_err(|e| AgentError::Crypto(format!("archive header unreadable: {}", e)))?;
        if &header[..MAGIC.len()] != MAGIC {
            return Err(AgentError::Crypto("bad archive magic".into()));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&header[MAGIC.len()..]);

        Ok(FrameDecryptor {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
            salt,
            counter: 0,
            finished: false,
        })
    }

    /// Next plaintext frame, or `None` once the authenticated trailer has
    /// been consumed. EOF before the trailer is a truncation error.
    pub async fn next_frame<R>(&mut self, reader: &mut R) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        if self.finished {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                AgentError::Crypto("archive truncated before trailer".into())
            } else {
                AgentError::Io(e)
            }
        })?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len < TAG_LEN || len > MAX_FRAME_PLAINTEXT + TAG_LEN {
            return Err(AgentError::Crypto(format!("invalid frame length {}", len)));
        }

        let mut ciphertext = vec![0u8; len];
        reader.read_exact(&mut ciphertext).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                AgentError::Crypto("archive truncated mid-frame".into())
            } else {
                AgentError::Io(e)
            }
        })?;

        let nonce = self.next_nonce()?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| {
                AgentError::Crypto("frame authentication failed (wrong key or corrupt data)".into())
            })?;

        if plaintext.is_empty() {
            self.finished = true;
            return Ok(None);
        }
        Ok(Some(plaintext))
    }

    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..SALT_LEN].copy_from_slice(&self.salt);
        nonce[SALT_LEN..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| AgentError::Crypto("frame counter overflow".into()))?;
        Ok(nonce)
    }
}

/// Decrypt a whole stream into a writer. Returns plaintext bytes written.
pub async fn decrypt_to_writer<R, W>(key: &StreamKey, reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let mut decryptor = FrameDecryptor::read_header(key, reader).await?;
    let mut total = 0u64;
    while let Some(plaintext) = decryptor.next_frame(reader).await? {
        writer.write_all(&plaintext).await?;
        total += plaintext.len() as u64;
    }
    writer.flush().await?;
    Ok(total)
}
