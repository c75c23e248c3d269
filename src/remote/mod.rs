//! Remote channel: authenticated access to the archival host.
//!
//! The engine only ever talks to the remote through the narrow capability
//! trait below, so tests can substitute an in-memory host. The production
//! implementation ([`ssh::SshChannel`]) drives an `ssh` subprocess per
//! operation.

pub mod layout;
pub mod ssh;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::stages::crypt;
use crate::utils::errors::Result;

/// One file on the archival host.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    /// Seconds since the epoch
    pub mtime: i64,
}

pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Capability set against the archival host. One channel per run; a run may
/// open additional channels for retention reaping, but a channel is never
/// shared across concurrent runs.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Cheap reachability probe, bounded by the configured connect timeout.
    async fn check_connection(&self) -> Result<()>;

    /// Idempotent `mkdir -p`.
    async fn ensure_dir(&self, path: &str) -> Result<()>;

    /// Stream bytes into `<remote_path>.part`, then atomically rename to
    /// `remote_path` on clean EOF. On any error (or cancellation) the
    /// `.part` file is deleted before returning. Returns bytes written.
    async fn write_stream(
        &self,
        remote_path: &str,
        reader: ByteReader,
        cancel: CancellationToken,
    ) -> Result<u64>;

    /// Open a streaming read of a remote file.
    async fn read_stream(&self, remote_path: &str) -> Result<ByteReader>;

    /// Overwrite a small remote file in one shot (the `.verification` marker).
    async fn write_file(&self, remote_path: &str, contents: &[u8]) -> Result<()>;

    /// Size and mtime, or `None` if absent.
    async fn stat(&self, remote_path: &str) -> Result<Option<RemoteEntry>>;

    /// First `len` bytes of a remote file.
    async fn read_header(&self, remote_path: &str, len: usize) -> Result<Vec<u8>>;

    /// Files directly under a remote directory. Empty if the directory is
    /// absent.
    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>>;

    /// Names of directories directly under a remote directory.
    async fn list_dirs(&self, remote_dir: &str) -> Result<Vec<String>>;

    /// Idempotent file delete (no-op if absent).
    async fn delete(&self, remote_path: &str) -> Result<()>;

    /// Recursive directory delete.
    async fn delete_dir(&self, remote_dir: &str) -> Result<()>;

    /// Check a written archive: correct size and a readable format header.
    async fn verify_object(&self, remote_path: &str, expected_size: u64) -> Result<bool> {
        let Some(entry) = self.stat(remote_path).await? else {
            return Ok(false);
        };
        if entry.size != expected_size {
            tracing::warn!(
                remote_path,
                expected = expected_size,
                actual = entry.size,
                "Remote object size mismatch"
            );
            return Ok(false);
        }
        let header = self.read_header(remote_path, crypt::MAGIC.len()).await?;
        Ok(header == crypt::MAGIC)
    }
}
