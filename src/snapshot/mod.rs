//! Snapshot manager: read-only btrfs snapshots and their send streams.
//!
//! The engine reaches the filesystem only through [`SnapshotSource`], so
//! tests can substitute a deterministic in-memory source. The production
//! implementation shells out to the btrfs tooling.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdout, Command};

use crate::config::SubvolumeSpec;
use crate::utils::errors::{AgentError, Result};

/// Canonical timestamp format used in snapshot and archive names.
pub const TS_FORMAT: &str = "%Y%m%d-%H%M%S";

/// A read-only, point-in-time view of a subvolume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub subvolume: String,
    /// `YYYYMMDD-HHMMSS`, UTC, second precision
    pub timestamp: String,
    pub local_path: PathBuf,
    pub taken_at: DateTime<Utc>,
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TS_FORMAT).to_string()
}

pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(ts, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Month bucket (`YYYYMM`) of a snapshot timestamp.
pub fn month_bucket(ts: &str) -> String {
    ts.chars().take(6).collect()
}

/// Snapshot directory entry name: `<subvolume>-<timestamp>`.
pub fn snapshot_dir_name(subvolume: &str, ts: &str) -> String {
    format!("{}-{}", subvolume, ts)
}

/// A finite, non-restartable serialized snapshot stream. `finish` must be
/// called after the reader hits EOF to learn whether the producer ended
/// cleanly.
#[async_trait]
pub trait SendStream: Send {
    fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin);
    async fn finish(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// StartBackup precondition: the subvolume's source path is present.
    async fn probe(&self, spec: &SubvolumeSpec) -> Result<()>;

    /// Create a read-only snapshot at `<snapshot_dir>/<subvolume>-<ts>`.
    async fn create_snapshot(&self, spec: &SubvolumeSpec, timestamp: &str) -> Result<Snapshot>;

    /// All snapshots of a subvolume, newest first.
    async fn list_snapshots(&self, subvolume: &str) -> Result<Vec<Snapshot>>;

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Serialized send stream, relative to `parent` when given.
    async fn open_send(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
    ) -> Result<Box<dyn SendStream>>;

    async fn find_snapshot(&self, subvolume: &str, timestamp: &str) -> Result<Option<Snapshot>> {
        Ok(self
            .list_snapshots(subvolume)
            .await?
            .into_iter()
            .find(|s| s.timestamp == timestamp))
    }
}

/// Production snapshot source backed by the btrfs tooling.
pub struct BtrfsSnapshots {
    snapshot_dir: PathBuf,
}

impl BtrfsSnapshots {
    pub fn new(snapshot_dir: PathBuf) -> Self {
        BtrfsSnapshots { snapshot_dir }
    }

    async fn btrfs(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("btrfs")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AgentError::SnapshotCreate(format!("failed to run btrfs: {}", e)))
    }
}

#[async_trait]
impl SnapshotSource for BtrfsSnapshots {
    async fn probe(&self, spec: &SubvolumeSpec) -> Result<()> {
        if !spec.source_path.exists() {
            return Err(AgentError::Precondition(format!(
                "source path {} for subvolume '{}' does not exist",
                spec.source_path.display(),
                spec.name
            )));
        }
        tokio::fs::create_dir_all(&self.snapshot_dir).await?;
        Ok(())
    }

    async fn create_snapshot(&self, spec: &SubvolumeSpec, timestamp: &str) -> Result<Snapshot> {
        let local_path = self
            .snapshot_dir
            .join(snapshot_dir_name(&spec.name, timestamp));
        if local_path.exists() {
            return Err(AgentError::SnapshotCreate(format!(
                "snapshot {} already exists",
                local_path.display()
            )));
        }

        let source = spec.source_path.to_string_lossy().into_owned();
        let target = local_path.to_string_lossy().into_owned();
        let output = self
            .btrfs(&["subvolume", "snapshot", "-r", &source, &target])
            .await?;
        if !output.status.success() {
            return Err(AgentError::SnapshotCreate(format!(
                "btrfs snapshot of {} failed: {}",
                source,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let taken_at = parse_timestamp(timestamp).ok_or_else(|| {
            AgentError::SnapshotCreate(format!("invalid snapshot timestamp '{}'", timestamp))
        })?;
        tracing::info!(subvolume = %spec.name, path = %local_path.display(), "Created snapshot");

        Ok(Snapshot {
            subvolume: spec.name.clone(),
            timestamp: timestamp.to_string(),
            local_path,
            taken_at,
        })
    }

    async fn list_snapshots(&self, subvolume: &str) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.snapshot_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(AgentError::Io(e)),
        };

        let prefix = format!("{}-", subvolume);
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(ts) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(taken_at) = parse_timestamp(ts) else {
                continue;
            };
            snapshots.push(Snapshot {
                subvolume: subvolume.to_string(),
                timestamp: ts.to_string(),
                local_path: entry.path(),
                taken_at,
            });
        }

        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(snapshots)
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let path = snapshot.local_path.to_string_lossy().into_owned();
        let output = self.btrfs(&["subvolume", "delete", &path]).await?;
        if !output.status.success() {
            return Err(AgentError::SnapshotCreate(format!(
                "btrfs delete of {} failed: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::info!(path, "Deleted snapshot");
        Ok(())
    }

    async fn open_send(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
    ) -> Result<Box<dyn SendStream>> {
        let mut cmd = Command::new("btrfs");
        cmd.arg("send");
        if let Some(parent) = parent {
            if !parent.local_path.exists() {
                return Err(AgentError::Stream(format!(
                    "parent snapshot {} is missing on disk",
                    parent.local_path.display()
                )));
            }
            cmd.arg("-p").arg(&parent.local_path);
        }
        cmd.arg(&snapshot.local_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::Stream(format!("failed to start btrfs send: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Stream("btrfs send has no stdout".into()))?;

        Ok(Box::new(BtrfsSendStream { child, stdout }))
    }
}

struct BtrfsSendStream {
    child: Child,
    stdout: ChildStdout,
}

#[async_trait]
impl SendStream for BtrfsSendStream {
    fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        &mut self.stdout
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        let mut stderr_text = String::new();
        if let Some(mut stderr) = self.child.stderr.take() {
            use tokio::io::AsyncReadExt;
            let _ = stderr.read_to_string(&mut stderr_text).await;
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| AgentError::Stream(format!("btrfs send wait: {}", e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(AgentError::Stream(format!(
                "btrfs send exited with {}: {}",
                status,
                stderr_text.trim()
            )))
        }
    }
}

/// Is this snapshot pinned by lineage? A snapshot that is the parent of a
/// committed archive must survive locally until a fresh full for the same
/// subvolume has committed.
pub async fn is_pinned(
    store: &crate::store::LineageStore,
    subvolume: &str,
    timestamp: &str,
) -> Result<bool> {
    if !store.is_committed_parent(subvolume, timestamp).await? {
        return Ok(false);
    }
    Ok(!store.has_full_since(subvolume, timestamp).await?)
}
