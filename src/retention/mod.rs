//! Retention reaper: local snapshot and remote archive lifecycle.
//!
//! Runs after a successful backup, best-effort: nothing here ever fails the
//! run. Deletions keep lineage sound — an archive that something still
//! depends on, and a snapshot pinned as a committed parent, survive
//! regardless of age. A pre-run pass removes remote leftovers of failed
//! uploads so they can never be mistaken for archives.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::RetentionConfig;
use crate::remote::{layout, RemoteChannel};
use crate::snapshot::{self, SnapshotSource};
use crate::store::{ArchiveKind, LineageStore};
use crate::utils::errors::Result;

/// Remote files younger than this are left alone by orphan cleanup; they
/// may belong to an upload that is still in flight.
const ORPHAN_GRACE_SECS: i64 = 3600;

pub struct RetentionReaper {
    remote: Arc<dyn RemoteChannel>,
    store: Arc<LineageStore>,
    source: Arc<dyn SnapshotSource>,
    client_prefix: String,
    subvolumes: Vec<String>,
    config: RetentionConfig,
}

impl RetentionReaper {
    pub fn new(
        remote: Arc<dyn RemoteChannel>,
        store: Arc<LineageStore>,
        source: Arc<dyn SnapshotSource>,
        client_prefix: String,
        subvolumes: Vec<String>,
        config: RetentionConfig,
    ) -> Self {
        RetentionReaper {
            remote,
            store,
            source,
            client_prefix,
            subvolumes,
            config,
        }
    }

    /// Post-run reaping. Each pass logs and swallows its own failures.
    pub async fn reap(&self, now: DateTime<Utc>) {
        match self.reap_local_snapshots(now).await {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(deleted, "Reaped local snapshots");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Local snapshot reaping failed"),
        }
        match self.reap_remote_months().await {
            Ok(deleted) if !deleted.is_empty() => {
                tracing::info!(months = ?deleted, "Reaped remote month buckets");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Remote month reaping failed"),
        }
        match self.reap_remote_incrementals(now).await {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(deleted, "Reaped remote incrementals");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Remote incremental reaping failed"),
        }
    }

    /// Local snapshots past retention are deleted unless pinned by lineage.
    /// A snapshot that was never committed gets double the retention window
    /// before it is given up on.
    pub async fn reap_local_snapshots(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut deleted = 0;
        for subvolume in &self.subvolumes {
            for snap in self.source.list_snapshots(subvolume).await? {
                let age_days = (now - snap.taken_at).num_days();
                if age_days <= self.config.local_snapshot_days {
                    continue;
                }
                if snapshot::is_pinned(&self.store, subvolume, &snap.timestamp).await? {
                    tracing::debug!(
                        subvolume,
                        ts = %snap.timestamp,
                        "Keeping pinned parent snapshot"
                    );
                    continue;
                }
                let committed = self.store.is_committed(subvolume, &snap.timestamp).await?;
                if !committed && age_days <= self.config.local_snapshot_days * 2 {
                    // Never shipped; hold on to it a while longer.
                    continue;
                }
                if !committed {
                    tracing::warn!(
                        subvolume,
                        ts = %snap.timestamp,
                        "Deleting snapshot that was never archived"
                    );
                }
                self.source.delete_snapshot(&snap).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Delete whole month buckets beyond `months_to_keep`, newest first.
    /// A bucket is skipped when an archive in a surviving month still names
    /// one of its archives as parent.
    pub async fn reap_remote_months(&self) -> Result<Vec<String>> {
        let mut months: Vec<String> = self
            .remote
            .list_dirs(&self.client_prefix)
            .await?
            .into_iter()
            .filter(|name| layout::is_month_bucket(name))
            .collect();
        months.sort_by(|a, b| b.cmp(a));

        let mut deleted = Vec::new();
        if months.len() <= self.config.months_to_keep {
            return Ok(deleted);
        }

        let all = self.store.list_committed(None).await?;
        for month in months.split_off(self.config.months_to_keep) {
            let in_bucket = self.store.list_month(&month).await?;
            let breaks_lineage = in_bucket.iter().any(|record| {
                all.iter().any(|child| {
                    child.subvolume == record.subvolume
                        && child.month_bucket != month
                        && child.parent_ts.as_deref() == Some(record.snapshot_ts.as_str())
                })
            });
            if breaks_lineage {
                tracing::warn!(month, "Skipping month deletion: would break lineage");
                continue;
            }

            self.remote
                .delete_dir(&layout::month_dir(&self.client_prefix, &month))
                .await?;
            self.store.remove_month(&month).await?;
            deleted.push(month);
        }
        Ok(deleted)
    }

    /// Inside retained months, delete incrementals past the daily retention
    /// window — but only those no committed incremental depends on.
    pub async fn reap_remote_incrementals(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut deleted = 0;
        for record in self.store.list_committed(None).await? {
            if record.kind != ArchiveKind::Incremental {
                continue;
            }
            let Some(taken_at) = snapshot::parse_timestamp(&record.snapshot_ts) else {
                continue;
            };
            if (now - taken_at).num_days() <= self.config.daily_incremental_days {
                continue;
            }
            if self
                .store
                .has_dependent(&record.subvolume, &record.snapshot_ts)
                .await?
            {
                tracing::debug!(
                    subvolume = %record.subvolume,
                    ts = %record.snapshot_ts,
                    "Keeping expired incremental: still a parent"
                );
                continue;
            }
            self.remote.delete(&record.remote_path).await?;
            self.store.remove_by_remote_path(&record.remote_path).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Pre-run cleanup: remove remote files under the client prefix that no
    /// committed row accounts for (stray `.part` files, renamed-but-never-
    /// committed archives), once they are old enough to be safely dead.
    pub async fn cleanup_orphans(&self, now: DateTime<Utc>) -> Result<usize> {
        let committed = self.store.committed_remote_paths().await?;
        let mut deleted = 0;

        for month in self.remote.list_dirs(&self.client_prefix).await? {
            if !layout::is_month_bucket(&month) {
                continue;
            }
            for kind in [ArchiveKind::Full, ArchiveKind::Incremental] {
                let dir = layout::kind_dir(&self.client_prefix, &month, kind);
                for entry in self.remote.list(&dir).await? {
                    if committed.contains(&entry.path) {
                        continue;
                    }
                    let age_secs = now.timestamp() - entry.mtime;
                    if age_secs <= ORPHAN_GRACE_SECS {
                        continue;
                    }
                    tracing::info!(path = %entry.path, "Removing orphaned remote file");
                    self.remote.delete(&entry.path).await?;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}
