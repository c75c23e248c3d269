//! Policy engine: full vs incremental, per subvolume.
//!
//! A subvolume goes full when any trigger fires; otherwise it rides the
//! incremental chain off the most recent committed archive. A parent whose
//! local snapshot has vanished downgrades the run to full silently (with an
//! advisory note), since a relative send stream needs the parent on disk.

use chrono::{Datelike, NaiveDate};

use crate::config::{BackupConfig, RetentionConfig, SubvolumeSpec};
use crate::snapshot::{self, Snapshot, SnapshotSource};
use crate::store::{ArchiveKind, ArchiveRecord, LineageStore};
use crate::utils::errors::Result;

/// Why a subvolume was planned as a full backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullReason {
    Forced,
    FirstOfMonth,
    NoCommittedFull,
    FullTooOld,
    ChainTooLong,
    ParentSnapshotMissing,
}

impl FullReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FullReason::Forced => "forced",
            FullReason::FirstOfMonth => "first of month",
            FullReason::NoCommittedFull => "no committed full",
            FullReason::FullTooOld => "last full too old",
            FullReason::ChainTooLong => "incremental chain too long",
            FullReason::ParentSnapshotMissing => "parent snapshot missing locally",
        }
    }
}

#[derive(Debug)]
pub enum PlannedMode {
    Full {
        reason: FullReason,
    },
    Incremental {
        parent: ArchiveRecord,
        parent_snapshot: Snapshot,
    },
}

impl PlannedMode {
    pub fn kind(&self) -> ArchiveKind {
        match self {
            PlannedMode::Full { .. } => ArchiveKind::Full,
            PlannedMode::Incremental { .. } => ArchiveKind::Incremental,
        }
    }
}

pub struct PolicyEngine {
    full_interval_days: i64,
    daily_incremental_days: i64,
}

impl PolicyEngine {
    pub fn new(backup: &BackupConfig, retention: &RetentionConfig) -> Self {
        PolicyEngine {
            full_interval_days: backup.full_interval_days,
            daily_incremental_days: retention.daily_incremental_days,
        }
    }

    /// Decide the mode for one subvolume. `today` is the calendar day in
    /// the local timezone (passed in so tests are deterministic).
    pub async fn decide(
        &self,
        store: &LineageStore,
        source: &dyn SnapshotSource,
        spec: &SubvolumeSpec,
        force_full: bool,
        today: NaiveDate,
    ) -> Result<PlannedMode> {
        if force_full {
            return Ok(PlannedMode::Full {
                reason: FullReason::Forced,
            });
        }
        if today.day() == 1 {
            return Ok(PlannedMode::Full {
                reason: FullReason::FirstOfMonth,
            });
        }

        let Some(last_full) = store.latest_committed_full(&spec.name).await? else {
            return Ok(PlannedMode::Full {
                reason: FullReason::NoCommittedFull,
            });
        };

        if let Some(taken_at) = snapshot::parse_timestamp(&last_full.snapshot_ts) {
            let age_days = (today - taken_at.date_naive()).num_days();
            if age_days > self.full_interval_days {
                return Ok(PlannedMode::Full {
                    reason: FullReason::FullTooOld,
                });
            }
        }

        if store.chain_length_since_full(&spec.name).await? >= self.daily_incremental_days {
            return Ok(PlannedMode::Full {
                reason: FullReason::ChainTooLong,
            });
        }

        let Some(parent) = store
            .find_parent_candidate(&spec.name, ArchiveKind::Incremental)
            .await?
        else {
            return Ok(PlannedMode::Full {
                reason: FullReason::NoCommittedFull,
            });
        };

        match source.find_snapshot(&spec.name, &parent.snapshot_ts).await? {
            Some(parent_snapshot) => Ok(PlannedMode::Incremental {
                parent,
                parent_snapshot,
            }),
            None => {
                tracing::warn!(
                    subvolume = %spec.name,
                    parent_ts = %parent.snapshot_ts,
                    "Parent snapshot missing on disk; upgrading to full"
                );
                Ok(PlannedMode::Full {
                    reason: FullReason::ParentSnapshotMissing,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfig, RetentionConfig};
    use crate::store::NewArchive;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Minimal snapshot source: a fixed set of on-disk snapshots.
    struct FixedSnapshots {
        snapshots: Mutex<Vec<Snapshot>>,
    }

    impl FixedSnapshots {
        fn with(snapshots: Vec<Snapshot>) -> Self {
            FixedSnapshots {
                snapshots: Mutex::new(snapshots),
            }
        }
    }

    #[async_trait]
    impl SnapshotSource for FixedSnapshots {
        async fn probe(&self, _spec: &SubvolumeSpec) -> Result<()> {
            Ok(())
        }

        async fn create_snapshot(
            &self,
            spec: &SubvolumeSpec,
            timestamp: &str,
        ) -> Result<Snapshot> {
            let snap = make_snapshot(&spec.name, timestamp);
            self.snapshots.lock().unwrap().push(snap.clone());
            Ok(snap)
        }

        async fn list_snapshots(&self, subvolume: &str) -> Result<Vec<Snapshot>> {
            let mut list: Vec<Snapshot> = self
                .snapshots
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.subvolume == subvolume)
                .cloned()
                .collect();
            list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            Ok(list)
        }

        async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
            self.snapshots
                .lock()
                .unwrap()
                .retain(|s| s.local_path != snapshot.local_path);
            Ok(())
        }

        async fn open_send(
            &self,
            _snapshot: &Snapshot,
            _parent: Option<&Snapshot>,
        ) -> Result<Box<dyn crate::snapshot::SendStream>> {
            unimplemented!("policy tests never open streams")
        }
    }

    fn make_snapshot(subvolume: &str, ts: &str) -> Snapshot {
        Snapshot {
            subvolume: subvolume.to_string(),
            timestamp: ts.to_string(),
            local_path: PathBuf::from(format!("/.snapshots/{}-{}", subvolume, ts)),
            taken_at: snapshot::parse_timestamp(ts).unwrap(),
        }
    }

    fn spec() -> SubvolumeSpec {
        SubvolumeSpec {
            name: "root".to_string(),
            source_path: PathBuf::from("/"),
        }
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::new(&BackupConfig::default(), &RetentionConfig::default())
    }

    async fn commit(store: &LineageStore, ts: &str, kind: ArchiveKind, parent: Option<&str>) {
        store
            .record_commit(NewArchive {
                subvolume: "root".to_string(),
                snapshot_ts: ts.to_string(),
                kind,
                parent_ts: parent.map(|p| p.to_string()),
                month_bucket: ts[..6].to_string(),
                remote_path: format!("/b/c/{}/{}/root_{}.zst.enc", &ts[..6], kind.as_str(), ts),
                local_path: format!("/.snapshots/root-{}", ts),
                size_bytes: 1,
                digest: "d".into(),
                compress_algo: "zstd".into(),
            })
            .await
            .unwrap();
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_empty_store_forces_full() {
        let dir = TempDir::new().unwrap();
        let store = LineageStore::open(&dir.path().join("db")).unwrap();
        let source = FixedSnapshots::with(vec![]);

        let mode = engine()
            .decide(&store, &source, &spec(), false, day(2026, 6, 15))
            .await
            .unwrap();
        assert!(
            matches!(mode, PlannedMode::Full { reason: FullReason::NoCommittedFull }),
            "{mode:?}"
        );
    }

    #[tokio::test]
    async fn test_force_and_first_of_month() {
        let dir = TempDir::new().unwrap();
        let store = LineageStore::open(&dir.path().join("db")).unwrap();
        let source = FixedSnapshots::with(vec![make_snapshot("root", "20260614-020000")]);
        commit(&store, "20260614-020000", ArchiveKind::Full, None).await;

        let mode = engine()
            .decide(&store, &source, &spec(), true, day(2026, 6, 15))
            .await
            .unwrap();
        assert!(matches!(mode, PlannedMode::Full { reason: FullReason::Forced }));

        let mode = engine()
            .decide(&store, &source, &spec(), false, day(2026, 7, 1))
            .await
            .unwrap();
        assert!(matches!(mode, PlannedMode::Full { reason: FullReason::FirstOfMonth }));
    }

    #[tokio::test]
    async fn test_incremental_rides_latest_committed() {
        let dir = TempDir::new().unwrap();
        let store = LineageStore::open(&dir.path().join("db")).unwrap();
        let source = FixedSnapshots::with(vec![
            make_snapshot("root", "20260614-020000"),
            make_snapshot("root", "20260615-020000"),
        ]);
        commit(&store, "20260614-020000", ArchiveKind::Full, None).await;
        commit(
            &store,
            "20260615-020000",
            ArchiveKind::Incremental,
            Some("20260614-020000"),
        )
        .await;

        let mode = engine()
            .decide(&store, &source, &spec(), false, day(2026, 6, 16))
            .await
            .unwrap();
        match mode {
            PlannedMode::Incremental { parent, parent_snapshot } => {
                assert_eq!(parent.snapshot_ts, "20260615-020000");
                assert_eq!(parent_snapshot.timestamp, "20260615-020000");
            }
            other => panic!("expected incremental, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_old_full_triggers_full() {
        let dir = TempDir::new().unwrap();
        let store = LineageStore::open(&dir.path().join("db")).unwrap();
        let source = FixedSnapshots::with(vec![make_snapshot("root", "20260401-020000")]);
        commit(&store, "20260401-020000", ArchiveKind::Full, None).await;

        let mode = engine()
            .decide(&store, &source, &spec(), false, day(2026, 6, 15))
            .await
            .unwrap();
        assert!(matches!(mode, PlannedMode::Full { reason: FullReason::FullTooOld }));
    }

    #[tokio::test]
    async fn test_long_chain_triggers_full() {
        let dir = TempDir::new().unwrap();
        let store = LineageStore::open(&dir.path().join("db")).unwrap();
        let mut snaps = vec![make_snapshot("root", "20260601-020000")];
        commit(&store, "20260601-020000", ArchiveKind::Full, None).await;

        let mut parent = "20260601-020000".to_string();
        for day_of_month in 2..=4 {
            let ts = format!("202606{:02}-020000", day_of_month);
            commit(&store, &ts, ArchiveKind::Incremental, Some(&parent)).await;
            snaps.push(make_snapshot("root", &ts));
            parent = ts;
        }
        let source = FixedSnapshots::with(snaps);

        let engine = PolicyEngine {
            full_interval_days: 30,
            daily_incremental_days: 3,
        };
        let mode = engine
            .decide(&store, &source, &spec(), false, day(2026, 6, 5))
            .await
            .unwrap();
        assert!(matches!(mode, PlannedMode::Full { reason: FullReason::ChainTooLong }));
    }

    #[tokio::test]
    async fn test_missing_parent_snapshot_downgrades_to_full() {
        let dir = TempDir::new().unwrap();
        let store = LineageStore::open(&dir.path().join("db")).unwrap();
        // Committed parent exists in the store but not on disk
        let source = FixedSnapshots::with(vec![]);
        commit(&store, "20260614-020000", ArchiveKind::Full, None).await;

        let mode = engine()
            .decide(&store, &source, &spec(), false, day(2026, 6, 16))
            .await
            .unwrap();
        assert!(matches!(
            mode,
            PlannedMode::Full { reason: FullReason::ParentSnapshotMissing }
        ));
    }
}
