//! Lineage store: durable record of committed archives and run history.
//!
//! Two tables back the whole engine. `snapshots_sent` holds one row per
//! committed archive; `runs` holds the outcome history. Only committed
//! archives are ever written here — an in-flight upload has no row, so it
//! can never be observed as a parent candidate. `record_commit` is the
//! linearization point for an archive becoming visible.

mod records;

pub use records::{ArchiveKind, ArchiveRecord, NewArchive, RunOutcome, RunRecord};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;

use crate::utils::errors::{AgentError, Result};

pub type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots_sent (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  subvolume TEXT NOT NULL,
  snapshot_ts TEXT NOT NULL,
  kind TEXT NOT NULL CHECK(kind IN ('full','incremental')),
  parent_ts TEXT,
  month_bucket TEXT NOT NULL,
  remote_path TEXT NOT NULL UNIQUE,
  local_path TEXT NOT NULL,
  size_bytes INTEGER NOT NULL,
  digest TEXT NOT NULL,
  compress_algo TEXT NOT NULL,
  sent_at TEXT NOT NULL,
  UNIQUE(subvolume, snapshot_ts)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_sent_subvol_ts
  ON snapshots_sent(subvolume, snapshot_ts DESC);
CREATE INDEX IF NOT EXISTS idx_snapshots_sent_month
  ON snapshots_sent(month_bucket);

CREATE TABLE IF NOT EXISTS runs (
  id TEXT PRIMARY KEY,
  started_at TEXT NOT NULL,
  finished_at TEXT,
  mode TEXT NOT NULL,
  outcome TEXT NOT NULL CHECK(outcome IN ('pending','running','success','partial','failed','cancelled')),
  error TEXT,
  subvolumes TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC);
"#;

/// Handle to the single-file lineage database.
///
/// All writes are synchronous-commit; calls run on the blocking pool so the
/// async pipeline never stalls on fsync.
#[derive(Clone)]
pub struct LineageStore {
    pool: DbPool,
}

impl LineageStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = DELETE;
                 PRAGMA synchronous = FULL;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = Pool::builder().max_size(4).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;

        Ok(LineageStore { pool })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| AgentError::Fatal(format!("store task panicked: {}", e)))?
    }

    /// Commit an archive row. Atomic; rejects duplicates by
    /// `(subvolume, snapshot_ts)` and incrementals whose parent has not
    /// itself been committed.
    pub async fn record_commit(&self, new: NewArchive) -> Result<ArchiveRecord> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;

            let dup: Option<i64> = tx
                .query_row(
                    "SELECT id FROM snapshots_sent WHERE subvolume = ? AND snapshot_ts = ?",
                    params![new.subvolume, new.snapshot_ts],
                    |row| row.get(0),
                )
                .optional()?;
            if dup.is_some() {
                return Err(AgentError::LineageViolation(format!(
                    "archive for {} at {} already committed",
                    new.subvolume, new.snapshot_ts
                )));
            }

            match (&new.kind, &new.parent_ts) {
                (ArchiveKind::Incremental, Some(parent_ts)) => {
                    let parent: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM snapshots_sent WHERE subvolume = ? AND snapshot_ts = ?",
                            params![new.subvolume, parent_ts],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if parent.is_none() {
                        return Err(AgentError::LineageViolation(format!(
                            "parent {} of incremental {} at {} is not committed",
                            parent_ts, new.subvolume, new.snapshot_ts
                        )));
                    }
                }
                (ArchiveKind::Incremental, None) => {
                    return Err(AgentError::LineageViolation(format!(
                        "incremental archive for {} has no parent timestamp",
                        new.subvolume
                    )));
                }
                (ArchiveKind::Full, Some(_)) => {
                    return Err(AgentError::LineageViolation(format!(
                        "full archive for {} carries a parent timestamp",
                        new.subvolume
                    )));
                }
                (ArchiveKind::Full, None) => {}
            }

            tx.execute(
                "INSERT INTO snapshots_sent
                   (subvolume, snapshot_ts, kind, parent_ts, month_bucket,
                    remote_path, local_path, size_bytes, digest, compress_algo, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    new.subvolume,
                    new.snapshot_ts,
                    new.kind.as_str(),
                    new.parent_ts,
                    new.month_bucket,
                    new.remote_path,
                    new.local_path,
                    new.size_bytes,
                    new.digest,
                    new.compress_algo,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            tx.commit()?;

            find_by_ts(conn, &new.subvolume, &new.snapshot_ts)?.ok_or_else(|| {
                AgentError::Fatal("committed archive row not readable after insert".into())
            })
        })
        .await
    }

    /// Most recent committed archive of any kind for a subvolume.
    pub async fn latest_committed(&self, subvolume: &str) -> Result<Option<ArchiveRecord>> {
        let subvolume = subvolume.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM snapshots_sent WHERE subvolume = ?
                 ORDER BY snapshot_ts DESC LIMIT 1",
            )?;
            let mut rows = stmt.query_map(params![subvolume], records::row_to_archive)?;
            Ok(rows.next().transpose()?)
        })
        .await
    }

    /// Most recent committed full archive for a subvolume.
    pub async fn latest_committed_full(&self, subvolume: &str) -> Result<Option<ArchiveRecord>> {
        let subvolume = subvolume.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM snapshots_sent WHERE subvolume = ? AND kind = 'full'
                 ORDER BY snapshot_ts DESC LIMIT 1",
            )?;
            let mut rows = stmt.query_map(params![subvolume], records::row_to_archive)?;
            Ok(rows.next().transpose()?)
        })
        .await
    }

    /// Parent candidate for a new archive: the most recent committed archive
    /// of any kind when incremental, none when full.
    pub async fn find_parent_candidate(
        &self,
        subvolume: &str,
        kind: ArchiveKind,
    ) -> Result<Option<ArchiveRecord>> {
        match kind {
            ArchiveKind::Full => Ok(None),
            ArchiveKind::Incremental => self.latest_committed(subvolume).await,
        }
    }

    /// Number of committed incrementals newer than the latest full.
    pub async fn chain_length_since_full(&self, subvolume: &str) -> Result<i64> {
        let subvolume = subvolume.to_string();
        self.with_conn(move |conn| {
            let last_full: Option<String> = conn
                .query_row(
                    "SELECT snapshot_ts FROM snapshots_sent
                     WHERE subvolume = ? AND kind = 'full'
                     ORDER BY snapshot_ts DESC LIMIT 1",
                    params![subvolume],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(full_ts) = last_full else {
                return Ok(0);
            };
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM snapshots_sent
                 WHERE subvolume = ? AND kind = 'incremental' AND snapshot_ts > ?",
                params![subvolume, full_ts],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    pub async fn find_by_ts(
        &self,
        subvolume: &str,
        snapshot_ts: &str,
    ) -> Result<Option<ArchiveRecord>> {
        let subvolume = subvolume.to_string();
        let snapshot_ts = snapshot_ts.to_string();
        self.with_conn(move |conn| find_by_ts(conn, &subvolume, &snapshot_ts))
            .await
    }

    pub async fn list_committed(&self, subvolume: Option<&str>) -> Result<Vec<ArchiveRecord>> {
        let subvolume = subvolume.map(|s| s.to_string());
        self.with_conn(move |conn| match subvolume {
            Some(sv) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM snapshots_sent WHERE subvolume = ? ORDER BY snapshot_ts DESC",
                )?;
                let rows = stmt.query_map(params![sv], records::row_to_archive)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM snapshots_sent ORDER BY snapshot_ts DESC")?;
                let rows = stmt.query_map([], records::row_to_archive)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            }
        })
        .await
    }

    pub async fn list_month(&self, month_bucket: &str) -> Result<Vec<ArchiveRecord>> {
        let month_bucket = month_bucket.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM snapshots_sent WHERE month_bucket = ?
                 ORDER BY subvolume, snapshot_ts DESC",
            )?;
            let rows = stmt.query_map(params![month_bucket], records::row_to_archive)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Distinct month buckets with committed archives, newest first.
    pub async fn months_with_archives(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT month_bucket FROM snapshots_sent ORDER BY month_bucket DESC",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Remote paths of every committed archive (orphan detection).
    pub async fn committed_remote_paths(&self) -> Result<HashSet<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT remote_path FROM snapshots_sent")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
        })
        .await
    }

    /// True if some committed incremental names this timestamp as parent.
    pub async fn has_dependent(&self, subvolume: &str, snapshot_ts: &str) -> Result<bool> {
        let subvolume = subvolume.to_string();
        let snapshot_ts = snapshot_ts.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM snapshots_sent WHERE subvolume = ? AND parent_ts = ?",
                params![subvolume, snapshot_ts],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    /// True if a full for this subvolume committed after the given timestamp.
    pub async fn has_full_since(&self, subvolume: &str, snapshot_ts: &str) -> Result<bool> {
        let subvolume = subvolume.to_string();
        let snapshot_ts = snapshot_ts.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM snapshots_sent
                 WHERE subvolume = ? AND kind = 'full' AND snapshot_ts > ?",
                params![subvolume, snapshot_ts],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    /// True if this local snapshot is the parent of any committed archive.
    pub async fn is_committed_parent(&self, subvolume: &str, snapshot_ts: &str) -> Result<bool> {
        self.has_dependent(subvolume, snapshot_ts).await
    }

    /// True if this snapshot has a committed archive row.
    pub async fn is_committed(&self, subvolume: &str, snapshot_ts: &str) -> Result<bool> {
        Ok(self.find_by_ts(subvolume, snapshot_ts).await?.is_some())
    }

    pub async fn remove_by_remote_path(&self, remote_path: &str) -> Result<bool> {
        let remote_path = remote_path.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "DELETE FROM snapshots_sent WHERE remote_path = ?",
                params![remote_path],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn remove_month(&self, month_bucket: &str) -> Result<usize> {
        let month_bucket = month_bucket.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "DELETE FROM snapshots_sent WHERE month_bucket = ?",
                params![month_bucket],
            )?;
            Ok(changed)
        })
        .await
    }

    /// Committed chain ending at `(subvolume, snapshot_ts)`: the archive
    /// itself, its parent, and so on back to a full, oldest first.
    /// Fails if any link is missing.
    pub async fn chain_to(&self, subvolume: &str, snapshot_ts: &str) -> Result<Vec<ArchiveRecord>> {
        let subvolume = subvolume.to_string();
        let snapshot_ts = snapshot_ts.to_string();
        self.with_conn(move |conn| {
            let mut chain = Vec::new();
            let mut cursor = Some(snapshot_ts.clone());
            while let Some(ts) = cursor {
                let record = find_by_ts(conn, &subvolume, &ts)?.ok_or_else(|| {
                    AgentError::LineageViolation(format!(
                        "restore chain for {} is broken: no committed archive at {}",
                        subvolume, ts
                    ))
                })?;
                cursor = record.parent_ts.clone();
                chain.push(record);
            }
            chain.reverse();
            Ok(chain)
        })
        .await
    }

    // -- runs ---------------------------------------------------------------

    pub async fn insert_run(&self, run: RunRecord) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO runs (id, started_at, finished_at, mode, outcome, error, subvolumes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.id,
                    run.started_at,
                    run.finished_at,
                    run.mode,
                    run.outcome.as_str(),
                    run.error,
                    run.subvolumes.to_string(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_run(
        &self,
        run_id: &str,
        outcome: RunOutcome,
        error: Option<String>,
        subvolumes: serde_json::Value,
        finished: bool,
    ) -> Result<()> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let finished_at = finished.then(|| chrono::Utc::now().to_rfc3339());
            conn.execute(
                "UPDATE runs SET outcome = ?1, error = ?2, subvolumes = ?3,
                        finished_at = COALESCE(?4, finished_at)
                 WHERE id = ?5",
                params![
                    outcome.as_str(),
                    error,
                    subvolumes.to_string(),
                    finished_at,
                    run_id
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM runs WHERE id = ?")?;
            let mut rows = stmt.query_map(params![run_id], records::row_to_run)?;
            Ok(rows.next().transpose()?)
        })
        .await
    }

    pub async fn list_runs(
        &self,
        limit: usize,
        offset: usize,
        outcome: Option<RunOutcome>,
    ) -> Result<Vec<RunRecord>> {
        self.with_conn(move |conn| match outcome {
            Some(filter) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM runs WHERE outcome = ?
                     ORDER BY started_at DESC LIMIT ? OFFSET ?",
                )?;
                let rows = stmt.query_map(
                    params![filter.as_str(), limit as i64, offset as i64],
                    records::row_to_run,
                )?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM runs ORDER BY started_at DESC LIMIT ? OFFSET ?")?;
                let rows =
                    stmt.query_map(params![limit as i64, offset as i64], records::row_to_run)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            }
        })
        .await
    }

    /// True if any run is in a non-terminal state. Used at startup to repair
    /// rows left behind by a crash.
    pub async fn repair_interrupted_runs(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE runs SET outcome = 'failed', error = 'interrupted by process exit',
                        finished_at = ?
                 WHERE outcome IN ('pending', 'running')",
                params![chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(changed)
        })
        .await
    }
}

fn find_by_ts(
    conn: &Connection,
    subvolume: &str,
    snapshot_ts: &str,
) -> Result<Option<ArchiveRecord>> {
    let mut stmt =
        conn.prepare("SELECT * FROM snapshots_sent WHERE subvolume = ? AND snapshot_ts = ?")?;
    let mut rows = stmt.query_map(params![subvolume, snapshot_ts], records::row_to_archive)?;
    Ok(rows.next().transpose()?)
}
