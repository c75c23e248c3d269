//! Row types for the lineage store.

use rusqlite::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Full,
    Incremental,
}

impl ArchiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveKind::Full => "full",
            ArchiveKind::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(ArchiveKind::Full),
            "incremental" => Some(ArchiveKind::Incremental),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Pending,
    Running,
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Pending => "pending",
            RunOutcome::Running => "running",
            RunOutcome::Success => "success",
            RunOutcome::Partial => "partial",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunOutcome::Pending),
            "running" => Some(RunOutcome::Running),
            "success" => Some(RunOutcome::Success),
            "partial" => Some(RunOutcome::Partial),
            "failed" => Some(RunOutcome::Failed),
            "cancelled" => Some(RunOutcome::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunOutcome::Pending | RunOutcome::Running)
    }
}

/// A committed archive row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub id: i64,
    pub subvolume: String,
    pub snapshot_ts: String,
    pub kind: ArchiveKind,
    pub parent_ts: Option<String>,
    pub month_bucket: String,
    pub remote_path: String,
    pub local_path: String,
    pub size_bytes: i64,
    pub digest: String,
    pub compress_algo: String,
    pub sent_at: String,
}

/// Input to `record_commit`; `sent_at` is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewArchive {
    pub subvolume: String,
    pub snapshot_ts: String,
    pub kind: ArchiveKind,
    pub parent_ts: Option<String>,
    pub month_bucket: String,
    pub remote_path: String,
    pub local_path: String,
    pub size_bytes: i64,
    pub digest: String,
    pub compress_algo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub mode: String,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    /// Per-subvolume outcome map, e.g. `{"root": {"outcome": "success", ...}}`
    pub subvolumes: serde_json::Value,
}

impl RunRecord {
    pub fn new_pending(mode: &str) -> Self {
        RunRecord {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
            mode: mode.to_string(),
            outcome: RunOutcome::Pending,
            error: None,
            subvolumes: serde_json::json!({}),
        }
    }
}

pub(super) fn row_to_archive(row: &Row) -> rusqlite::Result<ArchiveRecord> {
    let kind_text: String = row.get("kind")?;
    Ok(ArchiveRecord {
        id: row.get("id")?,
        subvolume: row.get("subvolume")?,
        snapshot_ts: row.get("snapshot_ts")?,
        kind: ArchiveKind::parse(&kind_text).unwrap_or(ArchiveKind::Full),
        parent_ts: row.get("parent_ts")?,
        month_bucket: row.get("month_bucket")?,
        remote_path: row.get("remote_path")?,
        local_path: row.get("local_path")?,
        size_bytes: row.get("size_bytes")?,
        digest: row.get("digest")?,
        compress_algo: row.get("compress_algo")?,
        sent_at: row.get("sent_at")?,
    })
}

pub(super) fn row_to_run(row: &Row) -> rusqlite::Result<RunRecord> {
    let outcome_text: String = row.get("outcome")?;
    let subvolumes_text: String = row.get("subvolumes")?;
    Ok(RunRecord {
        id: row.get("id")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        mode: row.get("mode")?,
        outcome: RunOutcome::parse(&outcome_text).unwrap_or(RunOutcome::Failed),
        error: row.get("error")?,
        subvolumes: serde_json::from_str(&subvolumes_text)
            .unwrap_or_else(|_| serde_json::json!({})),
    })
}
