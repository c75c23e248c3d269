//! Per-run orchestration: the sequence a single backup run walks through.
//!
//! Preconditions were already checked by the controller. The run itself:
//! pre-run orphan cleanup, then for each subvolume in config order decide
//! the mode, snapshot, and stream; then the verification marker and the
//! retention reaper. Per-subvolume failures do not stop the run;
//! cancellation does.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SubvolumeSpec};
use crate::pipeline::progress::ProgressRecorder;
use crate::pipeline::{ArchivePlan, PipelineRunner};
use crate::policy::{FullReason, PlannedMode, PolicyEngine};
use crate::remote::{layout, RemoteChannel};
use crate::retention::RetentionReaper;
use crate::snapshot::{self, SnapshotSource};
use crate::stages::compress::CompressAlgo;
use crate::stages::keyfile::StreamKey;
use crate::store::{LineageStore, RunOutcome};
use crate::utils::errors::AgentError;

pub struct RunContext {
    pub run_id: String,
    pub config: Arc<Config>,
    pub store: Arc<LineageStore>,
    pub remote: Arc<dyn RemoteChannel>,
    pub source: Arc<dyn SnapshotSource>,
    pub key: Arc<StreamKey>,
    pub recorder: ProgressRecorder,
    pub cancel: CancellationToken,
    pub force_full: bool,
    /// Calendar day (local timezone) the run was started on
    pub today: chrono::NaiveDate,
    pub subvolumes: Vec<SubvolumeSpec>,
}

#[derive(Debug, PartialEq, Eq)]
enum SubvolumeOutcome {
    Success,
    Failed,
    Cancelled,
    Skipped,
}

impl SubvolumeOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SubvolumeOutcome::Success => "success",
            SubvolumeOutcome::Failed => "failed",
            SubvolumeOutcome::Cancelled => "cancelled",
            SubvolumeOutcome::Skipped => "skipped",
        }
    }
}

pub async fn execute(ctx: RunContext) {
    let run_id = ctx.run_id.clone();
    if let Err(e) = ctx
        .store
        .mark_run(&run_id, RunOutcome::Running, None, serde_json::json!({}), false)
        .await
    {
        tracing::error!(run_id = %run_id, error = %e, "Failed to mark run running");
    }

    let sampler = ctx.recorder.spawn_sampler(ctx.cancel.child_token());
    let outcome = run_inner(&ctx).await;
    sampler.abort();
    ctx.recorder.publish();

    tracing::info!(run_id = %run_id, outcome = outcome.as_str(), "Backup run finished");
}

async fn run_inner(ctx: &RunContext) -> RunOutcome {
    // The compress algorithm was validated with the config
    let algo = CompressAlgo::parse(&ctx.config.backup.compress_algo)
        .unwrap_or(CompressAlgo::Zstd);
    let client_prefix = ctx.config.client_prefix();

    let reaper = RetentionReaper::new(
        Arc::clone(&ctx.remote),
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.source),
        client_prefix.clone(),
        ctx.config.subvolumes.iter().map(|s| s.name.clone()).collect(),
        ctx.config.retention.clone(),
    );

    // Leftovers of failed uploads must never be observable as archives
    ctx.recorder.set_stage("", "cleaning up");
    match reaper.cleanup_orphans(Utc::now()).await {
        Ok(deleted) if deleted > 0 => {
            tracing::info!(deleted, "Removed orphaned remote files");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Pre-run orphan cleanup failed"),
    }

    let pipeline = PipelineRunner::new(
        Arc::clone(&ctx.remote),
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.key),
        algo,
        ctx.config.backup.compress_level,
        client_prefix.clone(),
    );
    let policy = PolicyEngine::new(&ctx.config.backup, &ctx.config.retention);

    let run_ts = snapshot::format_timestamp(Utc::now());
    let mut outcomes = serde_json::Map::new();
    let mut cancelled = false;
    let mut first_error: Option<String> = None;

    for spec in &ctx.subvolumes {
        if ctx.cancel.is_cancelled() {
            cancelled = true;
            outcomes.insert(
                spec.name.clone(),
                serde_json::json!({"outcome": SubvolumeOutcome::Skipped.as_str()}),
            );
            continue;
        }

        let (outcome, detail) =
            backup_subvolume(ctx, &pipeline, &policy, spec, &run_ts).await;
        if outcome == SubvolumeOutcome::Cancelled {
            cancelled = true;
        }
        if outcome == SubvolumeOutcome::Failed && first_error.is_none() {
            first_error = detail
                .get("error")
                .and_then(|e| e.as_str())
                .map(|e| format!("{}: {}", spec.name, e));
        }
        outcomes.insert(spec.name.clone(), detail);

        if let Err(e) = ctx
            .store
            .mark_run(
                &ctx.run_id,
                RunOutcome::Running,
                None,
                serde_json::Value::Object(outcomes.clone()),
                false,
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to checkpoint run outcomes");
        }
    }

    let final_outcome = roll_up(&outcomes, cancelled);

    if matches!(final_outcome, RunOutcome::Success | RunOutcome::Partial) {
        write_verification_marker(ctx, &client_prefix).await;
        ctx.recorder.set_stage("", "reaping");
        reaper.reap(Utc::now()).await;
    }

    ctx.recorder.set_stage("", "done");
    if let Err(e) = ctx
        .store
        .mark_run(
            &ctx.run_id,
            final_outcome,
            first_error,
            serde_json::Value::Object(outcomes),
            true,
        )
        .await
    {
        tracing::error!(run_id = %ctx.run_id, error = %e, "Failed to record final run outcome");
    }

    final_outcome
}

async fn backup_subvolume(
    ctx: &RunContext,
    pipeline: &PipelineRunner,
    policy: &PolicyEngine,
    spec: &SubvolumeSpec,
    run_ts: &str,
) -> (SubvolumeOutcome, serde_json::Value) {
    ctx.recorder.set_stage(&spec.name, "deciding mode");

    let planned = match policy
        .decide(&ctx.store, ctx.source.as_ref(), spec, ctx.force_full, ctx.today)
        .await
    {
        Ok(planned) => planned,
        Err(e) => {
            tracing::error!(subvolume = %spec.name, error = %e, "Policy decision failed");
            return (
                SubvolumeOutcome::Failed,
                serde_json::json!({
                    "outcome": SubvolumeOutcome::Failed.as_str(),
                    "error": e.to_string(),
                }),
            );
        }
    };

    let note = match &planned {
        PlannedMode::Full {
            reason: FullReason::ParentSnapshotMissing,
        } => Some("parent snapshot missing locally; upgraded to full"),
        _ => None,
    };
    let mode = planned.kind();

    ctx.recorder.set_stage(&spec.name, "creating snapshot");
    let snap = match ctx.source.create_snapshot(spec, run_ts).await {
        Ok(snap) => snap,
        Err(e) => {
            tracing::error!(subvolume = %spec.name, error = %e, "Snapshot creation failed");
            return (
                SubvolumeOutcome::Failed,
                serde_json::json!({
                    "outcome": SubvolumeOutcome::Failed.as_str(),
                    "mode": mode.as_str(),
                    "error": e.to_string(),
                }),
            );
        }
    };

    let (parent_record, parent_snapshot) = match planned {
        PlannedMode::Full { .. } => (None, None),
        PlannedMode::Incremental {
            parent,
            parent_snapshot,
        } => (Some(parent), Some(parent_snapshot)),
    };

    let plan = ArchivePlan {
        snapshot: snap,
        kind: mode,
        parent_record,
        parent_snapshot,
    };

    match pipeline
        .run_one(ctx.source.as_ref(), plan, &ctx.recorder, &ctx.cancel)
        .await
    {
        Ok(record) => {
            let mut detail = serde_json::json!({
                "outcome": SubvolumeOutcome::Success.as_str(),
                "mode": record.kind.as_str(),
                "remote_path": record.remote_path,
                "bytes": record.size_bytes,
            });
            if let Some(note) = note {
                detail["note"] = serde_json::Value::String(note.to_string());
            }
            (SubvolumeOutcome::Success, detail)
        }
        Err(AgentError::Cancelled) => {
            tracing::info!(subvolume = %spec.name, "Backup cancelled");
            (
                SubvolumeOutcome::Cancelled,
                serde_json::json!({
                    "outcome": SubvolumeOutcome::Cancelled.as_str(),
                    "mode": mode.as_str(),
                }),
            )
        }
        Err(e) => {
            tracing::error!(subvolume = %spec.name, error = %e, "Backup failed");
            (
                SubvolumeOutcome::Failed,
                serde_json::json!({
                    "outcome": SubvolumeOutcome::Failed.as_str(),
                    "mode": mode.as_str(),
                    "error": e.to_string(),
                }),
            )
        }
    }
}

fn roll_up(outcomes: &serde_json::Map<String, serde_json::Value>, cancelled: bool) -> RunOutcome {
    if cancelled {
        return RunOutcome::Cancelled;
    }
    let states: Vec<&str> = outcomes
        .values()
        .filter_map(|v| v.get("outcome").and_then(|o| o.as_str()))
        .collect();
    let successes = states.iter().filter(|s| **s == "success").count();
    if successes == states.len() && !states.is_empty() {
        RunOutcome::Success
    } else if successes > 0 {
        RunOutcome::Partial
    } else {
        RunOutcome::Failed
    }
}

/// Liveness marker for operators: one line, rewritten after each
/// successful run.
async fn write_verification_marker(ctx: &RunContext, client_prefix: &str) {
    let marker = format!(
        "{} {}\n",
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        ctx.config.agent.client_id
    );
    let path = layout::verification_path(client_prefix);
    if let Err(e) = ctx.remote.write_file(&path, marker.as_bytes()).await {
        tracing::warn!(path, error = %e, "Failed to write verification marker");
    }
}
