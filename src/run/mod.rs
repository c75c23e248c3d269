//! Run controller: Start/Cancel/Status with at-most-one active run.
//!
//! The controller owns the single process-wide "active run" slot. Start
//! checks preconditions synchronously — a run that cannot possibly succeed
//! never enters `running` — then spawns the orchestration task. Cancel
//! signals the run's cancellation token; the pipeline acknowledges only
//! after remote partial state is cleaned up.

pub mod orchestrate;

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SubvolumeSpec};
use crate::pipeline::progress::{ProgressRecorder, ProgressSample};
use crate::remote::RemoteChannel;
use crate::snapshot::SnapshotSource;
use crate::stages::keyfile;
use crate::store::{ArchiveKind, LineageStore, RunRecord};
use crate::utils::errors::{AgentError, Result};

#[derive(Debug, Default, Clone)]
pub struct StartRequest {
    /// Requested mode; `full` is equivalent to `force_full`, `incremental`
    /// lets the policy engine decide (it may still upgrade).
    pub mode: Option<ArchiveKind>,
    pub force_full: bool,
    /// Subset of configured subvolumes; `None` means all, in config order.
    pub subvolumes: Option<Vec<String>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RunStatus {
    pub run: Option<RunRecord>,
    pub progress: Option<ProgressSample>,
}

struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
    progress: watch::Receiver<Option<ProgressSample>>,
    handle: tokio::task::JoinHandle<()>,
}

/// Source of "today" for the calendar-based policy triggers; injectable so
/// tests are not hostage to the first of the month.
pub type TodayFn = Arc<dyn Fn() -> chrono::NaiveDate + Send + Sync>;

pub struct RunController {
    config: Arc<Config>,
    store: Arc<LineageStore>,
    remote: Arc<dyn RemoteChannel>,
    source: Arc<dyn SnapshotSource>,
    today: TodayFn,
    active: Mutex<Option<ActiveRun>>,
}

impl RunController {
    pub fn new(
        config: Arc<Config>,
        store: Arc<LineageStore>,
        remote: Arc<dyn RemoteChannel>,
        source: Arc<dyn SnapshotSource>,
    ) -> Arc<Self> {
        Self::with_today(
            config,
            store,
            remote,
            source,
            Arc::new(|| chrono::Local::now().date_naive()),
        )
    }

    pub fn with_today(
        config: Arc<Config>,
        store: Arc<LineageStore>,
        remote: Arc<dyn RemoteChannel>,
        source: Arc<dyn SnapshotSource>,
        today: TodayFn,
    ) -> Arc<Self> {
        Arc::new(RunController {
            config,
            store,
            remote,
            source,
            today,
            active: Mutex::new(None),
        })
    }

    /// Start a run. Fails synchronously with `AlreadyRunning` while another
    /// run is not terminal, or with a precondition error; in either case no
    /// run record enters `running`.
    pub async fn start(self: &Arc<Self>, request: StartRequest) -> Result<RunRecord> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            if !current.handle.is_finished() {
                return Err(AgentError::AlreadyRunning);
            }
            *active = None;
        }

        let force_full = request.force_full || request.mode == Some(ArchiveKind::Full);
        let subvolumes = self.select_subvolumes(request.subvolumes.as_deref())?;

        // Preconditions fail the start call itself; nothing enters `running`
        let key = keyfile::load_or_generate(&self.config.keyfile_path())?;
        for spec in &subvolumes {
            self.source.probe(spec).await?;
        }
        self.remote.check_connection().await?;

        let mode = if force_full { "full" } else { "auto" };
        let run = RunRecord::new_pending(mode);
        self.store.insert_run(run.clone()).await?;

        let cancel = CancellationToken::new();
        let (recorder, progress_rx) = ProgressRecorder::new(&run.id);

        let ctx = orchestrate::RunContext {
            run_id: run.id.clone(),
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            remote: Arc::clone(&self.remote),
            source: Arc::clone(&self.source),
            key: Arc::new(key),
            recorder,
            cancel: cancel.clone(),
            force_full,
            today: (self.today)(),
            subvolumes,
        };

        let controller = Arc::clone(self);
        let run_id = run.id.clone();
        let handle = tokio::spawn(async move {
            orchestrate::execute(ctx).await;
            let mut active = controller.active.lock().await;
            if active.as_ref().is_some_and(|a| a.run_id == run_id) {
                *active = None;
            }
        });

        *active = Some(ActiveRun {
            run_id: run.id.clone(),
            cancel,
            progress: progress_rx,
            handle,
        });

        tracing::info!(run_id = %run.id, mode, "Backup run started");
        Ok(run)
    }

    /// Signal cooperative cancellation. No-op (returns false) when no run
    /// is active.
    pub async fn cancel(&self) -> bool {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(current) if !current.handle.is_finished() => {
                tracing::info!(run_id = %current.run_id, "Cancellation requested");
                current.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Current run descriptor plus the latest progress sample; falls back
    /// to the most recent run in history when idle.
    pub async fn status(&self) -> Result<RunStatus> {
        let (run_id, progress) = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(current) => (
                    Some(current.run_id.clone()),
                    current.progress.borrow().clone(),
                ),
                None => (None, None),
            }
        };

        let run = match run_id {
            Some(id) => self.store.get_run(&id).await?,
            None => self.store.list_runs(1, 0, None).await?.into_iter().next(),
        };
        Ok(RunStatus { run, progress })
    }

    /// Wait for the active run to finish (used by tests and shutdown).
    pub async fn wait_idle(&self) {
        loop {
            {
                let active = self.active.lock().await;
                match active.as_ref() {
                    Some(current) if !current.handle.is_finished() => {}
                    _ => break,
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }

    fn select_subvolumes(&self, requested: Option<&[String]>) -> Result<Vec<SubvolumeSpec>> {
        match requested {
            None => Ok(self.config.subvolumes.clone()),
            Some(names) => {
                let mut selected = Vec::new();
                for spec in &self.config.subvolumes {
                    if names.iter().any(|n| n == &spec.name) {
                        selected.push(spec.clone());
                    }
                }
                for name in names {
                    if self.config.subvolume(name).is_none() {
                        return Err(AgentError::Precondition(format!(
                            "unknown subvolume '{}'",
                            name
                        )));
                    }
                }
                if selected.is_empty() {
                    return Err(AgentError::Precondition(
                        "no subvolumes selected".to_string(),
                    ));
                }
                Ok(selected)
            }
        }
    }
}
