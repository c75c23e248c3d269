//! Restore engine: the inverse pipeline.
//!
//! A restore resolves the committed chain for the requested snapshot (full
//! plus every incremental up to it), verifies each remote object, then
//! applies the links in order: fetch → decrypt → decompress → receive.
//! A chain with any missing link fails up front — there is no partial
//! application. `verify_only` stops after the verification pass.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::Config;
use crate::remote::{ByteReader, RemoteChannel};
use crate::stages::compress::{self, CompressAlgo};
use crate::stages::crypt;
use crate::stages::keyfile::{self, StreamKey};
use crate::store::{ArchiveRecord, LineageStore};
use crate::utils::errors::{AgentError, Result};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RestoreRequest {
    pub subvolume: String,
    /// Snapshot timestamp (`YYYYMMDD-HHMMSS`) selecting the chain tip
    pub snapshot_ts: String,
    /// Directory the received subvolumes are created under
    pub target_path: PathBuf,
    #[serde(default)]
    pub verify_only: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RestoreDescriptor {
    pub restore_id: String,
    pub subvolume: String,
    pub snapshot_ts: String,
    pub chain_length: usize,
    pub verify_only: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RestoreStatus {
    pub running: bool,
    pub step: String,
    pub chain_applied: usize,
    pub chain_length: usize,
    pub error: Option<String>,
}

/// Where decrypted, decompressed send streams are applied. The production
/// sink feeds `btrfs receive`; tests collect bytes instead.
#[async_trait]
pub trait RestoreSink: Send + Sync {
    async fn receive(&self, target: &Path, reader: ByteReader) -> Result<u64>;
}

pub struct BtrfsReceive;

#[async_trait]
impl RestoreSink for BtrfsReceive {
    async fn receive(&self, target: &Path, mut reader: ByteReader) -> Result<u64> {
        tokio::fs::create_dir_all(target).await?;

        let mut child = Command::new("btrfs")
            .arg("receive")
            .arg(target)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Stream(format!("failed to start btrfs receive: {}", e)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Stream("btrfs receive has no stdin".into()))?;

        let copied = tokio::io::copy(&mut reader, &mut stdin).await?;
        stdin.flush().await?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AgentError::Stream(format!("btrfs receive wait: {}", e)))?;
        if !output.status.success() {
            return Err(AgentError::Stream(format!(
                "btrfs receive exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(copied)
    }
}

pub struct RestoreEngine {
    config: Arc<Config>,
    store: Arc<LineageStore>,
    remote: Arc<dyn RemoteChannel>,
    sink: Arc<dyn RestoreSink>,
    active: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    status: Arc<Mutex<RestoreStatus>>,
}

impl RestoreEngine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<LineageStore>,
        remote: Arc<dyn RemoteChannel>,
        sink: Arc<dyn RestoreSink>,
    ) -> Arc<Self> {
        Arc::new(RestoreEngine {
            config,
            store,
            remote,
            sink,
            active: tokio::sync::Mutex::new(None),
            status: Arc::new(Mutex::new(RestoreStatus::default())),
        })
    }

    pub fn status(&self) -> RestoreStatus {
        self.status.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_status(&self, update: impl FnOnce(&mut RestoreStatus)) {
        let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
        update(&mut status);
    }

    /// Start a restore in the background. The chain is resolved and
    /// verified synchronously so impossible restores fail immediately.
    pub async fn start(self: &Arc<Self>, request: RestoreRequest) -> Result<RestoreDescriptor> {
        let mut active = self.active.lock().await;
        if let Some(handle) = active.as_ref() {
            if !handle.is_finished() {
                return Err(AgentError::AlreadyRunning);
            }
            *active = None;
        }

        let key = keyfile::load(&self.config.keyfile_path())?;
        let chain = self
            .store
            .chain_to(&request.subvolume, &request.snapshot_ts)
            .await?;

        self.set_status(|s| {
            *s = RestoreStatus {
                running: true,
                step: "verifying chain".to_string(),
                chain_applied: 0,
                chain_length: chain.len(),
                error: None,
            }
        });

        for record in &chain {
            let ok = self
                .remote
                .verify_object(&record.remote_path, record.size_bytes as u64)
                .await?;
            if !ok {
                self.set_status(|s| {
                    s.running = false;
                    s.error = Some(format!("archive {} failed verification", record.remote_path));
                });
                return Err(AgentError::Remote(format!(
                    "archive {} failed verification; restore aborted",
                    record.remote_path
                )));
            }
        }

        let descriptor = RestoreDescriptor {
            restore_id: uuid::Uuid::new_v4().to_string(),
            subvolume: request.subvolume.clone(),
            snapshot_ts: request.snapshot_ts.clone(),
            chain_length: chain.len(),
            verify_only: request.verify_only,
        };

        if request.verify_only {
            self.set_status(|s| {
                s.running = false;
                s.step = "verified".to_string();
            });
            return Ok(descriptor);
        }

        let engine = Arc::clone(self);
        let key = Arc::new(key);
        let handle = tokio::spawn(async move {
            let result = engine.apply_chain(&key, &chain, &request.target_path).await;
            engine.set_status(|s| {
                s.running = false;
                match &result {
                    Ok(()) => s.step = "complete".to_string(),
                    Err(e) => {
                        s.step = "failed".to_string();
                        s.error = Some(e.to_string());
                    }
                }
            });
            if let Err(e) = result {
                tracing::error!(error = %e, "Restore failed");
            }
        });
        *active = Some(handle);

        Ok(descriptor)
    }

    async fn apply_chain(
        &self,
        key: &Arc<StreamKey>,
        chain: &[ArchiveRecord],
        target: &Path,
    ) -> Result<()> {
        for (index, record) in chain.iter().enumerate() {
            tracing::info!(
                remote_path = %record.remote_path,
                step = index + 1,
                of = chain.len(),
                "Applying restore chain link"
            );
            self.set_status(|s| {
                s.step = format!("applying {}", record.remote_path);
                s.chain_applied = index;
            });
            self.restore_one(key, record, target).await?;
            self.set_status(|s| s.chain_applied = index + 1);
        }
        Ok(())
    }

    /// Fetch → decrypt → decompress → receive for one chain link.
    async fn restore_one(
        &self,
        key: &Arc<StreamKey>,
        record: &ArchiveRecord,
        target: &Path,
    ) -> Result<()> {
        let algo = CompressAlgo::parse(&record.compress_algo)?;
        let mut remote_reader = self.remote.read_stream(&record.remote_path).await?;

        let (mut plain_writer, plain_reader) = tokio::io::duplex(256 * 1024);
        let decrypt_key = Arc::clone(key);
        let decrypt = tokio::spawn(async move {
            let result =
                crypt::decrypt_to_writer(&decrypt_key, &mut remote_reader, &mut plain_writer)
                    .await;
            plain_writer.shutdown().await.ok();
            result
        });

        let decompressed = compress::decompress_reader(algo, BufReader::new(plain_reader));
        let receive = self.sink.receive(target, decompressed);

        let (decrypt_res, receive_res) = tokio::join!(decrypt, receive);
        let decrypt_res = match decrypt_res {
            Ok(result) => result.map(|_| ()),
            Err(e) => Err(AgentError::Fatal(format!("decrypt task panicked: {}", e))),
        };

        // When both sides fail, surface the actionable fault, not the echo
        // the real fault induced on the other side of the pipe (same
        // arbitration the backup pipeline applies to its stages).
        match (decrypt_res, receive_res.map(|_| ())) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Err(decrypt), Err(receive)) => Err(pick_restore_fault(decrypt, receive)),
        }
    }
}

/// Choose between simultaneous decrypt and receive failures. A plain IO
/// error on the decrypt side is almost always the broken-pipe echo of the
/// receiver dying, so the receiver's error wins there; otherwise the
/// decrypt fault is the root cause (it feeds the receiver).
fn pick_restore_fault(decrypt: AgentError, receive: AgentError) -> AgentError {
    if matches!(decrypt, AgentError::Io(_)) {
        receive
    } else {
        decrypt
    }
}
