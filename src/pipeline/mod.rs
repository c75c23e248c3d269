//! Pipeline runner: streams one snapshot into one remote archive.
//!
//! Four stages run as concurrent tasks joined by bounded channels:
//!
//! ```text
//! snapshot send stream → compressor → encryptor → remote writer
//! ```
//!
//! The first fatal error from any stage cancels the others through a child
//! token; a failed or cancelled upload leaves no `.part` file behind and no
//! lineage row. On clean EOF the remote object is renamed into place,
//! verified, and committed — `record_commit` is the linearization point.

pub mod progress;

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::remote::{layout, RemoteChannel};
use crate::snapshot::{self, SendStream, Snapshot, SnapshotSource};
use crate::stages::compress::{self, CompressAlgo};
use crate::stages::crypt::FrameEncryptor;
use crate::stages::keyfile::StreamKey;
use crate::store::{ArchiveKind, ArchiveRecord, LineageStore, NewArchive};
use crate::utils::errors::{AgentError, Result};
use progress::{CountingReader, ProgressRecorder};

/// Chunk size flowing between stages.
const CHUNK_SIZE: usize = 256 * 1024;

/// In-flight chunks per inter-stage channel.
const CHANNEL_DEPTH: usize = 8;

/// Work order for a single archive.
pub struct ArchivePlan {
    pub snapshot: Snapshot,
    pub kind: ArchiveKind,
    pub parent_record: Option<ArchiveRecord>,
    pub parent_snapshot: Option<Snapshot>,
}

/// Item on the compressor → encryptor channel. The explicit EOF marker
/// distinguishes a clean end of stream from an upstream stage dying.
enum StageItem {
    Data(Bytes),
    Eof,
}

pub struct PipelineRunner {
    remote: Arc<dyn RemoteChannel>,
    store: Arc<LineageStore>,
    key: Arc<StreamKey>,
    algo: CompressAlgo,
    level: i32,
    client_prefix: String,
}

impl PipelineRunner {
    pub fn new(
        remote: Arc<dyn RemoteChannel>,
        store: Arc<LineageStore>,
        key: Arc<StreamKey>,
        algo: CompressAlgo,
        level: i32,
        client_prefix: String,
    ) -> Self {
        PipelineRunner {
            remote,
            store,
            key,
            algo,
            level,
            client_prefix,
        }
    }

    /// Stream one snapshot to the remote and commit it. Returns the
    /// committed record, or an error with all remote partial state cleaned.
    pub async fn run_one(
        &self,
        source: &dyn SnapshotSource,
        plan: ArchivePlan,
        recorder: &ProgressRecorder,
        cancel: &CancellationToken,
    ) -> Result<ArchiveRecord> {
        let snapshot = &plan.snapshot;
        let parent_ts = plan.parent_record.as_ref().map(|r| r.snapshot_ts.clone());

        // Defence in depth: the policy engine upgrades parentless
        // incrementals to full before we ever get here.
        if plan.kind == ArchiveKind::Incremental && parent_ts.is_none() {
            return Err(AgentError::MissingParent(snapshot.subvolume.clone()));
        }

        let month = snapshot::month_bucket(&snapshot.timestamp);
        let remote_dir = layout::kind_dir(&self.client_prefix, &month, plan.kind);
        let remote_path = layout::archive_path(
            &self.client_prefix,
            &month,
            plan.kind,
            &snapshot.subvolume,
            &snapshot.timestamp,
            parent_ts.as_deref(),
            self.algo.ext(),
        );

        if self.remote.stat(&remote_path).await?.is_some() {
            return Err(AgentError::RemoteConflict(remote_path));
        }
        self.remote.ensure_dir(&remote_dir).await?;

        tracing::info!(
            subvolume = %snapshot.subvolume,
            kind = plan.kind.as_str(),
            remote_path,
            parent = parent_ts.as_deref().unwrap_or("-"),
            "Starting archive upload"
        );
        recorder.set_stage(&snapshot.subvolume, "streaming");
        recorder.publish();

        let stream = source
            .open_send(snapshot, plan.parent_snapshot.as_ref())
            .await?;

        let (bytes_written, digest) = self
            .run_stages(stream, &remote_path, recorder, cancel)
            .await?;

        recorder.set_stage(&snapshot.subvolume, "verifying");
        recorder.publish();
        let verified = self.remote.verify_object(&remote_path, bytes_written).await?;
        if !verified {
            if let Err(e) = self.remote.delete(&remote_path).await {
                tracing::warn!(remote_path, error = %e, "Failed to remove unverified archive");
            }
            return Err(AgentError::Remote(format!(
                "verification of {} failed",
                remote_path
            )));
        }

        recorder.set_stage(&snapshot.subvolume, "committing");
        let commit = self
            .store
            .record_commit(NewArchive {
                subvolume: snapshot.subvolume.clone(),
                snapshot_ts: snapshot.timestamp.clone(),
                kind: plan.kind,
                parent_ts,
                month_bucket: month,
                remote_path: remote_path.clone(),
                local_path: snapshot.local_path.to_string_lossy().into_owned(),
                size_bytes: bytes_written as i64,
                digest,
                compress_algo: self.algo.as_str().to_string(),
            })
            .await;

        match commit {
            Ok(record) => {
                tracing::info!(
                    subvolume = %snapshot.subvolume,
                    remote_path,
                    bytes = bytes_written,
                    "Archive committed"
                );
                recorder.publish();
                Ok(record)
            }
            Err(e) => {
                // The object was renamed but never became visible; remove it
                // so it cannot be mistaken for a usable archive.
                if let Err(del) = self.remote.delete(&remote_path).await {
                    tracing::warn!(remote_path, error = %del, "Failed to remove uncommitted archive");
                }
                Err(e)
            }
        }
    }

    /// Drive the four stage tasks to completion. Returns encrypted bytes
    /// written and the digest of the encrypted stream.
    async fn run_stages(
        &self,
        stream: Box<dyn SendStream>,
        remote_path: &str,
        recorder: &ProgressRecorder,
        cancel: &CancellationToken,
    ) -> Result<(u64, String)> {
        let teardown = cancel.child_token();

        let (raw_writer, raw_reader) = tokio::io::duplex(CHUNK_SIZE);
        let (compressed_tx, compressed_rx) = mpsc::channel::<StageItem>(CHANNEL_DEPTH);
        let (encrypted_tx, encrypted_rx) = mpsc::channel::<std::io::Result<Bytes>>(CHANNEL_DEPTH);

        let pump = tokio::spawn(stage(
            teardown.clone(),
            pump_send_stream(
                stream,
                raw_writer,
                recorder.bytes_in_counter(),
                teardown.clone(),
            ),
        ));
        let compressor = tokio::spawn(stage(
            teardown.clone(),
            compress_chunks(
                self.algo,
                self.level,
                raw_reader,
                compressed_tx,
                teardown.clone(),
            ),
        ));
        let encryptor = tokio::spawn(stage(
            teardown.clone(),
            encrypt_frames(
                Arc::clone(&self.key),
                compressed_rx,
                encrypted_tx,
                teardown.clone(),
            ),
        ));

        let remote = Arc::clone(&self.remote);
        let out_counter = recorder.bytes_out_counter();
        let write_path = remote_path.to_string();
        let write_token = teardown.clone();
        let writer = tokio::spawn(stage(teardown.clone(), async move {
            let reader = CountingReader::new(ChannelReader::new(encrypted_rx), out_counter);
            remote
                .write_stream(&write_path, Box::new(reader), write_token)
                .await
        }));

        let (pump_res, comp_res, enc_res, write_res) =
            tokio::join!(pump, compressor, encryptor, writer);

        // Report the most meaningful error: a real fault beats the
        // cancellations it induced in the other stages.
        let mut fault: Option<AgentError> = None;
        keep_fault(flatten(pump_res), &mut fault);
        keep_fault(flatten(comp_res), &mut fault);
        let digest = keep_fault(flatten(enc_res), &mut fault);
        let bytes_written = keep_fault(flatten(write_res), &mut fault);

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if let Some(fault) = fault {
            return Err(fault);
        }
        match (bytes_written, digest) {
            (Some(bytes_written), Some(digest)) => Ok((bytes_written, digest)),
            _ => Err(AgentError::Fatal(
                "pipeline stages returned no result".into(),
            )),
        }
    }
}

/// Extract a stage value, remembering the first real error (cancellation is
/// only kept when no real fault surfaces).
fn keep_fault<T>(result: Result<T>, fault: &mut Option<AgentError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            let replace = match fault {
                None => true,
                Some(existing) => existing.is_cancelled() && !e.is_cancelled(),
            };
            if replace {
                *fault = Some(e);
            }
            None
        }
    }
}

/// Wrap a stage future so any error tears down the sibling stages.
async fn stage<T>(
    teardown: CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match fut.await {
        Ok(value) => Ok(value),
        Err(e) => {
            teardown.cancel();
            Err(e)
        }
    }
}

fn flatten<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(AgentError::Fatal(format!("pipeline stage panicked: {}", e))),
    }
}

/// Stage 1: copy the raw send stream into the compressor, counting source
/// bytes, then check that the producer terminated cleanly.
async fn pump_send_stream(
    mut stream: Box<dyn SendStream>,
    mut writer: tokio::io::DuplexStream,
    bytes_in: Arc<std::sync::atomic::AtomicU64>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            r = stream.reader().read(&mut buf) => r,
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                bytes_in.fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
                let write = tokio::select! {
                    w = writer.write_all(&buf[..n]) => w,
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                };
                write.map_err(|e| AgentError::Stream(format!("pipeline stalled: {}", e)))?;
            }
            Err(e) => return Err(AgentError::Stream(format!("send stream read: {}", e))),
        }
    }
    drop(writer);
    stream.finish().await
}

/// Stage 2: streaming compression into bounded chunks.
async fn compress_chunks(
    algo: CompressAlgo,
    level: i32,
    raw: tokio::io::DuplexStream,
    tx: mpsc::Sender<StageItem>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut encoder = compress::compress_reader(algo, level, BufReader::new(raw));
    loop {
        let mut chunk = BytesMut::with_capacity(CHUNK_SIZE);
        let read = tokio::select! {
            r = encoder.read_buf(&mut chunk) => r,
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let send = tokio::select! {
                    s = tx.send(StageItem::Data(chunk.freeze())) => s,
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                };
                if send.is_err() {
                    // Downstream died; its own error wins.
                    return Err(AgentError::Cancelled);
                }
            }
            Err(e) => return Err(AgentError::Compression(e.to_string())),
        }
    }
    let _ = tx.send(StageItem::Eof).await;
    Ok(())
}

/// Stage 3: frame encryption plus the streaming digest of the encrypted
/// bytes. Returns the hex digest.
async fn encrypt_frames(
    key: Arc<StreamKey>,
    mut rx: mpsc::Receiver<StageItem>,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    cancel: CancellationToken,
) -> Result<String> {
    let mut encryptor = FrameEncryptor::new(&key);
    let mut digest = Sha256::new();

    let header = Bytes::copy_from_slice(&encryptor.header());
    digest.update(&header);
    if tx.send(Ok(header)).await.is_err() {
        return Err(AgentError::Cancelled);
    }

    let result: Result<()> = async {
        loop {
            let item = tokio::select! {
                i = rx.recv() => i,
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            };
            match item {
                Some(StageItem::Data(chunk)) => {
                    let frame = Bytes::from(encryptor.seal_frame(&chunk)?);
                    digest.update(&frame);
                    let send = tokio::select! {
                        s = tx.send(Ok(frame)) => s,
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                    };
                    if send.is_err() {
                        return Err(AgentError::Cancelled);
                    }
                }
                Some(StageItem::Eof) => {
                    let trailer = Bytes::from(encryptor.seal_trailer()?);
                    digest.update(&trailer);
                    if tx.send(Ok(trailer)).await.is_err() {
                        return Err(AgentError::Cancelled);
                    }
                    return Ok(());
                }
                // Channel closed with no EOF marker: the compressor died.
                None => {
                    return Err(AgentError::Stream(
                        "compression stage ended unexpectedly".into(),
                    ))
                }
            }
        }
    }
    .await;

    match result {
        Ok(()) => Ok(hex_digest(digest)),
        Err(e) => {
            // Poison the writer so a half-encrypted stream is never renamed
            // into place.
            let _ = tx
                .send(Err(std::io::Error::other("encryption stage failed")))
                .await;
            Err(e)
        }
    }
}

fn hex_digest(digest: Sha256) -> String {
    digest
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// AsyncRead over the encryptor's output channel.
struct ChannelReader {
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<std::io::Result<Bytes>>) -> Self {
        ChannelReader {
            rx,
            current: Bytes::new(),
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.current.is_empty() {
                let take = self.current.len().min(buf.remaining());
                buf.put_slice(&self.current.split_to(take));
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.current = bytes;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
