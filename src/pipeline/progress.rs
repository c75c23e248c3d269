//! Run progress sampling.
//!
//! Stage tasks bump shared byte counters; a sampler task publishes a
//! throttled [`ProgressSample`] through a watch channel at most four times
//! per second. `bytes_out` never decreases within a run because the
//! counters accumulate across subvolumes.

use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Sampler cadence; also the upper bound on publish frequency.
const SAMPLE_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSample {
    pub run_id: String,
    pub subvolume: String,
    pub stage: String,
    /// Raw send-stream bytes consumed
    pub bytes_in: u64,
    /// Encrypted bytes handed to the remote writer
    pub bytes_out: u64,
    pub elapsed_secs: u64,
    pub bytes_per_second: u64,
}

#[derive(Clone)]
pub struct ProgressRecorder {
    run_id: String,
    bytes_in: Arc<AtomicU64>,
    bytes_out: Arc<AtomicU64>,
    current: Arc<Mutex<(String, String)>>,
    tx: watch::Sender<Option<ProgressSample>>,
    started: Instant,
}

impl ProgressRecorder {
    pub fn new(run_id: &str) -> (Self, watch::Receiver<Option<ProgressSample>>) {
        let (tx, rx) = watch::channel(None);
        (
            ProgressRecorder {
                run_id: run_id.to_string(),
                bytes_in: Arc::new(AtomicU64::new(0)),
                bytes_out: Arc::new(AtomicU64::new(0)),
                current: Arc::new(Mutex::new((String::new(), "starting".to_string()))),
                tx,
                started: Instant::now(),
            },
            rx,
        )
    }

    pub fn set_stage(&self, subvolume: &str, stage: &str) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *current = (subvolume.to_string(), stage.to_string());
    }

    pub fn bytes_in_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes_in)
    }

    pub fn bytes_out_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes_out)
    }

    fn sample(&self, speed: u64) -> ProgressSample {
        let (subvolume, stage) = {
            let current = self.current.lock().unwrap_or_else(|p| p.into_inner());
            current.clone()
        };
        ProgressSample {
            run_id: self.run_id.clone(),
            subvolume,
            stage,
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            elapsed_secs: self.started.elapsed().as_secs(),
            bytes_per_second: speed,
        }
    }

    /// Publish one sample immediately (stage transitions, final state).
    pub fn publish(&self) {
        let _ = self.tx.send(Some(self.sample(0)));
    }

    /// Background sampler; runs until the token is cancelled.
    pub fn spawn_sampler(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let recorder = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            let mut last_bytes = 0u64;
            let mut last_time = Instant::now();

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancel.cancelled() => break,
                }

                let now = Instant::now();
                let total = recorder.bytes_out.load(Ordering::Relaxed);
                let elapsed = now.duration_since(last_time).as_secs_f64();
                let speed = if elapsed > 0.1 {
                    (total.saturating_sub(last_bytes) as f64 / elapsed) as u64
                } else {
                    0
                };
                last_bytes = total;
                last_time = now;

                let _ = recorder.tx.send(Some(recorder.sample(speed)));
            }
        })
    }
}

/// AsyncRead adapter that counts the bytes flowing through it.
pub struct CountingReader<R> {
    inner: R,
    counter: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, counter: Arc<AtomicU64>) -> Self {
        CountingReader { inner, counter }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                self.counter.fetch_add(read as u64, Ordering::Relaxed);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
