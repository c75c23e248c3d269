//! In-memory doubles for the remote host, the snapshot source, and the
//! restore sink, plus a wired-up test environment.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use snapsend::config::{Config, SubvolumeSpec};
use snapsend::remote::{ByteReader, RemoteChannel, RemoteEntry};
use snapsend::restore::{RestoreEngine, RestoreSink};
use snapsend::run::RunController;
use snapsend::snapshot::{self, SendStream, Snapshot, SnapshotSource};
use snapsend::store::LineageStore;
use snapsend::utils::errors::{AgentError, Result};

// ---------------------------------------------------------------------------
// Remote double

#[derive(Debug, Clone)]
pub struct FailSpec {
    /// Fail writes whose remote path contains this substring
    pub path_contains: String,
    /// ... after this many bytes have been accepted
    pub after_bytes: u64,
}

#[derive(Default)]
struct RemoteState {
    files: BTreeMap<String, FileEntry>,
    dirs: BTreeSet<String>,
}

struct FileEntry {
    data: Vec<u8>,
    mtime: i64,
}

/// In-memory archival host with failure and latency injection.
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    pub reachable: AtomicBool,
    fail_on: Mutex<Option<FailSpec>>,
    write_delay: Mutex<Option<std::time::Duration>>,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryRemote {
            state: Mutex::new(RemoteState::default()),
            reachable: AtomicBool::new(true),
            fail_on: Mutex::new(None),
            write_delay: Mutex::new(None),
        })
    }

    pub fn inject_failure(&self, spec: FailSpec) {
        *self.fail_on.lock().unwrap() = Some(spec);
    }

    pub fn clear_failure(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    pub fn set_write_delay(&self, delay: Option<std::time::Duration>) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn file_names(&self) -> Vec<String> {
        self.state.lock().unwrap().files.keys().cloned().collect()
    }

    pub fn part_files(&self) -> Vec<String> {
        self.file_names()
            .into_iter()
            .filter(|p| p.ends_with(".part"))
            .collect()
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|f| f.data.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().unwrap().files.contains_key(path)
    }

    pub fn put_file(&self, path: &str, data: Vec<u8>, mtime: i64) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), FileEntry { data, mtime });
    }

    pub fn corrupt_file(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.files.get_mut(path) {
            entry.data.truncate(entry.data.len() / 2);
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[async_trait]
impl RemoteChannel for MemoryRemote {
    async fn check_connection(&self) -> Result<()> {
        if self.reachable.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(AgentError::Precondition("remote host unreachable".into()))
        }
    }

    async fn ensure_dir(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            state.dirs.insert(current.clone());
        }
        Ok(())
    }

    async fn write_stream(
        &self,
        remote_path: &str,
        mut reader: ByteReader,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let part = format!("{}.part", remote_path);
        let fail = self.fail_on.lock().unwrap().clone();
        let delay = *self.write_delay.lock().unwrap();

        let mut data = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        let result: Result<u64> = loop {
            let read = tokio::select! {
                r = reader.read(&mut buf) => r,
                _ = cancel.cancelled() => break Err(AgentError::Cancelled),
            };
            match read {
                Ok(0) => break Ok(data.len() as u64),
                Ok(n) => {
                    data.extend_from_slice(&buf[..n]);
                    self.put_file(&part, data.clone(), Self::now());
                    if let Some(fail) = &fail {
                        if remote_path.contains(&fail.path_contains)
                            && data.len() as u64 > fail.after_bytes
                        {
                            break Err(AgentError::Remote(format!(
                                "injected write failure at {} bytes",
                                data.len()
                            )));
                        }
                    }
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => break Err(AgentError::Remote(format!("stream read: {}", e))),
            }
        };

        match result {
            Ok(written) => {
                let mut state = self.state.lock().unwrap();
                state.files.remove(&part);
                state.files.insert(
                    remote_path.to_string(),
                    FileEntry {
                        data,
                        mtime: Self::now(),
                    },
                );
                Ok(written)
            }
            Err(e) => {
                self.state.lock().unwrap().files.remove(&part);
                Err(e)
            }
        }
    }

    async fn read_stream(&self, remote_path: &str) -> Result<ByteReader> {
        let data = self
            .file_data(remote_path)
            .ok_or_else(|| AgentError::Remote(format!("{} not found", remote_path)))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn write_file(&self, remote_path: &str, contents: &[u8]) -> Result<()> {
        self.put_file(remote_path, contents.to_vec(), Self::now());
        Ok(())
    }

    async fn stat(&self, remote_path: &str) -> Result<Option<RemoteEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.files.get(remote_path).map(|entry| RemoteEntry {
            name: remote_path.rsplit('/').next().unwrap_or("").to_string(),
            path: remote_path.to_string(),
            size: entry.data.len() as u64,
            mtime: entry.mtime,
        }))
    }

    async fn read_header(&self, remote_path: &str, len: usize) -> Result<Vec<u8>> {
        let data = self
            .file_data(remote_path)
            .ok_or_else(|| AgentError::Remote(format!("{} not found", remote_path)))?;
        Ok(data.into_iter().take(len).collect())
    }

    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>> {
        let dir = remote_dir.trim_end_matches('/');
        let prefix = format!("{}/", dir);
        let state = self.state.lock().unwrap();
        Ok(state
            .files
            .iter()
            .filter(|(path, _)| {
                path.starts_with(&prefix) && !path[prefix.len()..].contains('/')
            })
            .map(|(path, entry)| RemoteEntry {
                name: path[prefix.len()..].to_string(),
                path: path.clone(),
                size: entry.data.len() as u64,
                mtime: entry.mtime,
            })
            .collect())
    }

    async fn list_dirs(&self, remote_dir: &str) -> Result<Vec<String>> {
        let dir = remote_dir.trim_end_matches('/');
        let prefix = format!("{}/", dir);
        let state = self.state.lock().unwrap();
        let mut names = BTreeSet::new();
        for dir_path in &state.dirs {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                if let Some(first) = rest.split('/').next() {
                    if !first.is_empty() {
                        names.insert(first.to_string());
                    }
                }
            }
        }
        for file_path in state.files.keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                let mut parts = rest.split('/');
                if let (Some(first), Some(_)) = (parts.next(), parts.next()) {
                    names.insert(first.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        self.state.lock().unwrap().files.remove(remote_path);
        Ok(())
    }

    async fn delete_dir(&self, remote_dir: &str) -> Result<()> {
        let dir = remote_dir.trim_end_matches('/');
        let prefix = format!("{}/", dir);
        let mut state = self.state.lock().unwrap();
        state.files.retain(|path, _| !path.starts_with(&prefix));
        state
            .dirs
            .retain(|d| d != dir && !d.starts_with(&prefix));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Snapshot source double

/// Deterministic snapshot source. Each subvolume has mutable "live"
/// contents; a snapshot captures them. Send streams carry a small textual
/// envelope so tests can assert the full/incremental shape byte-for-byte.
pub struct MemorySnapshots {
    live: Mutex<HashMap<String, Vec<u8>>>,
    snapshots: Mutex<Vec<(Snapshot, Vec<u8>)>>,
}

impl MemorySnapshots {
    pub fn new() -> Arc<Self> {
        Arc::new(MemorySnapshots {
            live: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(Vec::new()),
        })
    }

    pub fn set_content(&self, subvolume: &str, data: &[u8]) {
        self.live
            .lock()
            .unwrap()
            .insert(subvolume.to_string(), data.to_vec());
    }

    pub fn remove_snapshot(&self, subvolume: &str, timestamp: &str) {
        self.snapshots
            .lock()
            .unwrap()
            .retain(|(s, _)| !(s.subvolume == subvolume && s.timestamp == timestamp));
    }

    pub fn snapshot_timestamps(&self, subvolume: &str) -> Vec<String> {
        let mut timestamps: Vec<String> = self
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s.subvolume == subvolume)
            .map(|(s, _)| s.timestamp.clone())
            .collect();
        timestamps.sort();
        timestamps
    }

    pub fn captured_content(&self, subvolume: &str, timestamp: &str) -> Option<Vec<u8>> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| s.subvolume == subvolume && s.timestamp == timestamp)
            .map(|(_, data)| data.clone())
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshots {
    async fn probe(&self, _spec: &SubvolumeSpec) -> Result<()> {
        Ok(())
    }

    async fn create_snapshot(&self, spec: &SubvolumeSpec, timestamp: &str) -> Result<Snapshot> {
        let mut snapshots = self.snapshots.lock().unwrap();
        if snapshots
            .iter()
            .any(|(s, _)| s.subvolume == spec.name && s.timestamp == timestamp)
        {
            return Err(AgentError::SnapshotCreate(format!(
                "snapshot {}-{} already exists",
                spec.name, timestamp
            )));
        }
        let data = self
            .live
            .lock()
            .unwrap()
            .get(&spec.name)
            .cloned()
            .unwrap_or_default();
        let snap = Snapshot {
            subvolume: spec.name.clone(),
            timestamp: timestamp.to_string(),
            local_path: PathBuf::from(format!("/.snapshots/{}-{}", spec.name, timestamp)),
            taken_at: snapshot::parse_timestamp(timestamp)
                .ok_or_else(|| AgentError::SnapshotCreate("bad timestamp".into()))?,
        };
        snapshots.push((snap.clone(), data));
        Ok(snap)
    }

    async fn list_snapshots(&self, subvolume: &str) -> Result<Vec<Snapshot>> {
        let mut list: Vec<Snapshot> = self
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s.subvolume == subvolume)
            .map(|(s, _)| s.clone())
            .collect();
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(list)
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.remove_snapshot(&snapshot.subvolume, &snapshot.timestamp);
        Ok(())
    }

    async fn open_send(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
    ) -> Result<Box<dyn SendStream>> {
        let data = self
            .captured_content(&snapshot.subvolume, &snapshot.timestamp)
            .ok_or_else(|| AgentError::Stream("snapshot not found".into()))?;

        let mut payload = Vec::new();
        match parent {
            None => payload.extend_from_slice(b"FULL\n"),
            Some(parent) => {
                if self
                    .captured_content(&parent.subvolume, &parent.timestamp)
                    .is_none()
                {
                    return Err(AgentError::Stream(format!(
                        "parent snapshot {} is missing on disk",
                        parent.timestamp
                    )));
                }
                payload.extend_from_slice(format!("INCR {}\n", parent.timestamp).as_bytes());
            }
        }
        payload.extend_from_slice(&data);

        Ok(Box::new(MemorySendStream {
            cursor: std::io::Cursor::new(payload),
        }))
    }
}

struct MemorySendStream {
    cursor: std::io::Cursor<Vec<u8>>,
}

#[async_trait]
impl SendStream for MemorySendStream {
    fn reader(&mut self) -> &mut (dyn tokio::io::AsyncRead + Send + Unpin) {
        &mut self.cursor
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Parse the envelope produced by [`MemorySnapshots::open_send`].
pub fn parse_stream(bytes: &[u8]) -> (String, Option<String>, Vec<u8>) {
    let newline = bytes.iter().position(|b| *b == b'\n').expect("envelope");
    let head = String::from_utf8_lossy(&bytes[..newline]).into_owned();
    let data = bytes[newline + 1..].to_vec();
    if head == "FULL" {
        ("full".to_string(), None, data)
    } else if let Some(parent) = head.strip_prefix("INCR ") {
        ("incremental".to_string(), Some(parent.to_string()), data)
    } else {
        panic!("unexpected stream head: {head}");
    }
}

// ---------------------------------------------------------------------------
// Restore sink double

pub struct MemorySink {
    received: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    fail_with: Mutex<Option<String>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(MemorySink {
            received: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        })
    }

    pub fn received(&self) -> Vec<(PathBuf, Vec<u8>)> {
        self.received.lock().unwrap().clone()
    }

    /// Make the next `receive` consume a little input and then fail with
    /// this message, like a receiver process dying mid-stream.
    pub fn inject_failure(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl RestoreSink for MemorySink {
    async fn receive(&self, target: &Path, mut reader: ByteReader) -> Result<u64> {
        let injected = self.fail_with.lock().unwrap().clone();
        if let Some(message) = injected {
            let mut buf = [0u8; 1024];
            let _ = reader.read(&mut buf).await;
            return Err(AgentError::Stream(message));
        }

        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let len = data.len() as u64;
        self.received
            .lock()
            .unwrap()
            .push((target.to_path_buf(), data));
        Ok(len)
    }
}

// ---------------------------------------------------------------------------
// Wired-up environment

pub struct TestEnv {
    pub _dir: TempDir,
    pub config: Arc<Config>,
    pub store: Arc<LineageStore>,
    pub remote: Arc<MemoryRemote>,
    pub source: Arc<MemorySnapshots>,
    pub sink: Arc<MemorySink>,
    pub controller: Arc<RunController>,
    pub restore: Arc<RestoreEngine>,
    today: Arc<Mutex<NaiveDate>>,
}

impl TestEnv {
    pub fn set_today(&self, date: NaiveDate) {
        *self.today.lock().unwrap() = date;
    }

    pub fn client_prefix(&self) -> String {
        self.config.client_prefix()
    }
}

pub fn test_env() -> TestEnv {
    let dir = TempDir::new().expect("tempdir");

    let mut config = Config::default();
    config.agent.client_id = "testbox".to_string();
    config.agent.data_dir = dir.path().join("data");
    config.remote.host = "archive.test".to_string();
    config.remote.base_path = "/backups".to_string();
    config.subvolumes = vec![
        SubvolumeSpec {
            name: "root".to_string(),
            source_path: dir.path().join("root"),
        },
        SubvolumeSpec {
            name: "home".to_string(),
            source_path: dir.path().join("home"),
        },
    ];
    let config = Arc::new(config);

    let store = Arc::new(LineageStore::open(&config.store_path()).expect("store"));
    let remote = MemoryRemote::new();
    let source = MemorySnapshots::new();
    let sink = MemorySink::new();

    source.set_content("root", b"root contents v1");
    source.set_content("home", b"home contents v1");

    let today = Arc::new(Mutex::new(
        NaiveDate::from_ymd_opt(2026, 6, 15).expect("date"),
    ));
    let today_for_controller = Arc::clone(&today);

    let controller = RunController::with_today(
        Arc::clone(&config),
        Arc::clone(&store),
        remote.clone(),
        source.clone(),
        Arc::new(move || *today_for_controller.lock().unwrap()),
    );

    let restore = RestoreEngine::new(
        Arc::clone(&config),
        Arc::clone(&store),
        remote.clone(),
        sink.clone(),
    );

    TestEnv {
        _dir: dir,
        config,
        store,
        remote,
        source,
        sink,
        controller,
        restore,
        today,
    }
}

/// Wait until the controller reports no active run.
pub async fn wait_for_run(env: &TestEnv) {
    env.controller.wait_idle().await;
}

/// Deterministic incompressible bytes, so compressed archive sizes track
/// input sizes and timing-sensitive tests see real streaming.
pub fn pseudorandom(len: usize) -> Vec<u8> {
    let mut state = 0x1234_5678u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}
