//! SSH implementation of the remote channel.
//!
//! Every operation drives a short-lived `ssh` subprocess with key-based
//! authentication and `BatchMode` (no interactive prompts). Streamed writes
//! go through `cat > <path>.part` with an atomic `mv` once the stream ends
//! cleanly; a failed or cancelled write removes the `.part` before the call
//! returns.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use super::{layout, ByteReader, RemoteChannel, RemoteEntry};
use crate::config::RemoteConfig;
use crate::utils::errors::{AgentError, Result};

/// Chunk size for the streamed copy into the remote writer.
const COPY_CHUNK: usize = 256 * 1024;

pub struct SshChannel {
    host: String,
    user: String,
    port: u16,
    key_path: PathBuf,
    connect_timeout: std::time::Duration,
}

impl SshChannel {
    pub fn from_config(remote: &RemoteConfig) -> Self {
        SshChannel {
            host: remote.host.clone(),
            user: remote.user.clone(),
            port: remote.port,
            key_path: remote.ssh_key_path.clone(),
            connect_timeout: std::time::Duration::from_secs(remote.connect_timeout_seconds),
        }
    }

    fn command(&self, remote_cmd: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ))
            .arg("-i")
            .arg(&self.key_path)
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@{}", self.user, self.host))
            .arg(remote_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a remote command to completion and capture its output.
    async fn exec(&self, remote_cmd: &str) -> Result<ExecOutput> {
        let output = self
            .command(remote_cmd)
            .output()
            .await
            .map_err(|e| AgentError::Remote(format!("failed to spawn ssh: {}", e)))?;
        Ok(ExecOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn exec_checked(&self, remote_cmd: &str) -> Result<ExecOutput> {
        let out = self.exec(remote_cmd).await?;
        if out.success {
            Ok(out)
        } else {
            Err(AgentError::Remote(format!(
                "remote command failed: {} ({})",
                remote_cmd,
                out.stderr.trim()
            )))
        }
    }

    async fn remove_part(&self, part: &str) {
        if let Err(e) = self.exec(&format!("rm -f {}", quote(part))).await {
            tracing::warn!(part, error = %e, "Failed to remove partial upload");
        }
    }
}

struct ExecOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn check_connection(&self) -> Result<()> {
        let probe = tokio::time::timeout(
            self.connect_timeout + std::time::Duration::from_secs(5),
            self.exec("echo ok"),
        )
        .await
        .map_err(|_| AgentError::Precondition("remote connection probe timed out".into()))?
        .map_err(|e| AgentError::Precondition(format!("remote host unreachable: {}", e)))?;

        if probe.success && probe.stdout.trim() == "ok" {
            Ok(())
        } else {
            Err(AgentError::Precondition(format!(
                "remote host unreachable: {}",
                probe.stderr.trim()
            )))
        }
    }

    async fn ensure_dir(&self, path: &str) -> Result<()> {
        self.exec_checked(&format!("mkdir -p {}", quote(path)))
            .await?;
        Ok(())
    }

    async fn write_stream(
        &self,
        remote_path: &str,
        mut reader: ByteReader,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let part = layout::part_path(remote_path);

        let mut child = self
            .command(&format!("cat > {}", quote(&part)))
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| AgentError::Remote(format!("failed to spawn remote writer: {}", e)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Remote("remote writer has no stdin".into()))?;

        let mut written = 0u64;
        let mut buf = vec![0u8; COPY_CHUNK];
        let copy_result: Result<u64> = loop {
            let read = tokio::select! {
                r = reader.read(&mut buf) => r,
                _ = cancel.cancelled() => {
                    break Err(AgentError::Cancelled);
                }
            };
            match read {
                Ok(0) => break Ok(written),
                Ok(n) => {
                    let write = tokio::select! {
                        w = stdin.write_all(&buf[..n]) => w,
                        _ = cancel.cancelled() => {
                            break Err(AgentError::Cancelled);
                        }
                    };
                    if let Err(e) = write {
                        break Err(AgentError::Remote(format!("remote write failed: {}", e)));
                    }
                    written += n as u64;
                }
                Err(e) => break Err(AgentError::Io(e)),
            }
        };

        match copy_result {
            Ok(written) => {
                // Half-close the write side so the remote cat sees EOF
                drop(stdin);
                let status = child
                    .wait()
                    .await
                    .map_err(|e| AgentError::Remote(format!("remote writer wait: {}", e)))?;
                if !status.success() {
                    self.remove_part(&part).await;
                    return Err(AgentError::Remote(format!(
                        "remote writer exited with {}",
                        status
                    )));
                }
                if let Err(e) = self
                    .exec_checked(&format!(
                        "mv {} {}",
                        quote(&part),
                        quote(remote_path)
                    ))
                    .await
                {
                    self.remove_part(&part).await;
                    return Err(e);
                }
                Ok(written)
            }
            Err(e) => {
                drop(stdin);
                let _ = child.kill().await;
                self.remove_part(&part).await;
                Err(e)
            }
        }
    }

    async fn read_stream(&self, remote_path: &str) -> Result<ByteReader> {
        let mut child = self
            .command(&format!("cat {}", quote(remote_path)))
            .spawn()
            .map_err(|e| AgentError::Remote(format!("failed to spawn remote reader: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Remote("remote reader has no stdout".into()))?;
        Ok(Box::new(SshReadStream {
            _child: child,
            stdout,
        }))
    }

    async fn write_file(&self, remote_path: &str, contents: &[u8]) -> Result<()> {
        let mut child = self
            .command(&format!("cat > {}", quote(remote_path)))
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| AgentError::Remote(format!("failed to spawn remote writer: {}", e)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Remote("remote writer has no stdin".into()))?;
        stdin
            .write_all(contents)
            .await
            .map_err(|e| AgentError::Remote(format!("remote write failed: {}", e)))?;
        drop(stdin);
        let status = child
            .wait()
            .await
            .map_err(|e| AgentError::Remote(format!("remote writer wait: {}", e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(AgentError::Remote(format!(
                "remote file write exited with {}",
                status
            )))
        }
    }

    async fn stat(&self, remote_path: &str) -> Result<Option<RemoteEntry>> {
        let out = self
            .exec_checked(&format!(
                "if [ -e {p} ]; then stat -c '%s %Y' {p}; else echo NOT_FOUND; fi",
                p = quote(remote_path)
            ))
            .await?;
        let text = out.stdout.trim();
        if text == "NOT_FOUND" {
            return Ok(None);
        }
        let (size, mtime) = parse_stat_line(text).ok_or_else(|| {
            AgentError::Remote(format!("unparseable stat output: '{}'", text))
        })?;
        let name = remote_path.rsplit('/').next().unwrap_or(remote_path);
        Ok(Some(RemoteEntry {
            name: name.to_string(),
            path: remote_path.to_string(),
            size,
            mtime,
        }))
    }

    async fn read_header(&self, remote_path: &str, len: usize) -> Result<Vec<u8>> {
        let out = self
            .exec_checked(&format!(
                "head -c {} {} | base64",
                len,
                quote(remote_path)
            ))
            .await?;
        let compact: String = out.stdout.split_whitespace().collect();
        BASE64
            .decode(compact.as_bytes())
            .map_err(|e| AgentError::Remote(format!("bad header transport encoding: {}", e)))
    }

    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>> {
        let out = self
            .exec(&format!(
                "find {} -mindepth 1 -maxdepth 1 -type f -printf '%f\\t%s\\t%T@\\n' 2>/dev/null || true",
                quote(remote_dir)
            ))
            .await?;
        Ok(parse_find_output(&out.stdout, remote_dir))
    }

    async fn list_dirs(&self, remote_dir: &str) -> Result<Vec<String>> {
        let out = self
            .exec(&format!(
                "find {} -mindepth 1 -maxdepth 1 -type d -printf '%f\\n' 2>/dev/null || true",
                quote(remote_dir)
            ))
            .await?;
        let mut dirs: Vec<String> = out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        self.exec_checked(&format!("rm -f {}", quote(remote_path)))
            .await?;
        Ok(())
    }

    async fn delete_dir(&self, remote_dir: &str) -> Result<()> {
        self.exec_checked(&format!("rm -rf {}", quote(remote_dir)))
            .await?;
        Ok(())
    }
}

/// Keeps the ssh child alive for as long as its stdout is being read.
struct SshReadStream {
    _child: Child,
    stdout: ChildStdout,
}

impl tokio::io::AsyncRead for SshReadStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

/// Single-quote a path for the remote shell.
fn quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

fn parse_stat_line(line: &str) -> Option<(u64, i64)> {
    let mut parts = line.split_whitespace();
    let size = parts.next()?.parse::<u64>().ok()?;
    let mtime = parts.next()?.parse::<f64>().ok()? as i64;
    Some((size, mtime))
}

fn parse_find_output(stdout: &str, remote_dir: &str) -> Vec<RemoteEntry> {
    let mut entries: Vec<RemoteEntry> = stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let name = parts.next()?.to_string();
            let size = parts.next()?.parse::<u64>().ok()?;
            let mtime = parts.next()?.parse::<f64>().ok()? as i64;
            Some(RemoteEntry {
                path: format!("{}/{}", remote_dir.trim_end_matches('/'), name),
                name,
                size,
                mtime,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}
