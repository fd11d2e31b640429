//! External caption and poetry generators.
//!
//! A generator is an opaque process speaking a one-shot JSON contract:
//! - captioning gets the image path as its last argument and prints
//!   `{"caption": "..."}`;
//! - poetry reads `{"caption": "..."}` on stdin and prints `{"poem": "..."}`.
//!
//! Either may print `{"error": "..."}` instead, which is treated as a failed run.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::error::GenerationError;

const STDERR_LOG_LIMIT: usize = 4096;

#[async_trait]
pub trait Generator: Send + Sync {
    /// Caption the image stored at `image_path`.
    async fn caption(&self, image_path: &Path) -> Result<String, GenerationError>;

    /// Turn a caption into a poem.
    async fn poem(&self, caption: &str) -> Result<String, GenerationError>;
}

#[derive(Serialize)]
struct PoemRequest<'a> {
    caption: &'a str,
}

#[derive(Debug, Deserialize)]
struct CaptionReply {
    caption: String,
}

#[derive(Debug, Deserialize)]
struct PoemReply {
    poem: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Reply<T> {
    Done(T),
    Failed { error: String },
}

/// Program plus fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a command line on whitespace. `None` when it is blank.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }
}

/// Runs generators as child processes with a deadline and a cap on how many
/// run at once.
#[derive(Debug)]
pub struct ProcessGenerator {
    caption_cmd: CommandSpec,
    poem_cmd: CommandSpec,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ProcessGenerator {
    pub fn new(
        caption_cmd: CommandSpec,
        poem_cmd: CommandSpec,
        timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            caption_cmd,
            poem_cmd,
            timeout,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    async fn invoke<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        spec: &CommandSpec,
        extra_arg: Option<&OsStr>,
        payload: Option<Vec<u8>>,
    ) -> Result<T, GenerationError> {
        let deadline = Instant::now() + self.timeout;

        // Waiting for a slot counts against the same deadline.
        let _permit = tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| GenerationError::Timeout(self.timeout))?
            .map_err(|_| GenerationError::ProcessFailed {
                reason: "generator pool closed".to_string(),
            })?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(arg) = extra_arg {
            cmd.arg(arg);
        }
        cmd.stdin(if payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        // Own group, so a timeout can take down anything the generator forked.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| GenerationError::ProcessFailed {
            reason: format!("failed to spawn {}: {e}", spec.program),
        })?;
        tracing::debug!(operation, program = %spec.program, pid = ?child.id(), "generator started");
        let mut group = GroupGuard::new(child.id());

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let feed = async {
                if let (Some(mut pipe), Some(bytes)) = (stdin, payload) {
                    pipe.write_all(&bytes).await?;
                    pipe.shutdown().await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let (fed, out, err, status) =
                tokio::join!(feed, read_pipe(stdout), read_pipe(stderr), child.wait());
            if let Err(e) = fed {
                tracing::debug!(operation, error = %e, "generator closed stdin early");
            }
            Ok::<_, std::io::Error>((status?, out?, err?))
        };
        let outcome = tokio::time::timeout_at(deadline, run).await;

        let (status, stdout, stderr) = match outcome {
            Ok(Ok(done)) => {
                group.disarm();
                done
            }
            Ok(Err(e)) => {
                group.kill();
                let _ = child.kill().await;
                return Err(GenerationError::ProcessFailed {
                    reason: format!("i/o with generator failed: {e}"),
                });
            }
            Err(_) => {
                group.kill();
                // kill() also reaps, so no zombie is left behind.
                if let Err(e) = child.kill().await {
                    tracing::warn!(operation, error = %e, "failed to kill timed out generator");
                }
                tracing::warn!(operation, timeout = ?self.timeout, "generator timed out");
                return Err(GenerationError::Timeout(self.timeout));
            }
        };

        if !status.success() {
            tracing::warn!(
                operation,
                status = %status,
                stderr = %lossy_prefix(&stderr, STDERR_LOG_LIMIT),
                "generator exited unsuccessfully"
            );
            return Err(GenerationError::ProcessFailed {
                reason: format!("generator {status}"),
            });
        }

        parse_reply(&stdout)
    }
}

#[async_trait]
impl Generator for ProcessGenerator {
    async fn caption(&self, image_path: &Path) -> Result<String, GenerationError> {
        let reply: CaptionReply = self
            .invoke("caption", &self.caption_cmd, Some(image_path.as_os_str()), None)
            .await?;
        Ok(reply.caption)
    }

    async fn poem(&self, caption: &str) -> Result<String, GenerationError> {
        let payload = serde_json::to_vec(&PoemRequest { caption })
            .map_err(|e| GenerationError::MalformedOutput(e.to_string()))?;
        let reply: PoemReply = self
            .invoke("poem", &self.poem_cmd, None, Some(payload))
            .await?;
        Ok(reply.poem)
    }
}

/// SIGKILLs the generator's whole process group on `kill` or drop, unless
/// the generator finished on its own first.
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, error = %e, "failed to kill generator process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Parse the whole output first; if the generator logged noise before its
/// reply, fall back to the last non-empty line.
fn parse_reply<T: DeserializeOwned>(stdout: &[u8]) -> Result<T, GenerationError> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();

    let reply = serde_json::from_str::<Reply<T>>(text)
        .or_else(|first| {
            text.lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .and_then(|line| serde_json::from_str(line).ok())
                .ok_or(first)
        })
        .map_err(|e| GenerationError::MalformedOutput(e.to_string()))?;

    match reply {
        Reply::Done(value) => Ok(value),
        Reply::Failed { error } => Err(GenerationError::ProcessFailed { reason: error }),
    }
}

fn lossy_prefix(bytes: &[u8], limit: usize) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(limit)]).into_owned()
}

/// In-memory generator for exercising the pipeline without child processes.
///
/// Captions echo the stored image bytes, poems echo the caption. Every poem
/// request is recorded as the JSON document a real process would receive.
#[derive(Debug, Default)]
pub struct FakeGenerator {
    fail_captions: bool,
    fail_poems: bool,
    poem_requests: Mutex<Vec<String>>,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_captions(mut self) -> Self {
        self.fail_captions = true;
        self
    }

    pub fn failing_poems(mut self) -> Self {
        self.fail_poems = true;
        self
    }

    pub fn poem_requests(&self) -> Vec<String> {
        self.poem_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn caption(&self, image_path: &Path) -> Result<String, GenerationError> {
        if self.fail_captions {
            return Err(GenerationError::ProcessFailed {
                reason: "generator exit status: 1".to_string(),
            });
        }
        let bytes = tokio::fs::read(image_path)
            .await
            .map_err(|e| GenerationError::ProcessFailed {
                reason: e.to_string(),
            })?;
        Ok(format!("a photo of {}", String::from_utf8_lossy(&bytes)))
    }

    async fn poem(&self, caption: &str) -> Result<String, GenerationError> {
        let request = serde_json::to_string(&PoemRequest { caption })
            .map_err(|e| GenerationError::MalformedOutput(e.to_string()))?;
        self.poem_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        if self.fail_poems {
            return Err(GenerationError::Timeout(Duration::from_secs(30)));
        }
        Ok(format!("Roses are red,\n{caption}"))
    }
}
