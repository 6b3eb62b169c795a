//! Child-process filters: bytes in on stdin, bytes out on stdout.
//!
//! Feeding and draining run concurrently so a child that fills its stdout
//! pipe before finishing its input can never deadlock us. Every child is
//! registered with the session's [`ProcessTracker`] and killed and reaped
//! when the session is cancelled.

use std::collections::HashSet;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::{Result, TtsError};
use crate::session::SynthesisContext;
use crate::{into_audio_stream, AudioByteStream};

const STDERR_LIMIT: usize = 8 * 1024;

/// Program plus arguments for an external filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
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

    fn spawn(&self) -> Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TtsError::Spawn {
                program: self.program.clone(),
                source,
            })
    }
}

/// Live child processes owned by one session.
#[derive(Debug, Clone, Default)]
pub struct ProcessTracker {
    pids: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of children spawned and not yet reaped.
    pub fn active(&self) -> usize {
        self.pids.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.pids
            .lock()
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    fn register(&self, pid: u32) -> Registration {
        if let Ok(mut pids) = self.pids.lock() {
            pids.insert(pid);
        }
        Registration {
            tracker: self.clone(),
            pid,
        }
    }
}

struct Registration {
    tracker: ProcessTracker,
    pid: u32,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut pids) = self.tracker.pids.lock() {
            pids.remove(&self.pid);
        }
    }
}

/// Owns a spawned child until it has been reaped. Dropping it early kills
/// the child and reaps it in the background, releasing the tracker entry
/// only once the process is gone.
struct ChildGuard {
    child: Option<Child>,
    registration: Option<Registration>,
}

impl ChildGuard {
    fn new(child: Child, tracker: &ProcessTracker) -> Self {
        let registration = child.id().map(|pid| tracker.register(pid));
        Self {
            child: Some(child),
            registration,
        }
    }

    async fn kill(&mut self, program: &str) {
        if let Some(child) = self.child.as_mut() {
            match child.kill().await {
                Ok(()) => debug!(program, "filter process killed"),
                Err(e) => warn!(program, error = %e, "failed to kill filter process"),
            }
        }
        self.child = None;
        self.registration = None;
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = match self.child.as_mut() {
            Some(child) => child.wait().await,
            None => Err(std::io::Error::other("filter process already reaped")),
        };
        self.child = None;
        self.registration = None;
        status
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let _ = child.start_kill();
        let registration = self.registration.take();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = child.wait().await;
                drop(registration);
            });
        }
    }
}

enum Step {
    Cancelled,
    Output(Option<std::io::Result<bytes::Bytes>>),
}

/// Pipes `input` through the child described by `spec` and streams its
/// stdout in chunks of at most `ctx.chunk_bytes`.
///
/// A non-zero exit is reported after all stdout has been yielded, carrying
/// the child's stderr text. Cancellation kills and reaps the child and ends
/// the stream with [`TtsError::Cancelled`].
pub fn run_filter(
    spec: CommandSpec,
    input: AudioByteStream,
    ctx: SynthesisContext,
) -> AudioByteStream {
    into_audio_stream(try_stream! {
        let mut child = spec.spawn()?;
        debug!(program = %spec.program, pid = ?child.id(), "spawned filter process");

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe(&spec, "stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe(&spec, "stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe(&spec, "stderr"))?;
        let mut guard = ChildGuard::new(child, &ctx.processes);

        let feeder = tokio::spawn(feed(stdin, input));
        let stderr_task = tokio::spawn(collect_stderr(stderr));
        let mut output = ReaderStream::with_capacity(stdout, ctx.chunk_bytes.max(1));

        loop {
            let step = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Step::Cancelled,
                next = output.next() => Step::Output(next),
            };
            match step {
                Step::Cancelled => {
                    feeder.abort();
                    stderr_task.abort();
                    guard.kill(&spec.program).await;
                    Err::<(), _>(TtsError::Cancelled)?;
                }
                Step::Output(None) => break,
                Step::Output(Some(chunk)) => yield chunk?,
            }
        }

        let fed = feeder.await;
        let status = guard.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            Err::<(), _>(TtsError::ProcessFailed {
                program: spec.program.clone(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            })?;
        }
        match fed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => Err(e)?,
            Err(join) => Err(TtsError::Io(std::io::Error::other(join.to_string())))?,
        }
        if !stderr.trim().is_empty() {
            debug!(program = %spec.program, stderr = %stderr.trim(), "filter process wrote to stderr");
        }
    })
}

async fn feed(mut stdin: ChildStdin, mut input: AudioByteStream) -> Result<()> {
    while let Some(chunk) = input.next().await {
        let chunk = chunk?;
        if let Err(e) = stdin.write_all(&chunk).await {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                debug!("filter process closed its stdin early");
                return Ok(());
            }
            return Err(e.into());
        }
    }
    match stdin.shutdown().await {
        Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e.into()),
        _ => Ok(()),
    }
}

/// Reads stderr to the end, keeping only the first few kilobytes.
async fn collect_stderr<R: AsyncRead + Unpin>(mut stderr: R) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_LIMIT.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

fn missing_pipe(spec: &CommandSpec, pipe: &str) -> TtsError {
    TtsError::Spawn {
        program: spec.program.clone(),
        source: std::io::Error::other(format!("{pipe} was not captured")),
    }
}
