//! Duplex byte stream over one executed command

use bytes::Bytes;
use muxssh_control::MasterOpGuard;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::Result;

/// Exit status of a finished command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Whether the command exited with code 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Final report delivered by the reaper task once a command is gone.
pub(crate) struct ExitEvent {
    code: Option<i32>,
    signal: Option<i32>,
    stderr: String,
    wait_error: Option<String>,
}

impl ExitEvent {
    fn into_result(self) -> Result<ExitStatus> {
        match self.wait_error {
            Some(message) => Err(Error::Command {
                code: self.code,
                signal: self.signal,
                stderr: if self.stderr.is_empty() {
                    message
                } else {
                    format!("{}: {}", message, self.stderr)
                },
            }),
            None => Ok(ExitStatus {
                code: self.code,
                signal: self.signal,
            }),
        }
    }
}

/// Write side handle kept by the session while a command runs.
///
/// The stdin slot is shared with the channel so that ending the session
/// can push a final newline and close the pipe even while the caller
/// still holds the channel.
#[derive(Clone)]
pub(crate) struct RunningHandle {
    pub(crate) stdin: Arc<parking_lot::Mutex<Option<ChildStdin>>>,
    pub(crate) kill: CancellationToken,
}

/// Commands currently attached to one session, keyed by channel id.
pub(crate) type RunningCommands = Arc<parking_lot::Mutex<HashMap<Uuid, RunningHandle>>>;

/// Everything needed to launch one command process and register it
/// with its session.
pub(crate) struct SpawnSpec<'a> {
    pub(crate) program: &'a str,
    pub(crate) args: Vec<String>,
    pub(crate) envs: &'a [(String, String)],
    pub(crate) host: &'a str,
    pub(crate) command: &'a str,
    pub(crate) running: RunningCommands,
    pub(crate) guard: Option<MasterOpGuard>,
}

/// Bidirectional stream attached to one command running over the
/// shared connection.
///
/// Reading yields the command's stdout. Writing feeds its stdin; call
/// [`shutdown`](tokio::io::AsyncWriteExt::shutdown) to signal
/// end-of-input to commands that read until EOF. The error stream is
/// available separately through [`Channel::stderr`].
pub struct Channel {
    id: Uuid,
    stdout: ChildStdout,
    stdin: Arc<parking_lot::Mutex<Option<ChildStdin>>>,
    stderr: Option<ChannelStderr>,
    exit_rx: oneshot::Receiver<ExitEvent>,
}

impl Channel {
    /// Identifier of this channel within its session
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Takes the command's error stream.
    ///
    /// Returns `None` on second and later calls.
    pub fn stderr(&mut self) -> Option<ChannelStderr> {
        self.stderr.take()
    }

    /// Waits for the command to finish and reports how it exited.
    ///
    /// A nonzero exit code is still an `Ok` status; inspect
    /// [`ExitStatus::success`]. Both streams are destroyed before the
    /// status is delivered. Commands that read stdin to EOF need the
    /// write side shut down first or this will not return.
    pub async fn wait(self) -> Result<ExitStatus> {
        let Self { exit_rx, .. } = self;
        match exit_rx.await {
            Ok(event) => event.into_result(),
            Err(_) => Err(Error::Command {
                code: None,
                signal: None,
                stderr: "command exit notification lost".to_string(),
            }),
        }
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut slot = self.stdin.lock();
        match slot.as_mut() {
            Some(pipe) => Pin::new(pipe).poll_write(cx, data),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "channel stdin already closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut slot = self.stdin.lock();
        match slot.as_mut() {
            Some(pipe) => Pin::new(pipe).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut slot = self.stdin.lock();
        match slot.as_mut() {
            Some(pipe) => match Pin::new(pipe).poll_shutdown(cx) {
                Poll::Ready(Ok(())) => {
                    *slot = None;
                    Poll::Ready(Ok(()))
                }
                other => other,
            },
            None => Poll::Ready(Ok(())),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

/// Read side of a command's error stream.
///
/// Yields EOF once the command's stderr pipe closes.
pub struct ChannelStderr {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
}

impl AsyncRead for ChannelStderr {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let len = self.pending.len().min(buf.remaining());
                let chunk = self.pending.split_to(len);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.pending = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for ChannelStderr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStderr")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Starts one command process and wires it into a channel.
///
/// The command is registered in `running` until its process is reaped,
/// and the op guard (when present) keeps connection teardown away for
/// the same window.
pub(crate) fn spawn_command(spec: SpawnSpec<'_>) -> Result<Channel> {
    let mut command = Command::new(spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in spec.envs {
        command.env(key, value);
    }

    let started = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| Error::Spawn(format!("Failed to start {}: {}", spec.program, e)))?;
    debug!(
        "Spawned \"{}\" on {} (pid={:?}, took {:?})",
        spec.command,
        spec.host,
        child.id(),
        started.elapsed()
    );

    let stdout = child.stdout.take().ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "command stdout not captured",
        ))
    })?;
    let stdin = Arc::new(parking_lot::Mutex::new(child.stdin.take()));
    let stderr_pipe = child.stderr.take();

    let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let kill = CancellationToken::new();

    let id = Uuid::new_v4();
    spec.running.lock().insert(
        id,
        RunningHandle {
            stdin: Arc::clone(&stdin),
            kill: kill.clone(),
        },
    );

    tokio::spawn(run_reaper(ReaperContext {
        child,
        stderr_pipe,
        stderr_tx,
        exit_tx,
        running: spec.running,
        id,
        kill,
        _guard: spec.guard,
        host: spec.host.to_string(),
        command: spec.command.to_string(),
    }));

    Ok(Channel {
        id,
        stdout,
        stdin,
        stderr: Some(ChannelStderr {
            rx: stderr_rx,
            pending: Bytes::new(),
        }),
        exit_rx,
    })
}

struct ReaperContext {
    child: Child,
    stderr_pipe: Option<ChildStderr>,
    stderr_tx: mpsc::UnboundedSender<Bytes>,
    exit_tx: oneshot::Sender<ExitEvent>,
    running: RunningCommands,
    id: Uuid,
    kill: CancellationToken,
    _guard: Option<MasterOpGuard>,
    host: String,
    command: String,
}

/// Waits for the command process, forwarding stderr as it arrives and
/// accumulating it for the exit report.
async fn run_reaper(mut ctx: ReaperContext) {
    let stderr_tx = ctx.stderr_tx;
    let stderr_task = ctx.stderr_pipe.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut collected = String::new();
            let mut buf = [0u8; 4096];
            loop {
                match pipe.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                        // the caller may have dropped the stderr stream
                        let _ = stderr_tx.send(Bytes::copy_from_slice(&buf[..n]));
                    }
                }
            }
            collected
        })
    });

    let status = tokio::select! {
        status = ctx.child.wait() => status,
        _ = ctx.kill.cancelled() => {
            send_sigterm(ctx.child.id(), &ctx.command);
            ctx.child.wait().await
        }
    };

    // drain stderr to EOF before reporting the exit
    let stderr = match stderr_task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };

    ctx.running.lock().remove(&ctx.id);

    let (code, signal, wait_error) = match status {
        Ok(status) => {
            use std::os::unix::process::ExitStatusExt;
            (status.code(), status.signal(), None)
        }
        Err(e) => (
            None,
            None,
            Some(format!("Failed to reap command process: {}", e)),
        ),
    };
    debug!(
        "Command \"{}\" on {} closed (code={:?}, signal={:?})",
        ctx.command, ctx.host, code, signal
    );
    let _ = ctx.exit_tx.send(ExitEvent {
        code,
        signal,
        stderr,
        wait_error,
    });
}

fn send_sigterm(pid: Option<u32>, command: &str) {
    let Some(pid) = pid else {
        return;
    };
    debug!("Sending SIGTERM to command \"{}\" (pid={})", command, pid);
    if let Err(e) = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGTERM,
    ) {
        warn!("Failed to signal command process {}: {}", pid, e);
    }
}
