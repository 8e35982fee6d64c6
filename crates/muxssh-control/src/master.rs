//! Control-master process handle and lifecycle monitoring

use crate::{args, probe, MasterError, SshConfig};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle state of a control master
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterState {
    /// Process spawned, control socket not accepting connections yet
    Starting,
    /// Control socket accepts multiplexing connections
    Ready,
    /// Process exited
    Closed(MasterExit),
}

/// Terminal status of a control-master process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterExit {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process
    pub signal: Option<i32>,
    /// Diagnostic output captured from the master's stderr
    pub stderr: String,
}

/// Handle to one shared control-master process.
///
/// The process itself is owned by a background monitor task; the handle
/// carries the state channel, the in-flight operation counter consulted
/// by the teardown protocol, and the termination token. Handles are
/// shared between the registry and every session attached to the host.
pub struct Master {
    id: Uuid,
    host: String,
    control_path: PathBuf,
    pid: Option<u32>,
    state: Arc<watch::Sender<MasterState>>,
    ops: Arc<AtomicUsize>,
    kill_token: CancellationToken,
}

/// RAII guard counting one in-flight operation on a master.
///
/// Held for the lifetime of an attached command or a forward/cancel
/// request; teardown stops the master only once every guard is dropped.
pub struct MasterOpGuard {
    ops: Arc<AtomicUsize>,
}

impl Drop for MasterOpGuard {
    fn drop(&mut self) {
        self.ops.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Master {
    /// Spawn a control master for `config` owning the socket at `control_path`.
    ///
    /// Must be called from within a tokio runtime; the monitor and
    /// readiness-probe tasks are spawned onto it.
    pub(crate) fn spawn(
        config: &SshConfig,
        control_path: PathBuf,
        probe_interval: Duration,
    ) -> Result<Self, MasterError> {
        let ssh_args = args::master_args(config, &control_path);
        debug!(
            "Spawning control master for {}: {} {}",
            config.host,
            config.ssh_program,
            ssh_args.join(" ")
        );

        let started = Instant::now();
        let mut child = Command::new(&config.ssh_program)
            .args(&ssh_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MasterError::Spawn(format!("Failed to start {}: {}", config.ssh_program, e))
            })?;
        debug!(
            "Control master spawn for {} took {:?}",
            config.host,
            started.elapsed()
        );

        let pid = child.id();
        let stderr = child.stderr.take();
        let (state_tx, _) = watch::channel(MasterState::Starting);
        let state = Arc::new(state_tx);
        let kill_token = CancellationToken::new();

        tokio::spawn(monitor(
            child,
            stderr,
            Arc::clone(&state),
            kill_token.clone(),
            config.host.clone(),
        ));
        tokio::spawn(probe::run(
            control_path.clone(),
            Arc::clone(&state),
            probe_interval,
            config.host.clone(),
        ));

        Ok(Self {
            id: Uuid::new_v4(),
            host: config.host.clone(),
            control_path,
            pid,
            state,
            ops: Arc::new(AtomicUsize::new(0)),
            kill_token,
        })
    }

    /// Unique id of this master handle
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Host this master is connected to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path of the control socket
    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    /// Process id of the master, if it was captured at spawn time
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current lifecycle state
    pub fn state(&self) -> MasterState {
        self.state.borrow().clone()
    }

    /// Whether the master process has exited
    pub fn is_closed(&self) -> bool {
        matches!(&*self.state.borrow(), MasterState::Closed(_))
    }

    /// Wait until the master accepts multiplexing connections.
    ///
    /// Resolves immediately for a master that is already ready. An exit
    /// before readiness yields [`MasterError::Closed`] carrying the
    /// captured stderr.
    pub async fn wait_ready(&self) -> Result<(), MasterError> {
        let mut rx = self.state.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                MasterState::Ready => return Ok(()),
                MasterState::Closed(exit) => {
                    return Err(MasterError::Closed {
                        code: exit.code,
                        signal: exit.signal,
                        stderr: exit.stderr,
                    })
                }
                MasterState::Starting => {
                    if rx.changed().await.is_err() {
                        return Err(MasterError::Closed {
                            code: None,
                            signal: None,
                            stderr: String::new(),
                        });
                    }
                }
            }
        }
    }

    /// Wait until the master process has exited
    pub async fn wait_closed(&self) -> MasterExit {
        let mut rx = self.state.subscribe();
        loop {
            if let MasterState::Closed(exit) = &*rx.borrow_and_update() {
                return exit.clone();
            }
            if rx.changed().await.is_err() {
                return MasterExit::default();
            }
        }
    }

    /// Count one in-flight operation against this master
    pub fn begin_op(&self) -> MasterOpGuard {
        self.ops.fetch_add(1, Ordering::SeqCst);
        MasterOpGuard {
            ops: Arc::clone(&self.ops),
        }
    }

    /// Number of operations currently in flight
    pub fn in_flight_ops(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    /// Ask the monitor task to stop the master process
    pub(crate) fn terminate(&self) {
        self.kill_token.cancel();
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        // last handle gone, nothing can use the process anymore
        self.kill_token.cancel();
    }
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("control_path", &self.control_path)
            .field("pid", &self.pid)
            .field("state", &*self.state.borrow())
            .field("in_flight_ops", &self.in_flight_ops())
            .finish()
    }
}

/// Reap the master process, capturing stderr until EOF so the closed
/// state always carries the full diagnostics.
async fn monitor(
    mut child: Child,
    stderr: Option<ChildStderr>,
    state: Arc<watch::Sender<MasterState>>,
    kill_token: CancellationToken,
    host: String,
) {
    let stderr_task = stderr.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf).await;
            buf
        })
    });

    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_token.cancelled() => {
            send_sigterm(child.id(), &host);
            child.wait().await
        }
    };

    let stderr_text = match stderr_task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };

    let (code, signal) = match &status {
        Ok(status) => (status.code(), status.signal()),
        Err(e) => {
            warn!("Failed to reap control master for {}: {}", host, e);
            (None, None)
        }
    };
    debug!(
        "Control master for {} closed with code={:?} signal={:?}",
        host, code, signal
    );
    state.send_replace(MasterState::Closed(MasterExit {
        code,
        signal,
        stderr: stderr_text,
    }));
}

fn send_sigterm(pid: Option<u32>, host: &str) {
    if let Some(pid) = pid {
        debug!("Stopping control master for {} (pid={})", host, pid);
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Failed to signal control master for {}: {}", host, e);
        }
    }
}
