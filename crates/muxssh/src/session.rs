//! Client sessions over a shared control master

use muxssh_control::{
    exec_args, ForwardSpec, Master, MasterError, MasterRegistry, MasterState, SshConfig,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::channel::{
    spawn_command, Channel, ExitStatus, RunningCommands, RunningHandle, SpawnSpec,
};
use crate::error::Error;
use crate::forward;
use crate::Result;

const END_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Options for one command execution
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Extra environment variables for the local ssh process
    pub envs: Vec<(String, String)>,
}

impl ExecOptions {
    /// Adds one environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// One client's view of the shared connection to a host.
///
/// Sessions to the same host share a single authenticated control
/// master; each session tracks its own running commands and port
/// forwards and returns its master reference on [`Session::end`].
pub struct Session {
    config: SshConfig,
    registry: MasterRegistry,
    master: Arc<Master>,
    ended: AtomicBool,
    released: CancellationToken,
    running: RunningCommands,
    forwardings: parking_lot::Mutex<Vec<ForwardSpec>>,
}

impl Session {
    /// Connects to the destination described by `config`.
    ///
    /// Reuses a live control master for the host when the registry has
    /// one, spawning and authenticating a new master otherwise. Resolves
    /// once the master's control socket accepts connections; fails with
    /// the master's diagnostics if it exits first.
    pub async fn connect(registry: &MasterRegistry, config: SshConfig) -> Result<Self> {
        debug!("Connecting session to {}", config.host);
        let master = registry.acquire(&config).await?;
        if let Err(err) = master.wait_ready().await {
            // hand the reference back so a later connect can respawn
            registry.release(&master).await;
            return Err(err.into());
        }
        info!(
            "Session to {} ready (master pid={:?})",
            config.host,
            master.pid()
        );
        Ok(Self {
            config,
            registry: registry.clone(),
            master,
            ended: AtomicBool::new(false),
            released: CancellationToken::new(),
            running: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            forwardings: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Destination host of this session
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Configuration this session was opened with
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Whether [`Session::end`] has run
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Forwardings currently held by this session
    pub fn active_forwards(&self) -> Vec<ForwardSpec> {
        self.forwardings.lock().clone()
    }

    /// Runs `command` on the remote host.
    ///
    /// The command attaches to the shared master over its control
    /// socket, so no new authentication happens. The returned channel
    /// carries the command's stdio.
    pub async fn exec(&self, command: &str) -> Result<Channel> {
        self.exec_with(command, ExecOptions::default()).await
    }

    /// Runs `command` with extra execution options.
    pub async fn exec_with(&self, command: &str, options: ExecOptions) -> Result<Channel> {
        self.ensure_active()?;
        let args = exec_args(&self.config, self.master.control_path(), command);
        spawn_command(SpawnSpec {
            program: &self.config.ssh_program,
            args,
            envs: &options.envs,
            host: &self.config.host,
            command,
            running: Arc::clone(&self.running),
            guard: Some(self.master.begin_op()),
        })
    }

    /// Forwards a local TCP endpoint to `dst_addr:dst_port` as resolved
    /// from the remote host, then connects to it.
    ///
    /// The forwarding is recorded before the connection attempt, so it
    /// is cancelled on [`Session::end`] even if connecting fails.
    pub async fn forward_out(
        &self,
        bind_addr: &str,
        bind_port: u16,
        dst_addr: &str,
        dst_port: u16,
    ) -> Result<TcpStream> {
        self.ensure_active()?;
        let spec = ForwardSpec::Tcp {
            bind_addr: bind_addr.to_string(),
            bind_port,
            dst_addr: dst_addr.to_string(),
            dst_port,
        };
        forward::request(&self.config, &self.master, &spec).await?;
        self.forwardings.lock().push(spec);

        let stream = TcpStream::connect((bind_addr, bind_port)).await?;
        debug!(
            "Forward endpoint {}:{} connected for {}",
            bind_addr, bind_port, self.config.host
        );
        Ok(stream)
    }

    /// Forwards a local unix socket to `dst_addr:dst_port` as resolved
    /// from the remote host.
    pub async fn forward_out_local_socket(
        &self,
        path: impl AsRef<Path>,
        dst_addr: &str,
        dst_port: u16,
    ) -> Result<()> {
        self.ensure_active()?;
        let spec = ForwardSpec::UnixSocket {
            path: path.as_ref().to_path_buf(),
            dst_addr: dst_addr.to_string(),
            dst_port,
        };
        forward::request(&self.config, &self.master, &spec).await?;
        self.forwardings.lock().push(spec);
        Ok(())
    }

    /// Ends the session.
    ///
    /// Sends end-of-input and SIGTERM to every running command, waits
    /// for them to be reaped, cancels this session's forwardings, and
    /// returns the master reference to the registry. The shared master
    /// only stops once no other session holds it. Repeat calls return
    /// immediately.
    pub async fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            debug!("Session to {} already ended", self.config.host);
            return;
        }
        debug!("Ending session to {}", self.config.host);

        let handles: Vec<RunningHandle> = self.running.lock().values().cloned().collect();
        for handle in handles {
            let stdin = handle.stdin.lock().take();
            if let Some(mut pipe) = stdin {
                // end-of-input first so line-oriented commands can stop cleanly
                let _ = pipe.write_all(b"\n").await;
                let _ = pipe.shutdown().await;
            }
            handle.kill.cancel();
        }
        while !self.running.lock().is_empty() {
            sleep(END_POLL_INTERVAL).await;
        }

        let forwardings: Vec<ForwardSpec> = self.forwardings.lock().drain(..).collect();
        for spec in &forwardings {
            forward::cancel(&self.config, &self.master, spec).await;
        }

        self.released.cancel();
        self.registry.release(&self.master).await;
        debug!("Session to {} ended", self.config.host);
    }

    /// Waits until this session is finished with its connection.
    ///
    /// Resolves with `Ok(None)` once the session released its master
    /// reference through [`Session::end`]. If the shared master exits
    /// while the session is attached, resolves with the master's exit
    /// status, or with [`Error::Connection`] when the master left
    /// diagnostics behind.
    pub async fn closed(&self) -> Result<Option<ExitStatus>> {
        tokio::select! {
            _ = self.released.cancelled() => Ok(None),
            exit = self.master.wait_closed() => {
                if exit.code != Some(0) && !exit.stderr.is_empty() {
                    Err(Error::Connection(exit.stderr))
                } else {
                    Ok(Some(ExitStatus {
                        code: exit.code,
                        signal: exit.signal,
                    }))
                }
            }
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(Error::SessionEnded);
        }
        if let MasterState::Closed(exit) = self.master.state() {
            return Err(MasterError::Closed {
                code: exit.code,
                signal: exit.signal,
                stderr: exit.stderr,
            }
            .into());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn master(&self) -> &Arc<Master> {
        &self.master
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        debug!(
            "Session to {} dropped without end, releasing in background",
            self.config.host
        );
        for handle in self.running.lock().values() {
            handle.kill.cancel();
        }
        self.released.cancel();
        let registry = self.registry.clone();
        let master = Arc::clone(&self.master);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                registry.release(&master).await;
            });
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.config.host)
            .field("master", &self.master.id())
            .field("ended", &self.ended.load(Ordering::SeqCst))
            .finish()
    }
}
