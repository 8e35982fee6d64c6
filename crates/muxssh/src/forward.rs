//! Forward and cancel requests over the control socket

use muxssh_control::{forward_args, ForwardOp, ForwardSpec, Master, SshConfig};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::Error;
use crate::Result;

/// Asks the control master to open a forwarding.
///
/// Runs `ssh -O forward` against the control socket and maps a nonzero
/// exit to [`Error::Forward`] carrying the diagnostics.
pub(crate) async fn request(
    config: &SshConfig,
    master: &Master,
    spec: &ForwardSpec,
) -> Result<()> {
    let _guard = master.begin_op();
    debug!("Requesting forward {} on {}", spec, config.host);
    let args = forward_args(config, master.control_path(), ForwardOp::Forward, spec);
    let output = Command::new(&config.ssh_program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Spawn(format!("Failed to start {}: {}", config.ssh_program, e)))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        Err(Error::Forward(format!(
            "forward request exited with code {:?}",
            output.status.code()
        )))
    } else {
        Err(Error::Forward(stderr))
    }
}

/// Asks the control master to tear a forwarding down.
///
/// Cancellation happens while a session is shutting down, so failures
/// are logged rather than returned.
pub(crate) async fn cancel(config: &SshConfig, master: &Master, spec: &ForwardSpec) {
    let _guard = master.begin_op();
    debug!("Cancelling forward {} on {}", spec, config.host);
    let args = forward_args(config, master.control_path(), ForwardOp::Cancel, spec);
    let result = Command::new(&config.ssh_program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "Forward cancel {} on {} exited with code {:?}: {}",
                spec,
                config.host,
                output.status.code(),
                stderr.trim()
            );
        }
        Err(e) => {
            warn!("Forward cancel {} on {} failed: {}", spec, config.host, e);
        }
    }
}
