//! Error types for the muxssh client

use muxssh_control::MasterError;
use std::io;
use thiserror::Error;

/// Errors surfaced by sessions and channels
#[derive(Debug, Error)]
pub enum Error {
    /// An ssh process could not be started
    #[error("Failed to spawn ssh: {0}")]
    Spawn(String),

    /// The shared control master failed or closed unexpectedly
    #[error("Connection error: {0}")]
    Connection(String),

    /// The session was already ended
    #[error("Session already ended")]
    SessionEnded,

    /// The process backing a command could not be reaped
    #[error("Command failed (code {code:?}, signal {signal:?}): {stderr}")]
    Command {
        /// Exit code if the process exited normally
        code: Option<i32>,
        /// Signal that terminated the process
        signal: Option<i32>,
        /// Diagnostics captured from the command's error stream
        stderr: String,
    },

    /// A forward request was rejected by the control master
    #[error("Port forwarding failed: {0}")]
    Forward(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<MasterError> for Error {
    fn from(err: MasterError) -> Self {
        match err {
            MasterError::Spawn(message) => Error::Spawn(message),
            MasterError::Closed {
                code,
                signal,
                stderr,
            } => {
                if stderr.is_empty() {
                    Error::Connection(format!(
                        "control master closed (code {:?}, signal {:?})",
                        code, signal
                    ))
                } else {
                    Error::Connection(stderr)
                }
            }
            MasterError::Io(e) => Error::Io(e),
        }
    }
}
