//! Control-master error types

use std::io;
use thiserror::Error;

/// Errors produced while managing a shared control master
#[derive(Debug, Error)]
pub enum MasterError {
    /// The ssh process could not be started
    #[error("Failed to spawn ssh: {0}")]
    Spawn(String),

    /// The master process exited instead of becoming ready
    #[error("Control master closed (code {code:?}, signal {signal:?}): {stderr}")]
    Closed {
        /// Exit code if the process exited normally
        code: Option<i32>,
        /// Signal that terminated the process
        signal: Option<i32>,
        /// Diagnostic output captured from the master's stderr
        stderr: String,
    },

    /// I/O error while preparing or probing the control socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
