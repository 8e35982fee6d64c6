//! # muxssh
//!
//! Multiplexed SSH client built on the system `ssh` binary.
//!
//! All sessions to the same destination host share one authenticated
//! control master process; commands and port forwards attach to it over
//! its unix control socket, so a host is authenticated once no matter
//! how many logical operations run against it. Key exchange, agent and
//! `ssh_config` handling stay with the real OpenSSH client.
//!
//! [`MasterRegistry`] owns the shared masters and their reference
//! counts. [`Session`] is one client's view of a connection: it can run
//! commands ([`Session::exec`] returns a duplex [`Channel`]), open port
//! forwards ([`Session::forward_out`]), and release its master
//! reference with [`Session::end`]. The last session out stops the
//! master, once no command is still attached to it.

#![warn(missing_docs)]

#[cfg(not(unix))]
compile_error!("muxssh requires a unix target; connection sharing runs over unix domain sockets");

pub mod channel;
pub mod error;
mod forward;
pub mod session;

pub use channel::{Channel, ChannelStderr, ExitStatus};
pub use error::Error;
pub use session::{ExecOptions, Session};

pub use muxssh_control as control;
pub use muxssh_control::{
    ForwardSpec, MasterRegistry, MasterState, RegistryConfig, RegistryStats, SshConfig,
};

/// Result type alias for muxssh operations
pub type Result<T> = std::result::Result<T, Error>;
