//! # muxssh Control Layer
//!
//! Management of shared OpenSSH control-master processes: destination
//! configuration, argument construction for the ssh invocation roles,
//! the master process handle with readiness probing, and the per-host
//! registry with reference counting and the teardown protocol.

#![warn(missing_docs)]

#[cfg(not(unix))]
compile_error!(
    "muxssh-control only supports unix targets; multiplexing relies on unix domain control sockets"
);

/// Connection configuration
pub mod config;

/// Argument construction for the ssh subprocess roles
pub mod args;

/// Control-master process handle and lifecycle monitoring
pub mod master;

/// Readiness probing for the control socket
pub mod probe;

/// Host-to-master registry and the teardown protocol
pub mod registry;

/// Control-master error types
pub mod error;

pub use args::{exec_args, forward_args, master_args, ForwardOp, ForwardSpec};
pub use config::SshConfig;
pub use error::MasterError;
pub use master::{Master, MasterExit, MasterOpGuard, MasterState};
pub use registry::{MasterRegistry, RegistryConfig, RegistryStats};
