//! Connection configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for one ssh destination.
///
/// Only `host` is required; everything else mirrors the corresponding
/// ssh command-line flag and is omitted from the invocation when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username to log in as (default: root)
    #[serde(default = "default_username")]
    pub username: String,
    /// Identity file passed with `-i`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Local address to bind outgoing connections to, passed with `-b`
    #[serde(default)]
    pub local_address: Option<String>,
    /// Force IPv4 (`-4`)
    #[serde(default)]
    pub force_ipv4: bool,
    /// Force IPv6 (`-6`); ignored when `force_ipv4` is also set
    #[serde(default)]
    pub force_ipv6: bool,
    /// Auxiliary ssh options, each passed with `-o`
    #[serde(default)]
    pub options: Vec<String>,
    /// Jump host chain passed with `-J`
    #[serde(default)]
    pub jump_hosts: Vec<String>,
    /// Executable invoked for every ssh role (default: `ssh` from PATH)
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
}

fn default_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".to_string()
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

impl SshConfig {
    /// Create a configuration for `host` with all defaults
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: default_username(),
            identity_file: None,
            local_address: None,
            force_ipv4: false,
            force_ipv6: false,
            options: Vec::new(),
            jump_hosts: Vec::new(),
            ssh_program: default_ssh_program(),
        }
    }

    /// Parse a destination of the form `[ssh://][user@]host[:port]`.
    ///
    /// A trailing `:port` that does not parse as a port number is kept
    /// as part of the host.
    pub fn from_destination(destination: &str) -> Self {
        let target = destination.strip_prefix("ssh://").unwrap_or(destination);

        let mut config = Self::new(target);

        // Extract username if present
        if let Some(at_pos) = target.find('@') {
            config.username = target[..at_pos].to_string();
            config.host = target[at_pos + 1..].to_string();
        }

        // Extract port if present
        if let Some(colon_pos) = config.host.rfind(':') {
            if let Ok(port) = config.host[colon_pos + 1..].parse::<u16>() {
                config.port = port;
                config.host = config.host[..colon_pos].to_string();
            }
        }

        config
    }

    /// Set the remote port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the identity file
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Set the local bind address
    pub fn with_local_address(mut self, address: impl Into<String>) -> Self {
        self.local_address = Some(address.into());
        self
    }

    /// Restrict the connection to IPv4
    pub fn with_force_ipv4(mut self) -> Self {
        self.force_ipv4 = true;
        self
    }

    /// Restrict the connection to IPv6
    pub fn with_force_ipv6(mut self) -> Self {
        self.force_ipv6 = true;
        self
    }

    /// Add one auxiliary ssh option (the `key=value` form of `-o`)
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    /// Append one host to the jump chain
    pub fn with_jump_host(mut self, host: impl Into<String>) -> Self {
        self.jump_hosts.push(host.into());
        self
    }

    /// Override the ssh executable
    pub fn with_ssh_program(mut self, program: impl Into<String>) -> Self {
        self.ssh_program = program.into();
        self
    }
}
