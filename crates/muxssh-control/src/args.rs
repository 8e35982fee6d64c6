//! Argument construction for the ssh subprocess roles

use crate::SshConfig;
use std::fmt;
use std::path::{Path, PathBuf};

/// Local endpoint specification for one port forward.
///
/// The same value renders the `-L` argument for both the forward request
/// and its later cancellation, so a cancel always reverses the exact
/// tuple that was set up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ForwardSpec {
    /// Forward a local TCP endpoint to a destination reachable from the remote host
    Tcp {
        /// Local address to listen on
        bind_addr: String,
        /// Local port to listen on
        bind_port: u16,
        /// Destination address, resolved on the remote side
        dst_addr: String,
        /// Destination port
        dst_port: u16,
    },
    /// Forward a local unix socket to a destination reachable from the remote host
    UnixSocket {
        /// Local socket path to listen on
        path: PathBuf,
        /// Destination address, resolved on the remote side
        dst_addr: String,
        /// Destination port
        dst_port: u16,
    },
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardSpec::Tcp {
                bind_addr,
                bind_port,
                dst_addr,
                dst_port,
            } => write!(f, "{}:{}:{}:{}", bind_addr, bind_port, dst_addr, dst_port),
            ForwardSpec::UnixSocket {
                path,
                dst_addr,
                dst_port,
            } => write!(f, "{}:{}:{}", path.display(), dst_addr, dst_port),
        }
    }
}

/// Multiplexing request issued over an existing control socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOp {
    /// Establish a forwarding
    Forward,
    /// Cancel a previously established forwarding
    Cancel,
}

impl ForwardOp {
    /// The value passed to ssh's `-O` flag
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardOp::Forward => "forward",
            ForwardOp::Cancel => "cancel",
        }
    }
}

/// Build the argument list that spawns a control master for `config`.
///
/// The master runs without a remote command or pty and owns the control
/// socket at `control_path`.
pub fn master_args(config: &SshConfig, control_path: &Path) -> Vec<String> {
    let mut args = vec![
        "-T".to_string(),
        "-N".to_string(),
        "-M".to_string(),
        "-S".to_string(),
        control_path.display().to_string(),
    ];

    if let Some(identity) = &config.identity_file {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }

    args.push("-l".to_string());
    args.push(config.username.clone());
    args.push("-p".to_string());
    args.push(config.port.to_string());

    if config.force_ipv4 {
        args.push("-4".to_string());
    } else if config.force_ipv6 {
        args.push("-6".to_string());
    }

    if let Some(address) = &config.local_address {
        args.push("-b".to_string());
        args.push(address.clone());
    }

    for option in &config.options {
        args.push("-o".to_string());
        args.push(option.clone());
    }

    if !config.jump_hosts.is_empty() {
        args.push("-J".to_string());
        args.push(config.jump_hosts.join(","));
    }

    args.push(config.host.clone());
    args
}

/// Build the argument list that runs `command` over the control socket
pub fn exec_args(config: &SshConfig, control_path: &Path, command: &str) -> Vec<String> {
    vec![
        "-T".to_string(),
        "-S".to_string(),
        control_path.display().to_string(),
        config.host.clone(),
        command.to_string(),
    ]
}

/// Build the argument list for a forward or cancel request over the control socket
pub fn forward_args(
    config: &SshConfig,
    control_path: &Path,
    op: ForwardOp,
    spec: &ForwardSpec,
) -> Vec<String> {
    vec![
        "-S".to_string(),
        control_path.display().to_string(),
        "-O".to_string(),
        op.as_str().to_string(),
        "-L".to_string(),
        spec.to_string(),
        config.host.clone(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_config() -> SshConfig {
        SshConfig::new("example.com")
    }

    #[test]
    fn test_master_args_minimal() {
        let args = master_args(&test_config(), Path::new("/tmp/muxssh/example.com/ssh.sock"));
        assert_eq!(
            args,
            vec![
                "-T",
                "-N",
                "-M",
                "-S",
                "/tmp/muxssh/example.com/ssh.sock",
                "-l",
                "root",
                "-p",
                "22",
                "example.com",
            ]
        );
    }

    #[test]
    fn test_master_args_full() {
        let config = SshConfig::new("example.com")
            .with_port(2222)
            .with_username("deploy")
            .with_identity_file("/keys/id_ed25519")
            .with_local_address("10.0.0.2")
            .with_force_ipv4()
            .with_option("StrictHostKeyChecking=no")
            .with_jump_host("bastion1")
            .with_jump_host("bastion2");

        let args = master_args(&config, Path::new("/run/ssh.sock"));
        assert_eq!(
            args,
            vec![
                "-T",
                "-N",
                "-M",
                "-S",
                "/run/ssh.sock",
                "-i",
                "/keys/id_ed25519",
                "-l",
                "deploy",
                "-p",
                "2222",
                "-4",
                "-b",
                "10.0.0.2",
                "-o",
                "StrictHostKeyChecking=no",
                "-J",
                "bastion1,bastion2",
                "example.com",
            ]
        );
    }

    #[test]
    fn test_master_args_ipv6_only_without_ipv4() {
        let config = test_config().with_force_ipv6();
        let args = master_args(&config, Path::new("/run/ssh.sock"));
        assert!(args.contains(&"-6".to_string()));
        assert!(!args.contains(&"-4".to_string()));

        // -4 wins when both flags are set
        let both = SshConfig::new("example.com").with_force_ipv4().with_force_ipv6();
        let args = master_args(&both, Path::new("/run/ssh.sock"));
        assert!(args.contains(&"-4".to_string()));
        assert!(!args.contains(&"-6".to_string()));
    }

    #[test]
    fn test_exec_args() {
        let args = exec_args(&test_config(), Path::new("/run/ssh.sock"), "echo hello");
        assert_eq!(
            args,
            vec!["-T", "-S", "/run/ssh.sock", "example.com", "echo hello"]
        );
    }

    #[test]
    fn test_forward_args_tcp() {
        let spec = ForwardSpec::Tcp {
            bind_addr: "localhost".to_string(),
            bind_port: 15432,
            dst_addr: "10.0.0.5".to_string(),
            dst_port: 5432,
        };
        let args = forward_args(
            &test_config(),
            Path::new("/run/ssh.sock"),
            ForwardOp::Forward,
            &spec,
        );
        assert_eq!(
            args,
            vec![
                "-S",
                "/run/ssh.sock",
                "-O",
                "forward",
                "-L",
                "localhost:15432:10.0.0.5:5432",
                "example.com",
            ]
        );
    }

    #[test]
    fn test_forward_args_unix_socket() {
        let spec = ForwardSpec::UnixSocket {
            path: PathBuf::from("/tmp/db.sock"),
            dst_addr: "db.internal".to_string(),
            dst_port: 5432,
        };
        let args = forward_args(
            &test_config(),
            Path::new("/run/ssh.sock"),
            ForwardOp::Cancel,
            &spec,
        );
        assert_eq!(
            args,
            vec![
                "-S",
                "/run/ssh.sock",
                "-O",
                "cancel",
                "-L",
                "/tmp/db.sock:db.internal:5432",
                "example.com",
            ]
        );
    }

    fn forward_spec_strategy() -> impl Strategy<Value = ForwardSpec> {
        let addr = "[a-z0-9.]{1,16}";
        prop_oneof![
            (addr, any::<u16>(), addr, any::<u16>()).prop_map(
                |(bind_addr, bind_port, dst_addr, dst_port)| ForwardSpec::Tcp {
                    bind_addr,
                    bind_port,
                    dst_addr,
                    dst_port,
                }
            ),
            ("/[a-z0-9/]{1,24}", addr, any::<u16>()).prop_map(|(path, dst_addr, dst_port)| {
                ForwardSpec::UnixSocket {
                    path: PathBuf::from(path),
                    dst_addr,
                    dst_port,
                }
            }),
        ]
    }

    proptest! {
        #[test]
        fn test_cancel_args_invert_forward_args(spec in forward_spec_strategy()) {
            let config = test_config();
            let control = Path::new("/run/ssh.sock");
            let forward = forward_args(&config, control, ForwardOp::Forward, &spec);
            let cancel = forward_args(&config, control, ForwardOp::Cancel, &spec);

            prop_assert_eq!(forward.len(), cancel.len());
            for (i, (f, c)) in forward.iter().zip(cancel.iter()).enumerate() {
                if i == 3 {
                    prop_assert_eq!(f, "forward");
                    prop_assert_eq!(c, "cancel");
                } else {
                    prop_assert_eq!(f, c);
                }
            }
        }
    }
}
