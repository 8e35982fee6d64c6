//! Shared harness for integration tests.
//!
//! Provides a scripted stand-in for the ssh binary plus a registry with
//! short probe and teardown intervals. The stub logs every invocation
//! to `<stub>.log` and then plays the role its arguments select: a
//! control master that idles until signalled, a forward request that
//! reports success or scripted failure, or a command execution that
//! runs the command locally. Master readiness is driven by the test
//! binding a unix listener at the expected control socket path.

#![allow(dead_code)]

use muxssh::{MasterRegistry, RegistryConfig, SshConfig};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixListener;

static TRACING_INIT: Once = Once::new();

/// Routes library tracing through the test writer, filtered by RUST_LOG.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const FAKE_SSH: &str = "#!/bin/sh
# Stand-in for the ssh binary: log the invocation, then play the role
# the multiplexing flags select.
line=''
for arg in \"$@\"; do
    if [ -z \"$line\" ]; then line=\"$arg\"; else line=\"$line\t$arg\"; fi
done
printf '%s\\n' \"$line\" >> \"$0.log\"

case \" $* \" in
    *\" -M \"*)
        case \" $* \" in
            *\" badhost \"*)
                echo 'Permission denied (publickey).' >&2
                exit 255
                ;;
            *\" flakyhost \"*)
                sleep 0.3
                exit 0
                ;;
        esac
        exec sleep 600
        ;;
    *\" -O \"*)
        case \" $* \" in
            *\" fwdfail \"*)
                echo 'remote port forwarding failed for listen port' >&2
                exit 255
                ;;
        esac
        exit 0
        ;;
    *)
        eval \"cmd=\\${$#}\"
        exec /bin/sh -c \"$cmd\"
        ;;
esac
";

pub struct TestEnv {
    dir: TempDir,
    pub registry: MasterRegistry,
    stub: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("fake-ssh");
        std::fs::write(&stub, FAKE_SSH).unwrap();
        let mut perms = std::fs::metadata(&stub).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&stub, perms).unwrap();

        let registry = MasterRegistry::new(RegistryConfig {
            control_dir: dir.path().join("ctl"),
            probe_interval: Duration::from_millis(20),
            teardown_interval: Duration::from_millis(20),
        });
        Self {
            dir,
            registry,
            stub,
        }
    }

    /// Scratch directory shared with the stub
    pub fn scratch(&self) -> &Path {
        self.dir.path()
    }

    /// Configuration pointing ssh at the scripted stand-in
    pub fn config(&self, host: &str) -> SshConfig {
        SshConfig::new(host).with_ssh_program(self.stub.display().to_string())
    }

    /// Binds the control socket for `host` so the master probe sees a
    /// live endpoint. Keep the listener alive for the session's lifetime.
    pub async fn bind_control(&self, host: &str) -> UnixListener {
        let path = self.registry.control_socket_path(host);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        UnixListener::bind(&path).unwrap()
    }

    /// Argument vectors of every stub invocation so far, oldest first
    pub fn invocations(&self) -> Vec<Vec<String>> {
        let log = PathBuf::from(format!("{}.log", self.stub.display()));
        match std::fs::read_to_string(log) {
            Ok(contents) => contents
                .lines()
                .map(|line| line.split('\t').map(str::to_string).collect())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Polls registry stats until `expected` masters remain
    pub async fn wait_for_masters(&self, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self.registry.stats().await.masters == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
