//! Host-to-master registry and the teardown protocol

use crate::master::{Master, MasterState};
use crate::probe::DEFAULT_PROBE_INTERVAL;
use crate::{MasterError, SshConfig};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base directory holding one control-socket directory per host
    pub control_dir: PathBuf,
    /// Base interval between readiness probes (jittered ±10%)
    pub probe_interval: Duration,
    /// Interval between teardown eligibility re-checks
    pub teardown_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            control_dir: PathBuf::from("/tmp/muxssh"),
            probe_interval: DEFAULT_PROBE_INTERVAL,
            teardown_interval: Duration::from_millis(100),
        }
    }
}

struct RegistryEntry {
    master: Arc<Master>,
    refs: usize,
}

/// Registry holding at most one live control master per host.
///
/// `acquire` deduplicates masters by host and counts references;
/// `release` runs the teardown protocol once the last reference is
/// gone. The registry is cheap to clone and safe to share.
#[derive(Clone)]
pub struct MasterRegistry {
    config: RegistryConfig,
    masters: Arc<Mutex<HashMap<String, RegistryEntry>>>,
}

/// Registry statistics
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of registered control masters
    pub masters: usize,
    /// Number of masters whose control socket is ready
    pub ready_masters: usize,
    /// Total references held across all masters
    pub total_refs: usize,
}

impl MasterRegistry {
    /// Create a registry
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            masters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Control socket path for `host`
    pub fn control_socket_path(&self, host: &str) -> PathBuf {
        self.config.control_dir.join(host).join("ssh.sock")
    }

    /// Return the master serving `config.host`, spawning one if needed.
    ///
    /// An entry whose process already exited is evicted and replaced, so
    /// a dead master never satisfies an acquire. Each successful call
    /// counts one reference that must be paired with a [`release`].
    ///
    /// [`release`]: MasterRegistry::release
    pub async fn acquire(&self, config: &SshConfig) -> Result<Arc<Master>, MasterError> {
        let mut masters = self.masters.lock().await;

        if let Some(entry) = masters.get_mut(&config.host) {
            if !entry.master.is_closed() {
                entry.refs += 1;
                debug!(
                    "Control master for {} already running (pid={:?}, refs={})",
                    config.host,
                    entry.master.pid(),
                    entry.refs
                );
                return Ok(Arc::clone(&entry.master));
            }
            debug!("Evicting closed control master for {}", config.host);
            masters.remove(&config.host);
        }

        let control_path = self.control_socket_path(&config.host);
        if let Some(dir) = control_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        let master = Arc::new(Master::spawn(
            config,
            control_path,
            self.config.probe_interval,
        )?);
        info!(
            "Spawned control master for {} (pid={:?})",
            config.host,
            master.pid()
        );
        masters.insert(
            config.host.clone(),
            RegistryEntry {
                master: Arc::clone(&master),
                refs: 1,
            },
        );
        Ok(master)
    }

    /// Give back the reference to `master` counted at acquire time.
    ///
    /// The reference belongs to the master instance that was acquired,
    /// not to whatever currently serves the host: if the master died
    /// and the host slot was respawned for someone else, the release is
    /// ignored. When the last reference is released the teardown
    /// protocol starts in the background: every tick it re-checks that
    /// no operation is in flight and that no new reference arrived, and
    /// only then stops the process and removes the entry. A racing
    /// [`acquire`] aborts the teardown and keeps the master alive.
    ///
    /// [`acquire`]: MasterRegistry::acquire
    pub async fn release(&self, master: &Master) {
        let host = master.host();
        let mut masters = self.masters.lock().await;
        let Some(entry) = masters.get_mut(host) else {
            debug!("Release for {} without a registered master", host);
            return;
        };

        if entry.master.id() != master.id() {
            debug!(
                "Release for {} ignored, master {} was already replaced",
                host,
                master.id()
            );
            return;
        }

        if entry.refs > 1 {
            entry.refs -= 1;
            debug!("Released control master for {} (refs={})", host, entry.refs);
            return;
        }

        // the entry keeps its last reference until teardown decides;
        // an acquire arriving meanwhile bumps it and survives
        debug!("Last reference for {} released, starting teardown", host);
        let map = Arc::clone(&self.masters);
        let interval = self.config.teardown_interval;
        tokio::spawn(teardown(map, host.to_string(), master.id(), interval));
    }

    /// Stop every registered master regardless of reference counts
    pub async fn shutdown(&self) {
        let mut masters = self.masters.lock().await;
        for (host, entry) in masters.drain() {
            info!(
                "Stopping control master for {} (pid={:?})",
                host,
                entry.master.pid()
            );
            entry.master.terminate();
        }
    }

    /// Current registry statistics
    pub async fn stats(&self) -> RegistryStats {
        let masters = self.masters.lock().await;
        let mut ready_masters = 0;
        let mut total_refs = 0;

        for entry in masters.values() {
            if matches!(entry.master.state(), MasterState::Ready) {
                ready_masters += 1;
            }
            total_refs += entry.refs;
        }

        RegistryStats {
            masters: masters.len(),
            ready_masters,
            total_refs,
        }
    }
}

/// Teardown protocol for master `id` serving `host`.
///
/// Polls instead of waiting on a completion signal: dependents drain on
/// their own schedule and a new acquire may arrive at any point, so
/// every tick re-checks both conditions from scratch.
async fn teardown(
    masters: Arc<Mutex<HashMap<String, RegistryEntry>>>,
    host: String,
    id: Uuid,
    interval: Duration,
) {
    loop {
        sleep(interval).await;
        let mut map = masters.lock().await;

        let Some(entry) = map.get_mut(&host) else {
            // swept by shutdown while we waited
            return;
        };

        if entry.master.id() != id {
            // the slot was evicted and respawned for a new holder
            return;
        }

        if entry.master.in_flight_ops() > 0 {
            continue;
        }

        if entry.refs > 1 {
            entry.refs -= 1;
            debug!(
                "Teardown for {} aborted, master was reacquired (refs={})",
                host, entry.refs
            );
            return;
        }

        info!(
            "Stopping control master for {} (pid={:?})",
            host,
            entry.master.pid()
        );
        entry.master.terminate();
        map.remove(&host);
        return;
    }
}
