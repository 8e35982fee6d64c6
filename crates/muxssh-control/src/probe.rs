//! Readiness probing for the control socket

use crate::master::MasterState;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

/// Base interval between probe attempts
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    /// Socket accepts connections
    Ready,
    /// Socket path does not exist yet, or the attempt failed transiently
    NotReady,
    /// Socket path exists but refuses connections; leftover of a dead master
    Stale,
}

/// Poll the control socket until it accepts a connection, then promote
/// the master to `Ready`.
///
/// The loop stops as soon as the master leaves the `Starting` state. A
/// stale socket file is deleted so a restarted master can re-create it.
/// Probe attempts are spaced by `base_interval` with ±10% jitter to keep
/// many concurrently starting masters from polling in lockstep.
pub(crate) async fn run(
    control_path: PathBuf,
    state: Arc<watch::Sender<MasterState>>,
    base_interval: Duration,
    host: String,
) {
    loop {
        if !matches!(&*state.borrow(), MasterState::Starting) {
            return;
        }

        match probe_once(&control_path).await {
            ProbeOutcome::Ready => {
                debug!("Control master for {} is ready", host);
                // the process may have died between the probe and now
                state.send_if_modified(|current| {
                    if matches!(current, MasterState::Starting) {
                        *current = MasterState::Ready;
                        true
                    } else {
                        false
                    }
                });
                return;
            }
            ProbeOutcome::NotReady => {
                debug!("Control master for {} is not ready", host);
            }
            ProbeOutcome::Stale => {
                debug!(
                    "Stale control socket for {} at {}, deleting it",
                    host,
                    control_path.display()
                );
                if let Err(e) = tokio::fs::remove_file(&control_path).await {
                    debug!("Failed to delete stale control socket for {}: {}", host, e);
                }
            }
        }

        sleep(jittered(base_interval)).await;
    }
}

/// One probe attempt against the control socket
pub(crate) async fn probe_once(control_path: &Path) -> ProbeOutcome {
    if tokio::fs::metadata(control_path).await.is_err() {
        return ProbeOutcome::NotReady;
    }

    match UnixStream::connect(control_path).await {
        Ok(stream) => {
            // only the handshake matters; the master counts connections
            drop(stream);
            ProbeOutcome::Ready
        }
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => ProbeOutcome::Stale,
        Err(_) => ProbeOutcome::NotReady,
    }
}

/// Apply ±10% jitter to `base`
fn jittered(base: Duration) -> Duration {
    let factor = 1.0 + (0.5 - rand::random::<f64>()) * 0.2;
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;
    use tokio::time::timeout;

    async fn wait_for_state(
        state: &Arc<watch::Sender<MasterState>>,
        expected: MasterState,
    ) {
        let mut rx = state.subscribe();
        timeout(Duration::from_secs(5), async {
            loop {
                if *rx.borrow_and_update() == expected {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("state change timed out");
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        for _ in 0..1000 {
            let interval = jittered(Duration::from_millis(1000));
            assert!(interval >= Duration::from_millis(900), "{:?}", interval);
            assert!(interval <= Duration::from_millis(1100), "{:?}", interval);
        }
    }

    #[tokio::test]
    async fn test_probe_missing_socket_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = probe_once(&dir.path().join("ssh.sock")).await;
        assert_eq!(outcome, ProbeOutcome::NotReady);
    }

    #[tokio::test]
    async fn test_probe_live_socket_is_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh.sock");
        let _listener = UnixListener::bind(&path).unwrap();
        let outcome = probe_once(&path).await;
        assert_eq!(outcome, ProbeOutcome::Ready);
    }

    #[tokio::test]
    async fn test_probe_dead_socket_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh.sock");
        // binding then dropping leaves the socket file behind with no listener
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        let outcome = probe_once(&path).await;
        assert_eq!(outcome, ProbeOutcome::Stale);
    }

    #[tokio::test]
    async fn test_run_promotes_to_ready_when_socket_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh.sock");
        let (tx, _) = watch::channel(MasterState::Starting);
        let state = Arc::new(tx);

        tokio::spawn(run(
            path.clone(),
            Arc::clone(&state),
            Duration::from_millis(10),
            "testhost".to_string(),
        ));

        sleep(Duration::from_millis(50)).await;
        assert!(matches!(&*state.borrow(), MasterState::Starting));

        let _listener = UnixListener::bind(&path).unwrap();
        wait_for_state(&state, MasterState::Ready).await;
    }

    #[tokio::test]
    async fn test_run_deletes_stale_socket_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh.sock");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let (tx, _) = watch::channel(MasterState::Starting);
        let state = Arc::new(tx);
        tokio::spawn(run(
            path.clone(),
            Arc::clone(&state),
            Duration::from_millis(10),
            "testhost".to_string(),
        ));

        // the stale file is removed so a fresh master can bind it
        timeout(Duration::from_secs(5), async {
            while path.exists() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stale socket was not deleted");

        let _listener = UnixListener::bind(&path).unwrap();
        wait_for_state(&state, MasterState::Ready).await;
    }

    #[tokio::test]
    async fn test_run_stops_once_master_closed() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _) = watch::channel(MasterState::Closed(crate::master::MasterExit::default()));
        let state = Arc::new(tx);

        let handle = tokio::spawn(run(
            dir.path().join("ssh.sock"),
            Arc::clone(&state),
            Duration::from_millis(10),
            "testhost".to_string(),
        ));

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("probe loop kept running")
            .unwrap();
        assert!(matches!(&*state.borrow(), MasterState::Closed(_)));
    }
}
