//! Shared `SIGUSR1`/`SIGINT`/`SIGTERM` watchers. Both front ends spawn these against the same atomic flags
//! the scheduler and control server poll at their suspension points.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::warn;

/// Poll `flag` at a coarse interval, used to race a blocking wait (a
/// scenario deadline, a listener's `accept`) against a shutdown or restart
/// request raised from a signal handler.
pub async fn wait_for_flag(flag: &AtomicBool) {
    while !flag.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Spawn the `SIGUSR1` restart watcher: flips `flag` true each time the
/// signal arrives, for [`crate::scheduler::Scheduler::wait_until`] to
/// observe.
#[cfg(unix)]
pub fn spawn_restart_watcher(flag: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(async move {
        let mut stream = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "failed to install SIGUSR1 handler");
                return;
            }
        };
        loop {
            if stream.recv().await.is_none() {
                return;
            }
            flag.store(true, Ordering::Relaxed);
        }
    })
}

/// Spawn the `SIGINT`/`SIGTERM` graceful-shutdown watcher: flips `flag`
/// true on either signal.
pub fn spawn_shutdown_watcher(flag: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    warn!(%err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        flag.store(true, Ordering::Relaxed);
    })
}
