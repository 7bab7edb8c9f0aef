use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use inbox_core::InboxClient;
use log::{debug, info, warn};
use tokio::sync::Notify;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared online/offline flag. Workers flip it offline the moment an
/// upload fails at the transport level; the probe loop flips it back once
/// the server answers again and wakes everyone parked on it.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    became_online: Notify,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        // Start offline; the first successful probe or upload goes online.
        Self {
            online: AtomicBool::new(false),
            became_online: Notify::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if online && !was {
            info!("server reachable, resuming uploads");
            self.became_online.notify_waiters();
        } else if !online && was {
            warn!("server unreachable, pausing uploads");
        }
    }

    /// Resolves immediately when online, otherwise parks until the next
    /// offline-to-online transition.
    pub async fn wait_until_online(&self) {
        loop {
            if self.is_online() {
                return;
            }
            let notified = self.became_online.notified();
            if self.is_online() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically probes the server health endpoint. Any HTTP answer counts
/// as reachable; only transport-level failures keep us offline.
pub async fn run_probe_loop(
    monitor: std::sync::Arc<ConnectivityMonitor>,
    client: InboxClient,
    interval: Duration,
) {
    loop {
        let reachable = tokio::time::timeout(PROBE_TIMEOUT, client.check_health())
            .await
            .ok()
            .map(|res| res.is_ok())
            .unwrap_or(false);
        debug!("health probe: reachable={reachable}");
        monitor.set_online(reachable);
        tokio::time::sleep(interval).await;
    }
}
