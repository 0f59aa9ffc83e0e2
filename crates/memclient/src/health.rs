//! Failover health monitoring.
//!
//! Quarantined servers are probed on a fixed interval over fresh, untracked
//! connections. A server that answers the probe is moved to the revival set
//! and re-added through the regular non-initial `add_server` path; if that
//! fails it goes back into quarantine. User requests are never blocked by
//! the monitor, and a tick that arrives while the previous one is still in
//! flight is dropped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::client::ClientInner;
use crate::connection::Connection;
use crate::server_list::ServerAddress;

pub(crate) struct HealthMonitor {
    failures: Mutex<HashSet<ServerAddress>>,
    revivals: Mutex<HashSet<ServerAddress>>,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(HashSet::new()),
            revivals: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Record a server failure. Returns true when the server was newly
    /// quarantined; a server already failed or mid-revival reports false so
    /// the caller does not remove it twice.
    pub(crate) fn mark_failure(&self, address: &ServerAddress) -> bool {
        let mut failures = self.failures.lock().unwrap();
        let revivals = self.revivals.lock().unwrap();
        if failures.contains(address) || revivals.contains(address) {
            return false;
        }
        failures.insert(address.clone());
        true
    }

    pub(crate) fn quarantined(&self) -> Vec<ServerAddress> {
        self.failures.lock().unwrap().iter().cloned().collect()
    }

    pub(crate) fn start(self: &Arc<Self>, client: Weak<ClientInner>, interval: Duration) {
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick of `interval` is consumed so probing
            // starts one full period after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else { return };
                monitor.tick(&client).await;
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    pub(crate) fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn tick(self: &Arc<Self>, client: &Arc<ClientInner>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.revivals.lock().unwrap().clear();
        let quarantined = self.quarantined();
        if !quarantined.is_empty() {
            tracing::info!(servers = ?quarantined, "probing quarantined servers");
        }
        for address in quarantined {
            match Connection::connect(&address, client.connect_timeout()).await {
                Ok(connection) => {
                    if client.probe_version(&connection).await {
                        self.failures.lock().unwrap().remove(&address);
                        self.revivals.lock().unwrap().insert(address.clone());
                    }
                    connection.close();
                }
                Err(err) => {
                    tracing::debug!(server = %address, error = %err, "health probe connect failed");
                }
            }
        }

        let revivals: Vec<ServerAddress> =
            self.revivals.lock().unwrap().iter().cloned().collect();
        for address in revivals {
            if client.add_server_internal(&address, false).await {
                tracing::info!(server = %address, "server revived");
            } else {
                tracing::warn!(server = %address, "revival failed, server re-quarantined");
                self.revivals.lock().unwrap().remove(&address);
                self.failures.lock().unwrap().insert(address);
            }
        }

        self.running.store(false, Ordering::Release);
    }
}
