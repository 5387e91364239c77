//! Peer identity seam
//!
//! Entries are grouped by a stable per-peer identity so that everything a
//! vanished client registered can be dropped in one sweep. Production
//! resolves a peer handle to the executable path behind it
//! ([`ProcessPeerManager`]); tests seed a [`MockPeerManager`] by hand.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::error::{ScheduleError, ScheduleResult};

/// Resolves opaque peer handles to stable identities
#[async_trait]
pub trait PeerManager: Send + Sync {
    /// Resolve `handle` to a stable identity, consulting the backing
    /// source if needed. May suspend; fails with
    /// [`ScheduleError::IdentifyingPeer`] when the peer cannot be
    /// identified.
    async fn ensure_peer_credentials(&self, handle: &str) -> ScheduleResult<String>;

    /// Cached identity for `handle`. Never suspends, never fails.
    fn get_peer_credentials(&self, handle: &str) -> Option<String>;

    /// Subscribe to peer-vanished events. The handle is delivered after
    /// the manager has dropped its own cache entry.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<String>;
}

/// Resolves handles of the form `"<pid>"` to the executable path in
/// `/proc/<pid>/exe`.
///
/// A background task polls the cached pids and emits a vanish event for
/// each process that has exited.
#[derive(Debug)]
pub struct ProcessPeerManager {
    credentials: RwLock<HashMap<String, String>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl ProcessPeerManager {
    pub fn new(poll_interval: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            credentials: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        });
        tokio::spawn(Self::watch_liveness(Arc::downgrade(&manager), poll_interval));
        manager
    }

    /// Poll cached pids until the manager is dropped.
    async fn watch_liveness(manager: Weak<Self>, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let handles: Vec<String> = manager.credentials.read().keys().cloned().collect();
            for handle in handles {
                if !Path::new(&format!("/proc/{handle}")).exists() {
                    manager.vanish(&handle);
                }
            }
        }
    }

    /// Drop `handle` from the cache and notify subscribers.
    fn vanish(&self, handle: &str) {
        if self.credentials.write().remove(handle).is_some() {
            debug!(handle, "peer vanished");
            self.subscribers
                .lock()
                .retain(|tx| tx.send(handle.to_string()).is_ok());
        }
    }
}

#[async_trait]
impl PeerManager for ProcessPeerManager {
    async fn ensure_peer_credentials(&self, handle: &str) -> ScheduleResult<String> {
        if let Some(identity) = self.get_peer_credentials(handle) {
            return Ok(identity);
        }
        let pid: u32 = handle
            .parse()
            .map_err(|_| ScheduleError::IdentifyingPeer(handle.to_string()))?;
        let exe = tokio::fs::read_link(format!("/proc/{pid}/exe"))
            .await
            .map_err(|err| {
                warn!(handle, %err, "could not read peer executable");
                ScheduleError::IdentifyingPeer(handle.to_string())
            })?;
        let identity = exe.to_string_lossy().into_owned();
        self.credentials
            .write()
            .insert(handle.to_string(), identity.clone());
        Ok(identity)
    }

    fn get_peer_credentials(&self, handle: &str) -> Option<String> {
        self.credentials.read().get(handle).cloned()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

/// Hand-seeded peer manager for tests
#[derive(Debug, Default)]
pub struct MockPeerManager {
    credentials: RwLock<HashMap<String, String>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    hold: RwLock<bool>,
    held: Notify,
}

impl MockPeerManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed an identity so `ensure_peer_credentials(handle)` succeeds.
    pub fn set_peer(&self, handle: impl Into<String>, identity: impl Into<String>) {
        self.credentials.write().insert(handle.into(), identity.into());
    }

    /// Make every subsequent resolution hang until cancelled, for
    /// shutdown-cancellation tests.
    pub fn hold_resolutions(&self) {
        *self.hold.write() = true;
    }

    /// Drop `handle` from the cache, then emit the vanish event.
    pub fn vanish(&self, handle: &str) {
        self.credentials.write().remove(handle);
        self.subscribers
            .lock()
            .retain(|tx| tx.send(handle.to_string()).is_ok());
    }
}

#[async_trait]
impl PeerManager for MockPeerManager {
    async fn ensure_peer_credentials(&self, handle: &str) -> ScheduleResult<String> {
        if *self.hold.read() {
            // Parked forever; callers race this against their shutdown
            // token.
            self.held.notified().await;
        }
        self.get_peer_credentials(handle)
            .ok_or_else(|| ScheduleError::IdentifyingPeer(handle.to_string()))
    }

    fn get_peer_credentials(&self, handle: &str) -> Option<String> {
        self.credentials.read().get(handle).cloned()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}
