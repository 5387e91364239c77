//! Connection monitoring seam
//!
//! The scheduler consumes connections through the [`ConnectionMonitor`]
//! trait: a snapshot query plus a change-event stream. Production feeds it
//! from host network configuration ([`StaticConnectionMonitor`] reads the
//! daemon's config); tests drive a [`MockConnectionMonitor`] by hand.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mogwai_tariff::Tariff;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

/// Download policy of one network connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionDetails {
    /// Connection is metered (data may cost money)
    pub metered: bool,
    /// User allows downloads even while metered
    pub allow_downloads_when_metered: bool,
    /// User allows background downloads on this connection at all
    pub allow_downloads: bool,
    /// Tariff describing time-varying capacity, if the user configured one
    pub tariff: Option<Tariff>,
}

impl ConnectionDetails {
    /// Whether the static flags permit downloading, ignoring the tariff.
    pub fn flags_permit(&self) -> bool {
        self.allow_downloads && (!self.metered || self.allow_downloads_when_metered)
    }

    /// Whether the tariff permits downloading at `when`. No tariff, or no
    /// applicable period, is permissive; a zero-capacity period forbids.
    pub fn tariff_permits_at(&self, when: DateTime<Utc>) -> bool {
        match &self.tariff {
            None => true,
            Some(tariff) => tariff
                .lookup_period(when)
                .is_none_or(|p| p.capacity_limit() > 0),
        }
    }

    /// Whether this connection is usable for downloads at `when`.
    pub fn allows_download_at(&self, when: DateTime<Utc>) -> bool {
        self.flags_permit() && self.tariff_permits_at(when)
    }
}

/// Change notification from a connection monitor
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connections appeared or disappeared
    ConnectionsChanged {
        added: Vec<String>,
        removed: Vec<String>,
    },
    /// An existing connection's details changed
    DetailsChanged { id: String },
}

/// Enumerates available connections and reports changes
pub trait ConnectionMonitor: Send + Sync {
    /// Ids of the currently available connections
    fn connection_ids(&self) -> Vec<String>;

    /// Details for one connection, or `None` when it is not present
    fn connection_details(&self, id: &str) -> Option<ConnectionDetails>;

    /// Subscribe to change events. Every subscriber sees every event
    /// emitted after subscription.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent>;
}

/// Fixed connection table, fed from daemon configuration.
///
/// Never emits change events; the subscription stays open so the scheduler
/// loop keeps running.
#[derive(Debug, Default)]
pub struct StaticConnectionMonitor {
    connections: HashMap<String, ConnectionDetails>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl StaticConnectionMonitor {
    pub fn new(connections: HashMap<String, ConnectionDetails>) -> Arc<Self> {
        Arc::new(Self {
            connections,
            subscribers: Mutex::new(Vec::new()),
        })
    }
}

impl ConnectionMonitor for StaticConnectionMonitor {
    fn connection_ids(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }

    fn connection_details(&self, id: &str) -> Option<ConnectionDetails> {
        self.connections.get(id).cloned()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

/// Hand-driven connection monitor for tests
#[derive(Debug, Default)]
pub struct MockConnectionMonitor {
    connections: RwLock<HashMap<String, ConnectionDetails>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl MockConnectionMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a connection and emit the corresponding change event.
    pub fn add_connection(&self, id: impl Into<String>, details: ConnectionDetails) {
        let id = id.into();
        self.connections.write().insert(id.clone(), details);
        self.emit(ConnectionEvent::ConnectionsChanged {
            added: vec![id],
            removed: vec![],
        });
    }

    /// Remove a connection and emit the corresponding change event.
    pub fn remove_connection(&self, id: &str) {
        if self.connections.write().remove(id).is_some() {
            self.emit(ConnectionEvent::ConnectionsChanged {
                added: vec![],
                removed: vec![id.to_string()],
            });
        }
    }

    /// Replace a connection's details and emit a details-changed event.
    pub fn set_details(&self, id: &str, details: ConnectionDetails) {
        self.connections.write().insert(id.to_string(), details);
        self.emit(ConnectionEvent::DetailsChanged { id: id.to_string() });
    }

    fn emit(&self, event: ConnectionEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl ConnectionMonitor for MockConnectionMonitor {
    fn connection_ids(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }

    fn connection_details(&self, id: &str) -> Option<ConnectionDetails> {
        self.connections.read().get(id).cloned()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}
