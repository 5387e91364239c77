//! Mogwai download scheduler core
//!
//! Arbitrates when background downloads on behalf of multiple client
//! processes may proceed, from the network connections currently
//! available and the tariffs attached to them. Clients register schedule
//! entries; the scheduler computes the currently active subset and emits
//! fine-grained change notifications.
//!
//! The core is single-threaded: all mutation happens on one logical loop
//! ([`SchedulerLoop`]) fed by the collaborator seams ([`ConnectionMonitor`],
//! [`PeerManager`], [`Clock`]), each of which ships a production variant
//! and a hand-driven test double.

pub mod clock;
pub mod connection;
pub mod entry;
pub mod error;
pub mod peer;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod shutdown;

pub use clock::{AlarmCallback, AlarmId, Clock, SystemClock, VirtualClock};
pub use connection::{
    ConnectionDetails, ConnectionEvent, ConnectionMonitor, MockConnectionMonitor,
    StaticConnectionMonitor,
};
pub use entry::{EntryId, ScheduleEntry};
pub use error::{ScheduleError, ScheduleResult};
pub use peer::{MockPeerManager, PeerManager, ProcessPeerManager};
pub use runtime::{SchedulerLoop, SharedScheduler};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerSignal};
pub use service::{BatchOutcome, EntryHandle, ScheduleService};
pub use shutdown::ShutdownToken;
