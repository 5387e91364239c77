//! Scheduler event loop
//!
//! External events (connection changes, peer vanishes, clock offsets,
//! alarms) arrive on channels and are drained by one task, so every
//! scheduler mutation happens on a single logical loop. The scheduler is
//! shared behind a mutex that is only ever taken for synchronous,
//! non-suspending work.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::ConnectionEvent;
use crate::scheduler::Scheduler;
use crate::shutdown::ShutdownToken;

/// Scheduler handle shared between the loop and the service facade.
pub type SharedScheduler = Arc<Mutex<Scheduler>>;

/// Funnels collaborator events into the scheduler, one at a time.
pub struct SchedulerLoop {
    scheduler: SharedScheduler,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    vanished_peers: mpsc::UnboundedReceiver<String>,
    offset_events: mpsc::UnboundedReceiver<()>,
    alarm_events: mpsc::UnboundedReceiver<()>,
    shutdown: ShutdownToken,
}

impl SchedulerLoop {
    /// Wire up the event funnel. Must be called exactly once per
    /// scheduler; the alarm event stream can only be taken once.
    pub fn new(scheduler: SharedScheduler, shutdown: ShutdownToken) -> Self {
        let (connection_events, vanished_peers, offset_events, alarm_events) = {
            let mut locked = scheduler.lock();
            (
                locked.connection_monitor().subscribe(),
                locked.peer_manager().subscribe(),
                locked.clock().subscribe_offset(),
                locked
                    .take_alarm_events()
                    .expect("scheduler already has an event loop"),
            )
        };
        Self {
            scheduler,
            connection_events,
            vanished_peers,
            offset_events,
            alarm_events,
            shutdown,
        }
    }

    /// Drain events until shutdown, then drop all entries.
    pub async fn run(mut self) {
        debug!("scheduler loop running");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.connection_events.recv() => match event {
                    Some(event) => self.scheduler.lock().handle_connection_event(event),
                    None => break,
                },
                handle = self.vanished_peers.recv() => match handle {
                    Some(handle) => self.scheduler.lock().handle_peer_vanished(&handle),
                    None => break,
                },
                offset = self.offset_events.recv() => match offset {
                    Some(()) => self.scheduler.lock().handle_offset_changed(),
                    None => break,
                },
                alarm = self.alarm_events.recv() => match alarm {
                    Some(()) => self.scheduler.lock().handle_alarm_fired(),
                    None => {
                        // The scheduler owns the sender; this cannot close
                        // while it is alive.
                        warn!("alarm event stream closed");
                        break;
                    }
                },
            }
        }
        debug!("scheduler loop stopping");
        self.scheduler.lock().shutdown();
    }
}
