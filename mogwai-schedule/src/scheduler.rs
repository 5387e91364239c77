//! The scheduler
//!
//! Maintains the set of schedule entries and arbitrates which of them may
//! download right now, from three inputs: the connection snapshot, each
//! connection's tariff at the current clock instant, and entry properties.
//! Every mutation and external event funnels into [`Scheduler::recompute`],
//! which emits change signals in a fixed order and re-arms the tariff
//! transition alarm.
//!
//! The scheduler itself is synchronous and single-threaded; see
//! [`SchedulerLoop`](crate::runtime::SchedulerLoop) for the event funnel.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::clock::{AlarmId, Clock};
use crate::connection::{ConnectionDetails, ConnectionEvent, ConnectionMonitor};
use crate::entry::{EntryId, ScheduleEntry};
use crate::error::{ScheduleError, ScheduleResult};
use crate::peer::PeerManager;

/// Entry quotas and activation limits
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Soft cap on the total number of entries
    pub max_entries: usize,
    /// Hard cap on concurrently active entries
    pub max_active_entries: usize,
    /// Cap on entries per owner identity
    pub max_entries_per_owner: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_active_entries: 1,
            max_entries_per_owner: 1024,
        }
    }
}

/// Fine-grained change notification emitted after each evaluation pass.
///
/// Within one pass the order is fixed: active removals first, then the
/// entry-set change, then active additions, then the `allow_downloads`
/// flip. Observers therefore never see an active entry that is not in the
/// entry set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerSignal {
    /// Entries joined or left the entry set
    EntriesChanged {
        added: Vec<EntryId>,
        removed: Vec<EntryId>,
    },
    /// Entries started or stopped being allowed to download
    ActiveEntriesChanged {
        added: Vec<EntryId>,
        removed: Vec<EntryId>,
    },
    /// The derived `allow_downloads` property flipped
    AllowDownloadsChanged { allow_downloads: bool },
    /// An entry's priority was changed by its owner
    EntryPriorityChanged { id: EntryId, priority: u32 },
    /// An entry's resumable hint was changed by its owner
    EntryResumableChanged { id: EntryId, resumable: bool },
}

/// Stateful arbiter of which schedule entries may download
pub struct Scheduler {
    connection_monitor: Arc<dyn ConnectionMonitor>,
    peer_manager: Arc<dyn PeerManager>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    entries: HashMap<EntryId, ScheduleEntry>,
    active: BTreeSet<EntryId>,
    connections: HashMap<String, ConnectionDetails>,
    /// Peer handle → resolved identity, kept here because the peer
    /// manager drops its own cache entry before the vanish event arrives.
    peer_identities: HashMap<String, String>,
    allow_downloads: bool,
    next_serial: u64,
    alarm: Option<AlarmId>,
    alarm_tx: mpsc::UnboundedSender<()>,
    alarm_rx: Option<mpsc::UnboundedReceiver<()>>,
    subscribers: Vec<mpsc::UnboundedSender<SchedulerSignal>>,
}

impl Scheduler {
    /// Build a scheduler over its three collaborators, take the initial
    /// connection snapshot, and run the first evaluation.
    pub fn new(
        connection_monitor: Arc<dyn ConnectionMonitor>,
        peer_manager: Arc<dyn PeerManager>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let (alarm_tx, alarm_rx) = mpsc::unbounded_channel();
        let mut scheduler = Self {
            connection_monitor,
            peer_manager,
            clock,
            config,
            entries: HashMap::new(),
            active: BTreeSet::new(),
            connections: HashMap::new(),
            peer_identities: HashMap::new(),
            allow_downloads: false,
            next_serial: 0,
            alarm: None,
            alarm_tx,
            alarm_rx: Some(alarm_rx),
            subscribers: Vec::new(),
        };
        scheduler.refresh_all_connections();
        scheduler.recompute(vec![], vec![]);
        scheduler
    }

    /// Subscribe to change signals. Emission never suspends; receivers
    /// that fall behind only grow their queue.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SchedulerSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// The peer manager this scheduler resolves identities through.
    pub fn peer_manager(&self) -> &Arc<dyn PeerManager> {
        &self.peer_manager
    }

    pub fn connection_monitor(&self) -> &Arc<dyn ConnectionMonitor> {
        &self.connection_monitor
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Receiver for alarm-fired events; taken once by the scheduler loop.
    pub(crate) fn take_alarm_events(&mut self) -> Option<mpsc::UnboundedReceiver<()>> {
        self.alarm_rx.take()
    }

    /// Construct a new entry owned by `owner` from a client property map.
    /// The entry is not registered until passed to
    /// [`update_entries`](Scheduler::update_entries).
    pub fn new_entry(
        &mut self,
        owner: &str,
        properties: &Map<String, Value>,
    ) -> ScheduleResult<ScheduleEntry> {
        self.next_serial += 1;
        ScheduleEntry::from_properties(EntryId::from_serial(self.next_serial), owner, properties)
    }

    /// Record a resolved peer identity for later vanish handling.
    pub fn remember_peer(&mut self, handle: &str, identity: &str) {
        self.peer_identities
            .insert(handle.to_string(), identity.to_string());
    }

    /// Atomically add and remove entries.
    ///
    /// Additions are de-duplicated by id (ids already present are
    /// skipped); removals of unknown ids are ignored. If applying the
    /// whole batch would exceed `max_entries`, or push one owner past
    /// `max_entries_per_owner`, the call fails with
    /// [`ScheduleError::EntryFull`] and nothing changes.
    pub fn update_entries(
        &mut self,
        add: Vec<ScheduleEntry>,
        remove: &[EntryId],
    ) -> ScheduleResult<()> {
        let mut seen = HashSet::new();
        let add: Vec<ScheduleEntry> = add
            .into_iter()
            .filter(|e| !self.entries.contains_key(e.id()))
            .filter(|e| seen.insert(e.id().clone()))
            .collect();
        let removals: Vec<EntryId> = {
            let mut unique: Vec<EntryId> = Vec::new();
            for id in remove {
                if self.entries.contains_key(id) && !unique.contains(id) {
                    unique.push(id.clone());
                }
            }
            unique
        };

        let prospective = self.entries.len() - removals.len() + add.len();
        if prospective > self.config.max_entries {
            debug!(
                prospective,
                max = self.config.max_entries,
                "rejecting update: entry quota exceeded"
            );
            return Err(ScheduleError::EntryFull);
        }

        let mut per_owner: HashMap<&str, usize> = HashMap::new();
        for entry in self.entries.values() {
            if !removals.contains(entry.id()) {
                *per_owner.entry(entry.owner()).or_default() += 1;
            }
        }
        for entry in &add {
            let count = per_owner.entry(entry.owner()).or_default();
            *count += 1;
            if *count > self.config.max_entries_per_owner {
                debug!(
                    owner = entry.owner(),
                    max = self.config.max_entries_per_owner,
                    "rejecting update: per-owner quota exceeded"
                );
                return Err(ScheduleError::EntryFull);
            }
        }

        if add.is_empty() && removals.is_empty() {
            return Ok(());
        }

        for id in &removals {
            self.entries.remove(id);
        }
        let added: Vec<EntryId> = add.iter().map(|e| e.id().clone()).collect();
        for entry in add {
            info!(id = %entry.id(), owner = entry.owner(), "entry added");
            self.entries.insert(entry.id().clone(), entry);
        }
        for id in &removals {
            info!(%id, "entry removed");
        }

        self.recompute(added, removals);
        Ok(())
    }

    /// Remove every entry owned by `identity`. Succeeds silently when
    /// nothing matches; returns the removed ids.
    pub fn remove_entries_for_owner(&mut self, identity: &str) -> Vec<EntryId> {
        let removed: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.owner() == identity)
            .map(|e| e.id().clone())
            .collect();
        if removed.is_empty() {
            return removed;
        }
        for id in &removed {
            self.entries.remove(id);
        }
        info!(owner = identity, count = removed.len(), "removed entries for owner");
        self.recompute(vec![], removed.clone());
        removed
    }

    /// Snapshot of all entries.
    pub fn get_entries(&self) -> HashMap<EntryId, ScheduleEntry> {
        self.entries.clone()
    }

    pub fn get_entry(&self, id: &EntryId) -> Option<&ScheduleEntry> {
        self.entries.get(id)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn active_entry_count(&self) -> usize {
        self.active.len()
    }

    /// Whether `id` is currently allowed to download.
    pub fn is_entry_active(&self, id: &EntryId) -> bool {
        self.active.contains(id)
    }

    /// True iff at least one connection currently permits downloading.
    pub fn allow_downloads(&self) -> bool {
        self.allow_downloads
    }

    /// Change an entry's priority, notifying per-field before the
    /// aggregate signals of the triggered re-evaluation.
    pub fn set_entry_priority(&mut self, id: &EntryId, priority: u32) -> ScheduleResult<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| ScheduleError::UnknownEntry(id.to_string()))?;
        if entry.set_priority(priority) {
            self.emit(SchedulerSignal::EntryPriorityChanged {
                id: id.clone(),
                priority,
            });
            self.recompute(vec![], vec![]);
        }
        Ok(())
    }

    /// Change an entry's resumable hint, notifying per-field before the
    /// aggregate signals of the triggered re-evaluation.
    pub fn set_entry_resumable(&mut self, id: &EntryId, resumable: bool) -> ScheduleResult<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| ScheduleError::UnknownEntry(id.to_string()))?;
        if entry.set_resumable(resumable) {
            self.emit(SchedulerSignal::EntryResumableChanged {
                id: id.clone(),
                resumable,
            });
            self.recompute(vec![], vec![]);
        }
        Ok(())
    }

    /// React to a connection monitor event.
    pub fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::ConnectionsChanged { added, removed } => {
                for id in removed {
                    self.connections.remove(&id);
                }
                for id in added {
                    self.refresh_connection(&id);
                }
            }
            ConnectionEvent::DetailsChanged { id } => {
                self.refresh_connection(&id);
            }
        }
        self.recompute(vec![], vec![]);
    }

    /// React to a peer-vanished event: drop everything the peer owned.
    pub fn handle_peer_vanished(&mut self, handle: &str) {
        let identity = self
            .peer_identities
            .remove(handle)
            .or_else(|| self.peer_manager.get_peer_credentials(handle));
        match identity {
            Some(identity) => {
                debug!(handle, %identity, "peer vanished");
                self.remove_entries_for_owner(&identity);
            }
            None => trace!(handle, "vanished peer had no entries"),
        }
    }

    /// React to a wall-clock offset change: stored transition instants are
    /// stale, so re-evaluate and re-arm.
    pub fn handle_offset_changed(&mut self) {
        debug!("clock offset changed");
        self.recompute(vec![], vec![]);
    }

    /// React to the tariff-transition alarm.
    pub fn handle_alarm_fired(&mut self) {
        self.alarm = None;
        trace!("tariff transition alarm fired");
        self.recompute(vec![], vec![]);
    }

    /// Drop all entries and cancel the alarm, signalling observers.
    pub fn shutdown(&mut self) {
        let removed: Vec<EntryId> = self.entries.keys().cloned().collect();
        self.entries.clear();
        if !removed.is_empty() {
            info!(count = removed.len(), "dropping entries at shutdown");
        }
        self.recompute(vec![], removed);
        if let Some(alarm) = self.alarm.take() {
            self.clock.remove_alarm(alarm);
        }
    }

    fn refresh_all_connections(&mut self) {
        self.connections.clear();
        for id in self.connection_monitor.connection_ids() {
            self.refresh_connection(&id);
        }
    }

    /// Re-read one connection from the monitor. A connection that cannot
    /// be queried is treated as gone, never as an error.
    fn refresh_connection(&mut self, id: &str) {
        match self.connection_monitor.connection_details(id) {
            Some(details) => {
                self.connections.insert(id.to_string(), details);
            }
            None => {
                warn!(id, "connection vanished while refreshing details");
                self.connections.remove(id);
            }
        }
    }

    /// Re-evaluate the active set and emit change signals.
    ///
    /// `added` / `removed` describe the entry-set change that triggered
    /// this pass. The emission order is part of the contract: active
    /// removals are signalled before the entry change, active additions
    /// after it, so observers never see an inconsistent world.
    fn recompute(&mut self, added: Vec<EntryId>, removed: Vec<EntryId>) {
        let now = self.clock.now_local();
        let allow_downloads = self
            .connections
            .values()
            .any(|details| details.allows_download_at(now));

        let new_active: BTreeSet<EntryId> = if allow_downloads {
            let mut candidates: Vec<&ScheduleEntry> = self.entries.values().collect();
            candidates.sort_by(|a, b| {
                b.priority()
                    .cmp(&a.priority())
                    .then_with(|| a.id().cmp(b.id()))
            });
            candidates
                .into_iter()
                .take(self.config.max_active_entries)
                .map(|e| e.id().clone())
                .collect()
        } else {
            BTreeSet::new()
        };

        let deactivated: Vec<EntryId> = self.active.difference(&new_active).cloned().collect();
        let activated: Vec<EntryId> = new_active.difference(&self.active).cloned().collect();
        self.active = new_active;

        if !deactivated.is_empty() {
            trace!(?deactivated, "entries deactivated");
            self.emit(SchedulerSignal::ActiveEntriesChanged {
                added: vec![],
                removed: deactivated,
            });
        }
        if !(added.is_empty() && removed.is_empty()) {
            self.emit(SchedulerSignal::EntriesChanged { added, removed });
        }
        if !activated.is_empty() {
            trace!(?activated, "entries activated");
            self.emit(SchedulerSignal::ActiveEntriesChanged {
                added: activated,
                removed: vec![],
            });
        }
        if allow_downloads != self.allow_downloads {
            self.allow_downloads = allow_downloads;
            debug!(allow_downloads, "download permission changed");
            self.emit(SchedulerSignal::AllowDownloadsChanged { allow_downloads });
        }

        self.rearm_alarm(now);
    }

    /// Arm one alarm at the earliest tariff transition across connections
    /// whose flags permit downloading, cancelling any previous alarm.
    /// Connections currently blocked only by their tariff still count:
    /// their next transition is exactly when they may become usable.
    fn rearm_alarm(&mut self, now: DateTime<Utc>) {
        if let Some(alarm) = self.alarm.take() {
            self.clock.remove_alarm(alarm);
        }
        let next = self
            .connections
            .values()
            .filter(|details| details.flags_permit())
            .filter_map(|details| details.tariff.as_ref())
            .filter_map(|tariff| tariff.next_transition(Some(now)))
            .map(|transition| transition.at)
            .min();
        if let Some(at) = next {
            trace!(%at, "arming tariff transition alarm");
            let tx = self.alarm_tx.clone();
            let id = self.clock.add_alarm(
                at,
                Box::new(move || {
                    let _ = tx.send(());
                }),
            );
            self.alarm = Some(id);
        }
    }

    fn emit(&mut self, signal: SchedulerSignal) {
        self.subscribers.retain(|tx| tx.send(signal.clone()).is_ok());
    }
}
