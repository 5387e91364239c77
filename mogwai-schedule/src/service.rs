//! Service facade
//!
//! Bridges a client-facing surface (bus methods and properties) to the
//! scheduler: property maps are deserialized, the calling peer is
//! resolved to a stable identity, and the result is applied through
//! [`Scheduler::update_entries`]. In-flight resolutions race the shutdown
//! token and resolve to `Cancelled` once it triggers.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::entry::EntryId;
use crate::error::{ScheduleError, ScheduleResult};
use crate::peer::PeerManager;
use crate::runtime::SharedScheduler;
use crate::scheduler::Scheduler;
use crate::shutdown::ShutdownToken;

/// Result of scheduling a batch of property maps.
///
/// Maps that fail to deserialize are rejected individually and reported
/// with their batch index; the remaining entries are still added.
#[derive(Debug, Default, PartialEq)]
pub struct BatchOutcome {
    /// Ids of the entries that were scheduled
    pub scheduled: Vec<EntryId>,
    /// Index and error of each rejected property map
    pub rejected: Vec<(usize, ScheduleError)>,
}

/// Client-facing operations over a shared scheduler
#[derive(Clone)]
pub struct ScheduleService {
    scheduler: SharedScheduler,
    peer_manager: Arc<dyn PeerManager>,
    shutdown: ShutdownToken,
}

impl ScheduleService {
    pub fn new(scheduler: SharedScheduler, shutdown: ShutdownToken) -> Self {
        let peer_manager = Arc::clone(scheduler.lock().peer_manager());
        Self {
            scheduler,
            peer_manager,
            shutdown,
        }
    }

    /// Resolve the calling peer, racing scheduler shutdown.
    async fn resolve_peer(&self, handle: &str) -> ScheduleResult<String> {
        if self.shutdown.is_triggered() {
            return Err(ScheduleError::Cancelled);
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ScheduleError::Cancelled),
            identity = self.peer_manager.ensure_peer_credentials(handle) => identity,
        }
    }

    /// Schedule one entry for the peer behind `handle`.
    pub async fn schedule(
        &self,
        handle: &str,
        properties: &Map<String, Value>,
    ) -> ScheduleResult<EntryId> {
        let identity = self.resolve_peer(handle).await?;
        let mut scheduler = self.scheduler.lock();
        scheduler.remember_peer(handle, &identity);
        let entry = scheduler.new_entry(&identity, properties)?;
        let id = entry.id().clone();
        scheduler.update_entries(vec![entry], &[])?;
        debug!(%id, owner = %identity, "scheduled entry");
        Ok(id)
    }

    /// Schedule a batch of entries for the peer behind `handle`.
    ///
    /// Individual property maps that fail to deserialize are rejected
    /// without affecting the rest; exceeding an entry quota rejects the
    /// whole batch atomically.
    pub async fn schedule_entries(
        &self,
        handle: &str,
        batch: &[Map<String, Value>],
    ) -> ScheduleResult<BatchOutcome> {
        let identity = self.resolve_peer(handle).await?;
        let mut scheduler = self.scheduler.lock();
        scheduler.remember_peer(handle, &identity);

        let mut outcome = BatchOutcome::default();
        let mut entries = Vec::with_capacity(batch.len());
        for (index, properties) in batch.iter().enumerate() {
            match scheduler.new_entry(&identity, properties) {
                Ok(entry) => entries.push(entry),
                Err(err) => outcome.rejected.push((index, err)),
            }
        }
        outcome.scheduled = entries.iter().map(|e| e.id().clone()).collect();
        scheduler.update_entries(entries, &[])?;
        debug!(
            scheduled = outcome.scheduled.len(),
            rejected = outcome.rejected.len(),
            "scheduled entry batch"
        );
        Ok(outcome)
    }

    /// Remove an entry by id. Fails with
    /// [`ScheduleError::UnknownEntry`] when no such entry exists.
    pub fn remove(&self, id: &EntryId) -> ScheduleResult<()> {
        let mut scheduler = self.scheduler.lock();
        if scheduler.get_entry(id).is_none() {
            return Err(ScheduleError::UnknownEntry(id.to_string()));
        }
        scheduler.update_entries(vec![], std::slice::from_ref(id))
    }

    /// Handle to one entry, for the per-entry property surface.
    pub fn entry(&self, id: &EntryId) -> ScheduleResult<EntryHandle> {
        let scheduler = self.scheduler.lock();
        if scheduler.get_entry(id).is_none() {
            return Err(ScheduleError::UnknownEntry(id.to_string()));
        }
        Ok(EntryHandle {
            service: self.clone(),
            id: id.clone(),
        })
    }

    pub fn entry_count(&self) -> usize {
        self.scheduler.lock().entry_count()
    }

    pub fn active_entry_count(&self) -> usize {
        self.scheduler.lock().active_entry_count()
    }

    /// Whether any connection currently permits downloading.
    pub fn download_now(&self) -> bool {
        self.scheduler.lock().allow_downloads()
    }
}

/// A client's view of one schedule entry.
///
/// Accessors fail with [`ScheduleError::Invalidated`] once the entry has
/// disappeared on the server side.
pub struct EntryHandle {
    service: ScheduleService,
    id: EntryId,
}

impl EntryHandle {
    pub fn id(&self) -> &EntryId {
        &self.id
    }

    fn with_scheduler<T>(
        &self,
        f: impl FnOnce(&mut Scheduler) -> ScheduleResult<T>,
    ) -> ScheduleResult<T> {
        let mut scheduler = self.service.scheduler.lock();
        if scheduler.get_entry(&self.id).is_none() {
            return Err(ScheduleError::Invalidated(self.id.to_string()));
        }
        f(&mut scheduler)
    }

    pub fn priority(&self) -> ScheduleResult<u32> {
        self.with_scheduler(|s| Ok(s.get_entry(&self.id).map(|e| e.priority()).unwrap_or(0)))
    }

    pub fn set_priority(&self, priority: u32) -> ScheduleResult<()> {
        self.with_scheduler(|s| s.set_entry_priority(&self.id, priority))
    }

    pub fn resumable(&self) -> ScheduleResult<bool> {
        self.with_scheduler(|s| {
            Ok(s.get_entry(&self.id).map(|e| e.resumable()).unwrap_or(false))
        })
    }

    pub fn set_resumable(&self, resumable: bool) -> ScheduleResult<()> {
        self.with_scheduler(|s| s.set_entry_resumable(&self.id, resumable))
    }

    /// Whether this entry is currently allowed to download.
    pub fn download_now(&self) -> ScheduleResult<bool> {
        self.with_scheduler(|s| Ok(s.is_entry_active(&self.id)))
    }

    /// Remove this entry.
    pub fn remove(self) -> ScheduleResult<()> {
        self.with_scheduler(|s| s.update_entries(vec![], std::slice::from_ref(&self.id)))
    }
}
