//! Clock seam
//!
//! Wall-time reads and one-shot alarms. The scheduler stores wall-clock
//! instants for tariff transitions, so the clock also reports offset
//! changes (the system clock being stepped) that invalidate those
//! instants. [`SystemClock`] is the production variant; [`VirtualClock`]
//! lets tests advance time by hand.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Identifier of an armed alarm; never zero.
pub type AlarmId = u64;

/// Callback invoked when an alarm fires.
pub type AlarmCallback = Box<dyn FnOnce() + Send + 'static>;

/// Wall-time reads, alarm scheduling, offset-change notification
pub trait Clock: Send + Sync {
    /// Current wall-clock instant (UTC).
    fn now_local(&self) -> DateTime<Utc>;

    /// Arm a one-shot alarm at `at`. An instant in the past fires as soon
    /// as the runtime schedules it.
    fn add_alarm(&self, at: DateTime<Utc>, callback: AlarmCallback) -> AlarmId;

    /// Cancel an armed alarm. Unknown ids are ignored.
    fn remove_alarm(&self, id: AlarmId);

    /// Subscribe to clock-offset changes.
    fn subscribe_offset(&self) -> mpsc::UnboundedReceiver<()>;
}

/// Production clock: wall time plus tokio sleep tasks for alarms.
///
/// Offset changes are not detected on this backend; the subscription stays
/// open and silent.
#[derive(Debug, Default)]
pub struct SystemClock {
    next_id: AtomicU64,
    alarms: Mutex<HashMap<AlarmId, JoinHandle<()>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<()>>>,
}

impl SystemClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Clock for SystemClock {
    fn now_local(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn add_alarm(&self, at: DateTime<Utc>, callback: AlarmCallback) -> AlarmId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        let mut alarms = self.alarms.lock();
        // Finished tasks from earlier alarms are dead weight; drop them.
        alarms.retain(|_, handle| !handle.is_finished());
        alarms.insert(id, handle);
        trace!(id, %at, "armed alarm");
        id
    }

    fn remove_alarm(&self, id: AlarmId) {
        if let Some(handle) = self.alarms.lock().remove(&id) {
            handle.abort();
            trace!(id, "cancelled alarm");
        }
    }

    fn subscribe_offset(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

#[derive(Debug, Default)]
struct VirtualState {
    now: DateTime<Utc>,
    next_id: u64,
    deadlines: BTreeMap<(DateTime<Utc>, AlarmId), ()>,
}

/// Manually advanced clock for tests.
///
/// Alarms are kept in a deadline-ordered queue and fire, in order, while
/// the clock is advanced past them. Stepping the clock with
/// [`set_offset`] emits an offset event but fires no alarms.
///
/// [`set_offset`]: VirtualClock::set_offset
pub struct VirtualClock {
    state: Mutex<VirtualState>,
    // Callbacks live apart from the deadline queue so firing can happen
    // with the state lock released.
    callbacks: Mutex<HashMap<AlarmId, AlarmCallback>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<()>>>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(VirtualState {
                now: start,
                next_id: 0,
                deadlines: BTreeMap::new(),
            }),
            callbacks: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Advance to `to`, firing every alarm armed at or before it.
    pub fn advance_to(&self, to: DateTime<Utc>) {
        loop {
            let due = {
                let mut state = self.state.lock();
                assert!(to >= state.now, "virtual clock cannot go backwards");
                match state.deadlines.first_key_value() {
                    Some(((at, id), ())) if *at <= to => {
                        let key = (*at, *id);
                        state.deadlines.remove(&key);
                        state.now = key.0;
                        Some(key.1)
                    }
                    _ => {
                        state.now = to;
                        None
                    }
                }
            };
            match due.and_then(|id| self.callbacks.lock().remove(&id)) {
                Some(callback) => callback(),
                None if due.is_some() => continue,
                None => break,
            }
        }
    }

    /// Advance by a duration.
    pub fn advance(&self, by: Duration) {
        let to = self.state.lock().now + by;
        self.advance_to(to);
    }

    /// Step the clock by `offset` and notify subscribers. Armed alarms
    /// keep their original wall-clock instants.
    pub fn set_offset(&self, offset: Duration) {
        {
            let mut state = self.state.lock();
            state.now += offset;
        }
        self.subscribers.lock().retain(|tx| tx.send(()).is_ok());
    }

    /// Number of currently armed alarms.
    pub fn armed_alarms(&self) -> usize {
        self.state.lock().deadlines.len()
    }

    /// Deadline of the earliest armed alarm.
    pub fn next_alarm_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .deadlines
            .first_key_value()
            .map(|((at, _), ())| *at)
    }
}

impl Clock for VirtualClock {
    fn now_local(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    fn add_alarm(&self, at: DateTime<Utc>, callback: AlarmCallback) -> AlarmId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.deadlines.insert((at, id), ());
        self.callbacks.lock().insert(id, callback);
        id
    }

    fn remove_alarm(&self, id: AlarmId) {
        let mut state = self.state.lock();
        state.deadlines.retain(|(_, alarm), ()| *alarm != id);
        self.callbacks.lock().remove(&id);
    }

    fn subscribe_offset(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}
