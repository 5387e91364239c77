//! Schedule entries
//!
//! A schedule entry is a client's registered request to download. The id
//! and owner are fixed at construction; priority and resumability stay
//! mutable for the entry's lifetime.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ScheduleError, ScheduleResult};

/// Opaque entry identifier, unique and monotonic within one scheduler
/// lifetime.
///
/// The rendered form is fixed-width hex so that lexicographic order equals
/// creation order; the scheduler relies on that for stable tie-breaking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Wrap an externally supplied id (facade lookups, tests).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub(crate) fn from_serial(serial: u64) -> Self {
        Self(format!("entry-{serial:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A client's registered request to be scheduled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    id: EntryId,
    owner: String,
    priority: u32,
    resumable: bool,
}

impl ScheduleEntry {
    pub(crate) fn new(id: EntryId, owner: impl Into<String>) -> Self {
        Self {
            id,
            owner: owner.into(),
            priority: 0,
            resumable: false,
        }
    }

    /// Construct an entry from a deserialized property map.
    ///
    /// Unknown keys are ignored for forward compatibility. Recognized keys
    /// of the wrong value type fail with
    /// [`ScheduleError::InvalidParameters`]. Absent keys take their
    /// defaults: priority 0, not resumable.
    pub(crate) fn from_properties(
        id: EntryId,
        owner: impl Into<String>,
        properties: &Map<String, Value>,
    ) -> ScheduleResult<Self> {
        let mut entry = Self::new(id, owner);
        for (key, value) in properties {
            match key.as_str() {
                "priority" => {
                    let priority = value
                        .as_u64()
                        .and_then(|v| u32::try_from(v).ok())
                        .ok_or_else(|| {
                            ScheduleError::InvalidParameters(format!(
                                "'priority' must be an unsigned 32-bit integer, got {value}"
                            ))
                        })?;
                    entry.priority = priority;
                }
                "resumable" => {
                    entry.resumable = value.as_bool().ok_or_else(|| {
                        ScheduleError::InvalidParameters(format!(
                            "'resumable' must be a boolean, got {value}"
                        ))
                    })?;
                }
                _ => {}
            }
        }
        Ok(entry)
    }

    pub fn id(&self) -> &EntryId {
        &self.id
    }

    /// Stable peer identity that registered this entry
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Higher priority entries are preferred for activation.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn resumable(&self) -> bool {
        self.resumable
    }

    /// Set the priority; returns whether the value changed.
    pub(crate) fn set_priority(&mut self, priority: u32) -> bool {
        let changed = self.priority != priority;
        self.priority = priority;
        changed
    }

    /// Set resumability; returns whether the value changed.
    pub(crate) fn set_resumable(&mut self, resumable: bool) -> bool {
        let changed = self.resumable != resumable;
        self.resumable = resumable;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn defaults_apply_when_keys_absent() {
        let entry =
            ScheduleEntry::from_properties(EntryId::from_serial(1), "owner", &Map::new()).unwrap();
        assert_eq!(entry.priority(), 0);
        assert!(!entry.resumable());
    }

    #[test]
    fn recognized_keys_are_applied() {
        let entry = ScheduleEntry::from_properties(
            EntryId::from_serial(1),
            "owner",
            &props(json!({"priority": 5, "resumable": true})),
        )
        .unwrap();
        assert_eq!(entry.priority(), 5);
        assert!(entry.resumable());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let entry = ScheduleEntry::from_properties(
            EntryId::from_serial(1),
            "owner",
            &props(json!({"a-future-key": [1, 2, 3]})),
        )
        .unwrap();
        assert_eq!(entry.priority(), 0);
    }

    #[test]
    fn wrong_typed_priority_is_rejected() {
        let err = ScheduleEntry::from_properties(
            EntryId::from_serial(1),
            "owner",
            &props(json!({"priority": "high"})),
        );
        assert!(matches!(err, Err(ScheduleError::InvalidParameters(_))));
    }

    #[test]
    fn out_of_range_priority_is_rejected() {
        let err = ScheduleEntry::from_properties(
            EntryId::from_serial(1),
            "owner",
            &props(json!({"priority": u64::from(u32::MAX) + 1})),
        );
        assert!(matches!(err, Err(ScheduleError::InvalidParameters(_))));
    }

    #[test]
    fn wrong_typed_resumable_is_rejected() {
        let err = ScheduleEntry::from_properties(
            EntryId::from_serial(1),
            "owner",
            &props(json!({"resumable": 1})),
        );
        assert!(matches!(err, Err(ScheduleError::InvalidParameters(_))));
    }

    #[test]
    fn ids_order_by_creation() {
        assert!(EntryId::from_serial(9) < EntryId::from_serial(10));
        assert!(EntryId::from_serial(255) < EntryId::from_serial(4096));
    }
}
