//! Keyed async locks serializing event handling per meeting.
//!
//! Handlers for one meeting id run one at a time; different meetings proceed
//! concurrently. Waiters acquire in arrival order (`tokio::sync::Mutex` is
//! fair). An entry is dropped from the map once nobody holds or waits on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
pub struct MeetingLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

/// Held while a meeting's handler runs. Releases on drop.
#[derive(Debug)]
pub struct MeetingGuard<'a> {
    locks: &'a MeetingLocks,
    meeting_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl MeetingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for exclusive access to `meeting_id`.
    pub async fn lock(&self, meeting_id: &str) -> MeetingGuard<'_> {
        let slot = self.slots().entry(meeting_id.to_string()).or_default().clone();
        let guard = slot.lock_owned().await;

        MeetingGuard {
            locks: self,
            meeting_id: meeting_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of meetings currently locked or waited on.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for MeetingGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut slots = self.locks.slots();
        let unused = slots
            .get(&self.meeting_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1);
        if unused {
            slots.remove(&self.meeting_id);
        }
    }
}
