//! Per-mailbox change trackers.
//!
//! A tracker is a wakeup primitive: writers (local delivery, another
//! session's APPEND/STORE/EXPUNGE) call `notify` after committing a
//! change, idling IMAP sessions block on `notified()` and then diff
//! their snapshot against the store. Buffering happens in the sessions,
//! not here, so a tracker never grows.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

#[derive(Default)]
pub struct TrackerRegistry {
    trackers: DashMap<i64, Arc<Notify>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self, mailbox_id: i64) -> Arc<Notify> {
        self.trackers
            .entry(mailbox_id)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn notify(&self, mailbox_id: i64) {
        if let Some(tracker) = self.trackers.get(&mailbox_id) {
            tracker.notify_waiters();
        }
    }

    /// Called when a mailbox is deleted (or renamed, which is the same
    /// thing for running sessions). Waiters are woken one last time and
    /// will find the mailbox gone on resync.
    pub fn remove(&self, mailbox_id: i64) {
        if let Some((_, tracker)) = self.trackers.remove(&mailbox_id) {
            tracker.notify_waiters();
        }
    }
}
