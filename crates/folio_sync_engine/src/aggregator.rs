//! Fan-in of many sync state streams into one.

use crate::state::{SyncStateContainer, SyncStateWatcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::error;

struct AggregatorInner {
    base: Option<Box<dyn SyncStateWatcher>>,
    slots: HashMap<u64, SyncStateContainer>,
    next_id: u64,
    last: Option<SyncStateContainer>,
}

impl AggregatorInner {
    fn aggregate(&self) -> SyncStateContainer {
        let mut merged = SyncStateContainer::default();
        for state in self.slots.values() {
            merged.merge(state);
        }
        merged
    }

    fn forward_if_changed(&mut self) {
        let merged = self.aggregate();
        if self.last != Some(merged) {
            self.last = Some(merged);
            if let Some(base) = &self.base {
                base.notify(merged);
            }
        }
    }
}

/// Merges the sync states of many sources into one stream.
///
/// Each source holds a [`AggregatorListener`] handle; every notification
/// updates that handle's private slot, re-derives the aggregate over all
/// live handles, and forwards it to the base watcher only when it changed.
pub struct Aggregator {
    inner: Arc<Mutex<AggregatorInner>>,
}

impl Aggregator {
    /// Creates an aggregator with no base watcher.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(AggregatorInner {
                base: None,
                slots: HashMap::new(),
                next_id: 0,
                last: None,
            })),
        }
    }

    /// Installs the watcher receiving the aggregated stream.
    pub fn set_base_watcher(&self, watcher: Box<dyn SyncStateWatcher>) {
        let mut inner = self.inner.lock();
        inner.base = Some(watcher);
        // A late-installed base catches up with the current aggregate.
        if let Some(last) = inner.last {
            if let Some(base) = &inner.base {
                base.notify(last);
            }
        }
    }

    /// Returns a new watcher handle participating in the aggregate.
    pub fn get_new_state_watcher(&self) -> AggregatorListener {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.insert(id, SyncStateContainer::default());
        AggregatorListener {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live handles.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        let count = self.inner.lock().slots.len();
        if count != 0 {
            // Handles must not outlive the aggregator they report into.
            // Late notifications from such handles are dropped silently.
            error!(count, "aggregator dropped with live listeners");
        }
    }
}

/// A watcher handle produced by [`Aggregator::get_new_state_watcher`].
///
/// Holds only a back-reference to its aggregator: dropping the handle
/// unregisters it, and notifications after the aggregator is gone are
/// silently dropped.
pub struct AggregatorListener {
    id: u64,
    inner: Weak<Mutex<AggregatorInner>>,
}

impl SyncStateWatcher for AggregatorListener {
    fn notify(&self, state: SyncStateContainer) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock();
            inner.slots.insert(self.id, state);
            inner.forward_if_changed();
        }
    }
}

impl Drop for AggregatorListener {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().slots.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DownloadSyncState, UploadSyncState};

    fn recording_watcher() -> (Box<dyn SyncStateWatcher>, Arc<Mutex<Vec<SyncStateContainer>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let watcher = move |state: SyncStateContainer| {
            sink.lock().push(state);
        };
        (Box::new(watcher), seen)
    }

    #[test]
    fn aggregate_takes_maximum_across_listeners() {
        let aggregator = Aggregator::new();
        let (base, seen) = recording_watcher();
        aggregator.set_base_watcher(base);

        let a = aggregator.get_new_state_watcher();
        let b = aggregator.get_new_state_watcher();

        a.notify(SyncStateContainer::new(
            DownloadSyncState::Backlog,
            UploadSyncState::Idle,
        ));
        b.notify(SyncStateContainer::new(
            DownloadSyncState::Idle,
            UploadSyncState::InProgress,
        ));

        let last = *seen.lock().last().unwrap();
        assert_eq!(last.download, DownloadSyncState::Idle);
        assert_eq!(last.upload, UploadSyncState::InProgress);

        drop(a);
        drop(b);
    }

    #[test]
    fn unchanged_aggregate_is_not_forwarded() {
        let aggregator = Aggregator::new();
        let (base, seen) = recording_watcher();
        aggregator.set_base_watcher(base);

        let a = aggregator.get_new_state_watcher();
        let state =
            SyncStateContainer::new(DownloadSyncState::Backlog, UploadSyncState::NotStarted);
        a.notify(state);
        a.notify(state);

        assert_eq!(seen.lock().len(), 1);
        drop(a);
    }

    #[test]
    fn dropped_listener_is_unregistered() {
        let aggregator = Aggregator::new();
        let a = aggregator.get_new_state_watcher();
        assert_eq!(aggregator.listener_count(), 1);
        drop(a);
        assert_eq!(aggregator.listener_count(), 0);
    }

    #[test]
    fn late_base_watcher_catches_up() {
        let aggregator = Aggregator::new();
        let a = aggregator.get_new_state_watcher();
        a.notify(SyncStateContainer::new(
            DownloadSyncState::Idle,
            UploadSyncState::Idle,
        ));

        let (base, seen) = recording_watcher();
        aggregator.set_base_watcher(base);
        assert_eq!(seen.lock().len(), 1);
        drop(a);
    }
}
