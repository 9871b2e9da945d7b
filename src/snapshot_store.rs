//! A thread-safe in-memory slot for the currently active snapshot. [`SnapshotStore`] provides
//! concurrent access for readers (evaluation) and writers (refresh).
use std::sync::{Arc, RwLock};

use crate::snapshot::FlagSnapshot;

/// `SnapshotStore` provides a thread-safe (`Sync`) storage for the active [`FlagSnapshot`].
///
/// Readers only hold the lock long enough to clone the `Arc`, so they always observe either the
/// old or the new snapshot in full.
#[derive(Default)]
pub struct SnapshotStore {
    snapshot: RwLock<Option<Arc<FlagSnapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        SnapshotStore::default()
    }

    /// Get the currently active snapshot. Returns None if nothing has been stored yet.
    pub fn get_snapshot(&self) -> Option<Arc<FlagSnapshot>> {
        // Err() is possible only if the lock is poisoned (writer panicked while holding the lock),
        // which should never happen.
        let snapshot = self
            .snapshot
            .read()
            .expect("thread holding snapshot lock should not panic");

        snapshot.clone()
    }

    /// Set a new snapshot, returning the previous one.
    pub fn set_snapshot(&self, snapshot: Arc<FlagSnapshot>) -> Option<Arc<FlagSnapshot>> {
        let mut slot = self
            .snapshot
            .write()
            .expect("thread holding snapshot lock should not panic");

        slot.replace(snapshot)
    }

    /// Drop the current snapshot, returning it.
    pub fn clear(&self) -> Option<Arc<FlagSnapshot>> {
        let mut slot = self
            .snapshot
            .write()
            .expect("thread holding snapshot lock should not panic");

        slot.take()
    }
}
