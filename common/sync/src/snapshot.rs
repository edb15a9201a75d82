// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

use crate::Mutex;

/// A copy-on-write cell holding the current snapshot of some shared state.
///
/// `load` hands out an `Arc` to the snapshot that is current at the time of the call. The internal
/// lock is only held while that `Arc` is cloned or replaced, so a reader never holds up a writer
/// for the duration of its use of the snapshot, and everything reachable from a loaded snapshot
/// stays alive until the reader drops it.
///
/// Writers are expected to be serialized by the caller. A `store` computed from a snapshot that
/// another writer has since replaced silently drops that writer's change.
pub struct SnapshotCell<T> {
    current: Mutex<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> SnapshotCell<T> {
        SnapshotCell {
            current: Mutex::new(Arc::new(value)),
        }
    }

    /// Returns the current snapshot.
    pub fn load(&self) -> Arc<T> {
        self.current.lock().clone()
    }

    /// Replaces the current snapshot with `value`.
    pub fn store(&self, value: T) {
        *self.current.lock() = Arc::new(value);
    }
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        SnapshotCell::new(T::default())
    }
}

impl<T: Debug> Debug for SnapshotCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("SnapshotCell").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_keeps_old_snapshot() {
        let cell = SnapshotCell::new(vec![1u32]);
        let before = cell.load();
        let mut next = Vec::clone(&cell.load());
        next.push(2);
        cell.store(next);
        assert_eq!(*before, vec![1]);
        assert_eq!(*cell.load(), vec![1, 2]);
    }
}
