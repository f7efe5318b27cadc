use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

/// A consistent copy of the running average.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Snapshot {
    pub average: f64,
    pub count: u64,
}

/// Running mean of the scores accepted during the current session.
///
/// Written only by the capture worker, read by the controller. Both fields
/// live behind one mutex and are always replaced together, so a reader can
/// never see an average that belongs to a different count. The lock is
/// never held across I/O.
#[derive(Debug, Default)]
pub struct AggregateState {
    inner: Mutex<Snapshot>,
}

impl AggregateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one accepted score into the mean.
    pub fn record(&self, score: f64) {
        let mut state = self.lock();
        let count = state.count as f64;
        *state = Snapshot {
            average: (state.average * count + score) / (count + 1.0),
            count: state.count + 1,
        };
    }

    pub fn snapshot(&self) -> Snapshot {
        *self.lock()
    }

    pub fn reset(&self) {
        *self.lock() = Snapshot::default();
    }

    // The guarded value is always written whole, so a poisoned lock still
    // holds a consistent snapshot.
    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
