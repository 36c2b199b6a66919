use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Cumulative count of slots preferred from each physical accelerator.
///
/// Counts only ever grow: the kubelet never tells a device plugin when a
/// container releases its devices, so this is a spreading heuristic rather
/// than an outstanding-allocation count. It lives for the whole process and
/// is shared by every protocol endpoint instance.
#[derive(Debug, Default)]
pub struct AllocationTracker {
    counts: Mutex<HashMap<String, u64>>,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// current count for an accelerator, zero if never seen
    pub fn load(&self, accelerator_id: &str) -> u64 {
        self.lock().get(accelerator_id).copied().unwrap_or(0)
    }

    /// increment the count of an accelerator and return the new value
    pub fn increment(&self, accelerator_id: &str) -> u64 {
        increment_in(&mut self.lock(), accelerator_id)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.lock().clone()
    }

    /// Hold the counters for a multi-step read-then-increment.
    ///
    /// A poisoned lock still carries valid counts, so it is recovered.
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn increment_in(counts: &mut HashMap<String, u64>, accelerator_id: &str) -> u64 {
    let count = counts.entry(accelerator_id.to_string()).or_insert(0);
    *count += 1;
    *count
}
