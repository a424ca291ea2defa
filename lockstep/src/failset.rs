//! Run-wide failed-worker set.

use crate::context::WorkerId;
use dashmap::DashSet;

/// The shared record of every worker failed out of a run, whether by a
/// barrier timeout or by an error reported outside a barrier wait.
///
/// Insertion is atomic and reports whether the caller won. The winner is
/// the one place allowed to decrement barrier party counts and trip the
/// worker's kill switch; losing callers must do neither. That rule is
/// what keeps the decrement and the kill exactly-once per worker per run
/// even when a timeout sweep and an external failure report race.
#[derive(Default)]
pub struct FailedSet {
    inner: DashSet<WorkerId>,
}

impl FailedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `id` as failed.
    ///
    /// # Returns
    ///
    /// * `true` if this call inserted the id, `false` if it was already
    ///   present.
    pub fn fail(&self, id: WorkerId) -> bool {
        self.inner.insert(id)
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.inner.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Forgets every failure. Only meaningful at a run boundary.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Unordered snapshot of the failed ids.
    pub fn snapshot(&self) -> Vec<WorkerId> {
        self.inner.iter().map(|id| *id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_is_exactly_once() {
        let set = FailedSet::new();
        let id = WorkerId::new(3);
        assert!(!set.contains(id));
        assert!(set.fail(id));
        assert!(set.contains(id));
        // Second report of the same worker loses.
        assert!(!set.fail(id));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_clear_and_snapshot() {
        let set = FailedSet::new();
        set.fail(WorkerId::new(0));
        set.fail(WorkerId::new(2));
        let mut snap = set.snapshot();
        snap.sort_by_key(|id| id.index());
        assert_eq!(snap, vec![WorkerId::new(0), WorkerId::new(2)]);
        set.clear();
        assert!(set.is_empty());
    }
}
