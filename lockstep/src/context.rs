//! Worker identity and per-worker state.
//!
//! Each worker in a run owns a [`WorkerContext`]: a stable [`WorkerId`],
//! a human-readable name (also used as the thread name), a [`KillSwitch`]
//! through which the barrier or the harness terminates it, and a small
//! concurrent key/value store for workload state that must survive across
//! checkpoints.
//!
//! Termination is cooperative. Tripping a kill switch only raises a flag;
//! the worker actually unwinds the next time it crosses a safe point (a
//! barrier entry, the harness between lifecycle phases, or an explicit
//! [`KillSwitch::abort_if_tripped`] call inside long-running work). The
//! unwind carries a [`WorkerKilled`] payload so the harness can tell a
//! termination apart from an ordinary panic.

use dashmap::DashMap;
use serde_json::Value;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};

const SC: Ordering = Ordering::SeqCst;

/// Opaque identity of a worker within a run.
///
/// Assigned once when the run's contexts are built and stable for the
/// run's lifetime; all barrier bookkeeping is keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unwind payload carried out of a terminated worker thread.
///
/// Code that drives workers distinguishes this payload from ordinary
/// panics and records the worker as killed rather than failed.
#[derive(Debug)]
pub struct WorkerKilled;

/// Cooperative cancellation flag for one worker.
pub struct KillSwitch {
    tripped: AtomicBool,
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl KillSwitch {
    pub fn new() -> Self {
        Self {
            tripped: AtomicBool::new(false),
        }
    }

    /// Raises the flag. The worker unwinds at its next safe point.
    pub fn trip(&self) {
        self.tripped.store(true, SC);
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(SC)
    }

    /// Unwinds the calling thread with a [`WorkerKilled`] payload.
    ///
    /// Uses `resume_unwind` rather than `panic!` so the global panic hook
    /// stays quiet; this is control flow, not a bug report.
    pub fn terminate(&self) -> ! {
        self.trip();
        panic::resume_unwind(Box::new(WorkerKilled));
    }

    /// Safe point: terminates the calling worker if the switch is tripped.
    ///
    /// Long-running workloads call this between steps to honor
    /// cancellation promptly.
    pub fn abort_if_tripped(&self) {
        if self.is_tripped() {
            self.terminate();
        }
    }

    /// Re-arms a tripped switch.
    ///
    /// Only meaningful at a run boundary, when a context is reused for a
    /// fresh run; within a run a trip is final.
    pub fn reset(&self) {
        self.tripped.store(false, SC);
    }
}

/// Everything a run knows about one worker.
pub struct WorkerContext {
    id: WorkerId,
    name: String,
    can_kill: bool,
    kill: KillSwitch,
    store: DashMap<String, Value>,
}

impl WorkerContext {
    pub fn new(id: WorkerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            can_kill: true,
            kill: KillSwitch::new(),
            store: DashMap::new(),
        }
    }

    /// Controls whether forced termination may be applied to this worker.
    ///
    /// When `false`, a barrier timeout still fails and deregisters the
    /// worker but leaves its kill switch alone.
    pub fn with_can_kill(mut self, can_kill: bool) -> Self {
        self.can_kill = can_kill;
        self
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn can_kill(&self) -> bool {
        self.can_kill
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill
    }

    /// Stores a value under `key`, replacing any previous one.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.store.insert(key.into(), value.into());
    }

    /// Returns a clone of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(key).map(|v| v.value().clone())
    }

    /// Removes and returns the value stored under `key`.
    pub fn take(&self, key: &str) -> Option<Value> {
        self.store.remove(key).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::AssertUnwindSafe;

    #[test]
    fn test_kill_switch_trips_once_set() {
        let ks = KillSwitch::new();
        assert!(!ks.is_tripped());
        ks.trip();
        assert!(ks.is_tripped());
        // Safe point on an untripped switch is a no-op.
        KillSwitch::new().abort_if_tripped();
    }

    #[test]
    fn test_terminate_unwinds_with_marker_payload() {
        let ks = KillSwitch::new();
        let result = panic::catch_unwind(AssertUnwindSafe(|| ks.terminate()));
        let payload = result.unwrap_err();
        assert!(payload.downcast_ref::<WorkerKilled>().is_some());
        assert!(ks.is_tripped());
    }

    #[test]
    fn test_abort_if_tripped_unwinds() {
        let ks = KillSwitch::new();
        ks.trip();
        let result = panic::catch_unwind(AssertUnwindSafe(|| ks.abort_if_tripped()));
        assert!(result
            .unwrap_err()
            .downcast_ref::<WorkerKilled>()
            .is_some());
    }

    #[test]
    fn test_context_store_round_trip() {
        let ctx = WorkerContext::new(WorkerId::new(2), "worker-2");
        assert_eq!(ctx.id().index(), 2);
        assert_eq!(ctx.name(), "worker-2");
        assert!(ctx.get("missing").is_none());

        ctx.put("cycles", 7);
        ctx.put("label", "alpha");
        assert_eq!(ctx.get("cycles"), Some(Value::from(7)));
        assert_eq!(ctx.get("label"), Some(Value::from("alpha")));
        assert_eq!(ctx.take("cycles"), Some(Value::from(7)));
        assert!(ctx.get("cycles").is_none());
    }

    #[test]
    fn test_can_kill_flag() {
        let ctx = WorkerContext::new(WorkerId::new(0), "w");
        assert!(ctx.can_kill());
        let ctx = WorkerContext::new(WorkerId::new(0), "w").with_can_kill(false);
        assert!(!ctx.can_kill());
    }
}
