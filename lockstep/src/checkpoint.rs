//! Thread-local checkpoint facade.
//!
//! The runner installs each worker's context (plus the run's barrier) on
//! the worker's own thread. Workload code then synchronizes with the
//! plain function calls [`sync`] and [`sync_timed`], without threading
//! any handle through its call graph, and can look its own context up with
//! [`current`]. On a thread with nothing installed the facade does
//! nothing and returns `None`.

use crate::barrier::Barrier;
use crate::context::WorkerContext;
use log::trace;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

thread_local! {
    static CURRENT: RefCell<Option<RunHandle>> = const { RefCell::new(None) };
}

#[derive(Clone)]
struct RunHandle {
    ctx: Arc<WorkerContext>,
    barrier: Option<Arc<Barrier>>,
}

/// Clears the thread's current-worker slot on drop, unwind included.
pub struct CurrentGuard {
    _priv: (),
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.borrow_mut().take());
    }
}

/// Installs `ctx` as the calling thread's current worker.
///
/// `barrier` is the run's barrier, or `None` when checkpoints are
/// disabled for this run (sync calls become no-ops). The returned guard
/// clears the slot when dropped; keep it alive for the worker's whole
/// lifetime so an unwinding worker leaves a clean thread behind.
pub fn install_current(ctx: Arc<WorkerContext>, barrier: Option<Arc<Barrier>>) -> CurrentGuard {
    CURRENT.with(|c| {
        *c.borrow_mut() = Some(RunHandle { ctx, barrier });
    });
    CurrentGuard { _priv: () }
}

/// The calling thread's worker context, if one is installed.
pub fn current() -> Option<Arc<WorkerContext>> {
    CURRENT.with(|c| c.borrow().as_ref().map(|h| Arc::clone(&h.ctx)))
}

/// Synchronizes the calling worker at the run's next checkpoint, waiting
/// until every live worker arrives.
///
/// # Returns
///
/// * `Some(rank)`: the worker's arrival rank within the cycle; rank 0
///   is commonly used to elect a leader for once-per-cycle work.
/// * `None`: the calling thread has no installed worker context, or
///   checkpoints are disabled for the run.
pub fn sync() -> Option<usize> {
    with_handle(|ctx, barrier| barrier.sync(ctx))
}

/// Timed variant of [`sync`]: workers absent once `timeout` expires are
/// failed out of the run and the survivors release without them.
pub fn sync_timed(timeout: Duration) -> Option<usize> {
    with_handle(|ctx, barrier| barrier.sync_timed(ctx, timeout))
}

/// Safe point for long-running workload code: terminates the calling
/// worker if it has been killed. A no-op off-run.
pub fn abort_if_killed() {
    if let Some(ctx) = current() {
        ctx.kill_switch().abort_if_tripped();
    }
}

fn with_handle(f: impl FnOnce(&WorkerContext, &Barrier) -> Option<usize>) -> Option<usize> {
    // Clone the handle out so the slot is not borrowed across the wait.
    let handle = CURRENT.with(|c| c.borrow().clone());
    match handle {
        Some(RunHandle {
            ctx,
            barrier: Some(barrier),
        }) => f(&ctx, &barrier),
        Some(RunHandle { ctx, barrier: None }) => {
            trace!("checkpoints disabled; sync is a no-op for {}", ctx.name());
            None
        }
        None => {
            trace!("sync called with no worker context installed");
            None
        }
    }
}
