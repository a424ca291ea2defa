//! Dynamic barrier for a fixed set of workers that may shrink mid-run.
//!
//! # Core Responsibilities
//!
//! - Gather every live worker at a checkpoint and release them together,
//!   handing each its arrival rank within the cycle
//! - On a timed checkpoint, give up on workers that never showed, record
//!   them in the run-wide failed-set, permanently remove their parties and
//!   trip their kill switches, then release the survivors
//! - Keep cycles strictly separated: no worker starts the next checkpoint
//!   cycle while a straggler is still leaving the current one
//!
//! # Cycle Anatomy
//!
//! A cycle runs over two rendezvous phases. The *primary* phase collects
//! arrivals: each caller registers its identity, arrives, and waits for
//! the phase to complete. Once it does, callers draw ranks in release
//! order; the caller that draws the final rank (the *last releaser*) does
//! the cycle-reset bookkeeping. The *secondary* phase then drains the
//! cycle: nobody returns until every live worker has reached it, which is
//! what stops a fast worker from lapping a slow one back into the same
//! barrier. The first worker out of the drain re-zeroes the rank counter,
//! completing the handoff to the next cycle.
//!
//! # Timeout and Failure
//!
//! A timed sync computes one absolute deadline on entry. If the primary
//! phase has not completed by then, the first caller to observe the
//! expiry (decided under the cycle lock) sweeps the registry: every
//! worker that never arrived is failed exactly once, with one failed-set
//! insert, one party removed from both phases, and a kill switch trip if
//! the context allows. Removing the absent parties is itself what completes the
//! primary phase, so the survivors release with correct ranks and the
//! barrier is one party smaller from then on. Workers failed outside a
//! barrier wait are reported through the same failed-set plus [`Barrier::dec`],
//! which releases any cycle currently waiting on them.
//!
//! # Locking
//!
//! One mutex guards the per-cycle state (arrived set, counters, timeout
//! flag). Registration re-checks the failed-set under that mutex, and the
//! timeout sweep runs under it, so a worker racing the sweep either lands
//! in the arrived set (and the phase waits for it) or observes itself
//! failed and terminates; an arrival can never be counted for a party
//! the sweep already removed. The rendezvous phases have their own locks
//! and are only ever taken after the cycle lock, never the other way
//! around.

use crate::context::{WorkerContext, WorkerId};
use crate::failset::FailedSet;
use crate::rendezvous::Rendezvous;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CycleState {
    /// Identities that entered the current cycle. Emptied by the last
    /// releaser; frozen from the moment the primary phase advances until
    /// then.
    arrived: HashSet<WorkerId>,
    /// Next rank to hand out after the primary phase.
    primary_order: usize,
    /// Exit indices handed out after the secondary drain.
    secondary_order: usize,
    /// Countdown over the releasers of the current cycle. The first
    /// releaser seeds it from the frozen arrived count; whoever takes it
    /// to zero is the last releaser.
    pending_release: usize,
    /// Set once per timed-out cycle by the first observer of the expiry.
    timed_out: bool,
}

/// Reusable all-or-survivors barrier over a run's worker registry.
pub struct Barrier {
    workers: Vec<Arc<WorkerContext>>,
    failed: Arc<FailedSet>,
    primary: Rendezvous,
    secondary: Rendezvous,
    state: Mutex<CycleState>,
}

impl Barrier {
    /// Builds a barrier expecting one party per registry worker.
    pub fn new(workers: Vec<Arc<WorkerContext>>, failed: Arc<FailedSet>) -> Self {
        let parties = workers.len();
        Self {
            workers,
            failed,
            primary: Rendezvous::new(parties),
            secondary: Rendezvous::new(parties),
            state: Mutex::new(CycleState {
                arrived: HashSet::with_capacity(parties),
                primary_order: 0,
                secondary_order: 0,
                pending_release: 0,
                timed_out: false,
            }),
        }
    }

    /// Synchronizes `ctx` with every other live worker, waiting as long
    /// as it takes.
    ///
    /// # Returns
    ///
    /// * `Some(rank)`: this worker's arrival rank within the cycle,
    ///   in `[0, live_parties)`. Rank 0 is commonly used to elect a
    ///   leader for once-per-cycle work.
    pub fn sync(&self, ctx: &WorkerContext) -> Option<usize> {
        self.sync_inner(ctx, None)
    }

    /// Synchronizes `ctx`, but after `timeout` gives up on workers that
    /// have not arrived: they are failed, deregistered and (if allowed)
    /// killed, and the survivors release without them.
    ///
    /// A zero timeout is the no-wait fast path: the call returns `None`
    /// immediately and the cycle is untouched. A timeout too large for
    /// the clock to represent waits like [`Barrier::sync`] instead.
    pub fn sync_timed(&self, ctx: &WorkerContext, timeout: Duration) -> Option<usize> {
        self.sync_inner(ctx, Some(timeout))
    }

    fn sync_inner(&self, ctx: &WorkerContext, timeout: Option<Duration>) -> Option<usize> {
        if self.failed.contains(ctx.id()) {
            debug!(
                "worker {} is already failed; terminating it at checkpoint entry",
                ctx.name()
            );
            ctx.kill_switch().terminate();
        }
        if timeout.is_some_and(|t| t.is_zero()) {
            return None;
        }

        {
            let mut st = self.state.lock();
            // Re-check under the cycle lock: either the sweep already
            // failed us, or our registration is visible to it.
            if self.failed.contains(ctx.id()) {
                drop(st);
                ctx.kill_switch().terminate();
            }
            debug_assert!(self.workers.iter().any(|w| w.id() == ctx.id()));
            st.arrived.insert(ctx.id());
        }
        trace!("worker {} arrived at checkpoint", ctx.name());

        let generation = self.primary.arrive();
        match timeout {
            None => self.primary.await_advance(generation),
            Some(timeout) => match Instant::now().checked_add(timeout) {
                // A deadline the clock cannot represent degenerates to an
                // untimed wait; other timed callers can still sweep the cycle.
                None => self.primary.await_advance(generation),
                Some(deadline) => {
                    if !self.primary.await_advance_until(generation, deadline) {
                        let mut st = self.state.lock();
                        if !st.timed_out {
                            st.timed_out = true;
                            warn!(
                                "checkpoint timed out after {:?}; sweeping absent workers",
                                timeout
                            );
                            self.sweep_absent(&mut st);
                        }
                        // Proceed as released either way: the sweep removed
                        // every absent party, so the phase is complete.
                    }
                }
            },
        }

        let (rank, last) = {
            let mut st = self.state.lock();
            if st.pending_release == 0 {
                // First releaser of the cycle seeds the countdown from
                // the arrived count, frozen since the phase advanced.
                st.pending_release = st.arrived.len();
            }
            let rank = st.primary_order;
            st.primary_order += 1;
            st.pending_release -= 1;
            (rank, st.pending_release == 0)
        };
        debug!("worker {} released with rank {}", ctx.name(), rank);

        if last {
            let mut st = self.state.lock();
            st.secondary_order = 0;
            // One more sweep so a cycle that raced its own timeout still
            // ends with every absent worker accounted for. A no-op when
            // everyone arrived.
            self.sweep_absent(&mut st);
            st.timed_out = false;
            st.arrived.clear();
        }

        self.secondary.arrive_and_wait();

        {
            let mut st = self.state.lock();
            let exit = st.secondary_order;
            st.secondary_order += 1;
            if exit == 0 {
                st.primary_order = 0;
            }
        }

        Some(rank)
    }

    /// Fails every registry worker absent from the current cycle.
    ///
    /// The failed-set insert decides the winner per worker, so repeated
    /// sweeps (timeout observer plus last releaser) never double-count:
    /// one insert, one party removed from each phase, at most one kill.
    fn sweep_absent(&self, st: &mut CycleState) {
        for worker in &self.workers {
            if st.arrived.contains(&worker.id()) {
                continue;
            }
            if !self.failed.fail(worker.id()) {
                continue;
            }
            warn!("worker {} missed the checkpoint; failing it", worker.name());
            self.dec();
            if worker.can_kill() {
                worker.kill_switch().trip();
            } else {
                debug!("worker {} is not killable; leaving it running", worker.name());
            }
        }
    }

    /// Permanently removes one party from both phases.
    ///
    /// Called for a worker that will never arrive again, either by the
    /// timeout sweep or externally when a worker fails outside a barrier
    /// wait, so that no cycle keeps waiting for it. If that worker was
    /// the only one missing, the current cycle releases immediately.
    pub fn dec(&self) {
        self.primary.deregister();
        self.secondary.deregister();
    }

    /// Rearms the barrier at the current (possibly reduced) party count,
    /// clearing all cycle bookkeeping. Indistinguishable afterwards from
    /// a freshly built barrier over the surviving workers.
    ///
    /// Only valid while no worker is inside a sync call.
    pub fn reset(&self) {
        let parties = self.primary.parties();
        let mut st = self.state.lock();
        self.primary.reinit(parties);
        self.secondary.reinit(parties);
        Self::clear_cycle(&mut st);
    }

    /// Rearms the barrier at the full registry size, forgetting all
    /// failure bookkeeping and re-arming every worker's kill switch.
    ///
    /// Within a run party counts only shrink; this is for reusing the
    /// barrier and its contexts across independent runs. Only valid while
    /// no worker is inside a sync call.
    pub fn refresh(&self) {
        let mut st = self.state.lock();
        self.primary.reinit(self.workers.len());
        self.secondary.reinit(self.workers.len());
        self.failed.clear();
        for worker in &self.workers {
            worker.kill_switch().reset();
        }
        Self::clear_cycle(&mut st);
    }

    /// Live party count.
    pub fn parties(&self) -> usize {
        self.primary.parties()
    }

    fn clear_cycle(st: &mut CycleState) {
        st.arrived.clear();
        st.primary_order = 0;
        st.secondary_order = 0;
        st.pending_release = 0;
        st.timed_out = false;
    }
}
