//! Generation-counted rendezvous primitives.
//!
//! A [`Rendezvous`] is a re-armable meeting point for a known number of
//! parties. Arrivals accumulate within the current generation; the arrival
//! that completes the party count advances the generation and wakes every
//! waiter, after which the instance is immediately ready for the next
//! round. Waiting is decoupled from arriving so that callers can arrive
//! first and then wait with or without a deadline, and parties can be
//! deregistered permanently when they are known to be gone.
//!
//! [`FixedBarrier`] is the narrow fixed-size facade over the same
//! mechanism: parties arrive and block until the group is complete. It
//! is used where a group of threads must all reach a known point before
//! any proceeds and no failure handling is involved.

use parking_lot::{Condvar, Mutex};
use std::time::Instant;

struct PhaseState {
    /// Number of registered parties that must arrive to complete a phase.
    parties: usize,
    /// Arrivals recorded in the current generation.
    arrived: usize,
    /// Monotonically increasing phase number.
    generation: u64,
}

/// A reusable meeting point for `parties` participants.
///
/// All state sits behind one mutex; waiters sleep on a condvar and are
/// woken in bulk when the generation advances.
pub struct Rendezvous {
    state: Mutex<PhaseState>,
    cond: Condvar,
}

impl Rendezvous {
    /// Creates a rendezvous for `parties` participants.
    pub fn new(parties: usize) -> Self {
        Self {
            state: Mutex::new(PhaseState {
                parties,
                arrived: 0,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Records one arrival without waiting.
    ///
    /// # Returns
    ///
    /// * The generation this arrival counted toward. Pass it to
    ///   [`await_advance`](Self::await_advance) or
    ///   [`await_advance_until`](Self::await_advance_until) to wait for
    ///   the phase to complete.
    pub fn arrive(&self) -> u64 {
        let mut st = self.state.lock();
        let generation = st.generation;
        st.arrived += 1;
        if st.arrived >= st.parties {
            self.advance_locked(&mut st);
        }
        generation
    }

    /// Blocks until the given generation has been superseded.
    ///
    /// Returns immediately if the phase already advanced.
    pub fn await_advance(&self, generation: u64) {
        let mut st = self.state.lock();
        while st.generation == generation {
            self.cond.wait(&mut st);
        }
    }

    /// Blocks until the given generation has been superseded or the
    /// absolute `deadline` passes.
    ///
    /// The deadline is fixed: spurious wakeups go back to sleep against
    /// the same instant, so retries never stretch the wait beyond what
    /// the caller allowed. Advancement observed at the deadline still
    /// counts as advanced.
    ///
    /// # Returns
    ///
    /// * `true` if the phase advanced, `false` on deadline expiry with
    ///   the generation unmoved.
    pub fn await_advance_until(&self, generation: u64, deadline: Instant) -> bool {
        let mut st = self.state.lock();
        while st.generation == generation {
            if self.cond.wait_until(&mut st, deadline).timed_out() {
                return st.generation != generation;
            }
        }
        true
    }

    /// Arrives and blocks until the current phase completes.
    pub fn arrive_and_wait(&self) {
        let mut st = self.state.lock();
        let generation = st.generation;
        st.arrived += 1;
        if st.arrived >= st.parties {
            self.advance_locked(&mut st);
            return;
        }
        while st.generation == generation {
            self.cond.wait(&mut st);
        }
    }

    /// Permanently removes one party.
    ///
    /// If the removal leaves every remaining party already arrived, the
    /// phase advances and all waiters are released. This is how removing
    /// a party that will never show up unblocks the live ones.
    pub fn deregister(&self) {
        let mut st = self.state.lock();
        st.parties = st.parties.saturating_sub(1);
        if st.arrived >= st.parties {
            self.advance_locked(&mut st);
        }
    }

    /// Resets arrivals and sets the party count.
    ///
    /// Only valid while no party is arriving or waiting.
    pub fn reinit(&self, parties: usize) {
        let mut st = self.state.lock();
        st.parties = parties;
        st.arrived = 0;
    }

    /// Current registered party count.
    pub fn parties(&self) -> usize {
        self.state.lock().parties
    }

    /// Current generation number.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn advance_locked(&self, st: &mut PhaseState) {
        st.arrived = 0;
        st.generation = st.generation.wrapping_add(1);
        self.cond.notify_all();
    }
}

/// Fixed-size reusable barrier: `parties` threads call [`arrive`] and all
/// block until the last one shows up, then all release together and the
/// barrier re-arms for the next round. No timeout and no resizing.
///
/// [`arrive`]: FixedBarrier::arrive
pub struct FixedBarrier {
    inner: Rendezvous,
}

impl FixedBarrier {
    pub fn new(parties: usize) -> Self {
        debug_assert!(parties >= 1);
        Self {
            inner: Rendezvous::new(parties),
        }
    }

    /// Blocks until all parties have arrived at this phase.
    pub fn arrive(&self) {
        self.inner.arrive_and_wait();
    }

    /// Records an arrival without waiting for the phase to complete.
    ///
    /// For a coordinator standing in for a party that will never show
    /// up, so the parties that did arrive are not stuck forever.
    pub fn arrive_nowait(&self) {
        self.inner.arrive();
    }

    pub fn parties(&self) -> usize {
        self.inner.parties()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fixed_barrier_releases_all() {
        let bar = Arc::new(FixedBarrier::new(4));
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let bar = Arc::clone(&bar);
            let before = Arc::clone(&before);
            let after = Arc::clone(&after);
            handles.push(thread::spawn(move || {
                before.fetch_add(1, Ordering::SeqCst);
                bar.arrive();
                // Nobody passes until all four have arrived.
                assert_eq!(before.load(Ordering::SeqCst), 4);
                after.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(after.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_fixed_barrier_is_reusable() {
        let bar = Arc::new(FixedBarrier::new(3));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let bar = Arc::clone(&bar);
            handles.push(thread::spawn(move || {
                for _ in 0..5 {
                    bar.arrive();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_fixed_barrier_nowait_arrivals_cover_absent_parties() {
        let bar = Arc::new(FixedBarrier::new(3));
        let bar2 = Arc::clone(&bar);
        let waiter = thread::spawn(move || bar2.arrive());
        // Stand in for the two parties that will never arrive; neither
        // call may block, or the waiter hangs forever.
        bar.arrive_nowait();
        bar.arrive_nowait();
        waiter.join().unwrap();
    }

    #[test]
    fn test_arrive_then_await_advance() {
        let rv = Arc::new(Rendezvous::new(2));
        let rv2 = Arc::clone(&rv);
        let h = thread::spawn(move || {
            let gen = rv2.arrive();
            rv2.await_advance(gen);
        });
        thread::sleep(Duration::from_millis(20));
        rv.arrive();
        h.join().unwrap();
        assert_eq!(rv.generation(), 1);
    }

    #[test]
    fn test_await_advance_until_expires() {
        let rv = Rendezvous::new(2);
        let gen = rv.arrive();
        let deadline = Instant::now() + Duration::from_millis(30);
        assert!(!rv.await_advance_until(gen, deadline));
        // Second arrival completes the phase; the old generation is stale.
        rv.arrive();
        assert!(rv.await_advance_until(gen, Instant::now()));
    }

    #[test]
    fn test_deregister_releases_waiter() {
        let rv = Arc::new(Rendezvous::new(2));
        let rv2 = Arc::clone(&rv);
        let h = thread::spawn(move || {
            rv2.arrive_and_wait();
        });
        thread::sleep(Duration::from_millis(20));
        rv.deregister();
        h.join().unwrap();
        assert_eq!(rv.parties(), 1);
    }

    #[test]
    fn test_reinit_resets_arrivals() {
        let rv = Rendezvous::new(3);
        rv.arrive();
        rv.arrive();
        rv.reinit(2);
        assert_eq!(rv.parties(), 2);
        // A fresh pair of arrivals completes the phase.
        let gen = rv.arrive();
        rv.arrive();
        assert!(rv.await_advance_until(gen, Instant::now()));
    }
}
