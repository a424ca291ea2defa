//! Dynamic barrier synchronization for fixed sets of worker threads.
//!
//! A run starts with N workers, one OS thread each, that repeatedly meet
//! at checkpoints. The [`Barrier`] releases a checkpoint only when every
//! live worker has arrived. On a timed checkpoint, workers that never
//! show are failed out of the run: recorded in the shared
//! [`FailedSet`], permanently removed from the party count, and
//! terminated through their [`KillSwitch`]. The survivors keep running at
//! the reduced size. Each released worker gets its arrival rank for the
//! cycle, so rank 0 can act as the cycle's leader.
//!
//! Workload code normally never holds the barrier: a runner installs the
//! worker's context on its thread and the free functions [`sync`] /
//! [`sync_timed`] find it from there.
//!
//! ```
//! use lockstep::{Barrier, FailedSet, WorkerContext, WorkerId};
//! use std::sync::Arc;
//!
//! let workers: Vec<Arc<WorkerContext>> = (0..2)
//!     .map(|i| Arc::new(WorkerContext::new(WorkerId::new(i), format!("w{}", i))))
//!     .collect();
//! let barrier = Arc::new(Barrier::new(workers.clone(), Arc::new(FailedSet::new())));
//!
//! let b = Arc::clone(&barrier);
//! let w = Arc::clone(&workers[1]);
//! let peer = std::thread::spawn(move || b.sync(&w).unwrap());
//!
//! let mine = barrier.sync(&workers[0]).unwrap();
//! let theirs = peer.join().unwrap();
//! assert_ne!(mine, theirs);
//! ```

pub mod barrier;
pub mod checkpoint;
pub mod context;
pub mod failset;
pub mod rendezvous;

pub use barrier::Barrier;
pub use checkpoint::{abort_if_killed, current, install_current, sync, sync_timed, CurrentGuard};
pub use context::{KillSwitch, WorkerContext, WorkerId, WorkerKilled};
pub use failset::FailedSet;
pub use rendezvous::{FixedBarrier, Rendezvous};
