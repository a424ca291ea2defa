//! Runs a [`Workload`] across a pool of synchronized workers.
//!
//! The harness spawns one named thread per worker, walks each through
//! setup, run and cleanup, and collects a [`RunSummary`] describing how
//! every worker ended. During `run`, workers pace each other through the
//! shared dynamic barrier behind the `lockstep` checkpoint facade; a
//! worker that errors, panics or gets failed out of the run stops
//! counting toward the barrier so the others keep going.
//!
//! ```
//! use lockstep_harness::{Harness, RunConfig};
//! use lockstep::WorkerContext;
//!
//! let harness = Harness::from_names(
//!     RunConfig::new("demo"),
//!     &["alpha", "beta"],
//!     |_ctx: &WorkerContext| -> anyhow::Result<()> {
//!         lockstep::sync();
//!         Ok(())
//!     },
//! );
//! let summary = harness.run().unwrap();
//! assert!(summary.all_passed());
//! ```

pub mod config;
pub mod error;
pub mod report;
pub mod runner;

pub use config::{RunConfig, SERIAL_ENV};
pub use error::HarnessError;
pub use report::{RunSummary, WorkerOutcome, WorkerReport};
pub use runner::{Harness, Workload};
