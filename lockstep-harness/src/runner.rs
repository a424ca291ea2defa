//! Worker-run orchestration.
//!
//! A [`Harness`] owns everything one run needs (the worker contexts,
//! the shared failed-set and the dynamic barrier) and drives a
//! [`Workload`] through it: one named OS thread per worker, a fixed
//! ready gate once every thread is up, setup, a fixed start gate so no
//! worker begins work before all of them finished setup, the work itself
//! (with checkpoint calls inside), and cleanup, which always runs. Every
//! failure mode lands in the run summary as data: an `Err` from a
//! lifecycle hook, a termination unwind from a worker that was failed
//! out of the run, and plain panics are all caught on the worker's own
//! thread, accounted, and routed through the failed-set so the barrier
//! stops waiting for that worker. The runner itself observes each
//! worker's kill switch at phase boundaries, so an externally failed
//! worker terminates even if its workload never reaches a checkpoint.
//!
//! Serial runs execute the same lifecycle one worker at a time, each
//! against its own single-party barrier, so workloads with checkpoint
//! calls behave identically apart from concurrency.

use crate::config::RunConfig;
use crate::error::HarnessError;
use crate::report::{RunSummary, WorkerOutcome, WorkerReport};
use anyhow::Result;
use crossbeam::channel;
use lockstep::{
    install_current, Barrier, FailedSet, FixedBarrier, WorkerContext, WorkerId, WorkerKilled,
};
use log::{debug, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// One worker's unit of work plus its lifecycle hooks.
///
/// [`run`](Workload::run) is where the work lives and where checkpoint
/// calls (`lockstep::sync`) happen. [`setup`](Workload::setup) completes
/// on every worker before any worker enters `run`;
/// [`cleanup`](Workload::cleanup) is always attempted, whatever happened
/// before it.
pub trait Workload: Send + Sync + 'static {
    fn setup(&self, _ctx: &WorkerContext) -> Result<()> {
        Ok(())
    }

    fn run(&self, ctx: &WorkerContext) -> Result<()>;

    fn cleanup(&self, _ctx: &WorkerContext) -> Result<()> {
        Ok(())
    }
}

/// Plain closures work as workloads with default setup and cleanup.
impl<F> Workload for F
where
    F: Fn(&WorkerContext) -> Result<()> + Send + Sync + 'static,
{
    fn run(&self, ctx: &WorkerContext) -> Result<()> {
        self(ctx)
    }
}

/// Owns one run: contexts, failed-set, barrier, workload, config.
pub struct Harness<W: Workload> {
    config: RunConfig,
    workers: Vec<Arc<WorkerContext>>,
    failed: Arc<FailedSet>,
    barrier: Arc<Barrier>,
    workload: Arc<W>,
}

impl<W: Workload> Harness<W> {
    /// Builds a harness over caller-provided contexts.
    pub fn new(config: RunConfig, workers: Vec<Arc<WorkerContext>>, workload: W) -> Self {
        let failed = Arc::new(FailedSet::new());
        let barrier = Arc::new(Barrier::new(workers.clone(), Arc::clone(&failed)));
        Self {
            config,
            workers,
            failed,
            barrier,
            workload: Arc::new(workload),
        }
    }

    /// Builds a harness with one default context per name.
    pub fn from_names(config: RunConfig, names: &[&str], workload: W) -> Self {
        let workers = names
            .iter()
            .enumerate()
            .map(|(i, name)| Arc::new(WorkerContext::new(WorkerId::new(i), *name)))
            .collect();
        Self::new(config, workers, workload)
    }

    pub fn workers(&self) -> &[Arc<WorkerContext>] {
        &self.workers
    }

    pub fn failed(&self) -> &Arc<FailedSet> {
        &self.failed
    }

    pub fn barrier(&self) -> &Arc<Barrier> {
        &self.barrier
    }

    /// Fails `ctx` out of the run from outside its own thread: one
    /// failed-set entry, one barrier decrement, and a kill if the
    /// context allows it. Idempotent per worker.
    pub fn fail_worker(&self, ctx: &WorkerContext) {
        if self.failed.fail(ctx.id()) {
            warn!("worker {} failed out of the run", ctx.name());
            self.barrier.dec();
            if ctx.can_kill() {
                ctx.kill_switch().trip();
            }
        }
    }

    /// Rearms the barrier, failed-set and kill switches for a fresh run
    /// over the same contexts. Only valid between runs.
    pub fn refresh(&self) {
        self.barrier.refresh();
    }

    /// Executes the run and returns its summary.
    ///
    /// Serial execution is chosen by the config or forced through the
    /// `LOCKSTEP_SERIAL` environment variable. If a report path is
    /// configured, the summary is also written there.
    pub fn run(&self) -> Result<RunSummary, HarnessError> {
        let summary = if self.config.serialized() {
            self.run_serial()
        } else {
            self.run_parallel()?
        };
        if !summary.all_passed() {
            warn!(
                "run '{}': {} of {} workers passed; causes: {:?}",
                summary.run, summary.passed, summary.total, summary.causes
            );
        }
        if let Some(path) = &self.config.report_path {
            summary.write_json(path)?;
            info!("run report written to {}", path.display());
        }
        Ok(summary)
    }

    fn run_parallel(&self) -> Result<RunSummary, HarnessError> {
        let total = self.workers.len();
        info!(
            "starting parallel run '{}' with {} workers",
            self.config.name, total
        );
        if total == 0 {
            return Ok(RunSummary::collect(&self.config.name, Vec::new()));
        }

        // Fixed gates cannot shrink, so every worker must pass both on
        // every code path; run_worker arrives even after a failed setup.
        let ready_gate = Arc::new(FixedBarrier::new(total));
        let start_gate = Arc::new(FixedBarrier::new(total));
        let (report_tx, report_rx) = channel::unbounded::<(usize, WorkerReport)>();

        let mut handles = Vec::with_capacity(total);
        let mut spawn_failure = None;
        for (slot, ctx) in self.workers.iter().enumerate() {
            let ctx = Arc::clone(ctx);
            let workload = Arc::clone(&self.workload);
            let barrier = Arc::clone(&self.barrier);
            let failed = Arc::clone(&self.failed);
            let ready_gate = Arc::clone(&ready_gate);
            let start_gate = Arc::clone(&start_gate);
            let report_tx = report_tx.clone();
            let checkpoints = self.config.checkpoints;
            let worker_name = ctx.name().to_owned();
            let spawned = thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || {
                    let report = run_worker(
                        &ctx,
                        workload.as_ref(),
                        &barrier,
                        &failed,
                        Some((ready_gate.as_ref(), start_gate.as_ref())),
                        checkpoints,
                    );
                    let _ = report_tx.send((slot, report));
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    spawn_failure = Some(HarnessError::Spawn {
                        worker: worker_name,
                        source,
                    });
                    break;
                }
            }
        }
        if let Some(err) = spawn_failure {
            // The workers that did spawn are already parked at the ready
            // gate, which is sized for everyone. Cover for the workers
            // that never got a thread and fail them out of the run, then
            // let the spawned ones finish before surfacing the error.
            self.unblock_unspawned(&ready_gate, &start_gate, handles.len());
            for handle in handles {
                let _ = handle.join();
            }
            return Err(err);
        }
        drop(report_tx);

        let mut joined = 0;
        for handle in handles {
            match handle.join() {
                Ok(()) => joined += 1,
                Err(_) => warn!("a worker thread leaked a panic past its report"),
            }
        }
        debug!("joined {} of {} worker threads", joined, total);

        // Reports arrive in completion order; slot them back into
        // registry order for the summary.
        let mut slots: Vec<Option<WorkerReport>> = (0..total).map(|_| None).collect();
        while let Ok((slot, report)) = report_rx.try_recv() {
            slots[slot] = Some(report);
        }
        let reports = slots.into_iter().flatten().collect();
        Ok(RunSummary::collect(&self.config.name, reports))
    }

    /// Stands in at both pre-run gates for workers that never got a
    /// thread and fails them out of the run, so the workers that did
    /// spawn can finish instead of waiting at a gate sized for everyone.
    fn unblock_unspawned(
        &self,
        ready_gate: &FixedBarrier,
        start_gate: &FixedBarrier,
        spawned: usize,
    ) {
        for ctx in &self.workers[spawned..] {
            ready_gate.arrive_nowait();
            start_gate.arrive_nowait();
            self.fail_worker(ctx);
        }
    }

    fn run_serial(&self) -> RunSummary {
        info!(
            "starting serial run '{}' with {} workers",
            self.config.name,
            self.workers.len()
        );
        let mut reports = Vec::with_capacity(self.workers.len());
        for ctx in &self.workers {
            // A fresh single-party barrier per worker: checkpoint calls
            // release immediately with rank 0 instead of deadlocking on
            // workers that have not started yet.
            let solo_failed = Arc::new(FailedSet::new());
            let solo_barrier = Arc::new(Barrier::new(
                vec![Arc::clone(ctx)],
                Arc::clone(&solo_failed),
            ));
            reports.push(run_worker(
                ctx,
                self.workload.as_ref(),
                &solo_barrier,
                &solo_failed,
                None,
                self.config.checkpoints,
            ));
        }
        RunSummary::collect(&self.config.name, reports)
    }
}

/// The full lifecycle of one worker, on the worker's own thread.
fn run_worker<W: Workload>(
    ctx: &Arc<WorkerContext>,
    workload: &W,
    barrier: &Arc<Barrier>,
    failed: &FailedSet,
    gates: Option<(&FixedBarrier, &FixedBarrier)>,
    checkpoints: bool,
) -> WorkerReport {
    let started = Instant::now();
    let barrier_handle = if checkpoints {
        Some(Arc::clone(barrier))
    } else {
        None
    };
    let _guard = install_current(Arc::clone(ctx), barrier_handle);
    debug!("worker {} started", ctx.name());
    if let Some((ready_gate, _)) = gates {
        ready_gate.arrive();
    }

    let mut errors = Vec::new();
    let mut outcome = WorkerOutcome::Passed;

    // Setup and run observe the kill switch on entry and on exit, so a
    // worker failed from outside terminates at the phase boundary even
    // when its workload never touches a checkpoint. Cleanup is exempt:
    // a killed worker still gets its teardown.
    let setup_ok = match catch_phase(|| {
        ctx.kill_switch().abort_if_tripped();
        workload.setup(ctx)?;
        ctx.kill_switch().abort_if_tripped();
        Ok(())
    }) {
        Caught::Done => true,
        caught => {
            account(ctx, barrier, failed, "setup", caught, &mut outcome, &mut errors);
            false
        }
    };

    if let Some((_, start_gate)) = gates {
        start_gate.arrive();
    }

    if setup_ok {
        match catch_phase(|| {
            ctx.kill_switch().abort_if_tripped();
            workload.run(ctx)?;
            ctx.kill_switch().abort_if_tripped();
            Ok(())
        }) {
            Caught::Done => {}
            caught => account(ctx, barrier, failed, "run", caught, &mut outcome, &mut errors),
        }
    }

    // Cleanup always runs, including for killed and panicked workers.
    match catch_phase(|| workload.cleanup(ctx)) {
        Caught::Done => {}
        caught => account(ctx, barrier, failed, "cleanup", caught, &mut outcome, &mut errors),
    }

    debug!(
        "worker {} finished as {:?} in {:?}",
        ctx.name(),
        outcome,
        started.elapsed()
    );
    WorkerReport {
        worker: ctx.name().to_owned(),
        outcome,
        errors,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

enum Caught {
    Done,
    Err(anyhow::Error),
    Killed,
    Panicked(String),
}

/// Runs one lifecycle phase on the worker thread, absorbing unwinds.
fn catch_phase(f: impl FnOnce() -> Result<()>) -> Caught {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Caught::Done,
        Ok(Err(e)) => Caught::Err(e),
        Err(payload) => {
            if payload.downcast_ref::<WorkerKilled>().is_some() {
                Caught::Killed
            } else {
                Caught::Panicked(panic_message(payload.as_ref()))
            }
        }
    }
}

/// Folds a phase failure into the worker's outcome and routes it
/// through the failed-set so the barrier stops waiting for the worker.
///
/// The worker is reporting about itself here, so its kill switch is left
/// alone; a killed worker was already failed and decremented by whoever
/// killed it, which the insert-if-absent check absorbs.
fn account(
    ctx: &WorkerContext,
    barrier: &Barrier,
    failed: &FailedSet,
    phase: &str,
    caught: Caught,
    outcome: &mut WorkerOutcome,
    errors: &mut Vec<String>,
) {
    match caught {
        Caught::Done => return,
        Caught::Err(e) => {
            errors.push(format!("{} failed: {:#}", phase, e));
            if *outcome == WorkerOutcome::Passed {
                *outcome = WorkerOutcome::Failed;
            }
        }
        Caught::Killed => {
            debug!("worker {} terminated during {}", ctx.name(), phase);
            errors.push(format!("terminated during {}", phase));
            *outcome = WorkerOutcome::Killed;
        }
        Caught::Panicked(msg) => {
            warn!("worker {} panicked during {}: {}", ctx.name(), phase, msg);
            errors.push(format!("{} panicked: {}", phase, msg));
            if *outcome != WorkerOutcome::Killed {
                *outcome = WorkerOutcome::Panicked;
            }
        }
    }
    if failed.fail(ctx.id()) {
        barrier.dec();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_workers_is_an_empty_run() {
        let harness = Harness::from_names(RunConfig::new("empty"), &[], |_: &WorkerContext| {
            Ok::<(), anyhow::Error>(())
        });
        let summary = harness.run().unwrap();
        assert_eq!(summary.total, 0);
        assert!(summary.all_passed());
    }

    #[test]
    fn test_fail_worker_is_idempotent() {
        let harness =
            Harness::from_names(RunConfig::new("ext"), &["a", "b", "c"], |_: &WorkerContext| {
                Ok::<(), anyhow::Error>(())
            });
        let ctx = Arc::clone(&harness.workers()[1]);
        assert_eq!(harness.barrier().parties(), 3);
        harness.fail_worker(&ctx);
        harness.fail_worker(&ctx);
        assert_eq!(harness.barrier().parties(), 2);
        assert_eq!(harness.failed().len(), 1);
        assert!(ctx.kill_switch().is_tripped());
    }

    #[test]
    fn test_unspawned_workers_are_covered_and_failed() {
        let harness =
            Harness::from_names(RunConfig::new("cover"), &["a", "b", "c"], |_: &WorkerContext| {
                Ok::<(), anyhow::Error>(())
            });
        let ready_gate = Arc::new(FixedBarrier::new(3));
        let start_gate = Arc::new(FixedBarrier::new(3));
        // One worker thread made it up before spawning stopped; it heads
        // through both gates and into its first checkpoint.
        let ctx = Arc::clone(&harness.workers()[0]);
        let barrier = Arc::clone(harness.barrier());
        let rg = Arc::clone(&ready_gate);
        let sg = Arc::clone(&start_gate);
        let worker = thread::spawn(move || {
            rg.arrive();
            sg.arrive();
            barrier.sync(&ctx)
        });
        harness.unblock_unspawned(&ready_gate, &start_gate, 1);
        assert_eq!(worker.join().unwrap(), Some(0));
        assert_eq!(harness.barrier().parties(), 1);
        assert_eq!(harness.failed().len(), 2);
    }
}
