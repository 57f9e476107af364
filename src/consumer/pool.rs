//! One OS thread per consumer instance.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError};
use tracing::{error, info, warn};

use super::{EmbeddingConsumer, UpsertConsumer, WorkerStats};
use crate::embedder::EmbeddingService;
use crate::error::PipelineError;
use crate::index::VectorIndex;
use crate::shutdown::Shutdown;

/// A consumer loop that runs until shutdown.
pub trait Worker: Send + 'static {
    /// Runs the loop; returns only on shutdown or a fatal error.
    fn run(&mut self) -> Result<WorkerStats, PipelineError>;
}

impl<S: EmbeddingService + 'static> Worker for EmbeddingConsumer<S> {
    fn run(&mut self) -> Result<WorkerStats, PipelineError> {
        EmbeddingConsumer::run(self)
    }
}

impl<I: VectorIndex + 'static> Worker for UpsertConsumer<I> {
    fn run(&mut self) -> Result<WorkerStats, PipelineError> {
        UpsertConsumer::run(self)
    }
}

const DONE_POLL: Duration = Duration::from_millis(50);

/// Runs every worker on its own thread until all have stopped.
///
/// The first worker to fail or panic triggers `shutdown` for the others; its
/// error is returned once everyone has stopped. Workers still busy `grace`
/// after shutdown (usually blocked in a downstream call) are abandoned: their
/// batch was never acked and is redelivered after a restart.
pub fn run_pool<W: Worker>(
    workers: Vec<W>,
    shutdown: &Shutdown,
    grace: Duration,
) -> anyhow::Result<WorkerStats> {
    let (done_tx, done_rx) = unbounded();
    let mut handles = Vec::with_capacity(workers.len());
    for (slot, mut worker) in workers.into_iter().enumerate() {
        let done_tx = done_tx.clone();
        handles.push(thread::spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| worker.run()));
            let _ = done_tx.send((slot, result.ok()));
        }));
    }
    drop(done_tx);

    let mut total = WorkerStats::default();
    let mut failure: Option<anyhow::Error> = None;
    let mut stopped = vec![false; handles.len()];
    let mut running = handles.len();
    let mut deadline: Option<Instant> = None;
    while running > 0 {
        if shutdown.is_triggered() {
            deadline.get_or_insert_with(|| Instant::now() + grace);
        }
        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                (deadline - now).min(DONE_POLL)
            }
            None => DONE_POLL,
        };
        let (slot, result) = match done_rx.recv_timeout(wait) {
            Ok(done) => done,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        stopped[slot] = true;
        running -= 1;
        match result {
            Some(Ok(stats)) => {
                info!(worker = slot, ?stats, "worker stopped");
                total.merge(&stats);
            }
            Some(Err(err)) => {
                error!(worker = slot, error = %err, class = ?err.class(), "worker failed");
                shutdown.trigger();
                failure.get_or_insert_with(|| err.into());
            }
            None => {
                error!(worker = slot, "worker panicked");
                shutdown.trigger();
                failure.get_or_insert_with(|| anyhow::anyhow!("worker {slot} panicked"));
            }
        }
    }
    if running > 0 {
        warn!(
            workers = running,
            grace_ms = grace.as_millis() as u64,
            "workers still busy after the shutdown grace period, abandoning their batches"
        );
    }
    for (handle, stopped) in handles.into_iter().zip(stopped) {
        if stopped {
            let _ = handle.join();
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(total),
    }
}
