//! Cycle scheduling.
//!
//! All cycles, whether fired by the timer or requested by hand, go through
//! one worker task fed by an mpsc queue. The worker runs one cycle at a
//! time. Requests that pile up while a cycle is running are answered
//! together by the next single cycle instead of each getting its own.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pipeline::{CycleOutcome, Pipeline};

/// Pending requests the queue holds before senders wait.
const QUEUE_CAPACITY: usize = 32;

/// Who asked for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The recurring timer
    Scheduled,
    /// An operator ("fetch now")
    Manual,
}

/// The worker task has exited and no longer accepts requests.
#[derive(Debug, Error)]
#[error("Cycle worker has stopped")]
pub struct WorkerStopped;

struct CycleRequest {
    trigger: Trigger,
    reply: oneshot::Sender<CycleOutcome>,
}

/// Cloneable sender side of the cycle queue.
#[derive(Clone)]
pub struct CycleHandle {
    tx: mpsc::Sender<CycleRequest>,
}

impl CycleHandle {
    /// Queue a cycle and wait for the outcome of the cycle that serves it.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerStopped`] if the worker task is gone.
    pub async fn request(&self, trigger: Trigger) -> Result<CycleOutcome, WorkerStopped> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(CycleRequest { trigger, reply })
            .await
            .map_err(|_| WorkerStopped)?;
        outcome.await.map_err(|_| WorkerStopped)
    }
}

/// Start the cycle worker for `pipeline`.
///
/// The worker runs until every [`CycleHandle`] has been dropped.
pub fn spawn_worker(pipeline: Pipeline) -> (CycleHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let task = tokio::spawn(run_worker(pipeline, rx));
    (CycleHandle { tx }, task)
}

async fn run_worker(pipeline: Pipeline, mut rx: mpsc::Receiver<CycleRequest>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        let trigger = if batch.iter().any(|r| r.trigger == Trigger::Manual) {
            Trigger::Manual
        } else {
            Trigger::Scheduled
        };
        if batch.len() > 1 {
            tracing::info!(
                requests = batch.len(),
                "Coalescing queued cycle requests into one cycle"
            );
        }
        tracing::info!(trigger = ?trigger, "Running fetch cycle");

        let outcome = match catch_task_panic(pipeline.run()).await {
            Ok(outcome) => outcome,
            Err(panic_msg) => {
                tracing::error!(task = "fetch cycle", error = %panic_msg, "Fetch cycle panicked");
                CycleOutcome::Failed {
                    reason: format!("cycle panicked: {}", panic_msg),
                }
            }
        };

        for request in batch {
            // Requester may have given up waiting; nothing to do then
            let _ = request.reply.send(outcome.clone());
        }
    }

    tracing::debug!("All cycle handles dropped, worker exiting");
}

/// Wraps a future to catch panics and convert them to errors, so one bad
/// cycle cannot kill the worker.
async fn catch_task_panic<F, T>(future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|panic| {
            if let Some(s) = panic.downcast_ref::<&'static str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            }
        })
}

/// Request a scheduled cycle right away and then once every `period`.
///
/// Each request waits for its cycle to finish before the next tick is
/// considered; a slow cycle delays the schedule rather than stacking up
/// requests. Failed cycles are already logged by the pipeline and do not
/// stop the loop. Returns only once the worker has stopped.
pub async fn run_scheduler(handle: CycleHandle, period: Duration) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match handle.request(Trigger::Scheduled).await {
            Ok(outcome) => {
                tracing::debug!(success = outcome.is_success(), "Scheduled cycle finished");
            }
            Err(WorkerStopped) => {
                tracing::info!("Cycle worker stopped, scheduler exiting");
                return;
            }
        }
    }
}
