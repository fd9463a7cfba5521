//! Fan-out driver shared by every per-item stage.
//!
//! One task per input item, results forwarded in completion order, output
//! closed only after the input is exhausted and every task has finished.

use crate::context::RunContext;
use crate::data_model::{Item, StageReport};
use crate::error::{describe_join_error, record_failure, HashlineError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Drives `worker` over every item of `input`.
///
/// With `ctx.max_workers == None` a task is launched the moment an item
/// arrives. That keeps maximal parallelism but lets in-flight work grow
/// with the input; set `max_workers` to bound it with a semaphore.
///
/// The first worker failure cancels the run: no new workers start,
/// in-flight ones are joined, their results are dropped and the failure
/// is returned.
pub async fn fan_out<W, Fut>(
    stage_id: &'static str,
    mut input: Receiver<Item>,
    output: Sender<Item>,
    ctx: &RunContext,
    worker: W,
) -> Result<StageReport>
where
    W: Fn(Item) -> Fut,
    Fut: Future<Output = Result<Item>> + Send + 'static,
{
    if ctx.max_workers == Some(0) {
        return Err(HashlineError::Config(format!(
            "{}: max_workers must be at least 1",
            stage_id
        )));
    }

    let cancel = ctx.cancellation().clone();
    let limiter = ctx.max_workers.map(|n| Arc::new(Semaphore::new(n)));
    let emitted = Arc::new(AtomicU64::new(0));

    let mut workers: JoinSet<Result<()>> = JoinSet::new();
    let mut items_in = 0u64;
    let mut input_open = true;
    let mut failure: Option<HashlineError> = None;

    while (input_open && failure.is_none()) || !workers.is_empty() {
        tokio::select! {
            biased;
            _ = cancel.cancelled(), if failure.is_none() => {
                record_failure(&mut failure, HashlineError::Cancelled);
            }
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                let outcome = joined.unwrap_or_else(|e| {
                    Err(HashlineError::Worker(format!("{}: {}", stage_id, describe_join_error(e))))
                });
                if let Err(err) = outcome {
                    if !err.is_secondary() {
                        warn!(stage = stage_id, error = %err, "worker failed, cancelling run");
                    }
                    record_failure(&mut failure, err);
                    cancel.cancel();
                }
            }
            received = input.recv(), if input_open && failure.is_none() => {
                let Some(item) = received else {
                    input_open = false;
                    continue;
                };
                items_in += 1;

                let permit = match acquire(limiter.as_ref(), &cancel).await {
                    Ok(permit) => permit,
                    Err(err) => {
                        record_failure(&mut failure, err);
                        continue;
                    }
                };

                let task = worker(item);
                let output = output.clone();
                let emitted = Arc::clone(&emitted);
                let cancel = cancel.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    deliver(stage_id, task, output, emitted, cancel).await
                });
            }
            else => break,
        }
    }

    let items_out = emitted.load(Ordering::Relaxed);
    debug!(stage = stage_id, items_in, items_out, "fan-out drained");

    match failure {
        Some(err) => Err(err),
        None => Ok(StageReport::new(stage_id, items_in, items_out)),
    }
}

/// Runs one worker and forwards its result unless the run was cancelled
/// in the meantime.
async fn deliver<Fut>(
    stage_id: &'static str,
    task: Fut,
    output: Sender<Item>,
    emitted: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<()>
where
    Fut: Future<Output = Result<Item>>,
{
    let result = task.await?;
    if cancel.is_cancelled() {
        return Err(HashlineError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HashlineError::Cancelled),
        sent = output.send(result) => {
            sent.map_err(|_| HashlineError::Closed(stage_id.to_string()))?;
            emitted.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }
}

async fn acquire(
    limiter: Option<&Arc<Semaphore>>,
    cancel: &CancellationToken,
) -> Result<Option<OwnedSemaphorePermit>> {
    let Some(limiter) = limiter else {
        return Ok(None);
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HashlineError::Cancelled),
        permit = Arc::clone(limiter).acquire_owned() => permit
            .map(Some)
            .map_err(|_| HashlineError::Worker("worker limiter closed".to_string())),
    }
}
