//! Bounded parallel task execution with ordered output
//!
//! `do_tasks` runs `n` independent tasks on at most `max_number_of_workers`
//! workers. Tasks are sharded statically, each worker runs its shard
//! sequentially, and the coordinator multiplexes worker output onto one sink
//! so that concurrent tasks never interleave their lines.
//!
//! # Output modes
//!
//! | State | Buffered worker completes | Live worker completes |
//! |-------|---------------------------|-----------------------|
//! | Buffering | flush now | n/a |
//! | LiveActive | hold | on its last task flush held, go to LiveCompleted |
//! | LiveCompleted | flush now | n/a |

mod output;

pub use output::{CapturedOutput, OutputSink, TaskOutput};

use crate::error::{StevedoreError, StevedoreResult};
use output::lock_buffer;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Options for [`do_tasks`]
#[derive(Debug, Clone, Default)]
pub struct DoTasksOptions {
    /// Upper bound on concurrent workers, 0 means one worker per task
    pub max_number_of_workers: usize,
    /// Stream the first worker's output immediately instead of buffering it
    pub is_live_output_on: bool,
}

/// Number of workers used for `number_of_tasks` tasks
pub fn number_of_workers(number_of_tasks: usize, max_number_of_workers: usize) -> usize {
    if max_number_of_workers == 0 || max_number_of_workers > number_of_tasks {
        number_of_tasks
    } else {
        max_number_of_workers
    }
}

/// Balanced round-robin shard sizes, loads differ by at most one task
pub fn shard_sizes(number_of_tasks: usize, number_of_workers: usize) -> Vec<usize> {
    if number_of_workers == 0 {
        return Vec::new();
    }
    let base = number_of_tasks / number_of_workers;
    let rest = number_of_tasks % number_of_workers;
    (0..number_of_workers)
        .map(|worker| base + usize::from(worker < rest))
        .collect()
}

/// Global index of the `worker_task`-th task of `worker`
pub fn calculate_task_id(
    number_of_tasks: usize,
    number_of_workers: usize,
    worker: usize,
    worker_task: usize,
) -> usize {
    let rest = number_of_tasks % number_of_workers;
    worker * (number_of_tasks / number_of_workers) + worker_task + worker.min(rest)
}

struct Completion {
    worker: usize,
    task_id: usize,
    output: Vec<u8>,
}

struct Failure {
    worker: usize,
    task_id: usize,
    output: Vec<u8>,
    error: StevedoreError,
}

enum OutputState {
    /// Every worker buffers, chunks are flushed on completion
    Buffering,
    /// The live worker is still running, completed chunks wait in `held`
    LiveActive { held: Vec<Vec<u8>> },
    /// The live worker has finished all of its tasks
    LiveCompleted,
}

/// Run `number_of_tasks` tasks in parallel.
///
/// Returns the error of the first failing task. After a failure no worker
/// starts a new task, but tasks already running are not interrupted.
pub async fn do_tasks<F, Fut>(
    number_of_tasks: usize,
    options: DoTasksOptions,
    sink: OutputSink,
    task_fn: F,
) -> StevedoreResult<()>
where
    F: Fn(TaskOutput, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StevedoreResult<()>> + Send + 'static,
{
    if number_of_tasks == 0 {
        return Ok(());
    }

    let workers = number_of_workers(number_of_tasks, options.max_number_of_workers);
    let shards = shard_sizes(number_of_tasks, workers);
    let is_live = options.is_live_output_on;
    debug!(
        "Running {} tasks on {} workers (live output: {})",
        number_of_tasks, workers, is_live
    );

    let task_fn = Arc::new(task_fn);
    let (done_tx, mut done_rx) = mpsc::channel::<Completion>(workers);
    let (err_tx, mut err_rx) = mpsc::channel::<Failure>(workers);
    let (quit_tx, quit_rx) = watch::channel(false);
    let live_muted = Arc::new(AtomicBool::new(false));

    let mut buffers: Vec<Option<Arc<Mutex<Vec<u8>>>>> = Vec::with_capacity(workers);

    for (worker, shard) in shards.iter().copied().enumerate() {
        let output = if is_live && worker == 0 {
            buffers.push(None);
            TaskOutput::live(sink.clone(), live_muted.clone())
        } else {
            let buffer = Arc::new(Mutex::new(Vec::new()));
            buffers.push(Some(buffer.clone()));
            TaskOutput::buffered(buffer)
        };

        let worker_ctx = WorkerContext {
            worker,
            shard,
            number_of_tasks,
            number_of_workers: workers,
            output,
            done_tx: done_tx.clone(),
            err_tx: err_tx.clone(),
            quit_rx: quit_rx.clone(),
        };
        tokio::spawn(run_worker(worker_ctx, task_fn.clone()));
    }
    drop(done_tx);
    drop(err_tx);

    let mut state = if is_live {
        OutputState::LiveActive { held: Vec::new() }
    } else {
        OutputState::Buffering
    };
    let mut live_remaining = shards[0];
    let mut completed = vec![false; number_of_tasks];
    let mut completed_count = 0;

    loop {
        tokio::select! {
            Some(done) = done_rx.recv() => {
                if completed[done.task_id] {
                    warn!("Task {} reported completion twice, ignoring", done.task_id);
                    continue;
                }
                completed[done.task_id] = true;
                completed_count += 1;

                state = match state {
                    OutputState::Buffering => {
                        sink.write_chunk(&done.output);
                        OutputState::Buffering
                    }
                    OutputState::LiveActive { mut held } => {
                        if done.worker == 0 {
                            live_remaining -= 1;
                            if live_remaining == 0 {
                                for chunk in held.drain(..) {
                                    sink.write_chunk(&chunk);
                                }
                                OutputState::LiveCompleted
                            } else {
                                OutputState::LiveActive { held }
                            }
                        } else {
                            held.push(done.output);
                            OutputState::LiveActive { held }
                        }
                    }
                    OutputState::LiveCompleted => {
                        sink.write_chunk(&done.output);
                        OutputState::LiveCompleted
                    }
                };

                if completed_count == number_of_tasks {
                    return Ok(());
                }
            }
            Some(failed) = err_rx.recv() => {
                let _ = quit_tx.send(true);
                debug!("Task {} of worker {} failed, stopping dispatch", failed.task_id, failed.worker);

                if is_live && failed.worker == 0 {
                    return Err(failed.error);
                }

                // Workers hand over output with their buffer locked, so once
                // every buffer is held here each chunk is either queued or
                // still buffered.
                let mut pending: Vec<_> = buffers
                    .iter()
                    .enumerate()
                    .filter(|(worker, _)| *worker != failed.worker)
                    .filter_map(|(_, buffer)| buffer.as_deref())
                    .map(|buffer| lock_buffer(buffer))
                    .collect();

                if let OutputState::LiveActive { held } = state {
                    live_muted.store(true, Ordering::SeqCst);
                    for chunk in held {
                        sink.write_chunk(&chunk);
                    }
                }
                while let Ok(done) = done_rx.try_recv() {
                    sink.write_chunk(&done.output);
                }
                while let Ok(other) = err_rx.try_recv() {
                    sink.write_chunk(&other.output);
                }
                for buffer in pending.iter_mut() {
                    sink.write_chunk(&std::mem::take(&mut **buffer));
                }
                sink.write_chunk(&failed.output);

                return Err(failed.error);
            }
            else => {
                return Err(StevedoreError::Internal(format!(
                    "workers exited after {} of {} tasks completed",
                    completed_count, number_of_tasks
                )));
            }
        }
    }
}

struct WorkerContext {
    worker: usize,
    shard: usize,
    number_of_tasks: usize,
    number_of_workers: usize,
    output: TaskOutput,
    done_tx: mpsc::Sender<Completion>,
    err_tx: mpsc::Sender<Failure>,
    quit_rx: watch::Receiver<bool>,
}

async fn run_worker<F, Fut>(mut ctx: WorkerContext, task_fn: Arc<F>)
where
    F: Fn(TaskOutput, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StevedoreResult<()>> + Send + 'static,
{
    for worker_task in 0..ctx.shard {
        if *ctx.quit_rx.borrow() {
            return;
        }

        let task_id = calculate_task_id(
            ctx.number_of_tasks,
            ctx.number_of_workers,
            ctx.worker,
            worker_task,
        );
        let result = task_fn(ctx.output.clone(), task_id).await;

        match result {
            Ok(()) => {
                let permit = tokio::select! {
                    permit = ctx.done_tx.reserve() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = ctx.quit_rx.changed() => return,
                };
                ctx.output.hand_over(|output| {
                    permit.send(Completion {
                        worker: ctx.worker,
                        task_id,
                        output,
                    })
                });
            }
            Err(error) => {
                let permit = tokio::select! {
                    permit = ctx.err_tx.reserve() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = ctx.quit_rx.changed() => return,
                };
                ctx.output.hand_over(|output| {
                    permit.send(Failure {
                        worker: ctx.worker,
                        task_id,
                        output,
                        error,
                    })
                });
                return;
            }
        }
    }
}
