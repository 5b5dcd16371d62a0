//! Bounded worker-pool backend.
//!
//! Owns a tokio runtime whose blocking pool is capped at the configured
//! worker count. Tile tasks run as blocking jobs (their I/O may stall the
//! worker, never the scheduler); results travel back over an unbounded
//! channel consumed by the blocking [`TaskStream`] iterator.
//!
//! Cancellation is cooperative: a cancelled submission prevents tasks that
//! have not started from ever starting, while tasks already on a worker run
//! to completion and have their late results discarded by the consumer.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Executor, TaskStream};
use crate::task::{PreprocessingCache, PreprocessingTask, TaskError, TaskResult, TileTask};

/// Executor dispatching tasks to a bounded pool of worker threads.
pub struct WorkerPoolExecutor {
    runtime: Runtime,
    workers: usize,
}

impl WorkerPoolExecutor {
    /// Starts a pool with `workers` concurrent task slots.
    pub fn new(workers: usize) -> Result<Self, TaskError> {
        if workers == 0 {
            return Err(TaskError::configuration("worker count must be at least 1"));
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("tilecascade-worker")
            .enable_time()
            .build()
            .map_err(|err| {
                TaskError::transport("failed to start worker pool").with_source(err)
            })?;
        Ok(Self { runtime, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Executor for WorkerPoolExecutor {
    fn name(&self) -> &str {
        "worker-pool"
    }

    fn preprocess(
        &self,
        tasks: Vec<PreprocessingTask>,
        cache: &Arc<PreprocessingCache>,
    ) -> Result<(), TaskError> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut handles = Vec::new();
        for task in tasks {
            let key = task.key().to_string();
            if cache.contains(&key) || !seen.insert(key.clone()) {
                debug!(key, "preprocessing result already cached or queued");
                continue;
            }
            keys.push(key);
            handles.push(self.runtime.spawn_blocking(move || task.run()));
        }

        // Block until every preprocessing task finished, then surface the
        // first failure.
        let joined = self.runtime.block_on(join_all(handles));
        for (key, joined) in keys.into_iter().zip(joined) {
            match joined {
                Ok(Ok(value)) => cache.insert(key, value),
                Ok(Err(err)) => return Err(err),
                Err(join_err) => {
                    return Err(TaskError::transport(format!(
                        "preprocessing worker for '{key}' died"
                    ))
                    .with_source(join_err));
                }
            }
        }
        Ok(())
    }

    fn submit_all(&self, tasks: Vec<TileTask>) -> TaskStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancellation = CancellationToken::new();

        for task in tasks {
            let tx = tx.clone();
            let token = cancellation.clone();
            let tile = task.tile().clone();
            self.runtime.spawn(async move {
                // The cancellation check lives inside the blocking job: a
                // task only counts as started once a worker picks it up, so
                // everything still queued at cancel time is skipped.
                let worker_token = token.clone();
                let worker_tile = tile.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    if worker_token.is_cancelled() {
                        debug!(tile = %worker_tile, "task cancelled before start");
                        return None;
                    }
                    Some(task.run())
                })
                .await;

                let result = match outcome {
                    Ok(Some(result)) => result,
                    Ok(None) => return,
                    // The worker vanished without producing a result: an
                    // infrastructure failure, not a computation failure.
                    Err(join_err) => TaskResult::failed(
                        tile,
                        TaskError::transport("worker failed to return a result")
                            .with_source(join_err),
                    ),
                };
                let _ = tx.send(result);
            });
        }

        TaskStream::channel(rx, cancellation)
    }
}
