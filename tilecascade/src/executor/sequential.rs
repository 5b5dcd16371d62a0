//! In-process sequential backend.
//!
//! Runs every task on the consuming thread, lazily, as results are pulled
//! from the stream. Useful for single-tile runs, debugging and tests where
//! deterministic ordering matters.

use std::sync::Arc;

use tracing::debug;

use super::{Executor, TaskStream};
use crate::task::{PreprocessingCache, PreprocessingTask, TaskError, TileTask};

/// Executor running everything inline on the scheduler thread.
pub struct SequentialExecutor;

impl SequentialExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SequentialExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for SequentialExecutor {
    fn name(&self) -> &str {
        "sequential"
    }

    fn preprocess(
        &self,
        tasks: Vec<PreprocessingTask>,
        cache: &Arc<PreprocessingCache>,
    ) -> Result<(), TaskError> {
        for task in tasks {
            if cache.contains(task.key()) {
                debug!(key = task.key(), "preprocessing result already cached");
                continue;
            }
            let key = task.key().to_string();
            let value = task.run()?;
            cache.insert(key, value);
        }
        Ok(())
    }

    fn submit_all(&self, tasks: Vec<TileTask>) -> TaskStream {
        TaskStream::inline(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::*;
    use crate::task::TaskOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_all_tasks_complete() {
        let executor = SequentialExecutor::new();
        let output = Arc::new(crate::io::MemoryOutput::new());
        let tasks = make_tasks(
            zoom_tiles(2, 6),
            output.clone(),
            Arc::new(CountingProcessor::new()),
        );

        let results: Vec<_> = executor.submit_all(tasks).collect();
        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.outcome() == TaskOutcome::Written));
        assert_eq!(output.write_count(), 6);
    }

    #[test]
    fn test_cancel_after_failure_stops_pending_tasks() {
        let executor = SequentialExecutor::new();
        let output = Arc::new(crate::io::MemoryOutput::new());
        let tiles = zoom_tiles(3, 10);
        let processor = Arc::new(CountingProcessor::failing_on(&tiles[2]));
        let tasks = make_tasks(tiles, output, processor.clone());

        let mut stream = executor.submit_all(tasks);
        let mut failed_tile = None;
        while let Some(result) = stream.next() {
            if result.is_failed() {
                failed_tile = Some(result.tile().clone());
                stream.cancel();
            }
        }

        assert!(failed_tile.is_some());
        // Tasks 1-3 ran, tasks 4-10 never started.
        assert_eq!(processor.started.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_preprocessing_memoized_per_key() {
        let executor = SequentialExecutor::new();
        let cache = Arc::new(PreprocessingCache::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let runs = runs.clone();
                PreprocessingTask::new::<u64, _>("shared", move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
            })
            .collect();

        executor.preprocess(tasks, &cache).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get::<u64>("shared").as_deref(), Some(&7));
    }

    #[test]
    fn test_preprocessing_error_propagates() {
        let executor = SequentialExecutor::new();
        let cache = Arc::new(PreprocessingCache::new());

        let tasks = vec![PreprocessingTask::new::<u64, _>("bad", || {
            Err(TaskError::computation("nope"))
        })];

        assert!(executor.preprocess(tasks, &cache).is_err());
        assert!(cache.is_empty());
    }
}
