//! Bounded worker pools for asset loading and export
//!
//! Each orchestrator owns its pool; nothing here touches rayon's global pool.

use crate::types::{GrimpError, GrimpResult};
use rayon::prelude::*;

/// A fixed-size pool whose results come back in submission order
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("workers", &self.workers).finish()
    }
}

impl WorkerPool {
    pub fn new(workers: usize) -> GrimpResult<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("grimp-worker-{}", i))
            .build()
            .map_err(|e| GrimpError::Scheduler(format!("Failed to build worker pool: {}", e)))?;
        log::debug!("Created worker pool with {} threads", workers);
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `op` inside the pool, so nested parallel work is bounded by it too
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(op)
    }

    /// Run every task and return each outcome at its submission index.
    ///
    /// A failing task does not stop its siblings.
    pub fn map_ordered<T, R, F>(&self, tasks: Vec<T>, f: F) -> Vec<GrimpResult<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> GrimpResult<R> + Sync + Send,
    {
        self.pool.install(|| tasks.into_par_iter().map(|task| f(task)).collect())
    }

    /// Like [`map_ordered`](Self::map_ordered), but all-or-nothing: the first
    /// failure in submission order is returned once every task has finished.
    pub fn run_all<T, R, F>(&self, tasks: Vec<T>, f: F) -> GrimpResult<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> GrimpResult<R> + Sync + Send,
    {
        let total = tasks.len();
        let outcomes = self.map_ordered(tasks, f);
        let failed = outcomes.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            log::error!("{} of {} tasks failed, discarding partial results", failed, total);
        }
        outcomes.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_results_in_submission_order() {
        let pool = WorkerPool::new(4).unwrap();
        // earlier tasks sleep longer, so they finish last
        let tasks: Vec<u64> = (0..8).collect();
        let results = pool
            .run_all(tasks, |i| {
                std::thread::sleep(Duration::from_millis((8 - i) * 10));
                Ok(i * 2)
            })
            .unwrap();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_failure_aborts_but_siblings_finish() {
        let pool = WorkerPool::new(2).unwrap();
        let finished = AtomicUsize::new(0);
        let result = pool.run_all((0..6).collect::<Vec<usize>>(), |i| {
            finished.fetch_add(1, Ordering::SeqCst);
            if i == 1 || i == 4 {
                Err(GrimpError::Processing(format!("task {} failed", i)))
            } else {
                Ok(i)
            }
        });
        match result {
            Err(GrimpError::Processing(msg)) => assert_eq!(msg, "task 1 failed"),
            other => panic!("unexpected: {:?}", other.map(|v| v.len())),
        }
        assert_eq!(finished.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_zero_workers_clamped() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.workers(), 1);
        assert_eq!(pool.install(|| rayon::current_num_threads()), 1);
    }
}
