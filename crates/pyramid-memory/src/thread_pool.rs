//! Bounded worker pool with ordered fan-in.
//!
//! Every builder in the crate pushes its model calls through [`TaskRunner`]:
//! N independent work items run on at most W named OS threads, results come
//! back in submission order, and the calling thread sees progress events and
//! commits results while the pool is still busy.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use crossbeam_queue::ArrayQueue;
use tracing::{debug, error};

pub const DEFAULT_WORKERS: usize = 10;

const THREAD_PREFIX: &str = "pyramid-worker";

/// Snapshot handed to progress callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskProgress {
    pub completed: usize,
    pub total: usize,
}

impl TaskProgress {
    pub fn is_done(&self) -> bool {
        self.completed == self.total
    }
}

#[derive(Debug, Clone)]
pub struct TaskRunner {
    workers: usize,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl TaskRunner {
    pub fn new(workers: usize) -> Self {
        Self { workers: workers.max(1) }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every item through `work` and return the results in input order.
    pub fn run<T, R, W, P>(&self, items: Vec<T>, work: W, progress: P) -> anyhow::Result<Vec<R>>
    where
        T: Send,
        R: Send,
        W: Fn(usize, T) -> anyhow::Result<R> + Sync,
        P: FnMut(TaskProgress),
    {
        self.run_committing(items, work, |_, _| Ok(()), progress)
    }

    /// Like [`run`](Self::run), but hands each result to `commit` on the
    /// calling thread as soon as it and every earlier item have completed.
    ///
    /// `commit` therefore sees indices 0, 1, 2, ... in order. The first
    /// failure (from `work` or from `commit`) stops new items from starting;
    /// items already running finish, nothing at or after the failed index is
    /// committed, and that first error is returned.
    pub fn run_committing<T, R, W, C, P>(
        &self,
        items: Vec<T>,
        work: W,
        mut commit: C,
        mut progress: P,
    ) -> anyhow::Result<Vec<R>>
    where
        T: Send,
        R: Send,
        W: Fn(usize, T) -> anyhow::Result<R> + Sync,
        C: FnMut(usize, &R) -> anyhow::Result<()>,
        P: FnMut(TaskProgress),
    {
        let total = items.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let queue = ArrayQueue::new(total);
        for (index, item) in items.into_iter().enumerate() {
            queue
                .push((index, item))
                .map_err(|_| anyhow::anyhow!("Task queue overflow at item {}", index))?;
        }

        let abort = AtomicBool::new(false);
        let worker_count = self.workers.min(total);
        debug!("Running {} tasks on {} workers", total, worker_count);

        let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(total).collect();
        let mut failure: Option<(usize, anyhow::Error)> = None;

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<(usize, anyhow::Result<R>)>();

            for worker in 0..worker_count {
                let tx = tx.clone();
                let queue = &queue;
                let abort = &abort;
                let work = &work;
                let spawned = thread::Builder::new()
                    .name(format!("{}-{}", THREAD_PREFIX, worker))
                    .spawn_scoped(scope, move || {
                        while !abort.load(Ordering::Acquire) {
                            let Some((index, item)) = queue.pop() else { break };
                            let result = work(index, item);
                            if tx.send((index, result)).is_err() {
                                break;
                            }
                        }
                    });
                if let Err(e) = spawned {
                    abort.store(true, Ordering::Release);
                    failure = Some((0, anyhow::anyhow!("Failed to spawn worker thread: {}", e)));
                    break;
                }
            }
            drop(tx);

            let mut completed = 0;
            let mut next_commit = 0;
            for (index, result) in rx {
                match result {
                    Ok(value) => {
                        slots[index] = Some(value);
                        if failure.is_none() {
                            completed += 1;
                            progress(TaskProgress { completed, total });
                        }
                    }
                    Err(e) => {
                        abort.store(true, Ordering::Release);
                        error!("Task {} of {} failed: {:#}", index + 1, total, e);
                        if failure.is_none() {
                            failure = Some((index, e.context(format!("task {} of {} failed", index + 1, total))));
                        }
                    }
                }

                let limit = failure.as_ref().map_or(total, |(failed, _)| *failed);
                while next_commit < limit {
                    let Some(value) = slots[next_commit].as_ref() else { break };
                    if let Err(e) = commit(next_commit, value) {
                        abort.store(true, Ordering::Release);
                        error!("Committing result {} of {} failed: {:#}", next_commit + 1, total, e);
                        // later results stay uncommitted; an earlier error still wins
                        failure = match failure.take() {
                            None => Some((next_commit, e)),
                            Some((failed, first)) => Some((failed.min(next_commit), first)),
                        };
                        break;
                    }
                    next_commit += 1;
                }
            }
        });

        if let Some((_, e)) = failure {
            return Err(e);
        }

        slots
            .into_iter()
            .collect::<Option<Vec<R>>>()
            .ok_or_else(|| anyhow::anyhow!("Worker pool finished with missing results"))
    }
}
