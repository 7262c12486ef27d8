//! Bounded-concurrency primitives
//!
//! [`WorkerQueue`] is the write scheduler: submissions are FIFO and at most
//! `max_concurrency` workers drain them, so a queue of concurrency 1 yields
//! strict per-connection write serialization. [`Dispatcher`] is the inbound
//! fan-out: a semaphore of `golimit` permits bounds how many handler
//! callbacks run at once, and an exhausted semaphore suspends the read loop,
//! which is the backpressure path back to the transport.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct QueueState {
    pending: VecDeque<Job>,
    max_concurrency: usize,
    cur_concurrency: usize,
}

/// FIFO job queue executed by a bounded pool of workers
#[derive(Clone)]
pub(crate) struct WorkerQueue {
    state: Arc<Mutex<QueueState>>,
}

impl WorkerQueue {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                pending: VecDeque::new(),
                max_concurrency: max_concurrency.max(1),
                cur_concurrency: 0,
            })),
        }
    }

    /// Append a job; spawns a worker unless the pool is already at capacity.
    /// Workers drain from the front and exit once the queue is empty.
    pub fn push<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let spawn_worker = {
            let mut state = self.state.lock();
            state.pending.push_back(Box::pin(job));
            if state.cur_concurrency < state.max_concurrency {
                state.cur_concurrency += 1;
                true
            } else {
                false
            }
        };

        if spawn_worker {
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut state = state.lock();
                        match state.pending.pop_front() {
                            Some(job) => job,
                            None => {
                                state.cur_concurrency -= 1;
                                return;
                            }
                        }
                    };
                    job.await;
                }
            });
        }
    }
}

/// Bounded dispatch channel for inbound messages
pub(crate) struct Dispatcher {
    parallel: bool,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(parallel: bool, golimit: usize) -> Self {
        Self {
            parallel,
            permits: Arc::new(Semaphore::new(golimit.max(1))),
        }
    }

    /// Run a handler callback. Serial mode awaits it inline, preserving
    /// receive order; parallel mode takes a permit (suspending the caller
    /// when the channel is full) and runs it on its own task.
    pub async fn dispatch<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.parallel {
            task.await;
            return;
        }
        match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => {
                tokio::spawn(async move {
                    task.await;
                    drop(permit);
                });
            }
            // the semaphore is never closed; run inline if it somehow is
            Err(_) => task.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_queue_runs_everything() {
        let queue = WorkerQueue::new(8);
        let sum = Arc::new(AtomicI64::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 1..=1000i64 {
            let sum = Arc::clone(&sum);
            let tx = tx.clone();
            queue.push(async move {
                tokio::time::sleep(Duration::from_micros(50)).await;
                sum.fetch_add(i, Ordering::Relaxed);
                let _ = tx.send(());
            });
        }
        for _ in 0..1000 {
            rx.recv().await.unwrap();
        }
        assert_eq!(sum.load(Ordering::Relaxed), 500500);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_queue_respects_concurrency_bound() {
        const LIMIT: usize = 8;
        let queue = WorkerQueue::new(LIMIT);
        let running = Arc::new(AtomicI64::new(0));
        let peak = Arc::new(AtomicI64::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for _ in 0..200 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            queue.push(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(());
            });
        }
        for _ in 0..200 {
            rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= LIMIT as i64);
    }

    #[tokio::test]
    async fn test_single_worker_preserves_submission_order() {
        let queue = WorkerQueue::new(1);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 0..100u32 {
            let tx = tx.clone();
            queue.push(async move {
                let _ = tx.send(i);
            });
        }
        for expect in 0..100u32 {
            assert_eq!(rx.recv().await, Some(expect));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dispatcher_parallel_bound() {
        const LIMIT: usize = 8;
        let dispatcher = Dispatcher::new(true, LIMIT);
        let running = Arc::new(AtomicI64::new(0));
        let peak = Arc::new(AtomicI64::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for _ in 0..200 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            dispatcher
                .dispatch(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(());
                })
                .await;
        }
        for _ in 0..200 {
            rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= LIMIT as i64);
    }

    #[tokio::test]
    async fn test_dispatcher_serial_runs_inline() {
        let dispatcher = Dispatcher::new(false, 8);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 0..50u32 {
            let tx = tx.clone();
            dispatcher
                .dispatch(async move {
                    let _ = tx.send(i);
                })
                .await;
        }
        for expect in 0..50u32 {
            assert_eq!(rx.recv().await, Some(expect));
        }
    }
}
