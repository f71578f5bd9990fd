//! # Worker Pool
//!
//! Frame assembly (serialize, compress, send) runs off the tick thread
//! on a small pool fed by a bounded channel. Submission never blocks:
//! when the queue is full the frame is dropped and the tick moves on.

use crossbeam_channel::{bounded, Sender, TrySendError};
use std::thread::JoinHandle;

/// Queued frame-assembly jobs before submissions start failing.
const QUEUE_DEPTH: usize = 256;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads draining a bounded job queue.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers (at least one).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = bounded::<Job>(QUEUE_DEPTH);

        let handles = (0..threads.max(1))
            .map(|index| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("parallax-sync-{index}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();

        Self { tx: Some(tx), handles }
    }

    /// Submits a job without blocking.
    ///
    /// Returns false when the queue is full (or the pool is shutting
    /// down); the job is dropped in that case.
    pub fn try_post(&self, job: Job) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };

        match tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the channel ends the worker loops
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..32 {
            let counter = counter.clone();
            assert!(pool.try_post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })));
        }

        drop(pool); // joins workers
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_saturation_drops() {
        let pool = WorkerPool::new(1);
        let gate = Arc::new(std::sync::Barrier::new(2));

        // park the single worker
        let parked = gate.clone();
        assert!(pool.try_post(Box::new(move || {
            parked.wait();
        })));

        // fill the queue
        let mut accepted = 0;
        for _ in 0..QUEUE_DEPTH + 8 {
            if pool.try_post(Box::new(|| {})) {
                accepted += 1;
            }
        }
        assert!(accepted <= QUEUE_DEPTH);

        gate.wait();
    }
}
