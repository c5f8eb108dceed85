// Copyright 2020 Joyent, Inc.

//! Worker pools for request processing and response callbacks.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use slog::{debug, error, o, Drain, Logger};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};

pub type Job = BoxFuture<'static, ()>;

/// A job the executor refused, handed back to the submitter.
pub struct Rejected(pub Job);

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rejected(..)")
    }
}

pub trait Executor: Send + Sync {
    /// Queue a job without waiting. Saturation is reported as `Rejected`.
    fn execute(&self, job: Job) -> Result<(), Rejected>;
}

/// Fixed number of workers draining a bounded queue.
///
/// Must be created from within a Tokio runtime.
pub struct BoundedExecutor {
    name: String,
    workers: usize,
    queue_capacity: usize,
    tx: mpsc::Sender<Job>,
}

impl BoundedExecutor {
    pub fn new(
        name: &str,
        workers: usize,
        queue_capacity: usize,
        log: Option<&Logger>,
    ) -> BoundedExecutor {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("executor" => String::from(name)));

        let (tx, rx) = mpsc::channel::<Job>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers {
            let rx = Arc::clone(&rx);
            let log = log.new(o!("worker" => worker));
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => {
                            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                                error!(log, "job panicked");
                            }
                        }
                        None => break,
                    }
                }
                debug!(log, "worker exiting");
            });
        }

        BoundedExecutor {
            name: String::from(name),
            workers,
            queue_capacity,
            tx,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue_capacity - self.tx.capacity()
    }
}

impl Executor for BoundedExecutor {
    fn execute(&self, job: Job) -> Result<(), Rejected> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => Err(Rejected(job)),
        }
    }
}

impl fmt::Display for BoundedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [workers={}, queued={}, capacity={}]",
            self.name,
            self.workers,
            self.queued(),
            self.queue_capacity
        )
    }
}
