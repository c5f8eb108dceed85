// Copyright 2020 Joyent, Inc.

//! Backpressure for asynchronous and one-way sends.
//!
//! Each style has its own counting semaphore. Tokio's semaphore queues
//! waiters in FIFO order, so a burst of new callers cannot starve one that
//! has been waiting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::RemotingError;

pub struct Admission {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
}

struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(count: &'a AtomicUsize) -> Waiting<'a> {
        count.fetch_add(1, Ordering::SeqCst);
        Waiting(count)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Admission {
    pub fn new(name: &'static str, permits: usize) -> Admission {
        Admission {
            name,
            semaphore: Arc::new(Semaphore::new(permits)),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Take a permit, waiting at most `timeout` for one.
    ///
    /// A zero timeout never waits: if nothing is free the caller gets
    /// `TooManyRequests` straight away.
    pub async fn acquire(
        &self,
        timeout: Duration,
        addr: &str,
    ) -> Result<OwnedSemaphorePermit, RemotingError> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(permit);
        }

        if timeout == Duration::from_millis(0) {
            return Err(RemotingError::TooManyRequests(format!(
                "no {} permit available",
                self.name
            )));
        }

        let acquired = {
            let _waiting = Waiting::enter(&self.waiting);
            tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await
        };

        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(RemotingError::TooManyRequests(format!(
                "{} semaphore closed",
                self.name
            ))),
            Err(_elapsed) => {
                let info = format!(
                    "timed out after {}ms waiting for {} permit (waiting: {}, available: {})",
                    timeout.as_millis(),
                    self.name,
                    self.queue_length(),
                    self.available_permits()
                );
                Err(RemotingError::Timeout {
                    addr: String::from(addr),
                    timeout,
                    info: Some(info),
                    source: None,
                })
            }
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Callers currently blocked waiting for a permit.
    pub fn queue_length(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}
