// Copyright 2020 Joyent, Inc.

//! Bookkeeping for requests awaiting a response.
//!
//! Every outbound synchronous or asynchronous request is represented by a
//! `ResponseFuture` held in the `ResponseTable` under the request's opaque
//! until one of three things resolves it: the matching response arrives,
//! the reaper expires it, or the transport reports the write failed.
//! Whichever path removes the record from the table owns its resolution.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use slog::{warn, Logger};
use tokio::sync::{oneshot, OwnedSemaphorePermit};

use crate::error::RemotingError;
use crate::protocol::RemotingCommand;

/// Completion handler for an asynchronous invocation. Called exactly once,
/// with `Err` whenever no response was received.
pub type InvokeCallback =
    Box<dyn FnOnce(Result<RemotingCommand, RemotingError>) + Send + 'static>;

/// Holds an admission permit and gives it back at most once.
#[derive(Debug)]
pub struct SemaphoreReleaseOnlyOnce {
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl SemaphoreReleaseOnlyOnce {
    pub fn new(permit: OwnedSemaphorePermit) -> SemaphoreReleaseOnlyOnce {
        SemaphoreReleaseOnlyOnce {
            permit: Mutex::new(Some(permit)),
        }
    }

    /// Returns true if this call released the permit.
    pub fn release(&self) -> bool {
        let permit = match self.permit.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        permit.is_some()
    }
}

fn take_slot<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn fill_slot<T>(slot: &Mutex<Option<T>>, value: T) {
    match slot.lock() {
        Ok(mut guard) => *guard = Some(value),
        Err(poisoned) => *poisoned.into_inner() = Some(value),
    }
}

pub struct ResponseFuture {
    opaque: i32,
    remote_addr: String,
    begin: Instant,
    timeout: Duration,
    callback: Mutex<Option<InvokeCallback>>,
    once: Option<SemaphoreReleaseOnlyOnce>,
    completion: Mutex<Option<oneshot::Sender<Option<RemotingCommand>>>>,
    send_request_ok: AtomicBool,
    cause: Mutex<Option<io::Error>>,
}

/// Receiving side of a `ResponseFuture`'s completion slot.
pub struct ResponseWaiter(oneshot::Receiver<Option<RemotingCommand>>);

impl ResponseWaiter {
    /// Wait up to `timeout` for the slot to be filled. `None` means the
    /// deadline passed or the request was resolved without a response.
    pub async fn wait_response(self, timeout: Duration) -> Option<RemotingCommand> {
        match tokio::time::timeout(timeout, self.0).await {
            Ok(Ok(response)) => response,
            _ => None,
        }
    }
}

impl ResponseFuture {
    pub fn new(
        opaque: i32,
        remote_addr: String,
        timeout: Duration,
        callback: Option<InvokeCallback>,
        once: Option<SemaphoreReleaseOnlyOnce>,
    ) -> (ResponseFuture, ResponseWaiter) {
        let (tx, rx) = oneshot::channel();
        let future = ResponseFuture {
            opaque,
            remote_addr,
            begin: Instant::now(),
            timeout,
            callback: Mutex::new(callback),
            once,
            completion: Mutex::new(Some(tx)),
            send_request_ok: AtomicBool::new(true),
            cause: Mutex::new(None),
        };
        (future, ResponseWaiter(rx))
    }

    pub fn opaque(&self) -> i32 {
        self.opaque
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn begin(&self) -> Instant {
        self.begin
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A record is expired once `begin + timeout + grace` has passed.
    pub fn is_expired(&self, grace: Duration, now: Instant) -> bool {
        self.begin + self.timeout + grace <= now
    }

    pub fn has_callback(&self) -> bool {
        match self.callback.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Run the callback if it has not run yet. A panicking callback is
    /// logged and otherwise ignored. Returns true if the callback ran.
    pub fn execute_invoke_callback(
        &self,
        outcome: Result<RemotingCommand, RemotingError>,
        log: &Logger,
    ) -> bool {
        let callback = match take_slot(&self.callback) {
            Some(callback) => callback,
            None => return false,
        };

        if panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
            warn!(log, "response callback panicked";
                "opaque" => self.opaque, "addr" => &self.remote_addr);
        }
        true
    }

    /// Fill the completion slot. Only the first call has any effect.
    pub fn put_response(&self, response: Option<RemotingCommand>) {
        if let Some(tx) = take_slot(&self.completion) {
            let _ = tx.send(response);
        }
    }

    /// Give back the admission permit, if this record holds one.
    pub fn release(&self) {
        if let Some(once) = &self.once {
            once.release();
        }
    }

    pub fn set_send_request_ok(&self, ok: bool) {
        self.send_request_ok.store(ok, Ordering::SeqCst);
    }

    pub fn is_send_request_ok(&self) -> bool {
        self.send_request_ok.load(Ordering::SeqCst)
    }

    pub fn set_cause(&self, cause: io::Error) {
        fill_slot(&self.cause, cause);
    }

    pub fn take_cause(&self) -> Option<io::Error> {
        take_slot(&self.cause)
    }
}

impl fmt::Display for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending request [opaque={}, addr={}, timeout={}ms, elapsed={}ms, sent={}]",
            self.opaque,
            self.remote_addr,
            self.timeout.as_millis(),
            self.begin.elapsed().as_millis(),
            self.is_send_request_ok()
        )
    }
}

/// Outstanding requests keyed by opaque.
#[derive(Clone, Default)]
pub struct ResponseTable(Arc<DashMap<i32, Arc<ResponseFuture>>>);

impl ResponseTable {
    pub fn new() -> ResponseTable {
        ResponseTable(Arc::new(DashMap::with_capacity(256)))
    }

    pub fn insert(&self, future: Arc<ResponseFuture>) -> Result<(), RemotingError> {
        match self.0.entry(future.opaque()) {
            Entry::Occupied(_) => Err(RemotingError::DuplicateRequest(future.opaque())),
            Entry::Vacant(slot) => {
                slot.insert(future);
                Ok(())
            }
        }
    }

    pub fn remove(&self, opaque: i32) -> Option<Arc<ResponseFuture>> {
        self.0.remove(&opaque).map(|(_, future)| future)
    }

    /// Remove `future` only if it is still the live record for its opaque.
    pub fn remove_record(&self, future: &Arc<ResponseFuture>) -> bool {
        self.0
            .remove_if(&future.opaque(), |_, live| Arc::ptr_eq(live, future))
            .is_some()
    }

    pub fn contains(&self, opaque: i32) -> bool {
        self.0.contains_key(&opaque)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Remove and return every record expired as of now.
    pub fn remove_expired(&self, grace: Duration) -> Vec<Arc<ResponseFuture>> {
        let now = Instant::now();
        // Shard locks are held while iterating, so collect before removing.
        let candidates: Vec<i32> = self
            .0
            .iter()
            .filter(|entry| entry.value().is_expired(grace, now))
            .map(|entry| *entry.key())
            .collect();

        candidates
            .into_iter()
            .filter_map(|opaque| {
                self.0
                    .remove_if(&opaque, |_, future| future.is_expired(grace, now))
                    .map(|(_, future)| future)
            })
            .collect()
    }
}
