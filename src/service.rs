// Copyright 2020 Joyent, Inc.

//! Long-running background tasks with a cooperative stop flag.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct StopState {
    stopped: AtomicBool,
    notify: Notify,
}

/// Shared view of a service's stop request.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<StopState>);

impl StopFlag {
    pub fn is_stopped(&self) -> bool {
        self.0.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once `shutdown` has been requested. Bodies race their waits
    /// against this so a stop is seen without waiting out a sleep.
    pub async fn stopped(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    fn stop(&self) {
        self.0.stopped.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }
}

pub struct ServiceTask {
    name: &'static str,
    stop: StopFlag,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceTask {
    pub fn new(name: &'static str) -> ServiceTask {
        ServiceTask {
            name,
            stop: StopFlag::default(),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spawn the service body. Starting twice is a no-op.
    pub fn start<F, Fut>(&self, body: F) -> bool
    where
        F: FnOnce(StopFlag) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut handle = match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if handle.is_some() || self.stop.is_stopped() {
            return false;
        }
        *handle = Some(tokio::spawn(body(self.stop.clone())));
        true
    }

    pub fn shutdown(&self) {
        self.stop.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Wait for the body to return after `shutdown`.
    pub async fn join(&self) {
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn body_observes_shutdown() {
        let service = ServiceTask::new("ticker");
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        assert!(service.start(move |stop| async move {
            while !stop.is_stopped() {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }));
        assert!(!service.start(|_| async {}));

        tokio::time::sleep(Duration::from_millis(20)).await;
        service.shutdown();
        service.join().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen > 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn shutdown_interrupts_long_wait() {
        let service = ServiceTask::new("sleeper");
        assert!(service.start(|stop| async move {
            tokio::select! {
                _ = stop.stopped() => (),
                _ = tokio::time::sleep(Duration::from_secs(60)) => (),
            }
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;

        service.shutdown();
        let joined = tokio::time::timeout(Duration::from_secs(1), service.join()).await;
        assert!(joined.is_ok());
        assert!(service.is_stopped());
    }
}
