// Copyright 2020 Joyent, Inc.

//! Connection lifecycle events.
//!
//! Transports report connect, idle, close and exception events without
//! blocking by pushing them onto a bounded queue. A single background
//! worker drains the queue in order and hands each event to the registered
//! listener. When the queue is full the newest event is dropped.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{info, warn, Logger};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::connection::Connection;
use crate::service::ServiceTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEventType {
    Connect,
    Close,
    Idle,
    Exception,
}

#[derive(Clone)]
pub struct ChannelEvent {
    pub event_type: ChannelEventType,
    pub remote_addr: String,
    pub connection: Arc<dyn Connection>,
}

impl ChannelEvent {
    pub fn new(
        event_type: ChannelEventType,
        remote_addr: String,
        connection: Arc<dyn Connection>,
    ) -> ChannelEvent {
        ChannelEvent {
            event_type,
            remote_addr,
            connection,
        }
    }
}

impl fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChannelEvent [type={:?}, remoteAddr={}]",
            self.event_type, self.remote_addr
        )
    }
}

pub trait ChannelEventListener: Send + Sync {
    fn on_channel_connect(&self, remote_addr: &str, conn: &Arc<dyn Connection>);
    fn on_channel_close(&self, remote_addr: &str, conn: &Arc<dyn Connection>);
    fn on_channel_exception(&self, remote_addr: &str, conn: &Arc<dyn Connection>);
    fn on_channel_idle(&self, remote_addr: &str, conn: &Arc<dyn Connection>);
}

pub struct EventExecutor {
    capacity: usize,
    poll_interval: Duration,
    tx: mpsc::Sender<ChannelEvent>,
    rx: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
    listener: Option<Arc<dyn ChannelEventListener>>,
    service: ServiceTask,
    log: Logger,
}

impl EventExecutor {
    pub fn new(capacity: usize, poll_interval: Duration, log: Logger) -> EventExecutor {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        EventExecutor {
            capacity,
            poll_interval,
            tx,
            rx: Mutex::new(Some(rx)),
            listener: None,
            service: ServiceTask::new("EventExecutor"),
            log,
        }
    }

    pub fn set_listener(&mut self, listener: Arc<dyn ChannelEventListener>) {
        self.listener = Some(listener);
    }

    pub fn listener(&self) -> Option<&Arc<dyn ChannelEventListener>> {
        self.listener.as_ref()
    }

    /// Queue an event without blocking. Returns false if it was dropped.
    pub fn put_event(&self, event: ChannelEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(self.log, "event queue full, dropping event";
                    "queued" => self.queued(), "event" => %event);
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(self.log, "event queue closed, dropping event"; "event" => %event);
                false
            }
        }
    }

    /// Events waiting to be delivered.
    pub fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn start(&self) -> bool {
        let rx = match self.rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let mut rx = match rx {
            Some(rx) => rx,
            None => return false,
        };

        let listener = self.listener.clone();
        let poll_interval = self.poll_interval;
        let log = self.log.clone();
        let name = self.service.name();

        self.service.start(move |stop| async move {
            info!(log, "service started"; "service" => name);
            while !stop.is_stopped() {
                let polled = tokio::select! {
                    _ = stop.stopped() => break,
                    polled = tokio::time::timeout(poll_interval, rx.recv()) => polled,
                };
                match polled {
                    Ok(Some(event)) => {
                        if let Some(listener) = &listener {
                            dispatch(listener.as_ref(), &event, &log);
                        }
                    }
                    Ok(None) => break,
                    Err(_elapsed) => (),
                }
            }
            info!(log, "service end"; "service" => name);
        })
    }

    pub fn shutdown(&self) {
        self.service.shutdown();
    }

    pub async fn join(&self) {
        self.service.join().await;
    }
}

fn dispatch(listener: &dyn ChannelEventListener, event: &ChannelEvent, log: &Logger) {
    let addr = event.remote_addr.as_str();
    let conn = &event.connection;
    let result = panic::catch_unwind(AssertUnwindSafe(|| match event.event_type {
        ChannelEventType::Idle => listener.on_channel_idle(addr, conn),
        ChannelEventType::Close => listener.on_channel_close(addr, conn),
        ChannelEventType::Connect => listener.on_channel_connect(addr, conn),
        ChannelEventType::Exception => listener.on_channel_exception(addr, conn),
    }));
    if result.is_err() {
        warn!(log, "channel event listener panicked"; "event" => %event);
    }
}
