// Copyright 2020 Joyent, Inc.

//! The correlation engine shared by both ends of a connection.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use slog::{debug, info, o, warn, Drain, Logger};

use crate::admission::Admission;
use crate::config::RemotingConfig;
use crate::connection::Connection;
use crate::error::RemotingError;
use crate::event::{ChannelEvent, ChannelEventListener, EventExecutor};
use crate::executor::{BoundedExecutor, Executor, Rejected};
use crate::processor::{ProcessorTable, RequestProcessor, RpcHook};
use crate::protocol::{RemotingCommand, RemotingCommandType};
use crate::response::{ResponseFuture, ResponseTable};
use crate::service::ServiceTask;

/// Owns every piece of shared state for one remoting endpoint: the
/// response table, admission permits, processor table, event queue and
/// the background reaper.
///
/// Registration methods take `&mut self`; once the core is wrapped in an
/// `Arc` the processor table is read-only.
pub struct RemotingCore {
    pub(crate) config: RemotingConfig,
    pub(crate) log: Logger,
    pub(crate) response_table: ResponseTable,
    pub(crate) admission_async: Admission,
    pub(crate) admission_oneway: Admission,
    pub(crate) processor_table: ProcessorTable,
    pub(crate) rpc_hook: Option<Arc<dyn RpcHook>>,
    pub(crate) callback_executor: Option<Arc<dyn Executor>>,
    event_executor: EventExecutor,
    reaper: ServiceTask,
}

impl RemotingCore {
    /// Build a core from `config`.
    ///
    /// When `config.callback_executor_threads` is non-zero and a Tokio
    /// runtime is available, response callbacks run on a dedicated
    /// executor; otherwise they run inline.
    pub fn new(config: RemotingConfig, log: Option<&Logger>) -> RemotingCore {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let callback_executor: Option<Arc<dyn Executor>> =
            if config.callback_executor_threads == 0 {
                None
            } else if tokio::runtime::Handle::try_current().is_ok() {
                Some(Arc::new(BoundedExecutor::new(
                    "RemotingCallbackExecutor",
                    config.callback_executor_threads,
                    config.callback_queue_capacity,
                    Some(&log),
                )))
            } else {
                warn!(log, "no runtime available, callbacks will run inline");
                None
            };

        let event_executor = EventExecutor::new(
            config.event_queue_capacity,
            config.event_poll_interval(),
            log.new(o!("component" => "EventExecutor")),
        );

        RemotingCore {
            response_table: ResponseTable::new(),
            admission_async: Admission::new("async", config.permits_async),
            admission_oneway: Admission::new("oneway", config.permits_oneway),
            processor_table: ProcessorTable::new(),
            rpc_hook: None,
            callback_executor,
            event_executor,
            reaper: ServiceTask::new("ResponseTableReaper"),
            config,
            log,
        }
    }

    pub fn register_processor(
        &mut self,
        code: i32,
        processor: Arc<dyn RequestProcessor>,
        executor: Arc<dyn Executor>,
    ) {
        self.processor_table.register(code, processor, executor);
    }

    pub fn register_default_processor(
        &mut self,
        processor: Arc<dyn RequestProcessor>,
        executor: Arc<dyn Executor>,
    ) {
        self.processor_table.register_default(processor, executor);
    }

    pub fn set_rpc_hook(&mut self, hook: Arc<dyn RpcHook>) {
        self.rpc_hook = Some(hook);
    }

    pub fn set_channel_event_listener(&mut self, listener: Arc<dyn ChannelEventListener>) {
        self.event_executor.set_listener(listener);
    }

    /// Replace the callback executor; `None` runs callbacks inline.
    pub fn set_callback_executor(&mut self, executor: Option<Arc<dyn Executor>>) {
        self.callback_executor = executor;
    }

    pub fn config(&self) -> &RemotingConfig {
        &self.config
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn channel_event_listener(&self) -> Option<&Arc<dyn ChannelEventListener>> {
        self.event_executor.listener()
    }

    /// Requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.response_table.len()
    }

    pub fn is_pending(&self, opaque: i32) -> bool {
        self.response_table.contains(opaque)
    }

    pub fn available_async_permits(&self) -> usize {
        self.admission_async.available_permits()
    }

    pub fn available_oneway_permits(&self) -> usize {
        self.admission_oneway.available_permits()
    }

    /// Start the event worker and the periodic response table reaper.
    pub fn start(&self) {
        self.event_executor.start();

        let table = self.response_table.clone();
        let grace = self.config.reaper_grace();
        let initial_delay = self.config.reaper_initial_delay();
        let interval = self.config.reaper_interval();
        let log = self.log.new(o!("component" => self.reaper.name()));

        self.reaper.start(move |stop| async move {
            info!(log, "service started");
            tokio::select! {
                _ = stop.stopped() => (),
                _ = tokio::time::sleep(initial_delay) => {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        tokio::select! {
                            _ = stop.stopped() => break,
                            _ = ticker.tick() => {
                                scan(&table, grace, &log);
                            }
                        }
                    }
                }
            }
            info!(log, "service end");
        });
    }

    /// Ask the background tasks to stop. Pending waits are interrupted.
    pub fn shutdown(&self) {
        self.reaper.shutdown();
        self.event_executor.shutdown();
    }

    /// Wait for the background tasks to exit after `shutdown`.
    pub async fn join(&self) {
        self.reaper.join().await;
        self.event_executor.join().await;
    }

    pub fn put_event(&self, event: ChannelEvent) -> bool {
        self.event_executor.put_event(event)
    }

    /// Route an inbound command by type.
    pub async fn process_message_received(
        &self,
        conn: &Arc<dyn Connection>,
        cmd: RemotingCommand,
    ) {
        match cmd.command_type() {
            RemotingCommandType::Request => self.process_request_command(conn, cmd),
            RemotingCommandType::Response => self.process_response_command(conn, cmd).await,
        }
    }

    /// Complete the request `cmd` answers. Unmatched responses are logged
    /// and dropped.
    pub async fn process_response_command(
        &self,
        conn: &Arc<dyn Connection>,
        cmd: RemotingCommand,
    ) {
        let future = match self.response_table.remove(cmd.opaque) {
            Some(future) => future,
            None => {
                warn!(self.log, "response matches no pending request, dropping it";
                    "addr" => conn.remote_addr(), "cmd" => %cmd);
                return;
            }
        };

        future.release();

        if !future.has_callback() {
            future.put_response(Some(cmd));
            return;
        }

        let log = self.log.clone();
        let job = async move {
            future.execute_invoke_callback(Ok(cmd), &log);
        }
        .boxed();

        let job = match &self.callback_executor {
            Some(executor) => match executor.execute(job) {
                Ok(()) => return,
                Err(Rejected(job)) => {
                    warn!(self.log, "callback executor rejected job, running callback inline");
                    job
                }
            },
            None => job,
        };
        job.await;
    }

    /// Expire every request older than its timeout plus the grace period,
    /// completing each with a timeout. Returns how many were expired.
    pub fn scan_response_table(&self) -> usize {
        scan(&self.response_table, self.config.reaper_grace(), &self.log)
    }
}

fn scan(table: &ResponseTable, grace: Duration, log: &Logger) -> usize {
    let expired = table.remove_expired(grace);
    for future in &expired {
        expire(future, log);
    }
    if !expired.is_empty() {
        debug!(log, "scanned response table"; "expired" => expired.len());
    }
    expired.len()
}

fn expire(future: &Arc<ResponseFuture>, log: &Logger) {
    let timeout = RemotingError::Timeout {
        addr: String::from(future.remote_addr()),
        timeout: future.timeout(),
        info: None,
        source: None,
    };
    future.execute_invoke_callback(Err(timeout), log);
    future.release();
    future.put_response(None);
    warn!(log, "request timed out"; "response_future" => %future);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use slog::Discard;

    use crate::response::SemaphoreReleaseOnlyOnce;

    fn core(config: RemotingConfig) -> RemotingCore {
        RemotingCore::new(config, Some(&Logger::root(Discard, o!())))
    }

    async fn record(
        core: &RemotingCore,
        opaque: i32,
        timeout: Duration,
        outcomes: &Arc<Mutex<Vec<bool>>>,
    ) -> Arc<ResponseFuture> {
        let permit = core
            .admission_async
            .acquire(Duration::from_millis(0), "peer")
            .await
            .unwrap();
        let outcomes = outcomes.clone();
        let (future, _waiter) = ResponseFuture::new(
            opaque,
            String::from("peer"),
            timeout,
            Some(Box::new(move |outcome: Result<RemotingCommand, RemotingError>| {
                outcomes.lock().unwrap().push(outcome.is_ok())
            })),
            Some(SemaphoreReleaseOnlyOnce::new(permit)),
        );
        let future = Arc::new(future);
        core.response_table.insert(future.clone()).unwrap();
        future
    }

    #[tokio::test]
    async fn reaper_expires_and_releases() {
        let core = core(
            RemotingConfig::new()
                .with_permits_async(2)
                .with_reaper_grace_ms(0)
                .with_callback_executor_threads(0),
        );
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        record(&core, 1, Duration::from_millis(0), &outcomes).await;
        record(&core, 2, Duration::from_secs(60), &outcomes).await;
        assert_eq!(core.available_async_permits(), 0);

        assert_eq!(core.scan_response_table(), 1);
        assert_eq!(*outcomes.lock().unwrap(), vec![false]);
        assert_eq!(core.available_async_permits(), 1);
        assert!(!core.is_pending(1));
        assert!(core.is_pending(2));

        assert_eq!(core.scan_response_table(), 0);
        assert_eq!(core.available_async_permits(), 1);
    }

    #[tokio::test]
    async fn grace_period_delays_expiry() {
        let core = core(RemotingConfig::new().with_callback_executor_threads(0));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        record(&core, 1, Duration::from_millis(0), &outcomes).await;
        assert_eq!(core.scan_response_table(), 0);
        assert!(core.is_pending(1));
    }

    #[tokio::test]
    async fn background_reaper_runs_until_shutdown() {
        let core = core(
            RemotingConfig::new()
                .with_reaper_grace_ms(0)
                .with_reaper_initial_delay_ms(0)
                .with_reaper_interval_ms(10)
                .with_callback_executor_threads(0),
        );
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        record(&core, 7, Duration::from_millis(20), &outcomes).await;
        core.start();

        for _ in 0..200 {
            if !core.is_pending(7) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!core.is_pending(7));
        assert_eq!(*outcomes.lock().unwrap(), vec![false]);

        core.reaper.shutdown();
        core.reaper.join().await;
    }

    #[tokio::test]
    async fn shutdown_does_not_wait_out_initial_delay() {
        let core = core(RemotingConfig::new().with_callback_executor_threads(0));
        core.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let start = std::time::Instant::now();
        core.shutdown();
        core.join().await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn rejected_callback_runs_inline() {
        struct Refuse(AtomicUsize);

        impl Executor for Refuse {
            fn execute(&self, job: crate::executor::Job) -> Result<(), Rejected> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(Rejected(job))
            }
        }

        let mut core = core(RemotingConfig::new());
        let refuse = Arc::new(Refuse(AtomicUsize::new(0)));
        core.set_callback_executor(Some(refuse.clone()));

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        record(&core, 3, Duration::from_secs(5), &outcomes).await;

        struct Null;
        impl Connection for Null {
            fn remote_addr(&self) -> String {
                String::from("peer")
            }
            fn send(
                &self,
                _command: RemotingCommand,
            ) -> futures::future::BoxFuture<'static, std::io::Result<()>> {
                futures::future::ready(Ok(())).boxed()
            }
        }
        let conn: Arc<dyn Connection> = Arc::new(Null);

        let mut response = RemotingCommand::create_request(0, 3);
        response.mark_response_type();
        core.process_message_received(&conn, response).await;

        assert_eq!(refuse.0.load(Ordering::SeqCst), 1);
        assert_eq!(*outcomes.lock().unwrap(), vec![true]);
        assert_eq!(core.available_async_permits(), 64);
        assert!(!core.is_pending(3));
    }
}
