// Copyright 2020 Joyent, Inc.

//! Inbound request dispatch.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use slog::{debug, error, info, warn, Logger};
use tokio::net::TcpListener;

use crate::connection::{Connection, TcpConnection};
use crate::error::ProcessError;
use crate::executor::Rejected;
use crate::processor::{RequestProcessor, RpcHook};
use crate::protocol::{RemotingCommand, ResponseCode};
use crate::remoting::RemotingCore;

const BUSY_WARNING_WINDOW: Duration = Duration::from_secs(10);

thread_local! {
    static LAST_BUSY_WARNING: Cell<Option<Instant>> = Cell::new(None);
}

/// At most one saturation warning per window on each thread.
fn busy_warning_due() -> bool {
    LAST_BUSY_WARNING.with(|last| {
        let now = Instant::now();
        match last.get() {
            Some(at) if now.duration_since(at) < BUSY_WARNING_WINDOW => false,
            _ => {
                last.set(Some(now));
                true
            }
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        String::from(*msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        String::from("handler panicked")
    }
}

fn error_response(code: ResponseCode, remark: String, opaque: i32) -> RemotingCommand {
    let mut response = RemotingCommand::create_response(code, Some(remark));
    response.opaque = opaque;
    response
}

/// Write `response` in the background, logging a failed write.
fn write_and_log(conn: &Arc<dyn Connection>, response: RemotingCommand, log: &Logger) {
    let desc = response.to_string();
    let send = conn.send(response);
    let addr = conn.remote_addr();
    let log = log.clone();
    tokio::spawn(async move {
        if let Err(e) = send.await {
            error!(log, "failed to write response";
                "addr" => addr, "err" => %e, "response" => desc);
        }
    });
}

fn process(
    processor: &dyn RequestProcessor,
    hook: Option<&dyn RpcHook>,
    conn: &Arc<dyn Connection>,
    addr: &str,
    cmd: &RemotingCommand,
) -> Result<Option<RemotingCommand>, ProcessError> {
    if let Some(hook) = hook {
        hook.do_before_request(addr, cmd)?;
    }
    let response = processor.process_request(conn, cmd)?;
    if let Some(hook) = hook {
        hook.do_after_response(addr, cmd, response.as_ref())?;
    }
    Ok(response)
}

async fn run_request(
    processor: Arc<dyn RequestProcessor>,
    hook: Option<Arc<dyn RpcHook>>,
    conn: Arc<dyn Connection>,
    cmd: RemotingCommand,
    log: Logger,
) {
    let addr = conn.remote_addr();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        process(processor.as_ref(), hook.as_deref(), &conn, &addr, &cmd)
    }));

    let failure = match outcome {
        Ok(Ok(response)) => {
            if cmd.is_oneway() {
                return;
            }
            // None means the processor answers out of band.
            if let Some(mut response) = response {
                response.opaque = cmd.opaque;
                response.mark_response_type();
                let desc = response.to_string();
                if let Err(e) = conn.send(response).await {
                    error!(log, "request processed but response write failed";
                        "addr" => &addr, "err" => %e, "cmd" => %cmd, "response" => desc);
                }
            }
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(panic) => panic_message(panic.as_ref()),
    };

    error!(log, "request processing failed";
        "addr" => &addr, "err" => &failure, "cmd" => %cmd);
    if !cmd.is_oneway() {
        let response = error_response(ResponseCode::SystemError, failure, cmd.opaque);
        if let Err(e) = conn.send(response).await {
            error!(log, "failed to write system error response";
                "addr" => &addr, "err" => %e);
        }
    }
}

/// Accept connections on `listener` until accepting fails.
pub async fn serve(core: Arc<RemotingCore>, listener: TcpListener) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(core.log(), "listening for remoting requests"; "address" => addr.to_string());
    }
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(core.log(), "accepted connection"; "addr" => addr.to_string());
        TcpConnection::open(&core, stream);
    }
}

impl RemotingCore {
    /// Hand a request to its processor's executor.
    ///
    /// Unknown codes and a saturated executor are answered immediately on
    /// the calling task; everything else runs on the processor's executor.
    pub fn process_request_command(&self, conn: &Arc<dyn Connection>, cmd: RemotingCommand) {
        let (processor, executor) = match self.processor_table.resolve(cmd.code) {
            Some(pair) => pair,
            None => {
                let remark = format!(" request type {} not supported", cmd.code);
                error!(self.log, "request code not supported";
                    "addr" => conn.remote_addr(), "code" => cmd.code, "cmd" => %cmd);
                let response =
                    error_response(ResponseCode::RequestCodeNotSupported, remark, cmd.opaque);
                write_and_log(conn, response, &self.log);
                return;
            }
        };

        let oneway = cmd.is_oneway();
        let opaque = cmd.opaque;
        let code = cmd.code;
        let desc = cmd.to_string();
        let job = run_request(
            Arc::clone(processor),
            self.rpc_hook.clone(),
            Arc::clone(conn),
            cmd,
            self.log.clone(),
        )
        .boxed();

        if let Err(Rejected(_job)) = executor.execute(job) {
            if busy_warning_due() {
                warn!(self.log, "too many requests and system thread pool busy";
                    "addr" => conn.remote_addr(), "code" => code, "cmd" => desc);
            }
            if !oneway {
                let response = error_response(
                    ResponseCode::SystemBusy,
                    String::from(
                        "too many requests and system thread pool busy, please try another server",
                    ),
                    opaque,
                );
                write_and_log(conn, response, &self.log);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fmt;
    use std::sync::Mutex;

    use futures::future::BoxFuture;
    use slog::{o, Drain, Never, OwnedKVList, Record, KV};

    use crate::config::RemotingConfig;
    use crate::executor::{Executor, Job};

    type Captured = Arc<Mutex<Vec<(String, Vec<String>)>>>;

    struct KeyNames(Vec<String>);

    impl slog::Serializer for KeyNames {
        fn emit_arguments(&mut self, key: slog::Key, _val: &fmt::Arguments) -> slog::Result {
            self.0.push(key.to_string());
            Ok(())
        }
    }

    /// Keeps each record's message and the names of its keys.
    struct Capture(Captured);

    impl Drain for Capture {
        type Ok = ();
        type Err = Never;

        fn log(&self, record: &Record, _values: &OwnedKVList) -> Result<(), Never> {
            let mut keys = KeyNames(Vec::new());
            let _ = record.kv().serialize(record, &mut keys);
            self.0
                .lock()
                .unwrap()
                .push((record.msg().to_string(), keys.0));
            Ok(())
        }
    }

    struct Null;

    impl Connection for Null {
        fn remote_addr(&self) -> String {
            String::from("127.0.0.1:1")
        }

        fn send(&self, _command: RemotingCommand) -> BoxFuture<'static, std::io::Result<()>> {
            futures::future::ready(Ok(())).boxed()
        }
    }

    struct Refuse;

    impl Executor for Refuse {
        fn execute(&self, job: Job) -> Result<(), Rejected> {
            Err(Rejected(job))
        }
    }

    fn logged_keys(captured: &Captured, msg: &str) -> Option<Vec<String>> {
        captured
            .lock()
            .unwrap()
            .iter()
            .find(|(m, _)| m == msg)
            .map(|(_, keys)| keys.clone())
    }

    #[tokio::test]
    async fn rejected_requests_log_the_command() {
        let captured = Captured::default();
        let log = Logger::root(Capture(Arc::clone(&captured)).fuse(), o!());
        let mut core = RemotingCore::new(
            RemotingConfig::new().with_callback_executor_threads(0),
            Some(&log),
        );
        let echo: Arc<dyn RequestProcessor> = Arc::new(
            |_conn: &Arc<dyn Connection>,
             _req: &RemotingCommand|
             -> Result<Option<RemotingCommand>, ProcessError> { Ok(None) },
        );
        core.register_processor(7, echo, Arc::new(Refuse));
        let conn: Arc<dyn Connection> = Arc::new(Null);

        core.process_request_command(&conn, RemotingCommand::create_request(99, 1));
        core.process_request_command(&conn, RemotingCommand::create_request(7, 2));

        let unsupported = logged_keys(&captured, "request code not supported").unwrap();
        assert!(unsupported.contains(&String::from("cmd")));
        let busy =
            logged_keys(&captured, "too many requests and system thread pool busy").unwrap();
        assert!(busy.contains(&String::from("cmd")));
    }

    #[test]
    fn busy_warning_throttled_per_thread() {
        assert!(busy_warning_due());
        assert!(!busy_warning_due());
        let other = std::thread::spawn(busy_warning_due).join().unwrap();
        assert!(other);
    }

    #[test]
    fn panic_payloads_described() {
        let err = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "boom");
        let err = panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "code 7");
    }
}
