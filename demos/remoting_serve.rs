// Copyright 2020 Joyent, Inc.

use std::fs;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_derive::{Deserialize, Serialize};
use slog::{debug, error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use rmq_remoting::server;
use rmq_remoting::{
    BoundedExecutor, ChannelEventListener, Connection, Executor, ProcessError, RemotingCommand,
    RemotingConfig, RemotingCore, RequestProcessor, ResponseCode,
};

static APP: &'static str = "remoting_serve";
static DEFAULT_ADDR: &'static str = "127.0.0.1:10911";
const DEFAULT_WORKERS: usize = 8;
const DEFAULT_QUEUE: usize = 1024;

const CODE_ECHO: i32 = 1;
const CODE_DATE: i32 = 2;
const CODE_COUNT: i32 = 3;
const CODE_FAIL: i32 = 4;

#[derive(Serialize, Deserialize)]
struct DatePayload {
    timestamp: u64,
}

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Remoting server answering a handful of demo request codes")
        .version(crate_version!())
        .arg(
            Arg::with_name("address")
                .help("Address to listen on (Default: 127.0.0.1:10911)")
                .long("address")
                .short("a")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .help("Path to a JSON remoting configuration")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("workers")
                .help("Request processing workers (Default: 8)")
                .long("workers")
                .short("w")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("queue")
                .help("Queued requests before answering SYSTEM_BUSY (Default: 1024)")
                .long("queue")
                .short("q")
                .takes_value(true),
        )
        .get_matches()
}

fn other_error(msg: &str) -> ProcessError {
    Box::new(Error::new(ErrorKind::Other, String::from(msg)))
}

fn respond(body: Vec<u8>) -> Option<RemotingCommand> {
    Some(RemotingCommand::create_response(ResponseCode::Success, None).with_body(body))
}

fn echo_processor(log: Logger) -> Arc<dyn RequestProcessor> {
    Arc::new(
        move |_conn: &Arc<dyn Connection>,
              request: &RemotingCommand|
              -> Result<Option<RemotingCommand>, ProcessError> {
            debug!(log, "handling echo request"; "opaque" => request.opaque);
            Ok(respond(
                request.body.as_ref().map(|b| b.to_vec()).unwrap_or_default(),
            ))
        },
    )
}

fn date_processor(log: Logger) -> Arc<dyn RequestProcessor> {
    Arc::new(
        move |_conn: &Arc<dyn Connection>,
              request: &RemotingCommand|
              -> Result<Option<RemotingCommand>, ProcessError> {
            debug!(log, "handling date request"; "opaque" => request.opaque);
            let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
            let payload = DatePayload {
                timestamp: now.as_millis() as u64,
            };
            Ok(respond(serde_json::to_vec(&payload)?))
        },
    )
}

/// Counts requests; one-way requests are counted without a reply.
fn count_processor(log: Logger) -> Arc<dyn RequestProcessor> {
    let count = AtomicU64::new(0);
    Arc::new(
        move |_conn: &Arc<dyn Connection>,
              request: &RemotingCommand|
              -> Result<Option<RemotingCommand>, ProcessError> {
            let seen = count.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(log, "handling count request";
                "opaque" => request.opaque, "oneway" => request.is_oneway(), "seen" => seen);
            Ok(respond(seen.to_string().into_bytes()))
        },
    )
}

fn fail_processor(
    _conn: &Arc<dyn Connection>,
    request: &RemotingCommand,
) -> Result<Option<RemotingCommand>, ProcessError> {
    match request.ext_fields.get("reason") {
        Some(reason) => Err(other_error(reason)),
        None => Err(other_error("request failed")),
    }
}

struct LoggingListener {
    log: Logger,
}

impl ChannelEventListener for LoggingListener {
    fn on_channel_connect(&self, remote_addr: &str, _conn: &Arc<dyn Connection>) {
        info!(self.log, "channel connected"; "addr" => remote_addr);
    }

    fn on_channel_close(&self, remote_addr: &str, _conn: &Arc<dyn Connection>) {
        info!(self.log, "channel closed"; "addr" => remote_addr);
    }

    fn on_channel_exception(&self, remote_addr: &str, _conn: &Arc<dyn Connection>) {
        error!(self.log, "channel exception"; "addr" => remote_addr);
    }

    fn on_channel_idle(&self, remote_addr: &str, _conn: &Arc<dyn Connection>) {
        info!(self.log, "channel idle"; "addr" => remote_addr);
    }
}

fn load_config(matches: &ArgMatches) -> RemotingConfig {
    match matches.value_of("config") {
        Some(path) => {
            let json = fs::read_to_string(path).unwrap_or_else(|e| {
                eprintln!("Failed to read config file {}: {}", path, e);
                process::exit(1)
            });
            RemotingConfig::from_json(&json).unwrap_or_else(|e| {
                eprintln!("Failed to parse config file {}: {}", path, e);
                process::exit(1)
            })
        }
        None => RemotingConfig::new(),
    }
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let addr = matches
        .value_of("address")
        .unwrap_or(DEFAULT_ADDR)
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!("Failed to parse listen address: {}", e);
            process::exit(1)
        });
    let workers = value_t!(matches, "workers", usize).unwrap_or(DEFAULT_WORKERS);
    let queue = value_t!(matches, "queue", usize).unwrap_or(DEFAULT_QUEUE);
    let config = load_config(&matches);

    let executor: Arc<dyn Executor> = Arc::new(BoundedExecutor::new(
        "RemotingServerExecutor",
        workers,
        queue,
        Some(&root_log),
    ));

    let mut core = RemotingCore::new(config, Some(&root_log));
    core.register_processor(CODE_ECHO, echo_processor(root_log.clone()), Arc::clone(&executor));
    core.register_processor(CODE_DATE, date_processor(root_log.clone()), Arc::clone(&executor));
    core.register_processor(CODE_COUNT, count_processor(root_log.clone()), Arc::clone(&executor));
    core.register_processor(CODE_FAIL, Arc::new(fail_processor), executor);
    core.set_channel_event_listener(Arc::new(LoggingListener {
        log: root_log.new(o!("component" => "ChannelEventListener")),
    }));

    let core = Arc::new(core);
    core.start();

    let listener = TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind {}: {}", addr, e);
        process::exit(1)
    });

    if let Err(e) = server::serve(Arc::clone(&core), listener).await {
        error!(root_log, "failed to accept connection"; "err" => %e);
    }

    core.shutdown();
    core.join().await;
}
