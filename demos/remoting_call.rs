// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::sync::oneshot;

use rmq_remoting::client;
use rmq_remoting::{Connection, OpaqueId, RemotingCommand, RemotingConfig, RemotingCore};

static APP: &'static str = "remoting_call";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 10911;
const DEFAULT_TIMEOUT_MS: u64 = 3000;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for invoking a remoting request code")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 10911)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("code")
                .help("Request code to invoke")
                .long("code")
                .short("c")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("body")
                .help("Request body")
                .long("body")
                .short("b")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ext")
                .help("Extension field as key=value, may be repeated")
                .long("ext")
                .short("e")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("mode")
                .help("Invocation mode")
                .long("mode")
                .short("m")
                .takes_value(true)
                .possible_values(&["sync", "async", "oneway"])
                .default_value("sync"),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Timeout in milliseconds (Default: 3000)")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .help("Log remoting activity to stderr")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn print_response(response: &RemotingCommand) {
    println!("{}", response);
    if let Some(body) = &response.body {
        println!("{}", String::from_utf8_lossy(body));
    }
}

fn build_request(matches: &ArgMatches) -> RemotingCommand {
    let code = value_t!(matches, "code", i32).unwrap_or_else(|e| e.exit());
    let opaque = OpaqueId::new().next().unwrap_or_default();
    let mut request = RemotingCommand::create_request(code, opaque);

    if let Some(body) = matches.value_of("body") {
        request = request.with_body(String::from(body));
    }
    for field in matches.values_of("ext").into_iter().flatten() {
        match field.find('=') {
            Some(idx) => request = request.with_ext_field(&field[..idx], &field[idx + 1..]),
            None => {
                eprintln!("Extension field must be key=value: {}", field);
                process::exit(1)
            }
        }
    }

    request
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });
    let timeout = Duration::from_millis(
        value_t!(matches, "timeout", u64).unwrap_or(DEFAULT_TIMEOUT_MS),
    );

    let level = if matches.is_present("verbose") {
        Level::Debug
    } else {
        Level::Warning
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!(),
    );

    let request = build_request(&matches);
    let core = Arc::new(RemotingCore::new(RemotingConfig::new(), Some(&log)));

    let conn: Arc<dyn Connection> = client::connect(&core, &addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to connect to server: {}", e);
        process::exit(1)
    });

    let result = match matches.value_of("mode").unwrap_or("sync") {
        "async" => {
            let (done_tx, done_rx) = oneshot::channel();
            match core
                .invoke_async(&conn, request, timeout, move |outcome| {
                    let _ = done_tx.send(outcome);
                })
                .await
            {
                Ok(()) => {
                    // The reaper reports an unanswered request after the
                    // timeout plus its grace period.
                    core.start();
                    match done_rx.await {
                        Ok(outcome) => outcome.map(|response| print_response(&response)),
                        Err(_) => Ok(()),
                    }
                }
                Err(e) => Err(e),
            }
        }
        "oneway" => core.invoke_oneway(&conn, request, timeout).await,
        _ => core
            .invoke_sync(&conn, request, timeout)
            .await
            .map(|response| print_response(&response)),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1)
    }

    // Let a queued one-way write reach the socket.
    tokio::time::sleep(Duration::from_millis(100)).await;
}
