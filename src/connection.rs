// Copyright 2020 Joyent, Inc.

//! Transport boundary and the TCP implementation of it.

use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::{FutureExt, SinkExt, StreamExt};
use slog::{debug, info, o, warn};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::event::{ChannelEvent, ChannelEventType};
use crate::protocol::{RemotingCodec, RemotingCommand};
use crate::remoting::RemotingCore;

/// A connection commands can be written to.
pub trait Connection: Send + Sync {
    fn remote_addr(&self) -> String;

    /// Queue `command` for writing. The returned future resolves once the
    /// write has completed or failed.
    fn send(&self, command: RemotingCommand) -> BoxFuture<'static, std::io::Result<()>>;
}

enum WriteOp {
    Command(RemotingCommand, oneshot::Sender<std::io::Result<()>>),
    Shutdown,
}

fn closed_error() -> Error {
    Error::new(ErrorKind::BrokenPipe, "connection closed")
}

pub struct TcpConnection {
    remote_addr: String,
    closed: AtomicBool,
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl TcpConnection {
    /// Start driving `stream`: inbound frames go to `core`, and the
    /// returned handle writes outbound frames.
    pub fn open(core: &Arc<RemotingCore>, stream: TcpStream) -> Arc<TcpConnection> {
        let remote_addr = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| String::from("UNKNOWN"));
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let codec = RemotingCodec::new(core.config().frame_max_length);

        let conn = Arc::new(TcpConnection {
            remote_addr,
            closed: AtomicBool::new(false),
            tx,
        });

        tokio::spawn(write_loop(FramedWrite::new(write_half, codec.clone()), rx));
        tokio::spawn(read_loop(
            Arc::clone(core),
            Arc::clone(&conn),
            FramedRead::new(read_half, codec),
        ));

        conn
    }

    /// Stop accepting writes and shut the write side once queued frames
    /// have been flushed.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(WriteOp::Shutdown);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for TcpConnection {
    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn send(&self, command: RemotingCommand) -> BoxFuture<'static, std::io::Result<()>> {
        if self.is_closed() {
            return future::ready(Err(closed_error())).boxed();
        }

        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteOp::Command(command, done_tx)).is_err() {
            return future::ready(Err(closed_error())).boxed();
        }

        async move { done_rx.await.unwrap_or_else(|_| Err(closed_error())) }.boxed()
    }
}

async fn write_loop(
    mut writer: FramedWrite<OwnedWriteHalf, RemotingCodec>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Command(command, done) => {
                let result = writer.send(command).await;
                let _ = done.send(result);
            }
            WriteOp::Shutdown => break,
        }
    }
    let _ = writer.close().await;
}

async fn read_loop(
    core: Arc<RemotingCore>,
    tcp: Arc<TcpConnection>,
    mut reader: FramedRead<OwnedReadHalf, RemotingCodec>,
) {
    let remote_addr = tcp.remote_addr();
    let log = core.log().new(o!("remote_addr" => remote_addr.clone()));
    let conn: Arc<dyn Connection> = tcp.clone();
    let max_idle = core.config().channel_max_idle();

    info!(log, "connection established");
    core.put_event(ChannelEvent::new(
        ChannelEventType::Connect,
        remote_addr.clone(),
        Arc::clone(&conn),
    ));

    loop {
        let next = match max_idle {
            Some(limit) => match tokio::time::timeout(limit, reader.next()).await {
                Ok(next) => next,
                Err(_idle) => {
                    warn!(log, "connection idle, closing";
                        "max_idle_ms" => limit.as_millis() as u64);
                    core.put_event(ChannelEvent::new(
                        ChannelEventType::Idle,
                        remote_addr.clone(),
                        Arc::clone(&conn),
                    ));
                    break;
                }
            },
            None => reader.next().await,
        };

        match next {
            Some(Ok(command)) => {
                core.process_message_received(&conn, command).await;
            }
            Some(Err(e)) => {
                warn!(log, "failed to read command"; "err" => %e);
                core.put_event(ChannelEvent::new(
                    ChannelEventType::Exception,
                    remote_addr.clone(),
                    Arc::clone(&conn),
                ));
                break;
            }
            None => {
                debug!(log, "connection closed by peer");
                break;
            }
        }
    }

    tcp.close();
    info!(log, "connection closed");
    core.put_event(ChannelEvent::new(ChannelEventType::Close, remote_addr, conn));
}
