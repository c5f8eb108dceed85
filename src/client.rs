// Copyright 2020 Joyent, Inc.

//! Outbound invocations: synchronous, asynchronous with a callback, and
//! one-way.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, warn};
use tokio::net::TcpStream;

use crate::connection::{Connection, TcpConnection};
use crate::error::{RemotingError, Result};
use crate::protocol::RemotingCommand;
use crate::remoting::RemotingCore;
use crate::response::{ResponseFuture, ResponseTable, SemaphoreReleaseOnlyOnce};

/// Removes a synchronous request's record however the call exits.
struct RemoveOnDrop<'a> {
    table: &'a ResponseTable,
    future: &'a Arc<ResponseFuture>,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        self.table.remove_record(self.future);
    }
}

/// Open a TCP connection to `addr` driven by `core`.
pub async fn connect(core: &Arc<RemotingCore>, addr: &SocketAddr) -> Result<Arc<TcpConnection>> {
    let stream = TcpStream::connect(addr).await?;
    debug!(core.log(), "connected"; "addr" => addr.to_string());
    Ok(TcpConnection::open(core, stream))
}

impl RemotingCore {
    /// Send `request` and wait up to `timeout` for its response.
    ///
    /// The request's opaque must not already be awaiting a response.
    pub async fn invoke_sync(
        &self,
        conn: &Arc<dyn Connection>,
        request: RemotingCommand,
        timeout: Duration,
    ) -> Result<RemotingCommand> {
        let addr = conn.remote_addr();
        let (future, waiter) =
            ResponseFuture::new(request.opaque, addr.clone(), timeout, None, None);
        let future = Arc::new(future);
        self.response_table.insert(Arc::clone(&future))?;
        let _cleanup = RemoveOnDrop {
            table: &self.response_table,
            future: &future,
        };

        let desc = request.to_string();
        let send = conn.send(request);
        {
            let table = self.response_table.clone();
            let future = Arc::clone(&future);
            let log = self.log.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                match send.await {
                    Ok(()) => future.set_send_request_ok(true),
                    Err(e) => {
                        future.set_send_request_ok(false);
                        table.remove_record(&future);
                        warn!(log, "failed to send request";
                            "addr" => addr, "err" => %e, "request" => desc);
                        future.set_cause(e);
                        future.put_response(None);
                    }
                }
            });
        }

        match waiter.wait_response(timeout).await {
            Some(response) => Ok(response),
            None if future.is_send_request_ok() => Err(RemotingError::Timeout {
                addr,
                timeout,
                info: None,
                source: future.take_cause(),
            }),
            None => Err(RemotingError::SendFailure {
                addr,
                source: future.take_cause(),
            }),
        }
    }

    /// Send `request` once an async permit is available, returning as soon
    /// as the write has been issued. `callback` runs exactly once with the
    /// response, or with an error if the write fails or the reaper expires
    /// the request.
    pub async fn invoke_async<F>(
        &self,
        conn: &Arc<dyn Connection>,
        request: RemotingCommand,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(std::result::Result<RemotingCommand, RemotingError>) + Send + 'static,
    {
        let addr = conn.remote_addr();
        let permit = match self.admission_async.acquire(timeout, &addr).await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(self.log, "async request not admitted";
                    "err" => %e, "request" => %request);
                return Err(e);
            }
        };

        let opaque = request.opaque;
        let (future, _waiter) = ResponseFuture::new(
            opaque,
            addr.clone(),
            timeout,
            Some(Box::new(callback)),
            Some(SemaphoreReleaseOnlyOnce::new(permit)),
        );
        let future = Arc::new(future);
        // A rejected insert drops the record and with it the permit.
        self.response_table.insert(Arc::clone(&future))?;

        let desc = request.to_string();
        let send = conn.send(request);
        let table = self.response_table.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            let e = match send.await {
                Ok(()) => {
                    future.set_send_request_ok(true);
                    return;
                }
                Err(e) => e,
            };

            future.set_send_request_ok(false);
            future.put_response(None);
            table.remove_record(&future);
            warn!(log, "failed to send request";
                "addr" => &addr, "err" => %e, "request" => desc);
            future.execute_invoke_callback(
                Err(RemotingError::SendFailure {
                    addr,
                    source: Some(e),
                }),
                &log,
            );
            future.release();
        });

        Ok(())
    }

    /// Send `request` without expecting a reply. Only local admission can
    /// fail; transport failures are logged.
    pub async fn invoke_oneway(
        &self,
        conn: &Arc<dyn Connection>,
        mut request: RemotingCommand,
        timeout: Duration,
    ) -> Result<()> {
        request.mark_oneway();
        let addr = conn.remote_addr();
        let permit = match self.admission_oneway.acquire(timeout, &addr).await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(self.log, "oneway request not admitted";
                    "err" => %e, "request" => %request);
                return Err(e);
            }
        };

        let once = SemaphoreReleaseOnlyOnce::new(permit);
        let desc = request.to_string();
        let send = conn.send(request);
        let log = self.log.clone();
        tokio::spawn(async move {
            let result = send.await;
            once.release();
            if let Err(e) = result {
                warn!(log, "failed to send request";
                    "addr" => addr, "err" => %e, "request" => desc);
            }
        });

        Ok(())
    }
}
