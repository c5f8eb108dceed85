// Copyright 2020 Joyent, Inc.

//! Remoting: request/response correlation over a framed command protocol
//!
//! This crate multiplexes any number of outstanding requests over a single
//! connection and offers three ways to invoke the remote end:
//!
//! * synchronous: `RemotingCore::invoke_sync` waits for the response or
//!   the deadline.
//!
//! * asynchronous: `RemotingCore::invoke_async` returns once the write is
//!   issued and later runs a callback exactly once.
//!
//! * one-way: `RemotingCore::invoke_oneway` sends without expecting any
//!   reply.
//!
//! Asynchronous and one-way sends are bounded by two independent pools of
//! permits. Inbound requests are routed by request code to a processor and
//! the executor it runs on; unknown codes, saturated executors and failing
//! processors are answered with `ResponseCode::RequestCodeNotSupported`,
//! `ResponseCode::SystemBusy` and `ResponseCode::SystemError`.
//!
//! Protocol definition
//!
//! Remoting commands have the following structure:
//!
//! * LENGTH    4-byte big-endian unsigned integer, the number of bytes that
//!           follow.
//!
//! * MARK      4-byte big-endian unsigned integer. The high byte is the
//!           header serialization type; the only supported value is JSON
//!           (0x0). The low three bytes give the header length.
//!
//! * HEADER    JSON object with the fields `code`, `language`, `version`,
//!           `opaque`, `flag`, and optionally `remark` and `extFields`.
//!
//! * BODY      Opaque payload filling the rest of the frame.
//!
//! Bit 0 of `flag` marks a response, bit 1 marks a one-way request.
//!
//! Opaques: each request carries an opaque chosen by the caller, scoped to
//! the endpoint that sent it, and echoed back in the response. `OpaqueId`
//! allocates them sequentially from a circular 31-bit space.

#![allow(missing_docs)]

pub mod admission;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod executor;
pub mod processor;
pub mod protocol;
pub mod remoting;
pub mod response;
pub mod server;
pub mod service;

pub use crate::config::RemotingConfig;
pub use crate::connection::{Connection, TcpConnection};
pub use crate::error::{ProcessError, RemotingError, Result};
pub use crate::event::{ChannelEvent, ChannelEventListener, ChannelEventType};
pub use crate::executor::{BoundedExecutor, Executor, Job, Rejected};
pub use crate::processor::{RequestProcessor, RpcHook};
pub use crate::protocol::{OpaqueId, RemotingCommand, RemotingCommandType, ResponseCode};
pub use crate::remoting::RemotingCore;
