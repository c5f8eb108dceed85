// Copyright 2020 Joyent, Inc.

//! Error types for remoting invocations.

use std::fmt;
use std::io;
use std::time::Duration;

/// Failure raised by a handler or hook while processing a request.
pub type ProcessError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
pub enum RemotingError {
    /// The transport rejected or failed the write.
    SendFailure {
        addr: String,
        source: Option<io::Error>,
    },
    /// No response within the deadline, or no permit within the deadline.
    Timeout {
        addr: String,
        timeout: Duration,
        info: Option<String>,
        source: Option<io::Error>,
    },
    /// A non-positive timeout found no free permit.
    TooManyRequests(String),
    /// The opaque is already awaiting a response.
    DuplicateRequest(i32),
    /// Establishing a connection failed.
    Io(io::Error),
}

impl RemotingError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RemotingError::Timeout { .. })
    }

    pub fn is_send_failure(&self) -> bool {
        matches!(self, RemotingError::SendFailure { .. })
    }
}

impl fmt::Display for RemotingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemotingError::SendFailure { addr, source } => {
                write!(f, "send request to <{}> failed", addr)?;
                if let Some(e) = source {
                    write!(f, ": {}", e)?;
                }
                Ok(())
            }
            RemotingError::Timeout {
                addr,
                timeout,
                info,
                source,
            } => {
                match info {
                    Some(info) => write!(f, "{}", info)?,
                    None => write!(
                        f,
                        "wait response on the channel <{}> timeout, {}(ms)",
                        addr,
                        timeout.as_millis()
                    )?,
                }
                if let Some(e) = source {
                    write!(f, ": {}", e)?;
                }
                Ok(())
            }
            RemotingError::TooManyRequests(msg) => write!(f, "{}", msg),
            RemotingError::DuplicateRequest(opaque) => {
                write!(f, "opaque {} is already awaiting a response", opaque)
            }
            RemotingError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for RemotingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RemotingError::SendFailure { source, .. }
            | RemotingError::Timeout { source, .. } => {
                source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
            }
            RemotingError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RemotingError {
    fn from(e: io::Error) -> Self {
        RemotingError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, RemotingError>;
