// Copyright 2020 Joyent, Inc.

//! Request handlers and the table that routes request codes to them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::ProcessError;
use crate::executor::Executor;
use crate::protocol::RemotingCommand;

/// Handles one request code.
///
/// Returning `Ok(None)` for a two-way request means the processor has
/// answered (or will answer) on its own through the connection.
pub trait RequestProcessor: Send + Sync {
    fn process_request(
        &self,
        conn: &Arc<dyn Connection>,
        request: &RemotingCommand,
    ) -> Result<Option<RemotingCommand>, ProcessError>;
}

impl<F> RequestProcessor for F
where
    F: Fn(&Arc<dyn Connection>, &RemotingCommand) -> Result<Option<RemotingCommand>, ProcessError>
        + Send
        + Sync,
{
    fn process_request(
        &self,
        conn: &Arc<dyn Connection>,
        request: &RemotingCommand,
    ) -> Result<Option<RemotingCommand>, ProcessError> {
        self(conn, request)
    }
}

/// Cross-cutting hooks run around every processed request. An error from
/// either hook fails the request with a system error response.
pub trait RpcHook: Send + Sync {
    fn do_before_request(
        &self,
        remote_addr: &str,
        request: &RemotingCommand,
    ) -> Result<(), ProcessError>;

    fn do_after_response(
        &self,
        remote_addr: &str,
        request: &RemotingCommand,
        response: Option<&RemotingCommand>,
    ) -> Result<(), ProcessError>;
}

pub type ProcessorPair = (Arc<dyn RequestProcessor>, Arc<dyn Executor>);

#[derive(Default)]
pub struct ProcessorTable {
    processors: HashMap<i32, ProcessorPair>,
    default_processor: Option<ProcessorPair>,
}

impl ProcessorTable {
    pub fn new() -> ProcessorTable {
        ProcessorTable {
            processors: HashMap::with_capacity(64),
            default_processor: None,
        }
    }

    pub fn register(
        &mut self,
        code: i32,
        processor: Arc<dyn RequestProcessor>,
        executor: Arc<dyn Executor>,
    ) {
        self.processors.insert(code, (processor, executor));
    }

    pub fn register_default(
        &mut self,
        processor: Arc<dyn RequestProcessor>,
        executor: Arc<dyn Executor>,
    ) {
        self.default_processor = Some((processor, executor));
    }

    /// The processor for `code`, else the default one.
    pub fn resolve(&self, code: i32) -> Option<&ProcessorPair> {
        self.processors
            .get(&code)
            .or_else(|| self.default_processor.as_ref())
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty() && self.default_processor.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::executor::{Job, Rejected};

    struct NoopExecutor;

    impl Executor for NoopExecutor {
        fn execute(&self, _job: Job) -> Result<(), Rejected> {
            Ok(())
        }
    }

    fn answer(code: i32) -> Arc<dyn RequestProcessor> {
        Arc::new(
            move |_conn: &Arc<dyn Connection>,
                  _req: &RemotingCommand|
                  -> Result<Option<RemotingCommand>, ProcessError> {
                Ok(Some(RemotingCommand::create_request(code, 0)))
            },
        )
    }

    fn resolved_code(table: &ProcessorTable, code: i32) -> Option<i32> {
        struct Null;
        impl Connection for Null {
            fn remote_addr(&self) -> String {
                String::from("null")
            }
            fn send(
                &self,
                _command: RemotingCommand,
            ) -> futures::future::BoxFuture<'static, std::io::Result<()>> {
                Box::pin(futures::future::ready(Ok(())))
            }
        }
        let conn: Arc<dyn Connection> = Arc::new(Null);
        table.resolve(code).map(|(processor, _)| {
            processor
                .process_request(&conn, &RemotingCommand::create_request(code, 0))
                .unwrap()
                .unwrap()
                .code
        })
    }

    #[test]
    fn falls_back_to_default() {
        let mut table = ProcessorTable::new();
        assert!(table.is_empty());
        assert_eq!(resolved_code(&table, 10), None);

        table.register(10, answer(100), Arc::new(NoopExecutor));
        assert_eq!(resolved_code(&table, 10), Some(100));
        assert_eq!(resolved_code(&table, 11), None);

        table.register_default(answer(-1), Arc::new(NoopExecutor));
        assert_eq!(resolved_code(&table, 11), Some(-1));
        assert_eq!(resolved_code(&table, 10), Some(100));
        assert_eq!(table.len(), 1);
    }
}
