//! Wire command executor.
//!
//! Every [`Client`][crate::Client] operation is a [`Command`] sent to the worker, which runs it
//! to completion against its [`Session`] and replies with one [`Response`].
use bytes::Bytes;
use std::time::Duration;

use crate::{
    Result,
    common::{ByteStr, verbose},
    copy::{CopyFormat, CopyState},
    error::StateError,
    postgres::{Oid, PgFormat},
    replication::{ErasedHandler, Lsn, ReplicationOptions, ReplicationState},
    row::{QueryResult, RowBatch},
    session::{Session, TransactionStatus},
    simple::CommandStatus,
    statement::{Column, Statement},
    transport::PgTransport,
    value::Value,
};

/// Statement given by value or by name.
#[derive(Debug, Clone)]
pub enum StatementRef {
    Statement(Statement),
    /// Statement prepared earlier under this name, described before use.
    Name(ByteStr),
}

impl From<Statement> for StatementRef {
    fn from(value: Statement) -> Self {
        StatementRef::Statement(value)
    }
}

impl From<&Statement> for StatementRef {
    fn from(value: &Statement) -> Self {
        StatementRef::Statement(value.clone())
    }
}

impl From<&str> for StatementRef {
    fn from(value: &str) -> Self {
        StatementRef::Name(ByteStr::copy_from_str(value))
    }
}

pub(crate) enum Command {
    Parse { name: ByteStr, sql: ByteStr, types: Vec<Oid> },
    Prepare { sql: ByteStr, persistent: bool },
    Bind { statement: Statement, portal: ByteStr, params: Vec<Value> },
    Execute { statement: Statement, portal: ByteStr, max_row: u32 },
    DescribeStatement { name: ByteStr },
    DescribePortal { name: ByteStr },
    CloseStatement { name: ByteStr },
    ClosePortal { name: ByteStr },
    Sync,
    SimpleQuery { sql: ByteStr },
    ExtendedQuery { sql: ByteStr, types: Vec<Oid>, params: Vec<Value> },
    PreparedQuery { statement: StatementRef, params: Vec<Value> },
    Batch { statement: Statement, params: Vec<Vec<Value>> },
    BatchSql { sql: ByteStr, params: Vec<Vec<Value>> },
    BatchMixed { items: Vec<(Statement, Vec<Value>)> },
    CommandStatus,
    TransactionStatus,
    CopyFromStdin { sql: ByteStr, format: CopyFormat },
    CopyRows { rows: Vec<Vec<Value>>, timeout: Duration },
    CopyData { data: Bytes },
    CopyDone,
    CopyFail { reason: ByteStr },
    UpdateTypeCache { names: Vec<ByteStr> },
    StartReplication {
        slot: ByteStr,
        handler: Box<dyn ErasedHandler>,
        start: Lsn,
        plugin_opts: Option<ByteStr>,
        opts: ReplicationOptions,
    },
    StandbyStatusUpdate { flushed: Lsn, applied: Lsn },
    ReplicationState,
    StopReplication,
    Close,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Parse { .. } => "parse",
            Command::Prepare { .. } => "prepare",
            Command::Bind { .. } => "bind",
            Command::Execute { .. } => "execute",
            Command::DescribeStatement { .. } => "describe_statement",
            Command::DescribePortal { .. } => "describe_portal",
            Command::CloseStatement { .. } => "close_statement",
            Command::ClosePortal { .. } => "close_portal",
            Command::Sync => "sync",
            Command::SimpleQuery { .. } => "simple_query",
            Command::ExtendedQuery { .. } => "extended_query",
            Command::PreparedQuery { .. } => "prepared_query",
            Command::Batch { .. } => "execute_batch",
            Command::BatchSql { .. } => "execute_batch_sql",
            Command::BatchMixed { .. } => "execute_batch_mixed",
            Command::CommandStatus => "command_status",
            Command::TransactionStatus => "transaction_status",
            Command::CopyFromStdin { .. } => "copy_from_stdin",
            Command::CopyRows { .. } => "copy_send_rows",
            Command::CopyData { .. } => "copy_send_data",
            Command::CopyDone => "copy_done",
            Command::CopyFail { .. } => "copy_fail",
            Command::UpdateTypeCache { .. } => "update_type_cache",
            Command::StartReplication { .. } => "start_replication",
            Command::StandbyStatusUpdate { .. } => "standby_status_update",
            Command::ReplicationState => "replication_state",
            Command::StopReplication => "stop_replication",
            Command::Close => "close",
        }
    }

    /// Commands that only read client side state, valid in any mode.
    fn is_local(&self) -> bool {
        matches!(
            self,
            Command::CommandStatus
                | Command::TransactionStatus
                | Command::ReplicationState
                | Command::Close
        )
    }

    fn is_copy(&self) -> bool {
        matches!(
            self,
            Command::CopyRows { .. }
                | Command::CopyData { .. }
                | Command::CopyDone
                | Command::CopyFail { .. }
        )
    }

    fn is_replication(&self) -> bool {
        matches!(self, Command::StandbyStatusUpdate { .. } | Command::StopReplication)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) enum Response {
    Unit,
    Statement(Statement),
    Columns(Vec<Column>),
    Batch(RowBatch),
    Result(QueryResult),
    Simple(Vec<QueryResult>),
    Batches((Vec<Column>, Vec<RowBatch>)),
    Mixed(Vec<RowBatch>),
    Status(Option<CommandStatus>),
    TxStatus(TransactionStatus),
    Formats(Vec<PgFormat>),
    Count(u64),
    Replication(ReplicationState),
}

/// Send a command and extract the expected [`Response`] variant.
macro_rules! call {
    ($client:expr, $command:expr => Unit) => {
        match $client.request($command).await? {
            $crate::command::Response::Unit => Ok(()),
            _ => Err($crate::command::mismatch()),
        }
    };
    ($client:expr, $command:expr => $variant:ident) => {
        match $client.request($command).await? {
            $crate::command::Response::$variant(value) => Ok(value),
            _ => Err($crate::command::mismatch()),
        }
    };
}

pub(crate) use call;

pub(crate) fn mismatch() -> crate::Error {
    StateError { reason: "worker replied with another response kind" }.into()
}

impl<IO: PgTransport> Session<IO> {
    /// Reject commands that are not valid in the current mode, before any traffic.
    fn check_mode(&self, command: &Command) -> Result<()> {
        if command.is_local() {
            return Ok(());
        }
        if self.streaming.is_some() {
            return match command.is_replication() {
                true => Ok(()),
                false => Err(StateError { reason: "streaming replication in progress" }.into()),
            };
        }
        if !matches!(self.copy, CopyState::Normal) && !command.is_copy() {
            return Err(StateError { reason: "COPY in progress" }.into());
        }
        Ok(())
    }

    /// Run one command to completion.
    pub(crate) async fn dispatch(&mut self, command: Command) -> Result<Response> {
        verbose!("command {}", command.name());
        self.check_mode(&command)?;

        let response = match command {
            Command::Parse { name, sql, types } => Response::Statement(self.parse(name, &sql, &types).await?),
            Command::Prepare { sql, persistent } => Response::Statement(self.prepare(&sql, persistent).await?),
            Command::Bind { statement, portal, params } => {
                self.bind(&statement, &portal, &params).await?;
                Response::Unit
            },
            Command::Execute { statement, portal, max_row } => {
                Response::Batch(self.execute(&statement, &portal, max_row).await?)
            },
            Command::DescribeStatement { name } => Response::Statement(self.describe_statement(name).await?),
            Command::DescribePortal { name } => Response::Columns(self.describe_portal(&name).await?),
            Command::CloseStatement { name } => {
                self.close(b'S', &name).await?;
                Response::Unit
            },
            Command::ClosePortal { name } => {
                self.close(b'P', &name).await?;
                Response::Unit
            },
            Command::Sync => {
                self.sync().await?;
                Response::Unit
            },
            Command::SimpleQuery { sql } => Response::Simple(self.simple_query(&sql).await?),
            Command::ExtendedQuery { sql, types, params } => {
                Response::Result(self.extended_query(&sql, &types, &params).await?)
            },
            Command::PreparedQuery { statement, params } => {
                Response::Result(self.prepared_query(statement, &params).await?)
            },
            Command::Batch { statement, params } => Response::Batches(self.execute_batch(&statement, &params).await?),
            Command::BatchSql { sql, params } => Response::Batches(self.execute_batch_sql(&sql, &params).await?),
            Command::BatchMixed { items } => Response::Mixed(self.execute_batch_mixed(&items).await?),
            Command::CommandStatus => Response::Status(self.last_status.clone()),
            Command::TransactionStatus => Response::TxStatus(self.tx_status),
            Command::CopyFromStdin { sql, format } => Response::Formats(self.copy_from_stdin(&sql, format).await?),
            Command::CopyRows { rows, timeout } => {
                self.copy_send_rows(&rows, timeout).await?;
                Response::Unit
            },
            Command::CopyData { data } => {
                self.copy_send_data(data).await?;
                Response::Unit
            },
            Command::CopyDone => Response::Count(self.copy_done().await?),
            Command::CopyFail { reason } => {
                self.copy_fail(&reason).await?;
                Response::Unit
            },
            Command::UpdateTypeCache { names } => {
                self.update_type_cache(names).await?;
                Response::Unit
            },
            Command::StartReplication { slot, handler, start, plugin_opts, opts } => {
                self.start_replication(&slot, handler, start, plugin_opts.as_deref(), opts).await?;
                Response::Unit
            },
            Command::StandbyStatusUpdate { flushed, applied } => {
                self.standby_status_update(flushed, applied).await?;
                Response::Unit
            },
            Command::ReplicationState => Response::Replication(self.replication_state()?),
            Command::StopReplication => {
                self.stop_replication().await?;
                Response::Unit
            },
            Command::Close => {
                self.terminate().await;
                Response::Unit
            },
        };

        Ok(response)
    }
}
