//! Postgres Session Protocol
//!
//! A [`Client`] owns one connection, served by a background worker which runs one command
//! at a time. On top of the simple query protocol it provides:
//!
//! - extended query, with an LRU cache of named statements
//! - pipelined batches, one round trip per batch
//! - transactions, with rollback on failure and commit verification
//! - `COPY FROM STDIN` in text and binary format
//! - logical replication, with flow control of the acknowledged LSN
//!
//! Server notices, notifications and errors outside of a command are forwarded to the
//! receiver given to [`Config::async_receiver`].
//!
//! # Examples
//!
//! ```no_run
//! use pgsession::{Client, Config, Value};
//!
//! # async fn app() -> pgsession::Result<()> {
//! let client = Client::connect(Config::from_env()).await?;
//!
//! let result = client.equery("SELECT $1::int, $2::text", &[Value::Int4(420), "Foo".into()]).await?;
//! assert_eq!(result.rows[0].try_get::<_, i32>(0)?, 420);
//! assert_eq!(result.rows[0].try_get::<_, String>(1)?, "Foo");
//! # Ok(())
//! # }
//! ```
//!
//! Binary COPY:
//!
//! ```no_run
//! use std::time::Duration;
//! use pgsession::{Client, CopyFormat, Value, postgres::oid};
//!
//! # async fn app(client: Client) -> pgsession::Result<()> {
//! client
//!     .copy_from_stdin("COPY post(id, name) FROM STDIN BINARY", CopyFormat::Binary(vec![oid::INT4, oid::TEXT]))
//!     .await?;
//!
//! let rows = (0..14).map(|i| vec![Value::Int4(i), format!("post {i}").into()]).collect();
//! client.copy_send_rows(rows, Duration::from_secs(5)).await?;
//!
//! assert_eq!(client.copy_done().await?, 14);
//! # Ok(())
//! # }
//! ```

pub mod common;
mod net;
mod ext;

// Protocol
pub mod postgres;

// Encoding
mod value;
pub mod types;

// Component
mod statement;
pub mod sql;
pub mod row;

// Session
pub mod transport;
pub mod stream;
mod session;
mod command;
mod worker;
mod cancel;

// Operation
mod simple;
mod extended;
mod batch;
pub mod transaction;
pub mod copy;
pub mod replication;

// Connection
pub mod connection;

mod error;

#[cfg(test)]
mod testing;


pub use value::{Value, FromValue};
pub use row::{Row, RowBatch, QueryResult};
pub use statement::{Statement, Column};
pub use sql::{Sql, SqlExt};
pub use command::StatementRef;
pub use simple::CommandStatus;
pub use session::{AsyncMessage, TransactionStatus};

pub use worker::Client;
pub use cancel::CancelToken;
pub use connection::Config;
pub use transaction::{Outcome, Transaction, TransactionOptions};
pub use copy::{CopyError, CopyFormat};
pub use replication::{
    ChannelHandler, Lsn, ReplicationHandler, ReplicationOptions, ReplicationState, XLogData,
};
pub use error::{
    CommitVerificationError, Error, ErrorKind, ParamMismatch, Result, StateError,
};
