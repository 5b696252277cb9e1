//! Wire messages of the postgres frontend/backend protocol, version 3.0.
//!
//! Every message after startup is framed as a type byte, then a big endian `i32` length
//! that counts itself and the body but not the type byte:
//!
//! ```text
//! 'Z'  00 00 00 05  'I'
//! type length       body
//! ```
//!
//! [`frontend`] holds what the session writes and [`backend`] what it reads. Errors and
//! notices decode into [`DbError`], anything that breaks the framing or the expected
//! message order is a [`ProtocolError`].
//!
//! COPY and replication carry their own payloads inside `CopyData`. Replication records
//! decode into [`ReplicationMessage`], the standby reply is written by
//! [`frontend::StandbyStatusUpdate`].
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>

mod pg_type;
mod pg_format;

pub mod frontend;
pub mod backend;

mod error;
mod db_error;

pub use pg_type::{Oid, oid};
pub use pg_format::PgFormat;

pub use frontend::FrontendProtocol;
pub use backend::{BackendMessage, BackendProtocol, ErrorResponse, NoticeResponse, ReplicationMessage};
pub use error::ProtocolError;
pub use db_error::{DbError, Severity};
