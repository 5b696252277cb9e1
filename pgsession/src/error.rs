//! `pgsession` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    common::unit_error,
    connection::{ConnectError, ParseError},
    copy::CopyError,
    postgres::{DbError, ProtocolError},
    simple::CommandStatus,
    types::{DecodeError, EncodeError},
};

/// A specialized [`Result`] type for `pgsession` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgsession` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Returns the server error report if this is a query error.
    pub fn as_db_error(&self) -> Option<&DbError> {
        match &self.kind {
            ErrorKind::Database(db) => Some(db),
            _ => None,
        }
    }

    /// Returns `true` if the error is a server side rejection of a command.
    ///
    /// The connection is still usable after a query error.
    pub fn is_database(&self) -> bool {
        matches!(self.kind, ErrorKind::Database(_))
    }

    /// Returns `true` if the connection itself is no longer usable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Protocol(_) | ErrorKind::Io(_) | ErrorKind::Timeout(_) | ErrorKind::Closed(_)
        )
    }

    pub(crate) fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Reclassify failure that happens before a session is usable.
    pub(crate) fn into_connect(self) -> Self {
        let kind = match self.kind {
            ErrorKind::Io(e) => ErrorKind::Connect(ConnectError::Io(e)),
            ErrorKind::Protocol(e) => ErrorKind::Connect(ConnectError::Protocol(e)),
            ErrorKind::Database(e) => ErrorKind::Connect(ConnectError::Rejected(e)),
            ErrorKind::Timeout(_) => ErrorKind::Connect(ConnectError::Timeout),
            kind => kind,
        };
        Self { kind, ..self }
    }
}

/// All possible error kind from `pgsession` library.
pub enum ErrorKind {
    /// Invalid connection config.
    Config(ParseError),
    /// Handshake, authentication or transport failure before a usable session exists.
    Connect(ConnectError),
    /// Server side rejection of a command.
    Database(DbError),
    /// Malformed or unexpected server message.
    Protocol(ProtocolError),
    Io(io::Error),
    /// Operation deadline exceeded, the connection is closed.
    Timeout(Timeout),
    /// The connection is closed.
    Closed(Closed),
    /// `COMMIT` did not report a committed transaction.
    CommitVerification(CommitVerificationError),
    /// COPY state precondition failed.
    Copy(CopyError),
    /// Number of parameters differs from the statement parameter types.
    ParamMismatch(ParamMismatch),
    Encode(EncodeError),
    Decode(DecodeError),
    /// Command is not valid in the current connection state.
    State(StateError),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ConnectError>e => ErrorKind::Connect(e));
from!(<DbError>e => ErrorKind::Database(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<Timeout>e => ErrorKind::Timeout(e));
from!(<Closed>e => ErrorKind::Closed(e));
from!(<CommitVerificationError>e => ErrorKind::CommitVerification(e));
from!(<CopyError>e => ErrorKind::Copy(e));
from!(<ParamMismatch>e => ErrorKind::ParamMismatch(e));
from!(<EncodeError>e => ErrorKind::Encode(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<StateError>e => ErrorKind::State(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Connect(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Timeout(e) => e.fmt(f),
            Self::Closed(e) => e.fmt(f),
            Self::CommitVerification(e) => e.fmt(f),
            Self::Copy(e) => e.fmt(f),
            Self::ParamMismatch(e) => e.fmt(f),
            Self::Encode(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::State(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

unit_error! {
    /// Operation deadline exceeded.
    pub struct Timeout("operation timed out");
}

unit_error! {
    /// The connection is closed, either explicitly or by a previous transport failure.
    pub struct Closed("connection closed");
}

/// `COMMIT` returned successfully but the transaction was not committed.
///
/// The server downgrades `COMMIT` of an aborted transaction into a rollback.
pub struct CommitVerificationError {
    pub status: Option<CommandStatus>,
}

impl std::error::Error for CommitVerificationError { }

impl fmt::Display for CommitVerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            Some(status) => write!(f, "transaction not committed, server reported `{status}`"),
            None => f.write_str("transaction not committed, no command status"),
        }
    }
}

impl fmt::Debug for CommitVerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Number of parameters differs from the statement parameter types.
#[derive(Clone, PartialEq, Eq)]
pub struct ParamMismatch {
    pub expected: usize,
    pub found: usize,
}

impl ParamMismatch {
    pub(crate) fn check(expected: usize, found: usize) -> Result<(), ParamMismatch> {
        match expected == found {
            true => Ok(()),
            false => Err(ParamMismatch { expected, found }),
        }
    }
}

impl std::error::Error for ParamMismatch { }

impl fmt::Display for ParamMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parameter mismatch, expected {} found {}", self.expected, self.found)
    }
}

impl fmt::Debug for ParamMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Command is not valid in the current connection state.
#[derive(Clone, PartialEq, Eq)]
pub struct StateError {
    pub(crate) reason: &'static str,
}

impl std::error::Error for StateError { }

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid connection state: {}", self.reason)
    }
}

impl fmt::Debug for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
