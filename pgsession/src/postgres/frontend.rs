//! Postgres Frontend Messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{BufMut, Bytes, BytesMut};

use super::{Oid, PgFormat};
use crate::ext::{BufMutExt, StrExt, UsizeExt};

/// Write a frontend message to `buf`.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size_hint = msg.size_hint();
    buf.reserve(PREFIX + size_hint as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_u32(4 + size_hint);

    msg.encode(&mut *buf);

    assert_eq!(
        buf.len() - offset,
        PREFIX + size_hint as usize,
        "Frontend message body size not equal to size hint"
    );
}

/// A type which can be encoded into postgres frontend message
pub trait FrontendProtocol {
    /// Message type.
    const MSGTYPE: u8;

    /// Size of the main body.
    ///
    /// Note that this is **only** the size of main body as oppose of actual postgres message which
    /// include the length itself.
    fn size_hint(&self) -> u32;

    /// Write the main body of the message.
    ///
    /// The lenght of body written must be equal to the
    /// length returned by [`size_hint`][FrontendProtocol::size_hint].
    fn encode(self, buf: impl BufMut);
}

/// Postgres Startup frontend message
///
/// For historical reasons, the very first message sent by the client (the [`Startup`] message)
/// has no initial message-type byte, thus [`Startup`] does not implement [`FrontendProtocol`].
///
/// To write startup message, use [`Startup::write`].
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Used to connect in streaming replication mode, where a small set of
    /// replication commands can be issued instead of SQL statements.
    ///
    /// Value can be true, false, or database, and the default is false.
    pub replication: Option<&'a str>,
    /// Reported as `application_name` run-time parameter.
    pub application_name: Option<&'a str>,
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // Length of message contents in bytes, including self.
        // reserve 4 bytes for length
        buf.put_u32(0);

        // The most significant 16 bits are the major version number (3 for the protocol described here).
        // The least significant 16 bits are the minor version number (0 for the protocol described here).
        buf.put_u32(196_608);

        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        if let Some(db) = self.database {
            buf.put_nul_string("database");
            buf.put_nul_string(db);
        }

        if let Some(repl) = self.replication {
            buf.put_nul_string("replication");
            buf.put_nul_string(repl);
        }

        // Other parameters are treated as run-time parameters to be set at backend start time.
        if let Some(name) = self.application_name {
            buf.put_nul_string("application_name");
            buf.put_nul_string(name);
        }

        // A zero byte is required as a terminator after the last name/value pair.
        buf.put_u8(b'\0');

        let mut written_buf = &mut buf[offset..];
        let len = written_buf.len().to_u32();
        written_buf.put_u32(len);
    }
}

/// Out of band request to cancel the query in progress on another connection.
///
/// Like [`Startup`], it has no message-type byte and is sent over a fresh connection.
#[derive(Debug)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: u32,
    /// The secret key for the target backend.
    pub secret_key: u32,
}

impl CancelRequest {
    /// The cancel request code. The value is chosen to contain 1234 in the most significant 16 bits,
    /// and 5678 in the least significant 16 bits.
    pub const CODE: u32 = 80_877_102;

    pub fn write(self, buf: &mut BytesMut) {
        buf.put_u32(16);
        buf.put_u32(Self::CODE);
        buf.put_u32(self.process_id);
        buf.put_u32(self.secret_key);
    }
}

macro_rules! size_of {
    ($self:tt.$field:ident) => {
        u32::try_from(size_of_val(&$self.$field)).expect("data type size too large for postgres")
    };
}

/// Identifies the message as a password response.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested)
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> u32 {
        self.password.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.password);
    }
}

/// Identifies the message as a simple query
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> u32 {
        self.sql.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.sql);
    }
}

/// Identifies the message as a Parse command
pub struct Parse<'a> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Specifies the object ID of the parameter data type.
    ///
    /// Note that this is not an indication of the number of parameters that might appear in the query string,
    /// only the number that the frontend wants to prespecify types for.
    ///
    /// Placing a zero here is equivalent to leaving the type unspecified.
    pub oids: &'a [Oid],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> u32 {
        self.prepare_name.nul_string_len()
            + self.sql.nul_string_len()
            + 2
            + 4 * self.oids.len().to_u32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.prepare_name);
        buf.put_nul_string(self.sql);
        buf.put_u16(self.oids.len().to_u16());
        for oid in self.oids {
            buf.put_u32(*oid);
        }
    }
}

/// Identifies the message as a Sync command
pub struct Sync;

impl FrontendProtocol for Sync {
    const MSGTYPE: u8 = b'S';

    fn size_hint(&self) -> u32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a Flush command
pub struct Flush;

impl FrontendProtocol for Flush {
    const MSGTYPE: u8 = b'H';

    fn size_hint(&self) -> u32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a termination.
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const MSGTYPE: u8 = b'X';

    fn size_hint(&self) -> u32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a Bind command.
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement (an empty string selects the unnamed prepared statement).
    pub stmt_name: &'a str,

    /// The parameter [`PgFormat`], one per parameter.
    pub param_formats: &'a [PgFormat],

    /// The value of the parameter, in the format indicated by the associated format code.
    ///
    /// [`None`] is a NULL parameter value, written as length -1 with no value bytes.
    pub params: &'a [Option<Bytes>],

    /// The result-columns [`PgFormat`].
    ///
    /// This can be empty to indicate that there are no result columns or that the result
    /// columns should all use the default format (text); or one, in which case the
    /// specified format code is applied to all result columns (if any); or it can equal
    /// the actual number of result columns of the query.
    pub result_formats: &'a [PgFormat],
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> u32 {
        self.portal_name.nul_string_len()
            + self.stmt_name.nul_string_len()
            + 2
            + 2 * self.param_formats.len().to_u32()
            + 2
            + self.params.iter().fold(0, |acc, p| acc + 4 + p.as_ref().map_or(0, |p| p.len().to_u32()))
            + 2
            + 2 * self.result_formats.len().to_u32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_nul_string(self.stmt_name);

        buf.put_u16(self.param_formats.len().to_u16());
        for format in self.param_formats {
            buf.put_u16(format.format_code());
        }

        buf.put_u16(self.params.len().to_u16());
        for param in self.params {
            match param {
                Some(value) => {
                    buf.put_i32(value.len().to_u32() as i32);
                    buf.put_slice(value);
                },
                // -1 for NULL
                None => buf.put_i32(-1),
            }
        }

        buf.put_u16(self.result_formats.len().to_u16());
        for format in self.result_formats {
            buf.put_u16(format.format_code());
        }
    }
}

/// Identifies the message as a Execute command
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes “no limit”.
    pub max_row: u32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> u32 {
        self.portal_name.nul_string_len() + size_of!(self.max_row)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_u32(self.max_row);
    }
}

/// Identifies the message as a Close command
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub variant: u8,
    /// The name of the prepared statement or portal to close
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> u32 {
        size_of!(self.variant) + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.variant);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Describe command.
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> u32 {
        size_of!(self.kind) + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as COPY data.
pub struct CopyData<'a> {
    /// Data that forms part of a COPY data stream.
    ///
    /// Messages sent from the frontend might divide the data stream arbitrarily.
    pub data: &'a [u8],
}

impl FrontendProtocol for CopyData<'_> {
    const MSGTYPE: u8 = b'd';

    fn size_hint(&self) -> u32 {
        self.data.len().to_u32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a COPY-complete indicator.
pub struct CopyDone;

impl FrontendProtocol for CopyDone {
    const MSGTYPE: u8 = b'c';

    fn size_hint(&self) -> u32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a COPY-failure indicator.
pub struct CopyFail<'a> {
    /// An error message to report as the cause of failure.
    pub message: &'a str,
}

impl FrontendProtocol for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';

    fn size_hint(&self) -> u32 {
        self.message.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.message);
    }
}

/// Standby status update, sent inside `CopyData` while streaming replication.
pub struct StandbyStatusUpdate {
    /// The location of the last WAL byte + 1 received and written to disk in the standby.
    pub write: u64,
    /// The location of the last WAL byte + 1 flushed to disk in the standby.
    pub flush: u64,
    /// The location of the last WAL byte + 1 applied in the standby.
    pub apply: u64,
    /// The client's system clock at the time of transmission,
    /// as microseconds since midnight on 2000-01-01.
    pub clock: i64,
    /// If 1, the client requests the server to reply to this message immediately.
    pub reply: u8,
}

impl FrontendProtocol for StandbyStatusUpdate {
    const MSGTYPE: u8 = b'd';

    fn size_hint(&self) -> u32 {
        1 + 8 + 8 + 8 + 8 + 1
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(b'r');
        buf.put_u64(self.write);
        buf.put_u64(self.flush);
        buf.put_u64(self.apply);
        buf.put_i64(self.clock);
        buf.put_u8(self.reply);
    }
}
