//! Postgres Backend Messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::Bytes;

use super::{DbError, PgFormat, ProtocolError};
use crate::{common::ByteStr, ext::BytesExt};

/// A type that can be decoded into postgres backend message
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Postgres backend messages
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    CopyData(CopyData),
    CopyDone(CopyDone),
    CopyInResponse(CopyInResponse),
    CopyOutResponse(CopyOutResponse),
    CopyBothResponse(CopyBothResponse),
    DataRow(DataRow),
    ErrorResponse(ErrorResponse),
    EmptyQueryResponse(EmptyQueryResponse),
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    NotificationResponse(NotificationResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }

            /// Get message name from message type.
            ///
            /// Returns `"Unknown"` for unknown message type.
            pub fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }
        }

        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }

        $(
            impl TryFrom<BackendMessage> for $name {
                type Error = ProtocolError;

                fn try_from(message: BackendMessage) -> Result<Self, ProtocolError> {
                    match message {
                        BackendMessage::$name(ok) => Ok(ok),
                        other => Err(ProtocolError::unexpected($name::MSGTYPE, other.msgtype())),
                    }
                }
            }
        )*
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyData,
    CopyDone,
    CopyInResponse,
    CopyOutResponse,
    CopyBothResponse,
    DataRow,
    ErrorResponse,
    EmptyQueryResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

macro_rules! assert_msgtype {
    ($typ:ident) => {
        if Self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(Self::MSGTYPE, $typ))
        }
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Specifies that the authentication was successful.
    Ok,
    /// Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Specifies that a clear-text password is required.
    CleartextPassword,
    /// Specifies that an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8; 4],
    },
    /// Specifies that GSSAPI authentication is required.
    GSS,
    /// GSSAPI or SSPI authentication data.
    GSSContinue { data: Bytes },
    /// Specifies that SSPI authentication is required.
    SSPI,
    /// Specifies that SASL authentication is required.
    ///
    /// The body is a list of SASL authentication mechanisms, in the server's order of preference.
    SASL { mechanisms: Bytes },
    /// Specifies that this message contains a SASL challenge.
    SASLContinue { data: Bytes },
    /// Specifies that SASL authentication has completed.
    SASLFinal { data: Bytes },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let auth = match body.try_i32()? as u32 {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => Authentication::MD5Password { salt: body.try_i32()?.to_be_bytes() },
            7 => Authentication::GSS,
            8 => Authentication::GSSContinue { data: body },
            9 => Authentication::SSPI,
            10 => Authentication::SASL { mechanisms: body },
            11 => Authentication::SASLContinue { data: body },
            12 => Authentication::SASLFinal { data: body },
            auth => return Err(ProtocolError::unknown_auth(auth)),
        };
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue CancelRequest messages later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: u32,
    /// The secret key of this backend.
    pub secret_key: u32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            process_id: body.try_i32()? as u32,
            secret_key: body.try_i32()? as u32,
        })
    }
}

/// Identifies the message as a run-time parameter status report
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported
    pub name: ByteStr,
    /// The current value of the parameter
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            name: body.get_nul_bytestr()?,
            value: body.get_nul_bytestr()?,
        })
    }
}

/// A warning message. The frontend should display the message.
#[derive(Debug)]
pub struct NoticeResponse {
    pub body: Bytes,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';

    /// Parse the notice fields.
    pub fn to_db_error(&self) -> Result<DbError, ProtocolError> {
        DbError::parse(self.body.clone())
    }
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(NoticeResponse { body })
    }
}

/// Identifies the message as an error
///
/// The message body consists of one or more identified fields, followed by a zero byte as a terminator.
/// Parse them with [`ErrorResponse::to_db_error`].
#[derive(Debug)]
pub struct ErrorResponse {
    pub body: Bytes,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';

    /// Parse the error fields.
    pub fn to_db_error(&self) -> Result<DbError, ProtocolError> {
        DbError::parse(self.body.clone())
    }
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { body })
    }
}

/// Identifies the message as a notification response.
#[derive(Debug)]
pub struct NotificationResponse {
    /// The process ID of the notifying backend process.
    pub process_id: u32,
    /// The name of the channel that the notify has been raised on.
    pub channel: ByteStr,
    /// The “payload” string passed from the notifying process.
    pub payload: ByteStr,
}

impl NotificationResponse {
    pub const MSGTYPE: u8 = b'A';
}

impl BackendProtocol for NotificationResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            process_id: body.try_i32()? as u32,
            channel: body.get_nul_bytestr()?,
            payload: body.get_nul_bytestr()?,
        })
    }
}

/// Identifies the message as a row description
#[derive(Debug)]
pub struct RowDescription {
    /// Specifies the number of fields in a row (can be zero).
    pub field_len: u16,
    /// Undecoded response body.
    pub body: Bytes,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            field_len: body.try_i16()? as u16,
            body,
        })
    }
}

/// Identifies the message as a data row.
#[derive(Debug)]
pub struct DataRow {
    /// The number of column values that follow (possibly zero).
    pub column_len: u16,
    pub body: Bytes,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';

    /// Split the row into its column values, [`None`] is NULL.
    pub fn into_values(mut self) -> Result<Vec<Option<Bytes>>, ProtocolError> {
        let mut values = Vec::with_capacity(self.column_len as usize);
        for _ in 0..self.column_len {
            let len = self.body.try_i32()?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(self.body.try_split_to(len as usize)?));
            }
        }
        Ok(values)
    }
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            column_len: body.try_i16()? as u16,
            body,
        })
    }
}

/// Identifies the message as a command-completed response
///
/// The tag is usually a single word that identifies which SQL command was completed,
/// followed by a row count for `INSERT`, `DELETE`, `UPDATE`, `MERGE`, `SELECT`,
/// `MOVE`, `FETCH` and `COPY`.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            tag: body.get_nul_bytestr()?,
        })
    }
}

/// Identifies the message as a protocol version negotiation message.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported by the server for the major protocol version requested by the client.
    pub minor: u32,
    /// Number of protocol options not recognized by the server.
    pub len: u32,
    /// Then, for protocol option not recognized by the server, there is the following:
    pub opt_names: Bytes,
}

impl NegotiateProtocolVersion {
    pub const MSGTYPE: u8 = b'v';
}

impl BackendProtocol for NegotiateProtocolVersion {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            minor: body.try_i32()? as u32,
            len: body.try_i32()? as u32,
            opt_names: body,
        })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug)]
pub struct ParameterDescription {
    /// The object ID of each parameter data type.
    pub oids: Vec<u32>,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let len = body.try_i16()? as u16;
        let mut oids = Vec::with_capacity(len as usize);
        for _ in 0..len {
            oids.push(body.try_i32()? as u32);
        }
        Ok(Self { oids })
    }
}

/// Identifies the message as a Start Copy In response.
///
/// The frontend must now send copy-in data (if not prepared to do so, send a CopyFail message).
#[derive(Debug)]
pub struct CopyInResponse {
    /// Overall COPY format.
    pub format: PgFormat,
    /// The format of each column.
    pub column_formats: Vec<PgFormat>,
}

impl CopyInResponse {
    pub const MSGTYPE: u8 = b'G';
}

/// Identifies the message as a Start Copy Out response.
#[derive(Debug)]
pub struct CopyOutResponse {
    pub format: PgFormat,
    pub column_formats: Vec<PgFormat>,
}

impl CopyOutResponse {
    pub const MSGTYPE: u8 = b'H';
}

/// Identifies the message as a Start Copy Both response.
///
/// This message is used only for Streaming Replication.
#[derive(Debug)]
pub struct CopyBothResponse {
    pub format: PgFormat,
    pub column_formats: Vec<PgFormat>,
}

impl CopyBothResponse {
    pub const MSGTYPE: u8 = b'W';
}

macro_rules! copy_response {
    ($($name:ident,)*) => {$(
        impl BackendProtocol for $name {
            fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!(msgtype);
                let format = PgFormat::from_code(body.try_u8()? as i16);
                let len = body.try_i16()? as u16;
                let mut column_formats = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    column_formats.push(PgFormat::from_code(body.try_i16()?));
                }
                Ok(Self { format, column_formats })
            }
        }
    )*};
}

copy_response! {
    CopyInResponse,
    CopyOutResponse,
    CopyBothResponse,
}

/// Identifies the message as COPY data.
#[derive(Debug)]
pub struct CopyData {
    /// Data that forms part of a COPY data stream.
    pub data: Bytes,
}

impl CopyData {
    pub const MSGTYPE: u8 = b'd';
}

impl BackendProtocol for CopyData {
    fn decode(msgtype: u8, data: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { data })
    }
}

/// Identifies the message as the transaction status indicator.
#[derive(Debug)]
pub struct ReadyForQuery {
    /// Current backend transaction status indicator.
    ///
    /// Possible values are 'I' if idle (not in a transaction block);
    /// 'T' if in a transaction block; or 'E' if in a failed transaction block.
    pub tx_status: u8,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { tx_status: body.try_u8()? })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
            $(#[$doc])*
            #[derive(Debug)]
            pub struct $name;

            impl $name {
                pub const MSGTYPE: u8 = $ty;
            }

            impl BackendProtocol for $name {
                fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
                    assert_msgtype!(msgtype);
                    Ok(Self)
                }
            }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// Identifies the message as a COPY-complete indicator.
    struct CopyDone, b'c';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    ///
    /// Note this only appears if an Execute message's row-count limit was reached.
    struct PortalSuspended, b's';
}

/// Streaming replication messages carried inside [`CopyData`].
///
/// <https://www.postgresql.org/docs/current/protocol-replication.html>
#[derive(Debug)]
pub enum ReplicationMessage {
    /// WAL data.
    XLogData {
        /// The starting point of the WAL data in this message.
        start: u64,
        /// The current end of WAL on the server.
        end: u64,
        /// The server's system clock at the time of transmission,
        /// as microseconds since midnight on 2000-01-01.
        time: i64,
        /// A section of the WAL data stream.
        data: Bytes,
    },
    /// Sender keepalive.
    PrimaryKeepAlive {
        /// The current end of WAL on the server.
        wal_end: u64,
        time: i64,
        /// The client should reply to this message as soon as possible, to avoid a timeout disconnect.
        reply: bool,
    },
}

impl ReplicationMessage {
    pub fn parse(mut data: Bytes) -> Result<Self, ProtocolError> {
        match data.try_u8()? {
            b'w' => Ok(Self::XLogData {
                start: data.try_i64()? as u64,
                end: data.try_i64()? as u64,
                time: data.try_i64()?,
                data,
            }),
            b'k' => Ok(Self::PrimaryKeepAlive {
                wal_end: data.try_i64()? as u64,
                time: data.try_i64()?,
                reply: data.try_u8()? == 1,
            }),
            tag => Err(ProtocolError::malformed(format!(
                "unknown replication message `{}`",
                tag as char
            ))),
        }
    }
}
