//! `COPY FROM STDIN`.
//!
//! The session moves from [`CopyState::Normal`] into copy-in mode on `CopyInResponse`.
//! A server error received while in copy-in mode aborts the COPY: it is reported through
//! [`AsyncMessage::CopyError`] and the next [`Client::copy_done`] returns it.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-COPY>
//!
//! [`AsyncMessage::CopyError`]: crate::AsyncMessage::CopyError
use bytes::{BufMut, Bytes, BytesMut};
use std::{fmt, time::Duration};

use crate::{
    Client, Result,
    command::{Command, call},
    common::{ByteStr, logging, verbose},
    error::{ParamMismatch, StateError, Timeout},
    ext::UsizeExt,
    postgres::{
        BackendMessage, DbError, Oid, PgFormat,
        backend::ReadyForQuery,
        frontend,
    },
    session::{AsyncMessage, Session},
    transport::PgTransport,
    types::EncodeError,
    value::Value,
};

/// Binary COPY signature, flags and header extension length.
const BINARY_HEADER: &[u8] = b"PGCOPY\n\xff\r\n\0\0\0\0\0\0\0\0\0";

/// Binary COPY trailer, a tuple with field count -1.
const BINARY_TRAILER: &[u8] = &[0xff, 0xff];

/// CopyData chunk size for encoded rows.
const CHUNK: usize = 64 * 1024;

/// Data format of a COPY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyFormat {
    Text,
    /// Binary, with the type of each column.
    Binary(Vec<Oid>),
}

pub(crate) enum CopyState {
    Normal,
    /// Waiting for data, `types` is [`Some`] for binary format.
    CopyIn { types: Option<Vec<Oid>> },
    /// The server aborted the COPY.
    CopyError(DbError),
}

impl CopyState {
    pub(crate) fn is_copy_in(&self) -> bool {
        matches!(self, CopyState::CopyIn { .. })
    }
}

impl fmt::Debug for CopyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("Normal"),
            Self::CopyIn { types: None } => f.write_str("CopyIn(text)"),
            Self::CopyIn { types: Some(_) } => f.write_str("CopyIn(binary)"),
            Self::CopyError(err) => write!(f, "CopyError({})", err.code()),
        }
    }
}

/// COPY misuse or abort.
#[derive(Clone, PartialEq, Eq)]
pub enum CopyError {
    /// No COPY is in progress.
    NotInCopyMode,
    /// Rows can only be sent in a binary COPY.
    NotBinaryFormat,
    /// The server rejected earlier data.
    Aborted,
    /// The server format differs from the requested one.
    FormatMismatch,
}

impl std::error::Error for CopyError { }

impl fmt::Display for CopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInCopyMode => f.write_str("no COPY in progress"),
            Self::NotBinaryFormat => f.write_str("COPY is not in binary format"),
            Self::Aborted => f.write_str("COPY aborted by the server"),
            Self::FormatMismatch => f.write_str("COPY format differs from the requested format"),
        }
    }
}

impl fmt::Debug for CopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl<IO: PgTransport> Session<IO> {
    pub(crate) fn copy_aborted(&mut self, err: DbError) {
        logging!(warn, "COPY aborted: {err}");
        self.copy = CopyState::CopyError(err.clone());
        self.send_async(AsyncMessage::CopyError(err));
    }

    /// Run a `COPY ... FROM STDIN` statement and enter copy-in mode.
    pub(crate) async fn copy_from_stdin(&mut self, sql: &str, format: CopyFormat) -> Result<Vec<PgFormat>> {
        self.io.send(frontend::Query { sql });
        self.flush().await?;

        let response = loop {
            match self.recv().await {
                Ok(BackendMessage::CopyInResponse(response)) => break response,
                // rows or status of a statement that is not COPY
                Ok(BackendMessage::ReadyForQuery(_)) => {
                    return Err(StateError { reason: "statement is not COPY FROM STDIN" }.into());
                },
                Ok(_) => { },
                Err(err) => return Err(self.ready_after(err).await),
            }
        };

        let types = match format {
            CopyFormat::Binary(types)
                if response.format == PgFormat::Binary && types.len() == response.column_formats.len() =>
            {
                Some(types)
            },
            CopyFormat::Text if response.format == PgFormat::Text => None,
            _ => {
                self.io.send(frontend::CopyFail { message: "COPY format mismatch" });
                self.flush().await?;
                self.wait_ready().await?;
                return Err(CopyError::FormatMismatch.into());
            },
        };

        if types.is_some() {
            self.io.send(frontend::CopyData { data: BINARY_HEADER });
            self.flush().await?;
        }
        verbose!("copy in, {} columns", response.column_formats.len());
        self.copy = CopyState::CopyIn { types };
        Ok(response.column_formats)
    }

    /// Encode and send rows of a binary COPY.
    pub(crate) async fn copy_send_rows(&mut self, rows: &[Vec<Value>], timeout: Duration) -> Result<()> {
        let types = match &self.copy {
            CopyState::Normal => return Err(CopyError::NotInCopyMode.into()),
            CopyState::CopyError(_) => return Err(CopyError::Aborted.into()),
            CopyState::CopyIn { types: None } => return Err(CopyError::NotBinaryFormat.into()),
            CopyState::CopyIn { types: Some(types) } => types.clone(),
        };
        for row in rows {
            ParamMismatch::check(types.len(), row.len())?;
        }

        let mut buf = BytesMut::with_capacity(CHUNK);
        for row in rows {
            buf.put_u16(row.len().to_u16());
            for (oid, value) in types.iter().zip(row) {
                match self.registry.encode(*oid, value)? {
                    (_, None) => buf.put_i32(-1),
                    (PgFormat::Binary, Some(field)) => {
                        buf.put_u32(field.len().to_u32());
                        buf.put_slice(&field);
                    },
                    (PgFormat::Text, Some(_)) => {
                        return Err(EncodeError::new(format!("no binary encoding of {} for oid {oid}", value.kind())).into());
                    },
                }
            }
        }

        // nothing is written until every row is encoded
        for chunk in buf.chunks(CHUNK) {
            self.io.send(frontend::CopyData { data: chunk });
        }

        match tokio::time::timeout(timeout, self.flush()).await {
            Ok(flushed) => flushed?,
            Err(_) => {
                logging!(error, "COPY write timed out after {timeout:?}");
                return Err(Timeout.into());
            },
        }
        self.poll_async().await
    }

    /// Send raw COPY data.
    pub(crate) async fn copy_send_data(&mut self, data: Bytes) -> Result<()> {
        match &self.copy {
            CopyState::Normal => return Err(CopyError::NotInCopyMode.into()),
            CopyState::CopyError(_) => return Err(CopyError::Aborted.into()),
            CopyState::CopyIn { .. } => { },
        }
        self.io.send(frontend::CopyData { data: &data });
        self.flush().await?;
        self.poll_async().await
    }

    /// Handle whatever the server already sent, without waiting.
    async fn poll_async(&mut self) -> Result<()> {
        while let Some(message) = self.try_recv().await? {
            self.unsolicited(message).await?;
        }
        Ok(())
    }

    /// Finish the COPY, returning the number of rows copied.
    pub(crate) async fn copy_done(&mut self) -> Result<u64> {
        let binary = match std::mem::replace(&mut self.copy, CopyState::Normal) {
            CopyState::Normal => return Err(CopyError::NotInCopyMode.into()),
            CopyState::CopyError(err) => return Err(err.into()),
            CopyState::CopyIn { types } => types.is_some(),
        };

        if binary {
            self.io.send(frontend::CopyData { data: BINARY_TRAILER });
        }
        self.io.send(frontend::CopyDone);
        self.flush().await?;

        let read = async {
            let rows = loop {
                if let BackendMessage::CommandComplete(_) = self.recv().await? {
                    break self.last_status.as_ref().map_or(0, |status| status.rows());
                }
            };
            self.recv_as::<ReadyForQuery>().await?;
            Ok(rows)
        };
        match read.await {
            Ok(rows) => Ok(rows),
            Err(err) => Err(self.ready_after(err).await),
        }
    }

    /// Abort the COPY.
    pub(crate) async fn copy_fail(&mut self, reason: &str) -> Result<()> {
        match std::mem::replace(&mut self.copy, CopyState::Normal) {
            CopyState::Normal => Err(CopyError::NotInCopyMode.into()),
            CopyState::CopyError(_) => Ok(()),
            CopyState::CopyIn { .. } => {
                self.io.send(frontend::CopyFail { message: reason });
                self.flush().await?;
                self.wait_ready().await
            },
        }
    }
}

impl Client {
    /// Run a `COPY ... FROM STDIN` statement, returning the format of each column.
    ///
    /// With [`CopyFormat::Binary`] the server must answer in binary format with as many
    /// columns as given types, otherwise the COPY is aborted with [`CopyError::FormatMismatch`].
    ///
    /// Until [`Client::copy_done`] or [`Client::copy_fail`], only COPY commands are accepted.
    pub async fn copy_from_stdin(&self, sql: &str, format: CopyFormat) -> Result<Vec<PgFormat>> {
        call!(self, Command::CopyFromStdin { sql: ByteStr::copy_from_str(sql), format } => Formats)
    }

    /// Send rows of a binary COPY, waiting at most `timeout` for the write.
    ///
    /// A timeout closes the connection.
    pub async fn copy_send_rows(&self, rows: Vec<Vec<Value>>, timeout: Duration) -> Result<()> {
        call!(self, Command::CopyRows { rows, timeout } => Unit)
    }

    /// Send raw COPY data, usually text format lines.
    pub async fn copy_send_data(&self, data: impl Into<Bytes>) -> Result<()> {
        call!(self, Command::CopyData { data: data.into() } => Unit)
    }

    /// Finish the COPY, returning the number of rows copied.
    ///
    /// If the server aborted the COPY, its error is returned.
    pub async fn copy_done(&self) -> Result<u64> {
        call!(self, Command::CopyDone => Count)
    }

    pub async fn copy_fail(&self, reason: &str) -> Result<()> {
        call!(self, Command::CopyFail { reason: ByteStr::copy_from_str(reason) } => Unit)
    }
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{Config, ErrorKind, postgres::oid, testing};

    const TIMEOUT: Duration = Duration::from_millis(5000);

    #[tokio::test]
    async fn binary_copy_counts_rows() {
        let (client, server) = testing::client().await;

        let formats = client
            .copy_from_stdin("COPY t (id) FROM STDIN (FORMAT BINARY)", CopyFormat::Binary(vec![oid::INT4]))
            .await
            .unwrap();
        assert_eq!(formats, [PgFormat::Binary]);

        client
            .copy_send_rows(vec![vec![Value::Int4(1)], vec![Value::Int4(2)]], TIMEOUT)
            .await
            .unwrap();
        assert_eq!(client.copy_done().await.unwrap(), 2);

        let data: Vec<Bytes> = server.frames().into_iter().filter(|f| f.0 == b'd').map(|f| f.1).collect();
        assert_eq!(&data[0][..], BINARY_HEADER);
        assert_eq!(&data[1][..], &[0, 1, 0, 0, 0, 4, 0, 0, 0, 1, 0, 1, 0, 0, 0, 4, 0, 0, 0, 2]);
        assert_eq!(&data[2][..], BINARY_TRAILER);

        // back to normal mode
        assert_eq!(client.simple_query("SELECT 1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn text_copy() {
        let (client, _server) = testing::client().await;
        client.copy_from_stdin("COPY t (a, b) FROM STDIN", CopyFormat::Text).await.unwrap();
        client.copy_send_data("1\tone\n2\ttwo\n").await.unwrap();

        let err = client.copy_send_rows(vec![vec![Value::Int4(1)]], TIMEOUT).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Copy(CopyError::NotBinaryFormat)));
        assert_eq!(client.copy_done().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn invalid_data_aborts_copy() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (client, _server) = testing::client_with(Config::new().async_receiver(tx)).await;

        client.copy_from_stdin("COPY t (a) FROM STDIN", CopyFormat::Text).await.unwrap();
        client.copy_send_data("invalid\n").await.unwrap();

        let message = rx.recv().await.unwrap();
        assert!(matches!(message, AsyncMessage::CopyError(ref err) if err.code() == "22P02"), "{message:?}");

        let err = client.copy_send_data("1\n").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Copy(CopyError::Aborted)));

        let err = client.copy_done().await.unwrap_err();
        assert_eq!(err.as_db_error().unwrap().code(), "22P02");

        let err = client.copy_done().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Copy(CopyError::NotInCopyMode)));
    }

    #[tokio::test]
    async fn binary_format_mismatch() {
        let (client, server) = testing::client().await;

        let err = client
            .copy_from_stdin("COPY t (a) FROM STDIN", CopyFormat::Binary(vec![oid::INT4]))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Copy(CopyError::FormatMismatch)));
        assert!(server.frames().iter().any(|f| f.0 == b'f'));

        let err = client
            .copy_from_stdin("COPY t (a, b) FROM STDIN BINARY", CopyFormat::Binary(vec![oid::INT4]))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Copy(CopyError::FormatMismatch)));
    }

    #[tokio::test]
    async fn row_width_checked_before_sending() {
        let (client, server) = testing::client().await;
        client
            .copy_from_stdin("COPY t (a, b) FROM STDIN BINARY", CopyFormat::Binary(vec![oid::INT4, oid::TEXT]))
            .await
            .unwrap();
        let sent = server.frames().len();

        let err = client
            .copy_send_rows(vec![vec![Value::Int4(1), Value::Text("a".into())], vec![Value::Int4(2)]], TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ParamMismatch(ParamMismatch { expected: 2, found: 1 })));
        assert_eq!(server.frames().len(), sent);

        // only COPY commands until the COPY ends
        let err = client.simple_query("SELECT 1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::State(_)));

        client.copy_fail("stop").await.unwrap();
        assert_eq!(client.simple_query("SELECT 1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn encode_failure_sends_no_rows() {
        let (client, server) = testing::client().await;
        client
            .copy_from_stdin("COPY t (id) FROM STDIN BINARY", CopyFormat::Binary(vec![oid::INT4]))
            .await
            .unwrap();
        let sent = server.frames().len();

        // enough rows to fill several chunks before the bad one
        let mut rows: Vec<_> = (0..20_000).map(|i| vec![Value::Int4(i)]).collect();
        rows.push(vec![Value::Bool(true)]);
        let err = client.copy_send_rows(rows, TIMEOUT).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Encode(_)));
        assert_eq!(server.frames().len(), sent);

        assert_eq!(client.copy_done().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn large_rows_are_chunked() {
        let (client, server) = testing::client().await;
        client
            .copy_from_stdin("COPY t (id) FROM STDIN BINARY", CopyFormat::Binary(vec![oid::INT4]))
            .await
            .unwrap();

        let rows: Vec<_> = (0..20_000).map(|i| vec![Value::Int4(i)]).collect();
        client.copy_send_rows(rows, TIMEOUT).await.unwrap();
        assert_eq!(client.copy_done().await.unwrap(), 20_000);

        let data: Vec<Bytes> = server.frames().into_iter().filter(|f| f.0 == b'd').map(|f| f.1).collect();
        // header, 200_000 bytes of rows, trailer
        assert_eq!(data.len(), 1 + 4 + 1);
        assert!(data.iter().all(|d| d.len() <= CHUNK));
    }

    #[tokio::test]
    async fn stalled_write_times_out() {
        let (client, server) = testing::client().await;
        client
            .copy_from_stdin("COPY t (id) FROM STDIN BINARY", CopyFormat::Binary(vec![oid::INT4]))
            .await
            .unwrap();
        server.stall_writes();

        let err = client
            .copy_send_rows(vec![vec![Value::Int4(1)]], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Timeout(_)));

        // the connection is given up
        let err = client.simple_query("SELECT 1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Closed(_)));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn copy_commands_outside_copy() {
        let (client, _server) = testing::client().await;
        let err = client.copy_send_rows(vec![], TIMEOUT).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Copy(CopyError::NotInCopyMode)));
        let err = client.copy_done().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Copy(CopyError::NotInCopyMode)));
    }
}
