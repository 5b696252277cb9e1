//! Structured server error and notice report.
use bytes::Bytes;
use std::fmt;

use super::ProtocolError;
use crate::{common::ByteStr, ext::BytesExt};

/// Error or notice severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Fatal,
    Panic,
    Warning,
    Notice,
    Debug,
    Info,
    Log,
}

impl Severity {
    fn parse(s: &str) -> Option<Severity> {
        let severity = match s {
            "ERROR" => Severity::Error,
            "FATAL" => Severity::Fatal,
            "PANIC" => Severity::Panic,
            "WARNING" => Severity::Warning,
            "NOTICE" => Severity::Notice,
            "DEBUG" => Severity::Debug,
            "INFO" => Severity::Info,
            "LOG" => Severity::Log,
            _ => return None,
        };
        Some(severity)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Panic => "PANIC",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Log => "LOG",
        }
    }
}

/// Server report carried by `ErrorResponse` and `NoticeResponse`.
///
/// The message body consists of one or more identified fields, followed by a zero byte as a terminator.
/// Fields can appear in any order. Since more field types might be added in future,
/// frontends should silently ignore fields of unrecognized type.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Clone, PartialEq, Eq)]
pub struct DbError {
    severity: Severity,
    code: ByteStr,
    message: ByteStr,
    detail: Option<ByteStr>,
    hint: Option<ByteStr>,
    position: Option<u32>,
    where_: Option<ByteStr>,
    schema: Option<ByteStr>,
    table: Option<ByteStr>,
    column: Option<ByteStr>,
    constraint: Option<ByteStr>,
    routine: Option<ByteStr>,
}

impl DbError {
    /// Parse the field list of `ErrorResponse` or `NoticeResponse` body.
    pub fn parse(mut body: Bytes) -> Result<DbError, ProtocolError> {
        let mut severity = None;
        let mut localized = None;
        let mut code = None;
        let mut message = None;
        let mut me = DbError {
            severity: Severity::Error,
            code: ByteStr::default(),
            message: ByteStr::default(),
            detail: None,
            hint: None,
            position: None,
            where_: None,
            schema: None,
            table: None,
            column: None,
            constraint: None,
            routine: None,
        };

        loop {
            let field = body.try_u8()?;
            if field == b'\0' {
                break;
            }
            let value = body.get_nul_bytestr()?;
            match field {
                b'V' => severity = Severity::parse(&value),
                b'S' => localized = Some(value),
                b'C' => code = Some(value),
                b'M' => message = Some(value),
                b'D' => me.detail = Some(value),
                b'H' => me.hint = Some(value),
                b'P' => me.position = value.parse().ok(),
                b'W' => me.where_ = Some(value),
                b's' => me.schema = Some(value),
                b't' => me.table = Some(value),
                b'c' => me.column = Some(value),
                b'n' => me.constraint = Some(value),
                b'R' => me.routine = Some(value),
                _ => { },
            }
        }

        // `V` is absent before 9.6, fallback to the possibly localized `S`
        me.severity = match (severity, localized) {
            (Some(s), _) => s,
            (None, Some(s)) => Severity::parse(&s).unwrap_or(Severity::Error),
            (None, None) => return Err(ProtocolError::malformed("error response without severity")),
        };
        me.code = code.ok_or_else(|| ProtocolError::malformed("error response without code"))?;
        me.message = message.ok_or_else(|| ProtocolError::malformed("error response without message"))?;

        Ok(me)
    }

    /// Construct error report, mostly used to fabricate server responses in tests.
    pub fn new(severity: Severity, code: impl Into<ByteStr>, message: impl Into<ByteStr>) -> DbError {
        DbError {
            severity,
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
            where_: None,
            schema: None,
            table: None,
            column: None,
            constraint: None,
            routine: None,
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// The SQLSTATE code for the error.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Error cursor position as an index into the original query string, counted in characters from 1.
    pub fn position(&self) -> Option<u32> {
        self.position
    }

    /// Context in which the error occurred, e.g. a call stack traceback of PL functions.
    pub fn where_(&self) -> Option<&str> {
        self.where_.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    pub fn routine(&self) -> Option<&str> {
        self.routine.as_deref()
    }
}

impl std::error::Error for DbError { }

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity.as_str(), self.message, self.code)?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbError")
            .field("severity", &self.severity)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("detail", &self.detail)
            .field("hint", &self.hint)
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::ext::BufMutExt;

    #[test]
    fn parse_fields() {
        let mut b = BytesMut::new();
        for (k, v) in [(b'S', "ERREUR"), (b'V', "ERROR"), (b'C', "42P01"), (b'M', "relation \"t\" does not exist"), (b'P', "15"), (b'Z', "ignored")] {
            b.put_u8(k);
            b.put_nul_string(v);
        }
        b.put_u8(0);

        let err = DbError::parse(b.freeze()).unwrap();
        assert_eq!(err.severity(), Severity::Error);
        assert_eq!(err.code(), "42P01");
        assert_eq!(err.message(), "relation \"t\" does not exist");
        assert_eq!(err.position(), Some(15));
        assert_eq!(err.detail(), None);
    }

    #[test]
    fn missing_code_is_malformed() {
        let mut b = BytesMut::new();
        b.put_u8(b'V');
        b.put_nul_string("ERROR");
        b.put_u8(b'M');
        b.put_nul_string("oops");
        b.put_u8(0);
        assert!(DbError::parse(b.freeze()).is_err());
    }
}
