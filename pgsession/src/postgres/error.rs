//! Violations of the wire protocol.
use std::{borrow::Cow, fmt};

use super::BackendMessage;

/// The server sent something the session cannot make sense of.
///
/// The connection is unusable afterwards.
pub enum ProtocolError {
    /// Message type that names no backend message.
    UnknownMessage(u8),
    /// Known message that does not belong at this point of the session.
    Unexpected {
        found: u8,
        expected: Option<u8>,
        during: Option<&'static str>,
    },
    /// Authentication request with an unknown method code.
    UnknownAuth(u32),
    /// Message body that does not decode.
    Malformed(Cow<'static, str>),
}

impl ProtocolError {
    pub(crate) fn unknown(msgtype: u8) -> ProtocolError {
        Self::UnknownMessage(msgtype)
    }

    pub(crate) fn unexpected(expected: u8, found: u8) -> ProtocolError {
        Self::Unexpected { found, expected: Some(expected), during: None }
    }

    pub(crate) fn unexpected_during(found: u8, during: &'static str) -> ProtocolError {
        Self::Unexpected { found, expected: None, during: Some(during) }
    }

    pub(crate) fn unknown_auth(code: u32) -> ProtocolError {
        Self::UnknownAuth(code)
    }

    pub(crate) fn malformed(reason: impl Into<Cow<'static, str>>) -> ProtocolError {
        Self::Malformed(reason.into())
    }
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = BackendMessage::message_name;
        match self {
            Self::UnknownMessage(msgtype) => write!(f, "unknown backend message type {:?}", *msgtype as char),
            Self::Unexpected { found, expected, during } => {
                write!(f, "unexpected {}", name(*found))?;
                if let Some(expected) = expected {
                    write!(f, " instead of {}", name(*expected))?;
                }
                match during {
                    Some(during) => write!(f, " during {during}"),
                    None => Ok(()),
                }
            },
            Self::UnknownAuth(code) => write!(f, "unknown authentication request {code}"),
            Self::Malformed(reason) => write!(f, "malformed message, {reason}"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn describes_the_violation() {
        assert_eq!(ProtocolError::unknown(b'!').to_string(), "unknown backend message type '!'");
        assert_eq!(
            ProtocolError::unexpected(b'1', b'n').to_string(),
            "unexpected NoData instead of ParseComplete",
        );
        assert_eq!(
            ProtocolError::unexpected_during(b'Z', "execute").to_string(),
            "unexpected ReadyForQuery during execute",
        );
        assert_eq!(ProtocolError::unknown_auth(99).to_string(), "unknown authentication request 99");
        assert_eq!(
            ProtocolError::malformed("string is not utf8").to_string(),
            "malformed message, string is not utf8",
        );
    }
}
