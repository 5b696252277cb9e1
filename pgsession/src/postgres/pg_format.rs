/// Format code of a parameter or result column.
///
/// The session asks for [`Binary`][PgFormat::Binary] wherever its
/// [`TypeRegistry`][crate::types::TypeRegistry] has a binary codec, every other
/// value travels as text.
///
/// <https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PgFormat {
    /// Code `0`, the textual form without a trailing nul.
    Text,
    /// Code `1`, type specific, integers in network byte order.
    Binary,
}

impl PgFormat {
    pub fn format_code(&self) -> u16 {
        *self as u16
    }

    /// Anything other than `1` is read as text.
    pub fn from_code(code: i16) -> PgFormat {
        match code {
            1 => PgFormat::Binary,
            _ => PgFormat::Text,
        }
    }

    /// Shortest format list that the server reads the same as `formats`.
    ///
    /// An empty list means all text, a single code applies to every column.
    pub fn compact(formats: &[PgFormat]) -> &[PgFormat] {
        match formats.split_first() {
            Some((first, rest)) if rest.iter().all(|f| f == first) => match first {
                PgFormat::Text => &[],
                PgFormat::Binary => &formats[..1],
            },
            _ => formats,
        }
    }
}

#[cfg(test)]
mod test {
    use super::PgFormat::{self, Binary, Text};

    #[test]
    fn codes() {
        assert_eq!(Text.format_code(), 0);
        assert_eq!(Binary.format_code(), 1);
        assert_eq!(PgFormat::from_code(1), Binary);
        assert_eq!(PgFormat::from_code(0), Text);
        assert_eq!(PgFormat::from_code(-1), Text);
    }

    #[test]
    fn compact_uniform_lists() {
        assert!(PgFormat::compact(&[]).is_empty());
        assert!(PgFormat::compact(&[Text, Text]).is_empty());
        assert_eq!(PgFormat::compact(&[Binary, Binary, Binary]), &[Binary]);
        assert_eq!(PgFormat::compact(&[Binary, Text]), &[Binary, Text]);
    }
}
