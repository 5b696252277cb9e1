use bytes::Bytes;
use std::{borrow::Borrow, fmt, hash, ops::Deref, str::Utf8Error};

/// Shared, immutable utf8 string backed by [`Bytes`].
///
/// Names and tags received from the server are kept as slices of the message
/// body they arrived in.
#[derive(Clone, Default)]
pub struct ByteStr(Bytes);

impl ByteStr {
    /// Validate `bytes` as utf8.
    pub fn from_utf8(bytes: Bytes) -> Result<Self, Utf8Error> {
        std::str::from_utf8(&bytes)?;
        Ok(Self(bytes))
    }

    pub fn copy_from_str(string: &str) -> Self {
        Self(Bytes::copy_from_slice(string.as_bytes()))
    }

    pub const fn from_static(string: &'static str) -> Self {
        Self(Bytes::from_static(string.as_bytes()))
    }

    /// Share the part of `self` that `subset` points into, see [`Bytes::slice_ref`].
    ///
    /// # Panics
    ///
    /// Panics if `subset` is not borrowed from `self`.
    pub fn slice_ref(&self, subset: &str) -> Self {
        Self(self.0.slice_ref(subset.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: every constructor takes a str or validates utf8, and `Bytes` is immutable
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }
}

impl Deref for ByteStr {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for ByteStr {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for ByteStr {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ByteStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl Eq for ByteStr { }

impl hash::Hash for ByteStr {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        // must agree with `Borrow<str>`
        self.as_str().hash(state);
    }
}

macro_rules! eq_str {
    ($($rhs:ty => |$a:ident, $b:ident| $eq:expr;)*) => {$(
        impl PartialEq<$rhs> for ByteStr {
            fn eq(&self, other: &$rhs) -> bool {
                let ($a, $b) = (self.as_str(), other);
                $eq
            }
        }
    )*};
}

eq_str! {
    ByteStr => |a, b| a == b.as_str();
    str => |a, b| a == b;
    &str => |a, b| a == *b;
    String => |a, b| a == b.as_str();
}

impl From<&'static str> for ByteStr {
    fn from(value: &'static str) -> Self {
        Self::from_static(value)
    }
}

impl From<String> for ByteStr {
    fn from(value: String) -> Self {
        Self(Bytes::from(value))
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn slices_share_the_buffer() {
        let url = ByteStr::copy_from_str("postgres://user@localhost/app");
        let (_, db) = url.rsplit_once('/').unwrap();
        let db = url.slice_ref(db);
        assert_eq!(db, "app");
        assert_eq!(db.as_ptr(), url[url.len() - 3..].as_ptr());
    }

    #[test]
    fn rejects_invalid_utf8() {
        assert!(ByteStr::from_utf8(Bytes::from_static(b"\xff\xfe")).is_err());
        assert_eq!(ByteStr::from_utf8(Bytes::from_static(b"ok")).unwrap(), "ok");
    }

    #[test]
    fn lookup_by_str() {
        let mut params = HashMap::new();
        params.insert(ByteStr::from("TimeZone"), ByteStr::from(String::from("UTC")));
        assert_eq!(params.get("TimeZone").map(ByteStr::as_str), Some("UTC"));
        assert_eq!(params["TimeZone"], String::from("UTC"));
    }
}
