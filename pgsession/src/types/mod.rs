//! Per connection type registry.
//!
//! Every connection owns a [`TypeRegistry`] mapping type [`Oid`] to a [`Codec`].
//! Built-in codecs cover the core scalar types:
//!
//! - `bool`, `int2`, `int4`, `int8`, `oid`, `float4`, `float8`
//! - `text`, `varchar`, `bpchar`, `name`, `char`, `unknown`
//! - `bytea`
//! - `json` and `jsonb`, requires `json` feature
//! - `timestamp` and `timestamptz`, requires `time` feature
//!
//! Types installed by extensions have per database oids. Register them by name with
//! [`TypeRegistry::register`], the oid is resolved from `pg_type` when the type cache
//! is refreshed.
use bytes::{BufMut, Bytes, BytesMut};
use std::{borrow::Cow, collections::HashMap, fmt, str::Utf8Error, string::FromUtf8Error, sync::Arc};

use crate::{
    common::ByteStr,
    postgres::{Oid, PgFormat, oid},
    value::Value,
};

#[cfg(feature = "json")]
mod json;
#[cfg(feature = "json")]
pub use json::{Json, JsonCodec};

#[cfg(feature = "time")]
pub(crate) mod time;
#[cfg(feature = "time")]
pub use time::TimestampCodec;

/// Encode and decode one postgres type.
pub trait Codec: Send + Sync + 'static {
    /// Write `value` into `buf`, returns the format written.
    ///
    /// [`Value::Null`] never reach the codec.
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<PgFormat, EncodeError>;

    /// Read a non NULL value in the given format.
    fn decode(&self, format: PgFormat, raw: &[u8]) -> Result<Value, DecodeError>;

    /// Format to request for result columns of this type.
    fn result_format(&self) -> PgFormat {
        PgFormat::Binary
    }
}

/// Reference to a type in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeRef<'a> {
    /// Type by name, e.g. `int4` or `hstore`.
    Name(&'a str),
    /// Array of a named type, resolved through `_name`.
    Array(&'a str),
    /// Type by oid, possibly unknown to the registry.
    Oid(Oid),
}

/// Mapping from type to [`Codec`].
#[derive(Clone)]
pub struct TypeRegistry {
    codecs: HashMap<Oid, Arc<dyn Codec>>,
    names: HashMap<ByteStr, Oid>,
    dynamic: Vec<(ByteStr, Arc<dyn Codec>)>,
}

impl TypeRegistry {
    /// Registry with the built-in codecs.
    pub fn new() -> TypeRegistry {
        let mut me = TypeRegistry {
            codecs: HashMap::new(),
            names: HashMap::new(),
            dynamic: Vec::new(),
        };

        for (name, oid) in [
            ("bool", oid::BOOL),
            ("bytea", oid::BYTEA),
            ("char", oid::CHAR),
            ("name", oid::NAME),
            ("int8", oid::INT8),
            ("int2", oid::INT2),
            ("int4", oid::INT4),
            ("text", oid::TEXT),
            ("oid", oid::OID),
            ("float4", oid::FLOAT4),
            ("float8", oid::FLOAT8),
            ("unknown", oid::UNKNOWN),
            ("bpchar", oid::BPCHAR),
            ("varchar", oid::VARCHAR),
        ] {
            me.names.insert(ByteStr::from_static(name), oid);
            me.codecs.insert(oid, Arc::new(Scalar(oid)));
        }

        #[cfg(feature = "json")]
        for (name, oid) in [("json", oid::JSON), ("jsonb", oid::JSONB)] {
            me.names.insert(ByteStr::from_static(name), oid);
            me.codecs.insert(oid, Arc::new(JsonCodec));
        }

        #[cfg(feature = "time")]
        for (name, oid, codec) in [
            ("timestamp", oid::TIMESTAMP, TimestampCodec::TIMESTAMP),
            ("timestamptz", oid::TIMESTAMPTZ, TimestampCodec::TIMESTAMPTZ),
        ] {
            me.names.insert(ByteStr::from_static(name), oid);
            me.codecs.insert(oid, Arc::new(codec));
        }

        me
    }

    /// Register codec by type name.
    ///
    /// Names with a fixed oid take effect immediately, others once resolved
    /// by a type cache refresh.
    pub fn register(&mut self, type_name: impl Into<ByteStr>, codec: Arc<dyn Codec>) {
        let type_name = type_name.into();
        match self.names.get(&type_name) {
            Some(oid) if !self.is_dynamic(&type_name) => {
                self.codecs.insert(*oid, codec);
            },
            _ => {
                self.dynamic.retain(|(name, _)| name != &type_name);
                self.dynamic.push((type_name, codec));
            },
        }
    }

    /// Register codec by oid.
    pub fn register_oid(&mut self, oid: Oid, codec: Arc<dyn Codec>) {
        self.codecs.insert(oid, codec);
    }

    /// Find the codec for a type.
    pub fn lookup(&self, ty: TypeRef) -> Option<&Arc<dyn Codec>> {
        let oid = match ty {
            TypeRef::Name(name) => *self.names.get(name)?,
            TypeRef::Array(name) => *self.names.get(format!("_{name}").as_str())?,
            TypeRef::Oid(oid) => oid,
        };
        self.codecs.get(&oid)
    }

    /// Resolved oid of a type name.
    pub fn oid_of(&self, type_name: &str) -> Option<Oid> {
        self.names.get(type_name).copied()
    }

    fn is_dynamic(&self, type_name: &str) -> bool {
        self.dynamic.iter().any(|(name, _)| name == type_name)
    }

    /// Names that need a `pg_type` lookup.
    pub(crate) fn dynamic_names(&self) -> Vec<ByteStr> {
        self.dynamic.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Record the oid of a dynamic type found in `pg_type`.
    pub(crate) fn resolve(&mut self, type_name: &str, oid: Oid, array_oid: Option<Oid>) {
        let Some((name, codec)) = self.dynamic.iter().find(|(name, _)| name == type_name) else {
            return;
        };
        if let Some(array_oid) = array_oid.filter(|oid| *oid != 0) {
            self.names.insert(format!("_{name}").into(), array_oid);
        }
        self.names.insert(name.clone(), oid);
        self.codecs.insert(oid, codec.clone());
    }

    /// Format to request for a result column.
    pub fn result_format(&self, oid: Oid) -> PgFormat {
        self.codecs.get(&oid).map_or(PgFormat::Text, |codec| codec.result_format())
    }

    /// Encode one parameter for a statement parameter of type `oid`.
    ///
    /// Types without codec are sent in text format for the server to parse.
    pub fn encode(&self, oid: Oid, value: &Value) -> Result<(PgFormat, Option<Bytes>), EncodeError> {
        if value.is_null() {
            return Ok((PgFormat::Binary, None));
        }
        match self.codecs.get(&oid) {
            Some(codec) => {
                let mut buf = BytesMut::new();
                let format = codec.encode(value, &mut buf)?;
                Ok((format, Some(buf.freeze())))
            },
            None => {
                let text = value.to_text().unwrap_or_default();
                Ok((PgFormat::Text, Some(text.into())))
            },
        }
    }

    /// Encode parameters for statement parameter types `oids`.
    ///
    /// Caller is responsible for checking that lengths are equal.
    pub(crate) fn encode_params(
        &self,
        oids: &[Oid],
        values: &[Value],
    ) -> Result<(Vec<PgFormat>, Vec<Option<Bytes>>), EncodeError> {
        let mut formats = Vec::with_capacity(values.len());
        let mut params = Vec::with_capacity(values.len());
        for (oid, value) in oids.iter().zip(values) {
            let (format, param) = self.encode(*oid, value)?;
            formats.push(format);
            params.push(param);
        }
        Ok((formats, params))
    }

    /// Decode one column value, [`None`] is NULL.
    ///
    /// Types without codec decode into [`Value::Text`] or [`Value::Bytea`] by format.
    pub fn decode(&self, oid: Oid, format: PgFormat, raw: Option<&[u8]>) -> Result<Value, DecodeError> {
        let Some(raw) = raw else {
            return Ok(Value::Null);
        };
        match (self.codecs.get(&oid), format) {
            (Some(codec), format) => codec.decode(format, raw),
            (None, PgFormat::Text) => Ok(Value::Text(std::str::from_utf8(raw)?.to_owned())),
            (None, PgFormat::Binary) => Ok(Value::Bytea(Bytes::copy_from_slice(raw))),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.codecs.len())
            .field("dynamic", &self.dynamic_names())
            .finish()
    }
}

/// Built-in codec for core scalar types, keyed by its oid.
struct Scalar(Oid);

fn is_text_like(oid: Oid) -> bool {
    matches!(oid, oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME | oid::CHAR | oid::UNKNOWN)
}

macro_rules! int_to {
    ($value:expr, $ty:ty) => {
        match $value {
            Value::Int2(i) => <$ty>::try_from(*i).ok(),
            Value::Int4(i) => <$ty>::try_from(*i).ok(),
            Value::Int8(i) => <$ty>::try_from(*i).ok(),
            Value::Oid(i) => <$ty>::try_from(*i).ok(),
            _ => None,
        }
    };
}

macro_rules! be {
    ($raw:ident, $ty:ty) => {{
        let Ok(be) = <[u8; size_of::<$ty>()]>::try_from($raw) else {
            return Err(DecodeError::Malformed(concat!("invalid ", stringify!($ty), " length").into()));
        };
        <$ty>::from_be_bytes(be)
    }};
}

impl Codec for Scalar {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<PgFormat, EncodeError> {
        let oid = self.0;
        match (oid, value) {
            (oid::BOOL, Value::Bool(b)) => buf.put_u8(*b as u8),
            (oid::INT2, v) if int_to!(v, i16).is_some() => buf.put_i16(int_to!(v, i16).unwrap_or_default()),
            (oid::INT4, v) if int_to!(v, i32).is_some() => buf.put_i32(int_to!(v, i32).unwrap_or_default()),
            (oid::INT8, v) if int_to!(v, i64).is_some() => buf.put_i64(int_to!(v, i64).unwrap_or_default()),
            (oid::OID, v) if int_to!(v, u32).is_some() => buf.put_u32(int_to!(v, u32).unwrap_or_default()),
            (oid::FLOAT4, Value::Float4(f)) => buf.put_f32(*f),
            (oid::FLOAT8, Value::Float4(f)) => buf.put_f64((*f).into()),
            (oid::FLOAT8, Value::Float8(f)) => buf.put_f64(*f),
            (oid::BYTEA, Value::Bytea(b)) => buf.put_slice(b),
            (oid, Value::Text(s)) if is_text_like(oid) => buf.put_slice(s.as_bytes()),
            // let the server parse it
            (_, Value::Text(s)) => {
                buf.put_slice(s.as_bytes());
                return Ok(PgFormat::Text);
            },
            (oid, value) => return Err(EncodeError::mismatch(value.kind(), oid)),
        }
        Ok(PgFormat::Binary)
    }

    fn decode(&self, format: PgFormat, raw: &[u8]) -> Result<Value, DecodeError> {
        let oid = self.0;
        let value = match format {
            PgFormat::Binary => match oid {
                oid::BOOL => Value::Bool(be!(raw, u8) != 0),
                oid::INT2 => Value::Int2(be!(raw, i16)),
                oid::INT4 => Value::Int4(be!(raw, i32)),
                oid::INT8 => Value::Int8(be!(raw, i64)),
                oid::OID => Value::Oid(be!(raw, u32)),
                oid::FLOAT4 => Value::Float4(be!(raw, f32)),
                oid::FLOAT8 => Value::Float8(be!(raw, f64)),
                oid::BYTEA => Value::Bytea(Bytes::copy_from_slice(raw)),
                _ => Value::Text(std::str::from_utf8(raw)?.to_owned()),
            },
            PgFormat::Text => {
                let text = std::str::from_utf8(raw)?;
                match oid {
                    oid::BOOL => Value::Bool(text == "t"),
                    oid::INT2 => Value::Int2(text.parse().map_err(DecodeError::parse)?),
                    oid::INT4 => Value::Int4(text.parse().map_err(DecodeError::parse)?),
                    oid::INT8 => Value::Int8(text.parse().map_err(DecodeError::parse)?),
                    oid::OID => Value::Oid(text.parse().map_err(DecodeError::parse)?),
                    oid::FLOAT4 => Value::Float4(text.parse().map_err(DecodeError::parse)?),
                    oid::FLOAT8 => Value::Float8(text.parse().map_err(DecodeError::parse)?),
                    oid::BYTEA => Value::Bytea(decode_hex(text)?),
                    _ => Value::Text(text.to_owned()),
                }
            },
        };
        Ok(value)
    }
}

fn decode_hex(text: &str) -> Result<Bytes, DecodeError> {
    let Some(hex) = text.strip_prefix("\\x") else {
        return Err(DecodeError::Malformed("bytea is not in hex format".into()));
    };
    let hex = hex.as_bytes();
    if hex.len() % 2 != 0 {
        return Err(DecodeError::Malformed("odd bytea hex length".into()));
    }
    let mut out = BytesMut::with_capacity(hex.len() / 2);
    for pair in hex.chunks(2) {
        let pair = std::str::from_utf8(pair)?;
        out.put_u8(u8::from_str_radix(pair, 16).map_err(DecodeError::parse)?);
    }
    Ok(out.freeze())
}

/// Text passthrough codec.
///
/// Values are sent and received in text format, suitable for types whose text form is
/// all the application needs, such as `citext` and `hstore`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<PgFormat, EncodeError> {
        match value.to_text() {
            Some(text) => buf.put_slice(text.as_bytes()),
            None => return Err(EncodeError::mismatch(value.kind(), oid::TEXT)),
        }
        Ok(PgFormat::Text)
    }

    fn decode(&self, _: PgFormat, raw: &[u8]) -> Result<Value, DecodeError> {
        Ok(Value::Text(std::str::from_utf8(raw)?.to_owned()))
    }

    fn result_format(&self) -> PgFormat {
        PgFormat::Text
    }
}

/// An error when encoding parameter value.
pub struct EncodeError {
    reason: Cow<'static, str>,
}

impl EncodeError {
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }

    pub(crate) fn mismatch(kind: &str, oid: Oid) -> Self {
        Self::new(format!("cannot encode {kind} as type oid {oid}"))
    }
}

impl std::error::Error for EncodeError { }

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to encode value, {}", self.reason)
    }
}

impl fmt::Debug for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for DecodeError {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

/// An error when decoding row value.
pub enum DecodeError {
    /// Postgres return non utf8 string.
    Utf8(Utf8Error),
    /// Column requested not found.
    ColumnNotFound(Cow<'static, str>),
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// Value is not of the requested type.
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// Value is NULL.
    Null,
    /// Value bytes are invalid for its type.
    Malformed(Cow<'static, str>),
    /// Failed to deserialize using `serde_json`.
    #[cfg(feature = "json")]
    Json(serde_json::error::Error),
}

impl DecodeError {
    fn parse(err: impl fmt::Display) -> Self {
        Self::Malformed(err.to_string().into())
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::Utf8(e) => write!(f, "{e}"),
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds(u) => write!(f, "index out of bounds: {u:?}"),
            Self::TypeMismatch { expected, found } => write!(f, "expected {expected} found {found}"),
            Self::Null => write!(f, "unexpected NULL value"),
            Self::Malformed(reason) => f.write_str(reason),
            #[cfg(feature = "json")]
            Self::Json(e) => write!(f, "{e}"),
        }
    }
}

from!(<Utf8Error>e => Self::Utf8(e));
from!(<FromUtf8Error>e => Self::Utf8(e.utf8_error()));
#[cfg(feature = "json")]
from!(<serde_json::error::Error>e => Self::Json(e));

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
