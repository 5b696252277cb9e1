//! Dynamic value crossing the codec boundary.
use bytes::Bytes;
use std::fmt::Write;

use crate::types::DecodeError;

/// A postgres value, as encoded into parameters and decoded from rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Oid(u32),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Bytes),
    /// `json` and `jsonb`.
    #[cfg(feature = "json")]
    Json(serde_json::Value),
    /// `timestamp`, date and time.
    #[cfg(feature = "time")]
    Timestamp(time::PrimitiveDateTime),
    /// `timestamptz`, date and time with time zone.
    #[cfg(feature = "time")]
    TimestampTz(time::UtcDateTime),
}

impl Value {
    /// Variant name, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int2(_) => "int2",
            Value::Int4(_) => "int4",
            Value::Int8(_) => "int8",
            Value::Oid(_) => "oid",
            Value::Float4(_) => "float4",
            Value::Float8(_) => "float8",
            Value::Text(_) => "text",
            Value::Bytea(_) => "bytea",
            #[cfg(feature = "json")]
            Value::Json(_) => "json",
            #[cfg(feature = "time")]
            Value::Timestamp(_) => "timestamp",
            #[cfg(feature = "time")]
            Value::TimestampTz(_) => "timestamptz",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Postgres text representation, [`None`] for NULL.
    pub fn to_text(&self) -> Option<String> {
        let text = match self {
            Value::Null => return None,
            Value::Bool(b) => if *b { "t" } else { "f" }.to_owned(),
            Value::Int2(i) => i.to_string(),
            Value::Int4(i) => i.to_string(),
            Value::Int8(i) => i.to_string(),
            Value::Oid(i) => i.to_string(),
            Value::Float4(f) => float_text(*f as f64),
            Value::Float8(f) => float_text(*f),
            Value::Text(s) => s.clone(),
            Value::Bytea(b) => {
                let mut hex = String::with_capacity(2 + b.len() * 2);
                hex.push_str("\\x");
                for byte in b.iter() {
                    let _ = write!(hex, "{byte:02x}");
                }
                hex
            },
            #[cfg(feature = "json")]
            Value::Json(j) => j.to_string(),
            #[cfg(feature = "time")]
            Value::Timestamp(t) => crate::types::time::format_text(*t),
            #[cfg(feature = "time")]
            Value::TimestampTz(t) => {
                let mut text = crate::types::time::format_text(time::PrimitiveDateTime::new(t.date(), t.time()));
                text.push_str("+00");
                text
            },
        };
        Some(text)
    }
}

fn float_text(f: f64) -> String {
    match f {
        f if f.is_nan() => "NaN".to_owned(),
        f if f == f64::INFINITY => "Infinity".to_owned(),
        f if f == f64::NEG_INFINITY => "-Infinity".to_owned(),
        f => f.to_string(),
    }
}

macro_rules! from_native {
    ($($ty:ty => $variant:ident,)*) => {$(
        impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::$variant(value.into())
            }
        }
    )*};
}

from_native! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    u32 => Oid,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    &str => Text,
    Bytes => Bytea,
    Vec<u8> => Bytea,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Json(value)
    }
}

#[cfg(feature = "time")]
from_native! {
    time::PrimitiveDateTime => Timestamp,
    time::UtcDateTime => TimestampTz,
}

/// A type that can be constructed from a [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, DecodeError>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, DecodeError> {
        Ok(value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::Null => Ok(None),
            value => T::from_value(value).map(Some),
        }
    }
}

macro_rules! from_value {
    ($($ty:ty => $expect:literal { $($pat:pat => $body:expr,)* })*) => {$(
        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self, DecodeError> {
                match value {
                    $($pat => $body,)*
                    Value::Null => Err(DecodeError::Null),
                    other => Err(DecodeError::TypeMismatch { expected: $expect, found: other.kind() }),
                }
            }
        }
    )*};
}

from_value! {
    bool => "bool" { Value::Bool(b) => Ok(b), }
    i16 => "int2" { Value::Int2(i) => Ok(i), }
    i32 => "int4" {
        Value::Int2(i) => Ok(i.into()),
        Value::Int4(i) => Ok(i),
    }
    i64 => "int8" {
        Value::Int2(i) => Ok(i.into()),
        Value::Int4(i) => Ok(i.into()),
        Value::Int8(i) => Ok(i),
        Value::Oid(i) => Ok(i.into()),
    }
    u32 => "oid" { Value::Oid(i) => Ok(i), }
    f32 => "float4" { Value::Float4(f) => Ok(f), }
    f64 => "float8" {
        Value::Float4(f) => Ok(f.into()),
        Value::Float8(f) => Ok(f),
    }
    String => "text" { Value::Text(s) => Ok(s), }
    Bytes => "bytea" { Value::Bytea(b) => Ok(b), }
    Vec<u8> => "bytea" { Value::Bytea(b) => Ok(b.into()), }
}

#[cfg(feature = "json")]
from_value! {
    serde_json::Value => "json" { Value::Json(j) => Ok(j), }
}

#[cfg(feature = "time")]
from_value! {
    time::PrimitiveDateTime => "timestamp" { Value::Timestamp(t) => Ok(t), }
    time::UtcDateTime => "timestamptz" { Value::TimestampTz(t) => Ok(t), }
}
