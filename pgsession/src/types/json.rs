use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{Codec, DecodeError, EncodeError};
use crate::{
    postgres::{PgFormat, oid},
    value::{FromValue, Value},
};

/// `jsonb` binary format version.
const JSONB_VERSION: u8 = 1;

/// Codec for `json` and `jsonb` using [`serde_json`].
///
/// `jsonb` binary values are prefixed with a version byte, `json` binary values are plain text.
/// Since the codec does not know which of the two it is encoding for, values are sent in
/// text format and the server casts them.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<PgFormat, EncodeError> {
        let result = match value {
            Value::Json(json) => serde_json::to_writer(buf.writer(), json),
            Value::Text(text) => {
                buf.put_slice(text.as_bytes());
                Ok(())
            },
            value => return Err(EncodeError::mismatch(value.kind(), oid::JSONB)),
        };
        result.map_err(|err| EncodeError::new(err.to_string()))?;
        Ok(PgFormat::Text)
    }

    fn decode(&self, format: PgFormat, mut raw: &[u8]) -> Result<Value, DecodeError> {
        // `json` binary is the text itself, `jsonb` starts with its version
        if format == PgFormat::Binary && raw.first() == Some(&JSONB_VERSION) {
            raw = &raw[1..];
        }
        Ok(Value::Json(serde_json::from_slice(raw)?))
    }
}

/// Typed `json` value, converted through [`Value::Json`].
///
/// ```no_run
/// use pgsession::types::Json;
///
/// # async fn app(client: pgsession::Client) -> pgsession::Result<()> {
/// let tags = Json(vec!["a", "b"]).into_value()?;
/// let result = client.equery("SELECT $1::jsonb", &[tags]).await?;
/// let Json(tags) = result.rows[0].try_get::<_, Json<Vec<String>>>(0)?;
/// assert_eq!(tags, ["a", "b"]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> FromValue for Json<T> {
    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let value = match value {
            Value::Json(json) => serde_json::from_value(json)?,
            Value::Text(text) => serde_json::from_str(&text)?,
            Value::Null => return Err(DecodeError::Null),
            other => return Err(DecodeError::TypeMismatch { expected: "json", found: other.kind() }),
        };
        Ok(Json(value))
    }
}

impl<T: Serialize> Json<T> {
    /// Serialize into [`Value::Json`].
    pub fn into_value(self) -> Result<Value, EncodeError> {
        serde_json::to_value(&self.0)
            .map(Value::Json)
            .map_err(|err| EncodeError::new(err.to_string()))
    }
}

impl<T: Serialize> Serialize for Json<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Json<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(T::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn decode_jsonb_binary() {
        let value = JsonCodec.decode(PgFormat::Binary, b"\x01{\"id\":1}").unwrap();
        assert_eq!(value, Value::Json(serde_json::json!({ "id": 1 })));
        let value = JsonCodec.decode(PgFormat::Text, b"[1,2]").unwrap();
        assert_eq!(value, Value::Json(serde_json::json!([1, 2])));
    }

    #[test]
    fn encode_as_text() {
        let mut buf = BytesMut::new();
        let format = JsonCodec.encode(&Value::Json(serde_json::json!({ "a": true })), &mut buf).unwrap();
        assert_eq!(format, PgFormat::Text);
        assert_eq!(&buf[..], b"{\"a\":true}");
    }

    #[test]
    fn typed_json() {
        let value = Json(BTreeMap::from([("id", 7)])).into_value().unwrap();
        assert_eq!(value, Value::Json(serde_json::json!({ "id": 7 })));

        let Json(map) = Json::<BTreeMap<String, i32>>::from_value(value).unwrap();
        assert_eq!(map["id"], 7);

        let Json(list) = Json::<Vec<i32>>::from_value(Value::Text("[1,2]".into())).unwrap();
        assert_eq!(list, [1, 2]);

        let err = Json::<Vec<i32>>::from_value(Value::Json(serde_json::json!({ "id": 7 }))).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
        let err = Json::<Vec<i32>>::from_value(Value::Int4(1)).unwrap_err();
        assert!(matches!(err, DecodeError::TypeMismatch { expected: "json", found: "int4" }));
    }

    #[test]
    fn serialize_transparent() {
        assert_eq!(serde_json::to_string(&Json([1, 2])).unwrap(), "[1,2]");
        let Json(flag) = serde_json::from_str::<Json<bool>>("true").unwrap();
        assert!(flag);
    }
}
