use bytes::{BufMut, BytesMut};
use time::{
    Duration, PrimitiveDateTime, UtcDateTime, UtcOffset,
    format_description::{BorrowedFormatItem as I, Component as C, modifier},
};

use super::{Codec, DecodeError, EncodeError};
use crate::{
    postgres::{PgFormat, oid},
    value::Value,
};

/// Codec for `timestamp` and `timestamptz` using [`time`].
///
/// Binary values are microseconds since midnight 2000-01-01.
#[derive(Debug, Clone, Copy)]
pub struct TimestampCodec {
    with_tz: bool,
}

impl TimestampCodec {
    /// Codec for `timestamp`.
    pub const TIMESTAMP: TimestampCodec = TimestampCodec { with_tz: false };
    /// Codec for `timestamptz`.
    pub const TIMESTAMPTZ: TimestampCodec = TimestampCodec { with_tz: true };
}

const PRIMITIVE_PG_EPOCH: PrimitiveDateTime = {
    // source: `from_julian_day` docs
    let date = match time::Date::from_julian_day(2_451_545) {
        Ok(ok) => ok,
        Err(_) => panic!("invalid postgres epoch"),
    };
    PrimitiveDateTime::new(date, time::Time::MIDNIGHT)
};

const UTC_PG_EPOCH: UtcDateTime = UtcDateTime::new(PRIMITIVE_PG_EPOCH.date(), time::Time::MIDNIGHT);

const DATE_TIME: &[I<'_>] = &[
    I::Component(C::Year(modifier::Year::default())),
    I::Literal(b"-"),
    I::Component(C::Month(modifier::Month::default())),
    I::Literal(b"-"),
    I::Component(C::Day(modifier::Day::default())),
    I::Literal(b" "),
    I::Component(C::Hour(modifier::Hour::default())),
    I::Literal(b":"),
    I::Component(C::Minute(modifier::Minute::default())),
    I::Literal(b":"),
    I::Component(C::Second(modifier::Second::default())),
    I::Optional(&I::Compound(&[
        I::Literal(b"."),
        I::Component(C::Subsecond(modifier::Subsecond::default())),
    ])),
];

const OFFSET: &[I<'_>] = &[
    I::Component(C::OffsetHour(modifier::OffsetHour::default())),
    I::Optional(&I::Compound(&[
        I::Literal(b":"),
        I::Component(C::OffsetMinute(modifier::OffsetMinute::default())),
    ])),
];

pub(crate) fn format_text(value: PrimitiveDateTime) -> String {
    value.format(&DATE_TIME).unwrap_or_default()
}

fn micros(raw: &[u8]) -> Result<Duration, DecodeError> {
    let Ok(be) = <[u8; 8]>::try_from(raw) else {
        return Err(DecodeError::Malformed("invalid timestamp length".into()));
    };
    Ok(Duration::microseconds(i64::from_be_bytes(be)))
}

fn since_epoch(duration: Duration) -> Result<i64, EncodeError> {
    i64::try_from(duration.whole_microseconds())
        .map_err(|_| EncodeError::new("timestamp out of range"))
}

fn parse_tz(text: &str) -> Result<UtcDateTime, DecodeError> {
    let malformed = |err: time::error::Parse| DecodeError::Malformed(err.to_string().into());
    // offset starts at the last sign after the time part
    let split = text.rfind(['+', '-']).filter(|i| *i > 10).unwrap_or(text.len());
    let (date_time, offset) = text.split_at(split);
    let date_time = PrimitiveDateTime::parse(date_time, &DATE_TIME).map_err(malformed)?;
    let offset = match offset {
        "" => UtcOffset::UTC,
        offset => UtcOffset::parse(offset, &OFFSET).map_err(malformed)?,
    };
    Ok(date_time.assume_offset(offset).to_utc())
}

impl Codec for TimestampCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<PgFormat, EncodeError> {
        match value {
            Value::Timestamp(t) => buf.put_i64(since_epoch(*t - PRIMITIVE_PG_EPOCH)?),
            Value::TimestampTz(t) => buf.put_i64(since_epoch(*t - UTC_PG_EPOCH)?),
            Value::Text(text) => {
                buf.put_slice(text.as_bytes());
                return Ok(PgFormat::Text);
            },
            value => return Err(EncodeError::mismatch(value.kind(), oid::TIMESTAMP)),
        }
        Ok(PgFormat::Binary)
    }

    fn decode(&self, format: PgFormat, raw: &[u8]) -> Result<Value, DecodeError> {
        match (format, self.with_tz) {
            (PgFormat::Binary, false) => Ok(Value::Timestamp(PRIMITIVE_PG_EPOCH.saturating_add(micros(raw)?))),
            (PgFormat::Binary, true) => Ok(Value::TimestampTz(UTC_PG_EPOCH.saturating_add(micros(raw)?))),
            (PgFormat::Text, true) => Ok(Value::TimestampTz(parse_tz(std::str::from_utf8(raw)?)?)),
            (PgFormat::Text, false) => PrimitiveDateTime::parse(std::str::from_utf8(raw)?, &DATE_TIME)
                .map(Value::Timestamp)
                .map_err(|err| DecodeError::Malformed(err.to_string().into())),
        }
    }
}
