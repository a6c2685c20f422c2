//! Binary-format codecs
//!
//! Encoders take a runtime value plus its declared type and emit the Postgres
//! binary representation; decoders take the column's type OID and the raw
//! bytes. Reference: <https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES>

use super::{oid, PgType, SqlValue};
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime};
use uuid::Uuid;

/// jsonb payloads carry a one-byte version header
const JSONB_VERSION: u8 = 1;

/// Postgres date epoch: 2000-01-01
pub(crate) fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).expect("valid epoch date")
}

/// Postgres timestamp epoch: 2000-01-01T00:00:00
pub(crate) fn pg_epoch_datetime() -> NaiveDateTime {
    pg_epoch_date().and_hms_opt(0, 0, 0).expect("valid epoch time")
}

/// Encode `value` as the binary form of the declared `ty`.
///
/// Returns `None` for SQL NULL. A value whose variant does not fit the
/// declared type fails with an invalid-type error; a malformed uuid string
/// fails with invalid-format.
pub fn encode(value: &SqlValue, ty: PgType) -> Result<Option<Bytes>> {
    if value.is_null() {
        return Ok(None);
    }

    let bytes = match (ty, value) {
        (PgType::Boolean, SqlValue::Bool(v)) => {
            Bytes::from_static(if *v { &[1][..] } else { &[0][..] })
        }
        (PgType::SmallInteger, SqlValue::SmallInt(v)) => Bytes::copy_from_slice(&v.to_be_bytes()),
        (PgType::Integer | PgType::Serial, value) => {
            let v = int_in_range(value, ty, i64::from(i32::MIN), i64::from(i32::MAX))? as i32;
            Bytes::copy_from_slice(&v.to_be_bytes())
        }
        (PgType::BigInteger | PgType::BigSerial, value) => {
            let v = int_in_range(value, ty, i64::MIN, i64::MAX)?;
            Bytes::copy_from_slice(&v.to_be_bytes())
        }
        (PgType::Real, SqlValue::Real(v)) => Bytes::copy_from_slice(&v.to_be_bytes()),
        (PgType::Double, SqlValue::Double(v)) => Bytes::copy_from_slice(&v.to_be_bytes()),
        (PgType::Double, SqlValue::Real(v)) => {
            Bytes::copy_from_slice(&f64::from(*v).to_be_bytes())
        }
        (PgType::Text | PgType::Name, SqlValue::Text(s)) => Bytes::copy_from_slice(s.as_bytes()),
        (PgType::Bytea, SqlValue::Bytes(b)) => Bytes::copy_from_slice(b),
        (PgType::Date, SqlValue::Date(d)) => {
            let days = (*d - pg_epoch_date()).num_days();
            let days = i32::try_from(days)
                .map_err(|_| Error::InvalidFormat(format!("date out of range: {}", d)))?;
            Bytes::copy_from_slice(&days.to_be_bytes())
        }
        (PgType::Timestamp, SqlValue::Timestamp(ts)) => encode_micros(*ts)?,
        (PgType::TimestampTz, SqlValue::TimestampTz(ts)) => encode_micros(ts.naive_utc())?,
        (PgType::Uuid, SqlValue::Uuid(u)) => Bytes::copy_from_slice(u.as_bytes()),
        (PgType::Uuid, SqlValue::Text(s)) => {
            let parsed = Uuid::parse_str(s)
                .map_err(|_| Error::InvalidFormat(format!("malformed uuid string: {:?}", s)))?;
            Bytes::copy_from_slice(parsed.as_bytes())
        }
        (PgType::Json, SqlValue::Json(v)) => {
            let text = serde_json::to_vec(v)
                .map_err(|e| Error::InvalidFormat(format!("unencodable json value: {}", e)))?;
            let mut buf = BytesMut::with_capacity(text.len() + 1);
            buf.put_u8(JSONB_VERSION);
            buf.put_slice(&text);
            buf.freeze()
        }
        (ty, value) => {
            return Err(Error::InvalidType(format!(
                "cannot encode {} value as {}",
                variant_name(value),
                ty
            )))
        }
    };

    Ok(Some(bytes))
}

fn encode_micros(ts: NaiveDateTime) -> Result<Bytes> {
    let micros = (ts - pg_epoch_datetime())
        .num_microseconds()
        .ok_or_else(|| Error::InvalidFormat(format!("timestamp out of range: {}", ts)))?;
    Ok(Bytes::copy_from_slice(&micros.to_be_bytes()))
}

fn int_in_range(value: &SqlValue, ty: PgType, min: i64, max: i64) -> Result<i64> {
    let v = value.as_i64().ok_or_else(|| {
        Error::InvalidType(format!(
            "cannot encode {} value as {}",
            variant_name(value),
            ty
        ))
    })?;
    if v < min || v > max {
        return Err(Error::InvalidType(format!("{} out of range for {}", v, ty)));
    }
    Ok(v)
}

fn variant_name(value: &SqlValue) -> &'static str {
    match value {
        SqlValue::Null => "null",
        SqlValue::Bool(_) => "bool",
        SqlValue::SmallInt(_) => "smallint",
        SqlValue::Int(_) => "int",
        SqlValue::BigInt(_) => "bigint",
        SqlValue::Real(_) => "real",
        SqlValue::Double(_) => "double",
        SqlValue::Text(_) => "text",
        SqlValue::Bytes(_) => "bytea",
        SqlValue::Uuid(_) => "uuid",
        SqlValue::Date(_) => "date",
        SqlValue::Timestamp(_) => "timestamp",
        SqlValue::TimestampTz(_) => "timestamptz",
        SqlValue::Json(_) => "json",
        SqlValue::Raw { .. } => "raw",
    }
}

/// Decode a binary-format column by type OID.
///
/// OIDs outside the built-in table decode to UTF-8 text when the bytes are
/// valid UTF-8, raw bytes otherwise.
pub fn decode(type_oid: u32, data: &[u8]) -> Result<SqlValue> {
    match type_oid {
        oid::BOOL => {
            let [b] = exact::<1>(data, "bool")?;
            Ok(SqlValue::Bool(b != 0))
        }
        oid::INT2 => Ok(SqlValue::SmallInt(i16::from_be_bytes(exact(data, "int2")?))),
        oid::INT4 => Ok(SqlValue::Int(i32::from_be_bytes(exact(data, "int4")?))),
        oid::INT8 => Ok(SqlValue::BigInt(i64::from_be_bytes(exact(data, "int8")?))),
        // object identifiers read as plain integers
        oid::OID => Ok(SqlValue::Int(i32::from_be_bytes(exact(data, "oid")?))),
        oid::FLOAT4 => Ok(SqlValue::Real(f32::from_be_bytes(exact(data, "float4")?))),
        oid::FLOAT8 => Ok(SqlValue::Double(f64::from_be_bytes(exact(data, "float8")?))),
        oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME => Ok(SqlValue::Text(utf8(data)?)),
        oid::BYTEA => Ok(SqlValue::Bytes(data.to_vec())),
        oid::DATE => {
            let days = i32::from_be_bytes(exact(data, "date")?);
            let date = pg_epoch_date()
                .checked_add_signed(Duration::days(i64::from(days)))
                .ok_or_else(|| Error::InvalidFormat(format!("date out of range: {}", days)))?;
            Ok(SqlValue::Date(date))
        }
        oid::TIMESTAMP => Ok(SqlValue::Timestamp(decode_micros(data)?)),
        oid::TIMESTAMPTZ => {
            let naive = decode_micros(data)?;
            let utc = FixedOffset::east_opt(0).expect("zero offset");
            Ok(SqlValue::TimestampTz(
                DateTime::<FixedOffset>::from_naive_utc_and_offset(naive, utc),
            ))
        }
        oid::UUID => {
            let bytes: [u8; 16] = exact(data, "uuid")?;
            Ok(SqlValue::Uuid(Uuid::from_bytes(bytes)))
        }
        oid::JSON => decode_json(data),
        oid::JSONB => {
            if data.first() != Some(&JSONB_VERSION) {
                return Err(Error::InvalidFormat(
                    "jsonb payload missing version header".into(),
                ));
            }
            decode_json(&data[1..])
        }
        other => {
            // convenience fallback for types without a codec
            match std::str::from_utf8(data) {
                Ok(s) => Ok(SqlValue::Text(s.to_string())),
                Err(_) => Ok(SqlValue::Raw {
                    oid: other,
                    data: data.to_vec(),
                }),
            }
        }
    }
}

fn decode_micros(data: &[u8]) -> Result<NaiveDateTime> {
    let micros = i64::from_be_bytes(exact(data, "timestamp")?);
    pg_epoch_datetime()
        .checked_add_signed(Duration::microseconds(micros))
        .ok_or_else(|| Error::InvalidFormat(format!("timestamp out of range: {}", micros)))
}

fn decode_json(data: &[u8]) -> Result<SqlValue> {
    let value = serde_json::from_slice(data)
        .map_err(|e| Error::InvalidFormat(format!("malformed json payload: {}", e)))?;
    Ok(SqlValue::Json(value))
}

fn exact<const N: usize>(data: &[u8], what: &str) -> Result<[u8; N]> {
    data.try_into()
        .map_err(|_| Error::InvalidFormat(format!("{} expects {} bytes, got {}", what, N, data.len())))
}

fn utf8(data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec())
        .map_err(|e| Error::InvalidFormat(format!("invalid UTF-8 in text column: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn roundtrip(value: SqlValue, ty: PgType) -> SqlValue {
        let encoded = encode(&value, ty).unwrap().expect("non-null");
        decode(ty.oid(), &encoded).unwrap()
    }

    #[test]
    fn null_encodes_to_none() {
        assert!(encode(&SqlValue::Null, PgType::Integer).unwrap().is_none());
    }

    #[test]
    fn integer_boundaries() {
        for v in [i32::MIN, -1, 0, 1, i32::MAX] {
            assert_eq!(roundtrip(SqlValue::Int(v), PgType::Integer), SqlValue::Int(v));
        }
        for v in [i64::MIN, 0, i64::MAX] {
            assert_eq!(
                roundtrip(SqlValue::BigInt(v), PgType::BigInteger),
                SqlValue::BigInt(v)
            );
        }
        for v in [i16::MIN, 0, i16::MAX] {
            assert_eq!(
                roundtrip(SqlValue::SmallInt(v), PgType::SmallInteger),
                SqlValue::SmallInt(v)
            );
        }
    }

    #[test]
    fn serial_types_share_integer_wire_form() {
        let encoded = encode(&SqlValue::Int(7), PgType::Serial).unwrap().unwrap();
        assert_eq!(&encoded[..], &7i32.to_be_bytes());
        let encoded = encode(&SqlValue::BigInt(7), PgType::BigSerial)
            .unwrap()
            .unwrap();
        assert_eq!(&encoded[..], &7i64.to_be_bytes());
    }

    #[test]
    fn integer_widening_and_range_checks() {
        // small value widens into integer
        assert_eq!(
            roundtrip(SqlValue::SmallInt(3), PgType::Integer),
            SqlValue::Int(3)
        );
        // bigint too large for int4 is a type error
        assert!(encode(&SqlValue::BigInt(i64::MAX), PgType::Integer).is_err());
    }

    #[test]
    fn float_special_values() {
        for v in [0.0f64, -0.0, f64::MIN, f64::MAX, f64::INFINITY, f64::NEG_INFINITY] {
            match roundtrip(SqlValue::Double(v), PgType::Double) {
                SqlValue::Double(out) => assert_eq!(out.to_bits(), v.to_bits()),
                other => panic!("expected double, got {:?}", other),
            }
        }
        match roundtrip(SqlValue::Double(f64::NAN), PgType::Double) {
            SqlValue::Double(out) => assert!(out.is_nan()),
            other => panic!("expected double, got {:?}", other),
        }
        match roundtrip(SqlValue::Real(f32::NAN), PgType::Real) {
            SqlValue::Real(out) => assert!(out.is_nan()),
            other => panic!("expected real, got {:?}", other),
        }
    }

    #[test]
    fn text_multibyte_roundtrip() {
        for s in ["", "hello", "héllo wörld", "日本語", "\u{1F980}"] {
            assert_eq!(
                roundtrip(SqlValue::Text(s.into()), PgType::Text),
                SqlValue::Text(s.into())
            );
        }
    }

    #[test]
    fn bytea_roundtrip_including_empty() {
        for b in [vec![], vec![0u8, 1, 2, 255]] {
            assert_eq!(
                roundtrip(SqlValue::Bytes(b.clone()), PgType::Bytea),
                SqlValue::Bytes(b)
            );
        }
    }

    #[test]
    fn date_epoch_and_extremes() {
        let epoch = pg_epoch_date();
        let encoded = encode(&SqlValue::Date(epoch), PgType::Date).unwrap().unwrap();
        assert_eq!(&encoded[..], &0i32.to_be_bytes());

        for d in [
            NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(1, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(9999, 12, 31).unwrap(),
        ] {
            assert_eq!(roundtrip(SqlValue::Date(d), PgType::Date), SqlValue::Date(d));
        }
    }

    #[test]
    fn timestamp_microsecond_precision() {
        let ts = NaiveDate::from_ymd_opt(2024, 6, 15)
            .unwrap()
            .and_hms_micro_opt(12, 34, 56, 789_012)
            .unwrap();
        assert_eq!(
            roundtrip(SqlValue::Timestamp(ts), PgType::Timestamp),
            SqlValue::Timestamp(ts)
        );

        let far_past = NaiveDate::from_ymd_opt(-4000, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            roundtrip(SqlValue::Timestamp(far_past), PgType::Timestamp),
            SqlValue::Timestamp(far_past)
        );
    }

    #[test]
    fn timestamptz_decodes_at_utc() {
        let ts = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 10, 0, 0)
            .unwrap();
        match roundtrip(SqlValue::TimestampTz(ts), PgType::TimestampTz) {
            SqlValue::TimestampTz(out) => {
                assert_eq!(out, ts);
                assert_eq!(out.offset().local_minus_utc(), 0);
            }
            other => panic!("expected timestamptz, got {:?}", other),
        }
    }

    #[test]
    fn uuid_binary_and_string_forms() {
        let u = Uuid::parse_str("a1a2a3a4-b1b2-c1c2-d1d2-d3d4d5d6d7d8").unwrap();
        assert_eq!(roundtrip(SqlValue::Uuid(u), PgType::Uuid), SqlValue::Uuid(u));

        let from_text = encode(&SqlValue::Text(u.to_string()), PgType::Uuid)
            .unwrap()
            .unwrap();
        assert_eq!(&from_text[..], u.as_bytes());

        assert!(matches!(
            encode(&SqlValue::Text("not-a-uuid".into()), PgType::Uuid),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn jsonb_version_byte() {
        let value = SqlValue::Json(serde_json::json!({"a": [1, 2, 3]}));
        let encoded = encode(&value, PgType::Json).unwrap().unwrap();
        assert_eq!(encoded[0], JSONB_VERSION);
        assert_eq!(decode(oid::JSONB, &encoded).unwrap(), value);
        // plain json has no version byte
        assert_eq!(decode(oid::JSON, &encoded[1..]).unwrap(), value);
    }

    #[test]
    fn declared_type_mismatch_is_invalid_type() {
        assert!(matches!(
            encode(&SqlValue::Text("hi".into()), PgType::Integer),
            Err(Error::InvalidType(_))
        ));
        assert!(matches!(
            encode(&SqlValue::Bool(true), PgType::Timestamp),
            Err(Error::InvalidType(_))
        ));
    }

    #[test]
    fn truncated_column_is_invalid_format() {
        assert!(decode(oid::INT4, &[0, 0, 1]).is_err());
        assert!(decode(oid::UUID, &[1, 2, 3]).is_err());
    }
}
