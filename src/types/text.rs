//! Text-format handling
//!
//! [`literal`] renders a value as a SQL literal for the simple-query path;
//! [`decode_text`] parses text-format result columns, which is what the
//! simple-query protocol returns.

use super::{oid, SqlValue};
use crate::{Error, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use uuid::Uuid;

/// Render `value` as a SQL literal.
///
/// Strings are single-quoted with `''` for embedded quotes; a string holding
/// a backslash switches to the `E'…'` form with backslashes doubled. Floats
/// render non-finite values as `'nan'`, `'infinity'`, `'-infinity'`;
/// booleans as `TRUE`/`FALSE`; NULL as the bare word `null`. Dates and
/// timestamps are ISO-8601 with a `±HH:MM` zone offset where one exists, and
/// BC years as the absolute year (zero-padded to at least four digits)
/// followed by ` BC`.
pub fn literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "null".to_string(),
        SqlValue::Bool(true) => "TRUE".to_string(),
        SqlValue::Bool(false) => "FALSE".to_string(),
        SqlValue::SmallInt(v) => v.to_string(),
        SqlValue::Int(v) => v.to_string(),
        SqlValue::BigInt(v) => v.to_string(),
        SqlValue::Real(v) => float_literal(f64::from(*v)),
        SqlValue::Double(v) => float_literal(*v),
        SqlValue::Text(s) => quote(s),
        SqlValue::Bytes(b) => hex_literal(b),
        SqlValue::Uuid(u) => format!("'{}'", u),
        SqlValue::Date(d) => {
            let (date, bc) = render_date(d.year(), d.month(), d.day());
            if bc {
                format!("'{} BC'", date)
            } else {
                format!("'{}'", date)
            }
        }
        SqlValue::Timestamp(ts) => format!("'{}'", render_timestamp(ts, None)),
        SqlValue::TimestampTz(ts) => {
            let offset_seconds = ts.offset().local_minus_utc();
            format!("'{}'", render_timestamp(&ts.naive_local(), Some(offset_seconds)))
        }
        SqlValue::Json(v) => quote(&v.to_string()),
        SqlValue::Raw { data, .. } => hex_literal(data),
    }
}

fn quote(s: &str) -> String {
    if s.contains('\\') {
        format!("E'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
    } else {
        format!("'{}'", s.replace('\'', "''"))
    }
}

fn float_literal(v: f64) -> String {
    if v.is_nan() {
        "'nan'".to_string()
    } else if v == f64::INFINITY {
        "'infinity'".to_string()
    } else if v == f64::NEG_INFINITY {
        "'-infinity'".to_string()
    } else {
        v.to_string()
    }
}

fn hex_literal(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2 + 6);
    out.push_str("E'\\\\x");
    for b in data {
        out.push_str(&format!("{:02x}", b));
    }
    out.push('\'');
    out
}

/// Year/month/day rendering; BC years report the absolute year and a flag.
fn render_date(year: i32, month: u32, day: u32) -> (String, bool) {
    if year <= 0 {
        // chrono year 0 is 1 BC
        (format!("{:04}-{:02}-{:02}", 1 - year, month, day), true)
    } else {
        (format!("{:04}-{:02}-{:02}", year, month, day), false)
    }
}

fn render_timestamp(ts: &NaiveDateTime, offset_seconds: Option<i32>) -> String {
    let date = ts.date();
    let (date_part, bc) = render_date(date.year(), date.month(), date.day());
    let time = ts.time();
    let mut out = format!(
        "{}T{:02}:{:02}:{:02}.{:06}",
        date_part,
        time.hour(),
        time.minute(),
        time.second(),
        time.nanosecond() / 1_000
    );
    if let Some(seconds) = offset_seconds {
        let sign = if seconds < 0 { '-' } else { '+' };
        let abs = seconds.abs();
        out.push_str(&format!("{}{:02}:{:02}", sign, abs / 3600, (abs % 3600) / 60));
    }
    if bc {
        out.push_str(" BC");
    }
    out
}

/// Decode a text-format result column by type OID.
///
/// Numeric and boolean parse failures are format errors; temporal text that
/// does not parse falls back to the raw text so unusual server renderings
/// still reach the caller.
pub fn decode_text(type_oid: u32, data: &[u8]) -> Result<SqlValue> {
    let text = std::str::from_utf8(data)
        .map_err(|e| Error::InvalidFormat(format!("invalid UTF-8 in text column: {}", e)))?;

    match type_oid {
        oid::BOOL => Ok(SqlValue::Bool(matches!(text, "t" | "true" | "1"))),
        oid::INT2 => parse_num(text, "int2").map(SqlValue::SmallInt),
        oid::INT4 => parse_num(text, "int4").map(SqlValue::Int),
        oid::OID => parse_num::<u32>(text, "oid").map(|v| SqlValue::Int(v as i32)),
        oid::INT8 => parse_num(text, "int8").map(SqlValue::BigInt),
        oid::FLOAT4 => parse_float(text).map(|v| SqlValue::Real(v as f32)),
        oid::FLOAT8 => parse_float(text).map(SqlValue::Double),
        oid::BYTEA => decode_hex_bytea(text),
        oid::UUID => Uuid::parse_str(text)
            .map(SqlValue::Uuid)
            .map_err(|_| Error::InvalidFormat(format!("malformed uuid string: {:?}", text))),
        oid::JSON | oid::JSONB => serde_json::from_str(text)
            .map(SqlValue::Json)
            .map_err(|e| Error::InvalidFormat(format!("malformed json payload: {}", e))),
        oid::DATE => Ok(NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(SqlValue::Date)
            .unwrap_or_else(|_| SqlValue::Text(text.to_string()))),
        oid::TIMESTAMP => Ok(
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map(SqlValue::Timestamp)
                .unwrap_or_else(|_| SqlValue::Text(text.to_string())),
        ),
        oid::TIMESTAMPTZ => Ok(DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .map(SqlValue::TimestampTz)
            .unwrap_or_else(|_| SqlValue::Text(text.to_string()))),
        _ => Ok(SqlValue::Text(text.to_string())),
    }
}

fn parse_num<T: std::str::FromStr>(text: &str, what: &str) -> Result<T> {
    text.parse()
        .map_err(|_| Error::InvalidFormat(format!("malformed {} text: {:?}", what, text)))
}

fn parse_float(text: &str) -> Result<f64> {
    match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        other => other
            .parse()
            .map_err(|_| Error::InvalidFormat(format!("malformed float text: {:?}", other))),
    }
}

fn decode_hex_bytea(text: &str) -> Result<SqlValue> {
    let hex = text.strip_prefix("\\x").unwrap_or(text);
    if hex.len() % 2 != 0 {
        return Err(Error::InvalidFormat("odd-length bytea hex".into()));
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for pair in hex.as_bytes().chunks(2) {
        let s = std::str::from_utf8(pair).expect("hex digits are ascii");
        let byte = u8::from_str_radix(s, 16)
            .map_err(|_| Error::InvalidFormat(format!("malformed bytea hex: {:?}", text)))?;
        out.push(byte);
    }
    Ok(SqlValue::Bytes(out))
}
