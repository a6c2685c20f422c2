//! Postgres value model
//!
//! * [`PgType`]: the declared types a parameter may carry
//! * [`SqlValue`]: the tagged union of runtime values
//! * [`oid`]: built-in type OIDs
//! * [`DecoderRegistry`]: caller-pluggable column decoders
//!
//! Binary wire codecs live in [`binary`], SQL-literal rendering in [`text`].

pub mod binary;
pub mod text;

use crate::Result;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Built-in type OIDs from `pg_type`.
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const NAME: u32 = 19;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const OID: u32 = 26;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const VARCHAR: u32 = 1043;
    pub const BPCHAR: u32 = 1042;
    pub const DATE: u32 = 1082;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;
}

/// Declared Postgres type of a bound parameter.
///
/// This is the set a parameter substitutor may assign. `Serial` and
/// `BigSerial` share the int4/int8 wire form; they exist so a substitutor can
/// express column intent without the caller caring about the distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PgType {
    Text,
    Integer,
    SmallInteger,
    BigInteger,
    Real,
    Double,
    Boolean,
    Timestamp,
    TimestampTz,
    Date,
    Json,
    Bytea,
    Uuid,
    Serial,
    BigSerial,
    Name,
}

impl PgType {
    /// The OID this type binds with on the wire.
    pub fn oid(self) -> u32 {
        match self {
            PgType::Text => oid::TEXT,
            PgType::Integer | PgType::Serial => oid::INT4,
            PgType::SmallInteger => oid::INT2,
            PgType::BigInteger | PgType::BigSerial => oid::INT8,
            PgType::Real => oid::FLOAT4,
            PgType::Double => oid::FLOAT8,
            PgType::Boolean => oid::BOOL,
            PgType::Timestamp => oid::TIMESTAMP,
            PgType::TimestampTz => oid::TIMESTAMPTZ,
            PgType::Date => oid::DATE,
            PgType::Json => oid::JSONB,
            PgType::Bytea => oid::BYTEA,
            PgType::Uuid => oid::UUID,
            PgType::Name => oid::NAME,
        }
    }

    /// Whether a server-reported parameter OID is compatible with this
    /// declared type. Serial types accept their integer OIDs; `Json` accepts
    /// both json and jsonb.
    pub fn matches_oid(self, reported: u32) -> bool {
        match self {
            PgType::Json => reported == oid::JSON || reported == oid::JSONB,
            PgType::Text => {
                reported == oid::TEXT || reported == oid::VARCHAR || reported == oid::BPCHAR
            }
            other => other.oid() == reported,
        }
    }
}

impl std::fmt::Display for PgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PgType::Text => "text",
            PgType::Integer => "integer",
            PgType::SmallInteger => "smallInteger",
            PgType::BigInteger => "bigInteger",
            PgType::Real => "real",
            PgType::Double => "double",
            PgType::Boolean => "boolean",
            PgType::Timestamp => "timestamp",
            PgType::TimestampTz => "timestamptz",
            PgType::Date => "date",
            PgType::Json => "json",
            PgType::Bytea => "bytea",
            PgType::Uuid => "uuid",
            PgType::Serial => "serial",
            PgType::BigSerial => "bigSerial",
            PgType::Name => "name",
        };
        f.write_str(name)
    }
}

/// A runtime SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Json(serde_json::Value),
    /// A column whose type has no built-in decoder.
    Raw {
        oid: u32,
        data: Vec<u8>,
    },
}

impl SqlValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer view across the int widths; None for other variants.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::SmallInt(v) => Some(i64::from(*v)),
            SqlValue::Int(v) => Some(i64::from(*v)),
            SqlValue::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Float view across both widths; None for other variants.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Real(v) => Some(f64::from(*v)),
            SqlValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Decoder callback for one type OID.
pub type DecodeFn = dyn Fn(&[u8]) -> Result<SqlValue> + Send + Sync;

/// Caller-pluggable value decoders keyed by type OID.
///
/// The built-in codec table covers the types in [`binary`]; a registry entry
/// overrides it (e.g. PostGIS geometries decoded from EWKB). Types known to
/// neither decode to UTF-8 text when the bytes are valid UTF-8, raw bytes
/// otherwise.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    overrides: HashMap<u32, Arc<DecodeFn>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for `type_oid`, replacing any previous entry.
    pub fn register<F>(&mut self, type_oid: u32, decode: F)
    where
        F: Fn(&[u8]) -> Result<SqlValue> + Send + Sync + 'static,
    {
        self.overrides.insert(type_oid, Arc::new(decode));
    }

    /// Decode a binary-format column.
    pub fn decode(&self, type_oid: u32, data: &[u8]) -> Result<SqlValue> {
        if let Some(decode) = self.overrides.get(&type_oid) {
            return decode(data);
        }
        binary::decode(type_oid, data)
    }

    /// Decode a column honoring its wire format code.
    pub fn decode_format(&self, type_oid: u32, format_code: i16, data: &[u8]) -> Result<SqlValue> {
        if format_code == 0 {
            return text::decode_text(type_oid, data);
        }
        self.decode(type_oid, data)
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Decode a raw column slice coming off a DataRow.
pub(crate) fn decode_column(
    registry: &DecoderRegistry,
    type_oid: u32,
    format_code: i16,
    data: Option<&Bytes>,
) -> Result<SqlValue> {
    match data {
        None => Ok(SqlValue::Null),
        Some(bytes) => registry.decode_format(type_oid, format_code, bytes),
    }
}
