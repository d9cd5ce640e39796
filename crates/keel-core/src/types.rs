//! SQL column types, domain field kinds, and the coercion table between them.

use crate::value::Value;

/// SQL column types a mapping may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    // Integer types
    TinyInt,
    SmallInt,
    Integer,
    BigInt,

    // Floating point
    Real,
    Double,

    // Fixed precision
    Decimal { precision: u8, scale: u8 },

    // Boolean
    Boolean,

    // String types
    Char(u32),
    VarChar(u32),
    Text,

    // Binary types
    Binary(u32),
    VarBinary(u32),
    Blob,

    // Date/time types
    Date,
    Time,
    DateTime,
    Timestamp,
    TimestampTz,

    Uuid,

    Json,
    JsonB,

    /// Vendor type with no entry in the coercion table
    Custom(&'static str),
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::TinyInt => "TINYINT".to_string(),
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Real => "REAL".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::Char(len) => format!("CHAR({})", len),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Binary(len) => format!("BINARY({})", len),
            SqlType::VarBinary(len) => format!("VARBINARY({})", len),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Time => "TIME".to_string(),
            SqlType::DateTime => "DATETIME".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::TimestampTz => "TIMESTAMPTZ".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
            SqlType::JsonB => "JSONB".to_string(),
            SqlType::Custom(name) => (*name).to_string(),
        }
    }

    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer | SqlType::BigInt
        )
    }

    pub const fn is_text(&self) -> bool {
        matches!(self, SqlType::Char(_) | SqlType::VarChar(_) | SqlType::Text)
    }
}

/// The representation a domain field uses for a column's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    I16,
    I32,
    I64,
    F64,
    /// Exact decimal carried as a string
    Decimal,
    Text,
    Bytes,
    /// Days since the epoch
    Date,
    /// Microseconds since midnight
    Time,
    /// Microseconds since the epoch, UTC
    Instant,
    Uuid,
    Json,
}

impl FieldKind {
    /// Whether a column of `sql_type` can back a field of this kind.
    ///
    /// This is the complete table; any pairing not listed is rejected when
    /// the entity is registered.
    pub fn accepts(self, sql_type: SqlType) -> bool {
        use SqlType as S;
        match self {
            FieldKind::Bool => matches!(sql_type, S::Boolean | S::TinyInt),
            FieldKind::I16 => matches!(sql_type, S::TinyInt | S::SmallInt),
            FieldKind::I32 => matches!(sql_type, S::TinyInt | S::SmallInt | S::Integer),
            FieldKind::I64 => sql_type.is_integer(),
            FieldKind::F64 => matches!(sql_type, S::Real | S::Double | S::Decimal { .. }),
            FieldKind::Decimal => matches!(sql_type, S::Decimal { .. }),
            FieldKind::Text => sql_type.is_text(),
            FieldKind::Bytes => matches!(sql_type, S::Binary(_) | S::VarBinary(_) | S::Blob),
            FieldKind::Date => matches!(sql_type, S::Date),
            FieldKind::Time => matches!(sql_type, S::Time),
            FieldKind::Instant => matches!(sql_type, S::DateTime | S::Timestamp | S::TimestampTz),
            FieldKind::Uuid => matches!(sql_type, S::Uuid | S::Binary(16) | S::Char(36)),
            FieldKind::Json => matches!(sql_type, S::Json | S::JsonB | S::Text),
        }
    }

    /// Normalize a value to this kind's canonical representation.
    ///
    /// Returns `None` when the value cannot represent the kind. `Null` passes
    /// through unchanged; nullability is checked by the mapper.
    pub fn coerce(self, value: &Value) -> Option<Value> {
        if value.is_null() {
            return Some(Value::Null);
        }
        match self {
            FieldKind::Bool => value.as_bool().map(Value::Bool),
            FieldKind::I16 => value
                .as_i64()
                .and_then(|v| i16::try_from(v).ok())
                .map(Value::SmallInt),
            FieldKind::I32 => value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Value::Int),
            FieldKind::I64 => value.as_i64().map(Value::BigInt),
            FieldKind::F64 => value.as_f64().map(Value::Double),
            FieldKind::Decimal => match value {
                Value::Decimal(s) | Value::Text(s) => Some(Value::Decimal(s.clone())),
                Value::Double(d) => Some(Value::Decimal(d.to_string())),
                other => other.as_i64().map(|i| Value::Decimal(i.to_string())),
            },
            FieldKind::Text => match value {
                Value::Text(s) => Some(Value::Text(s.clone())),
                _ => None,
            },
            FieldKind::Bytes => match value {
                Value::Bytes(b) => Some(Value::Bytes(b.clone())),
                Value::Text(s) => Some(Value::Bytes(s.as_bytes().to_vec())),
                _ => None,
            },
            FieldKind::Date => match value {
                Value::Date(d) => Some(Value::Date(*d)),
                _ => None,
            },
            FieldKind::Time => match value {
                Value::Time(t) => Some(Value::Time(*t)),
                _ => None,
            },
            FieldKind::Instant => match value {
                Value::Timestamp(t) => Some(Value::Timestamp(*t)),
                _ => None,
            },
            FieldKind::Uuid => match value {
                Value::Uuid(u) => Some(Value::Uuid(*u)),
                Value::Bytes(b) => <[u8; 16]>::try_from(b.as_slice()).ok().map(Value::Uuid),
                Value::Text(s) => parse_uuid(s).map(Value::Uuid),
                _ => None,
            },
            FieldKind::Json => match value {
                Value::Json(j) => Some(Value::Json(j.clone())),
                Value::Text(s) => serde_json::from_str(s).ok().map(Value::Json),
                _ => None,
            },
        }
    }
}

fn parse_uuid(s: &str) -> Option<[u8; 16]> {
    let hex: Vec<u8> = s.bytes().filter(|b| *b != b'-').collect();
    if hex.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, pair) in hex.chunks(2).enumerate() {
        let pair = std::str::from_utf8(pair).ok()?;
        out[i] = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(out)
}
