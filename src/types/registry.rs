use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

use crate::types::Value;

/// Portable SQL type codes (X/Open CLI numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SqlType {
    Char = 1,
    Numeric = 2,
    Decimal = 3,
    Integer = 4,
    SmallInt = 5,
    Float = 6,
    Real = 7,
    Double = 8,
    Date = 9,
    Time = 10,
    Timestamp = 11,
    Varchar = 12,
    Boolean = 16,
    LongVarchar = -1,
    Binary = -2,
    VarBinary = -3,
    LongVarBinary = -4,
    BigInt = -5,
    TinyInt = -6,
    Bit = -7,
    Other = 1111,
}

impl SqlType {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Converts one raw column value into a [`Value`].
///
/// Coercion never fails: text that does not parse as the target type is
/// returned as [`Value::Text`].
#[derive(Clone)]
pub enum Coercion {
    Varchar,
    Integer,
    Float,
    Decimal,
    Boolean,
    Date,
    Time,
    Timestamp,
    Binary,
    Custom(Arc<dyn Fn(&str) -> Value + Send + Sync>),
}

impl Coercion {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str) -> Value + Send + Sync + 'static,
    {
        Coercion::Custom(Arc::new(f))
    }

    pub fn coerce(&self, raw: Option<&str>) -> Value {
        let Some(raw) = raw else {
            return Value::Null;
        };

        let coerced = match self {
            Coercion::Varchar => return Value::Text(raw.to_string()),
            Coercion::Custom(f) => return f(raw),
            Coercion::Integer => raw.trim().parse::<i64>().ok().map(Value::Int),
            Coercion::Float => raw.trim().parse::<f64>().ok().map(Value::Float),
            Coercion::Decimal => Decimal::from_str(raw.trim()).ok().map(Value::Decimal),
            Coercion::Boolean => parse_bool(raw).map(Value::Bool),
            Coercion::Date => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .ok()
                .map(Value::Date),
            Coercion::Time => NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S%.f")
                .ok()
                .map(Value::Time),
            Coercion::Timestamp => parse_timestamp(raw.trim()).map(Value::Timestamp),
            Coercion::Binary => Some(Value::Bytes(parse_binary(raw))),
        };

        coerced.unwrap_or_else(|| {
            tracing::trace!(coercion = ?self, raw, "value did not parse, keeping text");
            Value::Text(raw.to_string())
        })
    }
}

impl fmt::Debug for Coercion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Coercion::Varchar => "Varchar",
            Coercion::Integer => "Integer",
            Coercion::Float => "Float",
            Coercion::Decimal => "Decimal",
            Coercion::Boolean => "Boolean",
            Coercion::Date => "Date",
            Coercion::Time => "Time",
            Coercion::Timestamp => "Timestamp",
            Coercion::Binary => "Binary",
            Coercion::Custom(_) => "Custom",
        })
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "1" | "y" | "yes" | "on" => Some(true),
        "f" | "false" | "0" | "n" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
                .ok()
                .map(|dt| dt.naive_utc())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

// PostgreSQL renders bytea as `\x` followed by hex digits.
fn parse_binary(raw: &str) -> Vec<u8> {
    if let Some(hex) = raw.strip_prefix("\\x") {
        if hex.len() % 2 == 0 {
            let decoded: Option<Vec<u8>> = (0..hex.len())
                .step_by(2)
                .map(|i| hex.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
                .collect();
            if let Some(bytes) = decoded {
                return bytes;
            }
        }
    }
    raw.as_bytes().to_vec()
}

/// What the registry knows about one native type name.
#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub sql_type: SqlType,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub coercion: Coercion,
}

impl TypeEntry {
    pub fn new(sql_type: SqlType, precision: Option<u32>, coercion: Coercion) -> Self {
        Self {
            sql_type,
            precision,
            scale: None,
            coercion,
        }
    }
}

/// A parsed native type descriptor such as `DECIMAL(10,2)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDescriptor {
    pub sql_type: SqlType,
    /// Base type name as written, parameters and modifiers removed.
    pub type_name: String,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

/// Maps backend-native type names to portable type codes and coercions.
///
/// Lookups are case-insensitive. Unknown names resolve to a generic
/// `OTHER` entry that coerces as text.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    entries: HashMap<String, TypeEntry>,
    fallback: TypeEntry,
}

impl TypeRegistry {
    /// An empty registry; every lookup hits the fallback entry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            fallback: TypeEntry::new(SqlType::Other, None, Coercion::Varchar),
        }
    }

    /// Portable names plus the PostgreSQL spellings.
    pub fn standard() -> Self {
        use Coercion as C;
        use SqlType as T;

        let table: &[(&str, T, Option<u32>, C)] = &[
            ("CHAR", T::Char, Some(1), C::Varchar),
            ("CHARACTER", T::Char, Some(1), C::Varchar),
            ("BPCHAR", T::Char, Some(1), C::Varchar),
            ("VARCHAR", T::Varchar, Some(255), C::Varchar),
            ("CHARACTER VARYING", T::Varchar, Some(255), C::Varchar),
            ("NAME", T::Varchar, Some(63), C::Varchar),
            ("TEXT", T::LongVarchar, None, C::Varchar),
            ("CLOB", T::LongVarchar, None, C::Varchar),
            ("UUID", T::Char, Some(36), C::Varchar),
            ("JSON", T::LongVarchar, None, C::Varchar),
            ("JSONB", T::LongVarchar, None, C::Varchar),
            ("TINYINT", T::TinyInt, Some(1), C::Integer),
            ("SMALLINT", T::SmallInt, Some(2), C::Integer),
            ("INT2", T::SmallInt, Some(2), C::Integer),
            ("INTEGER", T::Integer, Some(4), C::Integer),
            ("INT", T::Integer, Some(4), C::Integer),
            ("INT4", T::Integer, Some(4), C::Integer),
            ("OID", T::Integer, Some(4), C::Integer),
            ("SERIAL", T::Integer, Some(4), C::Integer),
            ("BIGINT", T::BigInt, Some(8), C::Integer),
            ("INT8", T::BigInt, Some(8), C::Integer),
            ("BIGSERIAL", T::BigInt, Some(8), C::Integer),
            ("REAL", T::Real, Some(4), C::Float),
            ("FLOAT4", T::Real, Some(4), C::Float),
            ("FLOAT", T::Float, Some(8), C::Float),
            ("FLOAT8", T::Double, Some(8), C::Float),
            ("DOUBLE", T::Double, Some(8), C::Float),
            ("DOUBLE PRECISION", T::Double, Some(8), C::Float),
            ("DECIMAL", T::Decimal, None, C::Decimal),
            ("NUMERIC", T::Numeric, None, C::Decimal),
            ("MONEY", T::Decimal, None, C::Varchar),
            ("BOOLEAN", T::Boolean, Some(1), C::Boolean),
            ("BOOL", T::Boolean, Some(1), C::Boolean),
            ("BIT", T::Bit, Some(1), C::Varchar),
            ("DATE", T::Date, Some(10), C::Date),
            ("TIME", T::Time, Some(8), C::Time),
            ("TIME WITHOUT TIME ZONE", T::Time, Some(8), C::Time),
            ("TIMETZ", T::Time, None, C::Varchar),
            ("TIME WITH TIME ZONE", T::Time, None, C::Varchar),
            ("TIMESTAMP", T::Timestamp, Some(19), C::Timestamp),
            ("TIMESTAMP WITHOUT TIME ZONE", T::Timestamp, Some(19), C::Timestamp),
            ("TIMESTAMPTZ", T::Timestamp, None, C::Timestamp),
            ("TIMESTAMP WITH TIME ZONE", T::Timestamp, None, C::Timestamp),
            ("DATETIME", T::Timestamp, Some(19), C::Timestamp),
            ("BYTEA", T::VarBinary, None, C::Binary),
            ("BLOB", T::VarBinary, Some(65535), C::Binary),
            ("BINARY", T::Binary, None, C::Binary),
            ("VARBINARY", T::VarBinary, None, C::Binary),
        ];

        let mut registry = Self::new();
        for (name, sql_type, precision, coercion) in table {
            registry.insert(name, TypeEntry::new(*sql_type, *precision, coercion.clone()));
        }
        registry
    }

    pub fn insert(&mut self, name: &str, entry: TypeEntry) {
        self.entries.insert(normalize(name), entry);
    }

    pub fn with(mut self, name: &str, entry: TypeEntry) -> Self {
        self.insert(name, entry);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TypeEntry> {
        self.entries.get(&normalize(name))
    }

    /// Look up a type name, degrading to the `OTHER` entry.
    pub fn lookup(&self, name: &str) -> &TypeEntry {
        self.get(name).unwrap_or(&self.fallback)
    }

    pub fn coercion_for(&self, name: &str) -> Coercion {
        self.lookup(name).coercion.clone()
    }

    /// Parse a possibly parameterized descriptor (`VARCHAR(255)`,
    /// `DECIMAL(10,2)`, `int(11) unsigned`) and resolve it against the
    /// registry. Registry defaults fill in precision and scale only where
    /// the descriptor left them out.
    pub fn parse_descriptor(&self, descriptor: &str) -> TypeDescriptor {
        let descriptor = descriptor.trim();

        let (base, params) = match descriptor.find('(') {
            Some(open) => {
                let close = descriptor[open..]
                    .find(')')
                    .map(|i| open + i)
                    .unwrap_or(descriptor.len());
                (
                    descriptor[..open].trim(),
                    Some(&descriptor[open + 1..close]),
                )
            }
            None => (descriptor, None),
        };

        let (mut precision, mut scale) = (None, None);
        if let Some(params) = params {
            let mut parts = params.splitn(2, ',');
            precision = parts.next().and_then(|p| p.trim().parse::<u32>().ok());
            scale = parts.next().and_then(|s| s.trim().parse::<u32>().ok());
        }

        let (type_name, entry) = self.resolve_base(base);
        TypeDescriptor {
            sql_type: entry.sql_type,
            type_name: type_name.to_string(),
            precision: precision.or(entry.precision),
            scale: scale.or(entry.scale),
        }
    }

    // Try the full name, then drop trailing modifiers (`unsigned`,
    // `zerofill`) one word at a time.
    fn resolve_base<'a>(&self, base: &'a str) -> (&'a str, &TypeEntry) {
        let mut candidate = base;
        loop {
            if let Some(entry) = self.get(candidate) {
                return (candidate, entry);
            }
            match candidate.rfind(char::is_whitespace) {
                Some(pos) => candidate = candidate[..pos].trim_end(),
                None => break,
            }
        }
        let first = base.split_whitespace().next().unwrap_or(base);
        (first, &self.fallback)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_precision_and_scale() {
        let registry = TypeRegistry::standard();
        let desc = registry.parse_descriptor("DECIMAL(10,2)");

        assert_eq!(desc.sql_type, SqlType::Decimal);
        assert_eq!(desc.type_name, "DECIMAL");
        assert_eq!(desc.precision, Some(10));
        assert_eq!(desc.scale, Some(2));
    }

    #[test]
    fn test_parse_falls_back_to_registry_default() {
        let registry = TypeRegistry::standard();
        let desc = registry.parse_descriptor("VARCHAR");

        assert_eq!(desc.sql_type, SqlType::Varchar);
        assert_eq!(desc.precision, Some(255));
        assert_eq!(desc.scale, None);

        let desc = registry.parse_descriptor("varchar(32)");
        assert_eq!(desc.type_name, "varchar");
        assert_eq!(desc.precision, Some(32));
    }

    #[test]
    fn test_parse_strips_modifiers() {
        let registry = TypeRegistry::standard();

        let desc = registry.parse_descriptor("int(11) unsigned");
        assert_eq!(desc.type_name, "int");
        assert_eq!(desc.sql_type, SqlType::Integer);
        assert_eq!(desc.precision, Some(11));

        let desc = registry.parse_descriptor("bigint unsigned");
        assert_eq!(desc.type_name, "bigint");
        assert_eq!(desc.sql_type, SqlType::BigInt);

        let desc = registry.parse_descriptor("character varying");
        assert_eq!(desc.type_name, "character varying");
        assert_eq!(desc.sql_type, SqlType::Varchar);
    }

    #[test]
    fn test_unknown_type_degrades_to_other() {
        let registry = TypeRegistry::standard();
        let desc = registry.parse_descriptor("geometry");

        assert_eq!(desc.sql_type, SqlType::Other);
        assert_eq!(desc.type_name, "geometry");
        assert_eq!(desc.precision, None);
        assert!(matches!(registry.coercion_for("geometry"), Coercion::Varchar));

        // non-numeric parameters are not a precision
        let desc = registry.parse_descriptor("enum('a','b')");
        assert_eq!(desc.sql_type, SqlType::Other);
        assert_eq!(desc.precision, None);
    }

    #[test]
    fn test_coercions() {
        assert_eq!(Coercion::Integer.coerce(Some("19")), Value::Int(19));
        assert_eq!(Coercion::Float.coerce(Some("1.5")), Value::Float(1.5));
        assert_eq!(Coercion::Boolean.coerce(Some("t")), Value::Bool(true));
        assert_eq!(
            Coercion::Decimal.coerce(Some("10.25")),
            Value::Decimal(Decimal::new(1025, 2))
        );
        assert_eq!(
            Coercion::Timestamp.coerce(Some("2009-09-19 08:30:00")),
            Value::Timestamp(
                NaiveDate::from_ymd_opt(2009, 9, 19)
                    .unwrap()
                    .and_hms_opt(8, 30, 0)
                    .unwrap()
            )
        );
        assert_eq!(
            Coercion::Binary.coerce(Some("\\xdead")),
            Value::Bytes(vec![0xde, 0xad])
        );
        assert_eq!(Coercion::Integer.coerce(None), Value::Null);
    }

    #[test]
    fn test_failed_coercion_keeps_text() {
        assert_eq!(
            Coercion::Integer.coerce(Some("nineteen")),
            Value::Text("nineteen".to_string())
        );
        assert_eq!(
            Coercion::Date.coerce(Some("yesterday")),
            Value::Text("yesterday".to_string())
        );
    }

    #[test]
    fn test_custom_coercion() {
        let upper = Coercion::custom(|s| Value::Text(s.to_uppercase()));
        assert_eq!(upper.coerce(Some("joe")), Value::Text("JOE".to_string()));
        assert_eq!(upper.coerce(None), Value::Null);
    }
}
