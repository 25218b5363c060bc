use std::fmt::Write;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::dispatch::Extensible;
use crate::error::{Error, Result};
use crate::types::{ColumnInfo, RawRow, ScrollDirection, TypeRegistry, Value};

/// The registry used by backends that don't supply their own.
pub fn standard_registry() -> Arc<TypeRegistry> {
    static STANDARD: OnceLock<Arc<TypeRegistry>> = OnceLock::new();
    Arc::clone(STANDARD.get_or_init(|| Arc::new(TypeRegistry::standard())))
}

/// One live connection, as a driver implements it.
///
/// Backends deal in raw text rows and native errors translated to
/// [`Error`]. Lifecycle rules (closed handles, autocommit bookkeeping,
/// scoped cleanup) live in the handles, not here.
#[async_trait]
pub trait ConnectionBackend: Extensible + Send {
    /// Release the connection. Called at most once.
    async fn disconnect(&mut self) -> Result<()>;

    async fn ping(&mut self) -> Result<bool>;

    /// Prepare `sql`, which uses `?` placeholders.
    async fn prepare(&mut self, sql: &str) -> Result<Box<dyn StatementBackend>>;

    /// Run a statement once and return the affected row count.
    async fn run(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn tables(&mut self) -> Result<Vec<String>>;

    async fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>>;

    async fn database_name(&mut self) -> Result<String>;

    fn attribute(&self, key: &str) -> Option<Value>;

    async fn set_attribute(&mut self, key: &str, value: Value) -> Result<()>;

    /// Whether the server can commit and roll back. Decided at connect time.
    fn supports_transactions(&self) -> bool {
        true
    }

    fn type_registry(&self) -> Arc<TypeRegistry> {
        standard_registry()
    }

    /// `value` written as a literal this server accepts inside SQL text.
    fn quote(&self, value: &Value) -> String {
        standard_literal(value)
    }
}

/// SQL literal with single quotes doubled; bytes in `'\x..'` hex form.
pub(crate) fn standard_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_owned(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_owned(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::Bytes(bytes) => {
            let mut hex = String::with_capacity(bytes.len() * 2 + 4);
            hex.push_str("'\\x");
            for byte in bytes {
                let _ = write!(hex, "{:02x}", byte);
            }
            hex.push('\'');
            hex
        }
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// One prepared statement, as a driver implements it.
#[async_trait]
pub trait StatementBackend: Extensible + Send {
    /// Name unique among the statements of one connection.
    fn plan_name(&self) -> &str;

    /// Bind a value to the 1-based placeholder `position`.
    fn bind_param(&mut self, position: usize, value: Value) -> Result<()>;

    fn bind_params(&mut self, values: Vec<Value>) -> Result<()> {
        for (i, value) in values.into_iter().enumerate() {
            self.bind_param(i + 1, value)?;
        }
        Ok(())
    }

    async fn execute(&mut self) -> Result<()>;

    /// Next row of the current result, `None` once exhausted.
    async fn fetch(&mut self) -> Result<Option<RawRow>>;

    async fn fetch_scroll(&mut self, direction: ScrollDirection) -> Result<Option<RawRow>> {
        match direction {
            ScrollDirection::Next => self.fetch().await,
            other => Err(Error::not_supported(format!(
                "scrolling {:?} is not supported by this driver",
                other
            ))),
        }
    }

    /// Drop the pending result. The prepared statement stays usable.
    async fn cancel(&mut self) -> Result<()>;

    /// Release the prepared statement. Called at most once.
    async fn finish(&mut self) -> Result<()>;

    /// Column metadata of the last execution.
    async fn column_info(&mut self) -> Result<Vec<ColumnInfo>>;

    fn rows_affected(&self) -> Option<u64>;

    fn attribute(&self, _key: &str) -> Option<Value> {
        None
    }

    fn set_attribute(&mut self, key: &str, _value: Value) -> Result<()> {
        Err(Error::not_supported(format!(
            "statement attribute {:?} is not supported by this driver",
            key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_literal() {
        assert_eq!(standard_literal(&Value::Null), "NULL");
        assert_eq!(standard_literal(&Value::Bool(false)), "FALSE");
        assert_eq!(standard_literal(&Value::Int(-3)), "-3");
        assert_eq!(standard_literal(&Value::from("O'Reilly")), "'O''Reilly'");
        assert_eq!(standard_literal(&Value::from("a\\b")), "'a\\b'");
        assert_eq!(standard_literal(&Value::Float(f64::NAN)), "'NaN'");
        assert_eq!(standard_literal(&Value::Bytes(vec![0xde, 0xad])), "'\\xdead'");
    }
}
