use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::mysql::{MySqlColumn, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column as _, Connection as _, Either, Executor as _, Row as _, TypeInfo as _};
use tokio::sync::Mutex;

use crate::dispatch::{Arity, Extensible, FuncBlock, FuncSignature, FuncTable};
use crate::drivers::placeholders::{interpolate, mysql_literal, quote_identifier};
use crate::error::{Error, Result};
use crate::handles::AUTO_COMMIT;
use crate::options::ConnectOptions;
use crate::traits::{ConnectionBackend, Driver, StatementBackend};
use crate::types::{
    Coercion, ColumnInfo, RawRow, ResultSet, ScrollDirection, SqlType, TypeEntry, TypeRegistry,
    Value,
};

/// Oldest server (3.23.17) that understands COMMIT and ROLLBACK.
const TRANSACTIONS_SINCE: u32 = 32317;

/// MySQL driver implementation using sqlx over the text protocol.
///
/// Parameters are interpolated client-side, so `?` placeholders work in any
/// statement the server accepts.
pub struct MySqlDriver;

#[async_trait]
impl Driver for MySqlDriver {
    fn name(&self) -> &str {
        "Mysql"
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn ConnectionBackend>> {
        let mut opts = MySqlConnectOptions::new().host(options.get_host().unwrap_or("localhost"));
        if let Some(port) = options.get_port() {
            opts = opts.port(port);
        }
        if let Some(user) = options.get_username() {
            opts = opts.username(user);
        }
        if let Some(password) = options.get_password() {
            opts = opts.password(password);
        }
        if let Some(database) = options.get_database() {
            opts = opts.database(database);
        }
        for (key, value) in options.attributes() {
            match key.as_str() {
                "charset" => opts = opts.charset(value),
                "socket" => opts = opts.socket(value),
                _ => tracing::warn!("ignoring unrecognized connect parameter: {}={}", key, value),
            }
        }

        let mut conn = MySqlConnection::connect_with(&opts)
            .await
            .map_err(|e| Error::Operational(e.to_string()))?;

        let registry = Arc::new(mysql_registry());
        let version = run_text(&mut conn, "SELECT VERSION()", &registry).await?;
        let server_info = version
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().flatten())
            .unwrap_or_default();

        let supports_transactions = version_code(&server_info) >= TRANSACTIONS_SINCE;
        if !supports_transactions {
            tracing::info!(server = %server_info, "server predates transactions, installing stubs");
        }

        Ok(Box::new(MySqlBackend {
            shared: Arc::new(MySqlShared {
                conn: Mutex::new(Some(conn)),
                registry,
                next_plan: AtomicU64::new(0),
                last_insert_id: AtomicU64::new(0),
            }),
            funcs: Arc::new(mysql_funcs()),
            server_info,
            supports_transactions,
            auto_commit: true,
            attributes: HashMap::new(),
        }))
    }
}

/// `major * 10000 + minor * 100 + patch` of a version string such as
/// `8.0.33-0ubuntu0.22.04.2`.
fn version_code(version: &str) -> u32 {
    let numeric: String = version
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric
        .split('.')
        .map(|part| part.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    major * 10000 + minor * 100 + patch
}

/// X/Open type codes, precisions and coercions for MySQL column types.
pub fn mysql_registry() -> TypeRegistry {
    use Coercion as C;
    use SqlType as T;

    let table: &[(&str, T, Option<u32>, C)] = &[
        ("TINYINT", T::TinyInt, Some(1), C::Integer),
        ("SMALLINT", T::SmallInt, Some(6), C::Integer),
        ("MEDIUMINT", T::SmallInt, Some(6), C::Integer),
        ("INT", T::Integer, Some(11), C::Integer),
        ("INTEGER", T::Integer, Some(11), C::Integer),
        ("BIGINT", T::BigInt, Some(25), C::Integer),
        ("INT24", T::BigInt, Some(25), C::Integer),
        ("YEAR", T::SmallInt, Some(4), C::Integer),
        ("BOOLEAN", T::Boolean, Some(1), C::Boolean),
        ("BOOL", T::Boolean, Some(1), C::Boolean),
        ("REAL", T::Real, Some(12), C::Float),
        ("FLOAT", T::Float, Some(12), C::Float),
        ("DOUBLE", T::Double, Some(22), C::Float),
        ("DECIMAL", T::Decimal, Some(12), C::Decimal),
        ("NUMERIC", T::Numeric, Some(12), C::Decimal),
        ("CHAR", T::Char, Some(1), C::Varchar),
        ("VARCHAR", T::Varchar, Some(255), C::Varchar),
        ("TINYTEXT", T::Varchar, Some(255), C::Varchar),
        ("TEXT", T::LongVarchar, Some(65535), C::Varchar),
        ("MEDIUMTEXT", T::LongVarchar, Some(16777215), C::Varchar),
        ("LONGTEXT", T::LongVarchar, Some(4294967295), C::Varchar),
        ("JSON", T::LongVarchar, None, C::Varchar),
        ("ENUM", T::Char, Some(255), C::Varchar),
        ("SET", T::Char, Some(255), C::Varchar),
        ("BIT", T::Bit, Some(8), C::Varchar),
        ("DATE", T::Date, Some(10), C::Date),
        ("TIME", T::Time, Some(8), C::Time),
        ("DATETIME", T::Timestamp, Some(19), C::Timestamp),
        ("TIMESTAMP", T::Timestamp, Some(19), C::Timestamp),
        ("BINARY", T::Binary, Some(255), C::Binary),
        ("VARBINARY", T::VarBinary, Some(255), C::Binary),
        ("TINYBLOB", T::Binary, Some(255), C::Binary),
        ("BLOB", T::VarBinary, Some(65535), C::Binary),
        ("MEDIUMBLOB", T::VarBinary, Some(16777215), C::Binary),
        ("LONGBLOB", T::LongVarBinary, Some(4294967295), C::Binary),
    ];

    let mut registry = TypeRegistry::new();
    for (name, sql_type, precision, coercion) in table {
        registry.insert(name, TypeEntry::new(*sql_type, *precision, coercion.clone()));
    }
    registry
}

fn mysql_funcs() -> FuncTable<MySqlBackend> {
    let mut funcs = FuncTable::new();

    funcs.register("createdb", Arity::Exact(1), |conn: &mut MySqlBackend, args, _| {
        Box::pin(async move {
            let name = args[0].to_text().unwrap_or_default();
            conn.shared
                .query(&format!("CREATE DATABASE {}", quote_identifier(&name)))
                .await?;
            Ok(Value::Null)
        })
    });

    funcs.register("dropdb", Arity::Exact(1), |conn: &mut MySqlBackend, args, _| {
        Box::pin(async move {
            let name = args[0].to_text().unwrap_or_default();
            conn.shared
                .query(&format!("DROP DATABASE {}", quote_identifier(&name)))
                .await?;
            Ok(Value::Null)
        })
    });

    funcs.register("insert_id", Arity::Exact(0), |conn: &mut MySqlBackend, _, _| {
        Box::pin(async move {
            let id = conn.shared.last_insert_id.load(Ordering::SeqCst);
            Ok(Value::Int(id as i64))
        })
    });

    funcs.register("thread_id", Arity::Exact(0), |conn: &mut MySqlBackend, _, _| {
        Box::pin(async move { conn.shared.scalar("SELECT CONNECTION_ID()").await })
    });

    funcs.register("server_info", Arity::Exact(0), |conn: &mut MySqlBackend, _, _| {
        Box::pin(async move { Ok(Value::Text(conn.server_info.clone())) })
    });

    funcs.register("warning_count", Arity::Exact(0), |conn: &mut MySqlBackend, _, _| {
        Box::pin(async move { conn.shared.scalar("SELECT @@warning_count").await })
    });

    funcs
}

/// Rows and counters gathered from one text-protocol round trip.
#[derive(Debug, Default)]
struct QueryOutcome {
    columns: Vec<ColumnInfo>,
    rows: Vec<RawRow>,
    rows_affected: u64,
    last_insert_id: u64,
}

async fn run_text(
    conn: &mut MySqlConnection,
    sql: &str,
    registry: &TypeRegistry,
) -> Result<QueryOutcome> {
    tracing::debug!(sql, "mysql query");
    let mut outcome = QueryOutcome::default();
    let mut stream = (&mut *conn).fetch_many(sql);

    while let Some(item) = stream.try_next().await.map_err(map_error)? {
        match item {
            Either::Left(done) => {
                outcome.rows_affected += done.rows_affected();
                if done.last_insert_id() != 0 {
                    outcome.last_insert_id = done.last_insert_id();
                }
            }
            Either::Right(row) => {
                if outcome.columns.is_empty() {
                    outcome.columns = describe_columns(row.columns(), registry);
                }
                outcome.rows.push(decode_row(&row)?);
            }
        }
    }
    drop(stream);

    // no row to read the columns from, so ask the server
    if outcome.columns.is_empty() && outcome.rows.is_empty() && returns_rows(sql) {
        match (&mut *conn).describe(sql).await {
            Ok(described) => outcome.columns = describe_columns(described.columns(), registry),
            Err(err) => tracing::debug!(error = %err, "could not describe empty result"),
        }
    }
    Ok(outcome)
}

fn describe_columns(columns: &[MySqlColumn], registry: &TypeRegistry) -> Vec<ColumnInfo> {
    columns
        .iter()
        .map(|col| ColumnInfo::from_descriptor(col.name(), col.type_info().name(), registry))
        .collect()
}

/// Whether `sql` starts with a keyword that produces a result set.
fn returns_rows(sql: &str) -> bool {
    let keyword = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        keyword.as_str(),
        "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "WITH" | "VALUES" | "TABLE"
    )
}

fn is_binary(type_name: &str) -> bool {
    type_name.contains("BLOB") || type_name == "BINARY" || type_name == "VARBINARY"
}

fn decode_row(row: &MySqlRow) -> Result<RawRow> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            if !is_binary(col.type_info().name()) {
                if let Ok(text) = row.try_get_unchecked::<Option<String>, _>(i) {
                    return Ok(text);
                }
            }
            let bytes: Option<Vec<u8>> = row.try_get_unchecked(i).map_err(map_error)?;
            Ok(bytes.map(|bytes| {
                let mut hex = String::with_capacity(bytes.len() * 2 + 2);
                hex.push_str("\\x");
                for byte in bytes {
                    let _ = write!(hex, "{:02x}", byte);
                }
                hex
            }))
        })
        .collect()
}

fn map_error(err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.code() {
                Some(code) if code.starts_with("08") => Error::Operational(message),
                Some(code) => Error::Programming(format!("{} (SQLSTATE {})", message, code)),
                None => Error::Programming(message),
            }
        }
        err @ (sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed) => Error::Operational(err.to_string()),
        other => Error::Database(other.to_string()),
    }
}

struct MySqlShared {
    conn: Mutex<Option<MySqlConnection>>,
    registry: Arc<TypeRegistry>,
    next_plan: AtomicU64,
    last_insert_id: AtomicU64,
}

impl MySqlShared {
    async fn query(&self, sql: &str) -> Result<QueryOutcome> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::Operational("connection is closed".to_string()))?;
        let outcome = run_text(conn, sql, &self.registry).await?;
        if outcome.last_insert_id != 0 {
            self.last_insert_id
                .store(outcome.last_insert_id, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    /// First column of the first row, as an integer when it parses as one.
    async fn scalar(&self, sql: &str) -> Result<Value> {
        let outcome = self.query(sql).await?;
        let text = outcome
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().flatten());
        Ok(match text {
            Some(text) => Coercion::Integer.coerce(Some(text.as_str())),
            None => Value::Null,
        })
    }
}

/// A live MySQL connection.
pub struct MySqlBackend {
    shared: Arc<MySqlShared>,
    funcs: Arc<FuncTable<MySqlBackend>>,
    server_info: String,
    supports_transactions: bool,
    auto_commit: bool,
    attributes: HashMap<String, Value>,
}

#[async_trait]
impl Extensible for MySqlBackend {
    fn func_signature(&self, name: &str) -> Option<FuncSignature> {
        self.funcs.signature(name)
    }

    async fn call_func<'a>(
        &'a mut self,
        name: &str,
        args: Vec<Value>,
        block: Option<FuncBlock<'a>>,
    ) -> Result<Value> {
        let funcs = Arc::clone(&self.funcs);
        funcs.call(self, name, args, block).await
    }
}

#[async_trait]
impl ConnectionBackend for MySqlBackend {
    async fn disconnect(&mut self) -> Result<()> {
        let conn = self.shared.conn.lock().await.take();
        match conn {
            Some(conn) => conn.close().await.map_err(map_error),
            None => Ok(()),
        }
    }

    async fn ping(&mut self) -> Result<bool> {
        let mut guard = self.shared.conn.lock().await;
        match guard.as_mut() {
            Some(conn) => Ok(conn.ping().await.is_ok()),
            None => Ok(false),
        }
    }

    async fn prepare(&mut self, sql: &str) -> Result<Box<dyn StatementBackend>> {
        let n = self.shared.next_plan.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MySqlStatement {
            shared: Arc::clone(&self.shared),
            sql: sql.to_string(),
            plan_name: format!("rsdbi:Mysql:{}", n),
            params: Vec::new(),
            result: None,
            columns: Vec::new(),
            rows_affected: None,
        }))
    }

    async fn run(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let bound = interpolate(sql, params)?;
        Ok(self.shared.query(&bound).await?.rows_affected)
    }

    async fn commit(&mut self) -> Result<()> {
        self.shared.query("COMMIT").await.map(drop)
    }

    async fn rollback(&mut self) -> Result<()> {
        self.shared.query("ROLLBACK").await.map(drop)
    }

    async fn tables(&mut self) -> Result<Vec<String>> {
        let outcome = self.shared.query("SHOW TABLES").await?;
        Ok(outcome
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    async fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        let table = quote_identifier(table);

        // SHOW INDEX: Non_unique is column 1, Column_name column 4
        let indexes = self
            .shared
            .query(&format!("SHOW INDEX FROM {}", table))
            .await?;
        let mut unique = HashSet::new();
        for row in indexes.rows {
            if let (Some(Some(non_unique)), Some(Some(name))) = (row.get(1), row.get(4)) {
                if non_unique == "0" {
                    unique.insert(name.clone());
                }
            }
        }

        // SHOW FIELDS: Field, Type, Null, Key, Default, Extra
        let fields = self
            .shared
            .query(&format!("SHOW FIELDS FROM {}", table))
            .await?;
        let mut columns = Vec::with_capacity(fields.rows.len());
        for row in fields.rows {
            let field = |i: usize| row.get(i).cloned().flatten();
            let name = field(0).unwrap_or_default();
            let key = field(3).unwrap_or_default();

            let mut info =
                ColumnInfo::from_descriptor(&name, &field(1).unwrap_or_default(), &self.shared.registry);
            info.nullable = Some(field(2).as_deref() == Some("YES"));
            info.indexed = Some(!key.is_empty());
            info.primary = Some(key == "PRI");
            info.unique = Some(unique.contains(&name));
            info.default = field(4);
            if info.type_name.eq_ignore_ascii_case("timestamp") {
                info.coercion = Some(Coercion::Timestamp);
            }
            columns.push(info);
        }
        Ok(columns)
    }

    async fn database_name(&mut self) -> Result<String> {
        let outcome = self.shared.query("SELECT DATABASE()").await?;
        Ok(outcome
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().flatten())
            .unwrap_or_default())
    }

    fn attribute(&self, key: &str) -> Option<Value> {
        match key {
            AUTO_COMMIT => Some(Value::Bool(self.auto_commit)),
            _ => self.attributes.get(key).cloned(),
        }
    }

    async fn set_attribute(&mut self, key: &str, value: Value) -> Result<()> {
        if key == AUTO_COMMIT {
            let enabled = value.as_bool().unwrap_or(true);
            let sql = if enabled { "SET AUTOCOMMIT=1" } else { "SET AUTOCOMMIT=0" };
            self.shared.query(sql).await?;
            self.auto_commit = enabled;
        } else {
            self.attributes.insert(key.to_string(), value);
        }
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        self.supports_transactions
    }

    fn type_registry(&self) -> Arc<TypeRegistry> {
        Arc::clone(&self.shared.registry)
    }

    fn quote(&self, value: &Value) -> String {
        mysql_literal(value)
    }
}

/// A statement whose parameters are interpolated at execute time.
pub struct MySqlStatement {
    shared: Arc<MySqlShared>,
    sql: String,
    plan_name: String,
    params: Vec<Value>,
    result: Option<ResultSet>,
    columns: Vec<ColumnInfo>,
    rows_affected: Option<u64>,
}

impl Extensible for MySqlStatement {}

#[async_trait]
impl StatementBackend for MySqlStatement {
    fn plan_name(&self) -> &str {
        &self.plan_name
    }

    fn bind_param(&mut self, position: usize, value: Value) -> Result<()> {
        if position == 0 {
            return Err(Error::interface("bind positions start at 1"));
        }
        if self.params.len() < position {
            self.params.resize(position, Value::Null);
        }
        self.params[position - 1] = value;
        Ok(())
    }

    async fn execute(&mut self) -> Result<()> {
        let bound = interpolate(&self.sql, &self.params)?;
        let outcome = self.shared.query(&bound).await?;
        self.rows_affected = Some(outcome.rows_affected);
        self.columns = outcome.columns;
        self.result = Some(ResultSet::new(outcome.rows));
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Option<RawRow>> {
        Ok(self.result.as_mut().and_then(ResultSet::next_row))
    }

    async fn fetch_scroll(&mut self, direction: ScrollDirection) -> Result<Option<RawRow>> {
        Ok(self.result.as_mut().and_then(|r| r.scroll(direction)))
    }

    async fn cancel(&mut self) -> Result<()> {
        self.result = None;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.result = None;
        self.params.clear();
        Ok(())
    }

    async fn column_info(&mut self) -> Result<Vec<ColumnInfo>> {
        Ok(self.columns.clone())
    }

    fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_code() {
        assert_eq!(version_code("3.23.17-log"), 32317);
        assert_eq!(version_code("8.0.33-0ubuntu0.22.04.2"), 80033);
        assert_eq!(version_code("5.1"), 50100);
        assert!(version_code("3.22.32") < TRANSACTIONS_SINCE);
        assert_eq!(version_code("garbage"), 0);
    }

    #[test]
    fn test_registry_maps_xopen_types() {
        let registry = mysql_registry();

        let int = registry.parse_descriptor("int(11) unsigned");
        assert_eq!(int.sql_type, SqlType::Integer);
        assert_eq!(int.precision, Some(11));

        let decimal = registry.parse_descriptor("decimal(10,2)");
        assert_eq!(decimal.sql_type, SqlType::Decimal);
        assert_eq!((decimal.precision, decimal.scale), (Some(10), Some(2)));

        assert_eq!(registry.lookup("LONGBLOB").sql_type, SqlType::LongVarBinary);
        assert_eq!(
            registry.coercion_for("datetime").coerce(Some("2009-09-19 10:00:00")),
            Value::Timestamp(
                chrono::NaiveDate::from_ymd_opt(2009, 9, 19)
                    .unwrap()
                    .and_hms_opt(10, 0, 0)
                    .unwrap()
            )
        );
    }

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("SELECT id FROM t WHERE 1 = 0"));
        assert!(returns_rows("  select 1"));
        assert!(returns_rows("(SELECT 1) UNION (SELECT 2)"));
        assert!(returns_rows("show tables"));
        assert!(!returns_rows("UPDATE t SET x = 1"));
        assert!(!returns_rows("INSERT INTO t SELECT * FROM u"));
        assert!(!returns_rows(""));
    }

    fn detached_shared() -> Arc<MySqlShared> {
        Arc::new(MySqlShared {
            conn: Mutex::new(None),
            registry: Arc::new(mysql_registry()),
            next_plan: AtomicU64::new(0),
            last_insert_id: AtomicU64::new(0),
        })
    }

    fn detached_statement() -> MySqlStatement {
        MySqlStatement {
            shared: detached_shared(),
            sql: "SELECT ?, ?".to_string(),
            plan_name: "rsdbi:Mysql:1".to_string(),
            params: Vec::new(),
            result: None,
            columns: Vec::new(),
            rows_affected: None,
        }
    }

    #[test]
    fn test_bind_position_zero_is_rejected() {
        let mut sth = detached_statement();

        let err = sth.bind_param(0, Value::Int(1)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Interface);
        assert!(sth.params.is_empty());

        sth.bind_param(2, Value::Int(2)).unwrap();
        assert_eq!(sth.params, vec![Value::Null, Value::Int(2)]);
    }

    #[tokio::test]
    async fn test_execute_after_disconnect() {
        let mut sth = detached_statement();
        sth.bind_params(vec![Value::Int(1), Value::Int(2)]).unwrap();

        let err = sth.execute().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Operational);
    }

    #[test]
    fn test_quote_uses_backslash_escapes() {
        let backend = MySqlBackend {
            shared: detached_shared(),
            funcs: Arc::new(mysql_funcs()),
            server_info: "8.0.33".to_string(),
            supports_transactions: true,
            auto_commit: true,
            attributes: HashMap::new(),
        };

        assert_eq!(backend.quote(&Value::from("it's")), "'it\\'s'");
        assert_eq!(backend.quote(&Value::Bool(true)), "1");
        assert_eq!(backend.quote(&Value::Null), "NULL");
    }

    #[test]
    fn test_binary_types() {
        assert!(is_binary("MEDIUMBLOB"));
        assert!(is_binary("VARBINARY"));
        assert!(!is_binary("VARCHAR"));
    }
}
