use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::Write;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio_postgres::types::{FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::{Client, Config, CopyInSink, CopyOutStream, NoTls, Statement};

use crate::dispatch::{Arity, Extensible, FuncBlock, FuncSignature, FuncTable};
use crate::drivers::placeholders;
use crate::error::{Error, Result};
use crate::handles::AUTO_COMMIT;
use crate::options::ConnectOptions;
use crate::traits::{standard_registry, ConnectionBackend, Driver, StatementBackend};
use crate::types::{
    parse_bool, parse_timestamp, ColumnInfo, RawRow, ResultSet, ScrollDirection, TypeRegistry,
    Value,
};

const NATIVE_BINDING: &str = "pg_native_binding";
const ROW_COUNT: &str = "pg_row_count";

/// PostgreSQL driver implementation using tokio-postgres.
pub struct PgDriver;

#[async_trait]
impl Driver for PgDriver {
    fn name(&self) -> &str {
        "Pg"
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn ConnectionBackend>> {
        let mut config = Config::new();
        config.host(options.get_host().unwrap_or("localhost"));
        if let Some(port) = options.get_port() {
            config.port(port);
        }
        if let Some(user) = options.get_username() {
            config.user(user);
        }
        if let Some(password) = options.get_password() {
            config.password(password);
        }
        if let Some(database) = options.get_database() {
            config.dbname(database);
        }
        for (key, value) in options.attributes() {
            match key.as_str() {
                "application_name" => {
                    config.application_name(value);
                }
                "options" => {
                    config.options(value);
                }
                "connect_timeout" => {
                    let secs = value.parse::<u64>().map_err(|_| {
                        Error::interface(format!("connect_timeout must be seconds, got {:?}", value))
                    })?;
                    config.connect_timeout(Duration::from_secs(secs));
                }
                _ => tracing::warn!("ignoring unrecognized connect parameter: {}={}", key, value),
            }
        }

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| Error::Operational(e.to_string()))?;

        // Spawn the connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "PostgreSQL connection error");
            }
        });

        Ok(Box::new(PgBackend {
            shared: Arc::new(PgShared {
                client,
                auto_commit: AtomicBool::new(true),
                in_transaction: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                next_plan: AtomicU64::new(0),
            }),
            funcs: Arc::new(pg_funcs()),
            registry: standard_registry(),
            attributes: HashMap::new(),
            copy: None,
        }))
    }
}

struct PgShared {
    client: Client,
    auto_commit: AtomicBool,
    in_transaction: AtomicBool,
    closed: AtomicBool,
    next_plan: AtomicU64,
}

impl PgShared {
    fn client(&self) -> Result<&Client> {
        if self.closed.load(Ordering::SeqCst) || self.client.is_closed() {
            return Err(Error::Operational("connection is closed".to_string()));
        }
        Ok(&self.client)
    }

    // With autocommit off, every statement runs inside a transaction that
    // commit or rollback ends.
    async fn begin_if_needed(&self) -> Result<()> {
        if !self.auto_commit.load(Ordering::SeqCst) && !self.in_transaction.load(Ordering::SeqCst) {
            self.client()?.batch_execute("BEGIN").await.map_err(map_error)?;
            self.in_transaction.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn end_transaction(&self, sql: &str) -> Result<()> {
        if self.in_transaction.swap(false, Ordering::SeqCst) {
            self.client()?.batch_execute(sql).await.map_err(map_error)?;
        }
        Ok(())
    }

    async fn prepare(&self, sql: &str) -> Result<Statement> {
        let (sql, _) = placeholders::numbered(sql);
        self.client()?.prepare(&sql).await.map_err(map_error)
    }
}

fn pg_funcs() -> FuncTable<PgBackend> {
    let mut funcs = FuncTable::new();

    funcs.register("server_version", Arity::Exact(0), |conn: &mut PgBackend, _, _| {
        Box::pin(async move {
            let row = conn
                .shared
                .client()?
                .query_one("SELECT current_setting('server_version')", &[])
                .await
                .map_err(map_error)?;
            let version: String = row.try_get(0).map_err(map_error)?;
            Ok(Value::Text(version))
        })
    });

    funcs.register("backend_pid", Arity::Exact(0), |conn: &mut PgBackend, _, _| {
        Box::pin(async move {
            let row = conn
                .shared
                .client()?
                .query_one("SELECT pg_backend_pid()", &[])
                .await
                .map_err(map_error)?;
            let pid: i32 = row.try_get(0).map_err(map_error)?;
            Ok(Value::Int(i64::from(pid)))
        })
    });

    funcs.register("notify", Arity::AtLeast(1), |conn: &mut PgBackend, args, _| {
        Box::pin(async move {
            if args.len() > 2 {
                return Err(Error::interface("notify takes a channel and an optional payload"));
            }
            let channel = args[0].to_text().unwrap_or_default();
            let payload = args.get(1).and_then(Value::to_text).unwrap_or_default();
            conn.shared
                .client()?
                .execute("SELECT pg_notify($1, $2)", &[&channel, &payload])
                .await
                .map_err(map_error)?;
            Ok(Value::Null)
        })
    });

    funcs.register("put_copy_data", Arity::Exact(1), |conn: &mut PgBackend, args, _| {
        Box::pin(async move {
            let data = match &args[0] {
                Value::Bytes(bytes) => Bytes::from(bytes.clone()),
                other => Bytes::from(other.to_text().unwrap_or_default()),
            };
            match conn.copy.as_mut() {
                Some(PgCopy::In(sink)) => {
                    sink.send(data).await.map_err(map_error)?;
                    Ok(Value::Bool(true))
                }
                _ => Err(no_copy("FROM STDIN")),
            }
        })
    });

    funcs.register("put_copy_end", Arity::AtLeast(0), |conn: &mut PgBackend, args, _| {
        Box::pin(async move {
            if args.len() > 1 {
                return Err(Error::interface("put_copy_end takes an optional error message"));
            }
            let mut sink = match conn.copy.take() {
                Some(PgCopy::In(sink)) => sink,
                other => {
                    conn.copy = other;
                    return Err(no_copy("FROM STDIN"));
                }
            };
            match args.first().and_then(Value::to_text) {
                Some(reason) => {
                    // an unfinished sink makes the server abort the COPY
                    tracing::debug!(reason = %reason, "aborting COPY FROM STDIN");
                    drop(sink);
                }
                None => {
                    sink.as_mut().finish().await.map_err(map_error)?;
                }
            }
            Ok(Value::Bool(true))
        })
    });

    funcs.register("get_copy_data", Arity::Exact(0), |conn: &mut PgBackend, _, _| {
        Box::pin(async move {
            let stream = match conn.copy.as_mut() {
                Some(PgCopy::Out(stream)) => stream,
                _ => return Err(no_copy("TO STDOUT")),
            };
            match stream.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(map_error)?;
                    Ok(Value::Text(String::from_utf8_lossy(&chunk).into_owned()))
                }
                None => {
                    conn.copy = None;
                    Ok(Value::Null)
                }
            }
        })
    });

    funcs
}

fn no_copy(direction: &str) -> Error {
    Error::Database(format!("no COPY {} in progress", direction))
}

/// A COPY started by `run` and driven by the copy functions.
enum PgCopy {
    In(Pin<Box<CopyInSink<Bytes>>>),
    Out(Pin<Box<CopyOutStream>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyDirection {
    In,
    Out,
}

/// Recognise `COPY ... FROM STDIN` and `COPY ... TO STDOUT`.
fn copy_direction(sql: &str) -> Option<CopyDirection> {
    let normalized = sql
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();
    if !normalized.starts_with("COPY ") {
        return None;
    }
    if normalized.contains(" FROM STDIN") {
        Some(CopyDirection::In)
    } else if normalized.contains(" TO STDOUT") {
        Some(CopyDirection::Out)
    } else {
        None
    }
}

/// A live PostgreSQL connection.
pub struct PgBackend {
    shared: Arc<PgShared>,
    funcs: Arc<FuncTable<PgBackend>>,
    registry: Arc<TypeRegistry>,
    attributes: HashMap<String, Value>,
    copy: Option<PgCopy>,
}

impl PgBackend {
    async fn start_copy(&mut self, sql: &str, direction: CopyDirection) -> Result<u64> {
        self.shared.begin_if_needed().await?;
        let client = self.shared.client()?;
        let copy = match direction {
            CopyDirection::In => {
                PgCopy::In(Box::pin(client.copy_in(sql).await.map_err(map_error)?))
            }
            CopyDirection::Out => {
                PgCopy::Out(Box::pin(client.copy_out(sql).await.map_err(map_error)?))
            }
        };
        tracing::debug!(sql, "COPY started");
        self.copy = Some(copy);
        Ok(0)
    }

    async fn query_text_rows(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<RawRow>> {
        let rows = self
            .shared
            .client()?
            .query(sql, params)
            .await
            .map_err(map_error)?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl Extensible for PgBackend {
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
impl ConnectionBackend for PgBackend {
    async fn disconnect(&mut self) -> Result<()> {
        self.copy = None;
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&mut self) -> Result<bool> {
        let client = match self.shared.client() {
            Ok(client) => client,
            Err(_) => return Ok(false),
        };
        Ok(client.simple_query("SELECT 1").await.is_ok())
    }

    async fn prepare(&mut self, sql: &str) -> Result<Box<dyn StatementBackend>> {
        let statement = self.shared.prepare(sql).await?;
        let n = self.shared.next_plan.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(PgStatement {
            shared: Arc::clone(&self.shared),
            registry: Arc::clone(&self.registry),
            plan_name: format!("rsdbi:Pg:{}", n),
            statement,
            params: Vec::new(),
            result: None,
            columns: Vec::new(),
            rows_affected: None,
        }))
    }

    async fn run(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        if let Some(direction) = copy_direction(sql) {
            if !params.is_empty() {
                return Err(Error::interface("COPY takes no bind parameters"));
            }
            return self.start_copy(sql, direction).await;
        }
        let statement = self.shared.prepare(sql).await?;
        let encoded = encode_params(&statement, params)?;
        self.shared.begin_if_needed().await?;
        // SELECT reports its row count here as well
        self.shared
            .client()?
            .execute(&statement, &param_refs(&encoded))
            .await
            .map_err(map_error)
    }

    async fn commit(&mut self) -> Result<()> {
        self.shared.end_transaction("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.shared.end_transaction("ROLLBACK").await
    }

    async fn tables(&mut self) -> Result<Vec<String>> {
        let rows = self
            .query_text_rows(
                "SELECT tablename::text FROM pg_catalog.pg_tables \
                 WHERE schemaname NOT IN ('pg_catalog', 'information_schema') \
                 UNION SELECT viewname::text FROM pg_catalog.pg_views \
                 WHERE schemaname NOT IN ('pg_catalog', 'information_schema') \
                 ORDER BY 1",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    async fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        let indexes = self
            .query_text_rows(
                "SELECT a.attname::text, i.indisprimary::text, i.indisunique::text \
                 FROM pg_catalog.pg_index i \
                 JOIN pg_catalog.pg_class t ON t.oid = i.indrelid \
                 JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(i.indkey) \
                 WHERE t.relname = $1::text",
                &[&table],
            )
            .await?;

        let mut index_flags: HashMap<String, (bool, bool)> = HashMap::new();
        for row in indexes {
            let [Some(name), primary, unique] = <[Option<String>; 3]>::try_from(row)
                .map_err(|_| Error::Database("unexpected index row shape".to_string()))?
            else {
                continue;
            };
            let flags = index_flags.entry(name).or_default();
            flags.0 |= primary.as_deref().and_then(parse_bool).unwrap_or(false);
            flags.1 |= unique.as_deref().and_then(parse_bool).unwrap_or(false);
        }

        let rows = self
            .query_text_rows(
                "SELECT column_name::text, data_type::text, is_nullable::text, \
                 column_default::text, character_maximum_length::text, \
                 numeric_precision::text, numeric_scale::text, udt_name::text \
                 FROM information_schema.columns WHERE table_name::text = $1 \
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let field = |i: usize| row.get(i).cloned().flatten();
            let name = field(0).unwrap_or_default();
            let data_type = field(1).unwrap_or_default();

            let mut info = if data_type == "ARRAY" {
                let udt = field(7).unwrap_or_default();
                let mut info = ColumnInfo::from_descriptor(&name, &udt, &self.registry);
                info.array_of_type = Some(udt.trim_start_matches('_').to_string());
                info
            } else {
                ColumnInfo::from_descriptor(&name, &data_type, &self.registry)
            };

            info.nullable = field(2).map(|n| n == "YES");
            info.default = field(3);
            if let Some(precision) = field(4).or_else(|| field(5)).and_then(|p| p.parse().ok()) {
                info.precision = Some(precision);
            }
            if let Some(scale) = field(6).and_then(|s| s.parse().ok()) {
                info.scale = Some(scale);
            }

            let (primary, unique) = index_flags.get(&name).copied().unwrap_or_default();
            info.indexed = Some(index_flags.contains_key(&name));
            info.primary = Some(primary);
            info.unique = Some(unique);
            columns.push(info);
        }
        Ok(columns)
    }

    async fn database_name(&mut self) -> Result<String> {
        let rows = self
            .query_text_rows("SELECT current_database()::text", &[])
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().flatten())
            .unwrap_or_default())
    }

    fn attribute(&self, key: &str) -> Option<Value> {
        match key {
            AUTO_COMMIT => Some(Value::Bool(self.shared.auto_commit.load(Ordering::SeqCst))),
            NATIVE_BINDING => Some(Value::Bool(true)),
            _ => self.attributes.get(key).cloned(),
        }
    }

    async fn set_attribute(&mut self, key: &str, value: Value) -> Result<()> {
        match key {
            AUTO_COMMIT => {
                let enabled = value.as_bool().unwrap_or(true);
                if enabled {
                    self.shared.end_transaction("COMMIT").await?;
                }
                self.shared.auto_commit.store(enabled, Ordering::SeqCst);
            }
            NATIVE_BINDING => {
                if value.as_bool() != Some(true) {
                    return Err(Error::interface(
                        "pg_native_binding cannot be turned off: parameters are always bound server-side",
                    ));
                }
            }
            _ => {
                self.attributes.insert(key.to_string(), value);
            }
        }
        Ok(())
    }
}

/// A server-side prepared statement with a buffered result.
pub struct PgStatement {
    shared: Arc<PgShared>,
    registry: Arc<TypeRegistry>,
    plan_name: String,
    statement: Statement,
    params: Vec<Value>,
    result: Option<ResultSet>,
    columns: Vec<ColumnInfo>,
    rows_affected: Option<u64>,
}

impl Extensible for PgStatement {}

#[async_trait]
impl StatementBackend for PgStatement {
    fn plan_name(&self) -> &str {
        &self.plan_name
    }

    fn bind_param(&mut self, position: usize, value: Value) -> Result<()> {
        let expected = self.statement.params().len();
        if position == 0 || position > expected {
            return Err(Error::interface(format!(
                "bind position {} out of range, statement takes {} parameters",
                position, expected
            )));
        }
        if self.params.len() < position {
            self.params.resize(position, Value::Null);
        }
        self.params[position - 1] = value;
        Ok(())
    }

    async fn execute(&mut self) -> Result<()> {
        let encoded = encode_params(&self.statement, &self.params)?;
        self.shared.begin_if_needed().await?;
        let client = self.shared.client()?;

        if self.statement.columns().is_empty() {
            let affected = client
                .execute(&self.statement, &param_refs(&encoded))
                .await
                .map_err(map_error)?;
            self.rows_affected = Some(affected);
            self.result = Some(ResultSet::empty());
        } else {
            let rows = client
                .query(&self.statement, &param_refs(&encoded))
                .await
                .map_err(map_error)?;
            self.rows_affected = Some(rows.len() as u64);
            self.result = Some(ResultSet::new(
                rows.iter().map(decode_row).collect::<Result<_>>()?,
            ));
        }

        self.columns = self
            .statement
            .columns()
            .iter()
            .map(|col| column_info(col.name(), col.type_(), &self.registry))
            .collect();
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

    // the server-side statement is closed when `statement` drops
    async fn finish(&mut self) -> Result<()> {
        self.result = None;
        Ok(())
    }

    async fn column_info(&mut self) -> Result<Vec<ColumnInfo>> {
        Ok(self.columns.clone())
    }

    fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    fn attribute(&self, key: &str) -> Option<Value> {
        match key {
            ROW_COUNT => self.rows_affected.map(|n| Value::Int(n as i64)),
            _ => None,
        }
    }
}

fn column_info(name: &str, ty: &Type, registry: &TypeRegistry) -> ColumnInfo {
    let mut info = ColumnInfo::from_descriptor(name, ty.name(), registry);
    if let Kind::Array(element) = ty.kind() {
        info.array_of_type = Some(element.name().to_string());
    }
    info
}

fn map_error(err: tokio_postgres::Error) -> Error {
    if err.is_closed() {
        return Error::Operational(err.to_string());
    }
    match err.as_db_error() {
        Some(db) => {
            let code = db.code().code();
            // connection, resource and operator-intervention classes
            if code.starts_with("08") || code.starts_with("53") || code.starts_with("57") {
                Error::Operational(db.message().to_string())
            } else {
                Error::Programming(format!("{} (SQLSTATE {})", db.message(), code))
            }
        }
        None => Error::Database(err.to_string()),
    }
}

type Param = Box<dyn ToSql + Sync + Send>;

fn param_refs(encoded: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    encoded
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn encode_params(statement: &Statement, params: &[Value]) -> Result<Vec<Param>> {
    let types = statement.params();
    if params.len() != types.len() {
        return Err(Error::interface(format!(
            "wrong number of bind parameters ({} for {})",
            params.len(),
            types.len()
        )));
    }
    params
        .iter()
        .zip(types)
        .map(|(value, ty)| encode_param(value, ty))
        .collect()
}

/// Convert a Value to a boxed ToSql matching the parameter type the server
/// inferred.
fn encode_param(value: &Value, ty: &Type) -> Result<Param> {
    let param: Param = match value {
        Value::Null => Box::new(PgNull),
        Value::Text(s) => return encode_text(s, ty),
        Value::Bool(b) => match *ty {
            Type::BOOL => Box::new(*b),
            Type::INT2 | Type::INT4 | Type::INT8 => {
                return encode_param(&Value::Int(i64::from(*b)), ty)
            }
            _ => Box::new(PgText(if *b { "t" } else { "f" }.to_string())),
        },
        Value::Int(i) => match *ty {
            Type::INT2 => Box::new(i16::try_from(*i).map_err(|_| out_of_range(value, ty))?),
            Type::INT4 => Box::new(i32::try_from(*i).map_err(|_| out_of_range(value, ty))?),
            Type::INT8 => Box::new(*i),
            Type::OID => Box::new(u32::try_from(*i).map_err(|_| out_of_range(value, ty))?),
            Type::FLOAT4 => Box::new(*i as f32),
            Type::FLOAT8 => Box::new(*i as f64),
            Type::NUMERIC => Box::new(Decimal::from(*i)),
            Type::BOOL => Box::new(*i != 0),
            _ => Box::new(PgText(i.to_string())),
        },
        Value::Float(f) => match *ty {
            Type::FLOAT4 => Box::new(*f as f32),
            Type::FLOAT8 => Box::new(*f),
            Type::NUMERIC => Box::new(Decimal::try_from(*f).map_err(|_| out_of_range(value, ty))?),
            _ => Box::new(PgText(f.to_string())),
        },
        Value::Decimal(d) => match *ty {
            Type::NUMERIC => Box::new(*d),
            Type::FLOAT4 | Type::FLOAT8 => {
                let f = d.to_f64().ok_or_else(|| out_of_range(value, ty))?;
                return encode_param(&Value::Float(f), ty);
            }
            _ => Box::new(PgText(d.to_string())),
        },
        Value::Bytes(bytes) => match *ty {
            Type::BYTEA => Box::new(bytes.clone()),
            _ => Box::new(PgText(String::from_utf8_lossy(bytes).into_owned())),
        },
        Value::Date(d) => match *ty {
            Type::DATE => Box::new(*d),
            _ => return encode_text(&value.to_string(), ty),
        },
        Value::Time(t) => match *ty {
            Type::TIME => Box::new(*t),
            _ => return encode_text(&value.to_string(), ty),
        },
        Value::Timestamp(ts) => match *ty {
            Type::TIMESTAMP => Box::new(*ts),
            Type::TIMESTAMPTZ => Box::new(Utc.from_utc_datetime(ts)),
            _ => return encode_text(&value.to_string(), ty),
        },
    };
    Ok(param)
}

fn encode_text(s: &str, ty: &Type) -> Result<Param> {
    let param: Param = match *ty {
        Type::BOOL => Box::new(parse_bool(s).ok_or_else(|| invalid_input(s, ty))?),
        Type::INT2 => Box::new(parse_number::<i16>(s, ty)?),
        Type::INT4 => Box::new(parse_number::<i32>(s, ty)?),
        Type::INT8 => Box::new(parse_number::<i64>(s, ty)?),
        Type::OID => Box::new(parse_number::<u32>(s, ty)?),
        Type::FLOAT4 => Box::new(parse_number::<f32>(s, ty)?),
        Type::FLOAT8 => Box::new(parse_number::<f64>(s, ty)?),
        Type::NUMERIC => Box::new(parse_number::<Decimal>(s, ty)?),
        Type::DATE => Box::new(
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| invalid_input(s, ty))?,
        ),
        Type::TIME => Box::new(
            NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f").map_err(|_| invalid_input(s, ty))?,
        ),
        Type::TIMESTAMP => Box::new(parse_timestamp(s.trim()).ok_or_else(|| invalid_input(s, ty))?),
        Type::TIMESTAMPTZ => {
            let ts: DateTime<Utc> = match DateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S%.f%#z") {
                Ok(ts) => ts.with_timezone(&Utc),
                Err(_) => Utc.from_utc_datetime(
                    &parse_timestamp(s.trim()).ok_or_else(|| invalid_input(s, ty))?,
                ),
            };
            Box::new(ts)
        }
        Type::BYTEA => Box::new(s.as_bytes().to_vec()),
        _ => Box::new(PgText(s.to_string())),
    };
    Ok(param)
}

fn parse_number<T: FromStr>(s: &str, ty: &Type) -> Result<T> {
    s.trim().parse::<T>().map_err(|_| invalid_input(s, ty))
}

fn invalid_input(s: &str, ty: &Type) -> Error {
    Error::Programming(format!("invalid input syntax for type {}: {:?}", ty.name(), s))
}

fn out_of_range(value: &Value, ty: &Type) -> Error {
    Error::Programming(format!("value {} out of range for type {}", value, ty.name()))
}

/// NULL of whatever type the server expects.
#[derive(Debug)]
struct PgNull;

impl ToSql for PgNull {
    fn to_sql(&self, _: &Type, _: &mut BytesMut) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    fn to_sql_checked(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        self.to_sql(ty, out)
    }
}

/// Text sent as the binary form of a text-like type.
#[derive(Debug)]
struct PgText(String);

impl ToSql for PgText {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match *ty {
            Type::JSONB => {
                out.extend_from_slice(&[1]);
                out.extend_from_slice(self.0.as_bytes());
            }
            Type::UUID => out.extend_from_slice(&parse_uuid(&self.0)?),
            _ => out.extend_from_slice(self.0.as_bytes()),
        }
        Ok(IsNull::No)
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    fn to_sql_checked(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        self.to_sql(ty, out)
    }
}

fn parse_uuid(s: &str) -> std::result::Result<[u8; 16], Box<dyn StdError + Sync + Send>> {
    let hex: String = s.chars().filter(|c| *c != '-').collect();
    let mut bytes = [0u8; 16];
    if hex.len() != 32 {
        return Err(format!("invalid uuid: {:?}", s).into());
    }
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)?;
    }
    Ok(bytes)
}

/// One column value decoded from the binary protocol into its text form.
struct PgCell(String);

impl<'a> FromSql<'a> for PgCell {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        let text = match *ty {
            Type::BOOL => if bool::from_sql(ty, raw)? { "t" } else { "f" }.to_string(),
            Type::INT2 => i16::from_sql(ty, raw)?.to_string(),
            Type::INT4 => i32::from_sql(ty, raw)?.to_string(),
            Type::INT8 => i64::from_sql(ty, raw)?.to_string(),
            Type::OID => u32::from_sql(ty, raw)?.to_string(),
            Type::FLOAT4 => f32::from_sql(ty, raw)?.to_string(),
            Type::FLOAT8 => f64::from_sql(ty, raw)?.to_string(),
            Type::NUMERIC => Decimal::from_sql(ty, raw)?.to_string(),
            Type::DATE => NaiveDate::from_sql(ty, raw)?.to_string(),
            Type::TIME => NaiveTime::from_sql(ty, raw)?.to_string(),
            Type::TIMESTAMP => NaiveDateTime::from_sql(ty, raw)?.to_string(),
            Type::TIMESTAMPTZ => DateTime::<Utc>::from_sql(ty, raw)?
                .format("%Y-%m-%d %H:%M:%S%.f+00")
                .to_string(),
            Type::BYTEA => {
                let mut hex = String::with_capacity(raw.len() * 2 + 2);
                hex.push_str("\\x");
                for byte in raw {
                    write!(hex, "{:02x}", byte)?;
                }
                hex
            }
            Type::UUID => format_uuid(raw),
            Type::JSONB => String::from_utf8_lossy(raw.get(1..).unwrap_or_default()).into_owned(),
            _ => match ty.kind() {
                Kind::Array(_) => {
                    let items = Vec::<Option<PgCell>>::from_sql(ty, raw)?;
                    array_literal(items)
                }
                _ => String::from_utf8_lossy(raw).into_owned(),
            },
        };
        Ok(PgCell(text))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn format_uuid(raw: &[u8]) -> String {
    let mut out = String::with_capacity(36);
    for (i, byte) in raw.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

// `{1,2,NULL}` as PostgreSQL prints arrays
fn array_literal(items: Vec<Option<PgCell>>) -> String {
    let parts: Vec<String> = items
        .into_iter()
        .map(|item| match item {
            None => "NULL".to_string(),
            Some(PgCell(s)) if s.is_empty() || s.contains(|c: char| ",{}\"\\ ".contains(c)) => {
                format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            }
            Some(PgCell(s)) => s,
        })
        .collect();
    format!("{{{}}}", parts.join(","))
}

fn decode_row(row: &tokio_postgres::Row) -> Result<RawRow> {
    (0..row.len())
        .map(|i| {
            row.try_get::<_, Option<PgCell>>(i)
                .map(|cell| cell.map(|c| c.0))
                .map_err(map_error)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_direction() {
        assert_eq!(copy_direction("COPY names FROM STDIN"), Some(CopyDirection::In));
        assert_eq!(
            copy_direction("  copy names (name, age)\n  from stdin with csv"),
            Some(CopyDirection::In)
        );
        assert_eq!(copy_direction("COPY names TO STDOUT"), Some(CopyDirection::Out));
        assert_eq!(copy_direction("COPY names FROM '/tmp/names'"), None);
        assert_eq!(copy_direction("SELECT 'COPY x FROM STDIN'"), None);
    }

    #[test]
    fn test_no_copy_is_database_error() {
        let err = no_copy("TO STDOUT");
        assert_eq!(err.kind(), crate::error::ErrorKind::Database);
        assert_eq!(err.to_string(), "database error: no COPY TO STDOUT in progress");
    }

    #[test]
    fn test_cell_decoding() {
        let cell = PgCell::from_sql(&Type::INT4, &42i32.to_be_bytes()).unwrap();
        assert_eq!(cell.0, "42");

        let cell = PgCell::from_sql(&Type::BYTEA, &[0xde, 0xad]).unwrap();
        assert_eq!(cell.0, "\\xdead");

        let cell = PgCell::from_sql(&Type::TEXT, b"hello").unwrap();
        assert_eq!(cell.0, "hello");
    }

    #[test]
    fn test_uuid_round_trip() {
        let text = "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11";
        assert_eq!(format_uuid(&parse_uuid(text).unwrap()), text);
    }

    #[test]
    fn test_array_literal() {
        let items = vec![Some(PgCell("a b".into())), None, Some(PgCell("c".into()))];
        assert_eq!(array_literal(items), "{\"a b\",NULL,c}");
    }

    #[test]
    fn test_encode_rejects_bad_input() {
        assert!(encode_param(&Value::from("abc"), &Type::INT4).is_err());
        assert!(encode_param(&Value::Int(1 << 40), &Type::INT4).is_err());
        assert!(encode_param(&Value::Int(7), &Type::INT4).is_ok());
        assert!(encode_param(&Value::Null, &Type::DATE).is_ok());
    }

    #[test]
    fn test_column_info_for_array() {
        let registry = TypeRegistry::standard();
        let info = column_info("tags", &Type::TEXT_ARRAY, &registry);
        assert_eq!(info.array_of_type.as_deref(), Some("text"));

        let info = column_info("id", &Type::INT4, &registry);
        assert_eq!(info.type_name.to_ascii_lowercase(), "int4");
        assert!(info.array_of_type.is_none());
    }
}
