use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::dispatch::{self, FuncBlock};
use crate::error::{Error, HandleKind, Result};
use crate::handles::{check_sql, PlanSet, Resource, StatementHandle, AUTO_COMMIT};
use crate::traits::ConnectionBackend;
use crate::types::{convert_params, ColumnInfo, Row, TypeRegistry, Value};

/// An open connection.
///
/// Obtained from [`DriverHandle::connect`](crate::DriverHandle::connect) or
/// [`rsdbi::connect`](crate::connect). Dropping the handle without calling
/// [`disconnect`](Self::disconnect) releases the connection without the
/// implicit rollback.
pub struct DatabaseHandle {
    backend: Resource<Box<dyn ConnectionBackend>>,
    driver_name: Arc<str>,
    registry: Arc<TypeRegistry>,
    plans: PlanSet,
    convert_types: bool,
    raise_error: bool,
    auto_commit: bool,
    supports_transactions: bool,
    last_statement: Option<String>,
}

impl DatabaseHandle {
    pub fn new(backend: Box<dyn ConnectionBackend>, driver_name: &str) -> Self {
        let auto_commit = backend
            .attribute(AUTO_COMMIT)
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let supports_transactions = backend.supports_transactions();
        if !supports_transactions {
            tracing::info!(driver = driver_name, "server lacks transactions; commit and rollback are disabled");
        }

        Self {
            registry: backend.type_registry(),
            backend: Resource::Open(backend),
            driver_name: Arc::from(driver_name),
            plans: PlanSet::default(),
            convert_types: true,
            raise_error: false,
            auto_commit,
            supports_transactions,
            last_statement: None,
        }
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_open()
    }

    /// The SQL most recently passed to [`prepare`](Self::prepare) or
    /// [`run`](Self::run).
    pub fn last_statement(&self) -> Option<&str> {
        self.last_statement.as_deref()
    }

    /// Plan names of the statements currently open on this connection.
    pub fn prepared_plans(&self) -> Vec<String> {
        self.plans.names()
    }

    pub fn convert_types(&self) -> bool {
        self.convert_types
    }

    pub fn set_convert_types(&mut self, enabled: bool) {
        self.convert_types = enabled;
    }

    pub fn raise_error(&self) -> bool {
        self.raise_error
    }

    /// Applies to statements prepared from now on.
    pub fn set_raise_error(&mut self, enabled: bool) {
        self.raise_error = enabled;
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn supports_transactions(&self) -> bool {
        self.supports_transactions
    }

    pub async fn prepare(&mut self, sql: &str) -> Result<StatementHandle> {
        check_sql(sql)?;
        let backend = self.backend.get_mut()?;
        self.last_statement = Some(sql.to_owned());

        tracing::debug!(sql, "preparing statement");
        let statement = backend.prepare(sql).await?;
        Ok(StatementHandle::attached(
            statement,
            Arc::clone(&self.driver_name),
            Arc::clone(&self.registry),
            self.plans.clone(),
            self.convert_types,
            self.raise_error,
        ))
    }

    /// Prepare `sql`, hand the statement to `f`, and finish it however `f`
    /// exits.
    ///
    /// ```ignore
    /// let names = dbh
    ///     .prepare_scoped("select name from names", |sth| {
    ///         Box::pin(async move {
    ///             sth.execute(&[]).await?;
    ///             sth.fetch_all().await
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn prepare_scoped<T, E, F>(&mut self, sql: &str, f: F) -> std::result::Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut StatementHandle) -> BoxFuture<'s, std::result::Result<T, E>>,
        E: From<Error>,
    {
        let statement = self.prepare(sql).await?;
        run_scoped(statement, None, f).await
    }

    /// Prepare and execute `sql`. A statement that fails to execute is
    /// finished before the error is returned.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<StatementHandle> {
        let mut statement = self.prepare(sql).await?;
        if let Err(err) = statement.execute(params).await {
            let _ = statement.finish().await;
            return Err(err);
        }
        Ok(statement)
    }

    /// Like [`prepare_scoped`](Self::prepare_scoped), with the statement
    /// executed before `f` sees it.
    pub async fn execute_scoped<T, E, F>(
        &mut self,
        sql: &str,
        params: &[Value],
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut StatementHandle) -> BoxFuture<'s, std::result::Result<T, E>>,
        E: From<Error>,
    {
        let statement = self.prepare(sql).await?;
        run_scoped(statement, Some(params), f).await
    }

    /// Run a statement once and return the number of rows it affected.
    pub async fn run(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        check_sql(sql)?;
        let backend = self.backend.get_mut()?;
        self.last_statement = Some(sql.to_owned());

        let params = if self.convert_types {
            convert_params(&self.driver_name, params)
        } else {
            params.to_vec()
        };
        tracing::debug!(sql, params = params.len(), "running statement");
        backend.run(sql, &params).await
    }

    pub async fn select_one(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let mut statement = self.execute(sql, params).await?;
        let row = statement.fetch().await;
        let finished = statement.finish().await;
        let row = row?;
        finished?;
        Ok(row)
    }

    pub async fn select_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut statement = self.execute(sql, params).await?;
        let rows = statement.fetch_all().await;
        let finished = statement.finish().await;
        let rows = rows?;
        finished?;
        Ok(rows)
    }

    /// Calls `f` with each row of the result. The statement is finished
    /// even if `f` fails or panics.
    pub async fn select_each<F>(&mut self, sql: &str, params: &[Value], f: F) -> Result<()>
    where
        F: FnMut(Row) -> Result<()>,
    {
        let mut statement = self.execute(sql, params).await?;
        let outcome = AssertUnwindSafe(statement.fetch_each(f))
            .catch_unwind()
            .await;
        let finished = statement.finish().await;
        match outcome {
            Ok(result) => {
                result?;
                finished
            }
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Run `f` as one transaction.
    ///
    /// Pending work is committed first. If `f` succeeds its work is
    /// committed; if it fails or panics the transaction is rolled back and
    /// the original error (or panic) is passed on.
    pub async fn transaction<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut DatabaseHandle) -> BoxFuture<'c, std::result::Result<T, E>>,
        E: From<Error>,
    {
        self.commit().await?;

        let outcome = AssertUnwindSafe(f(&mut *self)).catch_unwind().await;
        match outcome {
            Ok(Ok(value)) => match self.commit().await {
                Ok(()) => Ok(value),
                Err(err) => {
                    self.rollback_failed_transaction().await;
                    Err(err.into())
                }
            },
            Ok(Err(err)) => {
                self.rollback_failed_transaction().await;
                Err(err)
            }
            Err(payload) => {
                self.rollback_failed_transaction().await;
                panic::resume_unwind(payload)
            }
        }
    }

    async fn rollback_failed_transaction(&mut self) {
        tracing::warn!(driver = %self.driver_name, "transaction failed, rolling back");
        if let Err(err) = self.rollback().await {
            tracing::error!(error = %err, "rollback of failed transaction also failed");
        }
    }

    pub async fn commit(&mut self) -> Result<()> {
        let backend = self.backend.get_mut()?;
        if !self.supports_transactions {
            return Err(Error::not_supported("commit: server does not support transactions"));
        }
        backend.commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        let backend = self.backend.get_mut()?;
        if !self.supports_transactions {
            return Err(Error::not_supported("rollback: server does not support transactions"));
        }
        backend.rollback().await
    }

    pub async fn ping(&mut self) -> Result<bool> {
        self.backend.get_mut()?.ping().await
    }

    pub async fn tables(&mut self) -> Result<Vec<String>> {
        self.backend.get_mut()?.tables().await
    }

    pub async fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.backend.get_mut()?.columns(table).await
    }

    pub async fn database_name(&mut self) -> Result<String> {
        self.backend.get_mut()?.database_name().await
    }

    /// `value` as an SQL literal, escaped the way the connected server
    /// expects.
    pub fn quote(&self, value: impl Into<Value>) -> Result<String> {
        Ok(self.backend.get()?.quote(&value.into()))
    }

    pub fn attribute(&self, key: &str) -> Result<Option<Value>> {
        let backend = self.backend.get()?;
        if key == AUTO_COMMIT {
            return Ok(Some(Value::Bool(self.auto_commit)));
        }
        Ok(backend.attribute(key))
    }

    /// Set a connection attribute. `AutoCommit` is understood by every
    /// driver; turning it off fails on servers without transactions.
    pub async fn set_attribute(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let backend = self.backend.get_mut()?;

        if key != AUTO_COMMIT {
            return backend.set_attribute(key, value).await;
        }

        let enabled = value
            .as_bool()
            .ok_or_else(|| Error::interface(format!("{} expects a boolean, got {}", AUTO_COMMIT, value)))?;
        if !enabled && !self.supports_transactions {
            return Err(Error::not_supported(
                "AutoCommit: server does not support transactions",
            ));
        }
        backend.set_attribute(AUTO_COMMIT, Value::Bool(enabled)).await?;
        self.auto_commit = enabled;
        Ok(())
    }

    /// Close the connection. Outside autocommit, uncommitted work is rolled
    /// back first. The connection is released even if that rollback fails,
    /// in which case its error is returned. Disconnecting twice is a no-op.
    pub async fn disconnect(&mut self) -> Result<()> {
        if !self.backend.is_open() {
            return Ok(());
        }
        let mut backend = self.backend.close(HandleKind::Database)?;

        let rolled_back = if self.auto_commit || !self.supports_transactions {
            Ok(())
        } else {
            tracing::warn!(driver = %self.driver_name, "rolling back uncommitted work on disconnect");
            backend.rollback().await
        };
        let released = backend.disconnect().await;

        rolled_back?;
        released
    }

    /// Call a driver-specific function.
    pub async fn func(&mut self, name: &str, args: Vec<Value>) -> Result<Value> {
        let backend = self.backend.get_mut()?;
        dispatch::invoke(&mut **backend, name, args, None).await
    }

    pub async fn func_with_block<'a>(
        &'a mut self,
        name: &str,
        args: Vec<Value>,
        block: FuncBlock<'a>,
    ) -> Result<Value> {
        let backend = self.backend.get_mut()?;
        dispatch::invoke(&mut **backend, name, args, Some(block)).await
    }
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("driver", &self.driver_name)
            .field("connected", &self.is_connected())
            .field("auto_commit", &self.auto_commit)
            .finish()
    }
}

async fn run_scoped<T, E, F>(
    mut statement: StatementHandle,
    params: Option<&[Value]>,
    f: F,
) -> std::result::Result<T, E>
where
    F: for<'s> FnOnce(&'s mut StatementHandle) -> BoxFuture<'s, std::result::Result<T, E>>,
    E: From<Error>,
{
    let outcome = AssertUnwindSafe(async {
        if let Some(params) = params {
            statement.execute(params).await?;
        }
        f(&mut statement).await
    })
    .catch_unwind()
    .await;

    let finished = if statement.is_finished() {
        Ok(())
    } else {
        statement.finish().await
    };

    match outcome {
        Ok(Ok(value)) => {
            finished?;
            Ok(value)
        }
        Ok(Err(err)) => Err(err),
        Err(payload) => panic::resume_unwind(payload),
    }
}
