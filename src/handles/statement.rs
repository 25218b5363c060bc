use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatch::{self, FuncBlock};
use crate::error::{Error, HandleKind, Result};
use crate::handles::{PlanSet, Resource};
use crate::traits::{standard_registry, StatementBackend};
use crate::types::{
    convert_param, convert_params, Coercion, ColumnInfo, RawRow, Row, RowShape, ScrollDirection,
    TypeRegistry, Value,
};

/// A prepared statement.
///
/// A statement moves between three states. It starts out prepared but not
/// fetchable. [`execute`](Self::execute) makes it fetchable; running out of
/// rows or calling [`cancel`](Self::cancel) makes it unfetchable again, and
/// [`finish`](Self::finish) closes it for good.
///
/// Fetching from an unfetchable statement yields `None`. With
/// `raise_error` set, fetching from a statement that has no result at all
/// is an interface error instead.
pub struct StatementHandle {
    backend: Resource<Box<dyn StatementBackend>>,
    plan_name: String,
    driver_name: Arc<str>,
    registry: Arc<TypeRegistry>,
    plans: PlanSet,
    convert_types: bool,
    raise_error: bool,
    fetchable: bool,
    // present from execute until cancel or finish
    shape: Option<Arc<RowShape>>,
    columns: Option<Vec<ColumnInfo>>,
}

impl StatementHandle {
    /// Wrap a backend statement that belongs to no database handle.
    pub fn new(backend: Box<dyn StatementBackend>) -> Self {
        Self::attached(
            backend,
            Arc::from(""),
            standard_registry(),
            PlanSet::default(),
            true,
            false,
        )
    }

    pub(crate) fn attached(
        backend: Box<dyn StatementBackend>,
        driver_name: Arc<str>,
        registry: Arc<TypeRegistry>,
        plans: PlanSet,
        convert_types: bool,
        raise_error: bool,
    ) -> Self {
        let plan_name = backend.plan_name().to_owned();
        plans.insert(&plan_name);
        Self {
            backend: Resource::Open(backend),
            plan_name,
            driver_name,
            registry,
            plans,
            convert_types,
            raise_error,
            fetchable: false,
            shape: None,
            columns: None,
        }
    }

    pub fn plan_name(&self) -> &str {
        &self.plan_name
    }

    pub fn is_finished(&self) -> bool {
        !self.backend.is_open()
    }

    pub fn is_fetchable(&self) -> bool {
        self.fetchable
    }

    pub fn raise_error(&self) -> bool {
        self.raise_error
    }

    pub fn set_raise_error(&mut self, enabled: bool) {
        self.raise_error = enabled;
    }

    /// Bind `value` to the 1-based placeholder `position`.
    pub fn bind_param(&mut self, position: usize, value: impl Into<Value>) -> Result<()> {
        if position < 1 {
            return Err(Error::interface("bind positions start at 1"));
        }
        let value = value.into();
        let value = if self.convert_types {
            convert_param(&self.driver_name, &value)
        } else {
            value
        };
        self.backend.get_mut()?.bind_param(position, value)
    }

    /// Run the statement with `params` bound, discarding any pending result
    /// first.
    pub async fn execute(&mut self, params: &[Value]) -> Result<()> {
        self.cancel().await?;

        let backend = self.backend.get_mut()?;
        if !params.is_empty() {
            let params = if self.convert_types {
                convert_params(&self.driver_name, params)
            } else {
                params.to_vec()
            };
            backend.bind_params(params)?;
        }

        tracing::debug!(plan = %self.plan_name, params = params.len(), "executing statement");
        self.columns = None;
        backend.execute().await?;
        self.fetchable = true;

        let columns = self.column_info().await?;
        let names = columns.iter().map(|c| c.name.clone()).collect();
        let coercions = columns
            .iter()
            .map(|c| c.resolve_coercion(&self.registry))
            .collect();
        self.shape = Some(Arc::new(RowShape::new(names, coercions)));
        Ok(())
    }

    /// Next row, or `None` when there is nothing (more) to fetch.
    pub async fn fetch(&mut self) -> Result<Option<Row>> {
        let raw = self.next_raw().await?;
        Ok(raw.map(|raw| self.build_row(raw)))
    }

    /// Calls `f` with every remaining row.
    pub async fn fetch_each<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(Row) -> Result<()>,
    {
        while let Some(row) = self.fetch().await? {
            f(row)?;
        }
        Ok(())
    }

    /// Next row as the backend's text, without type coercion.
    pub async fn fetch_array(&mut self) -> Result<Option<Vec<Value>>> {
        Ok(self.next_raw().await?.map(raw_values))
    }

    /// Next row keyed by column name, without type coercion.
    pub async fn fetch_hash(&mut self) -> Result<Option<HashMap<String, Value>>> {
        let raw = match self.next_raw().await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let names = self
            .shape
            .as_ref()
            .map(|shape| shape.names().to_vec())
            .unwrap_or_default();
        Ok(Some(names.into_iter().zip(raw_values(raw)).collect()))
    }

    /// Up to `count` rows; fewer once the result runs out.
    pub async fn fetch_many(&mut self, count: usize) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(count.min(64));
        while rows.len() < count {
            match self.fetch().await? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    pub async fn fetch_all(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.fetch().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Move the cursor and return the row it lands on. Does not change
    /// whether the statement is fetchable.
    pub async fn fetch_scroll(&mut self, direction: ScrollDirection) -> Result<Option<Row>> {
        self.check_fetchable()?;
        if !self.fetchable {
            return Ok(None);
        }
        let raw = self.backend.get_mut()?.fetch_scroll(direction).await?;
        Ok(raw.map(|raw| self.build_row(raw)))
    }

    /// Drop the pending result. Safe to call on a statement that is not
    /// fetchable.
    pub async fn cancel(&mut self) -> Result<()> {
        let backend = self.backend.get_mut()?;
        if self.fetchable {
            backend.cancel().await?;
        }
        self.fetchable = false;
        self.shape = None;
        Ok(())
    }

    /// Release the statement. A second call fails.
    pub async fn finish(&mut self) -> Result<()> {
        let mut backend = self.backend.close(HandleKind::Statement)?;
        self.plans.remove(&self.plan_name);
        self.fetchable = false;
        self.shape = None;
        self.columns = None;
        backend.finish().await
    }

    /// Override the coercion of the 1-based column `position` for the rows
    /// of the current execution.
    pub fn bind_column_type(&mut self, position: usize, coercion: Coercion) -> Result<()> {
        self.backend.get()?;
        let shape = self
            .shape
            .as_ref()
            .ok_or_else(|| Error::interface("Cannot bind column type before execute"))?;

        if position < 1 || position > shape.len() {
            return Err(Error::interface(format!(
                "column position {} out of range 1..={}",
                position,
                shape.len()
            )));
        }

        let mut coercions = shape.coercions().to_vec();
        coercions[position - 1] = coercion;
        self.shape = Some(Arc::new(RowShape::new(shape.names().to_vec(), coercions)));
        Ok(())
    }

    pub async fn column_info(&mut self) -> Result<Vec<ColumnInfo>> {
        let backend = self.backend.get_mut()?;
        if let Some(columns) = &self.columns {
            return Ok(columns.clone());
        }
        let columns = backend.column_info().await?;
        self.columns = Some(columns.clone());
        Ok(columns)
    }

    pub async fn column_names(&mut self) -> Result<Vec<String>> {
        Ok(self
            .column_info()
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    /// Coercions fetched rows go through. Reflects
    /// [`bind_column_type`](Self::bind_column_type) overrides.
    pub async fn column_types(&mut self) -> Result<Vec<Coercion>> {
        if let Some(shape) = &self.shape {
            return Ok(shape.coercions().to_vec());
        }
        let registry = Arc::clone(&self.registry);
        Ok(self
            .column_info()
            .await?
            .iter()
            .map(|c| c.resolve_coercion(&registry))
            .collect())
    }

    /// Row count reported by the last execution.
    pub fn rows(&self) -> Result<Option<u64>> {
        Ok(self.backend.get()?.rows_affected())
    }

    pub fn attribute(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.backend.get()?.attribute(key))
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.backend.get_mut()?.set_attribute(key, value.into())
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

    fn check_fetchable(&self) -> Result<()> {
        self.backend.get()?;
        if !self.fetchable && self.raise_error && self.shape.is_none() {
            return Err(Error::interface("Statement has not been executed"));
        }
        Ok(())
    }

    async fn next_raw(&mut self) -> Result<Option<RawRow>> {
        self.check_fetchable()?;
        if !self.fetchable {
            return Ok(None);
        }
        match self.backend.get_mut()?.fetch().await? {
            Some(raw) => Ok(Some(raw)),
            None => {
                self.fetchable = false;
                Ok(None)
            }
        }
    }

    fn build_row(&mut self, raw: RawRow) -> Row {
        let shape = self
            .shape
            .get_or_insert_with(|| Arc::new(RowShape::default()));
        Row::from_raw(shape, raw)
    }
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        if self.backend.is_open() {
            self.plans.remove(&self.plan_name);
        }
    }
}

fn raw_values(raw: RawRow) -> Vec<Value> {
    raw.into_iter()
        .map(|cell| cell.map_or(Value::Null, Value::Text))
        .collect()
}

impl std::fmt::Debug for StatementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementHandle")
            .field("plan_name", &self.plan_name)
            .field("finished", &self.is_finished())
            .field("fetchable", &self.fetchable)
            .finish()
    }
}
