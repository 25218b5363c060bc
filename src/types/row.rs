use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{Coercion, Value};

/// One row as a backend delivers it: text values in column order, `None`
/// for SQL NULL. No coercion has been applied.
pub type RawRow = Vec<Option<String>>;

/// Column names and coercions shared by every row of one execution.
#[derive(Debug, Clone, Default)]
pub struct RowShape {
    names: Vec<String>,
    coercions: Vec<Coercion>,
}

impl RowShape {
    pub fn new(names: Vec<String>, coercions: Vec<Coercion>) -> Self {
        Self { names, coercions }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn coercions(&self) -> &[Coercion] {
        &self.coercions
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Something a column can be looked up by: a zero-based position or a name.
pub trait ColumnIndex {
    fn position(&self, shape: &RowShape) -> Option<usize>;

    fn describe(&self) -> String;
}

impl ColumnIndex for usize {
    fn position(&self, shape: &RowShape) -> Option<usize> {
        (*self < shape.len()).then_some(*self)
    }

    fn describe(&self) -> String {
        format!("column index {}", self)
    }
}

impl ColumnIndex for &str {
    fn position(&self, shape: &RowShape) -> Option<usize> {
        shape.position(self)
    }

    fn describe(&self) -> String {
        format!("column {:?}", self)
    }
}

/// A single fetched row.
///
/// Values are coerced once, when the row is built. Every fetch produces a
/// new `Row`, so earlier rows stay valid while the statement advances.
#[derive(Debug, Clone)]
pub struct Row {
    shape: Arc<RowShape>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn from_raw(shape: &Arc<RowShape>, raw: RawRow) -> Self {
        let values = raw
            .into_iter()
            .enumerate()
            .map(|(i, val)| match shape.coercions.get(i) {
                Some(coercion) => coercion.coerce(val.as_deref()),
                None => Coercion::Varchar.coerce(val.as_deref()),
            })
            .collect();
        Self {
            shape: Arc::clone(shape),
            values,
        }
    }

    /// Gets a value by position or column name.
    pub fn get<I: ColumnIndex>(&self, index: I) -> Option<&Value> {
        index.position(&self.shape).and_then(|i| self.values.get(i))
    }

    /// Like [`get`](Self::get), but an unknown column is an interface error.
    pub fn try_get<I: ColumnIndex>(&self, index: I) -> Result<&Value> {
        match index.position(&self.shape).and_then(|i| self.values.get(i)) {
            Some(value) => Ok(value),
            None => Err(Error::interface(format!(
                "no such {} in row",
                index.describe()
            ))),
        }
    }

    pub fn column_names(&self) -> &[String] {
        self.shape.names()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Returns the row keyed by column name.
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.shape
            .names()
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }

    /// Returns the number of columns in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if this row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl PartialEq<[Value]> for Row {
    fn eq(&self, other: &[Value]) -> bool {
        self.values == other
    }
}

impl<const N: usize> PartialEq<[Value; N]> for Row {
    fn eq(&self, other: &[Value; N]) -> bool {
        self.values == other
    }
}

/// Where `fetch_scroll` should move the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Next,
    Prior,
    First,
    Last,
    /// Zero-based row number.
    Absolute(i64),
    /// Offset from the current row.
    Relative(i64),
}

/// A fully buffered result with a scrollable cursor.
#[derive(Debug, Clone)]
pub struct ResultSet {
    rows: Vec<RawRow>,
    // -1 before the first row, `rows.len()` after the last
    current: i64,
}

impl ResultSet {
    pub fn new(rows: Vec<RawRow>) -> Self {
        Self { rows, current: -1 }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Returns the number of rows in this result.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if this result contains no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn next_row(&mut self) -> Option<RawRow> {
        self.scroll(ScrollDirection::Next)
    }

    pub fn scroll(&mut self, direction: ScrollDirection) -> Option<RawRow> {
        let len = self.rows.len() as i64;
        let target = match direction {
            ScrollDirection::Next => self.current.saturating_add(1),
            ScrollDirection::Prior => self.current.saturating_sub(1),
            ScrollDirection::First => 0,
            ScrollDirection::Last => len - 1,
            ScrollDirection::Absolute(n) => n,
            ScrollDirection::Relative(n) => self.current.saturating_add(n),
        };

        if (0..len).contains(&target) {
            self.current = target;
            self.rows.get(target as usize).cloned()
        } else {
            self.current = target.clamp(-1, len);
            None
        }
    }
}

impl Default for ResultSet {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(values: &[&str]) -> RawRow {
        values.iter().map(|v| Some(v.to_string())).collect()
    }

    fn shape() -> Arc<RowShape> {
        Arc::new(RowShape::new(
            vec!["name".to_string(), "age".to_string()],
            vec![Coercion::Varchar, Coercion::Integer],
        ))
    }

    #[test]
    fn test_row_get() {
        let row = Row::from_raw(&shape(), raw(&["Joe", "19"]));

        assert_eq!(row.get("name"), Some(&Value::from("Joe")));
        assert_eq!(row.get(1), Some(&Value::Int(19)));
        assert_eq!(row.get("missing"), None);
        assert!(row.try_get("missing").is_err());
        assert!(row.try_get(2).is_err());
        assert_eq!(row, [Value::from("Joe"), Value::Int(19)]);
    }

    #[test]
    fn test_row_null_and_extra_columns() {
        let row = Row::from_raw(
            &shape(),
            vec![None, Some("30".to_string()), Some("x".to_string())],
        );

        assert_eq!(row.values()[0], Value::Null);
        // columns beyond the shape pass through as text
        assert_eq!(row.values()[2], Value::from("x"));
        assert_eq!(row.to_map().get("age"), Some(&Value::Int(30)));
    }

    #[test]
    fn test_result_set_exhaustion() {
        let mut result = ResultSet::new(vec![raw(&["1"]), raw(&["2"])]);

        assert_eq!(result.next_row(), Some(raw(&["1"])));
        assert_eq!(result.next_row(), Some(raw(&["2"])));
        assert_eq!(result.next_row(), None);
        assert_eq!(result.next_row(), None);
    }

    #[test]
    fn test_result_set_scroll() {
        let mut result = ResultSet::new(vec![raw(&["a"]), raw(&["b"]), raw(&["c"])]);

        assert_eq!(result.scroll(ScrollDirection::Last), Some(raw(&["c"])));
        assert_eq!(result.scroll(ScrollDirection::Prior), Some(raw(&["b"])));
        assert_eq!(result.scroll(ScrollDirection::First), Some(raw(&["a"])));
        assert_eq!(result.scroll(ScrollDirection::Relative(2)), Some(raw(&["c"])));
        assert_eq!(result.scroll(ScrollDirection::Absolute(1)), Some(raw(&["b"])));
        assert_eq!(result.scroll(ScrollDirection::Absolute(7)), None);
        assert_eq!(result.scroll(ScrollDirection::Prior), Some(raw(&["c"])));
        assert_eq!(result.scroll(ScrollDirection::Relative(-5)), None);
        assert_eq!(result.scroll(ScrollDirection::Next), Some(raw(&["a"])));
    }

    #[test]
    fn test_result_set_scroll_far_offsets() {
        let mut result = ResultSet::new(vec![raw(&["a"]), raw(&["b"]), raw(&["c"])]);

        assert_eq!(result.scroll(ScrollDirection::Relative(i64::MAX)), None);
        assert_eq!(result.scroll(ScrollDirection::Relative(i64::MAX)), None);
        assert_eq!(result.scroll(ScrollDirection::Prior), Some(raw(&["c"])));

        assert_eq!(result.scroll(ScrollDirection::Relative(i64::MIN)), None);
        assert_eq!(result.scroll(ScrollDirection::Relative(i64::MIN)), None);
        assert_eq!(result.scroll(ScrollDirection::Next), Some(raw(&["a"])));
    }
}
