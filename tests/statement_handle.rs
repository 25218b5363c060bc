use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rsdbi::drivers::{InMemoryTestDriver, InMemoryTestResponseBuilder};
use rsdbi::{
    Coercion, ColumnInfo, ConnectOptions, DatabaseHandle, DriverHandle, ErrorKind, Extensible,
    RawRow, Result, ScrollDirection, SqlType, StatementBackend, StatementHandle, Value,
};

// Hands its rows back from the end of the list, the way a stack would.
struct PopStatement {
    rows: Vec<RawRow>,
    loaded: Vec<RawRow>,
}

impl PopStatement {
    fn new(rows: &[[&str; 2]]) -> Self {
        Self {
            rows: rows
                .iter()
                .map(|row| row.iter().map(|v| Some(v.to_string())).collect())
                .collect(),
            loaded: Vec::new(),
        }
    }
}

impl Extensible for PopStatement {}

#[async_trait]
impl StatementBackend for PopStatement {
    fn plan_name(&self) -> &str {
        "pop"
    }

    fn bind_param(&mut self, _position: usize, _value: Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&mut self) -> Result<()> {
        self.loaded = self.rows.clone();
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Option<RawRow>> {
        Ok(self.loaded.pop())
    }

    async fn cancel(&mut self) -> Result<()> {
        self.loaded.clear();
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    async fn column_info(&mut self) -> Result<Vec<ColumnInfo>> {
        Ok(vec![
            ColumnInfo::new("name", SqlType::Varchar, "varchar"),
            ColumnInfo::new("age", SqlType::Integer, "integer"),
        ])
    }

    fn rows_affected(&self) -> Option<u64> {
        Some(self.loaded.len() as u64)
    }
}

fn pop_statement() -> StatementHandle {
    StatementHandle::new(Box::new(PopStatement::new(&[
        ["Joe", "19"],
        ["Jim", "30"],
        ["Bob", "21"],
    ])))
}

async fn connect(driver: &InMemoryTestDriver) -> DatabaseHandle {
    DriverHandle::new(Arc::new(driver.clone()))
        .connect(&ConnectOptions::new("mock"))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_fetch_follows_backend_order() {
    let mut sth = pop_statement();
    assert!(!sth.is_fetchable());

    sth.execute(&[]).await.unwrap();
    assert!(sth.is_fetchable());

    let mut seen = Vec::new();
    for _ in 0..3 {
        let row = sth.fetch().await.unwrap().unwrap();
        seen.push((row.get("name").cloned().unwrap(), row.get(1usize).cloned().unwrap()));
    }
    assert_eq!(
        seen,
        vec![
            (Value::from("Bob"), Value::Int(21)),
            (Value::from("Jim"), Value::Int(30)),
            (Value::from("Joe"), Value::Int(19)),
        ]
    );

    assert!(sth.fetch().await.unwrap().is_none());
    assert!(!sth.is_fetchable());
    // still nothing, and no error
    assert!(sth.fetch().await.unwrap().is_none());
}

#[tokio::test]
async fn test_fetch_before_execute() {
    let mut sth = pop_statement();
    assert!(sth.fetch().await.unwrap().is_none());
    assert!(sth.fetch_all().await.unwrap().is_empty());

    sth.set_raise_error(true);
    let err = sth.fetch().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Interface);
    assert!(err.to_string().contains("Statement has not been executed"));
}

#[tokio::test]
async fn test_fetch_variants() {
    let mut sth = pop_statement();
    sth.execute(&[]).await.unwrap();

    // raw text, untouched by column coercions
    let array = sth.fetch_array().await.unwrap().unwrap();
    assert_eq!(array, vec![Value::from("Bob"), Value::from("21")]);

    let hash = sth.fetch_hash().await.unwrap().unwrap();
    assert_eq!(hash.len(), 2);
    assert_eq!(hash.get("name"), Some(&Value::from("Jim")));
    assert_eq!(hash.get("age"), Some(&Value::from("30")));

    let rest = sth.fetch_many(5).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].try_get("name").unwrap(), &Value::from("Joe"));
    assert!(rest[0].try_get("missing").is_err());
}

#[tokio::test]
async fn test_raw_fetches_keep_nulls_and_ignore_column_types() {
    let driver = InMemoryTestDriver::new().with_response(
        InMemoryTestResponseBuilder::new()
            .column("id", "integer")
            .column("seen", "boolean")
            .nullable_row(&[Some("7"), None])
            .nullable_row(&[Some("8"), Some("t")])
            .build(),
    );
    let mut dbh = connect(&driver).await;
    let mut sth = dbh.execute("select id, seen from t", &[]).await.unwrap();
    sth.bind_column_type(1, Coercion::Float).unwrap();

    let array = sth.fetch_array().await.unwrap().unwrap();
    assert_eq!(array, vec![Value::from("7"), Value::Null]);

    let hash = sth.fetch_hash().await.unwrap().unwrap();
    assert_eq!(hash.get("id"), Some(&Value::from("8")));
    assert_eq!(hash.get("seen"), Some(&Value::from("t")));

    assert_eq!(sth.fetch_array().await.unwrap(), None);
    assert_eq!(sth.fetch_hash().await.unwrap(), None);
    assert!(!sth.is_fetchable());
}

#[tokio::test]
async fn test_every_fetch_raises_before_execute() {
    let mut sth = pop_statement();
    sth.set_raise_error(true);

    let not_executed = |err: rsdbi::Error| {
        assert_eq!(err.kind(), ErrorKind::Interface);
        assert!(err.to_string().contains("Statement has not been executed"));
    };
    not_executed(sth.fetch().await.unwrap_err());
    not_executed(sth.fetch_array().await.unwrap_err());
    not_executed(sth.fetch_hash().await.unwrap_err());
    not_executed(sth.fetch_many(2).await.unwrap_err());
    not_executed(sth.fetch_all().await.unwrap_err());
    not_executed(sth.fetch_scroll(ScrollDirection::Next).await.unwrap_err());
    not_executed(sth.fetch_each(|_| Ok(())).await.unwrap_err());
}

#[tokio::test]
async fn test_every_fetch_is_silent_before_execute() {
    let mut sth = pop_statement();
    assert!(!sth.raise_error());

    assert!(sth.fetch_array().await.unwrap().is_none());
    assert!(sth.fetch_hash().await.unwrap().is_none());
    assert!(sth.fetch_many(2).await.unwrap().is_empty());
    assert!(sth.fetch_scroll(ScrollDirection::Next).await.unwrap().is_none());
    assert!(sth.fetch_scroll(ScrollDirection::Last).await.unwrap().is_none());
    sth.fetch_each(|_| panic!("no rows expected")).await.unwrap();
}

#[tokio::test]
async fn test_exhausted_statement_does_not_raise() {
    let mut sth = pop_statement();
    sth.set_raise_error(true);
    sth.execute(&[]).await.unwrap();

    assert_eq!(sth.fetch_all().await.unwrap().len(), 3);
    assert!(sth.fetch().await.unwrap().is_none());
    assert!(sth.fetch_many(1).await.unwrap().is_empty());
    assert!(sth.fetch_scroll(ScrollDirection::Next).await.unwrap().is_none());
}

#[tokio::test]
async fn test_fetch_each_stops_on_error() {
    let mut sth = pop_statement();
    sth.execute(&[]).await.unwrap();

    let mut names = Vec::new();
    let err = sth
        .fetch_each(|row| {
            names.push(row.get("name").cloned().unwrap());
            if names.len() == 2 {
                return Err(rsdbi::Error::interface("enough"));
            }
            Ok(())
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "interface error: enough");
    assert_eq!(names, vec![Value::from("Bob"), Value::from("Jim")]);
}

#[tokio::test]
async fn test_cancel_and_finish() {
    let mut sth = pop_statement();
    sth.execute(&[]).await.unwrap();

    sth.cancel().await.unwrap();
    assert!(!sth.is_fetchable());
    assert!(sth.fetch().await.unwrap().is_none());
    sth.cancel().await.unwrap();

    // a second execute starts over
    sth.execute(&[]).await.unwrap();
    assert_eq!(
        sth.fetch().await.unwrap().unwrap().get("name"),
        Some(&Value::from("Bob"))
    );

    sth.finish().await.unwrap();
    assert!(sth.is_finished());

    let err = sth.finish().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "interface error: Statement handle was already closed"
    );
    assert!(sth.fetch().await.is_err());
    assert!(sth.execute(&[]).await.is_err());
    assert!(sth.bind_param(1, 5).is_err());
}

#[tokio::test]
async fn test_bind_column_type() {
    let mut sth = pop_statement();

    let err = sth.bind_column_type(1, Coercion::Varchar).unwrap_err();
    assert!(err.to_string().contains("Cannot bind column type before execute"));

    sth.execute(&[]).await.unwrap();
    assert!(sth.bind_column_type(3, Coercion::Varchar).is_err());
    assert!(sth.bind_column_type(0, Coercion::Varchar).is_err());

    sth.bind_column_type(2, Coercion::Varchar).unwrap();
    let row = sth.fetch().await.unwrap().unwrap();
    assert_eq!(row.get("age"), Some(&Value::from("21")));

    // overrides last for one execution only
    sth.execute(&[]).await.unwrap();
    let row = sth.fetch().await.unwrap().unwrap();
    assert_eq!(row.get("age"), Some(&Value::Int(21)));
}

#[tokio::test]
async fn test_scroll_defaults_to_next_only() {
    let mut sth = pop_statement();
    sth.execute(&[]).await.unwrap();

    let row = sth.fetch_scroll(ScrollDirection::Next).await.unwrap().unwrap();
    assert_eq!(row.get("name"), Some(&Value::from("Bob")));

    let err = sth.fetch_scroll(ScrollDirection::First).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
}

#[tokio::test]
async fn test_buffered_scroll() {
    let driver = InMemoryTestDriver::new().with_response(
        InMemoryTestResponseBuilder::new()
            .column("id", "integer")
            .row(&["1"])
            .row(&["2"])
            .row(&["3"])
            .build(),
    );
    let mut dbh = connect(&driver).await;
    let mut sth = dbh.execute("select id from t", &[]).await.unwrap();

    let id = |row: Option<rsdbi::Row>| row.and_then(|r| r.get("id").cloned());
    assert_eq!(id(sth.fetch_scroll(ScrollDirection::Last).await.unwrap()), Some(Value::Int(3)));
    assert_eq!(id(sth.fetch_scroll(ScrollDirection::Prior).await.unwrap()), Some(Value::Int(2)));
    assert_eq!(id(sth.fetch_scroll(ScrollDirection::First).await.unwrap()), Some(Value::Int(1)));
    assert_eq!(
        id(sth.fetch_scroll(ScrollDirection::Relative(2)).await.unwrap()),
        Some(Value::Int(3))
    );
    assert_eq!(id(sth.fetch_scroll(ScrollDirection::Absolute(7)).await.unwrap()), None);
    assert_eq!(
        id(sth.fetch_scroll(ScrollDirection::Absolute(1)).await.unwrap()),
        Some(Value::Int(2))
    );
}

#[tokio::test]
async fn test_bind_and_rebind() {
    let driver = InMemoryTestDriver::new();
    let mut dbh = connect(&driver).await;
    let mut sth = dbh.prepare("insert into t values (?, ?)").await.unwrap();

    sth.bind_param(1, "a").unwrap();
    sth.bind_param(2, 1).unwrap();
    sth.execute(&[]).await.unwrap();
    driver.assert_last_query("insert into t values (?, ?)", &[Value::from("a"), Value::Int(1)]);

    sth.execute(&[Value::from("b"), Value::Int(2)]).await.unwrap();
    driver.assert_last_query("insert into t values (?, ?)", &[Value::from("b"), Value::Int(2)]);
    driver.assert_query_count(2);

    assert!(sth.bind_param(0, "x").is_err());
}

#[tokio::test]
async fn test_column_metadata_and_rows() {
    let driver = InMemoryTestDriver::new().with_response(
        InMemoryTestResponseBuilder::new()
            .column("id", "integer")
            .column("price", "decimal(10,2)")
            .nullable_row(&[Some("1"), None])
            .rows_affected(7)
            .build(),
    );
    let mut dbh = connect(&driver).await;
    let mut sth = dbh.execute("select id, price from t", &[]).await.unwrap();

    assert_eq!(sth.column_names().await.unwrap(), vec!["id", "price"]);
    let info = sth.column_info().await.unwrap();
    assert_eq!(info[1].sql_type, SqlType::Decimal);
    assert_eq!((info[1].precision, info[1].scale), (Some(10), Some(2)));
    assert_eq!(sth.rows().unwrap(), Some(7));

    let row = sth.fetch().await.unwrap().unwrap();
    assert_eq!(row.values(), &[Value::Int(1), Value::Null]);
}

#[tokio::test]
async fn test_failed_execute_leaves_statement_usable() {
    let driver = InMemoryTestDriver::new()
        .with_default_response(InMemoryTestResponseBuilder::new().columns(&["x"]).row(&["1"]).build());
    let mut dbh = connect(&driver).await;
    let mut sth = dbh.prepare("select x from t").await.unwrap();

    driver.fail_next(rsdbi::Error::Programming("syntax error".to_string()));
    let err = sth.execute(&[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Programming);
    assert!(!sth.is_fetchable());

    sth.execute(&[]).await.unwrap();
    assert_eq!(sth.fetch_all().await.unwrap().len(), 1);
}

// Describes itself differently after every execution; `fail` makes the next
// execution error out.
struct ShiftingStatement {
    fail: Arc<AtomicBool>,
    generation: usize,
}

impl Extensible for ShiftingStatement {}

#[async_trait]
impl StatementBackend for ShiftingStatement {
    fn plan_name(&self) -> &str {
        "shifting"
    }

    fn bind_param(&mut self, _position: usize, _value: Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&mut self) -> Result<()> {
        self.generation += 1;
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(rsdbi::Error::Programming("relation vanished".to_string()));
        }
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Option<RawRow>> {
        Ok(None)
    }

    async fn cancel(&mut self) -> Result<()> {
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    async fn column_info(&mut self) -> Result<Vec<ColumnInfo>> {
        Ok(vec![ColumnInfo::new(
            format!("v{}", self.generation),
            SqlType::Integer,
            "integer",
        )])
    }

    fn rows_affected(&self) -> Option<u64> {
        None
    }
}

#[tokio::test]
async fn test_failed_execute_forgets_previous_columns() {
    let fail = Arc::new(AtomicBool::new(false));
    let mut sth = StatementHandle::new(Box::new(ShiftingStatement {
        fail: Arc::clone(&fail),
        generation: 0,
    }));

    sth.execute(&[]).await.unwrap();
    assert_eq!(sth.column_names().await.unwrap(), vec!["v1"]);

    fail.store(true, Ordering::SeqCst);
    assert!(sth.execute(&[]).await.is_err());
    assert_eq!(sth.column_names().await.unwrap(), vec!["v2"]);
}

#[tokio::test]
async fn test_backend_rejects_bind_position_zero() {
    use rsdbi::Driver;

    let driver = InMemoryTestDriver::new();
    let mut conn = driver.connect(&ConnectOptions::new("mock")).await.unwrap();
    let mut sth = conn.prepare("select ?").await.unwrap();

    let err = sth.bind_param(0, Value::Int(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Interface);
    sth.bind_param(1, Value::Int(1)).unwrap();
}
