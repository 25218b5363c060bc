//! rsdbi - A driver-agnostic database interface
//!
//! A driver opens database handles; a database handle prepares statement
//! handles; statement handles execute and fetch rows. Every backend speaks
//! the same set of operations, with driver-specific extras reachable
//! through `func`.
//!
//! # Example
//! ```ignore
//! use rsdbi::Value;
//!
//! let mut dbh = rsdbi::connect("postgres://localhost/mydb?user=me").await?;
//!
//! let row = dbh
//!     .select_one("SELECT id, name FROM users WHERE name = ?", &["John".into()])
//!     .await?;
//!
//! dbh.transaction(|dbh| {
//!     Box::pin(async move {
//!         dbh.run("UPDATE users SET seen = ?", &[Value::Bool(true)]).await?;
//!         Ok::<_, rsdbi::Error>(())
//!     })
//! })
//! .await?;
//!
//! dbh.disconnect().await?;
//! ```

pub mod dispatch;
pub mod drivers;
pub mod error;
pub mod handles;
pub mod options;
pub mod traits;
pub mod types;

// Re-export main types for convenient access
pub use dispatch::{Arity, Extensible, FuncBlock, FuncSignature, FuncTable};
pub use error::{Error, ErrorKind, HandleKind, Result};
pub use handles::{connect, DatabaseHandle, DriverHandle, StatementHandle, AUTO_COMMIT};
pub use options::ConnectOptions;
pub use traits::{ConnectionBackend, Driver, StatementBackend};
pub use types::{
    Coercion, ColumnIndex, ColumnInfo, RawRow, ResultSet, Row, RowShape, ScrollDirection, SqlType,
    TypeDescriptor, TypeEntry, TypeRegistry, Value,
};
