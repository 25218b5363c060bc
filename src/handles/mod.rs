//! The handles callers hold: driver, database and statement.
//!
//! Each wraps a backend resource and enforces the lifecycle rules that are
//! common to every driver. Once a handle is closed its resource is replaced
//! by a closed sentinel, and every later operation fails with an interface
//! error naming the handle kind.

mod database;
mod driver;
mod statement;

use std::collections::BTreeSet;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};

pub use database::DatabaseHandle;
pub use driver::{connect, DriverHandle};
pub use statement::StatementHandle;

use crate::error::{Error, HandleKind, Result};

/// Attribute key for the autocommit flag.
pub const AUTO_COMMIT: &str = "AutoCommit";

pub(crate) enum Resource<T> {
    Open(T),
    Closed(HandleKind),
}

impl<T> Resource<T> {
    pub(crate) fn get(&self) -> Result<&T> {
        match self {
            Resource::Open(resource) => Ok(resource),
            Resource::Closed(kind) => Err(Error::closed(*kind)),
        }
    }

    pub(crate) fn get_mut(&mut self) -> Result<&mut T> {
        match self {
            Resource::Open(resource) => Ok(resource),
            Resource::Closed(kind) => Err(Error::closed(*kind)),
        }
    }

    /// Swap in the closed sentinel and hand back the resource.
    pub(crate) fn close(&mut self, kind: HandleKind) -> Result<T> {
        match mem::replace(self, Resource::Closed(kind)) {
            Resource::Open(resource) => Ok(resource),
            Resource::Closed(kind) => Err(Error::closed(kind)),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self, Resource::Open(_))
    }
}

/// Plan names of the statements a connection has open.
#[derive(Debug, Clone, Default)]
pub(crate) struct PlanSet(Arc<Mutex<BTreeSet<String>>>);

impl PlanSet {
    pub(crate) fn insert(&self, plan: &str) {
        self.lock().insert(plan.to_owned());
    }

    pub(crate) fn remove(&self, plan: &str) {
        self.lock().remove(plan);
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rejects SQL that is empty or only whitespace.
pub(crate) fn check_sql(sql: &str) -> Result<()> {
    if sql.trim().is_empty() {
        return Err(Error::interface("empty SQL statement"));
    }
    Ok(())
}
