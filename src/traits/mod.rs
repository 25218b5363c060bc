mod backend;
mod driver;

pub use backend::{standard_registry, ConnectionBackend, StatementBackend};
pub use driver::Driver;
