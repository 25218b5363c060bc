mod mysql;
mod placeholders;
mod tokio_postgres;

pub use self::in_memory_test::{
    InMemoryTestConnection, InMemoryTestDriver, InMemoryTestResponse, InMemoryTestResponseBuilder,
    InMemoryTestStatement, RecordedQuery,
};
pub use self::mysql::{mysql_registry, MySqlBackend, MySqlDriver, MySqlStatement};
pub use self::tokio_postgres::{PgBackend, PgDriver, PgStatement};
