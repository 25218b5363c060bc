use async_trait::async_trait;

use crate::error::Result;
use crate::options::ConnectOptions;
use crate::traits::ConnectionBackend;

/// Trait for database driver implementations.
///
/// A driver turns connection options into a live [`ConnectionBackend`].
#[async_trait]
pub trait Driver: Send + Sync {
    /// The name parameter conversion keys on, e.g. `Pg` or `Mysql`.
    fn name(&self) -> &str;

    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn ConnectionBackend>>;
}
