pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use delve_core::config::{StoreBackend, StoreConfig};
use delve_core::error::Result;
use delve_core::traits::StateStore;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Open the store the config asks for.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn StateStore>> {
    Ok(match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.resolved_path())?),
    })
}
