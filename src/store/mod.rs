//! Persistence layer: per-item processing status.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

use std::path::Path;
use std::sync::Arc;

pub use libsql_backend::LibSqlStatusStore;
pub use memory::MemoryStatusStore;
pub use traits::{ProcessingStatus, StatusRecord, StatusStore};

use crate::error::StatusError;

/// Open the libSQL store at `path`, or an in-memory store when unset.
pub async fn open_status_store(path: Option<&Path>) -> Result<Arc<dyn StatusStore>, StatusError> {
    match path {
        Some(path) => Ok(Arc::new(LibSqlStatusStore::new_local(path).await?)),
        None => {
            tracing::debug!("No status database configured, tracking status in memory");
            Ok(Arc::new(MemoryStatusStore::new()))
        }
    }
}
