//! Audit log storage backends for LLMGate.
//!
//! Provides the SQLite-backed [`SqliteAuditStore`] for durable deployments
//! and the [`InMemoryAuditStore`] for development and tests, selected via
//! [`StorageProfile`].

use llmgate_core::{AuditStore, GateError, Result};
use std::sync::Arc;

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryAuditStore;
pub use sqlite::SqliteAuditStore;

/// Which audit store backend a deployment runs.
#[derive(Debug, Clone)]
pub enum StorageProfile {
    /// Volatile in-memory store (dev/test).
    Memory,
    /// Single-node SQLite file.
    Lite {
        /// Path to the database file; created if missing.
        database_path: String,
    },
}

impl StorageProfile {
    /// Construct the audit store for this profile.
    pub async fn build(&self) -> Result<Arc<dyn AuditStore>> {
        match self {
            StorageProfile::Memory => Ok(Arc::new(InMemoryAuditStore::new())),
            StorageProfile::Lite { database_path } => {
                if database_path.is_empty() {
                    return Err(GateError::Config(
                        "lite storage profile requires a database path".to_string(),
                    ));
                }
                let store = SqliteAuditStore::new(database_path).await?;
                Ok(Arc::new(store))
            }
        }
    }
}
