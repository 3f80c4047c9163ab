//! In-memory audit store for development and tests.
//!
//! Records are held in a `Vec` behind an `RwLock`. All queries are `O(n)`
//! linear scans; data is lost when the struct is dropped.

use async_trait::async_trait;
use llmgate_core::{AuditAction, AuditRecord, AuditStats, AuditStore, Result};
use tokio::sync::RwLock;

/// Volatile audit store. Not intended for production use.
pub struct InMemoryAuditStore {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.push(record.clone());
        Ok(())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        let records = self.records.read().await;
        let mut out: Vec<AuditRecord> = records.iter().cloned().collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn by_action(&self, action: AuditAction, limit: u32) -> Result<Vec<AuditRecord>> {
        let records = self.records.read().await;
        let mut out: Vec<AuditRecord> = records
            .iter()
            .filter(|r| r.action == action)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn stats(&self) -> Result<AuditStats> {
        let records = self.records.read().await;
        let mut stats = AuditStats {
            total: records.len() as u64,
            ..AuditStats::default()
        };
        for record in records.iter() {
            *stats
                .by_action
                .entry(record.action.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_provider
                .entry(record.provider.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
