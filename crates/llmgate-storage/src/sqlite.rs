//! SQLite audit store.
//!
//! Single-file durable backend for the audit log, using WAL journal mode
//! so the background writer never blocks readers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use llmgate_core::{AuditAction, AuditRecord, AuditStats, AuditStore, GateError, Provider, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Schema migrations
// ---------------------------------------------------------------------------

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS audit_log (
        id TEXT NOT NULL PRIMARY KEY,
        timestamp TEXT NOT NULL,
        provider TEXT NOT NULL,
        anonymized_payload TEXT NOT NULL,
        action TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        response_time_ms INTEGER,
        error_message TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_audit_provider ON audit_log(provider)",
    "CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action)",
];

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Durable audit store backed by a SQLite connection pool.
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| GateError::Storage(format!("invalid database path {path}: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| GateError::Storage(format!("failed to open {path}: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        for migration in MIGRATIONS {
            sqlx::query(migration)
                .execute(&self.pool)
                .await
                .map_err(|e| GateError::Storage(format!("migration failed: {e}")))?;
        }
        Ok(())
    }

    fn row_to_record(row: &SqliteRow) -> Result<AuditRecord> {
        let id: String = row.get("id");
        let timestamp: String = row.get("timestamp");
        let provider: String = row.get("provider");
        let action: String = row.get("action");

        Ok(AuditRecord {
            id: Uuid::parse_str(&id)
                .map_err(|e| GateError::Storage(format!("invalid record id {id}: {e}")))?,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| GateError::Storage(format!("invalid timestamp {timestamp}: {e}")))?
                .with_timezone(&Utc),
            provider: Provider::from_str(&provider)?,
            endpoint: row.get("endpoint"),
            action: AuditAction::from_str(&action)?,
            anonymized_payload: row.get("anonymized_payload"),
            response_time_ms: row.get("response_time_ms"),
            error_message: row.get("error_message"),
        })
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log
                (id, timestamp, provider, anonymized_payload, action, endpoint,
                 response_time_ms, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(record.id.to_string())
        .bind(record.timestamp.to_rfc3339())
        .bind(record.provider.as_str())
        .bind(&record.anonymized_payload)
        .bind(record.action.as_str())
        .bind(&record.endpoint)
        .bind(record.response_time_ms)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| GateError::Storage(format!("failed to insert audit record: {e}")))?;

        Ok(())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query("SELECT * FROM audit_log ORDER BY timestamp DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GateError::Storage(format!("failed to query recent records: {e}")))?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn by_action(&self, action: AuditAction, limit: u32) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM audit_log WHERE action = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )
        .bind(action.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GateError::Storage(format!("failed to query records by action: {e}")))?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn stats(&self) -> Result<AuditStats> {
        let total_row = sqlx::query("SELECT COUNT(*) AS count FROM audit_log")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| GateError::Storage(format!("failed to count audit records: {e}")))?;
        let total: i64 = total_row.get("count");

        let mut stats = AuditStats {
            total: total as u64,
            ..AuditStats::default()
        };

        let action_rows =
            sqlx::query("SELECT action, COUNT(*) AS count FROM audit_log GROUP BY action")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| GateError::Storage(format!("failed to group by action: {e}")))?;
        for row in action_rows {
            let action: String = row.get("action");
            let count: i64 = row.get("count");
            stats.by_action.insert(action, count as u64);
        }

        let provider_rows =
            sqlx::query("SELECT provider, COUNT(*) AS count FROM audit_log GROUP BY provider")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| GateError::Storage(format!("failed to group by provider: {e}")))?;
        for row in provider_rows {
            let provider: String = row.get("provider");
            let count: i64 = row.get("count");
            stats.by_provider.insert(provider, count as u64);
        }

        Ok(stats)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| GateError::Storage(format!("health check failed: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
