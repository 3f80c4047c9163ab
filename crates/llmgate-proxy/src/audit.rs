//! Asynchronous audit logging.
//!
//! [`AuditLogger::log`] enqueues the record and returns before persistence
//! completes; a single background worker drains the queue into the store.
//! Write failures are logged and never affect the response path. Durability
//! is best-effort: a crash can lose at most the in-flight buffer. Tests use
//! [`AuditLogger::flush`] to drain the queue deterministically.

use llmgate_core::{AuditRecord, AuditStore};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

enum LoggerMessage {
    Record(Box<AuditRecord>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the audit write queue. Cheap to clone.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::UnboundedSender<LoggerMessage>,
}

impl AuditLogger {
    /// Spawn the background writer for `store`.
    pub fn spawn(store: Arc<dyn AuditStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LoggerMessage>();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    LoggerMessage::Record(record) => {
                        if let Err(e) = store.record(&record).await {
                            error!(record_id = %record.id, "Audit write failed: {e}");
                        }
                    }
                    LoggerMessage::Flush(ack) => {
                        // All records enqueued before this barrier have been
                        // written; the receiver may already be gone.
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self { tx }
    }

    /// Enqueue one record. Never blocks and never fails the caller.
    pub fn log(&self, record: AuditRecord) {
        if self.tx.send(LoggerMessage::Record(Box::new(record))).is_err() {
            error!("Audit worker is gone; dropping record");
        }
    }

    /// Wait until every previously enqueued record has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(LoggerMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}
