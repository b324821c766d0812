use async_trait::async_trait;
use flipstake_core::storage::AuditStore;
use flipstake_core::{AuditEvent, Storage};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{error, info};

/// Destination for structured audit events.
///
/// Recording never fails the operation being audited; sinks log their own
/// write errors.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Emits every event on the `audit` tracing target.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            wager_id = %event.wager_id,
            kind = %event.kind,
            actor = ?event.actor,
            amount_sat = ?event.amount.map(|a| a.to_sat()),
            signature = ?event.signature,
            detail = ?event.detail,
            "audit event"
        );
    }
}

/// Appends events to the `audit_log` table.
pub struct SqliteAuditSink {
    storage: Arc<Storage>,
}

impl SqliteAuditSink {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn record(&self, event: AuditEvent) {
        if let Err(e) = AuditStore::new(&self.storage).append(&event).await {
            error!(
                "Failed to persist audit event {} for {}: {}",
                event.kind, event.wager_id, e
            );
        }
    }
}

/// Fans each event out to several sinks.
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }

    /// Tracing plus the SQLite audit log.
    pub fn standard(storage: Arc<Storage>) -> Self {
        Self::new(vec![
            Arc::new(TracingAuditSink),
            Arc::new(SqliteAuditSink::new(storage)),
        ])
    }
}

#[async_trait]
impl AuditSink for CompositeAuditSink {
    async fn record(&self, event: AuditEvent) {
        join_all(self.sinks.iter().map(|sink| sink.record(event.clone()))).await;
    }
}
