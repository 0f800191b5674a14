//! Process-local audit sink

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{AuditRecord, AuditSink};
use crate::error::AuditError;
use crate::types::TimeWindow;

/// Audit sink kept in memory. Lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
    failing: AtomicBool,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: appends and queries fail while set
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Every stored record in append order
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.read().clone()
    }

    fn check_available(&self) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("in-memory sink offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.check_available()?;
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn query(
        &self,
        subject_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        self.check_available()?;
        let mut records: Vec<AuditRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| r.subject_id == subject_id && window.contains(&r.timestamp))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::tests::record;

    #[tokio::test]
    async fn test_append_and_query() {
        let sink = InMemoryAuditSink::new();
        sink.append(&record("r1", "alice")).await.unwrap();
        sink.append(&record("r2", "bob")).await.unwrap();

        let records = sink.query("alice", &TimeWindow::all()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request_id, "r1");
    }

    #[tokio::test]
    async fn test_failing_sink() {
        let sink = InMemoryAuditSink::new();
        sink.set_failing(true);
        assert!(sink.append(&record("r1", "alice")).await.is_err());
        assert!(sink.is_empty());
    }
}
