//! Audit Recorder - append-only trail of every routed request
//!
//! The recorder is a side-channel. [`AuditRecorder::record`] never blocks and
//! never fails: records are queued to a background worker that appends them
//! to an [`AuditSink`]. When the sink fails, or the queue is full, records
//! land in a bounded ring buffer that the worker re-drives periodically.
//! Sink failures are visible only in logs and [`AuditStats`].

pub mod jsonl;
pub mod memory;
pub mod sqlite;

pub use jsonl::JsonlAuditSink;
pub use memory::InMemoryAuditSink;
pub use sqlite::SqliteAuditSink;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{AuditSettings, AuditSinkConfig};
use crate::error::{AuditError, ErrorKind};
use crate::policy::ComplianceVerdict;
use crate::quality::QualityVerdict;
use crate::types::{TimeWindow, Timestamp};

/// Immutable record of one request's verdict trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique per record. Request ids come from callers and may repeat.
    #[serde(default = "AuditRecord::new_id")]
    pub record_id: String,
    pub request_id: String,
    pub subject_id: String,
    pub project_id: Option<String>,
    pub handler_id: String,
    pub action: String,
    /// BLAKE3 of the canonical request payload
    pub request_digest: String,
    /// Absent when no result was produced
    pub result_digest: Option<String>,
    pub quality_verdict: Option<QualityVerdict>,
    pub compliance_verdict: Option<ComplianceVerdict>,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub timestamp: Timestamp,
    pub duration_ms: u64,
}

impl AuditRecord {
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Blocked by a quality or policy gate
    pub fn is_blocked(&self) -> bool {
        self.error_kind.map(|k| k.is_block()).unwrap_or(false)
    }
}

/// Durable destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;

    /// Records for `subject_id` inside `window`, oldest first
    async fn query(
        &self,
        subject_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<AuditRecord>, AuditError>;
}

/// Open the sink named by configuration
pub async fn open_sink(config: &AuditSinkConfig) -> Result<Arc<dyn AuditSink>, AuditError> {
    let sink: Arc<dyn AuditSink> = match config {
        AuditSinkConfig::Memory => Arc::new(InMemoryAuditSink::new()),
        AuditSinkConfig::Jsonl { path } => Arc::new(JsonlAuditSink::open(path).await?),
        AuditSinkConfig::Sqlite { path } => Arc::new(SqliteAuditSink::open(path)?),
    };
    Ok(sink)
}

/// Recorder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    /// Records handed to `record()`
    pub recorded: u64,
    /// Records the sink accepted
    pub persisted: u64,
    /// Records currently held in the fallback buffer
    pub buffered: u64,
    /// Records evicted from a full fallback buffer
    pub dropped: u64,
    /// Failed sink appends, including retries
    pub write_failures: u64,
}

/// Aggregate view over a set of records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total: usize,
    pub succeeded: usize,
    pub blocked: usize,
    pub failed: usize,
    pub by_handler: BTreeMap<String, usize>,
    pub mean_duration_ms: f64,
}

impl AuditSummary {
    pub fn from_records(records: &[AuditRecord]) -> Self {
        let mut summary = Self {
            total: records.len(),
            ..Self::default()
        };

        let mut total_duration = 0u64;
        for record in records {
            if record.success {
                summary.succeeded += 1;
            } else if record.is_blocked() {
                summary.blocked += 1;
            } else {
                summary.failed += 1;
            }
            *summary
                .by_handler
                .entry(record.handler_id.clone())
                .or_insert(0) += 1;
            total_duration += record.duration_ms;
        }

        if !records.is_empty() {
            summary.mean_duration_ms = total_duration as f64 / records.len() as f64;
        }
        summary
    }
}

enum Command {
    Record(AuditRecord),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Default)]
struct Counters {
    recorded: AtomicU64,
    persisted: AtomicU64,
    dropped: AtomicU64,
    write_failures: AtomicU64,
}

struct Shared {
    sink: Arc<dyn AuditSink>,
    fallback: Mutex<VecDeque<AuditRecord>>,
    fallback_capacity: usize,
    counters: Counters,
}

impl Shared {
    async fn persist(&self, record: AuditRecord) {
        match self.sink.append(&record).await {
            Ok(()) => {
                self.counters.persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Audit write failed for request {}: {}. Buffering record.",
                    record.request_id,
                    e
                );
                self.buffer(record);
            }
        }
    }

    fn buffer(&self, record: AuditRecord) {
        let mut fallback = self.fallback.lock();
        if fallback.len() >= self.fallback_capacity {
            if let Some(evicted) = fallback.pop_front() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "Audit fallback buffer full ({}), dropping record {}",
                    self.fallback_capacity,
                    evicted.request_id
                );
            }
        }
        fallback.push_back(record);
    }

    /// Push buffered records into the sink until it fails again
    async fn redrive(&self) {
        loop {
            let next = self.fallback.lock().pop_front();
            let Some(record) = next else {
                break;
            };

            match self.sink.append(&record).await {
                Ok(()) => {
                    self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Audit sink still failing: {}", e);
                    let mut fallback = self.fallback.lock();
                    if fallback.len() >= self.fallback_capacity {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            "Audit fallback buffer full ({}), dropping record {}",
                            self.fallback_capacity,
                            record.request_id
                        );
                    } else {
                        fallback.push_front(record);
                    }
                    break;
                }
            }
        }
    }

    fn buffered(&self) -> Vec<AuditRecord> {
        self.fallback.lock().iter().cloned().collect()
    }
}

/// Non-blocking front end to an [`AuditSink`]
pub struct AuditRecorder {
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuditRecorder {
    /// Start the background worker. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, settings: &AuditSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            sink,
            fallback: Mutex::new(VecDeque::new()),
            fallback_capacity: settings.fallback_capacity.max(1),
            counters: Counters::default(),
        });

        let flush_interval = settings.flush_interval().max(Duration::from_millis(1));
        let worker = tokio::spawn(run_worker(rx, Arc::clone(&shared), flush_interval));

        tracing::info!(
            "Audit recorder started (queue: {}, fallback: {})",
            settings.queue_capacity,
            settings.fallback_capacity
        );

        Self {
            tx,
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Open the configured sink and start the recorder
    pub async fn from_settings(settings: &AuditSettings) -> Result<Self, AuditError> {
        let sink = open_sink(&settings.sink).await?;
        Ok(Self::spawn(sink, settings))
    }

    /// Hand a record to the worker. Never blocks, never fails.
    pub fn record(&self, record: AuditRecord) {
        self.shared.counters.recorded.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.tx.try_send(Command::Record(record)) {
            let record = match e {
                mpsc::error::TrySendError::Full(Command::Record(r))
                | mpsc::error::TrySendError::Closed(Command::Record(r)) => r,
                _ => return,
            };
            tracing::warn!(
                "Audit queue unavailable, buffering record {}",
                record.request_id
            );
            self.shared.buffer(record);
        }
    }

    /// Wait until every record queued so far has been processed and the
    /// fallback buffer has been re-driven once.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).await.is_ok() && ack_rx.await.is_ok() {
            return;
        }
        self.shared.redrive().await;
    }

    /// Flush and stop the worker
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        tracing::info!("Audit recorder stopped: {:?}", self.stats());
    }

    pub fn stats(&self) -> AuditStats {
        let counters = &self.shared.counters;
        AuditStats {
            recorded: counters.recorded.load(Ordering::Relaxed),
            persisted: counters.persisted.load(Ordering::Relaxed),
            buffered: self.shared.fallback.lock().len() as u64,
            dropped: counters.dropped.load(Ordering::Relaxed),
            write_failures: counters.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Records for a subject, oldest first, including ones still buffered.
    ///
    /// A failing sink degrades to the buffered records alone.
    pub async fn query(&self, subject_id: &str, window: &TimeWindow) -> Vec<AuditRecord> {
        // Snapshot the buffer before reading the sink: a re-drive in between
        // then yields a duplicate instead of a missing record.
        let buffered = self.shared.buffered();

        let mut records = match self.shared.sink.query(subject_id, window).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Audit query failed, returning buffered records only: {}", e);
                Vec::new()
            }
        };

        let mut seen: HashSet<String> = records.iter().map(|r| r.record_id.clone()).collect();
        for record in buffered {
            if record.subject_id == subject_id
                && window.contains(&record.timestamp)
                && seen.insert(record.record_id.clone())
            {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        records
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Record(record)) => shared.persist(record).await,
                Some(Command::Flush(ack)) => {
                    shared.redrive().await;
                    let _ = ack.send(());
                }
                Some(Command::Shutdown(ack)) => {
                    rx.close();
                    while let Some(command) = rx.recv().await {
                        match command {
                            Command::Record(record) => shared.persist(record).await,
                            Command::Flush(ack) | Command::Shutdown(ack) => {
                                let _ = ack.send(());
                            }
                        }
                    }
                    shared.redrive().await;
                    let _ = ack.send(());
                    break;
                }
                None => {
                    shared.redrive().await;
                    break;
                }
            },
            _ = ticker.tick() => shared.redrive().await,
        }
    }
}
