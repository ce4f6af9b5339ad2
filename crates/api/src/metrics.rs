use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use index::CommitResult;

#[derive(Default)]
pub struct Metrics {
    // Documents
    documents_ingested: AtomicUsize,
    documents_staged: AtomicUsize,
    documents_failed: AtomicUsize,

    // Extraction and commit outcomes
    chunks_failed: AtomicUsize,
    triples_dropped: AtomicUsize,
    entities_upserted: AtomicUsize,
    relationships_upserted: AtomicUsize,

    // Queries
    queries_answered: AtomicUsize,
    queries_failed: AtomicUsize,

    // Timing (in microseconds)
    total_ingest_time_us: AtomicU64,
    total_query_time_us: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_commit(&self, duration: Duration, result: &CommitResult) {
        self.documents_ingested.fetch_add(1, Ordering::Relaxed);
        self.chunks_failed.fetch_add(result.failed_chunks.len(), Ordering::Relaxed);
        self.triples_dropped.fetch_add(result.triples_dropped, Ordering::Relaxed);
        self.entities_upserted.fetch_add(result.entities_upserted, Ordering::Relaxed);
        self.relationships_upserted
            .fetch_add(result.relationships_upserted, Ordering::Relaxed);
        self.total_ingest_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_staged(&self, failed_chunks: usize) {
        self.documents_staged.fetch_add(1, Ordering::Relaxed);
        self.chunks_failed.fetch_add(failed_chunks, Ordering::Relaxed);
    }

    pub fn record_document_failure(&self) {
        self.documents_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self, duration: Duration, success: bool) {
        if success {
            self.queries_answered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.queries_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_query_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let ingested = self.documents_ingested.load(Ordering::Relaxed);
        let queries =
            self.queries_answered.load(Ordering::Relaxed) + self.queries_failed.load(Ordering::Relaxed);

        MetricsSnapshot {
            documents_ingested: ingested,
            documents_staged: self.documents_staged.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            triples_dropped: self.triples_dropped.load(Ordering::Relaxed),
            entities_upserted: self.entities_upserted.load(Ordering::Relaxed),
            relationships_upserted: self.relationships_upserted.load(Ordering::Relaxed),
            queries_answered: self.queries_answered.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            avg_ingest_time_ms: avg_time_ms(&self.total_ingest_time_us, ingested),
            avg_query_time_ms: avg_time_ms(&self.total_query_time_us, queries),
        }
    }
}

fn avg_time_ms(total_us: &AtomicU64, count: usize) -> f64 {
    if count == 0 {
        return 0.0;
    }
    total_us.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub documents_ingested: usize,
    pub documents_staged: usize,
    pub documents_failed: usize,
    pub chunks_failed: usize,
    pub triples_dropped: usize,
    pub entities_upserted: usize,
    pub relationships_upserted: usize,
    pub queries_answered: usize,
    pub queries_failed: usize,
    pub avg_ingest_time_ms: f64,
    pub avg_query_time_ms: f64,
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
