use crate::controller::ControllerReturn;
use crate::metrics::snapshot::MetricsSnapshot;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct MetricsCollector {
    runs_started: Arc<AtomicU64>,
    runs_completed: Arc<AtomicU64>,
    runs_aborted: Arc<AtomicU64>,
    runs_empty: Arc<AtomicU64>,
    files_fetched: Arc<AtomicU64>,
    files_failed: Arc<AtomicU64>,
    bytes_fetched: Arc<AtomicU64>,
    records_total: Arc<AtomicU64>,
    records_inserted: Arc<AtomicU64>,
    record_errors: Arc<AtomicU64>,
    tasks_skipped: Arc<AtomicU64>,
    total_fetch_time_ms: Arc<AtomicU64>,
    start_time: Arc<Instant>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            runs_started: Arc::new(AtomicU64::new(0)),
            runs_completed: Arc::new(AtomicU64::new(0)),
            runs_aborted: Arc::new(AtomicU64::new(0)),
            runs_empty: Arc::new(AtomicU64::new(0)),
            files_fetched: Arc::new(AtomicU64::new(0)),
            files_failed: Arc::new(AtomicU64::new(0)),
            bytes_fetched: Arc::new(AtomicU64::new(0)),
            records_total: Arc::new(AtomicU64::new(0)),
            records_inserted: Arc::new(AtomicU64::new(0)),
            record_errors: Arc::new(AtomicU64::new(0)),
            tasks_skipped: Arc::new(AtomicU64::new(0)),
            total_fetch_time_ms: Arc::new(AtomicU64::new(0)),
            start_time: Arc::new(Instant::now()),
        }
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_runs_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_runs_aborted(&self) {
        self.runs_aborted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_runs_empty(&self) {
        self.runs_empty.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_tasks_skipped(&self) {
        self.tasks_skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_files_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_fetch(&self, bytes: usize, duration: Duration) {
        self.files_fetched.fetch_add(1, Ordering::SeqCst);
        self.bytes_fetched.fetch_add(bytes as u64, Ordering::SeqCst);
        self.total_fetch_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn record_ingest(&self, result: &ControllerReturn) {
        self.records_total
            .fetch_add(result.total_records as u64, Ordering::SeqCst);
        self.records_inserted
            .fetch_add(result.inserted_records as u64, Ordering::SeqCst);
        self.record_errors
            .fetch_add(result.errors as u64, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let files_fetched = self.files_fetched.load(Ordering::SeqCst);
        let total_time = self.total_fetch_time_ms.load(Ordering::SeqCst);

        let avg_fetch_time_ms = if files_fetched > 0 {
            total_time / files_fetched
        } else {
            0
        };

        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::SeqCst),
            runs_completed: self.runs_completed.load(Ordering::SeqCst),
            runs_aborted: self.runs_aborted.load(Ordering::SeqCst),
            runs_empty: self.runs_empty.load(Ordering::SeqCst),
            files_fetched,
            files_failed: self.files_failed.load(Ordering::SeqCst),
            bytes_fetched: self.bytes_fetched.load(Ordering::SeqCst),
            records_total: self.records_total.load(Ordering::SeqCst),
            records_inserted: self.records_inserted.load(Ordering::SeqCst),
            record_errors: self.record_errors.load(Ordering::SeqCst),
            tasks_skipped: self.tasks_skipped.load(Ordering::SeqCst),
            avg_fetch_time_ms,
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = MetricsCollector::new();
        let other = metrics.clone();

        other.record_fetch(2048, Duration::from_millis(30));
        other.record_fetch(1024, Duration::from_millis(10));
        metrics.record_ingest(&ControllerReturn {
            total_records: 20,
            inserted_records: 18,
            errors: 2,
            ..Default::default()
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.files_fetched, 2);
        assert_eq!(snapshot.bytes_fetched, 3072);
        assert_eq!(snapshot.avg_fetch_time_ms, 20);
        assert_eq!(snapshot.records_inserted, 18);
        assert_eq!(snapshot.record_errors, 2);
    }
}
