use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_aborted: u64,
    pub runs_empty: u64,
    pub files_fetched: u64,
    pub files_failed: u64,
    pub bytes_fetched: u64,
    pub records_total: u64,
    pub records_inserted: u64,
    pub record_errors: u64,
    pub tasks_skipped: u64,
    pub avg_fetch_time_ms: u64,
    pub elapsed_seconds: f64,
}
