pub mod config;
pub mod controller;
pub mod dirlisting;
pub mod error;
pub mod fetch;
pub mod history;
pub mod metrics;
pub mod orchestrator;
pub mod parser;
pub mod processor;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod watermark;

pub use controller::{ControllerReturn, IngestController};
pub use dirlisting::{Dirlisting, DirlistingEntry, FileKind, Selection};
pub use error::{Error, Result};
pub use fetch::{Fetcher, HttpFetcher};
pub use history::{CrawlHistoryEntry, CrawlHistoryStore};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use orchestrator::{BatchReport, CrawlOrchestrator, CrawlReport, RunOptions, RunState, RunStatus};
pub use processor::Processor;
pub use registry::{CrawlerDefinition, CrawlerRegistry, CrawlerSchedule, SelectionMode};
pub use scheduler::{ScheduledTask, Scheduler, TriggerOutcome};
pub use watermark::{CrawlWatermark, WatermarkStore};
