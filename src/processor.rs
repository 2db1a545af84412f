use crate::controller::{ControllerReturn, IngestController};
use crate::dirlisting::{Dirlisting, Selection};
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::metrics::MetricsCollector;
use crate::orchestrator::{RunState, RunStatus};
use crate::parser::{ParseOutcome, SchemaRegistry, SourceFormat, TableParser};
use crate::registry::CrawlerDefinition;
use crate::store::DomainStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use url::Url;

/// How a crawler turns its source into table rows. One variant per source family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Processor {
    /// Directory listing of multi-table report files and archives.
    AemoMms,
    /// Header-row CSV, either a listing of files or a single `.csv` url.
    WemCsv { table: String },
    /// JSON observation feed at a single url.
    BomObservations { table: String },
}

impl Processor {
    pub fn source_format(&self) -> SourceFormat {
        match self {
            Processor::AemoMms => SourceFormat::Mms,
            Processor::WemCsv { table } => SourceFormat::Csv {
                table: table.clone(),
            },
            Processor::BomObservations { table } => SourceFormat::Observations {
                table: table.clone(),
            },
        }
    }

    pub fn target_table(&self) -> Option<&str> {
        match self {
            Processor::AemoMms => None,
            Processor::WemCsv { table } | Processor::BomObservations { table } => Some(table),
        }
    }

    fn reads_listing(&self, url: &Url) -> bool {
        match self {
            Processor::AemoMms => true,
            Processor::WemCsv { .. } => !url.path().to_ascii_lowercase().ends_with(".csv"),
            Processor::BomObservations { .. } => false,
        }
    }

    /// Runs one crawl for `definition`. `None` means there was nothing to ingest.
    pub async fn process(
        &self,
        definition: &CrawlerDefinition,
        selection: &Selection,
        ctx: &ProcessContext,
    ) -> Result<Option<ControllerReturn>> {
        let url = definition.require_url()?;

        if self.reads_listing(url) {
            self.crawl_listing(definition, url, selection, ctx).await
        } else {
            self.crawl_direct(definition, url, ctx).await
        }
    }

    async fn crawl_listing(
        &self,
        definition: &CrawlerDefinition,
        url: &Url,
        selection: &Selection,
        ctx: &ProcessContext,
    ) -> Result<Option<ControllerReturn>> {
        ctx.enter(&definition.name, RunState::Fetching);

        let mut listing = Dirlisting::fetch(ctx.fetcher.as_ref(), url, definition.timezone).await?;
        if let Some(filter) = &definition.filename_filter {
            listing.apply_filter(filter);
        }
        listing.retain_fetchable();

        let entries = listing.select(selection);
        log::info!(
            "{}: {} files listed, {} selected",
            definition.name,
            listing.file_count(),
            entries.len()
        );

        if entries.is_empty() {
            log::info!("Nothing to do");
            return Ok(None);
        }

        let last_modified = entries.iter().map(|e| e.modified).max();

        let mut files = Vec::with_capacity(entries.len());
        for entry in &entries {
            let bytes = ctx.fetch(&entry.link).await?;
            files.push((entry.filename.clone(), bytes));
        }

        parse_and_ingest(
            &definition.name,
            ctx.parser(definition),
            &self.source_format(),
            files,
            last_modified,
            ctx,
        )
        .await
    }

    async fn crawl_direct(
        &self,
        definition: &CrawlerDefinition,
        url: &Url,
        ctx: &ProcessContext,
    ) -> Result<Option<ControllerReturn>> {
        ctx.enter(&definition.name, RunState::Fetching);

        let bytes = ctx.fetch(url).await?;
        let fetched_at = Utc::now();

        parse_and_ingest(
            &definition.name,
            ctx.parser(definition),
            &self.source_format(),
            vec![(file_name(url), bytes)],
            Some(fetched_at),
            ctx,
        )
        .await
    }
}

pub(crate) fn file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| url.to_string())
}

/// Parses every file off the async runtime, drops files that fail on their
/// own and ingests the rest as one table set.
pub(crate) async fn parse_and_ingest(
    crawler: &str,
    parser: TableParser,
    format: &SourceFormat,
    files: Vec<(String, Vec<u8>)>,
    last_modified: Option<DateTime<Utc>>,
    ctx: &ProcessContext,
) -> Result<Option<ControllerReturn>> {
    ctx.enter(crawler, RunState::Parsing);

    let mut parsed = ParseOutcome::default();
    for (name, bytes) in files {
        let parser = parser.clone();
        let format = format.clone();
        let file = name.clone();

        let result = tokio::task::spawn_blocking(move || parser.parse(&file, &bytes, &format))
            .await
            .map_err(|e| Error::Internal(format!("parser task failed: {}", e)))?;

        match result {
            Ok(outcome) => parsed.merge(outcome),
            Err(e) if e.is_file_level() => {
                log::warn!("Dropping {}: {}", name, e);
                ctx.metrics.increment_files_failed();
            }
            Err(e) => return Err(e),
        }
    }

    if parsed.files_parsed == 0 {
        log::info!("Nothing to do");
        return Ok(None);
    }

    ctx.enter(crawler, RunState::Ingesting);
    let result = ctx.controller.ingest_parsed(&parsed, last_modified).await?;
    ctx.metrics.record_ingest(&result);
    Ok(Some(result))
}

/// Collaborators shared by every run of one orchestrator.
pub struct ProcessContext {
    pub fetcher: Arc<dyn Fetcher>,
    pub schemas: Arc<SchemaRegistry>,
    pub controller: IngestController,
    pub metrics: MetricsCollector,
    status: watch::Sender<RunStatus>,
}

impl ProcessContext {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        schemas: Arc<SchemaRegistry>,
        store: Arc<dyn DomainStore>,
        metrics: MetricsCollector,
    ) -> Self {
        let (status, _) = watch::channel(RunStatus::default());

        Self {
            fetcher,
            controller: IngestController::new(store, schemas.clone()),
            schemas,
            metrics,
            status,
        }
    }

    pub fn enter(&self, crawler: &str, state: RunState) {
        log::debug!("{}: {:?}", crawler, state);
        self.status.send_replace(RunStatus {
            crawler: crawler.to_string(),
            state,
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    pub fn parser(&self, definition: &CrawlerDefinition) -> TableParser {
        TableParser::new(self.schemas.clone(), definition.timezone)
            .with_encoding(definition.encoding.clone())
    }

    pub async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        let start = Instant::now();
        match self.fetcher.fetch_bytes(url).await {
            Ok(bytes) => {
                self.metrics.record_fetch(bytes.len(), start.elapsed());
                Ok(bytes)
            }
            Err(e) => {
                self.metrics.increment_files_failed();
                Err(e)
            }
        }
    }
}
