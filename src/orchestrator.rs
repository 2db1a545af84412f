use crate::controller::ControllerReturn;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::history::{CrawlHistoryEntry, CrawlHistoryStore};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::parser::{SchemaRegistry, SourceFormat, TableParser};
use crate::processor::{self, ProcessContext};
use crate::registry::{CrawlerDefinition, CrawlerRegistry, CrawlerSchedule};
use crate::store::DomainStore;
use crate::watermark::{CrawlWatermark, WatermarkStore, WATERMARK_VERSION};
use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use url::Url;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RunState {
    #[default]
    Idle,
    Selecting,
    Fetching,
    Parsing,
    Ingesting,
    Updating,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatus {
    pub crawler: String,
    pub state: RunState,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Select by limit (or everything) even when a watermark is stored.
    pub ignore_watermark: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub crawler: String,
    /// `None` when the run found nothing to ingest.
    pub result: Option<ControllerReturn>,
    pub watermark: CrawlWatermark,
    pub advanced: bool,
}

/// Outcome of driving several crawlers in turn.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub reports: Vec<CrawlReport>,
    pub failed: Vec<String>,
}

pub struct CrawlOrchestrator {
    registry: Arc<CrawlerRegistry>,
    watermarks: Arc<dyn WatermarkStore>,
    history: Option<Arc<dyn CrawlHistoryStore>>,
    ctx: ProcessContext,
    watermark_version: u32,
}

impl CrawlOrchestrator {
    pub fn new(
        registry: Arc<CrawlerRegistry>,
        watermarks: Arc<dyn WatermarkStore>,
        store: Arc<dyn DomainStore>,
        fetcher: Arc<dyn Fetcher>,
        schemas: Arc<SchemaRegistry>,
        metrics: Option<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            watermarks,
            history: None,
            ctx: ProcessContext::new(fetcher, schemas, store, metrics.unwrap_or_default()),
            watermark_version: WATERMARK_VERSION,
        }
    }

    pub fn with_watermark_version(mut self, version: u32) -> Self {
        self.watermark_version = version;
        self
    }

    /// Records stored intervals of every clean run in `history`.
    pub fn with_history(mut self, history: Arc<dyn CrawlHistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn registry(&self) -> &Arc<CrawlerRegistry> {
        &self.registry
    }

    pub fn watch_state(&self) -> watch::Receiver<RunStatus> {
        self.ctx.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    pub async fn run_crawl(&self, name: &str, options: RunOptions) -> Result<CrawlReport> {
        let definition = self
            .registry
            .by_name(name)
            .await
            .ok_or_else(|| Error::Config(format!("crawler {} not found", name)))?;

        self.run_definition(definition, options).await
    }

    pub async fn run_definition(
        &self,
        definition: CrawlerDefinition,
        options: RunOptions,
    ) -> Result<CrawlReport> {
        let name = definition.name.clone();
        log::info!("Crawling: {} ...", name);
        self.ctx.metrics.increment_runs_started();

        match self.execute(definition, options).await {
            Ok(report) => {
                self.ctx.enter(&name, RunState::Done);
                self.ctx.metrics.increment_runs_completed();
                Ok(report)
            }
            Err(e) => {
                self.ctx.enter(&name, RunState::Aborted);
                self.ctx.metrics.increment_runs_aborted();
                Err(e)
            }
        }
    }

    async fn execute(&self, definition: CrawlerDefinition, options: RunOptions) -> Result<CrawlReport> {
        let name = definition.name.clone();

        // The attempt marker is written whether or not the run succeeds.
        let attempted = self
            .watermarks
            .record_attempt(&name, self.watermark_version, Utc::now())
            .await?;
        let definition = definition.merge_watermark(attempted)?;
        self.registry.replace(definition.clone()).await;

        self.ctx.enter(&name, RunState::Selecting);
        let selection = definition.selection(!options.ignore_watermark);
        log::debug!("{}: selection {:?}", name, selection);

        let Some(result) = definition.processor.process(&definition, &selection, &self.ctx).await? else {
            self.ctx.metrics.increment_runs_empty();
            return Ok(CrawlReport {
                crawler: name,
                result: None,
                watermark: definition.watermark,
                advanced: false,
            });
        };

        self.ctx.enter(&name, RunState::Updating);

        let mut watermark = definition.watermark.clone();
        let mut advanced = false;

        if result.errors > 0 {
            log::error!(
                "Crawl {} finished with {} errors of {} records: {}",
                name,
                result.errors,
                result.total_records,
                result.error_detail.as_deref().unwrap_or("no detail")
            );
        } else if let Some(latest) = result.last_modified {
            watermark = self.watermarks.record_success(&name, latest).await?;
            advanced = true;
            log::info!("{}: watermark advanced to {}", name, latest);
            self.record_history(&name, &result).await;
        }

        self.registry
            .replace(CrawlerDefinition {
                watermark: watermark.clone(),
                ..definition
            })
            .await;

        Ok(CrawlReport {
            crawler: name,
            result: Some(result),
            watermark,
            advanced,
        })
    }

    async fn record_history(&self, name: &str, result: &ControllerReturn) {
        let Some(history) = &self.history else {
            return;
        };
        let entries = CrawlHistoryEntry::from_return(result);
        if entries.is_empty() {
            return;
        }

        match history.set_history(name, &entries).await {
            Ok(added) => log::debug!("{}: {} new history intervals", name, added),
            Err(e) => log::warn!("{}: could not record crawl history: {}", name, e),
        }
    }

    pub async fn run_all(&self, options: RunOptions) -> Result<BatchReport> {
        let definitions = self.registry.definitions().await;
        self.run_each(definitions, options).await
    }

    pub async fn run_by_schedule(
        &self,
        schedule: CrawlerSchedule,
        options: RunOptions,
    ) -> Result<BatchReport> {
        let definitions = self.registry.by_schedule(schedule).await;
        self.run_each(definitions, options).await
    }

    async fn run_each(
        &self,
        definitions: Vec<CrawlerDefinition>,
        options: RunOptions,
    ) -> Result<BatchReport> {
        if self.registry.is_empty().await {
            return Err(Error::Config("No crawlers found".to_string()));
        }

        let mut batch = BatchReport::default();
        let active: Vec<CrawlerDefinition> = definitions.into_iter().filter(|d| d.active).collect();
        if active.is_empty() {
            log::info!("No active crawlers to run");
            return Ok(batch);
        }

        for definition in active {
            let name = definition.name.clone();
            match self.run_definition(definition, options).await {
                Ok(report) => batch.reports.push(report),
                Err(e) => {
                    log::error!("Crawler {} failed: {}", name, e);
                    batch.failed.push(name);
                }
            }
        }
        Ok(batch)
    }

    /// Parses and ingests the named files directly. No watermark is read or written.
    pub async fn run_urls(
        &self,
        urls: &[Url],
        format: SourceFormat,
        timezone: Tz,
    ) -> Result<Option<ControllerReturn>> {
        let label = "urls";
        self.ctx.enter(label, RunState::Fetching);

        let mut files = Vec::new();
        for url in urls {
            let lower = url.path().to_ascii_lowercase();
            if !(lower.ends_with(".zip") || lower.ends_with(".csv")) {
                log::info!("Skipping {}: not a .zip or .csv file", url);
                continue;
            }
            match self.ctx.fetch(url).await {
                Ok(bytes) => files.push((processor::file_name(url), bytes)),
                Err(e) => log::error!("Could not fetch {}: {}", url, e),
            }
        }

        if files.is_empty() {
            log::info!("Nothing to do");
            return Ok(None);
        }

        let parser = TableParser::new(self.ctx.schemas.clone(), timezone);
        let result = processor::parse_and_ingest(label, parser, &format, files, None, &self.ctx).await;

        self.ctx.enter(
            label,
            if result.is_ok() {
                RunState::Done
            } else {
                RunState::Aborted
            },
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Processor;
    use crate::registry::SelectionMode;
    use crate::store::{MemoryStore, MemoryWatermarkStore};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::collections::HashMap;

    const LISTING: &str = r#"<html><body><pre>
<A HREF="/Reports/Current/">[To Parent Directory]</A><br><br>
 Sunday, June 12, 2022 10:05 AM 2048 <A HREF="/Reports/Current/Dispatch/PUBLIC_DISPATCHIS_A.CSV">PUBLIC_DISPATCHIS_A.CSV</A><br>
 Monday, June 13, 2022 10:05 AM 2048 <A HREF="/Reports/Current/Dispatch/PUBLIC_DISPATCHIS_B.CSV">PUBLIC_DISPATCHIS_B.CSV</A><br>
</pre></body></html>"#;

    fn report(region: &str) -> Vec<u8> {
        format!(
            "C,NEMP.WORLD,DISPATCHIS,AEMO,PUBLIC\n\
             I,DISPATCH,PRICE,5,SETTLEMENTDATE,REGIONID,INTERVENTION,RRP\n\
             D,DISPATCH,PRICE,5,\"2022/06/12 10:05:00\",{},0,212.4\n\
             C,\"END OF REPORT\",3\n",
            region
        )
        .into_bytes()
    }

    /// Serves canned bodies by url; anything else is a fetch error.
    struct CannedFetcher {
        bodies: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl Fetcher for CannedFetcher {
        async fn fetch_text(&self, url: &Url) -> Result<String> {
            let bytes = self.fetch_bytes(url).await?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>> {
            self.bodies
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| Error::fetch(url, "HTTP status 404 Not Found"))
        }
    }

    fn fetcher() -> CannedFetcher {
        let base = "http://nemweb.test/Reports/Current/Dispatch";
        let mut bodies = HashMap::new();
        bodies.insert(format!("{}/", base), LISTING.as_bytes().to_vec());
        bodies.insert(format!("{}/PUBLIC_DISPATCHIS_A.CSV", base), report("NSW1"));
        bodies.insert(format!("{}/PUBLIC_DISPATCHIS_B.CSV", base), report("QLD1"));
        CannedFetcher { bodies }
    }

    fn definition(name: &str, url: &str, mode: SelectionMode) -> CrawlerDefinition {
        CrawlerDefinition {
            name: name.to_string(),
            url: Some(Url::parse(url).unwrap()),
            timezone: chrono_tz::Australia::Brisbane,
            mode,
            limit: None,
            filename_filter: None,
            processor: Processor::AemoMms,
            schedule: Some(CrawlerSchedule::Live),
            encoding: None,
            active: true,
            watermark: CrawlWatermark::default(),
        }
    }

    struct Harness {
        orchestrator: CrawlOrchestrator,
        store: Arc<MemoryStore>,
        watermarks: Arc<MemoryWatermarkStore>,
    }

    fn harness(definitions: Vec<CrawlerDefinition>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let watermarks = Arc::new(MemoryWatermarkStore::new());
        let registry = Arc::new(CrawlerRegistry::from_definitions(definitions).unwrap());

        let orchestrator = CrawlOrchestrator::new(
            registry,
            watermarks.clone(),
            store.clone(),
            Arc::new(fetcher()),
            Arc::new(SchemaRegistry::builtin()),
            None,
        )
        .with_history(watermarks.clone());
        Harness {
            orchestrator,
            store,
            watermarks,
        }
    }

    fn brisbane(day: u32) -> DateTime<Utc> {
        chrono_tz::Australia::Brisbane
            .with_ymd_and_hms(2022, 6, day, 10, 5, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn full_run_advances_watermark_to_newest_file() {
        let h = harness(vec![definition(
            "au.nemweb.dispatch_is",
            "http://nemweb.test/Reports/Current/Dispatch/",
            SelectionMode::SinceWatermark,
        )]);
        let mut states = h.orchestrator.watch_state();

        let report = h
            .orchestrator
            .run_crawl("au.nemweb.dispatch_is", RunOptions::default())
            .await
            .unwrap();

        let result = report.result.unwrap();
        assert_eq!(result.total_records, 2);
        assert_eq!(result.inserted_records, 2);
        assert!(report.advanced);
        assert_eq!(report.watermark.server_latest, Some(brisbane(13)));
        assert_eq!(h.store.count("dispatch_price").await.unwrap(), 2);
        assert_eq!(states.borrow_and_update().state, RunState::Done);

        let history = h
            .watermarks
            .history("au.nemweb.dispatch_is", brisbane(12), brisbane(13))
            .await
            .unwrap();
        assert_eq!(
            history,
            vec![CrawlHistoryEntry {
                interval: brisbane(12),
                records: Some(2)
            }]
        );

        // Second run selects nothing past the watermark.
        let writes = h.store.writes();
        let again = h
            .orchestrator
            .run_crawl("au.nemweb.dispatch_is", RunOptions::default())
            .await
            .unwrap();
        assert!(again.result.is_none());
        assert!(!again.advanced);
        assert_eq!(h.store.writes(), writes);
        assert_eq!(again.watermark.server_latest, Some(brisbane(13)));
        assert_eq!(h.orchestrator.metrics().runs_empty, 1);
    }

    #[tokio::test]
    async fn ignoring_the_watermark_reprocesses_everything() {
        let h = harness(vec![definition(
            "au.nemweb.dispatch_is",
            "http://nemweb.test/Reports/Current/Dispatch/",
            SelectionMode::SinceWatermark,
        )]);
        h.orchestrator
            .run_crawl("au.nemweb.dispatch_is", RunOptions::default())
            .await
            .unwrap();

        let again = h
            .orchestrator
            .run_crawl(
                "au.nemweb.dispatch_is",
                RunOptions {
                    ignore_watermark: true,
                },
            )
            .await
            .unwrap();
        let result = again.result.unwrap();
        assert_eq!(result.total_records, 2);
        assert_eq!(result.inserted_records, 0);
    }

    #[tokio::test]
    async fn fetch_failure_records_the_attempt_only() {
        let h = harness(vec![definition(
            "au.nemweb.missing",
            "http://nemweb.test/Reports/Current/Missing/",
            SelectionMode::Full,
        )]);

        let err = h
            .orchestrator
            .run_crawl("au.nemweb.missing", RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));

        let mark = h.watermarks.get("au.nemweb.missing").await.unwrap().unwrap();
        assert_eq!(mark.version, Some(WATERMARK_VERSION));
        assert!(mark.last_attempted.is_some());
        assert!(mark.server_latest.is_none());
        assert_eq!(h.orchestrator.metrics().runs_aborted, 1);
        assert_eq!(h.orchestrator.watch_state().borrow().state, RunState::Aborted);
    }

    #[tokio::test]
    async fn one_failing_crawler_does_not_stop_the_others() {
        let h = harness(vec![
            definition(
                "au.nemweb.missing",
                "http://nemweb.test/Reports/Current/Missing/",
                SelectionMode::Full,
            ),
            definition(
                "au.nemweb.dispatch_is",
                "http://nemweb.test/Reports/Current/Dispatch/",
                SelectionMode::Full,
            ),
        ]);

        let batch = h
            .orchestrator
            .run_by_schedule(CrawlerSchedule::Live, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(batch.failed, vec!["au.nemweb.missing".to_string()]);
        assert_eq!(batch.reports.len(), 1);
        assert!(batch.reports[0].advanced);

        let idle = h
            .orchestrator
            .run_by_schedule(CrawlerSchedule::Daily, RunOptions::default())
            .await
            .unwrap();
        assert!(idle.reports.is_empty());
        assert!(idle.failed.is_empty());
    }

    #[tokio::test]
    async fn inactive_crawlers_are_not_run() {
        let mut paused = definition(
            "au.nemweb.dispatch_is",
            "http://nemweb.test/Reports/Current/Dispatch/",
            SelectionMode::Full,
        );
        paused.active = false;
        let h = harness(vec![paused]);

        let batch = h.orchestrator.run_all(RunOptions::default()).await.unwrap();
        assert!(batch.reports.is_empty());
        assert_eq!(h.watermarks.writes(), 0);
    }

    #[tokio::test]
    async fn unknown_crawler_is_a_configuration_error() {
        let h = harness(vec![]);
        let err = h
            .orchestrator
            .run_crawl("nope", RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(h.orchestrator.run_all(RunOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn run_urls_skips_unknown_extensions_and_leaves_watermarks_alone() {
        let h = harness(vec![]);
        let urls = vec![
            Url::parse("http://nemweb.test/Reports/Current/Dispatch/PUBLIC_DISPATCHIS_A.CSV").unwrap(),
            Url::parse("http://nemweb.test/Reports/Current/Dispatch/readme.html").unwrap(),
        ];

        let result = h
            .orchestrator
            .run_urls(&urls, SourceFormat::Mms, chrono_tz::Australia::Brisbane)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.inserted_records, 1);
        assert!(h.watermarks.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_urls_keeps_going_past_a_failed_fetch() {
        let h = harness(vec![]);
        let urls = vec![
            Url::parse("http://nemweb.test/Reports/Current/Dispatch/GONE.CSV").unwrap(),
            Url::parse("http://nemweb.test/Reports/Current/Dispatch/PUBLIC_DISPATCHIS_A.CSV").unwrap(),
        ];

        let result = h
            .orchestrator
            .run_urls(&urls, SourceFormat::Mms, chrono_tz::Australia::Brisbane)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.inserted_records, 1);
        assert_eq!(h.store.count("dispatch_price").await.unwrap(), 1);
        assert_eq!(h.orchestrator.metrics().files_failed, 1);

        let gone = [urls[0].clone()];
        let nothing = h
            .orchestrator
            .run_urls(&gone, SourceFormat::Mms, chrono_tz::Australia::Brisbane)
            .await
            .unwrap();
        assert!(nothing.is_none());
    }
}
