use clap::{Parser, Subcommand};
use gridcrawl::config::{ConfigLoader, Settings};
use gridcrawl::parser::{SchemaRegistry, SourceFormat};
use gridcrawl::store::SqliteStore;
use gridcrawl::{
    BatchReport, CrawlHistoryStore, CrawlOrchestrator, CrawlReport, CrawlerRegistry,
    CrawlerSchedule, HttpFetcher, MetricsCollector, RunOptions, RunState, Scheduler,
    WatermarkStore,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use url::Url;

#[derive(Parser)]
#[command(name = "gridcrawl")]
#[command(version = "0.1.0")]
#[command(about = "Incremental crawler for published energy-market data", long_about = None)]
struct Cli {
    /// Crawler and table declarations (JSON/YAML/TOML)
    #[arg(short, long, global = true, default_value = "crawlers.yaml")]
    config: PathBuf,

    /// Runtime settings file; GRIDCRAWL_* variables override it
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one crawler
    Run {
        #[arg(short, long)]
        name: String,

        /// Select by limit even if a watermark is stored
        #[arg(long)]
        ignore_watermark: bool,

        /// Show a progress spinner (stderr)
        #[arg(short, long)]
        progress: bool,
    },
    /// Run every active crawler
    RunAll {
        #[arg(long)]
        ignore_watermark: bool,

        #[arg(short, long)]
        progress: bool,
    },
    /// Run the crawlers on one schedule
    RunSchedule {
        #[arg(value_enum)]
        schedule: CrawlerSchedule,

        #[arg(short, long)]
        progress: bool,
    },
    /// Parse and ingest the given .zip/.csv files without touching watermarks
    Urls {
        #[arg(required = true)]
        urls: Vec<Url>,

        /// Timezone the files' local times are in
        #[arg(long, default_value = "Australia/Brisbane")]
        timezone: String,
    },
    /// List crawlers and their watermarks
    List,
    /// Validate a configuration file
    Check,
    /// Clear stored watermarks and crawl history
    Flush {
        /// Only this crawler
        #[arg(short, long)]
        name: Option<String>,

        /// Only clear history for intervals in the last N days
        #[arg(short, long)]
        days: Option<u32>,
    },
    /// List intervals a crawler has no stored records for
    Gaps {
        #[arg(short, long)]
        name: String,

        #[arg(short, long, default_value_t = 3)]
        days: u32,
    },
    /// Start the scheduler and run until interrupted
    Serve,
}

struct App {
    orchestrator: Arc<CrawlOrchestrator>,
    store: Arc<SqliteStore>,
    metrics: MetricsCollector,
}

async fn build(cli: &Cli, settings: &Settings) -> anyhow::Result<App> {
    log::info!("Loading config from {:?}", cli.config);
    let config = ConfigLoader::load(&cli.config)?;

    let mut schemas = SchemaRegistry::builtin();
    for table in &config.tables {
        schemas.register(table.clone())?;
    }
    let schemas = Arc::new(schemas);

    let store = Arc::new(SqliteStore::connect(&settings.database_url).await?);
    let registry = Arc::new(CrawlerRegistry::initialize(&config, &schemas, store.as_ref()).await?);
    let fetcher = Arc::new(HttpFetcher::new(settings.http_timeout(), &settings.user_agent)?);
    let metrics = MetricsCollector::new();

    let orchestrator = CrawlOrchestrator::new(
        registry,
        store.clone(),
        store.clone(),
        fetcher,
        schemas,
        Some(metrics.clone()),
    )
    .with_watermark_version(settings.watermark_version)
    .with_history(store.clone());

    Ok(App {
        orchestrator: Arc::new(orchestrator),
        store,
        metrics,
    })
}

fn init_logging(multi: Option<&indicatif::MultiProgress>) {
    let logger = env_logger::Builder::from_default_env().build();
    let level = logger.filter();

    let installed = match multi {
        Some(multi) => indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
            .try_init()
            .is_ok(),
        None => log::set_boxed_logger(Box::new(logger)).is_ok(),
    };
    if installed {
        log::set_max_level(level);
    }
}

fn spinner(multi: &indicatif::MultiProgress, orchestrator: &CrawlOrchestrator) -> anyhow::Result<(ProgressBar, tokio::task::JoinHandle<()>)> {
    let pb = multi.add(ProgressBar::new_spinner());
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));

    let mut states = WatchStream::new(orchestrator.watch_state());
    let pb_clone = pb.clone();
    let task = tokio::spawn(async move {
        while let Some(status) = states.next().await {
            if status.state != RunState::Idle {
                pb_clone.set_message(format!("{} {:?}", status.crawler, status.state));
            }
        }
    });
    Ok((pb, task))
}

fn print_report(report: &CrawlReport) {
    match &report.result {
        Some(result) => {
            println!("   {}:", report.crawler);
            println!("      Records: {}", result.total_records);
            println!("      Inserted: {}", result.inserted_records);
            println!("      Errors: {}", result.errors);
            if let Some(detail) = &result.error_detail {
                println!("      First error: {}", detail);
            }
        }
        None => println!("   {}: nothing to do", report.crawler),
    }
    match report.watermark.server_latest {
        Some(latest) if report.advanced => println!("      Watermark: {} (advanced)", latest),
        Some(latest) => println!("      Watermark: {}", latest),
        None => println!("      Watermark: none"),
    }
}

fn print_batch(batch: &BatchReport) {
    for report in &batch.reports {
        print_report(report);
    }
    for name in &batch.failed {
        println!("   {}: failed", name);
    }
}

fn print_summary(metrics: &MetricsCollector) {
    let snapshot = metrics.snapshot();
    println!("\n✅ Crawl Completed:");
    println!(
        "   Runs: {} completed, {} aborted, {} with nothing to do",
        snapshot.runs_completed, snapshot.runs_aborted, snapshot.runs_empty
    );
    println!("   Files Fetched: {} ({} bytes)", snapshot.files_fetched, snapshot.bytes_fetched);
    println!("   Files Dropped: {}", snapshot.files_failed);
    println!(
        "   Records: {} total, {} inserted, {} errors",
        snapshot.records_total, snapshot.records_inserted, snapshot.record_errors
    );
    println!("   Average Fetch: {}ms", snapshot.avg_fetch_time_ms);
    println!("   Total Time: {:.1}s", snapshot.elapsed_seconds);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "info"); }
    }
    let cli = Cli::parse();
    let multi = indicatif::MultiProgress::new();

    let progress = matches!(
        cli.command,
        Commands::Run { progress: true, .. }
            | Commands::RunAll { progress: true, .. }
            | Commands::RunSchedule { progress: true, .. }
    );
    init_logging(progress.then_some(&multi));

    if let Commands::Check = cli.command {
        match ConfigLoader::load(&cli.config) {
            Ok(cfg) => {
                println!("✅ Config is valid:");
                println!("   Crawlers: {}", cfg.crawlers.len());
                for crawler in &cfg.crawlers {
                    println!("      {} ({:?})", crawler.name, crawler.processor);
                }
                println!("   Extra tables: {}", cfg.tables.len());
            }
            Err(e) => {
                eprintln!("❌ Config error: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let settings = Settings::load(cli.settings.as_deref())?;
    let app = build(&cli, &settings).await?;

    let watcher = if progress {
        Some(spinner(&multi, &app.orchestrator)?)
    } else {
        None
    };

    match &cli.command {
        Commands::Run {
            name,
            ignore_watermark,
            ..
        } => {
            let options = RunOptions {
                ignore_watermark: *ignore_watermark,
            };
            let report = app.orchestrator.run_crawl(name, options).await;
            finish(watcher);
            let report = report?;
            print_summary(&app.metrics);
            print_report(&report);
        }
        Commands::RunAll {
            ignore_watermark, ..
        } => {
            let options = RunOptions {
                ignore_watermark: *ignore_watermark,
            };
            let batch = app.orchestrator.run_all(options).await;
            finish(watcher);
            let batch = batch?;
            print_summary(&app.metrics);
            print_batch(&batch);
        }
        Commands::RunSchedule { schedule, .. } => {
            let batch = app
                .orchestrator
                .run_by_schedule(*schedule, RunOptions::default())
                .await;
            finish(watcher);
            let batch = batch?;
            print_summary(&app.metrics);
            print_batch(&batch);
        }
        Commands::Urls { urls, timezone } => {
            let timezone = timezone
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid timezone {}: {}", timezone, e))?;
            match app.orchestrator.run_urls(urls, SourceFormat::Mms, timezone).await? {
                Some(result) => println!(
                    "✅ Inserted {} of {} records ({} errors)",
                    result.inserted_records, result.total_records, result.errors
                ),
                None => println!("Nothing to do"),
            }
        }
        Commands::List => {
            for definition in app.orchestrator.registry().definitions().await {
                let schedule = definition
                    .schedule
                    .map_or("-".to_string(), |s| s.to_string());
                let latest = definition
                    .watermark
                    .server_latest
                    .map_or("never".to_string(), |t| t.to_rfc3339());
                println!(
                    "{:<40} {:<16} {:<18} {}{}",
                    definition.name,
                    schedule,
                    format!("{:?}", definition.mode),
                    latest,
                    if definition.active { "" } else { " (inactive)" }
                );
            }
        }
        Commands::Flush { name, days } => {
            let removed = app.store.flush(name.as_deref()).await?;
            let history = app.store.flush_history(name.as_deref(), *days).await?;
            println!(
                "✅ Removed {} stored watermarks and {} history intervals",
                removed, history
            );
        }
        Commands::Gaps { name, days } => {
            let missing = app
                .store
                .missing_intervals(name, chrono::Utc::now(), *days)
                .await?;
            println!("{} intervals missing for {} in the last {} days", missing.len(), name, days);
            for interval in missing {
                println!("   {}", interval.to_rfc3339());
            }
        }
        Commands::Serve => {
            let scheduler = Scheduler::for_crawlers(app.orchestrator.clone(), app.metrics.clone()).await?;
            let mut sched = scheduler.start().await?;
            log::info!("Scheduler running with tasks: {:?}", scheduler.task_names());

            tokio::signal::ctrl_c().await?;
            log::info!("Shutting down");
            sched
                .shutdown()
                .await
                .map_err(|e| anyhow::anyhow!("scheduler shutdown failed: {}", e))?;
            print_summary(&app.metrics);
        }
        Commands::Check => unreachable!(),
    }

    app.store.close().await;
    Ok(())
}

fn finish(watcher: Option<(ProgressBar, tokio::task::JoinHandle<()>)>) {
    if let Some((pb, task)) = watcher {
        task.abort();
        pb.finish_and_clear();
    }
}
