//! exchange-lens - multi-lens analysis of conversational exchanges
//!
//! Reads exchanges from a JSONL file, runs each through eight parallel
//! lenses and a gated GATEWAY lens, merges the extracted entities and
//! keeps per-conversation statistics up to date.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (input, config, analyzer setup, etc.)
//!   2 - One or more exchanges were dead-lettered

mod aggregate;
mod analyzer;
mod cli;
mod config;
mod dispatcher;
mod error;
mod merger;
mod models;
mod queue;
mod report;
mod store;
mod worker;

use analyzer::{LexicalAnalyzer, NodeAnalyzer, OllamaAnalyzer, OllamaConfig};
use anyhow::{Context, Result};
use chrono::Utc;
use cli::{AnalyzerKind, Args, OutputFormat};
use config::{Config, CONFIG_FILE_NAME};
use dispatcher::Dispatcher;
use indicatif::{ProgressBar, ProgressStyle};
use models::Exchange;
use queue::{InMemoryQueue, JobQueue};
use report::{PipelineReport, ReportMetadata};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::{
    DualStoreWriter, GraphStore, InMemoryGraphStore, InMemoryTimeSeriesStore, TimeSeriesStore,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use worker::{Orchestrator, WorkerPool};

/// How often a full queue is retried before an exchange is given up.
const ENQUEUE_ATTEMPTS: u32 = 100;
const ENQUEUE_BACKOFF: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("exchange-lens v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run_pipeline(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .exchange-lens.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to tune workers, timeouts, the ANCHOR threshold and the queue.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
///
/// `RUST_LOG` takes precedence over the CLI flags when set.
fn init_logging(args: &Args) {
    let level = args.log_level().to_string().to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run the complete pipeline. Returns the exit code (0 or 2).
async fn run_pipeline(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate()?;

    let input = args
        .input
        .clone()
        .context("--input is required unless --init-config is given")?;

    println!("📥 Reading exchanges: {}", input.display());
    let exchanges = load_exchanges(&input)?;
    info!("Loaded {} exchanges", exchanges.len());

    if args.dry_run {
        return Ok(handle_dry_run(&exchanges));
    }

    let analyzer = build_analyzer(args.analyzer, &config)?;

    println!("🤖 Starting pipeline...");
    println!("   Analyzer: {}", analyzer.name());
    if args.analyzer == AnalyzerKind::Ollama {
        println!("   Model: {}", config.model.name);
        println!("   Ollama: {}", config.model.ollama_url);
    }
    println!("   Workers: {}", config.general.workers);
    println!(
        "   ANCHOR threshold: {:.2} (policy: {:?})",
        config.pipeline.stability_threshold, config.pipeline.unstable_anchor_policy
    );

    let graph = Arc::new(InMemoryGraphStore::new());
    let series = Arc::new(InMemoryTimeSeriesStore::new());
    let writer = DualStoreWriter::new(
        graph.clone(),
        series.clone(),
        config.pipeline.aggregate_attempts,
    );
    let orchestrator = Arc::new(Orchestrator::new(
        analyzer,
        writer,
        config.pipeline.clone(),
    ));
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::from_config(&config.queue));

    let pool = WorkerPool::spawn(
        config.general.workers,
        queue.clone(),
        orchestrator.clone(),
        config.pipeline.job_timeout(),
    );

    println!("\n🔬 Analyzing {} exchanges...\n", exchanges.len());
    let progress = progress_bar(exchanges.len() as u64, args.quiet);
    let ticker = spawn_progress_ticker(queue.clone(), progress.clone());

    let submitted = dispatch_all(&Dispatcher::new(queue.clone()), exchanges).await;

    queue.close().await;
    pool.join().await;
    ticker.abort();
    if let Some(ref pb) = progress {
        pb.finish_and_clear();
    }

    println!("\n📝 Generating report...");
    let stats = orchestrator.stats().snapshot();
    let queue_stats = queue.stats().await;
    let dead_letters = queue.dead_letters().await;
    let duration = start_time.elapsed().as_secs_f64();

    let metadata = ReportMetadata {
        generated_at: Utc::now(),
        analyzer: args.analyzer.as_str().to_string(),
        input: input.display().to_string(),
        workers: config.general.workers,
        stability_threshold: config.pipeline.stability_threshold,
        exchanges_submitted: submitted,
        duration_seconds: duration,
    };
    let report = PipelineReport::build(
        metadata,
        stats,
        queue_stats,
        graph.snapshot().await?,
        series.snapshot().await?,
        dead_letters,
    );

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };
    let output_path = PathBuf::from(&config.general.output);
    report::write_report(&output, &output_path)?;

    println!("\n📊 Pipeline Summary:");
    println!("   Exchanges submitted: {}", submitted);
    println!(
        "   ✅ Processed: {} | ⏭️  Skipped: {} | ⛔ Dead-lettered: {}",
        stats.processed, stats.skipped, stats.dead_lettered
    );
    println!(
        "   Conversations: {} | Entities: {} | Relationships: {}",
        report.conversations.len(),
        report.entities.len(),
        report.relationships.len()
    );
    println!(
        "   Substituted nodes: {} | Unstable ANCHOR: {} | Commit retries: {}",
        stats.analyzer_substitutions,
        report.unstable_anchors.len(),
        stats.commit_retries
    );
    println!("   Duration: {:.1}s", duration);
    println!(
        "\n✅ Run complete! Report saved to: {}",
        output_path.display()
    );

    if stats.dead_lettered > 0 {
        eprintln!(
            "\n⛔ {} exchange(s) were dead-lettered. Failing (exit code 2).",
            stats.dead_lettered
        );
        return Ok(2);
    }

    Ok(0)
}

/// Build the analyzer selected on the command line.
fn build_analyzer(kind: AnalyzerKind, config: &Config) -> Result<Arc<dyn NodeAnalyzer>> {
    let analyzer: Arc<dyn NodeAnalyzer> = match kind {
        AnalyzerKind::Lexical => Arc::new(LexicalAnalyzer::new()),
        AnalyzerKind::Ollama => Arc::new(
            OllamaAnalyzer::new(OllamaConfig::from(&config.model))
                .context("Failed to create Ollama client")?,
        ),
    };
    Ok(analyzer)
}

/// Enqueue every exchange, backing off while the queue is full.
/// Returns how many were accepted.
async fn dispatch_all(dispatcher: &Dispatcher, exchanges: Vec<Exchange>) -> usize {
    let mut submitted = 0;

    for exchange in exchanges {
        let exchange_id = exchange.exchange_id.clone();
        let mut attempt = 1;
        loop {
            match dispatcher.enqueue(exchange.clone()).await {
                Ok(job_id) => {
                    debug!("Exchange {} queued as {}", exchange_id, job_id);
                    submitted += 1;
                    break;
                }
                Err(e) if e.is_retryable() && attempt < ENQUEUE_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(ENQUEUE_BACKOFF).await;
                }
                Err(e) => {
                    warn!("Dropping exchange {}: {}", exchange_id, e);
                    break;
                }
            }
        }
    }

    submitted
}

fn progress_bar(total: u64, quiet: bool) -> Option<ProgressBar> {
    if quiet {
        return None;
    }

    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    Some(pb)
}

/// Mirror finished jobs (acked or dead-lettered) onto the progress bar.
fn spawn_progress_ticker(
    queue: Arc<dyn JobQueue>,
    progress: Option<ProgressBar>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(pb) = progress else {
            return;
        };
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            interval.tick().await;
            let stats = queue.stats().await;
            pb.set_position(stats.acked + stats.dead_lettered as u64);
        }
    })
}

/// Handle --dry-run: report what would be analyzed, exit.
fn handle_dry_run(exchanges: &[Exchange]) -> i32 {
    println!("\n🔍 Dry run: input parsed, no analysis performed.\n");

    let conversations: BTreeSet<&str> = exchanges
        .iter()
        .map(|e| e.conversation_id.as_str())
        .collect();
    let unique: BTreeSet<&str> = exchanges.iter().map(|e| e.exchange_id.as_str()).collect();

    println!("   Exchanges: {}", exchanges.len());
    println!("   Distinct exchange ids: {}", unique.len());
    println!("   Conversations: {}", conversations.len());
    for conversation in conversations {
        let count = exchanges
            .iter()
            .filter(|e| e.conversation_id == conversation)
            .count();
        println!("     💬 {} ({} exchanges)", conversation, count);
    }

    println!("\n✅ Dry run complete. No analyzer calls were made.");
    0
}

/// Read exchanges from a JSONL file. Blank lines are skipped.
fn load_exchanges(path: &Path) -> Result<Vec<Exchange>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    parse_exchanges(&content).with_context(|| format!("Invalid input file: {}", path.display()))
}

fn parse_exchanges(content: &str) -> Result<Vec<Exchange>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<Exchange>(line)
                .with_context(|| format!("Line {} is not a valid exchange", i + 1))
        })
        .collect()
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE_NAME);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{"exchange_id":"x1","conversation_id":"C123","user_text":"I miss my grandmother.","assistant_text":"Tell me about her."}

{"exchange_id":"x2","conversation_id":"C123","user_text":"She lived in Paris.","assistant_text":"What do you remember?","created_at":"2024-05-01T10:00:00Z"}
"#;

    #[test]
    fn test_parse_exchanges_skips_blank_lines() {
        let exchanges = parse_exchanges(SAMPLE).unwrap();
        assert_eq!(exchanges.len(), 2);
        assert_eq!(exchanges[1].exchange_id, "x2");
        assert_eq!(exchanges[1].created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_parse_exchanges_reports_line() {
        let err = parse_exchanges("{\"exchange_id\":\"x1\"}\n").unwrap_err();
        assert!(format!("{:#}", err).contains("Line 1"));
    }

    #[test]
    fn test_load_exchanges_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let exchanges = load_exchanges(file.path()).unwrap();
        assert_eq!(exchanges.len(), 2);
    }

    #[tokio::test]
    async fn test_end_to_end_with_lexical_analyzer() {
        let exchanges = parse_exchanges(SAMPLE).unwrap();
        let config = Config::default();
        let analyzer = build_analyzer(AnalyzerKind::Lexical, &config).unwrap();

        let graph = Arc::new(InMemoryGraphStore::new());
        let series = Arc::new(InMemoryTimeSeriesStore::new());
        let writer = DualStoreWriter::new(graph.clone(), series.clone(), 8);
        let orchestrator = Arc::new(Orchestrator::new(analyzer, writer, config.pipeline.clone()));
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::from_config(&config.queue));
        let pool = WorkerPool::spawn(2, queue.clone(), orchestrator.clone(), Duration::from_secs(10));

        let submitted = dispatch_all(&Dispatcher::new(queue.clone()), exchanges).await;
        queue.close().await;
        pool.join().await;

        assert_eq!(submitted, 2);
        assert_eq!(orchestrator.stats().snapshot().processed, 2);
        let snapshot = graph.snapshot().await.unwrap();
        assert_eq!(snapshot.node_results.len(), 18);
        assert_eq!(snapshot.committed.len(), 2);

        let aggregates = series.snapshot().await.unwrap().aggregates;
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].exchange_count, 2);
    }
}
