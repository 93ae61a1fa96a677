//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::config::AnchorPolicy;
use clap::Parser;
use std::path::PathBuf;

/// exchange-lens - multi-lens analysis of conversational exchanges
///
/// Reads exchanges (one JSON object per line), runs them through nine
/// analytical lenses, merges the extracted entities and keeps running
/// per-conversation statistics. Markdown/JSON reports.
///
/// Examples:
///   exchange-lens --input exchanges.jsonl
///   exchange-lens --input exchanges.jsonl --analyzer ollama --model llama3.2:latest
///   exchange-lens --input exchanges.jsonl --workers 8 --format json -o report.json
///   exchange-lens --input exchanges.jsonl --dry-run
///   exchange-lens --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// JSONL file of exchanges to analyze
    ///
    /// Each line holds exchange_id, conversation_id, user_text and
    /// assistant_text. Not required with --init-config.
    #[arg(short, long, value_name = "FILE", required_unless_present = "init_config")]
    pub input: Option<PathBuf>,

    /// Analyzer backend for the nine lenses
    #[arg(short, long, default_value = "lexical", value_name = "KIND")]
    pub analyzer: AnalyzerKind,

    /// Ollama model used by the ollama analyzer
    ///
    /// Can also be set via EXCHANGE_LENS_MODEL or .exchange-lens.toml.
    #[arg(short, long, env = "EXCHANGE_LENS_MODEL")]
    pub model: Option<String>,

    /// Ollama API endpoint URL
    #[arg(long, env = "OLLAMA_URL", value_name = "URL")]
    pub ollama_url: Option<String>,

    /// Number of concurrent workers
    #[arg(short, long, value_name = "NUM")]
    pub workers: Option<usize>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .exchange-lens.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output file path for the report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Minimum ANCHOR strength for a stable reference frame (0.0 - 1.0)
    #[arg(long, value_name = "VALUE")]
    pub stability_threshold: Option<f64>,

    /// What GATEWAY does when ANCHOR is unstable (flag, defer)
    #[arg(long, value_name = "POLICY")]
    pub anchor_policy: Option<AnchorPolicy>,

    /// Per-analyzer-call timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub analyzer_timeout_ms: Option<u64>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Dry run: parse and validate the input without analyzing it
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .exchange-lens.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

/// Which analyzer backs the lenses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AnalyzerKind {
    /// Deterministic keyword analyzer, no network
    #[default]
    Lexical,
    /// LLM-backed analyzer via the Ollama chat API
    Ollama,
}

impl AnalyzerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyzerKind::Lexical => "lexical",
            AnalyzerKind::Ollama => "ollama",
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if let Some(ref input) = self.input {
            if !input.is_file() {
                return Err(format!("Input file does not exist: {}", input.display()));
            }
        }

        if let Some(ref url) = self.ollama_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if let Some(threshold) = self.stability_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err("Stability threshold must be between 0.0 and 1.0".to_string());
            }
        }

        if self.workers == Some(0) {
            return Err("Workers must be at least 1".to_string());
        }

        if self.analyzer_timeout_ms == Some(0) {
            return Err("Analyzer timeout must be at least 1ms".to_string());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
