//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.exchange-lens.toml` files.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = ".exchange-lens.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Pipeline settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default report output path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Number of concurrent worker tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            workers: default_workers(),
        }
    }
}

fn default_output() -> String {
    "exchange_lens_report.md".to_string()
}

fn default_workers() -> usize {
    4
}

/// LLM model settings for the Ollama-backed analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            timeout_seconds: default_http_timeout(),
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_http_timeout() -> u64 {
    60
}

/// What to do with GATEWAY when ANCHOR is below the stability threshold.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AnchorPolicy {
    /// Run GATEWAY and mark its output `anchor_stable = false`.
    #[default]
    Flag,
    /// Skip the GATEWAY call and record a placeholder result.
    Defer,
}

/// Orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// ANCHOR strength at or above which the exchange counts as stable.
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold: f64,

    /// Per analyzer call timeout in milliseconds.
    #[serde(default = "default_analyzer_timeout")]
    pub analyzer_timeout_ms: u64,

    /// Timeout for the whole two-phase run in milliseconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_ms: u64,

    /// Commit attempts (each retry restarts from MERGING).
    #[serde(default = "default_commit_attempts")]
    pub commit_attempts: u32,

    /// Optimistic retries for the aggregate update.
    #[serde(default = "default_aggregate_attempts")]
    pub aggregate_attempts: u32,

    /// Behaviour when ANCHOR is unstable.
    #[serde(default)]
    pub unstable_anchor_policy: AnchorPolicy,

    /// Skip analysis for exchanges that are already committed.
    #[serde(default = "default_true")]
    pub skip_committed: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stability_threshold: default_stability_threshold(),
            analyzer_timeout_ms: default_analyzer_timeout(),
            job_timeout_ms: default_job_timeout(),
            commit_attempts: default_commit_attempts(),
            aggregate_attempts: default_aggregate_attempts(),
            unstable_anchor_policy: AnchorPolicy::Flag,
            skip_committed: true,
        }
    }
}

impl PipelineConfig {
    pub fn analyzer_timeout(&self) -> Duration {
        Duration::from_millis(self.analyzer_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

fn default_stability_threshold() -> f64 {
    0.3
}

fn default_analyzer_timeout() -> u64 {
    30_000
}

fn default_job_timeout() -> u64 {
    120_000
}

fn default_commit_attempts() -> u32 {
    3
}

fn default_aggregate_attempts() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

/// Job queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pending jobs.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Deliveries before a job is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// Lease duration before an unacknowledged job becomes visible again.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_deliveries: default_max_deliveries(),
            visibility_timeout_ms: default_visibility_timeout(),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

fn default_capacity() -> usize {
    10_000
}

fn default_max_deliveries() -> u32 {
    3
}

fn default_visibility_timeout() -> u64 {
    180_000
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE_NAME);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// Only values the CLI provides explicitly are overridden.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref url) = args.ollama_url {
            self.model.ollama_url = url.clone();
        }
        if let Some(workers) = args.workers {
            self.general.workers = workers;
        }
        if let Some(threshold) = args.stability_threshold {
            self.pipeline.stability_threshold = threshold;
        }
        if let Some(policy) = args.anchor_policy {
            self.pipeline.unstable_anchor_policy = policy;
        }
        if let Some(timeout) = args.analyzer_timeout_ms {
            self.pipeline.analyzer_timeout_ms = timeout;
        }
        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }

        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.pipeline.stability_threshold) {
            bail!("stability_threshold must be between 0.0 and 1.0");
        }
        if self.pipeline.analyzer_timeout_ms == 0 || self.pipeline.job_timeout_ms == 0 {
            bail!("Timeouts must be greater than zero");
        }
        if self.pipeline.job_timeout_ms >= self.queue.visibility_timeout_ms {
            bail!("job_timeout_ms must be shorter than the queue visibility_timeout_ms");
        }
        // An ANCHOR timeout followed by a full GATEWAY call must still fit.
        if self.pipeline.analyzer_timeout_ms.saturating_mul(2) >= self.pipeline.job_timeout_ms {
            bail!("job_timeout_ms must exceed twice analyzer_timeout_ms");
        }
        if self.pipeline.commit_attempts == 0 || self.pipeline.aggregate_attempts == 0 {
            bail!("Attempt counts must be at least 1");
        }
        if self.queue.max_deliveries == 0 || self.queue.capacity == 0 {
            bail!("Queue capacity and max_deliveries must be at least 1");
        }
        if self.general.workers == 0 {
            bail!("Workers must be at least 1");
        }
        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pipeline.stability_threshold, 0.3);
        assert_eq!(config.pipeline.unstable_anchor_policy, AnchorPolicy::Flag);
        assert_eq!(config.general.workers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
workers = 8

[pipeline]
stability_threshold = 0.5
analyzer_timeout_ms = 500
unstable_anchor_policy = "defer"

[queue]
max_deliveries = 5
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.workers, 8);
        assert_eq!(config.pipeline.stability_threshold, 0.5);
        assert_eq!(config.pipeline.analyzer_timeout(), Duration::from_millis(500));
        assert_eq!(config.pipeline.unstable_anchor_policy, AnchorPolicy::Defer);
        assert_eq!(config.pipeline.commit_attempts, 3);
        assert_eq!(config.queue.max_deliveries, 5);
        assert_eq!(config.model.name, "llama3.2:latest");
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = Config::default();
        config.pipeline.stability_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_job_timeout_beyond_lease() {
        let mut config = Config::default();
        config.pipeline.job_timeout_ms = config.queue.visibility_timeout_ms;
        assert!(config.validate().is_err());

        config.queue.visibility_timeout_ms += 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_analyzer_timeout_too_close_to_job_timeout() {
        let mut config = Config::default();
        config.pipeline.analyzer_timeout_ms = 60_000;
        config.pipeline.job_timeout_ms = 120_000;
        assert!(config.validate().is_err());

        config.pipeline.analyzer_timeout_ms = 59_999;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let mut config: Config = toml::from_str("[general]\nworkers = 2\n").unwrap();
        let mut args = crate::cli::tests::make_args();
        args.workers = Some(6);
        args.anchor_policy = Some(AnchorPolicy::Defer);
        args.stability_threshold = Some(0.45);

        config.merge_with_args(&args);
        assert_eq!(config.general.workers, 6);
        assert_eq!(config.pipeline.unstable_anchor_policy, AnchorPolicy::Defer);
        assert_eq!(config.pipeline.stability_threshold, 0.45);
        assert_eq!(config.model.name, "llama3.2:latest");
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[pipeline]"));
        assert!(toml_str.contains("[queue]"));
        let reparsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(reparsed.queue.capacity, 10_000);
    }
}
