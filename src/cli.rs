//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation. Options left unset fall back to the
//! configuration file, then to built-in defaults.

use crate::models::{Platform, SourceKind};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// YoScout - multi-source research pipeline for creator discovery
///
/// Discovers creator profiles for a topic across several data providers,
/// cross-checks them, and writes a confidence-graded Markdown/JSON report.
///
/// Examples:
///   yoscout --topic fitness --region Europe
///   yoscout --topic "vegan baking" --platforms instagram,tiktok --format json
///   yoscout --topic fitness --sources web_search --no-llm-check
///   yoscout --topic fitness --dry-run
///   yoscout --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Research topic, e.g. "fitness"
    #[arg(short, long, value_name = "TEXT", required_unless_present = "init_config")]
    pub topic: Option<String>,

    /// Narrower niche within the topic
    #[arg(short, long, value_name = "TEXT")]
    pub niche: Option<String>,

    /// Geographic region to focus on
    #[arg(short, long, value_name = "TEXT")]
    pub region: Option<String>,

    /// Platforms to search (comma-separated); all when omitted
    ///
    /// Example: --platforms instagram,tiktok,youtube
    #[arg(long, value_name = "LIST", value_delimiter = ',')]
    pub platforms: Option<Vec<Platform>>,

    /// Source kinds to enable (comma-separated); overrides the config file
    ///
    /// Example: --sources web_search,social_profile
    #[arg(long, value_name = "LIST", value_delimiter = ',')]
    pub sources: Option<Vec<SourceKind>>,

    /// Concurrent calls per source kind and work items per stage
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Maximum attempts per provider or model call
    #[arg(long, value_name = "NUM")]
    pub retry_ceiling: Option<u32>,

    /// Per-stage timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub stage_timeout: Option<u64>,

    /// Whole-run timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub run_timeout: Option<u64>,

    /// Output file path for the report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<OutputFormat>,

    /// Ollama model used for plausibility checks
    ///
    /// Can also be set via YOSCOUT_MODEL env var or .yoscout.toml config.
    #[arg(short, long, env = "YOSCOUT_MODEL")]
    pub model: Option<String>,

    /// Ollama API endpoint URL
    #[arg(long, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Temperature for model responses (0.0 - 1.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Skip the model plausibility check during verification
    #[arg(long)]
    pub no_llm_check: bool,

    /// Skip independent profile lookups during verification
    #[arg(long)]
    pub no_lookup: bool,

    /// Path to configuration file
    ///
    /// If not specified, looks for .yoscout.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Dry run: validate configuration and print the planned calls
    ///
    /// No provider or model is contacted.
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .yoscout.toml configuration file
    #[arg(long)]
    pub init_config: bool,

    /// Exit with code 2 when the run only partially succeeds
    ///
    /// Useful for CI pipelines that need every source to answer.
    #[arg(long)]
    pub fail_on_partial: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The research topic, empty if unset (validate first).
    pub fn topic(&self) -> &str {
        self.topic.as_deref().unwrap_or("")
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.topic().trim().is_empty() {
            return Err("Topic must not be empty".to_string());
        }

        // Validate Ollama URL format (not needed for dry-run)
        if !self.dry_run {
            if let Some(ref url) = self.ollama_url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
                }
            }
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=1.0).contains(&temperature) {
                return Err("Temperature must be between 0.0 and 1.0".to_string());
            }
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.retry_ceiling == Some(0) {
            return Err("Retry ceiling must be at least 1".to_string());
        }

        if self.stage_timeout == Some(0) || self.run_timeout == Some(0) {
            return Err("Timeouts must be at least 1 second".to_string());
        }

        if let Some(ref sources) = self.sources {
            if sources.is_empty() {
                return Err("At least one source kind must be given to --sources".to_string());
            }
        }

        // Check for conflicting options
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

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args() -> Args {
        Args {
            topic: Some("fitness".to_string()),
            niche: None,
            region: Some("Europe".to_string()),
            platforms: None,
            sources: None,
            concurrency: None,
            retry_ceiling: None,
            stage_timeout: None,
            run_timeout: None,
            output: None,
            format: None,
            model: None,
            ollama_url: None,
            temperature: None,
            no_llm_check: false,
            no_lookup: false,
            config: None,
            verbose: false,
            quiet: false,
            dry_run: false,
            init_config: false,
            fail_on_partial: false,
        }
    }

    #[test]
    fn test_parse_lists() {
        let args = Args::try_parse_from([
            "yoscout",
            "--topic",
            "fitness",
            "--platforms",
            "instagram,tiktok",
            "--sources",
            "web_search,social",
            "--format",
            "json",
        ])
        .unwrap();

        assert_eq!(args.platforms, Some(vec![Platform::Instagram, Platform::TikTok]));
        assert_eq!(
            args.sources,
            Some(vec![SourceKind::WebSearch, SourceKind::SocialProfile])
        );
        assert_eq!(args.format, Some(OutputFormat::Json));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_topic_required_unless_init_config() {
        assert!(Args::try_parse_from(["yoscout"]).is_err());
        let args = Args::try_parse_from(["yoscout", "--init-config"]).unwrap();
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_empty_topic() {
        let mut args = make_args();
        args.topic = Some("   ".to_string());
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_ollama_url() {
        let mut args = make_args();
        args.ollama_url = Some("localhost:11434".to_string());
        assert!(args.validate().is_err());

        args.dry_run = true;
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_limits() {
        let mut args = make_args();
        args.concurrency = Some(0);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.retry_ceiling = Some(0);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.run_timeout = Some(0);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args();
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
