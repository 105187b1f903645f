//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.yoscout.toml` files, and turns the merged result into a validated
//! [`PipelineConfig`].

use crate::cli::{Args, OutputFormat};
use crate::error::ConfigError;
use crate::llm::OllamaConfig;
use crate::models::SourceKind;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::RunSettings;
use crate::report::ReportOutput;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".yoscout.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Capability model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Concurrency, retry and timeout settings.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Verification settings.
    #[serde(default)]
    pub verify: VerifyConfig,

    /// Source providers, keyed by source kind (e.g. `web_search`).
    #[serde(default = "default_sources")]
    pub sources: BTreeMap<String, SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            model: ModelConfig::default(),
            pipeline: PipelineSection::default(),
            verify: VerifyConfig::default(),
            sources: default_sources(),
        }
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Default report format.
    #[serde(default)]
    pub format: OutputFormat,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            format: OutputFormat::default(),
            verbose: false,
        }
    }
}

fn default_output() -> String {
    "yoscout_report.md".to_string()
}

/// Capability model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Run the plausibility check during verification.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_model_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            timeout_seconds: default_model_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
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

fn default_model_timeout() -> u64 {
    120
}

/// Concurrency, retry and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Concurrent calls per source kind, unless the source overrides it.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum attempts per provider or model call.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Extra attempts for a stage that failed transiently.
    #[serde(default = "default_stage_retries")]
    pub stage_retries: u32,

    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_seconds: u64,

    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// HTTP timeout for a single provider request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Profiles requested per discovery call.
    #[serde(default = "default_discovery_limit")]
    pub discovery_limit: usize,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Upper bound for all backoff waits of one call. When unset, the
    /// budget is derived so that every call can use its full retry ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_wait_seconds: Option<u64>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry_ceiling: default_retry_ceiling(),
            stage_retries: default_stage_retries(),
            stage_timeout_seconds: default_stage_timeout(),
            run_timeout_seconds: default_run_timeout(),
            request_timeout_seconds: default_request_timeout(),
            discovery_limit: default_discovery_limit(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_total_wait_seconds: None,
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_retry_ceiling() -> u32 {
    3
}

fn default_stage_retries() -> u32 {
    1
}

fn default_stage_timeout() -> u64 {
    300
}

fn default_run_timeout() -> u64 {
    900
}

fn default_request_timeout() -> u64 {
    30
}

fn default_discovery_limit() -> usize {
    25
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

/// Verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Look candidates up again through an independent source.
    #[serde(default = "default_true")]
    pub lookup: bool,

    /// Source used for lookups; defaults to `social_profile` when enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_source: Option<SourceKind>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            lookup: true,
            lookup_source: None,
        }
    }
}

/// One source provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL of the provider's HTTP API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Environment variable holding the API key. No credential is sent
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Per-kind concurrency override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

impl SourceConfig {
    /// Template entry for `kind`, credential read from `YOSCOUT_<KIND>_API_KEY`.
    pub fn for_kind(kind: SourceKind, enabled: bool) -> Self {
        Self {
            enabled,
            endpoint: None,
            api_key_env: Some(format!("YOSCOUT_{}_API_KEY", kind.as_str().to_uppercase())),
            concurrency: None,
        }
    }
}

fn default_sources() -> BTreeMap<String, SourceConfig> {
    SourceKind::ALL
        .iter()
        .map(|kind| (kind.as_str().to_string(), SourceConfig::for_kind(*kind, false)))
        .collect()
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
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &Args) {
        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }
        if let Some(format) = args.format {
            self.general.format = format;
        }
        if args.verbose {
            self.general.verbose = true;
        }

        if let Some(ref name) = args.model {
            self.model.name = name.clone();
        }
        if let Some(ref url) = args.ollama_url {
            self.model.ollama_url = url.clone();
        }
        if let Some(temperature) = args.temperature {
            self.model.temperature = temperature;
        }
        if args.no_llm_check {
            self.model.enabled = false;
        }

        if let Some(concurrency) = args.concurrency {
            self.pipeline.concurrency = concurrency;
        }
        if let Some(ceiling) = args.retry_ceiling {
            self.pipeline.retry_ceiling = ceiling;
        }
        if let Some(secs) = args.stage_timeout {
            self.pipeline.stage_timeout_seconds = secs;
        }
        if let Some(secs) = args.run_timeout {
            self.pipeline.run_timeout_seconds = secs;
        }

        if args.no_lookup {
            self.verify.lookup = false;
        }

        // --sources enables exactly the listed kinds
        if let Some(ref kinds) = args.sources {
            for (name, source) in self.sources.iter_mut() {
                source.enabled = name
                    .parse::<SourceKind>()
                    .map(|kind| kinds.contains(&kind))
                    .unwrap_or(false);
            }
            for kind in kinds {
                let present = self
                    .sources
                    .keys()
                    .any(|name| name.parse::<SourceKind>().ok() == Some(*kind));
                if !present {
                    self.sources
                        .insert(kind.as_str().to_string(), SourceConfig::for_kind(*kind, true));
                }
            }
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Connection settings for one enabled source kind.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub kind: SourceKind,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub concurrency: usize,
}

/// Validated settings the orchestrator is built from.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Enabled sources, in first-reporter order.
    pub sources: Vec<SourceSettings>,
    pub concurrency_limit: usize,
    pub stage_retries: u32,
    pub stage_timeout: Duration,
    pub run_timeout: Duration,
    pub request_timeout: Duration,
    pub discovery_limit: usize,
    pub call_retry: RetryPolicy,
    pub lookup: bool,
    pub lookup_source: Option<SourceKind>,
    /// `None` when the plausibility check is disabled.
    pub model: Option<OllamaConfig>,
    pub output: Option<ReportOutput>,
    pub show_progress: bool,
}

impl PipelineConfig {
    /// Validate `config`, reading credentials from the process environment.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::from_config_with(config, |var| std::env::var(var).ok())
    }

    /// Validate `config`, reading credentials through `env`.
    pub fn from_config_with<F>(config: &Config, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pipeline = &config.pipeline;
        if pipeline.concurrency == 0 {
            return Err(ConfigError::Invalid("pipeline.concurrency must be at least 1".to_string()));
        }
        if pipeline.retry_ceiling == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.retry_ceiling must be at least 1".to_string(),
            ));
        }
        if pipeline.stage_timeout_seconds == 0 || pipeline.run_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "pipeline timeouts must be at least 1 second".to_string(),
            ));
        }

        let mut by_kind: BTreeMap<SourceKind, SourceSettings> = BTreeMap::new();
        for (name, source) in &config.sources {
            let kind: SourceKind = name.parse().map_err(ConfigError::Invalid)?;
            if !source.enabled {
                continue;
            }
            if by_kind.contains_key(&kind) {
                return Err(ConfigError::Invalid(format!("source `{}` is configured twice", kind)));
            }

            let endpoint = source
                .endpoint
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .ok_or(ConfigError::MissingEndpoint { source_kind: kind })?;
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "endpoint of source `{}` must start with 'http://' or 'https://'",
                    kind
                )));
            }

            let api_key = match source.api_key_env {
                Some(ref var) => {
                    let key = env(var)
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .ok_or_else(|| ConfigError::MissingCredential {
                            source_kind: kind,
                            var: var.clone(),
                        })?;
                    Some(key)
                }
                None => None,
            };

            by_kind.insert(
                kind,
                SourceSettings {
                    kind,
                    endpoint: endpoint.to_string(),
                    api_key,
                    concurrency: source.concurrency.unwrap_or(pipeline.concurrency).max(1),
                },
            );
        }

        if by_kind.is_empty() {
            return Err(ConfigError::NoSourcesEnabled);
        }

        if let Some(kind) = config.verify.lookup_source {
            if !by_kind.contains_key(&kind) {
                return Err(ConfigError::Invalid(format!(
                    "lookup source `{}` is not enabled",
                    kind
                )));
            }
        }

        let model = if config.model.enabled {
            let url = config.model.ollama_url.trim();
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid(
                    "Ollama URL must start with 'http://' or 'https://'".to_string(),
                ));
            }
            Some(OllamaConfig {
                ollama_url: url.to_string(),
                model_name: config.model.name.clone(),
                temperature: config.model.temperature,
                timeout_seconds: config.model.timeout_seconds,
            })
        } else {
            None
        };

        let mut call_retry = RetryPolicy {
            max_attempts: pipeline.retry_ceiling,
            base_delay: Duration::from_millis(pipeline.base_delay_ms),
            max_delay: Duration::from_millis(pipeline.max_delay_ms),
            ..RetryPolicy::default()
        };
        call_retry.max_total_wait = match pipeline.max_total_wait_seconds {
            None => call_retry.full_budget(),
            Some(secs) => {
                let budget = Duration::from_secs(secs);
                let needed = call_retry.schedule_wait();
                if budget < needed {
                    return Err(ConfigError::Invalid(format!(
                        "pipeline.max_total_wait_seconds = {} cannot fit {} attempts; \
                         the backoff schedule needs {:.1}s",
                        secs,
                        pipeline.retry_ceiling,
                        needed.as_secs_f64()
                    )));
                }
                budget
            }
        };

        Ok(Self {
            sources: by_kind.into_values().collect(),
            concurrency_limit: pipeline.concurrency,
            stage_retries: pipeline.stage_retries,
            stage_timeout: Duration::from_secs(pipeline.stage_timeout_seconds),
            run_timeout: Duration::from_secs(pipeline.run_timeout_seconds),
            request_timeout: Duration::from_secs(pipeline.request_timeout_seconds.max(1)),
            discovery_limit: pipeline.discovery_limit.max(1),
            call_retry,
            lookup: config.verify.lookup,
            lookup_source: config.verify.lookup_source,
            model,
            output: Some(ReportOutput {
                path: PathBuf::from(&config.general.output),
                format: config.general.format,
            }),
            show_progress: false,
        })
    }

    /// Enabled source kinds, in first-reporter order.
    pub fn source_kinds(&self) -> Vec<SourceKind> {
        self.sources.iter().map(|s| s.kind).collect()
    }

    /// Settings handed to the orchestrator.
    pub fn run_settings(&self) -> RunSettings {
        let defaults = RunSettings::default();
        let mut stage_retry = RetryPolicy {
            max_attempts: self.stage_retries + 1,
            ..defaults.stage_retry
        };
        stage_retry.max_total_wait = stage_retry.schedule_wait();
        RunSettings {
            concurrency: self.concurrency_limit,
            call_retry: self.call_retry.clone(),
            stage_retry,
            stage_timeout: self.stage_timeout,
            run_timeout: self.run_timeout,
            discovery_limit: self.discovery_limit,
            lookup: self.lookup,
            lookup_source: self.lookup_source,
            output: self.output.clone(),
            show_progress: self.show_progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::pipeline::retry::{with_retry, Retried};
    use clap::Parser;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn env_with(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    const TWO_SOURCES: &str = r#"
[general]
output = "custom_report.json"
format = "json"

[pipeline]
concurrency = 2
retry_ceiling = 5

[sources.web_search]
endpoint = "https://search.example.com/v1"
api_key_env = "SEARCH_KEY"
concurrency = 8

[sources.social_profile]
endpoint = "https://social.example.com"
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.model.name, "llama3.2:latest");
        assert_eq!(config.pipeline.retry_ceiling, 3);
        assert_eq!(config.sources.len(), 3);
        assert!(config.sources.values().all(|s| !s.enabled));
    }

    #[test]
    fn test_parse_config() {
        let config: Config = toml::from_str(TWO_SOURCES).unwrap();
        assert_eq!(config.general.output, "custom_report.json");
        assert_eq!(config.general.format, OutputFormat::Json);
        assert_eq!(config.pipeline.concurrency, 2);
        assert_eq!(config.pipeline.stage_timeout_seconds, 300);
        assert_eq!(config.sources.len(), 2);
        assert!(config.sources["social_profile"].enabled);
        assert!(config.model.enabled);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[pipeline]"));
        assert!(toml_str.contains("[sources.web_search]"));
        assert!(toml_str.contains("YOSCOUT_SOCIAL_PROFILE_API_KEY"));

        let reparsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(reparsed.sources.len(), 3);
    }

    #[test]
    fn test_pipeline_config_resolves_sources() {
        let config: Config = toml::from_str(TWO_SOURCES).unwrap();
        let env = env_with(&[("SEARCH_KEY", "abc")]);
        let pipeline = assert_ok!(PipelineConfig::from_config_with(&config, env));

        assert_eq!(
            pipeline.source_kinds(),
            vec![SourceKind::WebSearch, SourceKind::SocialProfile]
        );
        assert_eq!(pipeline.sources[0].api_key.as_deref(), Some("abc"));
        assert_eq!(pipeline.sources[0].concurrency, 8);
        assert_eq!(pipeline.sources[1].concurrency, 2);
        assert_eq!(pipeline.sources[1].api_key, None);
        assert_eq!(pipeline.call_retry.max_attempts, 5);

        let settings = pipeline.run_settings();
        assert_eq!(settings.stage_retry.max_attempts, 2);
        assert_eq!(settings.stage_retry.max_total_wait, Duration::from_secs(1));
        assert_eq!(
            settings.output.map(|o| o.format),
            Some(OutputFormat::Json)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_derived_wait_budget_keeps_retry_ceiling() {
        let mut config: Config = toml::from_str(TWO_SOURCES).unwrap();
        config.pipeline.retry_ceiling = 8;
        let pipeline =
            PipelineConfig::from_config_with(&config, env_with(&[("SEARCH_KEY", "abc")])).unwrap();
        let calls = AtomicU32::new(0);

        let outcome: Retried<(), SourceError> =
            with_retry(&pipeline.call_retry, "rate limited", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SourceError::RateLimited {
                        retry_after: Some(Duration::from_secs(60)),
                    })
                }
            })
            .await;

        assert_eq!(outcome.attempts, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_explicit_wait_budget_must_fit_ceiling() {
        let mut config: Config = toml::from_str(TWO_SOURCES).unwrap();
        config.pipeline.retry_ceiling = 8;
        config.pipeline.max_total_wait_seconds = Some(30);
        let env = env_with(&[("SEARCH_KEY", "abc")]);
        assert!(matches!(
            PipelineConfig::from_config_with(&config, &env),
            Err(ConfigError::Invalid(_))
        ));

        config.pipeline.max_total_wait_seconds = Some(40);
        let pipeline = assert_ok!(PipelineConfig::from_config_with(&config, &env));
        assert_eq!(pipeline.call_retry.max_total_wait, Duration::from_secs(40));
    }

    #[test]
    fn test_missing_credential_fails_eagerly() {
        let config: Config = toml::from_str(TWO_SOURCES).unwrap();
        let err = assert_err!(PipelineConfig::from_config_with(&config, env_with(&[])));
        assert_eq!(
            err,
            ConfigError::MissingCredential {
                source_kind: SourceKind::WebSearch,
                var: "SEARCH_KEY".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_endpoint_and_no_sources() {
        let config = Config::default();
        assert_eq!(
            PipelineConfig::from_config_with(&config, env_with(&[])).unwrap_err(),
            ConfigError::NoSourcesEnabled
        );

        let mut config = Config::default();
        config.sources.insert(
            "scraping_proxy".to_string(),
            SourceConfig {
                enabled: true,
                endpoint: None,
                api_key_env: None,
                concurrency: None,
            },
        );
        assert_eq!(
            PipelineConfig::from_config_with(&config, env_with(&[])).unwrap_err(),
            ConfigError::MissingEndpoint {
                source_kind: SourceKind::ScrapingProxy
            }
        );
    }

    #[test]
    fn test_unknown_source_and_disabled_lookup_source() {
        let config: Config = toml::from_str(
            r#"
[sources.carrier_pigeon]
endpoint = "https://example.com"
"#,
        )
        .unwrap();
        assert!(matches!(
            PipelineConfig::from_config_with(&config, env_with(&[])),
            Err(ConfigError::Invalid(_))
        ));

        let mut config: Config = toml::from_str(TWO_SOURCES).unwrap();
        config.verify.lookup_source = Some(SourceKind::ScrapingProxy);
        assert!(matches!(
            PipelineConfig::from_config_with(&config, env_with(&[("SEARCH_KEY", "abc")])),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_merge_with_args() {
        let mut config: Config = toml::from_str(TWO_SOURCES).unwrap();
        let args = Args::try_parse_from([
            "yoscout",
            "--topic",
            "fitness",
            "--sources",
            "social_profile,scraping_proxy",
            "--retry-ceiling",
            "2",
            "--no-llm-check",
            "--output",
            "out.md",
            "--format",
            "markdown",
        ])
        .unwrap();

        config.merge_with_args(&args);

        assert!(!config.sources["web_search"].enabled);
        assert!(config.sources["social_profile"].enabled);
        assert!(config.sources["scraping_proxy"].enabled);
        assert_eq!(config.pipeline.retry_ceiling, 2);
        assert_eq!(config.pipeline.concurrency, 2);
        assert!(!config.model.enabled);
        assert_eq!(config.general.output, "out.md");
        assert_eq!(config.general.format, OutputFormat::Markdown);
    }
}
