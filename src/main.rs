//! YoScout - multi-source research pipeline
//!
//! A CLI tool that discovers creator profiles across several data
//! providers, cross-checks them with an independent source and a local
//! Ollama model, and writes a confidence-graded report.
//!
//! Exit codes:
//!   0 - Success (or partial success without --fail-on-partial)
//!   1 - Runtime or configuration error, or a failed run
//!   2 - Partial success with --fail-on-partial

mod analysis;
mod cli;
mod config;
mod error;
mod gateway;
mod llm;
mod models;
mod pipeline;
mod report;

use anyhow::{Context, Result};
use cli::Args;
use config::{Config, PipelineConfig, DEFAULT_CONFIG_FILE};
use models::{Confidence, Query};
use pipeline::{Orchestrator, RunOutcome, RunStatus};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    // Provider credentials may come from a .env file
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!("Failed to load .env file: {}", e);
        }
    }

    info!("YoScout v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run_research(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Research run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .yoscout.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Enable sources and set their endpoints before the first run.");
    Ok(())
}

/// Initialize logging based on verbosity settings, or RUST_LOG when set.
fn init_logging(args: &Args) {
    let result = if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(args.log_level())
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };

    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run the complete research workflow. Returns the exit code.
async fn run_research(args: Args) -> Result<i32> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    let mut pipeline_config =
        PipelineConfig::from_config(&config).context("Invalid configuration")?;
    pipeline_config.show_progress = !args.quiet;

    let query = build_query(&args);
    let orchestrator =
        Orchestrator::from_config(&pipeline_config).context("Failed to set up the pipeline")?;

    if args.dry_run {
        return Ok(handle_dry_run(&orchestrator, &pipeline_config, &query));
    }

    println!("🔎 Researching: {}", query.describe());
    println!("   Sources: {}", join_kinds(&pipeline_config));
    match pipeline_config.model {
        Some(ref model) => println!("   Model: {} ({})", model.model_name, model.ollama_url),
        None => println!("   Model: disabled"),
    }
    println!("   Run timeout: {}s\n", pipeline_config.run_timeout.as_secs());

    let outcome = orchestrator.run(query).await?;
    print_summary(&outcome, &pipeline_config);

    Ok(exit_code(outcome.status, args.fail_on_partial))
}

fn build_query(args: &Args) -> Query {
    let mut query = Query::new(args.topic().trim());
    if let Some(ref niche) = args.niche {
        query = query.with_niche(niche.trim());
    }
    if let Some(ref region) = args.region {
        query = query.with_region(region.trim());
    }
    if let Some(ref platforms) = args.platforms {
        query = query.with_platforms(platforms.iter().copied());
    }
    query
}

/// Handle --dry-run: print the planned discovery calls and exit.
fn handle_dry_run(orchestrator: &Orchestrator, config: &PipelineConfig, query: &Query) -> i32 {
    println!("\n🔍 Dry run: configuration is valid (no provider or model calls)\n");
    println!("   Query: {}", query.describe());
    println!("   Sources: {}", join_kinds(config));

    let planned = orchestrator.planned_calls(query);
    println!("\n   {} discovery calls would be made:\n", planned.len());
    for (kind, params) in &planned {
        println!("     📡 {} {}", kind, params.describe());
    }

    let verify = if !config.lookup {
        "lookups disabled".to_string()
    } else {
        match config.lookup_source {
            Some(kind) => format!("lookups via {}", kind),
            None => "lookups via default source".to_string(),
        }
    };
    let check = if config.model.is_some() {
        "plausibility check enabled"
    } else {
        "plausibility check disabled"
    };
    println!("\n   Verification: {}, {}", verify, check);

    println!("\n✅ Dry run complete. No requests were made.");
    0
}

fn join_kinds(config: &PipelineConfig) -> String {
    config
        .source_kinds()
        .iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_summary(outcome: &RunOutcome, config: &PipelineConfig) {
    let summary = analysis::RecordSummary::from_records(outcome.state.records.values());

    println!("\n📊 Research Summary:");
    println!("   Candidates: {}", summary.total);
    let tiers: Vec<String> = Confidence::TIERS
        .iter()
        .map(|tier| format!("{} {}: {}", tier.emoji(), tier, summary.count(*tier)))
        .collect();
    println!("   - {}", tiers.join(" | "));
    if summary.with_discrepancies > 0 {
        println!("   Conflicting values: {}", summary.with_discrepancies);
    }
    if !outcome.state.diagnostics.is_empty() {
        println!("   Unresolved problems: {}", outcome.state.diagnostics.len());
    }
    if let Some(ref report) = outcome.report {
        println!("   Duration: {:.1}s", report.metadata.duration_seconds);
    }

    match (&outcome.report, &config.output) {
        (Some(_), Some(output)) => println!(
            "\n{} Run {}. Report saved to: {}",
            outcome.status.emoji(),
            outcome.status,
            output.path.display()
        ),
        _ => println!(
            "\n{} Run {}. No report was written.",
            outcome.status.emoji(),
            outcome.status
        ),
    }
}

/// Map the run status to the process exit code.
fn exit_code(status: RunStatus, fail_on_partial: bool) -> i32 {
    match status {
        RunStatus::Success => 0,
        RunStatus::PartialSuccess if fail_on_partial => {
            eprintln!("\n⛔ Run only partially succeeded. Failing (exit code 2).");
            2
        }
        RunStatus::PartialSuccess => 0,
        _ => 1,
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {:#}", e);
            Ok(Config::default())
        }
    }
}
