//! Pipeline orchestrator.
//!
//! Runs Research, Verify and Report in order against a single
//! [`PipelineState`], applies each stage's result, escalates stage
//! failures and decides the terminal run status.

use crate::config::PipelineConfig;
use crate::error::{Classify, ConfigError, ErrorClass, PipelineError, StageError};
use crate::gateway::{Gateway, HttpSourceProvider, SourceParams};
use crate::llm::{CapabilityModel, OllamaModel};
use crate::models::{Query, SourceKind};
use crate::pipeline::research::{ResearchStage, DEFAULT_DISCOVERY_LIMIT};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::stage::{Stage, StageContext, StageResult};
use crate::pipeline::state::{
    Diagnostic, PipelineState, RunStatus, StageEventKind, StageName, StageOutcome, StageState,
    Subject,
};
use crate::pipeline::verify::VerifyStage;
use crate::report::{Report, ReportOutput, ReportStage};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How far past its deadline a stage may run before it is abandoned.
const HARD_TIMEOUT_GRACE: Duration = Duration::from_secs(2);

/// Run-wide settings handed to the orchestrator at construction.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Work items in flight within one stage.
    pub concurrency: usize,
    /// Policy for individual gateway and model calls.
    pub call_retry: RetryPolicy,
    /// Policy for re-running a stage after a transient stage failure.
    pub stage_retry: RetryPolicy,
    pub stage_timeout: Duration,
    pub run_timeout: Duration,
    pub discovery_limit: usize,
    /// Whether verification performs profile lookups at all.
    pub lookup: bool,
    /// Lookup source override; `None` picks the default.
    pub lookup_source: Option<SourceKind>,
    pub output: Option<ReportOutput>,
    pub show_progress: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            call_retry: RetryPolicy::default(),
            stage_retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_secs(1),
                ..RetryPolicy::default()
            },
            stage_timeout: Duration::from_secs(300),
            run_timeout: Duration::from_secs(900),
            discovery_limit: DEFAULT_DISCOVERY_LIMIT,
            lookup: true,
            lookup_source: None,
            output: None,
            show_progress: false,
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// Present unless the report stage failed.
    pub report: Option<Report>,
    pub status: RunStatus,
    pub state: PipelineState,
}

/// One stage's final outcome and, when it produced one, its result.
struct StageRun {
    outcome: StageOutcome,
    result: Option<StageResult>,
}

pub struct Orchestrator {
    gateway: Gateway,
    model: Option<Arc<dyn CapabilityModel>>,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(gateway: Gateway, settings: RunSettings) -> Self {
        Self {
            gateway,
            model: None,
            settings,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn CapabilityModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Build HTTP providers and the Ollama model from a validated config.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let mut builder = Gateway::builder();
        for source in &config.sources {
            let provider = HttpSourceProvider::new(
                source.kind,
                source.endpoint.clone(),
                source.api_key.clone(),
                config.request_timeout,
            )
            .map_err(|e| ConfigError::Invalid(format!("source `{}`: {}", source.kind, e)))?;
            builder = builder.source(source.kind, Arc::new(provider), source.concurrency);
        }

        let mut orchestrator = Self::new(builder.build(), config.run_settings());

        if let Some(ref model_config) = config.model {
            let model = OllamaModel::new(model_config.clone())
                .map_err(|e| ConfigError::Invalid(format!("capability model: {}", e)))?;
            orchestrator = orchestrator.with_model(Arc::new(model));
        }

        Ok(orchestrator)
    }

    /// Run the full pipeline for `query`.
    pub async fn run(&self, query: Query) -> Result<RunOutcome, PipelineError> {
        let model_name = self.model.as_ref().map(|m| m.name().to_string());
        let mut state = PipelineState::new(query, self.gateway.source_kinds(), model_name);
        state.transition(RunStatus::Running)?;

        let run_deadline = Instant::now() + self.settings.run_timeout;
        info!(
            query = %state.query.describe(),
            sources = state.sources.len(),
            run_timeout_s = self.settings.run_timeout.as_secs(),
            "Pipeline started"
        );

        let research =
            ResearchStage::new(self.gateway.clone()).with_limit(self.settings.discovery_limit);
        let research_run = self.execute(&research, &mut state, run_deadline).await;

        if research_run.outcome == StageOutcome::Failed {
            warn!("Research produced nothing, skipping verification");
        } else {
            let verify = self.verify_stage();
            self.execute(&verify, &mut state, run_deadline).await;
        }

        let report_stage = ReportStage::new(self.settings.output.clone());
        let report_run = self.execute(&report_stage, &mut state, run_deadline).await;

        let status = state.resolve_status(report_run.outcome);
        state.transition(status)?;
        info!(%status, candidates = state.records.len(), "Pipeline finished");

        Ok(RunOutcome {
            report: report_run.result.and_then(|r| r.report),
            status,
            state,
        })
    }

    /// Discovery calls a run for `query` would make, without making them.
    pub fn planned_calls(&self, query: &Query) -> Vec<(SourceKind, SourceParams)> {
        let state = PipelineState::new(query.clone(), self.gateway.source_kinds(), None);
        ResearchStage::new(self.gateway.clone())
            .with_limit(self.settings.discovery_limit)
            .plan(&state)
    }

    fn verify_stage(&self) -> VerifyStage {
        let mut verify = VerifyStage::new(self.gateway.clone());
        if !self.settings.lookup {
            verify = verify.with_lookup_source(None);
        } else if let Some(kind) = self.settings.lookup_source {
            verify = verify.with_lookup_source(Some(kind));
        }
        if let Some(ref model) = self.model {
            verify = verify.with_model(model.clone());
        }
        verify
    }

    /// Run one stage to a final outcome, re-running it after transient
    /// failures while the stage retry policy's attempts and wait budget
    /// allow, and apply its result.
    async fn execute(
        &self,
        stage: &dyn Stage,
        state: &mut PipelineState,
        run_deadline: Instant,
    ) -> StageRun {
        let name = stage.name();

        // Report always runs so the run can state its own completeness.
        if name != StageName::Report && Instant::now() >= run_deadline {
            warn!(stage = %name, "Run deadline passed before stage started");
            let outcome = StageOutcome::CompletedWithErrors;
            state.apply(&StageResult::new(name, outcome).with_diagnostics(vec![Diagnostic {
                stage: name,
                subject: Subject::Stage,
                class: ErrorClass::Deadline,
                message: "run deadline passed before the stage started".to_string(),
            }]));
            state.set_stage_state(name, StageState::Finished(outcome));
            state.record_event(
                name,
                StageEventKind::Finished { outcome },
                Some("run deadline passed".to_string()),
            );
            return StageRun { outcome, result: None };
        }

        state.set_stage_state(name, StageState::Running);
        let progress = self.spinner(name);
        let retry = &self.settings.stage_retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 1u32;
        let mut waited = Duration::ZERO;

        loop {
            state.record_event(name, StageEventKind::Started { attempt }, None);
            info!(stage = %name, attempt, "Stage started");

            let stage_deadline = Instant::now() + self.settings.stage_timeout;
            let deadline = if name == StageName::Report {
                stage_deadline
            } else {
                stage_deadline.min(run_deadline)
            };
            let mut ctx = StageContext::new(
                deadline,
                self.settings.call_retry.clone(),
                self.settings.concurrency,
            );
            ctx.attempt = attempt;

            let hard_deadline = deadline + HARD_TIMEOUT_GRACE;
            let run = tokio::time::timeout_at(hard_deadline, stage.run(state, &ctx));
            let result = match run.await {
                Ok(result) => result,
                Err(_) => Err(StageError::TimedOut),
            };

            match result {
                Ok(result) => {
                    let stats = state.apply(&result);
                    let outcome = result.outcome;
                    state.set_stage_state(name, StageState::Finished(outcome));
                    state.record_event(name, StageEventKind::Finished { outcome }, None);
                    info!(
                        stage = %name,
                        %outcome,
                        inserted = stats.inserted,
                        updated = stats.updated,
                        "Stage finished"
                    );
                    progress.finish_with_message(format!("{} {}", name, outcome));
                    return StageRun {
                        outcome,
                        result: Some(result),
                    };
                }
                Err(e) => {
                    let time_left = name == StageName::Report || Instant::now() < run_deadline;
                    let delay = retry.delay_for(attempt, None);
                    let within_budget = waited + delay <= retry.max_total_wait;
                    if e.is_transient() && attempt < max_attempts && time_left && within_budget {
                        warn!(
                            stage = %name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Stage failed transiently, retrying"
                        );
                        state.record_event(
                            name,
                            StageEventKind::Retrying {
                                attempt,
                                delay_ms: delay.as_millis() as u64,
                            },
                            Some(e.to_string()),
                        );
                        progress.set_message(format!("{} stage retrying after: {}", name, e));
                        tokio::time::sleep(delay).await;
                        waited += delay;
                        attempt += 1;
                        continue;
                    }

                    error!(stage = %name, attempt, error = %e, "Stage failed");
                    let outcome = StageOutcome::Failed;
                    state.apply(&StageResult::new(name, outcome).with_diagnostics(vec![Diagnostic {
                        stage: name,
                        subject: Subject::Stage,
                        class: e.class(),
                        message: e.to_string(),
                    }]));
                    state.set_stage_state(name, StageState::Finished(outcome));
                    state.record_event(
                        name,
                        StageEventKind::Finished { outcome },
                        Some(e.to_string()),
                    );
                    progress.abandon_with_message(format!("{} failed: {}", name, e));
                    return StageRun { outcome, result: None };
                }
            }
        }
    }

    fn spinner(&self, stage: StageName) -> ProgressBar {
        if !self.settings.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("{} stage running...", stage));
        pb
    }
}
