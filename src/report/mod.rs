//! Report types and the report stage.
//!
//! The report is derived from the final pipeline state once, then rendered
//! to Markdown or JSON. It is never mutated after assembly.

pub mod assembler;
pub mod generator;

use crate::analysis::RecordSummary;
use crate::cli::OutputFormat;
use crate::error::StageError;
use crate::models::{CandidateRecord, Confidence, Query, SourceKind};
use crate::pipeline::stage::{Stage, StageContext, StageResult};
use crate::pipeline::state::{PipelineState, RunStatus, StageName, StageOutcome, StageState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

pub use assembler::assemble;
pub use generator::{generate_json_report, generate_markdown_report, render};

/// The final research report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub summary: RecordSummary,
    /// One section per confidence tier, most trustworthy first.
    pub tiers: Vec<TierSection>,
    pub stages: Vec<StageSummary>,
    pub completeness: Completeness,
}

/// Metadata about the run that produced the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportMetadata {
    pub query: Query,
    pub status: RunStatus,
    pub sources: Vec<SourceKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub tool_version: String,
}

/// Candidates of one confidence tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierSection {
    pub confidence: Confidence,
    pub narrative: String,
    pub records: Vec<CandidateRecord>,
}

/// How one stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: StageName,
    pub state: StageState,
    pub attempts: u32,
}

/// Unresolved problems, grouped by what they affect.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Completeness {
    pub complete: bool,
    pub by_source: BTreeMap<SourceKind, Vec<String>>,
    /// Keyed by the candidate's display key, e.g. `instagram:@anna`.
    pub by_candidate: BTreeMap<String, Vec<String>>,
    /// Problems not tied to a source or candidate.
    pub run: Vec<String>,
}

/// Where and how the report stage writes its output.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportOutput {
    pub path: PathBuf,
    pub format: OutputFormat,
}

/// Final stage: assembles the report and writes it out.
pub struct ReportStage {
    output: Option<ReportOutput>,
}

impl ReportStage {
    pub fn new(output: Option<ReportOutput>) -> Self {
        Self { output }
    }
}

#[async_trait]
impl Stage for ReportStage {
    fn name(&self) -> StageName {
        StageName::Report
    }

    async fn run(
        &self,
        snapshot: &PipelineState,
        _ctx: &StageContext,
    ) -> Result<StageResult, StageError> {
        let report = assemble(snapshot);

        if let Some(ref output) = self.output {
            let content = render(&report, output.format)
                .map_err(|e| StageError::Permanent(format!("failed to render report: {}", e)))?;

            tokio::fs::write(&output.path, content).await.map_err(|e| {
                StageError::Permanent(format!(
                    "failed to write report to {}: {}",
                    output.path.display(),
                    e
                ))
            })?;
            info!(path = %output.path.display(), "Report written");
        }

        Ok(StageResult::new(StageName::Report, StageOutcome::Completed).with_report(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::retry::RetryPolicy;
    use std::time::Duration;
    use tokio::time::Instant;

    fn ctx() -> StageContext {
        StageContext::new(Instant::now() + Duration::from_secs(5), RetryPolicy::once(), 1)
    }

    fn state() -> PipelineState {
        let mut state =
            PipelineState::new(Query::new("fitness"), vec![SourceKind::WebSearch], None);
        state.set_stage_state(StageName::Research, StageState::Finished(StageOutcome::Completed));
        state.set_stage_state(StageName::Verify, StageState::Finished(StageOutcome::Completed));
        state
    }

    #[tokio::test]
    async fn test_report_stage_writes_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");
        let stage = ReportStage::new(Some(ReportOutput {
            path: path.clone(),
            format: OutputFormat::Markdown,
        }));

        let result = stage.run(&state(), &ctx()).await.unwrap();

        assert_eq!(result.outcome, StageOutcome::Completed);
        assert!(result.report.is_some());
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# YoScout Report"));
    }

    #[tokio::test]
    async fn test_report_stage_write_failure_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let stage = ReportStage::new(Some(ReportOutput {
            path: dir.path().join("missing").join("report.json"),
            format: OutputFormat::Json,
        }));

        let err = stage.run(&state(), &ctx()).await.unwrap_err();
        assert!(matches!(err, StageError::Permanent(_)));
    }
}
