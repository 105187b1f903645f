//! Pipeline state owned by the orchestrator for the duration of one run.

use crate::error::{ErrorClass, PipelineError};
use crate::models::{CandidateRecord, Confidence, IdentityKey, MergePolicy, Query, SourceKind};
use crate::pipeline::stage::StageResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Overall status of a run. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    PartialSuccess,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::PartialSuccess | RunStatus::Failed
        )
    }

    fn can_become(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            RunStatus::Pending | RunStatus::Running => "⏳",
            RunStatus::Success => "✅",
            RunStatus::PartialSuccess => "⚠️",
            RunStatus::Failed => "❌",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "Pending"),
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Success => write!(f, "Success"),
            RunStatus::PartialSuccess => write!(f, "Partial success"),
            RunStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// The three fixed stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Research,
    Verify,
    Report,
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageName::Research => write!(f, "research"),
            StageName::Verify => write!(f, "verify"),
            StageName::Report => write!(f, "report"),
        }
    }
}

/// How a finished stage invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    CompletedWithErrors,
    Failed,
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Completed => write!(f, "completed"),
            StageOutcome::CompletedWithErrors => write!(f, "completed with errors"),
            StageOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle of a stage within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    NotStarted,
    Running,
    Finished(StageOutcome),
}

/// A problem recorded while a stage ran, kept for the report's
/// completeness section.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Diagnostic {
    pub stage: StageName,
    pub subject: Subject,
    pub class: ErrorClass,
    pub message: String,
}

/// What a diagnostic is about.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Subject {
    Source(SourceKind),
    Candidate(IdentityKey),
    Stage,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Source(kind) => write!(f, "source {}", kind),
            Subject::Candidate(key) => write!(f, "candidate {}", key),
            Subject::Stage => write!(f, "stage"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum StageEventKind {
    Started { attempt: u32 },
    Retrying { attempt: u32, delay_ms: u64 },
    Finished { outcome: StageOutcome },
}

/// Entry in the per-run event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: StageName,
    pub at: DateTime<Utc>,
    pub kind: StageEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counts from applying one stage result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
}

/// Mutable state of one run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub query: Query,
    /// Enabled source kinds for this run.
    pub sources: Vec<SourceKind>,
    /// Capability model used for cross-checks, if any.
    pub model: Option<String>,
    pub records: BTreeMap<IdentityKey, CandidateRecord>,
    pub events: Vec<StageEvent>,
    pub stages: BTreeMap<StageName, StageState>,
    /// Unresolved problems, de-duplicated.
    pub diagnostics: Vec<Diagnostic>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineState {
    /// Seed a pending run from a query.
    pub fn new(query: Query, sources: Vec<SourceKind>, model: Option<String>) -> Self {
        let stages = [StageName::Research, StageName::Verify, StageName::Report]
            .into_iter()
            .map(|s| (s, StageState::NotStarted))
            .collect();

        Self {
            query,
            sources,
            model,
            records: BTreeMap::new(),
            events: Vec::new(),
            stages,
            diagnostics: Vec::new(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move the run status forward, rejecting anything else.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), PipelineError> {
        if !self.status.can_become(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn stage_state(&self, stage: StageName) -> StageState {
        self.stages.get(&stage).copied().unwrap_or(StageState::NotStarted)
    }

    pub fn set_stage_state(&mut self, stage: StageName, state: StageState) {
        self.stages.insert(stage, state);
    }

    pub fn record_event(&mut self, stage: StageName, kind: StageEventKind, error: Option<String>) {
        self.events.push(StageEvent {
            stage,
            at: Utc::now(),
            kind,
            error,
        });
    }

    /// Apply a stage's upserts and diagnostics. Upserts are merged under
    /// [`MergePolicy::Confident`]; applying the same result twice is a no-op
    /// the second time.
    pub fn apply(&mut self, result: &StageResult) -> MergeStats {
        let mut stats = MergeStats::default();

        // Fold duplicate keys within the result first so the merge into
        // state sees one record per key.
        let mut collapsed: BTreeMap<IdentityKey, CandidateRecord> = BTreeMap::new();
        for upsert in &result.upserts {
            match collapsed.get_mut(&upsert.key) {
                Some(existing) => existing.absorb(upsert, MergePolicy::Confident),
                None => {
                    collapsed.insert(upsert.key.clone(), upsert.clone());
                }
            }
        }

        for incoming in collapsed.values() {
            match self.records.get_mut(&incoming.key) {
                Some(existing) => {
                    let before = existing.clone();
                    existing.absorb(incoming, MergePolicy::Confident);
                    if *existing != before {
                        stats.updated += 1;
                    }
                }
                None => {
                    self.records.insert(incoming.key.clone(), incoming.clone());
                    stats.inserted += 1;
                }
            }
        }

        for diagnostic in &result.diagnostics {
            if !self.diagnostics.contains(diagnostic) {
                self.diagnostics.push(diagnostic.clone());
            }
        }

        stats
    }

    /// Records that still need verification work.
    pub fn pending_verification(&self) -> Vec<&CandidateRecord> {
        self.records
            .values()
            .filter(|r| r.confidence < Confidence::Verified)
            .collect()
    }

    /// Terminal status implied by the stage states, taking `report` as the
    /// Report stage's outcome.
    pub fn resolve_status(&self, report: StageOutcome) -> RunStatus {
        let research = self.stage_state(StageName::Research);
        let research_ok = matches!(
            research,
            StageState::Finished(StageOutcome::Completed)
                | StageState::Finished(StageOutcome::CompletedWithErrors)
        );
        if !research_ok || report == StageOutcome::Failed {
            return RunStatus::Failed;
        }

        let clean = [research, self.stage_state(StageName::Verify), StageState::Finished(report)]
            .iter()
            .all(|s| *s == StageState::Finished(StageOutcome::Completed));
        if clean {
            RunStatus::Success
        } else {
            RunStatus::PartialSuccess
        }
    }

    /// Number of times a stage was started in this run.
    pub fn attempts(&self, stage: StageName) -> u32 {
        self.events
            .iter()
            .filter(|e| e.stage == stage && matches!(e.kind, StageEventKind::Started { .. }))
            .count() as u32
    }
}
