//! Builds a [`Report`] from the final pipeline state.
//!
//! Assembly is a pure function of the state: timestamps come from the state
//! and its event log, never from the clock, so identical state always yields
//! an identical report.

use super::{Completeness, Report, ReportMetadata, StageSummary, TierSection};
use crate::analysis::{group_by_confidence, tier_narrative, RecordSummary};
use crate::models::Confidence;
use crate::pipeline::state::{
    Diagnostic, PipelineState, StageName, StageOutcome, StageState, Subject,
};

/// Assemble the report for `state`.
///
/// While the run is still in progress (the report stage itself is running),
/// the status is the one the run will end with if the report succeeds.
pub fn assemble(state: &PipelineState) -> Report {
    let status = if state.status.is_terminal() {
        state.status
    } else {
        state.resolve_status(StageOutcome::Completed)
    };

    let finished_at = state
        .finished_at
        .or_else(|| state.events.last().map(|e| e.at))
        .unwrap_or(state.started_at);
    let elapsed_ms = (finished_at - state.started_at).num_milliseconds().max(0);
    let duration_seconds = elapsed_ms as f64 / 1000.0;

    let metadata = ReportMetadata {
        query: state.query.clone(),
        status,
        sources: state.sources.clone(),
        model: state.model.clone(),
        started_at: state.started_at,
        finished_at,
        duration_seconds,
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let mut grouped = group_by_confidence(state.records.values());
    let tiers = Confidence::TIERS
        .iter()
        .map(|tier| {
            let records = grouped.remove(tier).unwrap_or_default();
            TierSection {
                confidence: *tier,
                narrative: tier_narrative(*tier, &records),
                records,
            }
        })
        .collect();

    let stages = [StageName::Research, StageName::Verify, StageName::Report]
        .into_iter()
        .map(|stage| {
            let mut stage_state = state.stage_state(stage);
            if stage == StageName::Report && stage_state == StageState::Running {
                stage_state = StageState::Finished(StageOutcome::Completed);
            }
            StageSummary {
                stage,
                state: stage_state,
                attempts: state.attempts(stage),
            }
        })
        .collect();

    Report {
        metadata,
        summary: RecordSummary::from_records(state.records.values()),
        tiers,
        stages,
        completeness: completeness(&state.diagnostics),
    }
}

/// Group unresolved diagnostics by the source or candidate they affect.
pub fn completeness(diagnostics: &[Diagnostic]) -> Completeness {
    let mut section = Completeness {
        complete: diagnostics.is_empty(),
        ..Completeness::default()
    };

    let mut sorted: Vec<&Diagnostic> = diagnostics.iter().collect();
    sorted.sort();

    for diagnostic in sorted {
        let line = format!(
            "[{}] {} ({})",
            diagnostic.stage, diagnostic.message, diagnostic.class
        );
        match diagnostic.subject {
            Subject::Source(kind) => section.by_source.entry(kind).or_default().push(line),
            Subject::Candidate(ref key) => section
                .by_candidate
                .entry(key.to_string())
                .or_default()
                .push(line),
            Subject::Stage => section.run.push(line),
        }
    }

    section
}
