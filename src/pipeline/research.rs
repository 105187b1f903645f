//! Research stage: broad discovery across every enabled source.

use crate::error::{Classify, ErrorClass, StageError};
use crate::gateway::{CallOutcome, Gateway, SourceParams};
use crate::models::{CandidateRecord, IdentityKey, MergePolicy, Platform, SourceKind};
use crate::pipeline::stage::{collect_until, Stage, StageContext, StageResult};
use crate::pipeline::state::{Diagnostic, PipelineState, StageName, StageOutcome, Subject};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Default number of profiles requested per discovery call.
pub const DEFAULT_DISCOVERY_LIMIT: usize = 25;

/// Fans out one discovery call per (source kind, platform) pair and
/// deduplicates the results by identity key.
pub struct ResearchStage {
    gateway: Gateway,
    limit: usize,
}

impl ResearchStage {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            limit: DEFAULT_DISCOVERY_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Planned calls in first-reporter order: source kind, then platform.
    pub fn plan(&self, snapshot: &PipelineState) -> Vec<(SourceKind, SourceParams)> {
        let query = &snapshot.query;
        let in_scope = query.platforms_in_scope();
        let platforms = &in_scope;

        self.gateway
            .source_kinds()
            .into_iter()
            .flat_map(move |kind| {
                platforms.iter().map(move |platform| {
                    (
                        kind,
                        SourceParams::Discover {
                            topic: query.topic.clone(),
                            niche: query.niche.clone(),
                            region: query.region.clone(),
                            platform: *platform,
                            limit: self.limit,
                        },
                    )
                })
            })
            .collect()
    }
}

/// One finished discovery call, tagged with its position in the plan.
struct Finished {
    index: usize,
    kind: SourceKind,
    platform: Platform,
    outcome: CallOutcome,
}

#[async_trait]
impl Stage for ResearchStage {
    fn name(&self) -> StageName {
        StageName::Research
    }

    async fn run(
        &self,
        snapshot: &PipelineState,
        ctx: &StageContext,
    ) -> Result<StageResult, StageError> {
        let plan = self.plan(snapshot);
        let total = plan.len();
        if total == 0 {
            return Err(StageError::Permanent("no discovery calls to make".to_string()));
        }

        info!(
            calls = total,
            query = %snapshot.query.describe(),
            budget_ms = ctx.remaining().as_millis() as u64,
            "Starting discovery"
        );

        let gateway = &self.gateway;
        let calls = stream::iter(plan.into_iter().enumerate())
            .map(move |(index, (kind, params))| async move {
                let outcome = gateway.query_with_retry(kind, &params, &ctx.retry).await;
                Finished {
                    index,
                    kind,
                    platform: params.platform(),
                    outcome,
                }
            })
            // Per-kind semaphores in the gateway do the real throttling.
            .buffer_unordered(total);

        let collected = collect_until(ctx.deadline, calls).await;
        let mut finished = collected.items;
        finished.sort_by_key(|f| f.index);

        let mut records: BTreeMap<IdentityKey, CandidateRecord> = BTreeMap::new();
        let mut diagnostics = Vec::new();
        let mut succeeded = 0usize;
        let mut failures: Vec<(SourceKind, String, bool)> = Vec::new();

        for call in finished {
            match call.outcome.result {
                Ok(result) => {
                    succeeded += 1;
                    debug!(
                        source = %call.kind,
                        platform = %call.platform,
                        profiles = result.profiles.len(),
                        "Discovery call returned"
                    );
                    if result.rejected > 0 {
                        diagnostics.push(Diagnostic {
                            stage: StageName::Research,
                            subject: Subject::Source(call.kind),
                            class: ErrorClass::Permanent,
                            message: format!(
                                "dropped {} invalid profile(s) from {} discovery",
                                result.rejected, call.platform
                            ),
                        });
                    }
                    for profile in result.profiles {
                        let record = profile.into_record();
                        match records.get_mut(&record.key) {
                            Some(existing) => existing.absorb(&record, MergePolicy::FirstReporter),
                            None => {
                                records.insert(record.key.clone(), record);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        source = %call.kind,
                        platform = %call.platform,
                        attempts = call.outcome.attempts,
                        error = %e,
                        "Discovery call failed"
                    );
                    diagnostics.push(Diagnostic {
                        stage: StageName::Research,
                        subject: Subject::Source(call.kind),
                        class: e.class(),
                        message: format!(
                            "{} discovery failed after {} attempt(s): {}",
                            call.platform, call.outcome.attempts, e
                        ),
                    });
                    failures.push((call.kind, e.to_string(), e.is_transient()));
                }
            }
        }

        let outstanding = total - succeeded - failures.len();
        if collected.cut_short {
            warn!(outstanding, "Deadline reached during discovery");
            diagnostics.push(Diagnostic {
                stage: StageName::Research,
                subject: Subject::Stage,
                class: ErrorClass::Deadline,
                message: format!(
                    "deadline reached with {} of {} discovery calls outstanding",
                    outstanding, total
                ),
            });
        }

        if succeeded == 0 {
            if failures.is_empty() {
                return Err(StageError::TimedOut);
            }
            let all_transient = failures.iter().all(|(_, _, transient)| *transient);
            let mut summary: Vec<String> = failures
                .iter()
                .map(|(kind, error, _)| format!("{}: {}", kind, error))
                .collect();
            summary.dedup();
            let message = format!("all {} discovery calls failed ({})", total, summary.join("; "));
            return Err(if all_transient {
                StageError::Transient(message)
            } else {
                StageError::Permanent(message)
            });
        }

        let outcome = if failures.is_empty() && !collected.cut_short {
            StageOutcome::Completed
        } else {
            StageOutcome::CompletedWithErrors
        };

        info!(
            candidates = records.len(),
            succeeded,
            failed = failures.len(),
            %outcome,
            "Discovery finished"
        );

        Ok(StageResult::new(StageName::Research, outcome)
            .with_upserts(records.into_values().collect())
            .with_diagnostics(diagnostics))
    }
}
