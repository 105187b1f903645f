//! Verification stage: cross-checks candidates found during research.
//!
//! Each pending record can earn up to two independent confirmations: a
//! targeted profile lookup that returns the same identity, and a
//! plausibility check of its metrics by the capability model. Every
//! confirmation promotes confidence by one level. Records nobody could
//! confirm are kept but flagged.

use crate::error::{Classify, ErrorClass, StageError};
use crate::gateway::{Gateway, SourceParams};
use crate::llm::{
    infer_structured, plausibility_template, CapabilityModel, Inference, PlausibilityVerdict,
};
use crate::models::{CandidateRecord, Confidence, MergePolicy, SourceKind};
use crate::pipeline::stage::{collect_until, Stage, StageContext, StageResult};
use crate::pipeline::state::{Diagnostic, PipelineState, StageName, StageOutcome, Subject};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct VerifyStage {
    gateway: Gateway,
    model: Option<Arc<dyn CapabilityModel>>,
    lookup_source: Option<SourceKind>,
}

/// Result of checking one record.
struct Checked {
    record: CandidateRecord,
    diagnostics: Vec<Diagnostic>,
}

impl VerifyStage {
    /// A stage that looks profiles up on the default lookup source and
    /// runs no model checks.
    pub fn new(gateway: Gateway) -> Self {
        let lookup_source = default_lookup_source(&gateway);
        Self {
            gateway,
            model: None,
            lookup_source,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn CapabilityModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Override the lookup source; `None` disables lookups.
    pub fn with_lookup_source(mut self, kind: Option<SourceKind>) -> Self {
        let enabled = kind.filter(|k| self.gateway.is_enabled(*k));
        self.lookup_source = enabled;
        self
    }

    pub fn lookup_source(&self) -> Option<SourceKind> {
        self.lookup_source
    }

    async fn check(&self, record: CandidateRecord, ctx: &StageContext) -> Checked {
        let key = record.key.clone();
        let mut updated = record;
        let mut confirmations = 0u32;
        let mut diagnostics = Vec::new();

        if let Some(kind) = self.lookup_source {
            let params = SourceParams::Lookup {
                platform: key.platform,
                handle: key.handle.clone(),
            };
            let outcome = self.gateway.query_with_retry(kind, &params, &ctx.retry).await;
            match outcome.result {
                Ok(result) => match result.profiles.into_iter().find(|p| p.key == key) {
                    Some(profile) => {
                        confirmations += 1;
                        // Fills empty fields and notes any contact mismatch.
                        updated.absorb(&profile.into_record(), MergePolicy::FirstReporter);
                        updated.add_note(format!("profile confirmed by {} lookup", kind));
                    }
                    None => {
                        updated.add_note(format!("{} lookup returned no matching profile", kind))
                    }
                },
                Err(e) => {
                    debug!(candidate = %key, error = %e, "Lookup failed");
                    diagnostics.push(Diagnostic {
                        stage: StageName::Verify,
                        subject: Subject::Candidate(key.clone()),
                        class: e.class(),
                        message: format!(
                            "{} lookup failed after {} attempt(s): {}",
                            kind, outcome.attempts, e
                        ),
                    });
                }
            }
        }

        if let Some(ref model) = self.model {
            match (updated.followers, updated.engagement_rate) {
                (Some(followers), Some(rate)) => {
                    let context: BTreeMap<String, String> = [
                        ("platform", key.platform.to_string()),
                        ("handle", key.handle.clone()),
                        ("followers", followers.to_string()),
                        ("engagement_rate", format!("{:.2}", rate)),
                    ]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect();

                    let inference: Inference<PlausibilityVerdict> = infer_structured(
                        model.as_ref(),
                        &plausibility_template(),
                        &context,
                        &ctx.retry,
                    )
                    .await;
                    if inference.used_strict {
                        debug!(candidate = %key, "Plausibility answer needed the strict prompt");
                    }

                    match inference.result {
                        Ok(verdict) if verdict.plausible => {
                            confirmations += 1;
                            let reason = verdict.reason.trim();
                            updated.add_note(format!("engagement plausible: {}", reason));
                        }
                        Ok(verdict) => {
                            let reason = verdict.reason.trim();
                            updated.add_note(format!("engagement implausible: {}", reason));
                        }
                        Err(e) => {
                            debug!(
                                candidate = %key,
                                error = %e,
                                calls = inference.calls,
                                "Plausibility check failed"
                            );
                            diagnostics.push(Diagnostic {
                                stage: StageName::Verify,
                                subject: Subject::Candidate(key.clone()),
                                class: e.class(),
                                message: format!("plausibility check failed: {}", e),
                            });
                        }
                    }
                }
                _ => updated.add_note(
                    "plausibility check skipped: follower count or engagement rate missing",
                ),
            }
        }

        for _ in 0..confirmations {
            updated.confidence = updated.confidence.promoted();
        }
        updated.confirmations += confirmations;

        if confirmations == 0 {
            updated.flagged = updated.confidence == Confidence::Unverified;
            updated.add_note("no independent confirmation found");
        }

        Checked {
            record: updated,
            diagnostics,
        }
    }
}

/// `social_profile` when enabled, else the first enabled kind.
fn default_lookup_source(gateway: &Gateway) -> Option<SourceKind> {
    if gateway.is_enabled(SourceKind::SocialProfile) {
        Some(SourceKind::SocialProfile)
    } else {
        gateway.source_kinds().into_iter().next()
    }
}

#[async_trait]
impl Stage for VerifyStage {
    fn name(&self) -> StageName {
        StageName::Verify
    }

    async fn run(
        &self,
        snapshot: &PipelineState,
        ctx: &StageContext,
    ) -> Result<StageResult, StageError> {
        let pending: Vec<CandidateRecord> =
            snapshot.pending_verification().into_iter().cloned().collect();
        let total = pending.len();

        if total == 0 {
            info!("Nothing to verify");
            return Ok(StageResult::new(StageName::Verify, StageOutcome::Completed));
        }

        info!(
            candidates = total,
            lookup = ?self.lookup_source,
            model = self.model.as_ref().map(|m| m.name()).unwrap_or("none"),
            "Starting verification"
        );

        let checks = stream::iter(pending)
            .map(move |record| self.check(record, ctx))
            .buffer_unordered(ctx.concurrency);
        let collected = collect_until(ctx.deadline, checks).await;

        let mut upserts = Vec::with_capacity(collected.items.len());
        let mut diagnostics = Vec::new();
        for checked in collected.items {
            upserts.push(checked.record);
            diagnostics.extend(checked.diagnostics);
        }
        upserts.sort_by(|a, b| a.key.cmp(&b.key));
        diagnostics.sort();

        if collected.cut_short {
            let unchecked = total - upserts.len();
            warn!(unchecked, "Deadline reached during verification");
            diagnostics.push(Diagnostic {
                stage: StageName::Verify,
                subject: Subject::Stage,
                class: ErrorClass::Deadline,
                message: format!(
                    "deadline reached with {} of {} candidates unchecked",
                    unchecked, total
                ),
            });
        }

        let outcome = if diagnostics.is_empty() {
            StageOutcome::Completed
        } else {
            StageOutcome::CompletedWithErrors
        };

        let promoted = upserts.iter().filter(|r| r.confirmations > 0).count();
        let flagged = upserts.iter().filter(|r| r.flagged).count();
        info!(checked = upserts.len(), promoted, flagged, %outcome, "Verification finished");

        Ok(StageResult::new(StageName::Verify, outcome)
            .with_upserts(upserts)
            .with_diagnostics(diagnostics))
    }
}
