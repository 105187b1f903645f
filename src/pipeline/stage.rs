//! The common stage contract.
//!
//! A stage reads a snapshot of [`PipelineState`] and returns a
//! [`StageResult`] describing what should change. Only the orchestrator
//! applies results, so stages never mutate state.

use crate::error::StageError;
use crate::models::CandidateRecord;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::state::{Diagnostic, PipelineState, StageName, StageOutcome};
use crate::report::Report;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::time::Instant;

/// What one stage invocation produced.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: StageName,
    pub outcome: StageOutcome,
    /// Records to merge into state.
    pub upserts: Vec<CandidateRecord>,
    pub diagnostics: Vec<Diagnostic>,
    /// Set only by the report stage.
    pub report: Option<Report>,
}

impl StageResult {
    pub fn new(stage: StageName, outcome: StageOutcome) -> Self {
        Self {
            stage,
            outcome,
            upserts: Vec::new(),
            diagnostics: Vec::new(),
            report: None,
        }
    }

    pub fn with_upserts(mut self, upserts: Vec<CandidateRecord>) -> Self {
        self.upserts = upserts;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_report(mut self, report: Report) -> Self {
        self.report = Some(report);
        self
    }
}

/// Per-invocation settings handed to a stage by the orchestrator.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Effective deadline: the earlier of the stage timeout and the run deadline.
    pub deadline: Instant,
    /// Policy for individual gateway and model calls.
    pub retry: RetryPolicy,
    /// Maximum number of work items in flight within the stage.
    pub concurrency: usize,
    /// 1-based attempt number of this invocation.
    pub attempt: u32,
}

impl StageContext {
    pub fn new(deadline: Instant, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            deadline,
            retry,
            concurrency: concurrency.max(1),
            attempt: 1,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// A unit of pipeline work.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    /// Run against a read-only snapshot.
    async fn run(
        &self,
        snapshot: &PipelineState,
        ctx: &StageContext,
    ) -> Result<StageResult, StageError>;
}

/// Items gathered from a fan-out before its deadline.
#[derive(Debug)]
pub struct Collected<T> {
    pub items: Vec<T>,
    /// True when the deadline passed with work still pending.
    pub cut_short: bool,
}

/// Drain `stream` until it ends or `deadline` passes. Pending futures are
/// dropped, and thereby cancelled, when the deadline wins.
pub async fn collect_until<S>(deadline: Instant, stream: S) -> Collected<S::Item>
where
    S: Stream,
{
    let mut stream = Box::pin(stream);
    let mut items = Vec::new();

    loop {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {
                return Collected {
                    items,
                    cut_short: false,
                }
            }
            Err(_) => {
                return Collected {
                    items,
                    cut_short: true,
                }
            }
        }
    }
}
