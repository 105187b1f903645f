//! External Source Gateway.
//!
//! A uniform front for heterogeneous search and social-data providers.
//! Providers return raw JSON; the gateway validates it into typed
//! [`SourceResult`]s before anything else in the pipeline sees it, and
//! bounds how many calls may be in flight per source kind.

pub mod http;
pub mod schema;

use crate::error::SourceError;
use crate::models::{Platform, SourceKind};
use crate::pipeline::retry::{with_retry, RetryPolicy};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

pub use http::HttpSourceProvider;
pub use schema::{SourceProfile, SourceResult};

/// Parameters of one provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceParams {
    /// Broad discovery for a topic on one platform.
    Discover {
        topic: String,
        niche: Option<String>,
        region: Option<String>,
        platform: Platform,
        limit: usize,
    },
    /// Targeted lookup of a single known profile.
    Lookup { platform: Platform, handle: String },
}

impl SourceParams {
    pub fn platform(&self) -> Platform {
        match self {
            SourceParams::Discover { platform, .. } | SourceParams::Lookup { platform, .. } => {
                *platform
            }
        }
    }

    /// Short description for logs and diagnostics.
    pub fn describe(&self) -> String {
        match self {
            SourceParams::Discover { topic, platform, .. } => {
                format!("discover '{}' on {}", topic, platform.as_str())
            }
            SourceParams::Lookup { platform, handle } => {
                format!("lookup {}:@{}", platform.as_str(), handle)
            }
        }
    }
}

/// A single provider behind the gateway.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Perform the call and return the provider's raw payload.
    async fn fetch(&self, params: &SourceParams) -> Result<Value, SourceError>;
}

/// Result of a gateway call made under a retry policy.
#[derive(Debug)]
pub struct CallOutcome {
    pub result: Result<SourceResult, SourceError>,
    pub attempts: u32,
    /// Time spent backing off between attempts.
    pub waited: Duration,
}

struct SourceSlot {
    provider: Arc<dyn SourceProvider>,
    permits: Arc<Semaphore>,
}

/// Routes calls to the provider registered for each source kind.
#[derive(Clone, Default)]
pub struct Gateway {
    slots: Arc<BTreeMap<SourceKind, SourceSlot>>,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// Enabled source kinds, in first-reporter order.
    pub fn source_kinds(&self) -> Vec<SourceKind> {
        self.slots.keys().copied().collect()
    }

    pub fn is_enabled(&self, kind: SourceKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// One validated call against `kind`, holding a concurrency permit for
    /// its duration.
    pub async fn query(
        &self,
        kind: SourceKind,
        params: &SourceParams,
    ) -> Result<SourceResult, SourceError> {
        let slot = self
            .slots
            .get(&kind)
            .ok_or_else(|| SourceError::Unavailable(format!("source `{}` is not enabled", kind)))?;

        let raw = {
            let _permit = slot
                .permits
                .acquire()
                .await
                .map_err(|_| SourceError::Unavailable(format!("source `{}` is shut down", kind)))?;
            debug!(source = %kind, call = %params.describe(), "Calling provider");
            slot.provider.fetch(params).await?
        };

        let result = schema::parse_profiles(kind, params.platform(), &raw)?;
        if result.rejected > 0 {
            debug!(
                source = %kind,
                rejected = result.rejected,
                accepted = result.profiles.len(),
                "Dropped invalid profiles"
            );
        }
        Ok(result)
    }

    /// [`Gateway::query`] under a retry policy. Permits are released while
    /// backing off.
    pub async fn query_with_retry(
        &self,
        kind: SourceKind,
        params: &SourceParams,
        policy: &RetryPolicy,
    ) -> CallOutcome {
        let label = format!("{} {}", kind, params.describe());
        let retried = with_retry(policy, &label, move |_| self.query(kind, params)).await;
        if retried.attempts > 1 {
            debug!(
                source = %kind,
                attempts = retried.attempts,
                waited_ms = retried.total_wait.as_millis() as u64,
                "Call needed retries"
            );
        }
        CallOutcome {
            result: retried.result,
            attempts: retried.attempts,
            waited: retried.total_wait,
        }
    }
}

/// Builder that pairs each source kind with a provider and a concurrency limit.
#[derive(Default)]
pub struct GatewayBuilder {
    slots: BTreeMap<SourceKind, SourceSlot>,
}

impl GatewayBuilder {
    pub fn source(
        mut self,
        kind: SourceKind,
        provider: Arc<dyn SourceProvider>,
        concurrency: usize,
    ) -> Self {
        self.slots.insert(
            kind,
            SourceSlot {
                provider,
                permits: Arc::new(Semaphore::new(concurrency.max(1))),
            },
        );
        self
    }

    pub fn build(self) -> Gateway {
        Gateway {
            slots: Arc::new(self.slots),
        }
    }
}
