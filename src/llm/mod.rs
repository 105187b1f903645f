//! Capability Model client.
//!
//! The model is a black box that turns a prompt into JSON. Its output is
//! treated as untrusted input: every answer is deserialized into a typed
//! schema and validated before a stage may act on it.

pub mod ollama;

use crate::error::CapabilityError;
use crate::pipeline::retry::{with_retry, RetryPolicy};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub use ollama::{OllamaConfig, OllamaModel};

/// A prompt with `{placeholder}` slots and the JSON shape it expects back.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    pub name: &'static str,
    pub system: String,
    pub body: String,
    /// Example of the exact JSON object the model must answer with.
    pub response_shape: String,
    pub strict: bool,
}

impl PromptTemplate {
    /// Stricter variant used for the single retry after an invalid answer.
    pub fn strict(&self) -> Self {
        let mut strict = self.clone();
        strict.strict = true;
        strict.system.push_str(
            "\n\nYour previous answer could not be used. Respond with exactly one JSON object \
             matching the shape below. No prose, no markdown fences, no extra keys.",
        );
        strict
    }

    /// Substitute context values into the body.
    pub fn render(&self, context: &BTreeMap<String, String>) -> String {
        let mut body = self.body.clone();
        for (key, value) in context {
            body = body.replace(&format!("{{{}}}", key), value);
        }
        format!("{}\n\nRespond with JSON shaped like:\n{}", body, self.response_shape)
    }
}

/// A reasoning capability that answers prompts with JSON.
#[async_trait]
pub trait CapabilityModel: Send + Sync {
    /// Run one inference. The returned value is raw and unvalidated.
    async fn infer(
        &self,
        template: &PromptTemplate,
        context: &BTreeMap<String, String>,
    ) -> Result<Value, CapabilityError>;

    /// Model identifier for reports and logs.
    fn name(&self) -> &str;
}

/// Typed model answers validate themselves beyond what serde checks.
pub trait ValidatedOutput: DeserializeOwned {
    fn validate(&self) -> Result<(), String>;
}

/// Outcome of a structured inference, with the number of model calls made.
#[derive(Debug)]
pub struct Inference<T> {
    pub result: Result<T, CapabilityError>,
    pub calls: u32,
    /// Whether the strict template was needed.
    pub used_strict: bool,
}

/// Infer and validate `T`. Transient failures are retried under `policy`;
/// an invalid answer earns exactly one retry with the strict template.
pub async fn infer_structured<T: ValidatedOutput>(
    model: &dyn CapabilityModel,
    template: &PromptTemplate,
    context: &BTreeMap<String, String>,
    policy: &RetryPolicy,
) -> Inference<T> {
    let first = attempt::<T>(model, template, context, policy).await;
    let mut calls = first.1;

    match first.0 {
        Err(CapabilityError::InvalidResponse(reason)) => {
            debug!(
                template = template.name,
                %reason,
                "Invalid model answer, retrying with strict prompt"
            );
            let strict = template.strict();
            let second = attempt::<T>(model, &strict, context, policy).await;
            calls += second.1;
            if let Err(ref e) = second.0 {
                warn!(template = template.name, error = %e, "Model answer still unusable");
            }
            Inference {
                result: second.0,
                calls,
                used_strict: true,
            }
        }
        other => Inference {
            result: other,
            calls,
            used_strict: false,
        },
    }
}

async fn attempt<T: ValidatedOutput>(
    model: &dyn CapabilityModel,
    template: &PromptTemplate,
    context: &BTreeMap<String, String>,
    policy: &RetryPolicy,
) -> (Result<T, CapabilityError>, u32) {
    let retried = with_retry(policy, template.name, move |_| model.infer(template, context)).await;
    let result = retried.result.and_then(decode::<T>);
    (result, retried.attempts)
}

/// Deserialize and validate a raw model answer.
pub fn decode<T: ValidatedOutput>(raw: Value) -> Result<T, CapabilityError> {
    let parsed: T = serde_json::from_value(raw)
        .map_err(|e| CapabilityError::InvalidResponse(format!("schema mismatch: {}", e)))?;
    parsed.validate().map_err(CapabilityError::InvalidResponse)?;
    Ok(parsed)
}

/// Answer to the engagement plausibility check.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlausibilityVerdict {
    pub plausible: bool,
    pub reason: String,
}

impl ValidatedOutput for PlausibilityVerdict {
    fn validate(&self) -> Result<(), String> {
        if self.reason.trim().is_empty() {
            return Err("`reason` must not be empty".to_string());
        }
        Ok(())
    }
}

/// Template for "does this engagement rate look plausible for this audience".
pub fn plausibility_template() -> PromptTemplate {
    PromptTemplate {
        name: "engagement_plausibility",
        system: "You are a careful social-media analyst. You judge whether reported \
                 audience metrics are internally consistent. You answer only in JSON."
            .to_string(),
        body: "A {platform} account @{handle} reportedly has {followers} followers and an \
               engagement rate of {engagement_rate}%. Considering typical engagement for \
               accounts of this size on {platform}, is this combination plausible?"
            .to_string(),
        response_shape: r#"{"plausible": true, "reason": "one short sentence"}"#.to_string(),
        strict: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::ScriptedModel;
    use serde_json::json;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    fn context() -> BTreeMap<String, String> {
        [
            ("platform", "Instagram"),
            ("handle", "anna"),
            ("followers", "12000"),
            ("engagement_rate", "3.5"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let rendered = plausibility_template().render(&context());
        assert!(rendered.contains("@anna reportedly has 12000 followers"));
        assert!(rendered.contains("engagement rate of 3.5%"));
        assert!(rendered.contains(r#""plausible""#));
        assert!(!rendered.contains("{handle}"));
    }

    #[test]
    fn test_strict_variant() {
        let strict = plausibility_template().strict();
        assert!(strict.strict);
        assert!(strict.system.contains("exactly one JSON object"));
    }

    #[test]
    fn test_decode_rejects_schema_violations() {
        let verdict = json!({"plausible": true, "reason": "fine"});
        assert!(decode::<PlausibilityVerdict>(verdict).is_ok());
        assert!(matches!(
            decode::<PlausibilityVerdict>(json!({"plausible": "yes"})),
            Err(CapabilityError::InvalidResponse(_))
        ));
        assert!(matches!(
            decode::<PlausibilityVerdict>(json!({"plausible": false, "reason": "  "})),
            Err(CapabilityError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_then_valid_uses_strict_retry() {
        let model = ScriptedModel::new(vec![
            Err(CapabilityError::InvalidResponse("not json".into())),
            Ok(json!({"plausible": true, "reason": "typical for mid-size accounts"})),
        ]);

        let inference: Inference<PlausibilityVerdict> =
            infer_structured(&model, &plausibility_template(), &context(), &policy()).await;

        assert!(inference.used_strict);
        assert_eq!(inference.calls, 2);
        assert!(inference.result.unwrap().plausible);
        assert!(model.saw_strict_prompt());
    }

    #[tokio::test]
    async fn test_invalid_twice_surfaces_error() {
        let model = ScriptedModel::new(vec![
            Ok(json!({"verdict": "sure"})),
            Ok(json!({"verdict": "still sure"})),
        ]);

        let inference: Inference<PlausibilityVerdict> =
            infer_structured(&model, &plausibility_template(), &context(), &policy()).await;

        assert_eq!(inference.calls, 2);
        assert!(matches!(inference.result, Err(CapabilityError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let model = ScriptedModel::new(vec![
            Err(CapabilityError::QuotaExceeded),
            Err(CapabilityError::Timeout),
            Ok(json!({"plausible": false, "reason": "rate far too high"})),
        ]);

        let inference: Inference<PlausibilityVerdict> =
            infer_structured(&model, &plausibility_template(), &context(), &policy()).await;

        assert!(!inference.used_strict);
        assert_eq!(inference.calls, 3);
        assert!(!inference.result.unwrap().plausible);
    }
}
