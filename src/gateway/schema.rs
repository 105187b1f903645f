//! Validation of raw provider payloads.
//!
//! Providers disagree on field names and are not above sending garbage, so
//! nothing leaves this module untyped. The envelope must be an object with a
//! `results` array (or a bare array). Individual profiles that fail
//! validation are counted and dropped; only a broken envelope fails the call.

use crate::error::SourceError;
use crate::models::{CandidateRecord, IdentityKey, Platform, RecordField, SourceKind};
use serde::Deserialize;
use serde_json::Value;

/// One validated profile as reported by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceProfile {
    pub source: SourceKind,
    pub key: IdentityKey,
    pub name: Option<String>,
    pub profile_url: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub followers: Option<u64>,
    pub engagement_rate: Option<f64>,
}

impl SourceProfile {
    /// Converts the profile into an unverified record with provenance for
    /// every field it carries.
    pub fn into_record(self) -> CandidateRecord {
        let source = self.source;
        let mut record = CandidateRecord::new(self.key);
        record.sources.insert(source);

        if let Some(name) = self.name {
            record.name = Some(name);
            record.attribute(RecordField::Name, source);
        }
        if let Some(url) = self.profile_url {
            record.profile_url = Some(url);
            record.attribute(RecordField::ProfileUrl, source);
        }
        if let Some(email) = self.email {
            record.email = Some(email);
            record.attribute(RecordField::Email, source);
        }
        if let Some(phone) = self.phone {
            record.phone = Some(phone);
            record.attribute(RecordField::Phone, source);
        }
        if let Some(followers) = self.followers {
            record.followers = Some(followers);
            record.attribute(RecordField::Followers, source);
        }
        if let Some(rate) = self.engagement_rate {
            record.engagement_rate = Some(rate);
            record.attribute(RecordField::EngagementRate, source);
        }

        record
    }
}

/// Validated payload of one gateway call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceResult {
    pub profiles: Vec<SourceProfile>,
    /// Profiles dropped because they failed validation.
    pub rejected: usize,
}

/// Loosely-typed profile as providers send it.
#[derive(Debug, Deserialize)]
struct RawProfile {
    #[serde(default, alias = "full_name", alias = "display_name")]
    name: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default, alias = "username", alias = "user")]
    handle: Option<String>,
    #[serde(default, alias = "profile_url", alias = "link")]
    url: Option<String>,
    #[serde(default, alias = "business_email", alias = "contact_email")]
    email: Option<String>,
    #[serde(default, alias = "phone_number")]
    phone: Option<String>,
    #[serde(default, alias = "follower_count", alias = "subscribers")]
    followers: Option<Value>,
    #[serde(default, alias = "engagement")]
    engagement_rate: Option<Value>,
}

/// Parse and validate a provider payload.
///
/// `default_platform` is used when a profile omits its platform, which
/// search providers commonly do for platform-scoped queries.
pub fn parse_profiles(
    source: SourceKind,
    default_platform: Platform,
    raw: &Value,
) -> Result<SourceResult, SourceError> {
    let items = match raw {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("results") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) => return Ok(SourceResult::default()),
            Some(_) => {
                return Err(SourceError::Malformed(
                    "`results` is not an array".to_string(),
                ))
            }
            None => {
                return Err(SourceError::Malformed(
                    "payload has no `results` field".to_string(),
                ))
            }
        },
        other => {
            return Err(SourceError::Malformed(format!(
                "expected an object or array, got {}",
                json_type(other)
            )))
        }
    };

    let mut result = SourceResult::default();
    for item in items {
        match validate_profile(source, default_platform, item) {
            Some(profile) => result.profiles.push(profile),
            None => result.rejected += 1,
        }
    }

    Ok(result)
}

fn validate_profile(
    source: SourceKind,
    default_platform: Platform,
    item: &Value,
) -> Option<SourceProfile> {
    let raw: RawProfile = serde_json::from_value(item.clone()).ok()?;

    let platform = match raw.platform.as_deref().map(str::trim) {
        Some(p) if !p.is_empty() => p.parse::<Platform>().ok()?,
        _ => default_platform,
    };

    let handle_source = raw.handle.as_deref().or(raw.url.as_deref())?;
    let key = IdentityKey::new(platform, handle_source)?;

    let followers = match raw.followers {
        None | Some(Value::Null) => None,
        Some(ref v) => Some(parse_count(v)?),
    };

    let engagement_rate = match raw.engagement_rate {
        None | Some(Value::Null) => None,
        Some(ref v) => {
            let rate = parse_number(v)?;
            if !(0.0..=100.0).contains(&rate) {
                return None;
            }
            Some(rate)
        }
    };

    Some(SourceProfile {
        source,
        key,
        name: non_empty(raw.name),
        profile_url: non_empty(raw.url),
        email: non_empty(raw.email).filter(|e| e.contains('@')),
        phone: non_empty(raw.phone),
        followers,
        engagement_rate,
    })
}

/// Accepts integers and numeric strings such as `"12,400"` or `"12.4k"`.
fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',' && *c != '_').collect();
            let lower = cleaned.to_lowercase();
            let (digits, scale) = match lower.chars().last()? {
                'k' => (&lower[..lower.len() - 1], 1_000.0),
                'm' => (&lower[..lower.len() - 1], 1_000_000.0),
                _ => (lower.as_str(), 1.0),
            };
            let parsed: f64 = digits.parse().ok()?;
            if parsed < 0.0 || !parsed.is_finite() {
                return None;
            }
            Some((parsed * scale).round() as u64)
        }
        _ => None,
    }
}

/// Accepts numbers and numeric strings, with an optional `%` suffix.
fn parse_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
