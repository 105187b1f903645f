//! Data models for the research pipeline.
//!
//! This module contains the core data structures shared by every stage:
//! the immutable [`Query`], candidate identity and confidence, and the
//! [`CandidateRecord`] merge rules.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Social platform a candidate publishes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    TikTok,
    YouTube,
    Twitter,
    Facebook,
    LinkedIn,
    Twitch,
}

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::Instagram,
        Platform::TikTok,
        Platform::YouTube,
        Platform::Twitter,
        Platform::Facebook,
        Platform::LinkedIn,
        Platform::Twitch,
    ];

    /// Stable lowercase identifier used in keys and wire formats.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::TikTok => "tiktok",
            Platform::YouTube => "youtube",
            Platform::Twitter => "twitter",
            Platform::Facebook => "facebook",
            Platform::LinkedIn => "linkedin",
            Platform::Twitch => "twitch",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Instagram => write!(f, "Instagram"),
            Platform::TikTok => write!(f, "TikTok"),
            Platform::YouTube => write!(f, "YouTube"),
            Platform::Twitter => write!(f, "Twitter/X"),
            Platform::Facebook => write!(f, "Facebook"),
            Platform::LinkedIn => write!(f, "LinkedIn"),
            Platform::Twitch => write!(f, "Twitch"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "instagram" | "ig" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::TikTok),
            "youtube" | "yt" => Ok(Platform::YouTube),
            "twitter" | "x" => Ok(Platform::Twitter),
            "facebook" | "fb" => Ok(Platform::Facebook),
            "linkedin" => Ok(Platform::LinkedIn),
            "twitch" => Ok(Platform::Twitch),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

/// Category of external data provider.
///
/// The declaration order is significant: when two providers report the
/// same field during research, the earlier kind is the "first reporter".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    WebSearch,
    SocialProfile,
    ScrapingProxy,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::WebSearch,
        SourceKind::SocialProfile,
        SourceKind::ScrapingProxy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::WebSearch => "web_search",
            SourceKind::SocialProfile => "social_profile",
            SourceKind::ScrapingProxy => "scraping_proxy",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "web_search" | "web" | "search" => Ok(SourceKind::WebSearch),
            "social_profile" | "social" | "profile" => Ok(SourceKind::SocialProfile),
            "scraping_proxy" | "scraper" | "proxy" => Ok(SourceKind::ScrapingProxy),
            other => Err(format!("unknown source kind: {}", other)),
        }
    }
}

/// Data-quality tier of a candidate. Ordered so that `max` never regresses.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    #[default]
    Unverified,
    PartiallyVerified,
    Verified,
}

impl Confidence {
    /// Tiers from most to least trustworthy, the order reports use.
    pub const TIERS: [Confidence; 3] = [
        Confidence::Verified,
        Confidence::PartiallyVerified,
        Confidence::Unverified,
    ];

    /// One level up; `Verified` stays `Verified`.
    pub fn promoted(self) -> Self {
        match self {
            Confidence::Unverified => Confidence::PartiallyVerified,
            Confidence::PartiallyVerified | Confidence::Verified => Confidence::Verified,
        }
    }

    /// Returns an emoji representation of the tier.
    pub fn emoji(&self) -> &'static str {
        match self {
            Confidence::Verified => "🟢",
            Confidence::PartiallyVerified => "🟡",
            Confidence::Unverified => "⚪",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Unverified => write!(f, "Unverified"),
            Confidence::PartiallyVerified => write!(f, "Partially verified"),
            Confidence::Verified => write!(f, "Verified"),
        }
    }
}

/// The immutable research request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Free-text research topic.
    pub topic: String,
    /// Optional narrower niche within the topic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub niche: Option<String>,
    /// Optional geographic region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Platforms in scope. Empty means every supported platform.
    #[serde(default)]
    pub platforms: BTreeSet<Platform>,
}

impl Query {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            niche: None,
            region: None,
            platforms: BTreeSet::new(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_niche(mut self, niche: impl Into<String>) -> Self {
        self.niche = Some(niche.into());
        self
    }

    pub fn with_platforms(mut self, platforms: impl IntoIterator<Item = Platform>) -> Self {
        self.platforms = platforms.into_iter().collect();
        self
    }

    /// The platforms research should cover.
    pub fn platforms_in_scope(&self) -> Vec<Platform> {
        if self.platforms.is_empty() {
            Platform::ALL.to_vec()
        } else {
            self.platforms.iter().copied().collect()
        }
    }

    /// One-line human description, e.g. `fitness (niche: yoga, region: Europe)`.
    pub fn describe(&self) -> String {
        let mut filters = Vec::new();
        if let Some(ref niche) = self.niche {
            filters.push(format!("niche: {}", niche));
        }
        if let Some(ref region) = self.region {
            filters.push(format!("region: {}", region));
        }
        if !self.platforms.is_empty() {
            let names: Vec<_> = self.platforms.iter().map(|p| p.as_str()).collect();
            filters.push(format!("platforms: {}", names.join(", ")));
        }

        if filters.is_empty() {
            self.topic.clone()
        } else {
            format!("{} ({})", self.topic, filters.join(", "))
        }
    }
}

/// Normalize a handle or profile URL into its canonical key form.
///
/// URLs, with or without a scheme, reduce to their last path segment.
/// Returns `None` when nothing usable remains.
pub fn normalize_handle(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();

    let last_segment = if looks_like_url(&compact) {
        let without_query = compact.split(['?', '#']).next().unwrap_or(&compact);
        let path = without_query.trim_end_matches('/');
        path.rsplit('/').next().unwrap_or(path)
    } else {
        compact.trim_end_matches('/')
    };

    let handle = last_segment.trim_start_matches('@').to_lowercase();
    if handle.is_empty() {
        None
    } else {
        Some(handle)
    }
}

/// A scheme, or a dotted host followed by a path, e.g. `instagram.com/anna`.
fn looks_like_url(value: &str) -> bool {
    if value.contains("://") {
        return true;
    }
    match value.split_once('/') {
        Some((host, _)) => host.contains('.') && !host.starts_with('@'),
        None => false,
    }
}

/// Unique identity of a candidate within one run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub platform: Platform,
    pub handle: String,
}

impl IdentityKey {
    /// Builds a key from a raw handle, normalizing it first.
    pub fn new(platform: Platform, raw_handle: &str) -> Option<Self> {
        normalize_handle(raw_handle).map(|handle| Self { platform, handle })
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:@{}", self.platform.as_str(), self.handle)
    }
}

/// Mergeable record fields, used as provenance keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    Name,
    ProfileUrl,
    Email,
    Phone,
    Followers,
    EngagementRate,
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordField::Name => "name",
            RecordField::ProfileUrl => "profile_url",
            RecordField::Email => "email",
            RecordField::Phone => "phone",
            RecordField::Followers => "followers",
            RecordField::EngagementRate => "engagement_rate",
        };
        f.write_str(name)
    }
}

/// How conflicting field values are resolved when two records merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Keep whichever value arrived first; fill only empty fields.
    FirstReporter,
    /// Take the incoming value when the existing one is empty or the
    /// incoming record is at least as confident.
    Confident,
}

/// One discovered entity under research.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Normalized identity key.
    pub key: IdentityKey,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Public profile URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    /// Business contact email.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Business contact phone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Provider-reported follower count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followers: Option<u64>,
    /// Provider-reported engagement rate, in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engagement_rate: Option<f64>,
    /// Which sources reported which field.
    pub provenance: BTreeMap<RecordField, BTreeSet<SourceKind>>,
    /// Every source that mentioned this candidate at all.
    pub sources: BTreeSet<SourceKind>,
    pub confidence: Confidence,
    /// Independent confirmations collected during verification.
    pub confirmations: u32,
    /// Set when verification found no confirmation at all.
    pub flagged: bool,
    /// Verification and merge notes, in arrival order.
    pub notes: Vec<String>,
}

impl CandidateRecord {
    /// Creates an empty, unverified record for a key.
    pub fn new(key: IdentityKey) -> Self {
        Self {
            key,
            name: None,
            profile_url: None,
            email: None,
            phone: None,
            followers: None,
            engagement_rate: None,
            provenance: BTreeMap::new(),
            sources: BTreeSet::new(),
            confidence: Confidence::Unverified,
            confirmations: 0,
            flagged: false,
            notes: Vec::new(),
        }
    }

    /// Appends a note unless an identical one is already recorded.
    pub fn add_note(&mut self, note: impl Into<String>) {
        let note = note.into();
        if !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }

    /// Records that `source` supplied `field`.
    pub fn attribute(&mut self, field: RecordField, source: SourceKind) {
        self.provenance.entry(field).or_default().insert(source);
        self.sources.insert(source);
    }

    fn field_sources(&self, field: RecordField) -> String {
        match self.provenance.get(&field) {
            Some(sources) if !sources.is_empty() => sources
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("+"),
            _ => "unknown".to_string(),
        }
    }

    /// Returns true if any note records a cross-source disagreement.
    pub fn has_discrepancy(&self) -> bool {
        self.notes.iter().any(|n| n.starts_with(DISCREPANCY_PREFIX))
    }

    /// Merge `incoming` into `self` under `policy`.
    ///
    /// Disagreeing values are never dropped silently: the losing value is
    /// recorded in a discrepancy note, and field provenance follows the value
    /// that was kept. Notes are de-duplicated, so merging the same record
    /// twice leaves the result unchanged.
    pub fn absorb(&mut self, incoming: &CandidateRecord, policy: MergePolicy) {
        debug_assert_eq!(self.key, incoming.key);

        let prefer_incoming = match policy {
            MergePolicy::FirstReporter => false,
            MergePolicy::Confident => incoming.confidence >= self.confidence,
        };

        let merges = [
            (
                RecordField::Name,
                merge_field(&mut self.name, &incoming.name, prefer_incoming, |a, b| {
                    a.trim().eq_ignore_ascii_case(b.trim())
                }),
            ),
            (
                RecordField::ProfileUrl,
                merge_field(&mut self.profile_url, &incoming.profile_url, prefer_incoming, |a, b| {
                    a.trim_end_matches('/').eq_ignore_ascii_case(b.trim_end_matches('/'))
                }),
            ),
            (
                RecordField::Email,
                merge_field(&mut self.email, &incoming.email, prefer_incoming, |a, b| {
                    a.trim().eq_ignore_ascii_case(b.trim())
                }),
            ),
            (
                RecordField::Phone,
                merge_field(&mut self.phone, &incoming.phone, prefer_incoming, |a, b| {
                    digits(a) == digits(b)
                }),
            ),
            (
                RecordField::Followers,
                merge_field(
                    &mut self.followers,
                    &incoming.followers,
                    prefer_incoming,
                    followers_agree,
                ),
            ),
            (
                RecordField::EngagementRate,
                merge_field(
                    &mut self.engagement_rate,
                    &incoming.engagement_rate,
                    prefer_incoming,
                    |a, b| (a - b).abs() < 0.05,
                ),
            ),
        ];

        for (field, merge) in merges {
            let theirs = incoming.provenance.get(&field).cloned().unwrap_or_default();
            match merge {
                FieldMerge::Untouched => {}
                FieldMerge::Agreed if !theirs.is_empty() => {
                    self.provenance.entry(field).or_default().extend(theirs);
                }
                FieldMerge::Agreed => {}
                FieldMerge::Filled => {
                    self.set_provenance(field, theirs);
                }
                FieldMerge::KeptExisting { kept, other } => {
                    if NOTED_FIELDS.contains(&field) {
                        let note = discrepancy_note(
                            field,
                            (&kept, &self.field_sources(field)),
                            (&other, &incoming.field_sources(field)),
                        );
                        self.add_note(note);
                    }
                }
                FieldMerge::TookIncoming { kept, other } => {
                    if NOTED_FIELDS.contains(&field) {
                        let note = discrepancy_note(
                            field,
                            (&kept, &incoming.field_sources(field)),
                            (&other, &self.field_sources(field)),
                        );
                        self.add_note(note);
                    }
                    self.set_provenance(field, theirs);
                }
            }
        }

        self.sources.extend(incoming.sources.iter().copied());

        for note in &incoming.notes {
            self.add_note(note.clone());
        }

        self.confidence = self.confidence.max(incoming.confidence);
        self.confirmations = self.confirmations.max(incoming.confirmations);
        self.flagged = if self.confidence > Confidence::Unverified {
            false
        } else {
            self.flagged || incoming.flagged
        };
    }

    fn set_provenance(&mut self, field: RecordField, sources: BTreeSet<SourceKind>) {
        if sources.is_empty() {
            self.provenance.remove(&field);
        } else {
            self.provenance.insert(field, sources);
        }
    }
}

/// Prefix of notes that record cross-source disagreement.
pub const DISCREPANCY_PREFIX: &str = "discrepancy";

/// Fields whose disagreements are worth a note. Names and URLs vary in
/// formatting too often to be meaningful.
const NOTED_FIELDS: [RecordField; 4] = [
    RecordField::Email,
    RecordField::Phone,
    RecordField::Followers,
    RecordField::EngagementRate,
];

/// `(value, sources)` pairs, kept value first.
fn discrepancy_note(field: RecordField, kept: (&str, &str), other: (&str, &str)) -> String {
    format!(
        "{} {}: {} ({}) vs {} ({})",
        DISCREPANCY_PREFIX, field, kept.0, kept.1, other.0, other.1
    )
}

/// What happened to one field during a merge.
#[derive(Debug, PartialEq)]
enum FieldMerge {
    /// Incoming had no value.
    Untouched,
    /// Existing was empty and took the incoming value.
    Filled,
    /// Both held equivalent values.
    Agreed,
    /// Values differed and the existing one stayed.
    KeptExisting { kept: String, other: String },
    /// Values differed and the incoming one replaced it.
    TookIncoming { kept: String, other: String },
}

fn merge_field<T, F>(
    existing: &mut Option<T>,
    incoming: &Option<T>,
    prefer_incoming: bool,
    same: F,
) -> FieldMerge
where
    T: Clone + fmt::Display,
    F: Fn(&T, &T) -> bool,
{
    match (existing.as_ref(), incoming.as_ref()) {
        (_, None) => FieldMerge::Untouched,
        (None, Some(new)) => {
            *existing = Some(new.clone());
            FieldMerge::Filled
        }
        (Some(old), Some(new)) if same(old, new) => FieldMerge::Agreed,
        (Some(old), Some(new)) => {
            let (old_s, new_s) = (old.to_string(), new.to_string());
            if prefer_incoming {
                *existing = Some(new.clone());
                FieldMerge::TookIncoming {
                    kept: new_s,
                    other: old_s,
                }
            } else {
                FieldMerge::KeptExisting {
                    kept: old_s,
                    other: new_s,
                }
            }
        }
    }
}

fn digits(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Follower counts within 1% of each other are considered the same reading.
fn followers_agree(a: &u64, b: &u64) -> bool {
    let (hi, lo) = if a >= b { (*a, *b) } else { (*b, *a) };
    (hi - lo) as f64 <= hi as f64 * 0.01
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(handle: &str, source: SourceKind) -> CandidateRecord {
        let mut r = CandidateRecord::new(IdentityKey::new(Platform::Instagram, handle).unwrap());
        r.sources.insert(source);
        r
    }

    #[test]
    fn test_confidence_ordering() {
        assert!(Confidence::Unverified < Confidence::PartiallyVerified);
        assert!(Confidence::PartiallyVerified < Confidence::Verified);
        assert_eq!(Confidence::Unverified.promoted(), Confidence::PartiallyVerified);
        assert_eq!(Confidence::Verified.promoted(), Confidence::Verified);
    }

    #[test]
    fn test_confidence_emoji() {
        assert_eq!(Confidence::Verified.emoji(), "🟢");
        assert_eq!(Confidence::PartiallyVerified.emoji(), "🟡");
        assert_eq!(Confidence::Unverified.emoji(), "⚪");
    }

    #[test]
    fn test_platform_from_str() {
        assert_eq!("Instagram".parse::<Platform>(), Ok(Platform::Instagram));
        assert_eq!("X".parse::<Platform>(), Ok(Platform::Twitter));
        assert_eq!(" yt ".parse::<Platform>(), Ok(Platform::YouTube));
        assert!("myspace".parse::<Platform>().is_err());
    }

    #[test]
    fn test_source_kind_from_str() {
        assert_eq!("web-search".parse::<SourceKind>(), Ok(SourceKind::WebSearch));
        assert_eq!("SOCIAL_PROFILE".parse::<SourceKind>(), Ok(SourceKind::SocialProfile));
        assert!("carrier-pigeon".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_schemeless_profile_urls_share_one_key() {
        let plain = IdentityKey::new(Platform::Instagram, "anna").unwrap();
        for raw in [
            "instagram.com/anna",
            "www.instagram.com/Anna/",
            "instagram.com/anna/?hl=en",
            "https://instagram.com/anna/?hl=en",
            "www.tiktok.com/@Anna",
        ] {
            assert_eq!(IdentityKey::new(Platform::Instagram, raw), Some(plain.clone()), "{}", raw);
        }
    }

    #[test]
    fn test_normalize_handle() {
        assert_eq!(normalize_handle("  @FitWith Anna "), Some("fitwithanna".to_string()));
        assert_eq!(
            normalize_handle("https://www.instagram.com/FitWithAnna/"),
            Some("fitwithanna".to_string())
        );
        assert_eq!(
            normalize_handle("https://tiktok.com/@Coach.Max?lang=en"),
            Some("coach.max".to_string())
        );
        assert_eq!(normalize_handle(" @ "), None);
        assert_eq!(normalize_handle("coach.max"), Some("coach.max".to_string()));
        assert_eq!(normalize_handle(""), None);
    }

    #[test]
    fn test_identity_keys_collapse_case_and_whitespace() {
        let a = IdentityKey::new(Platform::TikTok, "@Coach_Max").unwrap();
        let b = IdentityKey::new(Platform::TikTok, " coach_max").unwrap();
        let c = IdentityKey::new(Platform::YouTube, "coach_max").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "tiktok:@coach_max");
    }

    #[test]
    fn test_query_describe_and_scope() {
        let q = Query::new("fitness").with_region("Europe");
        assert_eq!(q.describe(), "fitness (region: Europe)");
        assert_eq!(q.platforms_in_scope().len(), Platform::ALL.len());

        let q = q.with_platforms([Platform::TikTok]);
        assert_eq!(q.platforms_in_scope(), vec![Platform::TikTok]);
    }

    #[test]
    fn test_first_reporter_keeps_existing_and_notes_conflict() {
        let mut first = record("anna", SourceKind::WebSearch);
        first.followers = Some(10_000);
        first.attribute(RecordField::Followers, SourceKind::WebSearch);

        let mut second = record("anna", SourceKind::SocialProfile);
        second.followers = Some(20_000);
        second.email = Some("anna@example.com".into());
        second.attribute(RecordField::Followers, SourceKind::SocialProfile);
        second.attribute(RecordField::Email, SourceKind::SocialProfile);

        first.absorb(&second, MergePolicy::FirstReporter);

        assert_eq!(first.followers, Some(10_000));
        assert_eq!(first.email.as_deref(), Some("anna@example.com"));
        assert!(first.has_discrepancy());
        assert!(first.notes[0].contains("10000 (web_search) vs 20000 (social_profile)"));
        assert_eq!(first.sources.len(), 2);
        assert_eq!(
            first.provenance[&RecordField::Followers],
            BTreeSet::from([SourceKind::WebSearch])
        );
        assert_eq!(
            first.provenance[&RecordField::Email],
            BTreeSet::from([SourceKind::SocialProfile])
        );
    }

    #[test]
    fn test_confident_merge_prefers_at_least_as_confident() {
        let mut existing = record("anna", SourceKind::WebSearch);
        existing.followers = Some(10_000);
        existing.confidence = Confidence::PartiallyVerified;

        let mut weaker = record("anna", SourceKind::SocialProfile);
        weaker.followers = Some(50_000);
        existing.absorb(&weaker, MergePolicy::Confident);
        assert_eq!(existing.followers, Some(10_000));
        assert_eq!(existing.confidence, Confidence::PartiallyVerified);

        let mut stronger = record("anna", SourceKind::SocialProfile);
        stronger.followers = Some(12_000);
        stronger.confidence = Confidence::Verified;
        existing.absorb(&stronger, MergePolicy::Confident);
        assert_eq!(existing.followers, Some(12_000));
        assert_eq!(existing.confidence, Confidence::Verified);
    }

    #[test]
    fn test_merge_never_lowers_confidence() {
        let mut existing = record("anna", SourceKind::WebSearch);
        existing.confidence = Confidence::Verified;
        existing.confirmations = 2;

        let incoming = record("anna", SourceKind::WebSearch);
        existing.absorb(&incoming, MergePolicy::Confident);

        assert_eq!(existing.confidence, Confidence::Verified);
        assert_eq!(existing.confirmations, 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut base = record("anna", SourceKind::WebSearch);
        base.followers = Some(10_000);
        base.add_note("seen in search");

        let mut incoming = record("anna", SourceKind::SocialProfile);
        incoming.followers = Some(30_000);
        incoming.phone = Some("+44 20 1234".into());
        incoming.add_note("profile exists");

        let mut once = base.clone();
        once.absorb(&incoming, MergePolicy::Confident);
        let mut twice = once.clone();
        twice.absorb(&incoming, MergePolicy::Confident);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_small_follower_drift_is_not_a_discrepancy() {
        let mut a = record("anna", SourceKind::WebSearch);
        a.followers = Some(100_000);
        let mut b = record("anna", SourceKind::SocialProfile);
        b.followers = Some(100_500);

        a.absorb(&b, MergePolicy::FirstReporter);
        assert!(!a.has_discrepancy());
    }

    #[test]
    fn test_flag_cleared_once_promoted() {
        let mut a = record("anna", SourceKind::WebSearch);
        a.flagged = true;
        let mut b = a.clone();
        b.flagged = false;
        b.confidence = Confidence::PartiallyVerified;

        a.absorb(&b, MergePolicy::Confident);
        assert!(!a.flagged);
    }
}
