//! Candidate aggregation and statistics.
//!
//! This module provides utilities for grouping candidate records and
//! computing the summary figures used in reports.

use crate::models::{CandidateRecord, Confidence, Platform, SourceKind};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// Headline figures for a set of candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordSummary {
    pub total: usize,
    pub verified: usize,
    pub partially_verified: usize,
    pub unverified: usize,
    pub flagged: usize,
    pub with_discrepancies: usize,
    pub by_platform: BTreeMap<Platform, usize>,
    pub by_source: BTreeMap<SourceKind, usize>,
}

impl RecordSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CandidateRecord>) -> Self {
        let mut summary = Self::default();

        for record in records {
            summary.total += 1;
            match record.confidence {
                Confidence::Verified => summary.verified += 1,
                Confidence::PartiallyVerified => summary.partially_verified += 1,
                Confidence::Unverified => summary.unverified += 1,
            }
            if record.flagged {
                summary.flagged += 1;
            }
            if record.has_discrepancy() {
                summary.with_discrepancies += 1;
            }
            *summary.by_platform.entry(record.key.platform).or_default() += 1;
            for source in &record.sources {
                *summary.by_source.entry(*source).or_default() += 1;
            }
        }

        summary
    }

    pub fn count(&self, tier: Confidence) -> usize {
        match tier {
            Confidence::Verified => self.verified,
            Confidence::PartiallyVerified => self.partially_verified,
            Confidence::Unverified => self.unverified,
        }
    }
}

/// Sort by follower count (highest first, unknown last), then identity key.
pub fn sort_by_reach(records: &mut [CandidateRecord]) {
    records.sort_by(|a, b| {
        Reverse(a.followers)
            .cmp(&Reverse(b.followers))
            .then_with(|| a.key.cmp(&b.key))
    });
}

/// Group records by confidence tier, each group sorted by reach.
pub fn group_by_confidence<'a>(
    records: impl IntoIterator<Item = &'a CandidateRecord>,
) -> BTreeMap<Confidence, Vec<CandidateRecord>> {
    let mut grouped: BTreeMap<Confidence, Vec<CandidateRecord>> = BTreeMap::new();

    for record in records {
        grouped.entry(record.confidence).or_default().push(record.clone());
    }

    for group in grouped.values_mut() {
        sort_by_reach(group);
    }

    grouped
}

/// Count candidates per platform.
pub fn platform_distribution(records: &[CandidateRecord]) -> BTreeMap<Platform, usize> {
    let mut dist = BTreeMap::new();

    for record in records {
        *dist.entry(record.key.platform).or_default() += 1;
    }

    dist
}

/// Median of the known follower counts. Even-sized sets average the two
/// middle values, rounding down.
pub fn median_followers(records: &[CandidateRecord]) -> Option<u64> {
    let mut counts: Vec<u64> = records.iter().filter_map(|r| r.followers).collect();
    if counts.is_empty() {
        return None;
    }
    counts.sort_unstable();

    let mid = counts.len() / 2;
    if counts.len() % 2 == 0 {
        Some(((counts[mid - 1] as u128 + counts[mid] as u128) / 2) as u64)
    } else {
        Some(counts[mid])
    }
}

/// Platforms ordered by candidate count (most first), ties by platform.
pub fn top_platforms(records: &[CandidateRecord]) -> Vec<(Platform, usize)> {
    let mut platforms: Vec<_> = platform_distribution(records).into_iter().collect();
    platforms.sort_by_key(|(platform, count)| (Reverse(*count), *platform));
    platforms
}

/// Deterministic one-paragraph description of a tier.
pub fn tier_narrative(tier: Confidence, records: &[CandidateRecord]) -> String {
    let label = tier.to_string().to_lowercase();
    if records.is_empty() {
        return format!("No {} candidates.", label);
    }

    let noun = if records.len() == 1 { "candidate" } else { "candidates" };
    let platforms: Vec<String> = top_platforms(records)
        .into_iter()
        .map(|(platform, count)| format!("{} ({})", platform, count))
        .collect();

    let mut text = format!("{} {} {} across {}.", records.len(), label, noun, platforms.join(", "));

    match median_followers(records) {
        Some(median) => text.push_str(&format!(" Median followers: {}.", format_count(median))),
        None => text.push_str(" No follower counts reported."),
    }

    let flagged = records.iter().filter(|r| r.flagged).count();
    if flagged > 0 {
        text.push_str(&format!(" {} flagged for lack of independent confirmation.", flagged));
    }

    let conflicting = records.iter().filter(|r| r.has_discrepancy()).count();
    if conflicting > 0 {
        text.push_str(&format!(" {} with conflicting source data.", conflicting));
    }

    text
}

/// `1234567` as `1,234,567`.
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
