//! Markdown and JSON report generation.
//!
//! This module renders an assembled [`Report`] into the output artifact.

use super::{Completeness, Report, ReportMetadata, StageSummary, TierSection};
use crate::analysis::{format_count, RecordSummary};
use crate::cli::OutputFormat;
use crate::models::{CandidateRecord, Confidence};
use crate::pipeline::state::StageState;
use anyhow::Result;

/// Render `report` in `format`.
pub fn render(report: &Report, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Markdown => Ok(generate_markdown_report(report)),
        OutputFormat::Json => generate_json_report(report),
    }
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    // Title
    output.push_str("# YoScout Report\n\n");

    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_table_of_contents(report));
    output.push_str(&generate_summary_section(&report.summary, &report.stages));

    for tier in &report.tiers {
        output.push_str(&generate_tier_section(tier));
    }

    output.push_str(&generate_completeness_section(&report.completeness));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();
    let query = &metadata.query;

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Topic:** {}\n", query.topic));
    if let Some(ref niche) = query.niche {
        section.push_str(&format!("- **Niche:** {}\n", niche));
    }
    if let Some(ref region) = query.region {
        section.push_str(&format!("- **Region:** {}\n", region));
    }
    let platforms: Vec<String> = query.platforms_in_scope().iter().map(|p| p.to_string()).collect();
    section.push_str(&format!("- **Platforms:** {}\n", platforms.join(", ")));
    section.push_str(&format!(
        "- **Status:** {} {}\n",
        metadata.status.emoji(),
        metadata.status
    ));
    let sources: Vec<&str> = metadata.sources.iter().map(|s| s.as_str()).collect();
    section.push_str(&format!("- **Sources:** {}\n", sources.join(", ")));
    match metadata.model {
        Some(ref model) => section.push_str(&format!("- **Model Used:** `{}`\n", model)),
        None => section.push_str("- **Model Used:** none (model checks disabled)\n"),
    }
    section.push_str(&format!(
        "- **Run Started:** {}\n",
        metadata.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Run Duration:** {:.1}s\n", metadata.duration_seconds));
    section.push('\n');

    section
}

/// Generate the table of contents.
fn generate_table_of_contents(report: &Report) -> String {
    let mut toc = String::new();

    toc.push_str("## Table of Contents\n\n");
    toc.push_str("- [Metadata](#metadata)\n");
    toc.push_str("- [Summary](#summary)\n");

    for tier in &report.tiers {
        toc.push_str(&format!(
            "- [{} ({})](#{})\n",
            tier.confidence,
            tier.records.len(),
            tier_anchor(tier.confidence)
        ));
    }

    toc.push_str("- [Completeness](#completeness)\n\n");

    toc
}

/// Generate the summary section.
fn generate_summary_section(summary: &RecordSummary, stages: &[StageSummary]) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");

    // Tier breakdown
    section.push_str("### Candidates by Confidence\n\n");
    section.push_str(&format!(
        "| {} Verified | {} Partially verified | {} Unverified | **Total** |\n",
        Confidence::Verified.emoji(),
        Confidence::PartiallyVerified.emoji(),
        Confidence::Unverified.emoji(),
    ));
    section.push_str("|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | **{}** |\n\n",
        summary.verified, summary.partially_verified, summary.unverified, summary.total
    ));

    if summary.flagged > 0 || summary.with_discrepancies > 0 {
        section.push_str(&format!(
            "*Flagged: {} | With conflicting source data: {}*\n\n",
            summary.flagged, summary.with_discrepancies
        ));
    }

    // Platform distribution
    if !summary.by_platform.is_empty() {
        section.push_str("### Candidates by Platform\n\n");
        section.push_str("| Platform | Candidates |\n");
        section.push_str("|:---|:---:|\n");

        let mut platforms: Vec<_> = summary.by_platform.iter().collect();
        platforms.sort_by_key(|(platform, count)| (std::cmp::Reverse(**count), **platform));

        for (platform, count) in platforms {
            section.push_str(&format!("| {} | {} |\n", platform, count));
        }
        section.push('\n');
    }

    // Source coverage
    if !summary.by_source.is_empty() {
        section.push_str("### Candidates by Source\n\n");
        section.push_str("| Source | Candidates |\n");
        section.push_str("|:---|:---:|\n");
        for (source, count) in &summary.by_source {
            section.push_str(&format!("| `{}` | {} |\n", source, count));
        }
        section.push('\n');
    }

    // Stage outcomes
    section.push_str("### Pipeline Stages\n\n");
    section.push_str("| Stage | Outcome | Attempts |\n");
    section.push_str("|:---|:---|:---:|\n");
    for stage in stages {
        section.push_str(&format!(
            "| {} | {} | {} |\n",
            stage.stage,
            stage_state_label(stage.state),
            stage.attempts
        ));
    }
    section.push('\n');

    section
}

/// Generate the section for one confidence tier.
fn generate_tier_section(tier: &TierSection) -> String {
    let mut section = String::new();

    section.push_str(&format!(
        "## {} {} {{#{}}}\n\n",
        tier.confidence.emoji(),
        tier.confidence,
        tier_anchor(tier.confidence)
    ));
    section.push_str(&tier.narrative);
    section.push_str("\n\n");

    if tier.records.is_empty() {
        return section;
    }

    section.push_str(
        "| Handle | Platform | Name | Followers | Engagement | Contact | Sources | Notes |\n",
    );
    section.push_str("|:---|:---|:---|---:|---:|:---|:---|:---|\n");
    for record in &tier.records {
        section.push_str(&generate_record_row(record));
    }
    section.push('\n');

    section
}

/// Generate a single table row.
fn generate_record_row(record: &CandidateRecord) -> String {
    let handle = match record.profile_url {
        Some(ref url) => format!("[@{}]({})", record.key.handle, url),
        None => format!("@{}", record.key.handle),
    };
    let handle = if record.flagged {
        format!("⚑ {}", handle)
    } else {
        handle
    };

    let followers = record.followers.map(format_count).unwrap_or_else(|| "-".to_string());
    let engagement = record
        .engagement_rate
        .map(|r| format!("{:.2}%", r))
        .unwrap_or_else(|| "-".to_string());

    let contact: Vec<&str> = [record.email.as_deref(), record.phone.as_deref()]
        .into_iter()
        .flatten()
        .collect();
    let contact = if contact.is_empty() {
        "-".to_string()
    } else {
        contact.join("<br>")
    };

    let sources: Vec<&str> = record.sources.iter().map(|s| s.as_str()).collect();
    let notes = if record.notes.is_empty() {
        "-".to_string()
    } else {
        record.notes.join("<br>")
    };

    format!(
        "| {} | {} | {} | {} | {} | {} | {} | {} |\n",
        escape_cell(&handle),
        record.key.platform,
        escape_cell(record.name.as_deref().unwrap_or("-")),
        followers,
        engagement,
        escape_cell(&contact),
        sources.join(", "),
        escape_cell(&notes)
    )
}

/// Generate the completeness section.
fn generate_completeness_section(completeness: &Completeness) -> String {
    let mut section = String::new();

    section.push_str("## Completeness\n\n");

    if completeness.complete {
        section.push_str("All sources and checks completed without unresolved errors. ✅\n\n");
        return section;
    }

    section.push_str(
        "Some data could not be collected or checked. \
         The findings above are partial where noted below.\n\n",
    );

    if !completeness.by_source.is_empty() {
        section.push_str("### By Source\n\n");
        for (source, problems) in &completeness.by_source {
            section.push_str(&format!("**`{}`**\n\n", source));
            for problem in problems {
                section.push_str(&format!("- {}\n", problem));
            }
            section.push('\n');
        }
    }

    if !completeness.by_candidate.is_empty() {
        section.push_str("### By Candidate\n\n");
        for (candidate, problems) in &completeness.by_candidate {
            section.push_str(&format!("**{}**\n\n", candidate));
            for problem in problems {
                section.push_str(&format!("- {}\n", problem));
            }
            section.push('\n');
        }
    }

    if !completeness.run.is_empty() {
        section.push_str("### Run\n\n");
        for problem in &completeness.run {
            section.push_str(&format!("- {}\n", problem));
        }
        section.push('\n');
    }

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str("*Report generated by YoScout*\n");

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

fn tier_anchor(tier: Confidence) -> String {
    tier.to_string().to_lowercase().replace(' ', "-")
}

fn stage_state_label(state: StageState) -> String {
    match state {
        StageState::NotStarted => "skipped".to_string(),
        StageState::Running => "running".to_string(),
        StageState::Finished(outcome) => outcome.to_string(),
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}
