//! Markdown and JSON rendering of a [`PipelineReport`].

use super::{ConversationSummary, PipelineReport, ReportMetadata};
use crate::models::NodeName;
use crate::worker::StatsSnapshot;
use anyhow::{Context, Result};
use std::path::Path;

/// How many entities the Markdown report lists.
const TOP_ENTITIES: usize = 25;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &PipelineReport) -> String {
    let mut output = String::new();

    output.push_str("# Exchange Lens Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_stats_section(&report.stats, report.queue.pending));
    output.push_str(&generate_conversations_section(&report.conversations));
    output.push_str(&generate_entities_section(report));
    output.push_str(&generate_warnings_section(report));
    output.push_str(&generate_footer());

    output
}

fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Input:** `{}`\n", metadata.input));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Analyzer:** `{}`\n", metadata.analyzer));
    section.push_str(&format!("- **Workers:** {}\n", metadata.workers));
    section.push_str(&format!(
        "- **ANCHOR stability threshold:** {:.2}\n",
        metadata.stability_threshold
    ));
    section.push_str(&format!(
        "- **Exchanges submitted:** {}\n",
        metadata.exchanges_submitted
    ));
    section.push_str(&format!(
        "- **Duration:** {:.1}s\n\n",
        metadata.duration_seconds
    ));

    section
}

fn generate_stats_section(stats: &StatsSnapshot, pending: usize) -> String {
    let mut section = String::new();

    section.push_str("## Pipeline\n\n");
    section.push_str("| Processed | Skipped (already committed) | Substituted nodes | Commit retries | Requeued | Dead-lettered |\n");
    section.push_str("|:---:|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | {} | {} | {} |\n\n",
        stats.processed,
        stats.skipped,
        stats.analyzer_substitutions,
        stats.commit_retries,
        stats.requeued,
        stats.dead_lettered
    ));
    if pending > 0 {
        section.push_str(&format!("{} job(s) were still pending.\n\n", pending));
    }

    section
}

fn generate_conversations_section(conversations: &[ConversationSummary]) -> String {
    let mut section = String::new();

    section.push_str("## Conversations\n\n");
    if conversations.is_empty() {
        section.push_str("No exchanges were committed.\n\n");
        return section;
    }

    section.push_str("| Conversation | Exchanges |");
    for node in NodeName::ALL {
        section.push_str(&format!(" {} |", node));
    }
    section.push('\n');
    section.push_str("|:---|:---:|");
    section.push_str(&":---:|".repeat(NodeName::ALL.len()));
    section.push('\n');

    for conversation in conversations {
        section.push_str(&format!(
            "| `{}` | {} |",
            conversation.conversation_id, conversation.exchange_count
        ));
        for node in NodeName::ALL {
            match conversation.nodes.iter().find(|n| n.node == node) {
                Some(average) => section.push_str(&format!(" {:.2} |", average.avg)),
                None => section.push_str(" - |"),
            }
        }
        section.push('\n');
    }
    section.push('\n');

    section
}

fn generate_entities_section(report: &PipelineReport) -> String {
    let mut section = String::new();

    section.push_str("## Entities\n\n");
    let top = report.top_entities(TOP_ENTITIES);
    if top.is_empty() {
        section.push_str("No entities were extracted.\n\n");
        return section;
    }

    section.push_str("| Entity | Type | Exchange | Seen by | Confidence |\n");
    section.push_str("|:---|:---|:---|:---|:---:|\n");
    for record in top {
        let entity = &record.entity;
        let seen_by: Vec<String> = entity
            .seen_by
            .iter()
            .map(|(node, strength)| format!("{} ({:.2})", node, strength))
            .collect();
        section.push_str(&format!(
            "| {} | {} | `{}` | {} | {:.2} |\n",
            entity.display_name,
            entity.entity_key.entity_type,
            record.exchange_id,
            seen_by.join(", "),
            entity.confidence
        ));
    }
    if report.entities.len() > TOP_ENTITIES {
        section.push_str(&format!(
            "\n*{} more not shown.*\n",
            report.entities.len() - TOP_ENTITIES
        ));
    }
    section.push_str(&format!(
        "\n{} relationship(s) recorded.\n\n",
        report.relationships.len()
    ));

    section
}

fn generate_warnings_section(report: &PipelineReport) -> String {
    if report.substitutions.is_empty()
        && report.unstable_anchors.is_empty()
        && report.dead_letters.is_empty()
    {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Warnings\n\n");

    if !report.dead_letters.is_empty() {
        section.push_str("### ⛔ Dead-lettered exchanges\n\n");
        for dead in &report.dead_letters {
            section.push_str(&format!(
                "- `{}` after {} deliveries: {}\n",
                dead.job.exchange.exchange_id, dead.deliveries, dead.reason
            ));
        }
        section.push('\n');
    }

    if !report.unstable_anchors.is_empty() {
        section.push_str("### ⚠️ Unstable ANCHOR\n\n");
        for unstable in &report.unstable_anchors {
            section.push_str(&format!(
                "- `{}` (ANCHOR strength {:.2})\n",
                unstable.exchange_id, unstable.anchor_strength
            ));
        }
        section.push('\n');
    }

    if !report.substitutions.is_empty() {
        section.push_str("### Substituted node results\n\n");
        for sub in &report.substitutions {
            section.push_str(&format!(
                "- `{}` {}: {}\n",
                sub.exchange_id, sub.node, sub.reason
            ));
        }
        section.push('\n');
    }

    section
}

fn generate_footer() -> String {
    "---\n\n*Report generated by exchange-lens*\n".to_string()
}

/// Generate a JSON report.
pub fn generate_json_report(report: &PipelineReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Render `content` to `path`.
pub fn write_report(content: &str, path: &Path) -> Result<()> {
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::sample_report;

    #[test]
    fn test_generate_markdown_report() {
        let report = sample_report();
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# Exchange Lens Report"));
        assert!(markdown.contains("## Metadata"));
        assert!(markdown.contains("## Conversations"));
        assert!(markdown.contains("`C123`"));
        assert!(markdown.contains("Grandmother"));
        assert!(markdown.contains("ECHO (0.50)"));
        assert!(markdown.contains("Unstable ANCHOR"));
        assert!(markdown.contains("GLYPH"));
    }

    #[test]
    fn test_empty_sections() {
        let mut report = sample_report();
        report.conversations.clear();
        report.entities.clear();
        report.substitutions.clear();
        report.unstable_anchors.clear();

        let markdown = generate_markdown_report(&report);
        assert!(markdown.contains("No exchanges were committed."));
        assert!(markdown.contains("No entities were extracted."));
        assert!(!markdown.contains("## Warnings"));
    }

    #[test]
    fn test_generate_json_report() {
        let report = sample_report();
        let json = generate_json_report(&report).unwrap();

        assert!(json.contains("\"conversations\""));
        assert!(json.contains("\"seen_by\""));
        assert!(json.contains("\"ECHO\""));
        assert!(json.contains("\"analyzer_substitutions\""));
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");

        write_report("# hello\n", &path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# hello\n");
    }
}
