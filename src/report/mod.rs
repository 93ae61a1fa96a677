//! Run reports.
//!
//! A [`PipelineReport`] is assembled from store snapshots after the
//! worker pool has drained, then rendered as Markdown or JSON.

mod generator;

pub use generator::{generate_json_report, generate_markdown_report, write_report};

use crate::models::{ConversationAggregate, NodeName};
use crate::queue::{DeadLetter, QueueStats};
use crate::store::{EntityRecord, GraphSnapshot, RelationshipRecord, TimeSeriesSnapshot};
use crate::worker::StatsSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run-level facts shown at the top of a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    pub analyzer: String,
    pub input: String,
    pub workers: usize,
    pub stability_threshold: f64,
    pub exchanges_submitted: usize,
    pub duration_seconds: f64,
}

/// Average strength of one node within a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAverage {
    pub node: NodeName,
    pub count: u64,
    pub avg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub exchange_count: u64,
    pub last_updated: DateTime<Utc>,
    /// Canonical node order.
    pub nodes: Vec<NodeAverage>,
}

impl From<&ConversationAggregate> for ConversationSummary {
    fn from(aggregate: &ConversationAggregate) -> Self {
        let nodes = NodeName::ALL
            .iter()
            .filter_map(|node| {
                aggregate.node(*node).map(|stats| NodeAverage {
                    node: *node,
                    count: stats.count,
                    avg: stats.avg,
                })
            })
            .collect();

        Self {
            conversation_id: aggregate.conversation_id.clone(),
            exchange_count: aggregate.exchange_count,
            last_updated: aggregate.last_updated,
            nodes,
        }
    }
}

/// A node result that was replaced by a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Substitution {
    pub exchange_id: String,
    pub node: NodeName,
    pub reason: String,
}

/// Exchange whose GATEWAY result ran without a stable ANCHOR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnstableAnchor {
    pub exchange_id: String,
    pub anchor_strength: f64,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub metadata: ReportMetadata,
    pub stats: StatsSnapshot,
    pub queue: QueueStats,
    pub conversations: Vec<ConversationSummary>,
    pub entities: Vec<EntityRecord>,
    pub relationships: Vec<RelationshipRecord>,
    pub substitutions: Vec<Substitution>,
    pub unstable_anchors: Vec<UnstableAnchor>,
    pub dead_letters: Vec<DeadLetter>,
}

impl PipelineReport {
    pub fn build(
        metadata: ReportMetadata,
        stats: StatsSnapshot,
        queue: QueueStats,
        graph: GraphSnapshot,
        series: TimeSeriesSnapshot,
        dead_letters: Vec<DeadLetter>,
    ) -> Self {
        let substitutions = graph
            .node_results
            .iter()
            .filter_map(|r| {
                r.failure.as_ref().map(|reason| Substitution {
                    exchange_id: r.exchange_id.clone(),
                    node: r.node_name,
                    reason: reason.clone(),
                })
            })
            .collect();

        let unstable_anchors = graph
            .node_results
            .iter()
            .filter(|r| r.node_name == NodeName::Gateway && r.anchor_stable == Some(false))
            .map(|gateway| UnstableAnchor {
                exchange_id: gateway.exchange_id.clone(),
                anchor_strength: graph
                    .node_results
                    .iter()
                    .find(|r| {
                        r.exchange_id == gateway.exchange_id && r.node_name == NodeName::Anchor
                    })
                    .map_or(0.0, |anchor| anchor.strength),
            })
            .collect();

        let conversations = series
            .aggregates
            .iter()
            .map(ConversationSummary::from)
            .collect();

        Self {
            metadata,
            stats,
            queue,
            conversations,
            entities: graph.entities,
            relationships: graph.relationships,
            substitutions,
            unstable_anchors,
            dead_letters,
        }
    }

    /// Entities ordered by how many lenses saw them, most first.
    pub fn top_entities(&self, limit: usize) -> Vec<&EntityRecord> {
        let mut entities: Vec<&EntityRecord> = self.entities.iter().collect();
        entities.sort_by(|a, b| {
            b.entity
                .seen_by
                .len()
                .cmp(&a.entity.seen_by.len())
                .then_with(|| b.entity.confidence.total_cmp(&a.entity.confidence))
                .then_with(|| a.entity.entity_key.cmp(&b.entity.entity_key))
        });
        entities.truncate(limit);
        entities
    }
}
