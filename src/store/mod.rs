//! Persistence for analysis results.
//!
//! Exchange detail goes to a graph-like store (exchanges, node results,
//! canonical entities and relationships). Per-node strengths and the
//! running conversation aggregates go to a time-series-like store.
//! [`DualStoreWriter`] commits one exchange to both as a logical unit.

pub mod memory;

pub use memory::{InMemoryGraphStore, InMemoryTimeSeriesStore};

use crate::aggregate::{AggregateUpdater, ApplyOutcome};
use crate::error::{PipelineError, Result};
use crate::merger::MergedGraph;
use crate::models::{
    ConversationAggregate, Entity, Exchange, NodeName, NodeResult, Relationship,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Canonical entity as stored for one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub exchange_id: String,
    #[serde(flatten)]
    pub entity: Entity,
}

/// Canonical relationship as stored for one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub exchange_id: String,
    #[serde(flatten)]
    pub relationship: Relationship,
}

/// Time-series row for one `(exchange_id, node_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRow {
    pub exchange_id: String,
    pub conversation_id: String,
    pub node_name: NodeName,
    pub strength: f64,
    pub confidence: f64,
    pub failed: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate row plus the version used for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedAggregate {
    pub aggregate: ConversationAggregate,
    pub version: u64,
}

/// Everything the graph store holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub exchanges: Vec<Exchange>,
    pub node_results: Vec<NodeResult>,
    pub entities: Vec<EntityRecord>,
    pub relationships: Vec<RelationshipRecord>,
    pub committed: Vec<String>,
}

/// Everything the time-series store holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeSeriesSnapshot {
    pub node_rows: Vec<NodeRow>,
    pub aggregates: Vec<ConversationAggregate>,
}

/// Graph-like store of per-exchange detail. Writes are keyed upserts.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_exchange(&self, exchange: &Exchange) -> Result<()>;

    /// Keyed by `(exchange_id, node_name)`.
    async fn upsert_node_results(&self, results: &[NodeResult]) -> Result<()>;

    /// Keyed by `(exchange_id, entity_key)`.
    async fn upsert_entities(&self, exchange_id: &str, entities: &[Entity]) -> Result<()>;

    /// Keyed by `(exchange_id, relationship_key)`.
    async fn upsert_relationships(
        &self,
        exchange_id: &str,
        relationships: &[Relationship],
    ) -> Result<()>;

    async fn mark_committed(&self, exchange_id: &str) -> Result<()>;

    async fn is_committed(&self, exchange_id: &str) -> Result<bool>;

    async fn snapshot(&self) -> Result<GraphSnapshot>;
}

/// Time-series-like store of node rows and conversation aggregates.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Keyed by `(exchange_id, node_name)`.
    async fn upsert_node_rows(&self, rows: &[NodeRow]) -> Result<()>;

    async fn load_aggregate(&self, conversation_id: &str) -> Result<Option<VersionedAggregate>>;

    /// Store `aggregate` only if the stored version equals `expected_version`
    /// (`None` = no row yet). Returns `false` on a version conflict.
    async fn compare_and_swap_aggregate(
        &self,
        aggregate: ConversationAggregate,
        expected_version: Option<u64>,
    ) -> Result<bool>;

    async fn snapshot(&self) -> Result<TimeSeriesSnapshot>;
}

/// One exchange's output, ready to commit.
#[derive(Debug, Clone, Copy)]
pub struct CommitUnit<'a> {
    pub exchange: &'a Exchange,
    pub results: &'a [NodeResult],
    pub merged: &'a MergedGraph,
}

/// Writes a [`CommitUnit`] to both stores.
#[derive(Clone)]
pub struct DualStoreWriter {
    graph: Arc<dyn GraphStore>,
    series: Arc<dyn TimeSeriesStore>,
    aggregates: AggregateUpdater,
}

impl DualStoreWriter {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        series: Arc<dyn TimeSeriesStore>,
        aggregate_attempts: u32,
    ) -> Self {
        let aggregates = AggregateUpdater::new(series.clone(), aggregate_attempts);
        Self {
            graph,
            series,
            aggregates,
        }
    }

    pub async fn is_committed(&self, exchange_id: &str) -> Result<bool> {
        self.graph.is_committed(exchange_id).await
    }

    /// Commit one exchange.
    ///
    /// Every step is idempotent, so a retry after a partial failure
    /// overwrites what was already written. The aggregate skips exchanges
    /// it has already incorporated, or swaps in new strengths when the
    /// exchange was analysed again. The committed marker is
    /// written last.
    pub async fn commit(&self, unit: &CommitUnit<'_>) -> Result<ApplyOutcome> {
        let exchange = unit.exchange;
        let exchange_id = exchange.exchange_id.as_str();

        if unit.results.len() != NodeName::ALL.len() {
            return Err(PipelineError::Validation(format!(
                "exchange {} has {} node results, expected {}",
                exchange_id,
                unit.results.len(),
                NodeName::ALL.len()
            )));
        }

        self.graph.upsert_exchange(exchange).await?;
        self.graph.upsert_node_results(unit.results).await?;
        self.graph
            .upsert_entities(exchange_id, &unit.merged.entities)
            .await?;
        self.graph
            .upsert_relationships(exchange_id, &unit.merged.relationships)
            .await?;

        let recorded_at = Utc::now();
        let rows: Vec<NodeRow> = unit
            .results
            .iter()
            .map(|r| NodeRow {
                exchange_id: exchange_id.to_string(),
                conversation_id: exchange.conversation_id.clone(),
                node_name: r.node_name,
                strength: r.strength,
                confidence: r.confidence,
                failed: r.is_failed(),
                recorded_at,
            })
            .collect();
        self.series.upsert_node_rows(&rows).await?;

        let strengths: Vec<(NodeName, f64)> = unit
            .results
            .iter()
            .map(|r| (r.node_name, r.strength))
            .collect();
        let outcome = self
            .aggregates
            .apply_increment(&exchange.conversation_id, exchange_id, &strengths)
            .await?;

        self.graph.mark_committed(exchange_id).await?;
        debug!(
            "Committed exchange {} ({} entities, aggregate {:?})",
            exchange_id,
            unit.merged.entities.len(),
            outcome
        );
        Ok(outcome)
    }
}
