//! In-memory store implementations.

use super::{
    EntityRecord, GraphSnapshot, GraphStore, NodeRow, RelationshipRecord, TimeSeriesSnapshot,
    TimeSeriesStore, VersionedAggregate,
};
use crate::error::Result;
use crate::models::{
    ConversationAggregate, Entity, EntityKey, Exchange, NodeName, NodeResult, Relationship,
    RelationshipKey,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Default)]
struct GraphTables {
    exchanges: BTreeMap<String, Exchange>,
    node_results: BTreeMap<(String, NodeName), NodeResult>,
    entities: BTreeMap<(String, EntityKey), Entity>,
    relationships: BTreeMap<(String, RelationshipKey), Relationship>,
    committed: BTreeSet<String>,
}

/// Graph store backed by ordered maps.
#[derive(Default)]
pub struct InMemoryGraphStore {
    tables: RwLock<GraphTables>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert_exchange(&self, exchange: &Exchange) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .exchanges
            .insert(exchange.exchange_id.clone(), exchange.clone());
        Ok(())
    }

    async fn upsert_node_results(&self, results: &[NodeResult]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for result in results {
            tables.node_results.insert(
                (result.exchange_id.clone(), result.node_name),
                result.clone(),
            );
        }
        Ok(())
    }

    async fn upsert_entities(&self, exchange_id: &str, entities: &[Entity]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for entity in entities {
            tables.entities.insert(
                (exchange_id.to_string(), entity.entity_key.clone()),
                entity.clone(),
            );
        }
        Ok(())
    }

    async fn upsert_relationships(
        &self,
        exchange_id: &str,
        relationships: &[Relationship],
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        for relationship in relationships {
            tables.relationships.insert(
                (exchange_id.to_string(), relationship.key.clone()),
                relationship.clone(),
            );
        }
        Ok(())
    }

    async fn mark_committed(&self, exchange_id: &str) -> Result<()> {
        self.tables
            .write()
            .await
            .committed
            .insert(exchange_id.to_string());
        Ok(())
    }

    async fn is_committed(&self, exchange_id: &str) -> Result<bool> {
        Ok(self.tables.read().await.committed.contains(exchange_id))
    }

    async fn snapshot(&self) -> Result<GraphSnapshot> {
        let tables = self.tables.read().await;
        Ok(GraphSnapshot {
            exchanges: tables.exchanges.values().cloned().collect(),
            node_results: tables.node_results.values().cloned().collect(),
            entities: tables
                .entities
                .iter()
                .map(|((exchange_id, _), entity)| EntityRecord {
                    exchange_id: exchange_id.clone(),
                    entity: entity.clone(),
                })
                .collect(),
            relationships: tables
                .relationships
                .iter()
                .map(|((exchange_id, _), relationship)| RelationshipRecord {
                    exchange_id: exchange_id.clone(),
                    relationship: relationship.clone(),
                })
                .collect(),
            committed: tables.committed.iter().cloned().collect(),
        })
    }
}

/// Time-series store with one independently locked row per conversation.
///
/// The outer map lock is only held to look up or insert a row handle;
/// compare-and-swap runs under the row's own mutex, so unrelated
/// conversations never wait on each other.
#[derive(Default)]
pub struct InMemoryTimeSeriesStore {
    node_rows: RwLock<BTreeMap<(String, NodeName), NodeRow>>,
    aggregates: RwLock<HashMap<String, Arc<Mutex<Option<VersionedAggregate>>>>>,
}

impl InMemoryTimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn row(&self, conversation_id: &str) -> Arc<Mutex<Option<VersionedAggregate>>> {
        if let Some(row) = self.aggregates.read().await.get(conversation_id) {
            return row.clone();
        }
        self.aggregates
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl TimeSeriesStore for InMemoryTimeSeriesStore {
    async fn upsert_node_rows(&self, rows: &[NodeRow]) -> Result<()> {
        let mut table = self.node_rows.write().await;
        for row in rows {
            table.insert((row.exchange_id.clone(), row.node_name), row.clone());
        }
        Ok(())
    }

    async fn load_aggregate(&self, conversation_id: &str) -> Result<Option<VersionedAggregate>> {
        let row = self.row(conversation_id).await;
        let current = row.lock().await.clone();
        Ok(current)
    }

    async fn compare_and_swap_aggregate(
        &self,
        aggregate: ConversationAggregate,
        expected_version: Option<u64>,
    ) -> Result<bool> {
        let row = self.row(&aggregate.conversation_id).await;
        let mut slot = row.lock().await;

        let current_version = slot.as_ref().map(|v| v.version);
        if current_version != expected_version {
            return Ok(false);
        }

        *slot = Some(VersionedAggregate {
            aggregate,
            version: current_version.map_or(1, |v| v + 1),
        });
        Ok(true)
    }

    async fn snapshot(&self) -> Result<TimeSeriesSnapshot> {
        let node_rows = self.node_rows.read().await.values().cloned().collect();

        let handles: Vec<_> = self.aggregates.read().await.values().cloned().collect();
        let mut aggregates = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(versioned) = handle.lock().await.as_ref() {
                aggregates.push(versioned.aggregate.clone());
            }
        }
        aggregates.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));

        Ok(TimeSeriesSnapshot {
            node_rows,
            aggregates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;
    use chrono::Utc;

    fn entity(name: &str) -> Entity {
        Entity {
            entity_key: EntityKey::new(name, EntityType::Person),
            display_name: name.to_string(),
            attributes: BTreeMap::new(),
            seen_by: BTreeMap::from([(NodeName::Echo, 0.5)]),
            confidence: 0.5,
        }
    }

    #[tokio::test]
    async fn test_graph_upserts_overwrite() {
        let store = InMemoryGraphStore::new();
        let results: Vec<NodeResult> = NodeName::ALL
            .iter()
            .map(|n| NodeResult::empty("x1", *n))
            .collect();

        store.upsert_node_results(&results).await.unwrap();
        store.upsert_node_results(&results).await.unwrap();
        store.upsert_entities("x1", &[entity("Grandmother")]).await.unwrap();
        store.upsert_entities("x1", &[entity("grandmother")]).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.node_results.len(), 9);
        assert_eq!(snapshot.entities.len(), 1);
        assert_eq!(snapshot.entities[0].entity.display_name, "grandmother");
    }

    #[tokio::test]
    async fn test_committed_marker() {
        let store = InMemoryGraphStore::new();
        assert!(!store.is_committed("x1").await.unwrap());
        store.mark_committed("x1").await.unwrap();
        assert!(store.is_committed("x1").await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_swap_versions() {
        let store = InMemoryTimeSeriesStore::new();
        let aggregate = ConversationAggregate::new("c1");

        assert!(store.load_aggregate("c1").await.unwrap().is_none());
        assert!(store
            .compare_and_swap_aggregate(aggregate.clone(), None)
            .await
            .unwrap());
        // Stale writer loses.
        assert!(!store
            .compare_and_swap_aggregate(aggregate.clone(), None)
            .await
            .unwrap());

        let loaded = store.load_aggregate("c1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert!(store
            .compare_and_swap_aggregate(aggregate, Some(1))
            .await
            .unwrap());
        assert_eq!(store.load_aggregate("c1").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_node_rows_keyed_by_exchange_and_node() {
        let store = InMemoryTimeSeriesStore::new();
        let row = NodeRow {
            exchange_id: "x1".into(),
            conversation_id: "c1".into(),
            node_name: NodeName::Anchor,
            strength: 0.4,
            confidence: 0.9,
            failed: false,
            recorded_at: Utc::now(),
        };
        store.upsert_node_rows(&[row.clone()]).await.unwrap();
        store
            .upsert_node_rows(&[NodeRow {
                strength: 0.6,
                ..row
            }])
            .await
            .unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.node_rows.len(), 1);
        assert_eq!(snapshot.node_rows[0].strength, 0.6);
        assert!(snapshot.aggregates.is_empty());
    }
}
