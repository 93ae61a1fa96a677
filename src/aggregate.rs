//! Incremental conversation statistics.
//!
//! Aggregates are updated with optimistic concurrency: read the row and
//! its version, fold the increment in, then compare-and-swap. A conflict
//! means another worker committed in between, so the update is retried
//! on a fresh read.
//!
//! Each node statistic remembers the strength it folded in for every
//! exchange. Replaying a commit never double-counts, and re-analysing an
//! exchange replaces its earlier strength instead of keeping a stale one,
//! so `sum` always matches the committed node rows. Sums and counts are
//! commutative and `last_updated` only moves forward, which keeps the
//! result independent of commit order.

use crate::error::{PipelineError, Result};
use crate::models::{ConversationAggregate, NodeName};
use crate::store::TimeSeriesStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of applying an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The aggregate changed.
    Applied,
    /// Every increment had already been incorporated with the same strength.
    AlreadyApplied,
}

/// Fold one node strength for one exchange into `aggregate`.
///
/// A repeat of an `(exchange, node)` pair swaps the old strength for the
/// new one without touching `count`. Returns `false` if nothing changed.
pub fn fold_increment(
    aggregate: &mut ConversationAggregate,
    exchange_id: &str,
    node: NodeName,
    strength: f64,
    now: DateTime<Utc>,
) -> bool {
    let stats = aggregate.per_node.entry(node).or_default();
    match stats.incorporated.insert(exchange_id.to_string(), strength) {
        Some(previous) if previous == strength => return false,
        Some(previous) => stats.sum += strength - previous,
        None => {
            stats.sum += strength;
            stats.count += 1;
        }
    }
    stats.avg = stats.sum / stats.count as f64;

    if aggregate.exchanges.insert(exchange_id.to_string()) {
        aggregate.exchange_count += 1;
    }
    if now > aggregate.last_updated {
        aggregate.last_updated = now;
    }
    true
}

/// Applies increments to conversation aggregates in a time-series store.
#[derive(Clone)]
pub struct AggregateUpdater {
    store: Arc<dyn TimeSeriesStore>,
    max_attempts: u32,
}

impl AggregateUpdater {
    pub fn new(store: Arc<dyn TimeSeriesStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Add the node strengths of one exchange in a single transaction.
    pub async fn apply_increment(
        &self,
        conversation_id: &str,
        exchange_id: &str,
        strengths: &[(NodeName, f64)],
    ) -> Result<ApplyOutcome> {
        for attempt in 1..=self.max_attempts {
            let current = self.store.load_aggregate(conversation_id).await?;
            let (mut aggregate, version) = match current {
                Some(v) => (v.aggregate, Some(v.version)),
                None => (ConversationAggregate::new(conversation_id), None),
            };

            let now = Utc::now();
            let mut changed = false;
            for (node, strength) in strengths {
                changed |= fold_increment(&mut aggregate, exchange_id, *node, *strength, now);
            }
            if !changed {
                debug!(
                    "Exchange {} already incorporated into {}",
                    exchange_id, conversation_id
                );
                return Ok(ApplyOutcome::AlreadyApplied);
            }

            if self
                .store
                .compare_and_swap_aggregate(aggregate, version)
                .await?
            {
                return Ok(ApplyOutcome::Applied);
            }

            debug!(
                "Aggregate conflict on {} (attempt {}/{})",
                conversation_id, attempt, self.max_attempts
            );
            tokio::task::yield_now().await;
        }

        warn!(
            "Giving up on aggregate update for {} after {} conflicts",
            conversation_id, self.max_attempts
        );
        Err(PipelineError::AggregateRace {
            conversation_id: conversation_id.to_string(),
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryTimeSeriesStore, NodeRow, TimeSeriesSnapshot, VersionedAggregate};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const EPS: f64 = 1e-9;

    fn updater(store: Arc<InMemoryTimeSeriesStore>) -> AggregateUpdater {
        AggregateUpdater::new(store, 64)
    }

    #[test]
    fn test_fold_increment_is_idempotent() {
        let mut aggregate = ConversationAggregate::new("c1");
        let now = Utc::now();

        assert!(fold_increment(&mut aggregate, "x1", NodeName::Anchor, 0.4, now));
        assert!(!fold_increment(&mut aggregate, "x1", NodeName::Anchor, 0.4, now));
        assert!(fold_increment(&mut aggregate, "x1", NodeName::Echo, 0.2, now));

        let anchor = aggregate.node(NodeName::Anchor).unwrap();
        assert_eq!(anchor.count, 1);
        assert!((anchor.sum - 0.4).abs() < EPS);
        assert_eq!(aggregate.exchange_count, 1);
    }

    #[test]
    fn test_last_updated_never_moves_backwards() {
        let mut aggregate = ConversationAggregate::new("c1");
        let later = aggregate.last_updated + chrono::Duration::seconds(60);
        let earlier = aggregate.last_updated - chrono::Duration::seconds(60);

        fold_increment(&mut aggregate, "x2", NodeName::Anchor, 0.1, later);
        fold_increment(&mut aggregate, "x1", NodeName::Anchor, 0.1, earlier);
        assert_eq!(aggregate.last_updated, later);
    }

    #[tokio::test]
    async fn test_apply_increment_updates_average() {
        let store = Arc::new(InMemoryTimeSeriesStore::new());
        let updater = updater(store.clone());

        updater
            .apply_increment("c1", "x1", &[(NodeName::Beacon, 0.2)])
            .await
            .unwrap();
        updater
            .apply_increment("c1", "x2", &[(NodeName::Beacon, 0.6)])
            .await
            .unwrap();

        let aggregate = store.load_aggregate("c1").await.unwrap().unwrap().aggregate;
        let beacon = aggregate.node(NodeName::Beacon).unwrap();
        assert_eq!(beacon.count, 2);
        assert!((beacon.avg - 0.4).abs() < EPS);
        assert_eq!(aggregate.exchange_count, 2);
    }

    #[tokio::test]
    async fn test_redelivered_exchange_not_double_counted() {
        let store = Arc::new(InMemoryTimeSeriesStore::new());
        let updater = updater(store.clone());
        let strengths = [(NodeName::Anchor, 0.4), (NodeName::Gateway, 0.7)];

        let first = updater.apply_increment("c1", "x1", &strengths).await.unwrap();
        let second = updater.apply_increment("c1", "x1", &strengths).await.unwrap();
        assert_eq!(first, ApplyOutcome::Applied);
        assert_eq!(second, ApplyOutcome::AlreadyApplied);

        let aggregate = store.load_aggregate("c1").await.unwrap().unwrap().aggregate;
        assert_eq!(aggregate.exchange_count, 1);
        assert_eq!(aggregate.node(NodeName::Anchor).unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_reanalysed_exchange_replaces_strength() {
        let store = Arc::new(InMemoryTimeSeriesStore::new());
        let updater = updater(store.clone());

        updater
            .apply_increment("c1", "x1", &[(NodeName::Anchor, 0.4)])
            .await
            .unwrap();
        updater
            .apply_increment("c1", "x2", &[(NodeName::Anchor, 0.2)])
            .await
            .unwrap();
        let outcome = updater
            .apply_increment("c1", "x1", &[(NodeName::Anchor, 0.6)])
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let aggregate = store.load_aggregate("c1").await.unwrap().unwrap().aggregate;
        let anchor = aggregate.node(NodeName::Anchor).unwrap();
        assert_eq!(anchor.count, 2);
        assert!((anchor.sum - 0.8).abs() < EPS);
        assert!((anchor.avg - 0.4).abs() < EPS);
        assert_eq!(anchor.incorporated["x1"], 0.6);
        assert_eq!(aggregate.exchange_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_lose_nothing() {
        let store = Arc::new(InMemoryTimeSeriesStore::new());
        let updater = updater(store.clone());

        let mut handles = Vec::new();
        for i in 0..40u32 {
            let updater = updater.clone();
            handles.push(tokio::spawn(async move {
                let strength = f64::from(i % 5) / 10.0;
                updater
                    .apply_increment(
                        "c1",
                        &format!("x{}", i),
                        &[(NodeName::Anchor, strength), (NodeName::Echo, 0.5)],
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let expected: f64 = (0..40u32).map(|i| f64::from(i % 5) / 10.0).sum();
        let aggregate = store.load_aggregate("c1").await.unwrap().unwrap().aggregate;
        let anchor = aggregate.node(NodeName::Anchor).unwrap();
        assert_eq!(anchor.count, 40);
        assert!((anchor.sum - expected).abs() < EPS);
        assert!((aggregate.node(NodeName::Echo).unwrap().sum - 20.0).abs() < EPS);
        assert_eq!(aggregate.exchange_count, 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_exchanges_same_conversation() {
        let store = Arc::new(InMemoryTimeSeriesStore::new());
        let updater = updater(store.clone());

        let a = {
            let updater = updater.clone();
            tokio::spawn(async move {
                updater
                    .apply_increment("C123", "x1", &[(NodeName::Anchor, 0.4)])
                    .await
            })
        };
        let b = {
            let updater = updater.clone();
            tokio::spawn(async move {
                updater
                    .apply_increment("C123", "x2", &[(NodeName::Anchor, 0.6)])
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let aggregate = store.load_aggregate("C123").await.unwrap().unwrap().aggregate;
        let anchor = aggregate.node(NodeName::Anchor).unwrap();
        assert!((anchor.sum - 1.0).abs() < EPS);
        assert_eq!(anchor.count, 2);
    }

    /// Store whose compare-and-swap loses the first `conflicts` races.
    struct ContendedStore {
        inner: InMemoryTimeSeriesStore,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl TimeSeriesStore for ContendedStore {
        async fn upsert_node_rows(&self, rows: &[NodeRow]) -> Result<()> {
            self.inner.upsert_node_rows(rows).await
        }

        async fn load_aggregate(&self, id: &str) -> Result<Option<VersionedAggregate>> {
            self.inner.load_aggregate(id).await
        }

        async fn compare_and_swap_aggregate(
            &self,
            aggregate: ConversationAggregate,
            expected_version: Option<u64>,
        ) -> Result<bool> {
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                return Ok(false);
            }
            self.inner
                .compare_and_swap_aggregate(aggregate, expected_version)
                .await
        }

        async fn snapshot(&self) -> Result<TimeSeriesSnapshot> {
            self.inner.snapshot().await
        }
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = Arc::new(ContendedStore {
            inner: InMemoryTimeSeriesStore::new(),
            conflicts: AtomicU32::new(2),
        });
        let updater = AggregateUpdater::new(store.clone(), 3);

        let outcome = updater
            .apply_increment("c1", "x1", &[(NodeName::Glyph, 0.3)])
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn test_exhausted_conflicts_surface_race_error() {
        let store = Arc::new(ContendedStore {
            inner: InMemoryTimeSeriesStore::new(),
            conflicts: AtomicU32::new(10),
        });
        let updater = AggregateUpdater::new(store, 3);

        let err = updater
            .apply_increment("c1", "x1", &[(NodeName::Glyph, 0.3)])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AggregateRace { attempts: 3, .. }));
        assert!(err.is_retryable());
    }
}
