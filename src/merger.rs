//! Entity and relationship merging.
//!
//! Combines the nine node results of one exchange into a canonical,
//! deduplicated set. Every contribution is ranked by a total order
//! (result confidence, then canonical node order, then position inside
//! the result) and attributes are folded from lowest to highest rank, so
//! the outcome does not depend on the order the results arrive in.

use crate::models::{
    Entity, EntityKey, NodeName, NodeResult, Relationship, RelationshipKey,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Canonical output of merging one exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedGraph {
    /// Sorted by entity key.
    pub entities: Vec<Entity>,
    /// Sorted by relationship key.
    pub relationships: Vec<Relationship>,
}

impl MergedGraph {
    pub fn entity(&self, key: &EntityKey) -> Option<&Entity> {
        self.entities
            .binary_search_by(|e| e.entity_key.cmp(key))
            .ok()
            .map(|i| &self.entities[i])
    }

    pub fn relationship(&self, key: &RelationshipKey) -> Option<&Relationship> {
        self.relationships
            .binary_search_by(|r| r.key.cmp(key))
            .ok()
            .map(|i| &self.relationships[i])
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// One node's view of an entity or relationship.
struct Contribution<'a, T> {
    node: NodeName,
    confidence: f64,
    strength: f64,
    position: usize,
    item: &'a T,
}

/// `Greater` means `a` takes precedence over `b`.
fn precedence<T>(a: &Contribution<'_, T>, b: &Contribution<'_, T>) -> Ordering {
    a.confidence
        .total_cmp(&b.confidence)
        .then_with(|| b.node.rank().cmp(&a.node.rank()))
        .then_with(|| b.position.cmp(&a.position))
}

struct Folded<'a, T> {
    winner: &'a T,
    attributes: BTreeMap<String, String>,
    seen_by: BTreeMap<NodeName, f64>,
    confidence: f64,
}

fn fold<'a, T>(
    mut contributions: Vec<Contribution<'a, T>>,
    attributes_of: impl Fn(&T) -> &BTreeMap<String, String>,
) -> Option<Folded<'a, T>> {
    contributions.sort_by(|a, b| precedence(a, b));
    let winner = contributions.last()?.item;

    let mut attributes = BTreeMap::new();
    let mut seen_by = BTreeMap::new();
    let mut confidence: f64 = 0.0;

    for c in &contributions {
        for (key, value) in attributes_of(c.item) {
            attributes.insert(key.clone(), value.clone());
        }
        seen_by.insert(c.node, c.strength);
        confidence = confidence.max(c.confidence);
    }

    Some(Folded {
        winner,
        attributes,
        seen_by,
        confidence,
    })
}

/// Merge node results into a canonical entity and relationship set.
///
/// Failed (placeholder) results carry no extractions and are ignored.
pub fn merge(results: &[NodeResult]) -> MergedGraph {
    let mut entity_groups: BTreeMap<EntityKey, Vec<Contribution<'_, _>>> = BTreeMap::new();
    let mut relationship_groups: BTreeMap<RelationshipKey, Vec<Contribution<'_, _>>> =
        BTreeMap::new();

    for result in results.iter().filter(|r| !r.is_failed()) {
        for (position, entity) in result.entities.iter().enumerate() {
            if entity.name.trim().is_empty() {
                continue;
            }
            entity_groups
                .entry(entity.key())
                .or_default()
                .push(Contribution {
                    node: result.node_name,
                    confidence: result.confidence,
                    strength: result.strength,
                    position,
                    item: entity,
                });
        }
        for (position, relationship) in result.relationships.iter().enumerate() {
            if relationship.source.trim().is_empty() || relationship.target.trim().is_empty() {
                continue;
            }
            relationship_groups
                .entry(relationship.key())
                .or_default()
                .push(Contribution {
                    node: result.node_name,
                    confidence: result.confidence,
                    strength: result.strength,
                    position,
                    item: relationship,
                });
        }
    }

    let entities = entity_groups
        .into_iter()
        .filter_map(|(entity_key, group)| {
            let folded = fold(group, |e| &e.attributes)?;
            Some(Entity {
                entity_key,
                display_name: folded.winner.name.trim().to_string(),
                attributes: folded.attributes,
                seen_by: folded.seen_by,
                confidence: folded.confidence,
            })
        })
        .collect();

    let relationships = relationship_groups
        .into_iter()
        .filter_map(|(key, group)| {
            let folded = fold(group, |r| &r.attributes)?;
            Some(Relationship {
                key,
                label: folded.winner.label.trim().to_string(),
                attributes: folded.attributes,
                seen_by: folded.seen_by,
                confidence: folded.confidence,
            })
        })
        .collect();

    MergedGraph {
        entities,
        relationships,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, ExtractedEntity, ExtractedRelationship};

    fn result(node: NodeName, confidence: f64, strength: f64) -> NodeResult {
        let mut r = NodeResult::empty("x1", node);
        r.confidence = confidence;
        r.strength = strength;
        r
    }

    fn grandmother() -> ExtractedEntity {
        ExtractedEntity::new("Grandmother", EntityType::Person)
    }

    fn nine_results() -> Vec<NodeResult> {
        NodeName::ALL
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let mut r = result(*node, 0.5 + (i % 3) as f64 * 0.1, 0.1 * i as f64);
                r.entities.push(
                    ExtractedEntity::new(" garden ", EntityType::Place)
                        .with_attribute("mood", format!("mood-{}", i % 3))
                        .with_attribute(format!("seen-{}", node), "yes"),
                );
                r.entities.push(
                    ExtractedEntity::new("Tree", EntityType::Symbol)
                        .with_attribute("season", node.as_str()),
                );
                r.relationships.push(ExtractedRelationship {
                    source: "Garden".into(),
                    source_type: EntityType::Place,
                    target: "tree".into(),
                    target_type: EntityType::Symbol,
                    label: "Contains".into(),
                    attributes: BTreeMap::from([("node".to_string(), node.to_string())]),
                });
                r
            })
            .collect()
    }

    #[test]
    fn test_seen_by_preserves_every_lens() {
        let mut echo = result(NodeName::Echo, 0.7, 0.85);
        echo.entities.push(grandmother());
        let mut gateway = result(NodeName::Gateway, 0.6, 0.90);
        gateway.entities.push(ExtractedEntity::new("grandmother ", EntityType::Person));
        let mut harmonia = result(NodeName::Harmonia, 0.9, 0.70);
        harmonia.entities.push(ExtractedEntity::new("GRANDMOTHER", EntityType::Person));

        let merged = merge(&[echo, gateway, harmonia]);

        assert_eq!(merged.entities.len(), 1);
        let entity = &merged.entities[0];
        assert_eq!(entity.seen_by.len(), 3);
        assert_eq!(entity.seen_by[&NodeName::Echo], 0.85);
        assert_eq!(entity.seen_by[&NodeName::Gateway], 0.90);
        assert_eq!(entity.seen_by[&NodeName::Harmonia], 0.70);
        assert_eq!(entity.confidence, 0.9);
        assert_eq!(entity.display_name, "GRANDMOTHER");
    }

    #[test]
    fn test_same_name_different_type_stays_separate() {
        let mut nexus = result(NodeName::Nexus, 0.5, 0.5);
        nexus.entities.push(ExtractedEntity::new("Mirror", EntityType::Symbol));
        nexus.entities.push(ExtractedEntity::new("Mirror", EntityType::Concept));

        let merged = merge(&[nexus]);
        assert_eq!(merged.entities.len(), 2);
    }

    #[test]
    fn test_attribute_collision_higher_confidence_wins() {
        let mut echo = result(NodeName::Echo, 0.4, 0.5);
        echo.entities
            .push(grandmother().with_attribute("role", "storyteller").with_attribute("age", "old"));
        let mut mirror = result(NodeName::Mirror, 0.8, 0.5);
        mirror.entities.push(grandmother().with_attribute("role", "protector"));

        let merged = merge(&[mirror, echo]);
        let entity = &merged.entities[0];
        assert_eq!(entity.attributes["role"], "protector");
        assert_eq!(entity.attributes["age"], "old");
    }

    #[test]
    fn test_attribute_tie_broken_by_canonical_order() {
        let mut glyph = result(NodeName::Glyph, 0.6, 0.5);
        glyph.entities.push(grandmother().with_attribute("role", "glyph-view"));
        let mut echo = result(NodeName::Echo, 0.6, 0.5);
        echo.entities.push(grandmother().with_attribute("role", "echo-view"));

        let forward = merge(&[glyph.clone(), echo.clone()]);
        let backward = merge(&[echo, glyph]);
        assert_eq!(forward.entities[0].attributes["role"], "echo-view");
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let results = nine_results();
        let expected = merge(&results);

        let mut reversed = results.clone();
        reversed.reverse();
        assert_eq!(merge(&reversed), expected);

        for shift in 1..results.len() {
            let mut rotated = results.clone();
            rotated.rotate_left(shift);
            assert_eq!(merge(&rotated), expected, "rotation {}", shift);
        }

        // Pseudo-random permutations from a fixed LCG seed.
        let mut seed: u64 = 0x5eed;
        for _ in 0..50 {
            let mut shuffled = results.clone();
            for i in (1..shuffled.len()).rev() {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (seed >> 33) as usize % (i + 1);
                shuffled.swap(i, j);
            }
            assert_eq!(merge(&shuffled), expected);
        }
    }

    #[test]
    fn test_relationships_deduplicated_by_key() {
        let merged = merge(&nine_results());
        assert_eq!(merged.relationships.len(), 1);

        let relationship = &merged.relationships[0];
        assert_eq!(relationship.key.label, "contains");
        assert_eq!(relationship.seen_by.len(), 9);
        let key = RelationshipKey {
            source: EntityKey::new("garden", EntityType::Place),
            target: EntityKey::new("TREE", EntityType::Symbol),
            label: "contains".into(),
        };
        assert!(merged.relationship(&key).is_some());
    }

    #[test]
    fn test_failed_results_ignored() {
        let mut failed = NodeResult::failed("x1", NodeName::Anchor, "timeout");
        failed.entities.push(grandmother());
        let merged = merge(&[failed]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_entity_lookup() {
        let merged = merge(&nine_results());
        let key = EntityKey::new("Garden", EntityType::Place);
        let garden = merged.entity(&key).unwrap();
        assert_eq!(garden.seen_by.len(), 9);
        assert_eq!(garden.display_name, "garden");
        // Nine distinct "seen-*" keys plus the shared "mood" key.
        assert_eq!(garden.attributes.len(), 10);
    }
}
