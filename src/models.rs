//! Data models for the exchange analysis pipeline.
//!
//! This module contains the core data structures used throughout
//! the application: exchanges, per-lens node results, canonical
//! entities and the running conversation aggregates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// One of the nine fixed analytical lenses.
///
/// Declaration order is the canonical node order used for tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeName {
    Anchor,
    Echo,
    Beacon,
    Synth,
    Nexus,
    Mirror,
    Glyph,
    Harmonia,
    Gateway,
}

impl NodeName {
    /// All nodes in canonical order.
    pub const ALL: [NodeName; 9] = [
        NodeName::Anchor,
        NodeName::Echo,
        NodeName::Beacon,
        NodeName::Synth,
        NodeName::Nexus,
        NodeName::Mirror,
        NodeName::Glyph,
        NodeName::Harmonia,
        NodeName::Gateway,
    ];

    /// The eight ungated Phase-1 nodes.
    pub const PHASE1: [NodeName; 8] = [
        NodeName::Anchor,
        NodeName::Echo,
        NodeName::Beacon,
        NodeName::Synth,
        NodeName::Nexus,
        NodeName::Mirror,
        NodeName::Glyph,
        NodeName::Harmonia,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeName::Anchor => "ANCHOR",
            NodeName::Echo => "ECHO",
            NodeName::Beacon => "BEACON",
            NodeName::Synth => "SYNTH",
            NodeName::Nexus => "NEXUS",
            NodeName::Mirror => "MIRROR",
            NodeName::Glyph => "GLYPH",
            NodeName::Harmonia => "HARMONIA",
            NodeName::Gateway => "GATEWAY",
        }
    }

    /// Position in the canonical order (0 = ANCHOR).
    pub fn rank(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeName::ALL
            .iter()
            .copied()
            .find(|n| n.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown node name: {}", s))
    }
}

/// A user message plus the reply it received. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub exchange_id: String,
    pub conversation_id: String,
    pub user_text: String,
    pub assistant_text: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(
        exchange_id: impl Into<String>,
        conversation_id: impl Into<String>,
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
    ) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            conversation_id: conversation_id.into(),
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
            created_at: Utc::now(),
        }
    }

    /// Full text of the exchange, user message first.
    pub fn full_text(&self) -> String {
        format!("{}\n{}", self.user_text, self.assistant_text)
    }
}

/// Coarse entity type used in the dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Place,
    Concept,
    System,
    Symbol,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Person => write!(f, "person"),
            EntityType::Place => write!(f, "place"),
            EntityType::Concept => write!(f, "concept"),
            EntityType::System => write!(f, "system"),
            EntityType::Symbol => write!(f, "symbol"),
        }
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "person" | "people" | "character" | "individual" | "family" => EntityType::Person,
            "place" | "location" | "region" | "city" | "country" => EntityType::Place,
            "system" | "organization" | "organisation" | "tool" | "technology" | "software"
            | "institution" => EntityType::System,
            "symbol" | "image" | "metaphor" | "motif" | "archetype" => EntityType::Symbol,
            _ => EntityType::Concept,
        }
    }
}

/// An entity as extracted by a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ExtractedEntity {
    pub fn new(name: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            name: name.into(),
            entity_type,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.name, self.entity_type)
    }
}

/// A relationship as extracted by a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub source: String,
    pub source_type: EntityType,
    pub target: String,
    pub target_type: EntityType,
    pub label: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ExtractedRelationship {
    pub fn key(&self) -> RelationshipKey {
        RelationshipKey {
            source: EntityKey::new(&self.source, self.source_type),
            target: EntityKey::new(&self.target, self.target_type),
            label: normalize_name(&self.label),
        }
    }
}

/// Output of one node for one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub exchange_id: String,
    pub node_name: NodeName,
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
    #[serde(default)]
    pub tensions: Vec<String>,
    #[serde(default)]
    pub absences: Vec<String>,
    #[serde(default)]
    pub functional_summary: String,
    /// Certainty that the extracted elements exist in the source text.
    pub confidence: f64,
    /// Intensity of this lens's activation for the exchange.
    pub strength: f64,
    /// Only set on GATEWAY results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_stable: Option<bool>,
    /// Set when the result is a substitute for a failed or timed-out call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl NodeResult {
    /// Creates an empty, successful result.
    pub fn empty(exchange_id: impl Into<String>, node_name: NodeName) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            node_name,
            entities: Vec::new(),
            relationships: Vec::new(),
            tensions: Vec::new(),
            absences: Vec::new(),
            functional_summary: String::new(),
            confidence: 0.0,
            strength: 0.0,
            anchor_stable: None,
            failure: None,
        }
    }

    /// Zero-confidence placeholder substituted for a failed analyzer call.
    pub fn failed(
        exchange_id: impl Into<String>,
        node_name: NodeName,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::empty(exchange_id, node_name)
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Normalized name used for dedup keys: trimmed, lowercased, inner
/// whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Dedup key of a canonical entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub name: String,
    pub entity_type: EntityType,
}

impl EntityKey {
    pub fn new(name: &str, entity_type: EntityType) -> Self {
        Self {
            name: normalize_name(name),
            entity_type,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.name, self.entity_type)
    }
}

/// Dedup key of a canonical relationship.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipKey {
    pub source: EntityKey,
    pub target: EntityKey,
    pub label: String,
}

impl fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.source, self.label, self.target)
    }
}

/// Canonical referent merged across node results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_key: EntityKey,
    /// Surface form from the winning contributor.
    pub display_name: String,
    pub attributes: BTreeMap<String, String>,
    /// Which lens saw this entity, and how strongly.
    pub seen_by: BTreeMap<NodeName, f64>,
    pub confidence: f64,
}

/// Canonical relationship merged across node results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub key: RelationshipKey,
    pub label: String,
    pub attributes: BTreeMap<String, String>,
    pub seen_by: BTreeMap<NodeName, f64>,
    pub confidence: f64,
}

/// Running statistic for one node within one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub sum: f64,
    pub count: u64,
    pub avg: f64,
    /// Strength folded in for each exchange, by exchange id.
    #[serde(default)]
    pub incorporated: BTreeMap<String, f64>,
}

/// Incrementally maintained per-conversation statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationAggregate {
    pub conversation_id: String,
    pub exchange_count: u64,
    pub per_node: BTreeMap<NodeName, NodeStats>,
    /// Exchanges counted in `exchange_count`.
    #[serde(default)]
    pub exchanges: BTreeSet<String>,
    pub last_updated: DateTime<Utc>,
}

impl ConversationAggregate {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            exchange_count: 0,
            per_node: BTreeMap::new(),
            exchanges: BTreeSet::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn node(&self, node: NodeName) -> Option<&NodeStats> {
        self.per_node.get(&node)
    }
}

/// Per-job state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Phase1Running,
    Phase1Done,
    Phase2Running,
    Merging,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "QUEUED",
            JobState::Phase1Running => "PHASE1_RUNNING",
            JobState::Phase1Done => "PHASE1_DONE",
            JobState::Phase2Running => "PHASE2_RUNNING",
            JobState::Merging => "MERGING",
            JobState::Committing => "COMMITTING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}
