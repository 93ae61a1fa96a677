//! Rule-based analyzer.
//!
//! Scores each lens by counting lens-specific cue phrases and extracts
//! entities from kinship/place/symbol vocabularies and capitalised
//! phrases. Deterministic and offline, which makes it the default for
//! local runs and the reference analyzer in tests.

use super::{AnalysisContext, NodeAnalyzer};
use crate::error::Result;
use crate::models::{
    EntityType, ExtractedEntity, ExtractedRelationship, NodeName, NodeResult,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};

const PERSON_WORDS: &[&str] = &[
    "mother", "father", "grandmother", "grandfather", "sister", "brother", "friend", "teacher",
    "partner", "son", "daughter", "aunt", "uncle", "mom", "dad", "therapist",
];

const PLACE_WORDS: &[&str] = &[
    "home", "school", "garden", "kitchen", "city", "village", "house", "church", "forest", "sea",
    "office", "hospital",
];

const SYMBOL_WORDS: &[&str] = &[
    "tree", "light", "shadow", "river", "bridge", "door", "mirror", "key", "fire", "bird", "storm",
];

const SYSTEM_WORDS: &[&str] = &[
    "computer", "phone", "app", "system", "software", "internet", "company", "government",
];

const TENSION_MARKERS: &[&str] = &["but", "however", "although", "yet"];

const GATEWAY_CUES: &[&str] = &["next", "change", "begin", "open", "ready", "step", "start", "now"];

/// Cue phrases per Phase-1 lens.
fn lens_cues(node: NodeName) -> &'static [&'static str] {
    match node {
        NodeName::Anchor => &[
            "always", "home", "safe", "stable", "routine", "ground", "certain", "foundation",
            "steady",
        ],
        NodeName::Echo => &[
            "again", "remember", "before", "used to", "childhood", "memory", "past", "repeat",
        ],
        NodeName::Beacon => &["want", "hope", "goal", "future", "plan", "should", "will", "dream"],
        NodeName::Synth => &[
            "because", "therefore", "connect", "combine", "means", "pattern", "together",
        ],
        NodeName::Nexus => &[
            "we", "friend", "family", "mother", "father", "grandmother", "relationship", "with",
        ],
        NodeName::Mirror => &["i feel", "myself", "i think", "i am", "realize", "notice", "reflect"],
        NodeName::Glyph => &[
            "like a", "symbol", "image", "dream", "color", "light", "shadow", "tree", "sign",
        ],
        NodeName::Harmonia => &[
            "calm", "peace", "anxious", "angry", "sad", "happy", "balance", "love", "fear",
        ],
        NodeName::Gateway => GATEWAY_CUES,
    }
}

fn relation_label(node: NodeName) -> &'static str {
    match node {
        NodeName::Nexus => "connected_with",
        NodeName::Echo => "recalled_with",
        NodeName::Synth => "linked_to",
        NodeName::Glyph => "symbolizes",
        _ => "co_occurs_with",
    }
}

/// Deterministic keyword-driven analyzer.
#[derive(Debug, Clone, Default)]
pub struct LexicalAnalyzer;

impl LexicalAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn analyze_phase1(&self, node: NodeName, ctx: &AnalysisContext<'_>) -> NodeResult {
        let text = ctx.exchange.full_text();
        let sentences = split_sentences(&text);
        let cues = lens_cues(node);

        let mut result = NodeResult::empty(&ctx.exchange.exchange_id, node);
        let mut hits = 0usize;
        let mut cued_sentences = Vec::new();

        for sentence in &sentences {
            let tokens = tokenize(sentence);
            let sentence_hits: usize = cues.iter().map(|cue| phrase_count(&tokens, cue)).sum();
            if sentence_hits > 0 {
                hits += sentence_hits;
                cued_sentences.push(sentence.as_str());
            }
        }

        let mention_counts = mention_counts(&sentences);
        let mut seen = HashSet::new();
        for sentence in &cued_sentences {
            let found = extract_entities(sentence);
            for entity in &found {
                if seen.insert(entity.key()) {
                    let mentions = mention_counts.get(&entity.key().name).copied().unwrap_or(1);
                    result.entities.push(
                        entity
                            .clone()
                            .with_attribute("mentions", mentions.to_string())
                            .with_attribute("context", sentence.trim()),
                    );
                }
            }
            for pair in found.windows(2) {
                result.relationships.push(ExtractedRelationship {
                    source: pair[0].name.clone(),
                    source_type: pair[0].entity_type,
                    target: pair[1].name.clone(),
                    target_type: pair[1].entity_type,
                    label: relation_label(node).to_string(),
                    attributes: BTreeMap::new(),
                });
            }
            if has_tension(sentence) {
                result.tensions.push(sentence.trim().to_string());
            }
        }

        if hits == 0 {
            result
                .absences
                .push(format!("no {} cues", node.as_str().to_lowercase()));
        }

        result.strength = round2(saturate(hits));
        result.confidence = round2(confidence(hits, result.entities.len(), sentences.is_empty()));
        result.functional_summary = format!(
            "{}: {} cue(s) across {} of {} sentence(s)",
            node,
            hits,
            cued_sentences.len(),
            sentences.len()
        );
        result
    }

    fn analyze_gateway(&self, ctx: &AnalysisContext<'_>) -> NodeResult {
        let exchange = ctx.exchange;
        let mut result = NodeResult::empty(&exchange.exchange_id, NodeName::Gateway);
        let stable = ctx.anchor_stable.unwrap_or(false);

        let live: Vec<&NodeResult> = ctx.phase1.iter().filter(|r| !r.is_failed()).collect();
        let base = if live.is_empty() {
            0.0
        } else {
            live.iter().map(|r| r.strength).sum::<f64>() / live.len() as f64
        };
        let base = if stable { base } else { base * 0.5 };

        let tokens = tokenize(&exchange.full_text());
        let hits: usize = GATEWAY_CUES.iter().map(|cue| phrase_count(&tokens, cue)).sum();

        // Entities that at least two lenses agree on.
        let mut votes: BTreeMap<_, (usize, &ExtractedEntity)> = BTreeMap::new();
        for entity in live.iter().flat_map(|r| r.entities.iter()) {
            votes.entry(entity.key()).or_insert((0, entity)).0 += 1;
        }
        for (count, entity) in votes.values() {
            if *count >= 2 {
                result.entities.push(
                    ExtractedEntity::new(entity.name.clone(), entity.entity_type)
                        .with_attribute("lens_agreement", count.to_string()),
                );
            }
        }

        result.tensions = live
            .iter()
            .flat_map(|r| r.tensions.iter().cloned())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        if !stable {
            result.absences.push("anchor unstable".to_string());
        }

        result.strength = round2((0.7 * base + 0.3 * saturate(hits)).min(1.0));
        result.confidence = round2(confidence(hits, result.entities.len(), tokens.is_empty()));
        result.functional_summary = format!(
            "GATEWAY: {} lens(es) live, {} shared entit(ies), anchor {}",
            live.len(),
            result.entities.len(),
            if stable { "stable" } else { "unstable" }
        );
        result.anchor_stable = Some(stable);
        result
    }
}

#[async_trait]
impl NodeAnalyzer for LexicalAnalyzer {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn analyze(&self, node: NodeName, ctx: &AnalysisContext<'_>) -> Result<NodeResult> {
        Ok(match node {
            NodeName::Gateway => self.analyze_gateway(ctx),
            _ => self.analyze_phase1(node, ctx),
        })
    }
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Occurrences of a (possibly multi-word) cue in a token stream.
fn phrase_count(tokens: &[String], phrase: &str) -> usize {
    let words: Vec<&str> = phrase.split_whitespace().collect();
    if words.is_empty() || tokens.len() < words.len() {
        return 0;
    }
    tokens
        .windows(words.len())
        .filter(|w| w.iter().zip(&words).all(|(t, p)| t == p))
        .count()
}

fn has_tension(sentence: &str) -> bool {
    let tokens = tokenize(sentence);
    TENSION_MARKERS.iter().any(|m| phrase_count(&tokens, m) > 0)
}

fn mention_counts(sentences: &[String]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for sentence in sentences {
        for entity in extract_entities(sentence) {
            *counts.entry(entity.key().name).or_insert(0) += 1;
        }
    }
    counts
}

/// Entities in a sentence, in order of first appearance.
fn extract_entities(sentence: &str) -> Vec<ExtractedEntity> {
    let mut entities: Vec<ExtractedEntity> = Vec::new();
    let mut phrase: Vec<String> = Vec::new();

    let words: Vec<String> = sentence
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect();

    for (index, word) in words.iter().enumerate() {
        let lower = word.to_lowercase();
        let lower = lower.trim_end_matches("'s");
        let capitalised = index > 0
            && word != "I"
            && word.len() > 1
            && word.chars().next().is_some_and(char::is_uppercase);

        if capitalised && vocabulary_type(lower).is_none() {
            phrase.push(word.clone());
            continue;
        }
        if !phrase.is_empty() {
            push_unique(&mut entities, ExtractedEntity::new(phrase.join(" "), EntityType::Concept));
            phrase.clear();
        }
        if let Some(entity_type) = vocabulary_type(lower) {
            push_unique(&mut entities, ExtractedEntity::new(capitalise(lower), entity_type));
        }
    }
    if !phrase.is_empty() {
        push_unique(&mut entities, ExtractedEntity::new(phrase.join(" "), EntityType::Concept));
    }

    entities
}

fn push_unique(entities: &mut Vec<ExtractedEntity>, entity: ExtractedEntity) {
    if !entities.iter().any(|e| e.key() == entity.key()) {
        entities.push(entity);
    }
}

fn vocabulary_type(word: &str) -> Option<EntityType> {
    if PERSON_WORDS.contains(&word) {
        Some(EntityType::Person)
    } else if PLACE_WORDS.contains(&word) {
        Some(EntityType::Place)
    } else if SYMBOL_WORDS.contains(&word) {
        Some(EntityType::Symbol)
    } else if SYSTEM_WORDS.contains(&word) {
        Some(EntityType::System)
    } else {
        None
    }
}

fn capitalise(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn saturate(hits: usize) -> f64 {
    1.0 - (-(hits as f64) / 2.0).exp()
}

fn confidence(hits: usize, entities: usize, empty: bool) -> f64 {
    if empty {
        return 0.0;
    }
    (0.2 + 0.15 * hits.min(4) as f64 + 0.05 * entities.min(4) as f64).min(1.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Exchange;

    fn exchange() -> Exchange {
        Exchange::new(
            "x1",
            "c1",
            "I remember my grandmother's garden. We used to sit under the old tree.",
            "It sounds like that garden was a safe place, but you also feel sad now.",
        )
    }

    #[test]
    fn test_phrase_count() {
        let tokens = tokenize("I feel calm, and I feel ready");
        assert_eq!(phrase_count(&tokens, "i feel"), 2);
        assert_eq!(phrase_count(&tokens, "calm"), 1);
        assert_eq!(phrase_count(&tokens, "storm"), 0);
    }

    #[test]
    fn test_extract_entities() {
        let entities = extract_entities("Yesterday my mother drove to Lake Geneva with Sam");
        let names: Vec<_> = entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Mother", "Lake Geneva", "Sam"]);
        assert_eq!(entities[0].entity_type, EntityType::Person);
        assert_eq!(entities[1].entity_type, EntityType::Concept);
    }

    #[tokio::test]
    async fn test_echo_lens_scores_memory_cues() {
        let analyzer = LexicalAnalyzer::new();
        let exchange = exchange();
        let ctx = AnalysisContext::phase1(&exchange);

        let echo = analyzer.analyze(NodeName::Echo, &ctx).await.unwrap();
        assert_eq!(echo.node_name, NodeName::Echo);
        assert!(echo.strength > 0.5);
        assert!(echo.entities.iter().any(|e| e.name == "Garden"));
        assert!(echo.absences.is_empty());
    }

    #[tokio::test]
    async fn test_absent_lens_reports_absence() {
        let analyzer = LexicalAnalyzer::new();
        let exchange = Exchange::new("x2", "c1", "ok", "sure");
        let ctx = AnalysisContext::phase1(&exchange);

        let beacon = analyzer.analyze(NodeName::Beacon, &ctx).await.unwrap();
        assert_eq!(beacon.strength, 0.0);
        assert_eq!(beacon.absences, vec!["no beacon cues".to_string()]);
    }

    #[tokio::test]
    async fn test_gateway_uses_phase1_agreement() {
        let analyzer = LexicalAnalyzer::new();
        let exchange = exchange();
        let ctx = AnalysisContext::phase1(&exchange);

        let mut phase1 = Vec::new();
        for node in NodeName::PHASE1 {
            phase1.push(analyzer.analyze(node, &ctx).await.unwrap());
        }

        let stable = AnalysisContext::gateway(&exchange, &phase1, true);
        let unstable = AnalysisContext::gateway(&exchange, &phase1, false);
        let gw_stable = analyzer.analyze(NodeName::Gateway, &stable).await.unwrap();
        let gw_unstable = analyzer.analyze(NodeName::Gateway, &unstable).await.unwrap();

        assert_eq!(gw_stable.anchor_stable, Some(true));
        assert_eq!(gw_unstable.anchor_stable, Some(false));
        assert!(gw_unstable.strength <= gw_stable.strength);
        assert!(!gw_stable.entities.is_empty());
    }
}
