//! Model-backed analyzer over the Ollama chat API.
//!
//! Each lens is a system prompt; the model answers with a single JSON
//! object that is parsed into a [`NodeResult`].

use super::{AnalysisContext, NodeAnalyzer};
use crate::error::{PipelineError, Result};
use crate::models::{
    EntityType, ExtractedEntity, ExtractedRelationship, NodeName, NodeResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Configuration for the Ollama analyzer.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub ollama_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model_name: "llama3.2:latest".to_string(),
            temperature: 0.1,
            timeout_seconds: 60,
        }
    }
}

impl From<&crate::config::ModelConfig> for OllamaConfig {
    fn from(config: &crate::config::ModelConfig) -> Self {
        Self {
            ollama_url: config.ollama_url.clone(),
            model_name: config.name.clone(),
            temperature: config.temperature,
            timeout_seconds: config.timeout_seconds,
        }
    }
}

/// Message in the chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: String,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// Analyzer that asks an Ollama model to score each lens.
pub struct OllamaAnalyzer {
    config: OllamaConfig,
    http_client: reqwest::Client,
}

impl OllamaAnalyzer {
    pub fn new(config: OllamaConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            config,
            http_client,
        })
    }

    async fn send_prompt(&self, node: NodeName, system: String, user: String) -> Result<String> {
        let url = format!("{}/api/chat", self.config.ollama_url);
        let failure = |message: String| PipelineError::AnalyzerFailure { node, message };

        let request = OllamaChatRequest {
            model: self.config.model_name.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system,
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            stream: false,
            format: "json".to_string(),
            options: OllamaOptions {
                temperature: self.config.temperature,
            },
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::AnalyzerTimeout {
                        node,
                        timeout_ms: self.config.timeout_seconds * 1000,
                    }
                } else if e.is_connect() {
                    failure(format!("Cannot connect to Ollama at {}", self.config.ollama_url))
                } else {
                    failure(format!("Failed to send request: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(failure(format!("Ollama API error {}: {}", status, body)));
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| failure(format!("Failed to parse Ollama response: {}", e)))?;

        Ok(chat_response.message.content)
    }
}

#[async_trait]
impl NodeAnalyzer for OllamaAnalyzer {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn analyze(&self, node: NodeName, ctx: &AnalysisContext<'_>) -> Result<NodeResult> {
        let system = format!("{}\n\n{}", lens_prompt(node), RESPONSE_FORMAT);
        let user = build_user_prompt(node, ctx)?;

        debug!("Requesting {} analysis for {}", node, ctx.exchange.exchange_id);
        let content = self.send_prompt(node, system, user).await?;

        parse_node_result(&content, &ctx.exchange.exchange_id, node).ok_or_else(|| {
            PipelineError::AnalyzerFailure {
                node,
                message: "Model response did not contain a JSON object".to_string(),
            }
        })
    }
}

fn build_user_prompt(node: NodeName, ctx: &AnalysisContext<'_>) -> Result<String> {
    let mut prompt = String::new();
    prompt.push_str("=== EXCHANGE ===\n");
    prompt.push_str(&format!("USER: {}\n", ctx.exchange.user_text));
    prompt.push_str(&format!("ASSISTANT: {}\n", ctx.exchange.assistant_text));

    if node == NodeName::Gateway {
        let summaries: Vec<Value> = ctx
            .phase1
            .iter()
            .map(|r| {
                serde_json::json!({
                    "node": r.node_name,
                    "strength": r.strength,
                    "confidence": r.confidence,
                    "summary": r.functional_summary,
                    "entities": r.entities.iter().map(|e| &e.name).collect::<Vec<_>>(),
                    "failed": r.is_failed(),
                })
            })
            .collect();
        prompt.push_str("\n=== PHASE 1 RESULTS ===\n");
        prompt.push_str(&serde_json::to_string_pretty(&summaries)?);
        prompt.push_str(&format!(
            "\nANCHOR stable: {}\n",
            ctx.anchor_stable.unwrap_or(false)
        ));
    }

    prompt.push_str("\nRespond with the JSON object only.");
    Ok(prompt)
}

/// Extract the outermost JSON object from a model reply.
fn parse_node_result(response: &str, exchange_id: &str, node: NodeName) -> Option<NodeResult> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end < start {
        return None;
    }
    let json: Value = serde_json::from_str(&response[start..=end]).ok()?;

    let mut result = NodeResult::empty(exchange_id, node);
    result.confidence = json["confidence"].as_f64().unwrap_or(0.0);
    result.strength = json["strength"].as_f64().unwrap_or(0.0);
    result.functional_summary = json["functional_summary"]
        .as_str()
        .unwrap_or("")
        .to_string();
    result.tensions = string_list(&json["tensions"]);
    result.absences = string_list(&json["absences"]);

    if let Some(entities) = json["entities"].as_array() {
        result.entities = entities.iter().filter_map(json_to_entity).collect();
    }
    if let Some(relationships) = json["relationships"].as_array() {
        result.relationships = relationships
            .iter()
            .filter_map(json_to_relationship)
            .collect();
    }

    Some(result)
}

fn json_to_entity(json: &Value) -> Option<ExtractedEntity> {
    Some(ExtractedEntity {
        name: json["name"].as_str()?.to_string(),
        entity_type: EntityType::from(json["type"].as_str().unwrap_or("concept")),
        attributes: string_map(&json["attributes"]),
    })
}

fn json_to_relationship(json: &Value) -> Option<ExtractedRelationship> {
    Some(ExtractedRelationship {
        source: json["source"].as_str()?.to_string(),
        source_type: EntityType::from(json["source_type"].as_str().unwrap_or("concept")),
        target: json["target"].as_str()?.to_string(),
        target_type: EntityType::from(json["target_type"].as_str().unwrap_or("concept")),
        label: json["label"].as_str().unwrap_or("related_to").to_string(),
        attributes: string_map(&json["attributes"]),
    })
}

fn string_list(json: &Value) -> Vec<String> {
    json.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn string_map(json: &Value) -> BTreeMap<String, String> {
    json.as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn lens_prompt(node: NodeName) -> &'static str {
    match node {
        NodeName::Anchor => "You are the ANCHOR lens. Assess how grounded and stable the speaker's footing is: routines, safe places, certainties.",
        NodeName::Echo => "You are the ECHO lens. Identify recurring memories, repeated patterns and references to the past.",
        NodeName::Beacon => "You are the BEACON lens. Identify aspirations, goals and the direction the speaker is reaching toward.",
        NodeName::Synth => "You are the SYNTH lens. Identify how ideas are being connected, reasoned about or integrated.",
        NodeName::Nexus => "You are the NEXUS lens. Identify people and the relationships between them.",
        NodeName::Mirror => "You are the MIRROR lens. Identify self-reflection and how the speaker describes themself.",
        NodeName::Glyph => "You are the GLYPH lens. Identify symbols, images and metaphors.",
        NodeName::Harmonia => "You are the HARMONIA lens. Assess emotional tone and balance.",
        NodeName::Gateway => "You are the GATEWAY lens. Using the exchange and the eight Phase 1 lens results, assess readiness for change and the thresholds the speaker is approaching.",
    }
}

const RESPONSE_FORMAT: &str = r#"Reply with one JSON object of this shape:
{"entities": [{"name": "...", "type": "person|place|concept|system|symbol", "attributes": {}}],
 "relationships": [{"source": "...", "source_type": "...", "target": "...", "target_type": "...", "label": "..."}],
 "tensions": ["..."], "absences": ["..."], "functional_summary": "...",
 "confidence": 0.0, "strength": 0.0}
confidence is how sure you are the elements exist in the text; strength is how strongly this lens is activated. Both are between 0 and 1."#;
