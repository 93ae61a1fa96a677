//! Node analyzers.
//!
//! A node analyzer scores one exchange through one lens. The pipeline
//! only depends on the [`NodeAnalyzer`] trait; implementations are
//! free to be model-backed or rule-based.

pub mod lexical;
pub mod ollama;

pub use lexical::LexicalAnalyzer;
pub use ollama::{OllamaAnalyzer, OllamaConfig};

use crate::error::Result;
use crate::models::{Exchange, NodeName, NodeResult};
use async_trait::async_trait;

/// Input handed to an analyzer call.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisContext<'a> {
    pub exchange: &'a Exchange,
    /// Complete Phase-1 result set. Empty for Phase-1 calls.
    pub phase1: &'a [NodeResult],
    /// Stability flag computed from ANCHOR. Only set for GATEWAY.
    pub anchor_stable: Option<bool>,
}

impl<'a> AnalysisContext<'a> {
    pub fn phase1(exchange: &'a Exchange) -> Self {
        Self {
            exchange,
            phase1: &[],
            anchor_stable: None,
        }
    }

    pub fn gateway(exchange: &'a Exchange, phase1: &'a [NodeResult], anchor_stable: bool) -> Self {
        Self {
            exchange,
            phase1,
            anchor_stable: Some(anchor_stable),
        }
    }
}

/// Opaque scoring capability.
#[async_trait]
pub trait NodeAnalyzer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Analyze the exchange through a single lens.
    async fn analyze(&self, node: NodeName, ctx: &AnalysisContext<'_>) -> Result<NodeResult>;
}

/// Force the identity fields and clamp scores into [0, 1].
pub fn normalize_result(mut result: NodeResult, exchange_id: &str, node: NodeName) -> NodeResult {
    result.exchange_id = exchange_id.to_string();
    result.node_name = node;
    result.confidence = clamp_unit(result.confidence);
    result.strength = clamp_unit(result.strength);
    if node != NodeName::Gateway {
        result.anchor_stable = None;
    }
    result
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
