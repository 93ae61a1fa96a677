//! Pipeline error types.

use crate::models::NodeName;

/// Alias for Results returning [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised inside the analysis pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Analyzer {node} timed out after {timeout_ms}ms")]
    AnalyzerTimeout { node: NodeName, timeout_ms: u64 },

    #[error("Analyzer {node} failed: {message}")]
    AnalyzerFailure { node: NodeName, message: String },

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Commit failed for exchange {exchange_id}: {message}")]
    CommitFailure {
        exchange_id: String,
        message: String,
    },

    #[error("Aggregate update for conversation {conversation_id} conflicted {attempts} times")]
    AggregateRace {
        conversation_id: String,
        attempts: u32,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether the caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::QueueUnavailable(_)
                | PipelineError::CommitFailure { .. }
                | PipelineError::AggregateRace { .. }
        )
    }

    /// Single-node failures never fail the exchange.
    pub fn is_node_level(&self) -> bool {
        matches!(
            self,
            PipelineError::AnalyzerTimeout { .. } | PipelineError::AnalyzerFailure { .. }
        )
    }
}
