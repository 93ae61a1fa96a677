//! Exchange dispatcher.
//!
//! Accepts exchanges from the conversation service and enqueues them
//! for analysis. It never waits on analysis; the call returns as soon as
//! the queue acknowledges the job.

use crate::error::{PipelineError, Result};
use crate::models::Exchange;
use crate::queue::{Job, JobId, JobQueue};
use std::sync::Arc;
use tracing::{debug, warn};

/// Front door of the pipeline.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Enqueue an exchange and return its job id.
    ///
    /// Duplicate exchange ids are accepted; the worker makes reprocessing
    /// idempotent. A `QueueUnavailable` error is retryable and is left to
    /// the caller, whose own response path must not depend on it.
    pub async fn enqueue(&self, exchange: Exchange) -> Result<JobId> {
        validate(&exchange)?;

        let job = Job::new(exchange);
        let job_id = job.job_id;
        let exchange_id = job.exchange.exchange_id.clone();

        if let Err(e) = self.queue.push(job).await {
            warn!("Failed to enqueue exchange {}: {}", exchange_id, e);
            return Err(e);
        }

        debug!("Enqueued exchange {} as job {}", exchange_id, job_id);
        Ok(job_id)
    }
}

fn validate(exchange: &Exchange) -> Result<()> {
    if exchange.exchange_id.trim().is_empty() {
        return Err(PipelineError::Validation(
            "exchange_id must not be empty".to_string(),
        ));
    }
    if exchange.conversation_id.trim().is_empty() {
        return Err(PipelineError::Validation(format!(
            "conversation_id must not be empty (exchange {})",
            exchange.exchange_id
        )));
    }
    Ok(())
}
