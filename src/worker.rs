//! Worker pool and two-phase orchestration.
//!
//! Each job moves through
//! `QUEUED -> PHASE1_RUNNING -> PHASE1_DONE -> PHASE2_RUNNING -> MERGING -> COMMITTING -> DONE`.
//! The eight Phase-1 lenses run concurrently and every call is bounded
//! by a timeout; a failed or timed-out call is replaced with a
//! zero-confidence placeholder. GATEWAY starts only once all eight
//! Phase-1 results exist. Commit failures retry from MERGING with the
//! node results already in memory.

use crate::analyzer::{normalize_result, AnalysisContext, NodeAnalyzer};
use crate::config::{AnchorPolicy, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::merger::{merge, MergedGraph};
use crate::models::{Exchange, JobState, NodeName, NodeResult};
use crate::queue::{JobQueue, Lease, NackOutcome};
use crate::store::{CommitUnit, DualStoreWriter};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Counters shared by all workers.
#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    skipped: AtomicU64,
    analyzer_substitutions: AtomicU64,
    commit_retries: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Plain copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub skipped: u64,
    pub analyzer_substitutions: u64,
    pub commit_retries: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            analyzer_substitutions: self.analyzer_substitutions.load(Ordering::Relaxed),
            commit_retries: self.commit_retries.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of running one exchange through the pipeline.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub exchange_id: String,
    pub state: JobState,
    /// Nine results in canonical node order. Empty when skipped.
    pub results: Vec<NodeResult>,
    pub merged: MergedGraph,
    pub anchor_stable: bool,
    /// States visited, in order.
    pub trace: Vec<JobState>,
    /// The exchange was already committed and analysis was skipped.
    pub skipped: bool,
}

impl JobOutcome {
    pub fn result(&self, node: NodeName) -> Option<&NodeResult> {
        self.results.iter().find(|r| r.node_name == node)
    }
}

/// Drives a single exchange through both phases, merge and commit.
pub struct Orchestrator {
    analyzer: Arc<dyn NodeAnalyzer>,
    writer: DualStoreWriter,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
    /// Node results of exchanges whose commit gave up, kept for redelivery.
    uncommitted: Mutex<HashMap<String, Vec<NodeResult>>>,
}

impl Orchestrator {
    pub fn new(
        analyzer: Arc<dyn NodeAnalyzer>,
        writer: DualStoreWriter,
        config: PipelineConfig,
    ) -> Self {
        Self {
            analyzer,
            writer,
            config,
            stats: Arc::new(PipelineStats::default()),
            uncommitted: Mutex::new(HashMap::new()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Drop node results cached for an exchange that will not be redelivered.
    pub async fn discard_cached(&self, exchange_id: &str) {
        if self.uncommitted.lock().await.remove(exchange_id).is_some() {
            debug!("Dropped cached node results for {}", exchange_id);
        }
    }

    /// Run the state machine for one exchange.
    pub async fn process(&self, exchange: &Exchange) -> Result<JobOutcome> {
        let exchange_id = exchange.exchange_id.as_str();
        let mut trace = vec![JobState::Queued];

        if self.config.skip_committed && self.writer.is_committed(exchange_id).await? {
            info!("Exchange {} already committed, skipping", exchange_id);
            PipelineStats::bump(&self.stats.skipped);
            transition(&mut trace, exchange_id, JobState::Done);
            return Ok(JobOutcome {
                exchange_id: exchange_id.to_string(),
                state: JobState::Done,
                results: Vec::new(),
                merged: MergedGraph::default(),
                anchor_stable: false,
                trace,
                skipped: true,
            });
        }

        let cached = self.uncommitted.lock().await.remove(exchange_id);
        let results = match cached {
            Some(results) => {
                debug!("Reusing cached node results for {}", exchange_id);
                results
            }
            None => self.analyze(exchange, &mut trace).await,
        };
        let anchor_stable = results
            .iter()
            .find(|r| r.node_name == NodeName::Gateway)
            .and_then(|r| r.anchor_stable)
            .unwrap_or(false);

        let committed = self.merge_and_commit(exchange, &results, &mut trace).await;
        let merged = match committed {
            Ok(merged) => merged,
            Err(e) => {
                transition(&mut trace, exchange_id, JobState::Failed);
                self.uncommitted
                    .lock()
                    .await
                    .insert(exchange_id.to_string(), results);
                return Err(e);
            }
        };

        transition(&mut trace, exchange_id, JobState::Done);
        PipelineStats::bump(&self.stats.processed);

        Ok(JobOutcome {
            exchange_id: exchange_id.to_string(),
            state: JobState::Done,
            results,
            merged,
            anchor_stable,
            trace,
            skipped: false,
        })
    }

    /// Phase 1, the barrier, then Phase 2. Never fails: analyzer problems
    /// become placeholder results.
    async fn analyze(&self, exchange: &Exchange, trace: &mut Vec<JobState>) -> Vec<NodeResult> {
        let exchange_id = exchange.exchange_id.as_str();

        transition(trace, exchange_id, JobState::Phase1Running);
        let ctx = AnalysisContext::phase1(exchange);
        let calls = NodeName::PHASE1
            .iter()
            .map(|&node| self.call_analyzer(node, &ctx));
        // Barrier: all eight settle (result or placeholder) before GATEWAY.
        let mut results: Vec<NodeResult> = join_all(calls).await;

        transition(trace, exchange_id, JobState::Phase1Done);
        let anchor_stable = results
            .iter()
            .find(|r| r.node_name == NodeName::Anchor)
            .is_some_and(|anchor| {
                !anchor.is_failed() && anchor.strength >= self.config.stability_threshold
            });
        if !anchor_stable {
            info!(
                "ANCHOR below stability threshold {} for {}",
                self.config.stability_threshold, exchange_id
            );
        }

        transition(trace, exchange_id, JobState::Phase2Running);
        let mut gateway = match self.config.unstable_anchor_policy {
            AnchorPolicy::Defer if !anchor_stable => {
                NodeResult::failed(exchange_id, NodeName::Gateway, "deferred: anchor unstable")
            }
            _ => {
                let ctx = AnalysisContext::gateway(exchange, &results, anchor_stable);
                self.call_analyzer(NodeName::Gateway, &ctx).await
            }
        };
        gateway.anchor_stable = Some(anchor_stable);
        results.push(gateway);

        results
    }

    /// One bounded analyzer call. Errors, timeouts and panics all turn into
    /// a zero-confidence placeholder.
    async fn call_analyzer(&self, node: NodeName, ctx: &AnalysisContext<'_>) -> NodeResult {
        let exchange_id = ctx.exchange.exchange_id.as_str();
        let timeout = self.config.analyzer_timeout();
        let call = AssertUnwindSafe(self.analyzer.analyze(node, ctx)).catch_unwind();

        let error = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(Ok(result))) => return normalize_result(result, exchange_id, node),
            Ok(Ok(Err(e))) if e.is_node_level() => e,
            Ok(Ok(Err(e))) => PipelineError::AnalyzerFailure {
                node,
                message: e.to_string(),
            },
            Ok(Err(_panic)) => PipelineError::AnalyzerFailure {
                node,
                message: "analyzer panicked".to_string(),
            },
            Err(_) => PipelineError::AnalyzerTimeout {
                node,
                timeout_ms: self.config.analyzer_timeout_ms,
            },
        };

        warn!("{} for {}; substituting empty result", error, exchange_id);
        PipelineStats::bump(&self.stats.analyzer_substitutions);
        NodeResult::failed(exchange_id, node, error.to_string())
    }

    async fn merge_and_commit(
        &self,
        exchange: &Exchange,
        results: &[NodeResult],
        trace: &mut Vec<JobState>,
    ) -> Result<MergedGraph> {
        let exchange_id = exchange.exchange_id.as_str();
        let attempts = self.config.commit_attempts.max(1);

        for attempt in 1..=attempts {
            transition(trace, exchange_id, JobState::Merging);
            let merged = merge(results);

            transition(trace, exchange_id, JobState::Committing);
            let unit = CommitUnit {
                exchange,
                results,
                merged: &merged,
            };
            let committed = self.writer.commit(&unit).await;
            match committed {
                Ok(_) => return Ok(merged),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Commit attempt {}/{} for {} failed: {}",
                        attempt, attempts, exchange_id, e
                    );
                    PipelineStats::bump(&self.stats.commit_retries);
                }
                Err(e) => {
                    return Err(match e {
                        PipelineError::CommitFailure { .. } => e,
                        other => PipelineError::CommitFailure {
                            exchange_id: exchange_id.to_string(),
                            message: other.to_string(),
                        },
                    });
                }
            }
        }

        Err(PipelineError::CommitFailure {
            exchange_id: exchange_id.to_string(),
            message: "no commit attempts were made".to_string(),
        })
    }
}

fn transition(trace: &mut Vec<JobState>, exchange_id: &str, state: JobState) {
    debug!("{} -> {}", exchange_id, state);
    trace.push(state);
}

/// A set of worker tasks consuming one queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        workers: usize,
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<Orchestrator>,
        job_timeout: Duration,
    ) -> Self {
        let handles = (0..workers.max(1))
            .map(|i| {
                let name = format!("worker-{}", i);
                let queue = queue.clone();
                let orchestrator = orchestrator.clone();
                tokio::spawn(run_worker(name, queue, orchestrator, job_timeout))
            })
            .collect();

        Self { handles }
    }

    /// Wait for every worker to exit. Workers exit once the queue is
    /// closed and drained.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
    }
}

async fn run_worker(
    name: String,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    job_timeout: Duration,
) {
    debug!("{} started", name);
    while let Some(lease) = queue.lease(&name).await {
        handle_lease(&queue, &orchestrator, lease, job_timeout).await;
    }
    debug!("{} stopped", name);
}

async fn handle_lease(
    queue: &Arc<dyn JobQueue>,
    orchestrator: &Orchestrator,
    lease: Lease,
    job_timeout: Duration,
) {
    let span = info_span!(
        "job",
        job_id = %lease.job.job_id,
        exchange_id = %lease.job.exchange.exchange_id,
        conversation_id = %lease.job.exchange.conversation_id,
        delivery = lease.delivery,
    );
    run_job(queue, orchestrator, lease, job_timeout)
        .instrument(span)
        .await
}

/// Process one lease, then ack or nack it.
async fn run_job(
    queue: &Arc<dyn JobQueue>,
    orchestrator: &Orchestrator,
    lease: Lease,
    job_timeout: Duration,
) {
    let job = lease.job;
    let failure = match tokio::time::timeout(job_timeout, orchestrator.process(&job.exchange)).await
    {
        Ok(Ok(outcome)) => {
            if !outcome.skipped {
                let substituted = outcome.results.iter().filter(|r| r.is_failed()).count();
                info!(
                    "Exchange done: {} entities, {} relationships, {} substituted node(s), anchor_stable={}",
                    outcome.merged.entities.len(),
                    outcome.merged.relationships.len(),
                    substituted,
                    outcome.anchor_stable
                );
            }
            if let Err(e) = queue.ack(job.job_id).await {
                warn!("Failed to ack job: {}", e);
            }
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("job timed out after {}ms", job_timeout.as_millis()),
    };

    let stats = orchestrator.stats();
    match queue.nack(job.job_id, &failure).await {
        Ok(NackOutcome::Requeued) => {
            warn!("Job failed, requeued: {}", failure);
            PipelineStats::bump(&stats.requeued);
        }
        Ok(NackOutcome::DeadLettered) => {
            error!(
                "ALERT: exchange {} dead-lettered after {} deliveries: {}",
                job.exchange.exchange_id, lease.delivery, failure
            );
            PipelineStats::bump(&stats.dead_lettered);
            orchestrator.discard_cached(&job.exchange.exchange_id).await;
        }
        Err(e) => warn!("Failed to nack job: {}", e),
    }
}
