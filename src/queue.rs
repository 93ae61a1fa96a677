//! Job queue.
//!
//! The production deployment sits on a durable log with consumer-group
//! semantics; [`JobQueue`] is the boundary the pipeline needs from it.
//! [`InMemoryQueue`] implements the same contract in process: FIFO
//! order, a visibility lease per delivery, bounded redelivery and a
//! dead-letter list.

use crate::error::{PipelineError, Result};
use crate::models::Exchange;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub type JobId = Uuid;

/// A queued request to analyze one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub exchange: Exchange,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(exchange: Exchange) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            exchange,
            enqueued_at: Utc::now(),
        }
    }
}

/// A job handed to one consumer.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: Job,
    /// 1 for the first delivery.
    pub delivery: u32,
}

/// What `nack` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued,
    DeadLettered,
}

/// A job that exhausted its deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: Job,
    pub deliveries: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub acked: u64,
    pub dead_lettered: usize,
    pub closed: bool,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably accept a job. Fails with `QueueUnavailable` when full or closed.
    async fn push(&self, job: Job) -> Result<()>;

    /// Wait for the next visible job. Returns `None` once the queue is
    /// closed and every job has been acknowledged or dead-lettered.
    async fn lease(&self, consumer: &str) -> Option<Lease>;

    async fn ack(&self, job_id: JobId) -> Result<()>;

    /// Give a job back after a failed attempt.
    async fn nack(&self, job_id: JobId, reason: &str) -> Result<NackOutcome>;

    /// Stop accepting new jobs; consumers drain what is left.
    async fn close(&self);

    async fn stats(&self) -> QueueStats;

    async fn dead_letters(&self) -> Vec<DeadLetter>;
}

struct InFlight {
    job: Job,
    delivery: u32,
    consumer: String,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    /// Jobs with the number of deliveries they already had.
    pending: VecDeque<(Job, u32)>,
    in_flight: HashMap<JobId, InFlight>,
    dead: Vec<DeadLetter>,
    acked: u64,
    closed: bool,
}

impl QueueState {
    fn dead_letter(&mut self, job: Job, deliveries: u32, reason: &str) {
        warn!(
            "Dead-lettering job {} (exchange {}) after {} deliveries: {}",
            job.job_id, job.exchange.exchange_id, deliveries, reason
        );
        self.dead.push(DeadLetter {
            job,
            deliveries,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
    }

    /// Return expired leases to the queue.
    fn reclaim_expired(&mut self, now: Instant, max_deliveries: u32) {
        let expired: Vec<JobId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for job_id in expired {
            if let Some(flight) = self.in_flight.remove(&job_id) {
                debug!(
                    "Lease on job {} held by {} expired",
                    job_id, flight.consumer
                );
                if flight.delivery >= max_deliveries {
                    self.dead_letter(flight.job, flight.delivery, "visibility timeout");
                } else {
                    self.pending.push_front((flight.job, flight.delivery));
                }
            }
        }
    }

    fn exchange_in_flight(&self, exchange_id: &str) -> bool {
        self.in_flight
            .values()
            .any(|f| f.job.exchange.exchange_id == exchange_id)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.deadline).min()
    }
}

/// In-process queue with lease and dead-letter semantics.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    max_deliveries: u32,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(capacity: usize, max_deliveries: u32, visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
            max_deliveries: max_deliveries.max(1),
            visibility_timeout,
        }
    }

    pub fn from_config(config: &crate::config::QueueConfig) -> Self {
        Self::new(
            config.capacity,
            config.max_deliveries,
            config.visibility_timeout(),
        )
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn push(&self, job: Job) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(PipelineError::QueueUnavailable("queue is closed".to_string()));
        }
        if state.pending.len() + state.in_flight.len() >= self.capacity {
            return Err(PipelineError::QueueUnavailable(format!(
                "queue is full ({} jobs)",
                self.capacity
            )));
        }
        state.pending.push_back((job, 0));
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn lease(&self, consumer: &str) -> Option<Lease> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.reclaim_expired(now, self.max_deliveries);

                // Never hand out an exchange another consumer is still working on.
                let position = state
                    .pending
                    .iter()
                    .position(|(job, _)| !state.exchange_in_flight(&job.exchange.exchange_id));

                if let Some((job, previous)) = position.and_then(|i| state.pending.remove(i)) {
                    let delivery = previous + 1;
                    state.in_flight.insert(
                        job.job_id,
                        InFlight {
                            job: job.clone(),
                            delivery,
                            consumer: consumer.to_string(),
                            deadline: now + self.visibility_timeout,
                        },
                    );
                    debug!(
                        "{} leased job {} (delivery {})",
                        consumer, job.job_id, delivery
                    );
                    return Some(Lease { job, delivery });
                }

                if state.closed && state.pending.is_empty() && state.in_flight.is_empty() {
                    return None;
                }

                state
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(now))
                    .unwrap_or(self.visibility_timeout)
            };

            // Woken by a push, ack or nack, or by the next lease deadline.
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&job_id).is_some() {
            state.acked += 1;
        } else {
            debug!("Ack for job {} without an active lease", job_id);
        }
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, job_id: JobId, reason: &str) -> Result<NackOutcome> {
        let mut state = self.state.lock().await;
        let Some(flight) = state.in_flight.remove(&job_id) else {
            return Err(PipelineError::QueueUnavailable(format!(
                "job {} has no active lease",
                job_id
            )));
        };

        let outcome = if flight.delivery >= self.max_deliveries {
            state.dead_letter(flight.job, flight.delivery, reason);
            NackOutcome::DeadLettered
        } else {
            debug!("Requeueing job {}: {}", job_id, reason);
            state.pending.push_back((flight.job, flight.delivery));
            NackOutcome::Requeued
        };
        drop(state);

        self.notify.notify_waiters();
        Ok(outcome)
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
            acked: state.acked,
            dead_lettered: state.dead.len(),
            closed: state.closed,
        }
    }

    async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(exchange_id: &str) -> Job {
        Job::new(Exchange::new(exchange_id, "c1", "hi", "hello"))
    }

    fn queue() -> InMemoryQueue {
        InMemoryQueue::new(8, 2, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_fifo_lease_and_ack() {
        let queue = queue();
        queue.push(job("x1")).await.unwrap();
        queue.push(job("x2")).await.unwrap();

        let first = queue.lease("w1").await.unwrap();
        assert_eq!(first.job.exchange.exchange_id, "x1");
        assert_eq!(first.delivery, 1);
        queue.ack(first.job.job_id).await.unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.acked, 1);
    }

    #[tokio::test]
    async fn test_full_or_closed_queue_is_unavailable() {
        let queue = InMemoryQueue::new(1, 2, Duration::from_secs(30));
        queue.push(job("x1")).await.unwrap();
        let err = queue.push(job("x2")).await.unwrap_err();
        assert!(matches!(err, PipelineError::QueueUnavailable(_)));
        assert!(err.is_retryable());

        queue.close().await;
        assert!(queue.push(job("x3")).await.is_err());
    }

    #[tokio::test]
    async fn test_nack_requeues_then_dead_letters() {
        let queue = queue();
        queue.push(job("x1")).await.unwrap();

        let lease = queue.lease("w1").await.unwrap();
        let outcome = queue.nack(lease.job.job_id, "boom").await.unwrap();
        assert_eq!(outcome, NackOutcome::Requeued);

        let lease = queue.lease("w1").await.unwrap();
        assert_eq!(lease.delivery, 2);
        let outcome = queue.nack(lease.job.job_id, "boom again").await.unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "boom again");
        assert_eq!(dead[0].deliveries, 2);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let queue = InMemoryQueue::new(8, 3, Duration::from_millis(20));
        queue.push(job("x1")).await.unwrap();

        let first = queue.lease("w1").await.unwrap();
        let second = queue.lease("w2").await.unwrap();
        assert_eq!(first.job.job_id, second.job.job_id);
        assert_eq!(second.delivery, 2);
    }

    #[tokio::test]
    async fn test_same_exchange_not_leased_twice_concurrently() {
        let queue = queue();
        queue.push(job("x1")).await.unwrap();
        queue.push(job("x1")).await.unwrap();
        queue.push(job("x2")).await.unwrap();

        let first = queue.lease("w1").await.unwrap();
        let second = queue.lease("w2").await.unwrap();
        assert_eq!(first.job.exchange.exchange_id, "x1");
        assert_eq!(second.job.exchange.exchange_id, "x2");

        queue.ack(first.job.job_id).await.unwrap();
        let third = queue.lease("w1").await.unwrap();
        assert_eq!(third.job.exchange.exchange_id, "x1");
    }

    #[tokio::test]
    async fn test_closed_queue_drains_then_ends() {
        let queue = queue();
        queue.push(job("x1")).await.unwrap();
        queue.close().await;

        let lease = queue.lease("w1").await.unwrap();
        queue.ack(lease.job.job_id).await.unwrap();
        assert!(queue.lease("w1").await.is_none());
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_push() {
        let queue = std::sync::Arc::new(queue());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.lease("w1").await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(job("x9")).await.unwrap();

        let lease = consumer.await.unwrap().unwrap();
        assert_eq!(lease.job.exchange.exchange_id, "x9");
    }
}
