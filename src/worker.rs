// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue worker: drains the pending queue into the slave store.
//!
//! Exactly one worker runs per queue. Each iteration takes the list's write
//! lock, applies the head operation through the [`Updater`], and then:
//!
//! | Outcome                          | Head      | Next step                 |
//! |----------------------------------|-----------|---------------------------|
//! | success                          | popped    | next head immediately     |
//! | transient failure, budget left   | retained  | back off, retry same head |
//! | permanent or budget exhausted    | popped    | next head immediately     |
//!
//! A paused queue idles the worker until resumed; a stopped queue ends it.
//! Neither interrupts an apply already in progress.

use crate::classify::{CommunicationFailure, FailureClassifier};
use crate::entity::EntityRef;
use crate::error::ReplicationError;
use crate::metrics;
use crate::operation::{Operation, OperationKind};
use crate::queue::{PendingQueue, QueueState};
use crate::resilience::RetryConfig;
use crate::updater::Updater;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Counters for the lifetime of one worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    applied: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
}

impl WorkerStats {
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }
}

/// Result of one pass over the head of the queue.
#[derive(Debug, PartialEq)]
enum Step {
    Applied,
    Dropped,
    /// Head kept; wait this long before the next attempt.
    Backoff(Duration),
    /// Nothing queued.
    Idle,
    /// State left Running while waiting for the lock.
    Interrupted,
}

/// Failure count of the current head, reset when the head changes.
#[derive(Default)]
struct HeadFailures {
    head: Option<(EntityRef, DateTime<Utc>, OperationKind)>,
    count: usize,
}

impl HeadFailures {
    fn record(&mut self, op: &Operation) -> usize {
        let same = matches!(
            &self.head,
            Some((entity, at, kind))
                if entity == op.entity() && *at == op.enqueued_at() && *kind == op.kind()
        );
        if same {
            self.count += 1;
        } else {
            self.head = Some((op.entity().clone(), op.enqueued_at(), op.kind()));
            self.count = 1;
        }
        self.count
    }

    fn clear(&mut self) {
        self.head = None;
        self.count = 0;
    }
}

/// Background consumer of a [`PendingQueue`].
pub struct QueueWorker<U: Updater> {
    queue: Arc<PendingQueue>,
    updater: Arc<U>,
    classifier: Arc<dyn FailureClassifier>,
    retry: RetryConfig,
    stats: Arc<WorkerStats>,
}

impl<U: Updater> QueueWorker<U> {
    /// Worker with the default classifier and retry policy.
    pub fn new(queue: Arc<PendingQueue>, updater: Arc<U>) -> Self {
        Self {
            queue,
            updater,
            classifier: Arc::new(CommunicationFailure),
            retry: RetryConfig::default(),
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Shared counters; stays readable after the worker exits.
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Run on the current runtime until the queue is stopped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drain the queue until it is stopped.
    pub async fn run(self) {
        let span = tracing::info_span!("replication_worker");
        async move {
            info!("Queue worker started");
            let mut state_rx = self.queue.subscribe();
            let mut failures = HeadFailures::default();

            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    QueueState::Stopped => break,
                    QueueState::Paused => {
                        debug!("Worker idle while paused");
                        if state_rx.changed().await.is_err() {
                            break;
                        }
                        continue;
                    }
                    QueueState::Running => {}
                }

                // Registered before looking at the list so an enqueue racing
                // with the empty check still wakes us.
                let notified = self.queue.notified();

                match self.attempt_head(&mut failures).await {
                    Step::Applied | Step::Dropped | Step::Interrupted => {}
                    Step::Idle => {
                        tokio::select! {
                            _ = notified => {}
                            changed = state_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Step::Backoff(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            changed = state_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            info!(
                applied = self.stats.applied(),
                dropped = self.stats.dropped(),
                retried = self.stats.retried(),
                "Queue worker stopped"
            );
        }
        .instrument(span)
        .await
    }

    async fn attempt_head(&self, failures: &mut HeadFailures) -> Step {
        let mut list = self.queue.lock_for_apply().await;
        if self.queue.state() != QueueState::Running {
            return Step::Interrupted;
        }
        let Some(op) = list.head().cloned() else {
            return Step::Idle;
        };

        let started = Instant::now();
        let error = match self.updater.apply(&op).await {
            Ok(()) => {
                list.pop_head();
                failures.clear();
                metrics::record_operation_applied(op.kind().as_str(), started.elapsed());
                metrics::set_queue_depth(list.len());
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
                debug!(kind = %op.kind(), entity = ?op.entity(), "Operation applied");
                return Step::Applied;
            }
            Err(e) => e,
        };

        let failed = failures.record(&op);
        let transient = self.classifier.is_transient(&error);
        if transient && !self.retry.is_exhausted(failed - 1) {
            let delay = self.retry.delay_for_attempt(failed);
            metrics::record_operation_retried(op.kind().as_str());
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                kind = %op.kind(),
                entity = ?op.entity(),
                attempt = failed,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, keeping operation at head"
            );
            return Step::Backoff(delay);
        }

        let reason = if transient { "retries_exhausted" } else { "permanent" };
        self.drop_head(&op, &error, reason);
        list.pop_head();
        failures.clear();
        metrics::set_queue_depth(list.len());
        Step::Dropped
    }

    fn drop_head(&self, op: &Operation, error: &ReplicationError, reason: &'static str) {
        warn!(
            kind = %op.kind(),
            entity_type = %op.entity().entity_type(),
            entity = ?op.entity(),
            error = %error,
            reason,
            "Dropping operation"
        );
        metrics::record_operation_dropped(op.kind().as_str(), reason);
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl<U: Updater> std::fmt::Debug for QueueWorker<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("queue", &self.queue)
            .field("retry", &self.retry)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
