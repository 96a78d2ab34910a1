// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The orchestrator that ties together:
//! - Type correspondence via [`crate::registry::TypeRegistry`]
//! - Graph conversion via [`crate::transcode::Transcoder`]
//! - Slave writes via [`crate::updater::SlaveUpdater`]
//! - The durable [`crate::queue::PendingQueue`] and its single
//!   [`crate::worker::QueueWorker`]
//!
//! # Lifecycle
//!
//! 1. [`open()`](ReplicationEngine::open) builds the registry from the
//!    configured units and restores the queue from its snapshot
//! 2. [`listener()`](ReplicationEngine::listener) hands out the master-side
//!    hook; it can enqueue before the worker starts
//! 3. [`start()`](ReplicationEngine::start) spawns the worker
//! 4. [`shutdown()`](ReplicationEngine::shutdown) stops the queue (writing
//!    the snapshot) and waits for the worker to finish its current apply

mod types;

pub use types::{EngineState, HealthCheck};

use crate::catalog::Catalog;
use crate::classify::{CommunicationFailure, FailureClassifier};
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::listener::ReplicationListener;
use crate::metrics;
use crate::queue::{PendingQueue, QueueState};
use crate::registry::TypeRegistry;
use crate::snapshot::SnapshotFile;
use crate::store::{MemoryStore, SlaveStore};
use crate::transcode::Transcoder;
use crate::updater::SlaveUpdater;
use crate::worker::{QueueWorker, WorkerStats};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The main replication engine.
///
/// Mirrors master-side entity mutations onto a slave store, asynchronously
/// and in order.
pub struct ReplicationEngine<S: SlaveStore = MemoryStore> {
    /// Configuration the engine was opened with
    config: ReplicationConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    registry: Arc<TypeRegistry>,

    transcoder: Arc<Transcoder>,

    updater: Arc<SlaveUpdater<S>>,

    queue: Arc<PendingQueue>,

    classifier: Arc<dyn FailureClassifier>,

    /// Replaced by the worker's counters on start
    stats: Arc<WorkerStats>,

    worker_handle: Option<JoinHandle<()>>,
}

impl<S: SlaveStore> ReplicationEngine<S> {
    /// Build an engine and restore its pending queue.
    ///
    /// `master` and `slave` may be the same catalog when
    /// `config.types` selects different units for each side. Snapshot
    /// payloads are rebuilt against `master`.
    pub async fn open(
        config: ReplicationConfig,
        master: Arc<dyn Catalog>,
        slave: Arc<dyn Catalog>,
        store: Arc<S>,
    ) -> Result<Self> {
        config.validate()?;

        let types = &config.types;
        let mut builder = TypeRegistry::from_catalogs(
            master.as_ref(),
            |unit| types.accepts_master_unit(unit),
            slave.as_ref(),
            |unit| types.accepts_slave_unit(unit),
        );
        for mapping in &types.explicit {
            builder = builder.map(mapping.master.as_str(), mapping.slave.as_str());
        }
        let registry = Arc::new(builder.build()?);

        let transcoder = Arc::new(Transcoder::new(
            Arc::clone(&registry),
            Arc::clone(&master),
            slave,
        ));
        let updater = Arc::new(SlaveUpdater::new(Arc::clone(&transcoder), store));

        let queue = if config.disabled {
            info!("Replication disabled, lifecycle hooks are discarded");
            Arc::new(PendingQueue::no_op())
        } else {
            let snapshot = SnapshotFile::new(config.snapshot.path.clone());
            Arc::new(PendingQueue::open(snapshot, master.as_ref()).await)
        };

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        metrics::set_engine_state(EngineState::Created.as_str());

        info!(
            master_types = registry.master_types().len(),
            slave_types = registry.slave_types().len(),
            restored = queue.size().await,
            snapshot = %config.snapshot.path.display(),
            "Replication engine opened"
        );

        Ok(Self {
            config,
            state_tx,
            state_rx,
            registry,
            transcoder,
            updater,
            queue,
            classifier: Arc::new(CommunicationFailure),
            stats: Arc::new(WorkerStats::default()),
            worker_handle: None,
        })
    }

    /// Replace the transient/permanent classifier. Takes effect on `start()`.
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn transcoder(&self) -> &Arc<Transcoder> {
        &self.transcoder
    }

    pub fn updater(&self) -> &Arc<SlaveUpdater<S>> {
        &self.updater
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    /// Master-side hook feeding this engine's queue.
    pub fn listener(&self) -> ReplicationListener {
        ReplicationListener::new(Arc::clone(&self.queue), Arc::clone(&self.registry))
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Stop applying operations; producers keep enqueuing.
    pub fn pause(&self) -> Result<bool> {
        self.queue.pause()
    }

    pub fn resume(&self) -> Result<bool> {
        self.queue.resume()
    }

    /// Health snapshot for monitoring endpoints. No slave I/O.
    pub async fn health(&self) -> HealthCheck {
        let state = self.state();
        let queue_state = self.queue.state();
        let paused = queue_state == QueueState::Paused;
        HealthCheck {
            state,
            queue_state,
            paused,
            queue_depth: self.queue.size().await,
            mark: self.queue.get_mark().await,
            applied: self.stats.applied(),
            dropped: self.stats.dropped(),
            retried: self.stats.retried(),
            healthy: state == EngineState::Running && queue_state == QueueState::Running,
        }
    }

    /// Spawn the queue worker.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::invalid_state("Created", self.state()));
        }

        let retry = self.config.worker.retry_config();
        info!(
            pending = self.queue.size().await,
            max_transient_retries = ?self.config.worker.max_transient_retries,
            "Starting replication engine"
        );

        let worker = QueueWorker::new(Arc::clone(&self.queue), Arc::clone(&self.updater))
            .with_classifier(Arc::clone(&self.classifier))
            .with_retry(retry);
        self.stats = worker.stats();
        self.worker_handle = Some(worker.spawn());

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state(EngineState::Running.as_str());
        info!("Replication engine running");
        Ok(())
    }

    /// Shutdown the replication engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Stop the queue (pending operations are written to the snapshot)
    /// 2. Wait for the worker to finish its in-flight apply and exit
    ///
    /// Calling it again after `Stopped` is a no-op.
    pub async fn shutdown(&mut self) {
        if self.state() == EngineState::Stopped {
            return;
        }
        info!("Shutting down replication engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state(EngineState::ShuttingDown.as_str());

        self.queue.request_stop().await;

        if let Some(handle) = self.worker_handle.take() {
            match handle.await {
                Ok(()) => debug!("Worker exited"),
                Err(e) => warn!(error = %e, "Worker panicked during shutdown"),
            }
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state(EngineState::Stopped.as_str());
        info!(
            applied = self.stats.applied(),
            dropped = self.stats.dropped(),
            "Replication engine stopped"
        );
    }
}

impl<S: SlaveStore> std::fmt::Debug for ReplicationEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("state", &self.state())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::config::TypeMapping;
    use crate::entity::{EntitySchema, EntityType};
    use crate::operation::OperationKind;
    use tempfile::tempdir;

    fn catalog() -> Arc<dyn Catalog> {
        Arc::new(
            StaticCatalog::new()
                .with_unit(
                    "master",
                    [EntitySchema::builder("master.Unit")
                        .id("id")
                        .scalar("name")
                        .build()
                        .unwrap()],
                )
                .unwrap()
                .with_unit(
                    "slave",
                    [EntitySchema::builder("slave.Unit")
                        .id("id")
                        .scalar("name")
                        .build()
                        .unwrap()],
                )
                .unwrap(),
        )
    }

    fn config(dir: &tempfile::TempDir) -> ReplicationConfig {
        let mut config = ReplicationConfig::for_testing(dir.path().join("pending.json"));
        config.types.master_units = vec!["master".into()];
        config.types.slave_units = vec!["slave".into()];
        config
    }

    async fn engine(dir: &tempfile::TempDir) -> ReplicationEngine {
        let c = catalog();
        ReplicationEngine::open(config(dir), Arc::clone(&c), c, Arc::new(MemoryStore::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_engine_initial_state() {
        let dir = tempdir().unwrap();
        let engine = engine(&dir).await;

        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
        assert!(engine.registry().is_master_type(&EntityType::new("master.Unit")));
        assert!(engine.registry().is_slave_type(&EntityType::new("slave.Unit")));
        assert!(!engine.registry().is_master_type(&EntityType::new("slave.Unit")));
    }

    #[tokio::test]
    async fn test_engine_start_invalid_state() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir).await;

        engine.start().await.unwrap();
        assert!(engine.is_running());

        let result = engine.start().await;
        if let Err(ReplicationError::InvalidState { expected, actual }) = result {
            assert_eq!(expected, "Created");
            assert_eq!(actual, "Running");
        } else {
            panic!("Expected InvalidState error");
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_shutdown_from_created() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir).await;

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.queue().is_stopped());

        // Second call is a no-op
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_disabled_engine_discards_and_writes_nothing() {
        let dir = tempdir().unwrap();
        let c = catalog();
        let mut config = config(&dir);
        config.disabled = true;
        let mut engine =
            ReplicationEngine::open(config, Arc::clone(&c), Arc::clone(&c), Arc::new(MemoryStore::new()))
                .await
                .unwrap();
        assert!(engine.queue().is_no_op());

        engine.start().await.unwrap();
        let unit = c.new_instance(&EntityType::new("master.Unit")).unwrap();
        unit.write().set_by_name("id", 1).unwrap();
        engine.listener().notify(OperationKind::Create, &unit).await;
        assert_eq!(engine.queue().size().await, 0);

        engine.shutdown().await;
        assert!(engine.updater().store().is_empty());
        assert!(!dir.path().join("pending.json").exists());
    }

    #[tokio::test]
    async fn test_engine_state_receiver() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir).await;
        let rx = engine.state_receiver();

        engine.start().await.unwrap();
        assert_eq!(*rx.borrow(), EngineState::Running);
        engine.shutdown().await;
        assert_eq!(*rx.borrow(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_health_reflects_pause_and_mark() {
        let dir = tempdir().unwrap();
        let c = catalog();
        let engine = engine(&dir).await;

        engine.pause().unwrap();
        let unit = c.new_instance(&EntityType::new("master.Unit")).unwrap();
        unit.write().set_by_name("id", 1).unwrap();
        engine.queue().enqueue(OperationKind::Create, unit).await.unwrap();
        engine.queue().mark().await;

        let health = engine.health().await;
        assert_eq!(health.state, EngineState::Created);
        assert!(health.paused);
        assert_eq!(health.queue_depth, 1);
        assert_eq!(health.mark, Some(1));
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_explicit_mapping() {
        let dir = tempdir().unwrap();
        let mut config = config(&dir);
        config.types.explicit.push(TypeMapping {
            master: "master.Missing".into(),
            slave: "slave.Unit".into(),
        });
        let c = catalog();
        let result =
            ReplicationEngine::open(config, Arc::clone(&c), c, Arc::new(MemoryStore::new())).await;
        assert!(matches!(result, Err(ReplicationError::Registry(_))));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let mut config = config(&dir);
        config.worker.retry_backoff_factor = 0.0;
        let c = catalog();
        let result =
            ReplicationEngine::open(config, Arc::clone(&c), c, Arc::new(MemoryStore::new())).await;
        assert!(matches!(result, Err(ReplicationError::Config(_))));
    }
}
