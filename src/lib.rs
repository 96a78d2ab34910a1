//! # Entity Replicator
//!
//! Asynchronous one-way replication of entity mutations from a master store
//! onto a slave store.
//!
//! ## Architecture
//!
//! Master-side writes are never blocked by the slave: lifecycle hooks only
//! enqueue, and a single background worker applies operations in order.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           entity-replicator                               │
//! │                                                                           │
//! │  ┌─────────────────────┐ enqueue ┌──────────────┐      ┌───────────────┐  │
//! │  │ ReplicationListener │────────►│ PendingQueue │◄─────│  QueueWorker  │  │
//! │  │ (master hooks)      │         │ (FIFO, mark) │      │ (retry/drop)  │  │
//! │  └─────────────────────┘         └──────────────┘      └───────────────┘  │
//! │                                         │ stop                 │ apply    │
//! │                                         ▼                      ▼          │
//! │                                 ┌──────────────┐      ┌───────────────┐   │
//! │                                 │   snapshot   │      │ SlaveUpdater  │   │
//! │                                 │   (JSON)     │      │ + Transcoder  │   │
//! │                                 └──────────────┘      └───────────────┘   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! At-least-once, strictly ordered per queue. Idempotence comes from the
//! slave store's merge semantics. Transient (connectivity) failures keep the
//! head operation and retry with capped exponential backoff; anything else is
//! logged and dropped.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use entity_replicator::{MemoryStore, ReplicationConfig, ReplicationEngine, StaticCatalog};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> entity_replicator::Result<()> {
//!     let catalog = Arc::new(StaticCatalog::new());
//!     let config = ReplicationConfig::default();
//!
//!     let mut engine = ReplicationEngine::open(
//!         config,
//!         catalog.clone(),
//!         catalog,
//!         Arc::new(MemoryStore::new()),
//!     )
//!     .await?;
//!     engine.start().await?;
//!
//!     // Hand this to whatever observes master-side writes.
//!     let _listener = engine.listener();
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod classify;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod operation;
pub mod queue;
pub mod registry;
pub mod resilience;
pub mod snapshot;
pub mod store;
pub mod suppress;
pub mod switch;
pub mod transcode;
pub mod updater;
pub mod worker;

// Re-exports for convenience
pub use catalog::{Catalog, StaticCatalog};
pub use classify::{CommunicationFailure, FailureClassifier};
pub use config::{ReplicationConfig, SnapshotConfig, TypeMappingConfig, WorkerConfig};
pub use coordinator::{EngineState, HealthCheck, ReplicationEngine};
pub use entity::{Entity, EntityRef, EntitySchema, EntityType, RecordId, Relation, Value};
pub use error::{ReplicationError, Result};
pub use listener::{LifecycleListener, ReplicationListener};
pub use operation::{Operation, OperationKind};
pub use queue::{PendingQueue, QueueState};
pub use registry::TypeRegistry;
pub use store::{MemoryStore, SlaveStore, StoreError, StoreErrorKind, StoreSession};
pub use switch::StoreSwitch;
pub use transcode::Transcoder;
pub use updater::{SlaveUpdater, Updater};
pub use worker::QueueWorker;
