// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Slave store integration traits.
//!
//! The replicator never talks to a database directly. It opens a
//! [`StoreSession`] through a [`SlaveStore`] for every operation, runs one
//! transaction in it, and closes it. Implement these traits for your backend.
//!
//! [`MemoryStore`] is an in-process implementation used by tests and demos.
//!
//! # Example
//!
//! ```rust,no_run
//! use entity_replicator::entity::{EntityRef, EntityType, RecordId};
//! use entity_replicator::store::{BoxFuture, SlaveStore, StoreError, StoreSession};
//!
//! struct RemoteDb;
//! struct RemoteSession;
//!
//! impl SlaveStore for RemoteDb {
//!     fn open_session(&self) -> BoxFuture<'_, Box<dyn StoreSession>> {
//!         Box::pin(async move { Ok(Box::new(RemoteSession) as Box<dyn StoreSession>) })
//!     }
//! }
//!
//! impl StoreSession for RemoteSession {
//!     fn begin(&mut self) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!     fn persist(&mut self, _entity: EntityRef) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Err(StoreError::communication("link down")) })
//!     }
//!     fn merge(&mut self, entity: EntityRef) -> BoxFuture<'_, EntityRef> {
//!         Box::pin(async move { Ok(entity) })
//!     }
//!     fn remove(&mut self, _entity: EntityRef) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!     fn find(&mut self, _ty: EntityType, _id: RecordId) -> BoxFuture<'_, Option<EntityRef>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!     fn commit(&mut self) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!     fn close(&mut self) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

use crate::entity::{EntityGraph, EntityRef, EntityType, RecordId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Result type for slave store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Broad failure category reported by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// The store could not be reached or the link dropped mid-call.
    Communication,
    /// The write collided with an existing record.
    Conflict,
    /// The record does not exist.
    NotFound,
    /// A schema or integrity constraint rejected the write.
    Constraint,
    /// Anything else.
    Other,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreErrorKind::Communication => write!(f, "communication failure"),
            StoreErrorKind::Conflict => write!(f, "conflict"),
            StoreErrorKind::NotFound => write!(f, "not found"),
            StoreErrorKind::Constraint => write!(f, "constraint violation"),
            StoreErrorKind::Other => write!(f, "store failure"),
        }
    }
}

/// Error reported by a slave store, with an optional underlying cause.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct StoreError {
    kind: StoreErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Communication, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::NotFound, message)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Constraint, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Other, message)
    }

    /// Attach the underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True if this error itself reports a lost link. Causes are not inspected.
    pub fn is_communication_failure(&self) -> bool {
        self.kind == StoreErrorKind::Communication
    }
}

/// Factory for transactional sessions against the slave store.
pub trait SlaveStore: Send + Sync + 'static {
    /// Open a fresh session. Every session is closed by its caller.
    fn open_session(&self) -> BoxFuture<'_, Box<dyn StoreSession>>;
}

/// One unit of work against the slave store.
///
/// Writes become visible only after [`commit`](StoreSession::commit).
/// [`close`](StoreSession::close) releases the session and discards anything
/// not yet committed; it must be safe to call after a failed call.
pub trait StoreSession: Send {
    /// Start a transaction.
    fn begin(&mut self) -> BoxFuture<'_, ()>;

    /// Insert a new record. Fails if the record already exists.
    fn persist(&mut self, entity: EntityRef) -> BoxFuture<'_, ()>;

    /// Insert or overwrite a record, returning the managed instance.
    fn merge(&mut self, entity: EntityRef) -> BoxFuture<'_, EntityRef>;

    /// Delete a record. Deleting an absent record is not an error.
    fn remove(&mut self, entity: EntityRef) -> BoxFuture<'_, ()>;

    /// Look up a record by type and id.
    fn find(&mut self, entity_type: EntityType, id: RecordId) -> BoxFuture<'_, Option<EntityRef>>;

    /// Commit the transaction.
    fn commit(&mut self) -> BoxFuture<'_, ()>;

    /// Release the session, rolling back anything uncommitted.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════════

type RecordKey = (EntityType, RecordId);

enum Staged {
    Put(RecordKey, EntityGraph),
    Delete(RecordKey),
}

/// Transactional in-memory slave store.
///
/// Every write stores a private deep copy of the written graph, so later
/// changes by the caller never reach the tables. A record's copy is freed
/// when the record is overwritten, removed or the store is dropped.
/// [`get`](Self::get) returns the stored handle itself, for inspection.
/// Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<HashMap<RecordKey, EntityGraph>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed record, if any.
    pub fn get(&self, entity_type: &EntityType, id: &RecordId) -> Option<EntityRef> {
        self.tables
            .lock()
            .get(&(entity_type.clone(), id.clone()))
            .map(|graph| graph.root().clone())
    }

    pub fn contains(&self, entity_type: &EntityType, id: &RecordId) -> bool {
        self.tables
            .lock()
            .contains_key(&(entity_type.clone(), id.clone()))
    }

    /// Number of committed records.
    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.len())
            .finish()
    }
}

impl SlaveStore for MemoryStore {
    fn open_session(&self) -> BoxFuture<'_, Box<dyn StoreSession>> {
        let session = MemorySession {
            store: self.clone(),
            staged: Vec::new(),
            active: false,
        };
        Box::pin(async move { Ok(Box::new(session) as Box<dyn StoreSession>) })
    }
}

struct MemorySession {
    store: MemoryStore,
    staged: Vec<Staged>,
    active: bool,
}

impl MemorySession {
    fn key_of(entity: &EntityRef) -> StoreResult<RecordKey> {
        let guard = entity.read();
        let id = guard.id().ok_or_else(|| {
            StoreError::constraint(format!("{} has no id", guard.entity_type()))
        })?;
        Ok((guard.entity_type().clone(), id))
    }

    /// Shallow copy handed to callers; its references stay inside the stored graph.
    fn detached(entity: &EntityRef) -> EntityRef {
        EntityRef::new(entity.read().clone())
    }

    /// Current view: staged writes over committed tables.
    fn lookup(&self, key: &RecordKey) -> Option<EntityRef> {
        for staged in self.staged.iter().rev() {
            match staged {
                Staged::Put(k, graph) if k == key => return Some(graph.root().clone()),
                Staged::Delete(k) if k == key => return None,
                _ => {}
            }
        }
        self.store.tables.lock().get(key).map(|graph| graph.root().clone())
    }

    fn require_active(&self) -> StoreResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(StoreError::other("no active transaction"))
        }
    }
}

impl StoreSession for MemorySession {
    fn begin(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.staged.clear();
            self.active = true;
            Ok(())
        })
    }

    fn persist(&mut self, entity: EntityRef) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.require_active()?;
            let key = Self::key_of(&entity)?;
            if self.lookup(&key).is_some() {
                return Err(StoreError::conflict(format!(
                    "{}#{} already exists",
                    key.0, key.1
                )));
            }
            self.staged.push(Staged::Put(key, EntityGraph::deep_copy(&entity)));
            Ok(())
        })
    }

    fn merge(&mut self, entity: EntityRef) -> BoxFuture<'_, EntityRef> {
        Box::pin(async move {
            self.require_active()?;
            let key = Self::key_of(&entity)?;
            let graph = EntityGraph::deep_copy(&entity);
            let managed = Self::detached(graph.root());
            self.staged.push(Staged::Put(key, graph));
            Ok(managed)
        })
    }

    fn remove(&mut self, entity: EntityRef) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.require_active()?;
            let key = Self::key_of(&entity)?;
            self.staged.push(Staged::Delete(key));
            Ok(())
        })
    }

    fn find(&mut self, entity_type: EntityType, id: RecordId) -> BoxFuture<'_, Option<EntityRef>> {
        Box::pin(async move {
            Ok(self
                .lookup(&(entity_type, id))
                .map(|entity| Self::detached(&entity)))
        })
    }

    fn commit(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.require_active()?;
            let mut tables = self.store.tables.lock();
            // Replaced and removed graphs drop here, which frees their cycles
            for staged in self.staged.drain(..) {
                match staged {
                    Staged::Put(key, graph) => {
                        tables.insert(key, graph);
                    }
                    Staged::Delete(key) => {
                        tables.remove(&key);
                    }
                }
            }
            self.active = false;
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.staged.clear();
            self.active = false;
            Ok(())
        })
    }
}
