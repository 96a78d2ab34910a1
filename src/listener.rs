//! Master-side lifecycle hooks.
//!
//! Whatever detects master mutations calls a [`LifecycleListener`]
//! synchronously on the mutating thread. [`ReplicationListener`] turns those
//! calls into queued operations and does nothing else: a failed enqueue is
//! logged, never surfaced, so a master write cannot fail because of
//! replication.

use crate::entity::EntityRef;
use crate::error::Result;
use crate::operation::OperationKind;
use crate::queue::PendingQueue;
use crate::registry::TypeRegistry;
use crate::suppress;
use std::sync::Arc;
use tracing::{debug, warn};

/// Create/update/delete notifications for master entities.
pub trait LifecycleListener: Send + Sync {
    fn on_create(&self, entity: &EntityRef);
    fn on_update(&self, entity: &EntityRef);
    fn on_delete(&self, entity: &EntityRef);
}

/// Enqueues replication of master entities.
///
/// Entities whose type is not a master type, and anything raised while a
/// suppression scope is active, are ignored.
#[derive(Debug, Clone)]
pub struct ReplicationListener {
    queue: Arc<PendingQueue>,
    registry: Arc<TypeRegistry>,
}

impl ReplicationListener {
    pub fn new(queue: Arc<PendingQueue>, registry: Arc<TypeRegistry>) -> Self {
        Self { queue, registry }
    }

    /// True if a mutation of `entity` should be mirrored.
    pub fn may_update_slave(&self, entity: &EntityRef) -> bool {
        !suppress::is_suppressed() && self.registry.is_master_type(&entity.entity_type())
    }

    /// Async variant for callers already on the runtime.
    ///
    /// Returns whether an operation was queued.
    pub async fn notify(&self, kind: OperationKind, entity: &EntityRef) -> bool {
        if !self.accepts(kind, entity) {
            return false;
        }
        let result = self.queue.enqueue(kind, entity.clone()).await;
        self.settle(kind, entity, result)
    }

    fn notify_sync(&self, kind: OperationKind, entity: &EntityRef) -> bool {
        if !self.accepts(kind, entity) {
            return false;
        }
        let result = self.queue.enqueue_sync(kind, entity.clone());
        self.settle(kind, entity, result)
    }

    fn accepts(&self, kind: OperationKind, entity: &EntityRef) -> bool {
        let accepted = self.may_update_slave(entity);
        if !accepted {
            debug!(kind = %kind, entity = ?entity, "Lifecycle event not replicated");
        }
        accepted
    }

    fn settle(&self, kind: OperationKind, entity: &EntityRef, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = %kind, entity = ?entity, error = %e, "Failed to queue replication");
                false
            }
        }
    }
}

impl LifecycleListener for ReplicationListener {
    fn on_create(&self, entity: &EntityRef) {
        self.notify_sync(OperationKind::Create, entity);
    }

    fn on_update(&self, entity: &EntityRef) {
        self.notify_sync(OperationKind::Update, entity);
    }

    fn on_delete(&self, entity: &EntityRef) {
        self.notify_sync(OperationKind::Delete, entity);
    }
}
