//! Queued replication operations.

use crate::entity::{EntityRef, GraphOwner};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What to do with an entity on the slave side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Insert (`persist`).
    Create,
    /// Upsert (`merge`).
    Update,
    /// Delete (`remove`).
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pending create/update/delete of a master entity.
///
/// The payload is the live master object. It is transcoded when the operation
/// is applied, not when it is queued. Payloads rebuilt from a snapshot carry
/// a shared owner of the rebuilt graph, freed with the last operation using it.
#[derive(Debug, Clone)]
pub struct Operation {
    kind: OperationKind,
    entity: EntityRef,
    enqueued_at: DateTime<Utc>,
    owner: Option<Arc<GraphOwner>>,
}

impl Operation {
    pub fn new(kind: OperationKind, entity: EntityRef) -> Self {
        Self::at(kind, entity, Utc::now())
    }

    /// Operation with an explicit timestamp (used when reloading a snapshot).
    pub fn at(kind: OperationKind, entity: EntityRef, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            entity,
            enqueued_at,
            owner: None,
        }
    }

    /// Tie the payload's graph to `owner`.
    pub fn with_owner(mut self, owner: Arc<GraphOwner>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.kind, self.entity)
    }
}
