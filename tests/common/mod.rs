//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Fixture catalogs: `master.Unit` / `master.Task` and their `slave.*` twins
//! - `FlakyStore`, a fault-injecting slave store that records committed writes
//! - Polling helpers for the background worker

#![allow(dead_code)]

use entity_replicator::entity::{EntityRef, EntitySchema, EntityType, RecordId, Value};
use entity_replicator::store::{
    BoxFuture, MemoryStore, SlaveStore, StoreError, StoreResult, StoreSession,
};
use entity_replicator::{Catalog, PendingQueue, StaticCatalog};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Catalogs
// =============================================================================

fn schemas(prefix: &str) -> Vec<EntitySchema> {
    vec![
        EntitySchema::builder(format!("{}.Unit", prefix))
            .id("id")
            .scalar("name")
            .one_to_many("tasks", format!("{}.Task", prefix))
            .transient("cached_label")
            .build()
            .unwrap(),
        EntitySchema::builder(format!("{}.Task", prefix))
            .id("id")
            .scalar("title")
            .many_to_one("unit", format!("{}.Unit", prefix))
            .build()
            .unwrap(),
    ]
}

pub fn master_catalog() -> Arc<StaticCatalog> {
    Arc::new(StaticCatalog::new().with_unit("master", schemas("master")).unwrap())
}

pub fn slave_catalog() -> Arc<StaticCatalog> {
    Arc::new(StaticCatalog::new().with_unit("slave", schemas("slave")).unwrap())
}

pub fn unit(catalog: &StaticCatalog, id: i64, name: &str) -> EntityRef {
    let unit = catalog.new_instance(&EntityType::new("master.Unit")).unwrap();
    {
        let mut guard = unit.write();
        guard.set_by_name("id", id).unwrap();
        guard.set_by_name("name", name).unwrap();
    }
    unit
}

/// A task attached to `owner`, also added to the owner's `tasks`.
pub fn task(catalog: &StaticCatalog, id: i64, title: &str, owner: &EntityRef) -> EntityRef {
    let task = catalog.new_instance(&EntityType::new("master.Task")).unwrap();
    {
        let mut guard = task.write();
        guard.set_by_name("id", id).unwrap();
        guard.set_by_name("title", title).unwrap();
        guard.set_by_name("unit", owner.clone()).unwrap();
    }
    let mut tasks = match owner.read().get_by_name("tasks").unwrap() {
        Value::Collection(_, items) => items.clone(),
        _ => Vec::new(),
    };
    tasks.push(Value::Ref(task.clone()));
    owner.write().set_by_name("tasks", Value::list(tasks)).unwrap();
    task
}

pub fn id_of(entity: &EntityRef) -> i64 {
    match entity.id() {
        Some(RecordId::Int(id)) => id,
        other => panic!("unexpected id {:?}", other),
    }
}

/// Text field of a committed slave record.
pub fn slave_text(store: &MemoryStore, ty: &str, id: i64, field: &str) -> Option<String> {
    let record = store.get(&EntityType::new(ty), &RecordId::Int(id))?;
    let guard = record.read();
    match guard.get_by_name(field).ok()? {
        Value::Text(text) => Some(text.clone()),
        _ => None,
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Poll `condition` until it holds, panicking after 5 seconds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

pub async fn wait_for_drain(queue: &PendingQueue) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !queue.is_empty().await {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("queue did not drain within 5s");
}

// =============================================================================
// FlakyStore
// =============================================================================

/// A committed write as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub op: &'static str,
    pub entity_type: String,
    pub id: RecordId,
}

#[derive(Default)]
struct Faults {
    /// Remaining sessions that fail to open with a communication error
    outages: AtomicUsize,
    /// Ids whose merge is rejected unless the instance came from `find`
    reject_detached_merge: Mutex<HashSet<RecordId>>,
    /// Ids whose every write fails with a constraint error
    poisoned: Mutex<HashSet<RecordId>>,
    committed: Mutex<Vec<Write>>,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
}

/// [`MemoryStore`] with injectable failures and a log of committed writes.
///
/// # Example
/// ```rust,ignore
/// let store = FlakyStore::new();
/// store.fail_next_sessions(2);   // connection refused twice, then fine
/// store.poison(7);               // id 7 always violates a constraint
/// ```
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    faults: Arc<Faults>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The committed tables.
    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn fail_next_sessions(&self, count: usize) {
        self.faults.outages.store(count, Ordering::SeqCst);
    }

    pub fn reject_detached_merge(&self, id: i64) {
        self.faults.reject_detached_merge.lock().insert(RecordId::Int(id));
    }

    pub fn poison(&self, id: i64) {
        self.faults.poisoned.lock().insert(RecordId::Int(id));
    }

    pub fn committed(&self) -> Vec<Write> {
        self.faults.committed.lock().clone()
    }

    pub fn committed_ids(&self) -> Vec<i64> {
        self.committed()
            .into_iter()
            .map(|w| match w.id {
                RecordId::Int(id) => id,
                RecordId::Text(_) => -1,
            })
            .collect()
    }

    pub fn sessions_opened(&self) -> usize {
        self.faults.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.faults.sessions_closed.load(Ordering::SeqCst)
    }
}

impl SlaveStore for FlakyStore {
    fn open_session(&self) -> BoxFuture<'_, Box<dyn StoreSession>> {
        Box::pin(async move {
            let outage = self
                .faults
                .outages
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if outage {
                let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
                return Err(StoreError::communication("slave unreachable").with_source(refused));
            }
            self.faults.sessions_opened.fetch_add(1, Ordering::SeqCst);
            let inner = self.inner.open_session().await?;
            Ok(Box::new(FlakySession {
                inner,
                faults: Arc::clone(&self.faults),
                staged: Vec::new(),
                found: Vec::new(),
            }) as Box<dyn StoreSession>)
        })
    }
}

struct FlakySession {
    inner: Box<dyn StoreSession>,
    faults: Arc<Faults>,
    staged: Vec<Write>,
    found: Vec<EntityRef>,
}

impl FlakySession {
    fn stage(&mut self, op: &'static str, entity: &EntityRef) -> StoreResult<()> {
        let id = entity
            .id()
            .ok_or_else(|| StoreError::constraint("record without id"))?;
        if self.faults.poisoned.lock().contains(&id) {
            return Err(StoreError::constraint(format!("check constraint failed for {}", id)));
        }
        self.staged.push(Write {
            op,
            entity_type: entity.entity_type().to_string(),
            id,
        });
        Ok(())
    }
}

impl StoreSession for FlakySession {
    fn begin(&mut self) -> BoxFuture<'_, ()> {
        self.staged.clear();
        self.inner.begin()
    }

    fn persist(&mut self, entity: EntityRef) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.stage("persist", &entity)?;
            self.inner.persist(entity).await
        })
    }

    fn merge(&mut self, entity: EntityRef) -> BoxFuture<'_, EntityRef> {
        Box::pin(async move {
            let id = entity.id();
            let from_find = self.found.iter().any(|f| f.ptr_eq(&entity));
            let rejected = id
                .as_ref()
                .is_some_and(|id| self.faults.reject_detached_merge.lock().contains(id));
            if rejected && !from_find {
                return Err(StoreError::conflict("detached instance rejected"));
            }
            self.stage("merge", &entity)?;
            self.inner.merge(entity).await
        })
    }

    fn remove(&mut self, entity: EntityRef) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.stage("remove", &entity)?;
            self.inner.remove(entity).await
        })
    }

    fn find(&mut self, entity_type: EntityType, id: RecordId) -> BoxFuture<'_, Option<EntityRef>> {
        Box::pin(async move {
            let found = self.inner.find(entity_type, id).await?;
            if let Some(entity) = &found {
                self.found.push(entity.clone());
            }
            Ok(found)
        })
    }

    fn commit(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inner.commit().await?;
            self.faults.committed.lock().append(&mut self.staged);
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.faults.sessions_closed.fetch_add(1, Ordering::SeqCst);
        self.staged.clear();
        self.found.clear();
        self.inner.close()
    }
}
