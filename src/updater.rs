// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transactional updates against the slave store.
//!
//! Every call transcodes the master entity, opens one session, runs one
//! transaction and closes the session again, whatever the outcome. Store
//! errors are returned unmodified; deciding whether to retry is the worker's
//! job.
//!
//! # Merge Fallback
//!
//! Some stores reject a merge of a detached object whose id already exists.
//! When that happens the updater loads the existing record, copies every
//! field of the transcoded entity onto it, and merges that instead, within
//! the same transaction. Without an id or an existing record the original
//! error is returned.

use crate::entity::{EntityGraph, EntityRef, EntityType, RecordId};
use crate::error::{ReplicationError, Result};
use crate::operation::{Operation, OperationKind};
use crate::store::{SlaveStore, StoreSession};
use crate::suppress;
use crate::transcode::Transcoder;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Boxed future returned by [`Updater`] methods.
pub type UpdateFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Applies master-side changes to the slave store.
pub trait Updater: Send + Sync + 'static {
    /// Insert the slave copy of `entity`.
    fn persist(&self, entity: EntityRef) -> UpdateFuture<'_, ()>;

    /// Upsert the slave copy of `entity`, returning the stored instance.
    fn merge(&self, entity: EntityRef) -> UpdateFuture<'_, EntityRef>;

    /// Delete the slave copy of `entity`.
    fn remove(&self, entity: EntityRef) -> UpdateFuture<'_, ()>;

    /// Persist when no slave record with `id` exists, merge otherwise.
    fn update(&self, entity: EntityRef, id: RecordId) -> UpdateFuture<'_, ()>;

    /// Dispatch a queued operation by kind.
    fn apply<'a>(&'a self, operation: &'a Operation) -> UpdateFuture<'a, ()> {
        let entity = operation.entity().clone();
        match operation.kind() {
            OperationKind::Create => self.persist(entity),
            OperationKind::Update => Box::pin(async move { self.merge(entity).await.map(|_| ()) }),
            OperationKind::Delete => self.remove(entity),
        }
    }
}

/// [`Updater`] backed by a [`Transcoder`] and a [`SlaveStore`].
pub struct SlaveUpdater<S: SlaveStore> {
    transcoder: Arc<Transcoder>,
    store: Arc<S>,
}

impl<S: SlaveStore> SlaveUpdater<S> {
    pub fn new(transcoder: Arc<Transcoder>, store: Arc<S>) -> Self {
        Self { transcoder, store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Slave copy of a master entity, freed when the returned graph drops.
    fn to_slave(&self, entity: &EntityRef) -> Result<EntityGraph> {
        let entity_type = entity.entity_type();
        if !self.transcoder.registry().is_master_type(&entity_type) {
            return Err(ReplicationError::NotMirrored { entity_type });
        }
        self.transcoder
            .transcode(entity)?
            .ok_or(ReplicationError::NotMirrored { entity_type })
    }

    /// Close a session whatever the transaction outcome, then pass the outcome on.
    async fn finish<T>(
        &self,
        action: &'static str,
        entity_type: &EntityType,
        mut session: Box<dyn StoreSession>,
        result: Result<T>,
    ) -> Result<T> {
        if let Err(e) = session.close().await {
            warn!(action, entity_type = %entity_type, error = %e, "Failed to close slave session");
        }
        match &result {
            Ok(_) => debug!(action, entity_type = %entity_type, "Slave transaction committed"),
            Err(e) => debug!(action, entity_type = %entity_type, error = %e, "Slave transaction failed"),
        }
        result
    }
}

impl<S: SlaveStore> Updater for SlaveUpdater<S> {
    fn persist(&self, entity: EntityRef) -> UpdateFuture<'_, ()> {
        Box::pin(suppress::suppressed(async move {
            let graph = self.to_slave(&entity)?;
            let slave = graph.root().clone();
            let entity_type = slave.entity_type();
            let mut session = self.store.open_session().await?;
            let result: Result<()> = async {
                session.begin().await?;
                session.persist(slave).await?;
                Ok(session.commit().await?)
            }
            .await;
            self.finish("persist", &entity_type, session, result).await
        }))
    }

    fn merge(&self, entity: EntityRef) -> UpdateFuture<'_, EntityRef> {
        Box::pin(suppress::suppressed(async move {
            let graph = self.to_slave(&entity)?;
            let slave = graph.root().clone();
            let entity_type = slave.entity_type();
            let mut session = self.store.open_session().await?;
            let result: Result<EntityRef> = async {
                session.begin().await?;
                let managed = merge_with_fallback(session.as_mut(), slave).await?;
                session.commit().await?;
                Ok(managed)
            }
            .await;
            self.finish("merge", &entity_type, session, result).await
        }))
    }

    fn remove(&self, entity: EntityRef) -> UpdateFuture<'_, ()> {
        Box::pin(suppress::suppressed(async move {
            let graph = self.to_slave(&entity)?;
            let slave = graph.root().clone();
            let entity_type = slave.entity_type();
            let mut session = self.store.open_session().await?;
            let result: Result<()> = async {
                session.begin().await?;
                session.remove(slave).await?;
                Ok(session.commit().await?)
            }
            .await;
            self.finish("remove", &entity_type, session, result).await
        }))
    }

    fn update(&self, entity: EntityRef, id: RecordId) -> UpdateFuture<'_, ()> {
        Box::pin(async move {
            let entity_type = self.to_slave(&entity)?.root().entity_type();
            let existing = suppress::suppressed(async {
                let mut session = self.store.open_session().await?;
                let result: Result<Option<EntityRef>> = async {
                    session.begin().await?;
                    let found = session.find(entity_type.clone(), id).await?;
                    session.commit().await?;
                    Ok(found)
                }
                .await;
                self.finish("find", &entity_type, session, result).await
            })
            .await?;

            match existing {
                None => self.persist(entity).await,
                Some(_) => self.merge(entity).await.map(|_| ()),
            }
        })
    }
}

impl<S: SlaveStore> std::fmt::Debug for SlaveUpdater<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveUpdater")
            .field("transcoder", &self.transcoder)
            .finish_non_exhaustive()
    }
}

async fn merge_with_fallback(session: &mut dyn StoreSession, slave: EntityRef) -> Result<EntityRef> {
    let rejected = match session.merge(slave.clone()).await {
        Ok(managed) => return Ok(managed),
        Err(e) => e,
    };

    let Some(id) = slave.id() else {
        return Err(rejected.into());
    };
    let entity_type = slave.entity_type();
    let existing = match session.find(entity_type.clone(), id.clone()).await {
        Ok(Some(existing)) => existing,
        Ok(None) => return Err(rejected.into()),
        Err(e) => {
            debug!(entity_type = %entity_type, id = %id, error = %e, "Lookup for merge fallback failed");
            return Err(rejected.into());
        }
    };

    debug!(
        entity_type = %entity_type,
        id = %id,
        error = %rejected,
        "Merge rejected, copying onto existing record"
    );
    if !existing.ptr_eq(&slave) {
        let source = slave.read().clone();
        existing.write().copy_fields_from(&source)?;
    }
    Ok(session.merge(existing).await?)
}
