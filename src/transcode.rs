// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Master → slave entity graph transcoding.
//!
//! [`Transcoder::transcode`] deep-copies a master object graph into freshly
//! allocated slave instances. Every reachable master object is copied at most
//! once per call: a second encounter (shared reference, cycle, or the root
//! pointing at itself) reuses the copy, so the slave graph has the same shape
//! as the master graph.
//!
//! # Copy Plans
//!
//! Field access goes through a [`CopyPlan`] built once per
//! `(master type, slave type)` pair and cached. A plan pairs every persistent
//! slave field with the master field of the same name, as verified tokens.
//!
//! # Back-references
//!
//! A many-to-one field whose target type itself points back at the owning
//! type (a child's `parent`) is a back-reference. Below the root, those are
//! written as absent in the copy so children are not re-entered through
//! their parent pointer. The master object is never touched.
//!
//! # Ownership
//!
//! The copy is returned as an [`EntityGraph`] that owns every object the
//! call allocated. Dropping it breaks the copy's cycles; objects carried over
//! from the master side are never touched.
//!
//! # Unmapped Types
//!
//! A root with no slave correspondent yields `None`. A nested object with no
//! correspondent is carried over as-is.

use crate::catalog::Catalog;
use crate::entity::{
    Entity, EntityGraph, EntityRef, EntitySchema, EntityType, FieldAccessError, FieldToken,
    GraphOwner, Relation, Value,
};
use crate::registry::TypeRegistry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Fatal failure of one transcoding call.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("no schema registered for {0}")]
    MissingSchema(EntityType),

    #[error("{master_type} has no field '{field}' required by {slave_type}")]
    MissingField {
        master_type: EntityType,
        slave_type: EntityType,
        field: String,
    },

    #[error("field access failed: {0}")]
    Field(#[from] FieldAccessError),
}

/// One copied field.
#[derive(Debug, Clone)]
pub struct FieldCopy {
    pub name: String,
    source: FieldToken,
    target: FieldToken,
    /// Written as absent below the root.
    pub back_reference: bool,
}

/// Accessor table for one `(master type, slave type)` pair.
#[derive(Debug)]
pub struct CopyPlan {
    slave_schema: Arc<EntitySchema>,
    fields: Vec<FieldCopy>,
}

impl CopyPlan {
    pub fn fields(&self) -> &[FieldCopy] {
        &self.fields
    }
}

/// Copies master graphs into slave shape.
pub struct Transcoder {
    registry: Arc<TypeRegistry>,
    master: Arc<dyn Catalog>,
    slave: Arc<dyn Catalog>,
    plans: RwLock<HashMap<(EntityType, EntityType), Arc<CopyPlan>>>,
}

impl Transcoder {
    pub fn new(registry: Arc<TypeRegistry>, master: Arc<dyn Catalog>, slave: Arc<dyn Catalog>) -> Self {
        Self {
            registry,
            master,
            slave,
            plans: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Copy `root` and everything it reaches into slave shape.
    ///
    /// Returns `Ok(None)` when the root's type has no slave correspondent.
    /// The returned graph owns every copy it made; dropping it frees them
    /// even when they form cycles.
    pub fn transcode(&self, root: &EntityRef) -> Result<Option<EntityGraph>, TranscodeError> {
        let mut copies = HashMap::new();
        let copied = self.copy_entity(root, true, &mut copies);
        // Owned before checking the result so a failed call frees its partial copy
        let owner = GraphOwner::new(copies.into_values().collect());
        match copied? {
            Some(copy) => {
                trace!(root = ?root, objects = owner.len(), "Transcoded graph");
                Ok(Some(EntityGraph::new(copy, owner)))
            }
            None => Ok(None),
        }
    }

    /// Like [`transcode`](Self::transcode), with a value for unmapped roots.
    /// The default is returned unowned.
    pub fn transcode_or(&self, root: &EntityRef, default: EntityRef) -> Result<EntityGraph, TranscodeError> {
        Ok(self
            .transcode(root)?
            .unwrap_or_else(|| EntityGraph::unowned(default)))
    }

    /// Cached plan for a type pair, built on first use.
    pub fn plan(&self, master_type: &EntityType, slave_type: &EntityType) -> Result<Arc<CopyPlan>, TranscodeError> {
        let key = (master_type.clone(), slave_type.clone());
        if let Some(plan) = self.plans.read().get(&key) {
            return Ok(Arc::clone(plan));
        }

        let plan = Arc::new(self.build_plan(master_type, slave_type)?);
        debug!(
            master_type = %master_type,
            slave_type = %slave_type,
            fields = plan.fields.len(),
            "Built copy plan"
        );
        self.plans.write().entry(key).or_insert_with(|| Arc::clone(&plan));
        Ok(plan)
    }

    fn build_plan(&self, master_type: &EntityType, slave_type: &EntityType) -> Result<CopyPlan, TranscodeError> {
        let master_schema = self
            .master
            .schema(master_type)
            .ok_or_else(|| TranscodeError::MissingSchema(master_type.clone()))?;
        let slave_schema = self
            .slave
            .schema(slave_type)
            .ok_or_else(|| TranscodeError::MissingSchema(slave_type.clone()))?;
        let referencing = self.master.referencing_types(master_type);

        let mut fields = Vec::new();
        for (target, def) in slave_schema.persistent_fields() {
            let source = master_schema
                .field(&def.name)
                .ok_or_else(|| TranscodeError::MissingField {
                    master_type: master_type.clone(),
                    slave_type: slave_type.clone(),
                    field: def.name.clone(),
                })?;
            let back_reference = match master_schema.def(source).map(|d| &d.relation) {
                Some(Relation::ManyToOne(owner)) => referencing.contains(owner),
                _ => false,
            };
            fields.push(FieldCopy {
                name: def.name.clone(),
                source,
                target,
                back_reference,
            });
        }

        Ok(CopyPlan {
            slave_schema,
            fields,
        })
    }

    fn copy_entity(
        &self,
        source: &EntityRef,
        is_root: bool,
        copies: &mut HashMap<EntityRef, EntityRef>,
    ) -> Result<Option<EntityRef>, TranscodeError> {
        let master_type = source.entity_type();
        let Some(slave_type) = self.registry.slave_type(&master_type) else {
            return Ok(None);
        };
        let plan = self.plan(&master_type, slave_type)?;

        let target = EntityRef::new(Entity::new(Arc::clone(&plan.slave_schema)));
        copies.insert(source.clone(), target.clone());

        // Snapshot the source values so no lock is held while recursing
        let values = {
            let guard = source.read();
            plan.fields
                .iter()
                .map(|copy| {
                    if copy.back_reference && !is_root {
                        Ok(Value::Null)
                    } else {
                        guard.get(copy.source).cloned()
                    }
                })
                .collect::<Result<Vec<_>, FieldAccessError>>()?
        };

        for (copy, value) in plan.fields.iter().zip(values) {
            let value = self.copy_value(value, copies)?;
            target.write().set(copy.target, value)?;
        }

        Ok(Some(target))
    }

    fn copy_value(&self, value: Value, copies: &mut HashMap<EntityRef, EntityRef>) -> Result<Value, TranscodeError> {
        match value {
            Value::Ref(entity) => {
                if let Some(copy) = copies.get(&entity) {
                    return Ok(Value::Ref(copy.clone()));
                }
                match self.copy_entity(&entity, false, copies)? {
                    Some(copy) => Ok(Value::Ref(copy)),
                    None => Ok(Value::Ref(entity)),
                }
            }
            Value::Collection(kind, items) => {
                let items = items
                    .into_iter()
                    .map(|item| self.copy_value(item, copies))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Collection(kind, items))
            }
            scalar => Ok(scalar),
        }
    }
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder")
            .field("registry", &self.registry)
            .field("plans", &self.plans.read().len())
            .finish()
    }
}
