//! Store metadata.
//!
//! A [`Catalog`] describes what one side of the mirror can store: its
//! persistence units, the entity types each unit owns, and the schema of every
//! type. The registry, the transcoder and the snapshot loader only ever see
//! a store through this trait.

use crate::entity::{Entity, EntityRef, EntitySchema, EntityType};
use crate::error::{ReplicationError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Metadata view of a backing store.
pub trait Catalog: Send + Sync + 'static {
    /// Names of the persistence units, in a stable order.
    fn units(&self) -> Vec<String>;

    /// Entity types managed by one unit. Unknown units yield nothing.
    fn unit_types(&self, unit: &str) -> Vec<EntityType>;

    /// Schema of one entity type.
    fn schema(&self, entity_type: &EntityType) -> Option<Arc<EntitySchema>>;

    /// Every entity type across all units, without duplicates.
    fn entity_types(&self) -> Vec<EntityType> {
        let mut seen = BTreeSet::new();
        self.units()
            .iter()
            .flat_map(|unit| self.unit_types(unit))
            .filter(|ty| seen.insert(ty.clone()))
            .collect()
    }

    /// Types that hold a single-valued reference to `target`.
    fn referencing_types(&self, target: &EntityType) -> Vec<EntityType> {
        self.entity_types()
            .into_iter()
            .filter(|ty| {
                self.schema(ty).is_some_and(|schema| {
                    schema.fields().iter().any(|def| {
                        !def.relation.is_collection() && def.relation.target() == Some(target)
                    })
                })
            })
            .collect()
    }

    /// Fresh, empty instance of a type.
    fn new_instance(&self, entity_type: &EntityType) -> Option<EntityRef> {
        self.schema(entity_type)
            .map(|schema| EntityRef::new(Entity::new(schema)))
    }
}

/// Entity types of the units accepted by `unit_filter`, in unit order.
pub fn entity_types_matching<F>(catalog: &dyn Catalog, unit_filter: F) -> Vec<EntityType>
where
    F: Fn(&str) -> bool,
{
    let mut seen = BTreeSet::new();
    catalog
        .units()
        .iter()
        .filter(|unit| unit_filter(unit))
        .flat_map(|unit| catalog.unit_types(unit))
        .filter(|ty| seen.insert(ty.clone()))
        .collect()
}

/// In-memory catalog assembled from schemas.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    units: BTreeMap<String, Vec<EntityType>>,
    schemas: HashMap<EntityType, Arc<EntitySchema>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit and its schemas.
    ///
    /// A type may belong to only one unit.
    pub fn with_unit<I>(mut self, unit: impl Into<String>, schemas: I) -> Result<Self>
    where
        I: IntoIterator<Item = EntitySchema>,
    {
        let unit = unit.into();
        let mut types = Vec::new();
        for schema in schemas {
            let ty = schema.entity_type().clone();
            if self.schemas.contains_key(&ty) {
                return Err(ReplicationError::Registry(format!(
                    "entity type {} registered twice (unit {})",
                    ty, unit
                )));
            }
            self.schemas.insert(ty.clone(), Arc::new(schema));
            types.push(ty);
        }
        self.units.entry(unit).or_default().extend(types);
        Ok(self)
    }
}

impl Catalog for StaticCatalog {
    fn units(&self) -> Vec<String> {
        self.units.keys().cloned().collect()
    }

    fn unit_types(&self, unit: &str) -> Vec<EntityType> {
        self.units.get(unit).cloned().unwrap_or_default()
    }

    fn schema(&self, entity_type: &EntityType) -> Option<Arc<EntitySchema>> {
        self.schemas.get(entity_type).cloned()
    }
}
