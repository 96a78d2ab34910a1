// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Type correspondence between the master and slave stores.
//!
//! The registry is built once and never changes, so every lookup is a pure
//! read and the registry can be shared freely behind an `Arc`.
//!
//! # Resolution Order
//!
//! Looking up the correspondent of `ty` in a target set tries, in order:
//!
//! 1. An explicit mapping registered with [`TypeRegistryBuilder::map`]
//! 2. `ty` itself, if the target set contains it
//! 3. The single target type with the same short name (`"Unit"` for
//!    `"master.Unit"`)
//!
//! When several target types share the short name the fallback is refused.
//! Such types are found and logged once, when the registry is built; register
//! an explicit mapping to resolve them.

use crate::catalog::{entity_types_matching, Catalog};
use crate::entity::EntityType;
use crate::error::{ReplicationError, Result};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// One target side: its types plus a short-name index.
#[derive(Debug, Default)]
struct TypeSet {
    types: Vec<EntityType>,
    members: HashSet<EntityType>,
    by_short_name: HashMap<String, Vec<EntityType>>,
}

impl TypeSet {
    fn new(types: Vec<EntityType>) -> Self {
        let mut members = HashSet::with_capacity(types.len());
        let mut by_short_name: HashMap<String, Vec<EntityType>> = HashMap::new();
        let mut unique = Vec::with_capacity(types.len());
        for ty in types {
            if members.insert(ty.clone()) {
                by_short_name
                    .entry(ty.short_name().to_string())
                    .or_default()
                    .push(ty.clone());
                unique.push(ty);
            }
        }
        Self {
            types: unique,
            members,
            by_short_name,
        }
    }

    fn contains(&self, ty: &EntityType) -> bool {
        self.members.contains(ty)
    }

    /// Exact match, then unique short-name match.
    fn resolve(&self, ty: &EntityType) -> Option<&EntityType> {
        if let Some(found) = self.members.get(ty) {
            return Some(found);
        }
        match self.by_short_name.get(ty.short_name()).map(Vec::as_slice) {
            Some([only]) => Some(only),
            _ => None,
        }
    }

    /// Candidates sharing `ty`'s short name, when there is no exact match and more than one.
    fn ambiguous(&self, ty: &EntityType) -> Option<&[EntityType]> {
        if self.contains(ty) {
            return None;
        }
        self.by_short_name
            .get(ty.short_name())
            .map(Vec::as_slice)
            .filter(|candidates| candidates.len() > 1)
    }
}

/// Immutable master ↔ slave type mapping.
#[derive(Debug)]
pub struct TypeRegistry {
    master: TypeSet,
    slave: TypeSet,
    master_to_slave: HashMap<EntityType, EntityType>,
    slave_to_master: HashMap<EntityType, EntityType>,
    unresolved: Vec<EntityType>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// Builder seeded with the types of the units each filter accepts.
    ///
    /// Master and slave may be the same catalog with two different filters.
    pub fn from_catalogs<M, S>(
        master: &dyn Catalog,
        master_units: M,
        slave: &dyn Catalog,
        slave_units: S,
    ) -> TypeRegistryBuilder
    where
        M: Fn(&str) -> bool,
        S: Fn(&str) -> bool,
    {
        TypeRegistryBuilder::default()
            .master_types(entity_types_matching(master, master_units))
            .slave_types(entity_types_matching(slave, slave_units))
    }

    /// Slave correspondent of a master-side type.
    pub fn slave_type(&self, ty: &EntityType) -> Option<&EntityType> {
        if let Some(mapped) = self.master_to_slave.get(ty) {
            return Some(mapped);
        }
        self.slave.resolve(ty)
    }

    /// Master correspondent of a slave-side type.
    pub fn master_type(&self, ty: &EntityType) -> Option<&EntityType> {
        if let Some(mapped) = self.slave_to_master.get(ty) {
            return Some(mapped);
        }
        self.master.resolve(ty)
    }

    /// Slave correspondent of `ty`, or `fallback` when there is none.
    pub fn correspondent<'a>(
        &'a self,
        ty: &EntityType,
        fallback: Option<&'a EntityType>,
    ) -> Option<&'a EntityType> {
        self.slave_type(ty).or(fallback)
    }

    /// The type on the other side: slave for a master type, master for a
    /// slave type, nothing for a type that belongs to neither.
    pub fn alternate_type(&self, ty: &EntityType) -> Option<&EntityType> {
        if self.is_master_type(ty) {
            self.slave_type(ty)
        } else if self.is_slave_type(ty) {
            self.master_type(ty)
        } else {
            None
        }
    }

    pub fn is_master_type(&self, ty: &EntityType) -> bool {
        self.master.contains(ty)
    }

    pub fn is_slave_type(&self, ty: &EntityType) -> bool {
        self.slave.contains(ty)
    }

    pub fn master_types(&self) -> &[EntityType] {
        &self.master.types
    }

    pub fn slave_types(&self) -> &[EntityType] {
        &self.slave.types
    }

    /// Registered types left without a correspondent because their short
    /// name is ambiguous on the other side and no explicit mapping exists.
    pub fn unresolved_types(&self) -> &[EntityType] {
        &self.unresolved
    }
}

/// Builder for [`TypeRegistry`].
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    master_types: Vec<EntityType>,
    slave_types: Vec<EntityType>,
    explicit: Vec<(EntityType, EntityType)>,
}

impl TypeRegistryBuilder {
    pub fn master_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityType>,
    {
        self.master_types.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn slave_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityType>,
    {
        self.slave_types.extend(types.into_iter().map(Into::into));
        self
    }

    /// Pin a master type to a slave type, bypassing name matching.
    pub fn map(mut self, master: impl Into<EntityType>, slave: impl Into<EntityType>) -> Self {
        self.explicit.push((master.into(), slave.into()));
        self
    }

    pub fn build(self) -> Result<TypeRegistry> {
        let master = TypeSet::new(self.master_types);
        let slave = TypeSet::new(self.slave_types);

        let mut master_to_slave = HashMap::new();
        let mut slave_to_master = HashMap::new();
        for (m, s) in self.explicit {
            if !master.contains(&m) {
                return Err(ReplicationError::Registry(format!(
                    "explicit mapping names unknown master type {}",
                    m
                )));
            }
            if !slave.contains(&s) {
                return Err(ReplicationError::Registry(format!(
                    "explicit mapping names unknown slave type {}",
                    s
                )));
            }
            if master_to_slave.contains_key(&m) || slave_to_master.contains_key(&s) {
                return Err(ReplicationError::Registry(format!(
                    "duplicate explicit mapping {} -> {}",
                    m, s
                )));
            }
            master_to_slave.insert(m.clone(), s.clone());
            slave_to_master.insert(s, m);
        }

        let mut unresolved = Vec::new();
        let sides = [
            (&master, &slave, &master_to_slave, "slave"),
            (&slave, &master, &slave_to_master, "master"),
        ];
        for (from, to, explicit, side) in sides {
            for ty in &from.types {
                if explicit.contains_key(ty) {
                    continue;
                }
                if let Some(candidates) = to.ambiguous(ty) {
                    warn!(
                        entity_type = %ty,
                        side,
                        candidates = ?candidates,
                        "Ambiguous short name, register an explicit mapping"
                    );
                    unresolved.push(ty.clone());
                }
            }
        }

        debug!(
            master_types = master.types.len(),
            slave_types = slave.types.len(),
            explicit = master_to_slave.len(),
            "Type registry built"
        );

        Ok(TypeRegistry {
            master,
            slave,
            master_to_slave,
            slave_to_master,
            unresolved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(name: &str) -> EntityType {
        EntityType::new(name)
    }

    fn registry() -> TypeRegistry {
        TypeRegistry::builder()
            .master_types(["master.Unit", "master.Task", "shared.Country"])
            .slave_types(["slave.Unit", "slave.Task", "shared.Country"])
            .build()
            .unwrap()
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    #[test]
    fn test_short_name_fallback() {
        let r = registry();
        assert_eq!(r.slave_type(&ty("master.Unit")), Some(&ty("slave.Unit")));
        assert_eq!(r.master_type(&ty("slave.Task")), Some(&ty("master.Task")));
    }

    #[test]
    fn test_exact_match_wins() {
        let r = registry();
        assert_eq!(
            r.slave_type(&ty("shared.Country")),
            Some(&ty("shared.Country"))
        );
    }

    #[test]
    fn test_correspondent_uses_fallback() {
        let r = registry();
        let fallback = ty("fallback.Type");
        assert_eq!(
            r.correspondent(&ty("master.Audit"), Some(&fallback)),
            Some(&fallback)
        );
        assert_eq!(r.correspondent(&ty("master.Audit"), None), None);
        assert_eq!(
            r.correspondent(&ty("master.Unit"), Some(&fallback)),
            Some(&ty("slave.Unit"))
        );
    }

    #[test]
    fn test_ambiguous_short_name_refused() {
        let r = TypeRegistry::builder()
            .master_types(["master.Unit"])
            .slave_types(["slave.a.Unit", "slave.b.Unit"])
            .build()
            .unwrap();
        assert_eq!(r.slave_type(&ty("master.Unit")), None);
        assert_eq!(r.unresolved_types(), &[ty("master.Unit")]);
    }

    #[test]
    fn test_explicit_mapping_resolves_ambiguity() {
        let r = TypeRegistry::builder()
            .master_types(["master.Unit"])
            .slave_types(["slave.a.Unit", "slave.b.Unit"])
            .map("master.Unit", "slave.b.Unit")
            .build()
            .unwrap();
        assert_eq!(r.slave_type(&ty("master.Unit")), Some(&ty("slave.b.Unit")));
        assert_eq!(r.master_type(&ty("slave.b.Unit")), Some(&ty("master.Unit")));
        assert!(r.unresolved_types().is_empty());
    }

    #[test]
    fn test_explicit_mapping_overrides_name_match() {
        let r = TypeRegistry::builder()
            .master_types(["master.Person"])
            .slave_types(["slave.Person", "slave.Contact"])
            .map("master.Person", "slave.Contact")
            .build()
            .unwrap();
        assert_eq!(
            r.slave_type(&ty("master.Person")),
            Some(&ty("slave.Contact"))
        );
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn test_explicit_mapping_unknown_type() {
        let err = TypeRegistry::builder()
            .master_types(["master.Unit"])
            .slave_types(["slave.Unit"])
            .map("master.Nope", "slave.Unit")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("master.Nope"));
    }

    #[test]
    fn test_duplicate_explicit_mapping() {
        let err = TypeRegistry::builder()
            .master_types(["master.Unit", "master.Site"])
            .slave_types(["slave.Unit"])
            .map("master.Unit", "slave.Unit")
            .map("master.Site", "slave.Unit")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    // =========================================================================
    // Membership
    // =========================================================================

    #[test]
    fn test_alternate_type_both_directions() {
        let r = registry();
        assert_eq!(r.alternate_type(&ty("master.Unit")), Some(&ty("slave.Unit")));
        assert_eq!(r.alternate_type(&ty("slave.Unit")), Some(&ty("master.Unit")));
        assert_eq!(r.alternate_type(&ty("other.Unit")), None);
    }

    #[test]
    fn test_membership_and_snapshots() {
        let r = registry();
        assert!(r.is_master_type(&ty("master.Unit")));
        assert!(!r.is_master_type(&ty("slave.Unit")));
        assert!(r.is_slave_type(&ty("slave.Unit")));
        assert!(r.is_master_type(&ty("shared.Country")));
        assert!(r.is_slave_type(&ty("shared.Country")));
        assert_eq!(r.master_types().len(), 3);
        assert_eq!(r.slave_types().len(), 3);
    }

    #[test]
    fn test_duplicate_types_collapsed() {
        let r = TypeRegistry::builder()
            .master_types(["master.Unit", "master.Unit"])
            .build()
            .unwrap();
        assert_eq!(r.master_types(), &[ty("master.Unit")]);
    }
}
