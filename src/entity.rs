//! Entity model shared by both sides of the mirror.
//!
//! Records are dynamically shaped. An [`EntitySchema`] describes the fields of
//! one entity type and hands out [`FieldToken`]s; an [`Entity`] stores one
//! [`Value`] per schema slot. A token is stamped with the identity of the
//! schema that issued it, so reading or writing through a token from a
//! different schema fails instead of silently touching the wrong slot.
//!
//! Graphs are built from [`EntityRef`]s: shared, lockable handles compared by
//! pointer identity. Two handles are "the same object" only if they point at
//! the same allocation, which is what cycle and self-reference preservation
//! in [`crate::transcode`] relies on.
//!
//! ```rust
//! use entity_replicator::entity::{Entity, EntityRef, EntitySchema, Value};
//! use std::sync::Arc;
//!
//! let schema = Arc::new(
//!     EntitySchema::builder("master.Unit")
//!         .id("id")
//!         .scalar("name")
//!         .many_to_one("parent", "master.Unit")
//!         .build()
//!         .unwrap(),
//! );
//!
//! let unit = EntityRef::new(Entity::new(Arc::clone(&schema)));
//! unit.write().set_by_name("id", Value::Int(1)).unwrap();
//! unit.write().set_by_name("parent", Value::Ref(unit.clone())).unwrap();
//! assert_eq!(unit.read().id(), Some(1i64.into()));
//! ```

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

static NEXT_SCHEMA_ID: AtomicU64 = AtomicU64::new(1);

// ═══════════════════════════════════════════════════════════════════════════════
// EntityType
// ═══════════════════════════════════════════════════════════════════════════════

/// Qualified name of an entity type, e.g. `"master.Unit"` or `"slave::Unit"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Fully qualified name.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Name without its namespace: the segment after the last `::` or `.`.
    pub fn short_name(&self) -> &str {
        let name = self.0.as_str();
        let name = name.rsplit("::").next().unwrap_or(name);
        name.rsplit('.').next().unwrap_or(name)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EntityType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schema
// ═══════════════════════════════════════════════════════════════════════════════

/// How a field relates to other entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// Plain value (number, text, timestamp...).
    Scalar,
    /// Owning pointer to a parent entity.
    ManyToOne(EntityType),
    /// Single reference to a peer entity.
    OneToOne(EntityType),
    /// Collection of children.
    OneToMany(EntityType),
    /// Collection of peers.
    ManyToMany(EntityType),
}

impl Relation {
    /// Target entity type, if this field references entities.
    pub fn target(&self) -> Option<&EntityType> {
        match self {
            Relation::Scalar => None,
            Relation::ManyToOne(t)
            | Relation::OneToOne(t)
            | Relation::OneToMany(t)
            | Relation::ManyToMany(t) => Some(t),
        }
    }

    pub fn is_many_to_one(&self) -> bool {
        matches!(self, Relation::ManyToOne(_))
    }

    /// True for multi-valued relations.
    pub fn is_collection(&self) -> bool {
        matches!(self, Relation::OneToMany(_) | Relation::ManyToMany(_))
    }

    fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Relation::Scalar, Value::Ref(_) | Value::Collection(..)) => false,
            (Relation::Scalar, _) => true,
            (Relation::ManyToOne(_) | Relation::OneToOne(_), Value::Ref(_)) => true,
            (Relation::OneToMany(_) | Relation::ManyToMany(_), Value::Collection(..)) => true,
            _ => false,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Relation::Scalar => "scalar",
            Relation::ManyToOne(_) | Relation::OneToOne(_) => "reference",
            Relation::OneToMany(_) | Relation::ManyToMany(_) => "collection",
        }
    }
}

/// One declared field of an entity type.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub relation: Relation,
    /// Persistent fields are stored by the backing store and copied by the
    /// transcoder. Transient fields live only in memory.
    pub persistent: bool,
}

/// Handle to one field of one schema.
///
/// Only the schema that issued a token accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldToken {
    schema: u64,
    slot: usize,
}

impl FieldToken {
    /// Position of the field within its schema.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Errors building a schema.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{entity_type} declares field '{field}' twice")]
    DuplicateField { entity_type: EntityType, field: String },

    #[error("{0} has no id field")]
    MissingId(EntityType),
}

/// Errors reading or writing a field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldAccessError {
    #[error("{entity_type} has no field '{field}'")]
    UnknownField { entity_type: EntityType, field: String },

    #[error("field token does not belong to {entity_type}")]
    ForeignToken { entity_type: EntityType },

    #[error("{entity_type}.{field} expects a {expected} value")]
    TypeMismatch {
        entity_type: EntityType,
        field: String,
        expected: &'static str,
    },

    #[error("cannot copy {source_type} fields onto {target_type}")]
    IncompatibleTypes {
        source_type: EntityType,
        target_type: EntityType,
    },
}

/// Field table of one entity type.
#[derive(Debug)]
pub struct EntitySchema {
    id: u64,
    entity_type: EntityType,
    fields: Vec<FieldDef>,
    by_name: HashMap<String, usize>,
    id_slot: usize,
}

impl EntitySchema {
    pub fn builder(entity_type: impl Into<EntityType>) -> SchemaBuilder {
        SchemaBuilder {
            entity_type: entity_type.into(),
            fields: Vec::new(),
            id: None,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Look up a field token by name.
    pub fn field(&self, name: &str) -> Option<FieldToken> {
        self.by_name.get(name).map(|&slot| self.token(slot))
    }

    /// Definition behind a token, if the token belongs to this schema.
    pub fn def(&self, token: FieldToken) -> Option<&FieldDef> {
        if token.schema != self.id {
            return None;
        }
        self.fields.get(token.slot)
    }

    /// Tokens of the persistent fields, in declaration order.
    pub fn persistent_fields(&self) -> impl Iterator<Item = (FieldToken, &FieldDef)> + '_ {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, def)| def.persistent)
            .map(|(slot, def)| (self.token(slot), def))
    }

    /// Token of the id field.
    pub fn id_field(&self) -> FieldToken {
        self.token(self.id_slot)
    }

    fn token(&self, slot: usize) -> FieldToken {
        FieldToken {
            schema: self.id,
            slot,
        }
    }
}

/// Builder for [`EntitySchema`].
#[derive(Debug)]
pub struct SchemaBuilder {
    entity_type: EntityType,
    fields: Vec<FieldDef>,
    id: Option<String>,
}

impl SchemaBuilder {
    /// Declare the scalar id field.
    pub fn id(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.id = Some(name.clone());
        self.field(name, Relation::Scalar)
    }

    /// Declare a persistent field.
    pub fn field(mut self, name: impl Into<String>, relation: Relation) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            relation,
            persistent: true,
        });
        self
    }

    pub fn scalar(self, name: impl Into<String>) -> Self {
        self.field(name, Relation::Scalar)
    }

    pub fn many_to_one(self, name: impl Into<String>, target: impl Into<EntityType>) -> Self {
        self.field(name, Relation::ManyToOne(target.into()))
    }

    pub fn one_to_one(self, name: impl Into<String>, target: impl Into<EntityType>) -> Self {
        self.field(name, Relation::OneToOne(target.into()))
    }

    pub fn one_to_many(self, name: impl Into<String>, target: impl Into<EntityType>) -> Self {
        self.field(name, Relation::OneToMany(target.into()))
    }

    pub fn many_to_many(self, name: impl Into<String>, target: impl Into<EntityType>) -> Self {
        self.field(name, Relation::ManyToMany(target.into()))
    }

    /// Declare an in-memory-only scalar field.
    pub fn transient(mut self, name: impl Into<String>) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            relation: Relation::Scalar,
            persistent: false,
        });
        self
    }

    pub fn build(self) -> Result<EntitySchema, SchemaError> {
        let mut by_name = HashMap::with_capacity(self.fields.len());
        for (slot, def) in self.fields.iter().enumerate() {
            if by_name.insert(def.name.clone(), slot).is_some() {
                return Err(SchemaError::DuplicateField {
                    entity_type: self.entity_type,
                    field: def.name.clone(),
                });
            }
        }

        let id_slot = self
            .id
            .as_ref()
            .and_then(|name| by_name.get(name).copied())
            .ok_or_else(|| SchemaError::MissingId(self.entity_type.clone()))?;

        Ok(EntitySchema {
            id: NEXT_SCHEMA_ID.fetch_add(1, Ordering::Relaxed),
            entity_type: self.entity_type,
            fields: self.fields,
            by_name,
            id_slot,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Values
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifier of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(id) => write!(f, "{}", id),
            RecordId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        RecordId::Int(id)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        RecordId::Text(id.to_string())
    }
}

impl From<RecordId> for Value {
    fn from(id: RecordId) -> Self {
        match id {
            RecordId::Int(id) => Value::Int(id),
            RecordId::Text(id) => Value::Text(id),
        }
    }
}

/// Kind of a multi-valued container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    List,
    Set,
}

/// A field value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent.
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    /// Reference to another entity (compared by identity).
    Ref(EntityRef),
    /// Multi-valued container.
    Collection(CollectionKind, Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Referenced entity, if this is a reference.
    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Value::Ref(entity) => Some(entity),
            _ => None,
        }
    }

    /// Convert to a record id. Only integers and text can identify records.
    pub fn as_record_id(&self) -> Option<RecordId> {
        match self {
            Value::Int(id) => Some(RecordId::Int(*id)),
            Value::Text(id) => Some(RecordId::Text(id.clone())),
            _ => None,
        }
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Collection(CollectionKind::List, items.into_iter().collect())
    }

    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Collection(CollectionKind::Set, items.into_iter().collect())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<EntityRef> for Value {
    fn from(v: EntityRef) -> Self {
        Value::Ref(v)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entity
// ═══════════════════════════════════════════════════════════════════════════════

/// One record: a schema plus one value per field slot.
///
/// Cloning is shallow: referenced entities are shared, not copied.
#[derive(Clone)]
pub struct Entity {
    schema: Arc<EntitySchema>,
    values: Vec<Value>,
}

impl Entity {
    /// Empty instance: every field absent.
    pub fn new(schema: Arc<EntitySchema>) -> Self {
        let values = vec![Value::Null; schema.fields.len()];
        Self { schema, values }
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.schema.entity_type
    }

    /// Read a field through a token issued by this entity's schema.
    pub fn get(&self, token: FieldToken) -> Result<&Value, FieldAccessError> {
        self.check(token)?;
        Ok(&self.values[token.slot])
    }

    /// Write a field through a token issued by this entity's schema.
    ///
    /// The value must fit the field's relation: references go in reference
    /// fields, collections in collection fields, everything else in scalars.
    pub fn set(&mut self, token: FieldToken, value: Value) -> Result<(), FieldAccessError> {
        self.check(token)?;
        let def = &self.schema.fields[token.slot];
        if !def.relation.accepts(&value) {
            return Err(FieldAccessError::TypeMismatch {
                entity_type: self.schema.entity_type.clone(),
                field: def.name.clone(),
                expected: def.relation.describe(),
            });
        }
        self.values[token.slot] = value;
        Ok(())
    }

    pub fn get_by_name(&self, name: &str) -> Result<&Value, FieldAccessError> {
        let token = self.token_for(name)?;
        self.get(token)
    }

    pub fn set_by_name(&mut self, name: &str, value: impl Into<Value>) -> Result<(), FieldAccessError> {
        let token = self.token_for(name)?;
        self.set(token, value.into())
    }

    /// Record id, if the id field holds an integer or text.
    pub fn id(&self) -> Option<RecordId> {
        self.values[self.schema.id_slot].as_record_id()
    }

    /// Iterate `(definition, value)` pairs in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&FieldDef, &Value)> + '_ {
        self.schema.fields.iter().zip(self.values.iter())
    }

    /// Overwrite every field with the values of `other`.
    ///
    /// Both entities must be of the same type.
    pub fn copy_fields_from(&mut self, other: &Entity) -> Result<(), FieldAccessError> {
        if other.schema.entity_type != self.schema.entity_type
            || other.values.len() != self.values.len()
        {
            return Err(FieldAccessError::IncompatibleTypes {
                source_type: other.schema.entity_type.clone(),
                target_type: self.schema.entity_type.clone(),
            });
        }
        self.values.clone_from(&other.values);
        Ok(())
    }

    /// Empty every reference and collection field. Scalars are kept.
    pub fn clear_references(&mut self) {
        for value in &mut self.values {
            match value {
                Value::Ref(_) => *value = Value::Null,
                Value::Collection(_, items) => items.clear(),
                _ => {}
            }
        }
    }

    fn token_for(&self, name: &str) -> Result<FieldToken, FieldAccessError> {
        self.schema
            .field(name)
            .ok_or_else(|| FieldAccessError::UnknownField {
                entity_type: self.schema.entity_type.clone(),
                field: name.to_string(),
            })
    }

    fn check(&self, token: FieldToken) -> Result<(), FieldAccessError> {
        if token.schema != self.schema.id || token.slot >= self.values.len() {
            return Err(FieldAccessError::ForeignToken {
                entity_type: self.schema.entity_type.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Entity {
    // References print as `Type#id` so cyclic graphs stay printable.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.schema.entity_type.name());
        for (def, value) in self.fields() {
            s.field(&def.name, value);
        }
        s.finish()
    }
}

/// Shared handle to an entity. Equality and hashing are by identity.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write()
    }

    /// True if both handles point at the same object.
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address-based identity, stable for the lifetime of the object.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn entity_type(&self) -> EntityType {
        self.read().entity_type().clone()
    }

    pub fn id(&self) -> Option<RecordId> {
        self.read().id()
    }

    pub fn downgrade(&self) -> WeakEntityRef {
        WeakEntityRef(Arc::downgrade(&self.0))
    }
}

/// Non-owning handle to an entity.
#[derive(Clone)]
pub struct WeakEntityRef(Weak<RwLock<Entity>>);

impl WeakEntityRef {
    /// The entity, if it is still alive.
    pub fn upgrade(&self) -> Option<EntityRef> {
        self.0.upgrade().map(EntityRef)
    }
}

impl fmt::Debug for WeakEntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(entity) => write!(f, "Weak({:?})", entity),
            None => f.write_str("Weak(<dropped>)"),
        }
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // try_read: a writer may hold the lock while something logs the graph
        match self.0.try_read() {
            Some(entity) => match entity.id() {
                Some(id) => write!(f, "{}#{}", entity.entity_type(), id),
                None => write!(f, "{}@{:x}", entity.entity_type(), self.identity()),
            },
            None => write!(f, "<locked>@{:x}", self.identity()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Graph ownership
// ═══════════════════════════════════════════════════════════════════════════════

/// Owner of a set of entities that may reference each other in cycles.
///
/// Reference counting alone never frees a cycle. Dropping the owner empties
/// every reference field of its members, after which the members are freed
/// as soon as the last outside handle goes. Handles still held elsewhere see
/// scalars only.
#[derive(Default)]
pub struct GraphOwner {
    members: Vec<EntityRef>,
}

impl GraphOwner {
    pub fn new(members: Vec<EntityRef>) -> Self {
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.members.iter().any(|m| m.ptr_eq(entity))
    }

    /// Give up ownership without clearing anything.
    pub fn release(mut self) -> Vec<EntityRef> {
        std::mem::take(&mut self.members)
    }
}

impl Drop for GraphOwner {
    fn drop(&mut self) {
        for member in &self.members {
            member.write().clear_references();
        }
    }
}

impl fmt::Debug for GraphOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphOwner")
            .field("members", &self.members.len())
            .finish()
    }
}

/// A root entity together with the owner of the graph hanging off it.
#[derive(Debug)]
pub struct EntityGraph {
    root: EntityRef,
    owner: GraphOwner,
}

impl EntityGraph {
    pub fn new(root: EntityRef, owner: GraphOwner) -> Self {
        Self { root, owner }
    }

    /// A root this graph does not own; nothing is cleared on drop.
    pub fn unowned(root: EntityRef) -> Self {
        Self::new(root, GraphOwner::default())
    }

    /// Copy everything reachable from `root` into new objects.
    ///
    /// Shared references, cycles and self-references come out with the same
    /// shape. The copy shares nothing with the source.
    pub fn deep_copy(root: &EntityRef) -> Self {
        let mut copies = HashMap::new();
        let mut members = Vec::new();
        let copy = copy_node(root, &mut copies, &mut members);
        Self::new(copy, GraphOwner::new(members))
    }

    pub fn root(&self) -> &EntityRef {
        &self.root
    }

    /// Number of objects owned.
    pub fn len(&self) -> usize {
        self.owner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owner.is_empty()
    }

    /// Keep the graph alive past this owner. The caller becomes responsible
    /// for any cycle in it.
    pub fn into_root(self) -> EntityRef {
        let Self { root, owner } = self;
        owner.release();
        root
    }
}

fn copy_node(
    source: &EntityRef,
    copies: &mut HashMap<EntityRef, EntityRef>,
    members: &mut Vec<EntityRef>,
) -> EntityRef {
    if let Some(copy) = copies.get(source) {
        return copy.clone();
    }
    let (schema, values) = {
        let guard = source.read();
        (Arc::clone(&guard.schema), guard.values.clone())
    };
    let target = EntityRef::new(Entity::new(schema));
    copies.insert(source.clone(), target.clone());
    members.push(target.clone());

    let values = values
        .into_iter()
        .map(|value| copy_graph_value(value, copies, members))
        .collect();
    target.write().values = values;
    target
}

fn copy_graph_value(
    value: Value,
    copies: &mut HashMap<EntityRef, EntityRef>,
    members: &mut Vec<EntityRef>,
) -> Value {
    match value {
        Value::Ref(entity) => Value::Ref(copy_node(&entity, copies, members)),
        Value::Collection(kind, items) => Value::Collection(
            kind,
            items
                .into_iter()
                .map(|item| copy_graph_value(item, copies, members))
                .collect(),
        ),
        scalar => scalar,
    }
}
