// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable snapshot of the pending-operation list.
//!
//! Written when the queue stops, read when it is constructed. The file is a
//! versioned JSON document:
//!
//! ```json
//! {
//!   "version": 1,
//!   "written_at": "2026-01-01T00:00:00Z",
//!   "nodes": [
//!     { "type": "master.Unit", "fields": { "id": { "t": "int", "v": 1 },
//!                                           "parent": { "t": "ref", "v": 0 } } }
//!   ],
//!   "operations": [
//!     { "kind": "create", "enqueued_at": "2026-01-01T00:00:00Z", "entity": 0 }
//!   ]
//! }
//! ```
//!
//! Entity graphs are flattened into one arena of `nodes` shared by every
//! operation. References are arena indices, so shared objects, cycles and
//! self-references come back as the same object graph. Only persistent
//! fields are written.
//!
//! # Failure Handling
//!
//! | Condition | Result of [`SnapshotFile::load_or_empty`] |
//! |-----------|-------------------------------------------|
//! | File missing | empty list, logged at info |
//! | Malformed JSON, unknown version | empty list, logged at warn |
//! | Entity type not in the catalog | empty list, logged at warn |
//! | Field no longer in the schema | field skipped, logged at debug |

use crate::catalog::Catalog;
use crate::entity::{CollectionKind, EntityRef, EntityType, FieldAccessError, GraphOwner, Value};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::operation::{Operation, OperationKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Why a snapshot could not be encoded or decoded.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("malformed snapshot: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported snapshot version {found} (expected {})", SNAPSHOT_VERSION)]
    UnsupportedVersion { found: u32 },

    #[error("entity type {0} is not in the catalog")]
    UnknownType(EntityType),

    #[error("reference to missing node {index}")]
    DanglingReference { index: usize },

    #[error("field error: {0}")]
    Field(#[from] FieldAccessError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Wire format
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    version: u32,
    written_at: DateTime<Utc>,
    #[serde(default)]
    nodes: Vec<StoredNode>,
    #[serde(default)]
    operations: Vec<StoredOperation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredOperation {
    kind: OperationKind,
    enqueued_at: DateTime<Utc>,
    entity: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredNode {
    #[serde(rename = "type")]
    entity_type: EntityType,
    #[serde(default)]
    fields: BTreeMap<String, StoredValue>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
enum StoredValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Ref(usize),
    List(Vec<StoredValue>),
    Set(Vec<StoredValue>),
}

/// JSON has no NaN or infinity, so non-finite floats are written as strings.
mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
        // Pre-existing documents hold `null` where serde_json dropped a non-finite value
        Null(()),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Null(()) => Ok(f64::NAN),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!("invalid float {:?}", other))),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Encoding
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Encoder {
    index: HashMap<EntityRef, usize>,
    nodes: Vec<StoredNode>,
}

impl Encoder {
    fn node(&mut self, entity: &EntityRef) -> usize {
        if let Some(&index) = self.index.get(entity) {
            return index;
        }

        // Reserve the slot first so cycles resolve to it
        let index = self.nodes.len();
        self.index.insert(entity.clone(), index);
        let (entity_type, values) = {
            let guard = entity.read();
            let values: Vec<(String, Value)> = guard
                .fields()
                .filter(|(def, _)| def.persistent)
                .map(|(def, value)| (def.name.clone(), value.clone()))
                .collect();
            (guard.entity_type().clone(), values)
        };
        self.nodes.push(StoredNode {
            entity_type,
            fields: BTreeMap::new(),
        });

        let mut fields = BTreeMap::new();
        for (name, value) in values {
            let stored = self.value(value);
            fields.insert(name, stored);
        }
        self.nodes[index].fields = fields;
        index
    }

    fn value(&mut self, value: Value) -> StoredValue {
        match value {
            Value::Null => StoredValue::Null,
            Value::Bool(v) => StoredValue::Bool(v),
            Value::Int(v) => StoredValue::Int(v),
            Value::Float(v) => StoredValue::Float(v),
            Value::Text(v) => StoredValue::Text(v),
            Value::Bytes(v) => StoredValue::Bytes(v),
            Value::Timestamp(v) => StoredValue::Timestamp(v),
            Value::Ref(entity) => StoredValue::Ref(self.node(&entity)),
            Value::Collection(kind, items) => {
                let items = items.into_iter().map(|item| self.value(item)).collect();
                match kind {
                    CollectionKind::List => StoredValue::List(items),
                    CollectionKind::Set => StoredValue::Set(items),
                }
            }
        }
    }
}

/// Serialize operations into a snapshot document.
pub fn encode(operations: &[Operation]) -> std::result::Result<Vec<u8>, SnapshotError> {
    let mut encoder = Encoder::default();
    let operations = operations
        .iter()
        .map(|op| StoredOperation {
            kind: op.kind(),
            enqueued_at: op.enqueued_at(),
            entity: encoder.node(op.entity()),
        })
        .collect();

    let document = SnapshotDocument {
        version: SNAPSHOT_VERSION,
        written_at: Utc::now(),
        nodes: encoder.nodes,
        operations,
    };
    Ok(serde_json::to_vec_pretty(&document)?)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decoding
// ═══════════════════════════════════════════════════════════════════════════════

/// Rebuild operations from a snapshot document.
///
/// Every entity type must exist in `catalog`. Fields the schema no longer
/// declares are skipped.
pub fn decode(bytes: &[u8], catalog: &dyn Catalog) -> std::result::Result<Vec<Operation>, SnapshotError> {
    let document: SnapshotDocument = serde_json::from_slice(bytes)?;
    if document.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion {
            found: document.version,
        });
    }

    // Allocate every object before wiring references between them
    let entities = document
        .nodes
        .iter()
        .map(|node| {
            catalog
                .new_instance(&node.entity_type)
                .ok_or_else(|| SnapshotError::UnknownType(node.entity_type.clone()))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    // Owns the rebuilt graph; on an early return it frees what was wired so far
    let owner = Arc::new(GraphOwner::new(entities.clone()));

    for (node, entity) in document.nodes.into_iter().zip(&entities) {
        for (name, stored) in node.fields {
            let value = decode_value(stored, &entities)?;
            let mut guard = entity.write();
            let Some(token) = guard.schema().field(&name) else {
                debug!(entity_type = %node.entity_type, field = %name, "Skipping unknown snapshot field");
                continue;
            };
            guard.set(token, value)?;
        }
    }

    document
        .operations
        .into_iter()
        .map(|op| -> std::result::Result<Operation, SnapshotError> {
            let entity = entities
                .get(op.entity)
                .cloned()
                .ok_or(SnapshotError::DanglingReference { index: op.entity })?;
            Ok(Operation::at(op.kind, entity, op.enqueued_at).with_owner(Arc::clone(&owner)))
        })
        .collect()
}

fn decode_value(stored: StoredValue, entities: &[EntityRef]) -> std::result::Result<Value, SnapshotError> {
    let decode_all = |items: Vec<StoredValue>| {
        items
            .into_iter()
            .map(|item| decode_value(item, entities))
            .collect::<std::result::Result<Vec<_>, _>>()
    };
    Ok(match stored {
        StoredValue::Null => Value::Null,
        StoredValue::Bool(v) => Value::Bool(v),
        StoredValue::Int(v) => Value::Int(v),
        StoredValue::Float(v) => Value::Float(v),
        StoredValue::Text(v) => Value::Text(v),
        StoredValue::Bytes(v) => Value::Bytes(v),
        StoredValue::Timestamp(v) => Value::Timestamp(v),
        StoredValue::Ref(index) => Value::Ref(
            entities
                .get(index)
                .cloned()
                .ok_or(SnapshotError::DanglingReference { index })?,
        ),
        StoredValue::List(items) => Value::Collection(CollectionKind::List, decode_all(items)?),
        StoredValue::Set(items) => Value::Collection(CollectionKind::Set, decode_all(items)?),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// File
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot location on disk.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot atomically (temp file in the same directory, then rename).
    pub async fn save(&self, operations: &[Operation]) -> Result<()> {
        let result = self.write(operations).await;
        metrics::record_snapshot_write(result.is_ok());
        match &result {
            Ok(()) => info!(
                path = %self.path.display(),
                operations = operations.len(),
                "Pending operations snapshot written"
            ),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to write snapshot"),
        }
        result.map_err(|e| ReplicationError::durability(self.path.display(), e.to_string()))
    }

    async fn write(&self, operations: &[Operation]) -> std::result::Result<(), SnapshotError> {
        let bytes = encode(operations)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read the snapshot. `Ok(None)` when no snapshot exists.
    pub async fn load(&self, catalog: &dyn Catalog) -> Result<Option<Vec<Operation>>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ReplicationError::durability(self.path.display(), e.to_string())),
        };
        decode(&bytes, catalog)
            .map(Some)
            .map_err(|e| ReplicationError::durability(self.path.display(), e.to_string()))
    }

    /// Read the snapshot, treating every failure as "nothing pending".
    pub async fn load_or_empty(&self, catalog: &dyn Catalog) -> Vec<Operation> {
        let operations = match self.load(catalog).await {
            Ok(Some(operations)) => {
                info!(
                    path = %self.path.display(),
                    operations = operations.len(),
                    "Loaded pending operations snapshot"
                );
                operations
            }
            Ok(None) => {
                info!(path = %self.path.display(), "No pending operations snapshot, starting empty");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Discarding unreadable snapshot, starting empty");
                Vec::new()
            }
        };
        metrics::set_snapshot_loaded(operations.len());
        operations
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::entity::EntitySchema;
    use tempfile::tempdir;

    fn catalog() -> StaticCatalog {
        StaticCatalog::new()
            .with_unit(
                "master",
                [EntitySchema::builder("master.Unit")
                    .id("id")
                    .scalar("name")
                    .many_to_one("parent", "master.Unit")
                    .one_to_many("children", "master.Unit")
                    .transient("scratch")
                    .build()
                    .unwrap()],
            )
            .unwrap()
    }

    fn unit(catalog: &StaticCatalog, id: i64, name: &str) -> EntityRef {
        let unit = catalog.new_instance(&EntityType::new("master.Unit")).unwrap();
        unit.write().set_by_name("id", id).unwrap();
        unit.write().set_by_name("name", name).unwrap();
        unit
    }

    #[test]
    fn test_graph_identity_survives() {
        let catalog = catalog();
        let root = unit(&catalog, 1, "HQ");
        let child = unit(&catalog, 2, "Depot");
        root.write().set_by_name("parent", root.clone()).unwrap();
        root.write()
            .set_by_name("children", Value::set([Value::Ref(child.clone())]))
            .unwrap();
        child.write().set_by_name("parent", root.clone()).unwrap();
        root.write().set_by_name("scratch", "not persisted").unwrap();

        let ops = vec![
            Operation::new(OperationKind::Create, root.clone()),
            Operation::new(OperationKind::Update, child),
        ];
        let bytes = encode(&ops).unwrap();
        let loaded = decode(&bytes, &catalog).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].kind(), OperationKind::Create);
        assert_eq!(loaded[0].enqueued_at(), ops[0].enqueued_at());

        let root2 = loaded[0].entity().clone();
        let child2 = loaded[1].entity().clone();
        let parent = root2.read().get_by_name("parent").unwrap().clone();
        assert!(parent.as_entity().unwrap().ptr_eq(&root2));

        let child_parent = child2.read().get_by_name("parent").unwrap().clone();
        assert!(child_parent.as_entity().unwrap().ptr_eq(&root2));

        match root2.read().get_by_name("children").unwrap() {
            Value::Collection(CollectionKind::Set, items) => {
                assert!(items[0].as_entity().unwrap().ptr_eq(&child2));
            }
            other => panic!("expected a set, got {:?}", other),
        }
        assert!(root2.read().get_by_name("scratch").unwrap().is_null());
    }

    #[test]
    fn test_decoded_cycle_freed_with_last_operation() {
        let catalog = catalog();
        let root = unit(&catalog, 1, "HQ");
        root.write().set_by_name("parent", root.clone()).unwrap();
        let ops = vec![
            Operation::new(OperationKind::Create, root.clone()),
            Operation::new(OperationKind::Update, root),
        ];

        let mut loaded = decode(&encode(&ops).unwrap(), &catalog).unwrap();
        let weak = loaded[0].entity().downgrade();
        assert!(loaded[0].entity().ptr_eq(loaded[1].entity()));

        let first = loaded.remove(0);
        drop(first);
        let survivor = weak.upgrade().unwrap();
        let parent = survivor.read().get_by_name("parent").unwrap().as_entity().cloned().unwrap();
        assert!(parent.ptr_eq(&survivor));
        drop((survivor, parent));

        drop(loaded);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_non_finite_floats_survive() {
        let catalog = StaticCatalog::new()
            .with_unit(
                "master",
                [EntitySchema::builder("master.Sensor")
                    .id("id")
                    .scalar("reading")
                    .build()
                    .unwrap()],
            )
            .unwrap();
        let readings = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -0.5];
        let ops: Vec<Operation> = readings
            .iter()
            .enumerate()
            .map(|(i, reading)| {
                let sensor = catalog.new_instance(&EntityType::new("master.Sensor")).unwrap();
                sensor.write().set_by_name("id", i as i64).unwrap();
                sensor.write().set_by_name("reading", Value::Float(*reading)).unwrap();
                Operation::new(OperationKind::Update, sensor)
            })
            .collect();

        let loaded = decode(&encode(&ops).unwrap(), &catalog).unwrap();
        assert_eq!(loaded.len(), 4);
        let got: Vec<f64> = loaded
            .iter()
            .map(|op| match op.entity().read().get_by_name("reading").unwrap() {
                Value::Float(v) => *v,
                other => panic!("expected a float, got {:?}", other),
            })
            .collect();
        assert!(got[0].is_nan());
        assert_eq!(got[1], f64::INFINITY);
        assert_eq!(got[2], f64::NEG_INFINITY);
        assert_eq!(got[3], -0.5);
    }

    #[test]
    fn test_null_float_reads_as_nan() {
        let catalog = StaticCatalog::new()
            .with_unit(
                "master",
                [EntitySchema::builder("master.Sensor")
                    .id("id")
                    .scalar("reading")
                    .build()
                    .unwrap()],
            )
            .unwrap();
        let doc = r#"{"version": 1, "written_at": "2026-01-01T00:00:00Z",
            "nodes": [{"type": "master.Sensor", "fields": {"id": {"t": "int", "v": 1}, "reading": {"t": "float", "v": null}}}],
            "operations": [{"kind": "update", "enqueued_at": "2026-01-01T00:00:00Z", "entity": 0}]}"#;
        let ops = decode(doc.as_bytes(), &catalog).unwrap();
        assert!(matches!(
            ops[0].entity().read().get_by_name("reading").unwrap(),
            Value::Float(v) if v.is_nan()
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let doc = r#"{"version": 99, "written_at": "2026-01-01T00:00:00Z", "nodes": [], "operations": []}"#;
        let err = decode(doc.as_bytes(), &catalog()).unwrap_err();
        assert!(matches!(err, SnapshotError::UnsupportedVersion { found: 99 }));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let doc = r#"{"version": 1, "written_at": "2026-01-01T00:00:00Z",
            "nodes": [{"type": "master.Gone", "fields": {}}],
            "operations": [{"kind": "create", "enqueued_at": "2026-01-01T00:00:00Z", "entity": 0}]}"#;
        let err = decode(doc.as_bytes(), &catalog()).unwrap_err();
        assert!(matches!(err, SnapshotError::UnknownType(_)));
    }

    #[test]
    fn test_rejects_dangling_reference() {
        let doc = r#"{"version": 1, "written_at": "2026-01-01T00:00:00Z",
            "nodes": [{"type": "master.Unit", "fields": {"parent": {"t": "ref", "v": 7}}}],
            "operations": []}"#;
        let err = decode(doc.as_bytes(), &catalog()).unwrap_err();
        assert!(matches!(err, SnapshotError::DanglingReference { index: 7 }));
    }

    #[test]
    fn test_skips_removed_field() {
        let doc = r#"{"version": 1, "written_at": "2026-01-01T00:00:00Z",
            "nodes": [{"type": "master.Unit", "fields": {"id": {"t": "int", "v": 4}, "legacy": {"t": "text", "v": "x"}}}],
            "operations": [{"kind": "delete", "enqueued_at": "2026-01-01T00:00:00Z", "entity": 0}]}"#;
        let ops = decode(doc.as_bytes(), &catalog()).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].entity().id(), Some(4i64.into()));
    }

    #[tokio::test]
    async fn test_file_round_trip_and_missing_file() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("nested").join("pending.json"));
        let catalog = catalog();

        assert!(file.load(&catalog).await.unwrap().is_none());
        assert!(file.load_or_empty(&catalog).await.is_empty());

        let ops = vec![Operation::new(OperationKind::Create, unit(&catalog, 1, "HQ"))];
        file.save(&ops).await.unwrap();
        assert!(!file.temp_path().exists());

        let loaded = file.load(&catalog).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].entity().id(), Some(1i64.into()));
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pending.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let file = SnapshotFile::new(&path);
        let err = file.load(&catalog()).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Durability { .. }));
        assert!(file.load_or_empty(&catalog()).await.is_empty());
    }
}
