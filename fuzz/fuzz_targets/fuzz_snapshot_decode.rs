//! Fuzz target for snapshot decoding.
//!
//! A snapshot file is read back at startup, so `snapshot::decode` must
//! reject anything malformed with an error, never a panic.

#![no_main]

use entity_replicator::entity::EntitySchema;
use entity_replicator::snapshot;
use entity_replicator::StaticCatalog;
use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;

fn catalog() -> &'static StaticCatalog {
    static CATALOG: OnceLock<StaticCatalog> = OnceLock::new();
    CATALOG.get_or_init(|| {
        StaticCatalog::new()
            .with_unit(
                "master",
                [
                    EntitySchema::builder("master.Unit")
                        .id("id")
                        .scalar("name")
                        .one_to_many("tasks", "master.Task")
                        .build()
                        .unwrap(),
                    EntitySchema::builder("master.Task")
                        .id("id")
                        .many_to_one("unit", "master.Unit")
                        .build()
                        .unwrap(),
                ],
            )
            .unwrap()
    })
}

fuzz_target!(|data: &[u8]| {
    let _ = snapshot::decode(data, catalog());
});
