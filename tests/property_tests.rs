//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use entity_replicator::entity::{EntityRef, EntitySchema, EntityType, RecordId};
use entity_replicator::resilience::RetryConfig;
use entity_replicator::{Catalog, OperationKind, PendingQueue, StaticCatalog};
use proptest::prelude::*;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn catalog() -> StaticCatalog {
    StaticCatalog::new()
        .with_unit(
            "master",
            [EntitySchema::builder("master.Unit").id("id").build().unwrap()],
        )
        .unwrap()
}

fn entity(catalog: &StaticCatalog, id: i64) -> EntityRef {
    let e = catalog.new_instance(&EntityType::new("master.Unit")).unwrap();
    e.write().set_by_name("id", id).unwrap();
    e
}

async fn ids(queue: &PendingQueue) -> Vec<i64> {
    queue
        .pending()
        .await
        .iter()
        .map(|op| match op.entity().id() {
            Some(RecordId::Int(id)) => id,
            _ => -1,
        })
        .collect()
}

fn kind_strategy() -> impl Strategy<Value = OperationKind> {
    prop_oneof![
        Just(OperationKind::Create),
        Just(OperationKind::Update),
        Just(OperationKind::Delete),
    ]
}

// =============================================================================
// Queue Ordering Properties
// =============================================================================

proptest! {
    /// The pending list is exactly the enqueue sequence
    #[test]
    fn queue_preserves_fifo_order(kinds in prop::collection::vec(kind_strategy(), 0..50)) {
        let c = catalog();
        let rt = runtime();
        let (got_ids, got_kinds) = rt.block_on(async {
            let queue = PendingQueue::in_memory();
            for (i, kind) in kinds.iter().enumerate() {
                queue.enqueue(*kind, entity(&c, i as i64)).await.unwrap();
            }
            let kinds: Vec<_> = queue.pending().await.iter().map(|op| op.kind()).collect();
            (ids(&queue).await, kinds)
        });

        let expected: Vec<i64> = (0..kinds.len() as i64).collect();
        prop_assert_eq!(got_ids, expected);
        prop_assert_eq!(got_kinds, kinds);
    }

    /// Pausing never reorders or loses producer writes
    #[test]
    fn queue_pause_does_not_affect_producers(count in 0usize..30, pause_at in 0usize..30) {
        let c = catalog();
        let rt = runtime();
        let got = rt.block_on(async {
            let queue = PendingQueue::in_memory();
            for i in 0..count {
                if i == pause_at {
                    queue.pause().unwrap();
                }
                queue.enqueue(OperationKind::Create, entity(&c, i as i64)).await.unwrap();
            }
            ids(&queue).await
        });
        prop_assert_eq!(got, (0..count as i64).collect::<Vec<_>>());
    }
}

// =============================================================================
// Mark / Rollback Properties
// =============================================================================

proptest! {
    /// Rollback restores exactly the prefix present at mark time
    #[test]
    fn rollback_restores_marked_prefix(before in 0usize..20, after in 0usize..20) {
        let c = catalog();
        let rt = runtime();
        let (marked, dropped, remaining, second) = rt.block_on(async {
            let queue = PendingQueue::in_memory();
            for i in 0..before {
                queue.enqueue(OperationKind::Create, entity(&c, i as i64)).await.unwrap();
            }
            let marked = queue.mark().await;
            for i in 0..after {
                queue.enqueue(OperationKind::Update, entity(&c, (before + i) as i64)).await.unwrap();
            }
            let dropped = queue.rollback_to_marked_position().await;
            let remaining = ids(&queue).await;
            let second = queue.rollback_to_marked_position().await;
            (marked, dropped, remaining, second)
        });

        prop_assert_eq!(marked, before);
        prop_assert_eq!(dropped, after);
        prop_assert_eq!(remaining, (0..before as i64).collect::<Vec<_>>());
        // Mark is cleared by the first rollback
        prop_assert_eq!(second, 0);
    }

    /// A later mark replaces an earlier one
    #[test]
    fn mark_overwrites_previous_mark(first in 0usize..10, extra in 0usize..10, tail in 0usize..10) {
        let c = catalog();
        let rt = runtime();
        let (size, mark) = rt.block_on(async {
            let queue = PendingQueue::in_memory();
            let mut next = 0i64;
            for _ in 0..first {
                queue.enqueue(OperationKind::Create, entity(&c, next)).await.unwrap();
                next += 1;
            }
            queue.mark().await;
            for _ in 0..extra {
                queue.enqueue(OperationKind::Create, entity(&c, next)).await.unwrap();
                next += 1;
            }
            let mark = queue.mark().await;
            for _ in 0..tail {
                queue.enqueue(OperationKind::Create, entity(&c, next)).await.unwrap();
                next += 1;
            }
            queue.rollback_to_marked_position().await;
            (queue.size().await, mark)
        });
        prop_assert_eq!(mark, first + extra);
        prop_assert_eq!(size, first + extra);
    }
}

// =============================================================================
// Backoff Properties
// =============================================================================

proptest! {
    /// Delay never exceeds the cap and never shrinks between attempts
    #[test]
    fn backoff_is_monotonic_and_capped(
        initial_ms in 1u64..1_000,
        max_ms in 1_000u64..60_000,
        factor in 1.0f64..4.0,
        attempt in 1usize..200,
    ) {
        let config = RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_factor: factor,
        };
        let current = config.delay_for_attempt(attempt);
        let next = config.delay_for_attempt(attempt + 1);
        prop_assert!(current <= config.max_delay);
        prop_assert!(next >= current);
    }
}
