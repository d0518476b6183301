//! Property-based test generators using proptest.
//!
//! Entity ids come from a small pool so generated batches touch the same
//! records repeatedly and exercise conflict detection.

use proptest::prelude::*;
use serde_json::{json, Value};
use tillsync_protocol::{Operation, SyncChange};

/// Entity ids drawn by [`change_strategy`].
pub const ID_POOL: &[&str] = &["p1", "p2", "p3", "p4"];

/// Strategy for entity ids from [`ID_POOL`].
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(ID_POOL).prop_map(str::to_string)
}

/// Strategy for product-like payloads.
pub fn payload_strategy() -> impl Strategy<Value = Value> {
    (
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
        0u32..10_000,
        0u32..100,
    )
        .prop_map(|(name, price, quantity)| {
            json!({"name": name, "price": price, "quantity": quantity})
        })
}

/// Strategy for mutation kinds.
pub fn operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Create),
        Just(Operation::Update),
        Just(Operation::Delete),
    ]
}

/// Strategy for a change to one of `entities`.
pub fn change_strategy(entities: &'static [&'static str]) -> impl Strategy<Value = SyncChange> {
    (
        prop::sample::select(entities),
        entity_id_strategy(),
        operation_strategy(),
        payload_strategy(),
        1u64..5,
    )
        .prop_map(|(entity, entity_id, operation, payload, version)| {
            let data = if operation == Operation::Delete {
                Value::Null
            } else {
                payload
            };
            SyncChange::new(entity, Some(entity_id), operation, data, version)
        })
}

/// Strategy for an upload of up to `max_len` changes with ids `c0`, `c1`, ...
pub fn changes_strategy(
    entities: &'static [&'static str],
    max_len: usize,
) -> impl Strategy<Value = Vec<SyncChange>> {
    prop::collection::vec(change_strategy(entities), 1..=max_len.max(1)).prop_map(|changes| {
        changes
            .into_iter()
            .enumerate()
            .map(|(i, change)| change.with_id(format!("c{i}")))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn generated_changes_are_valid() {
        let mut runner = TestRunner::default();
        for _ in 0..50 {
            let changes = changes_strategy(&["Product"], 8)
                .new_tree(&mut runner)
                .expect("Failed to generate")
                .current();
            assert!(!changes.is_empty());
            for change in &changes {
                assert!(change.validate().is_ok());
                assert_eq!(change.data.is_null(), change.operation == Operation::Delete);
            }
        }
    }
}
