use proptest::prelude::*;

use granite_tablet::{earliest_needed_log_index, GcBoundInputs};

fn inputs_strategy() -> impl Strategy<Value = GcBoundInputs> {
    (1u64..10_000).prop_flat_map(|latest| {
        (
            Just(latest),
            proptest::option::of(1..=latest),
            prop_oneof![Just(0u64), 1..=latest],
            prop_oneof![Just(0u64), 1..=latest],
            prop_oneof![Just(0u64), 1..=latest],
            0..=latest,
            proptest::collection::vec(0..=latest, 0..3),
        )
            .prop_map(
                |(latest_index, earliest_anchor, pending, retryable, txn, committed, persistent)| GcBoundInputs {
                    latest_index,
                    earliest_anchor,
                    min_pending_index: pending,
                    min_retryable_index: retryable,
                    transaction_bound: txn,
                    last_committed_index: committed,
                    persistent_indexes: persistent,
                },
            )
    })
}

proptest! {
    #[test]
    fn test_gc_bound_never_passes_a_constraint(inputs in inputs_strategy()) {
        let bound = earliest_needed_log_index(&inputs);

        prop_assert!(bound <= inputs.latest_index);
        prop_assert!(bound <= inputs.last_committed_index);
        if let Some(anchor) = inputs.earliest_anchor {
            prop_assert!(bound <= anchor);
        }
        for optional in [inputs.min_pending_index, inputs.min_retryable_index, inputs.transaction_bound] {
            if optional > 0 {
                prop_assert!(bound <= optional);
            }
        }
        for persisted in &inputs.persistent_indexes {
            prop_assert!(bound <= *persisted);
        }
    }

    #[test]
    fn test_gc_bound_is_tight(inputs in inputs_strategy()) {
        // the bound is one of the inputs, so nothing is retained needlessly
        let bound = earliest_needed_log_index(&inputs);
        let mut candidates = vec![inputs.latest_index, inputs.last_committed_index];
        candidates.extend(inputs.earliest_anchor);
        candidates.extend(inputs.persistent_indexes.iter().copied());
        candidates.extend(
            [inputs.min_pending_index, inputs.min_retryable_index, inputs.transaction_bound]
                .into_iter()
                .filter(|i| *i > 0),
        );
        prop_assert!(candidates.contains(&bound));
    }

    #[test]
    fn test_gc_bound_empty_log_keeps_nothing(mut inputs in inputs_strategy()) {
        inputs.latest_index = 0;
        prop_assert_eq!(earliest_needed_log_index(&inputs), 0);
    }
}
