//! Capacity and FIFO invariants over random acquire/release interleavings.

use proptest::prelude::*;
use restraint_core::notify::WakeupBus;
use restraint_core::restraint::{
    ConstraintRegistry, Coordinator, HoldingScope, InMemoryInstanceStore, Instance, InstanceState,
};
use restraint_core::types::{ConstraintId, InstanceId, ResourceUnit};
use restraint_core::Config;
use std::sync::Arc;

const CAPACITY: u32 = 3;

#[derive(Debug, Clone)]
enum Op {
    Acquire { unit: usize, permits: u32 },
    /// Release the n-th acquired instance (modulo count); may repeat.
    Release(usize),
    /// Release the oldest acquired instance again.
    ReleaseOldest,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..2usize, 1..=CAPACITY + 1).prop_map(|(unit, permits)| Op::Acquire { unit, permits }),
        3 => any::<usize>().prop_map(Op::Release),
        1 => Just(Op::ReleaseOldest),
    ]
}

fn units() -> [ResourceUnit; 2] {
    [
        ResourceUnit::try_from("unit-a").unwrap(),
        ResourceUnit::try_from("unit-b").unwrap(),
    ]
}

async fn snapshot(coordinator: &Coordinator, ids: &[InstanceId]) -> Vec<Instance> {
    let mut all = Vec::with_capacity(ids.len());
    for id in ids {
        all.push(coordinator.get(id).await.unwrap().unwrap());
    }
    all
}

fn check_invariants(instances: &[Instance]) -> Result<(), TestCaseError> {
    for unit in units() {
        let mut group: Vec<&Instance> = instances
            .iter()
            .filter(|i| i.resource_unit == unit)
            .collect();
        group.sort_by_key(|i| i.order);

        let used: u32 = group.iter().filter(|i| i.is_active()).map(|i| i.permits).sum();
        prop_assert!(used <= CAPACITY, "{} permits active in {}", used, unit);

        // No ACTIVE instance overtook a BLOCKED one
        if let Some(first_blocked) = group.iter().find(|i| i.is_blocked()) {
            prop_assert!(
                !group
                    .iter()
                    .any(|i| i.is_active() && i.order > first_blocked.order),
                "instance ordered after a waiter is active in {}",
                unit
            );
            // The head waiter would not fit
            prop_assert!(used + first_blocked.permits > CAPACITY);
        }

        prop_assert!(group
            .iter()
            .filter(|i| i.state == InstanceState::Rejected)
            .all(|i| i.permits > CAPACITY));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_capacity_and_fifo_hold(ops in prop::collection::vec(arb_op(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let registry = Arc::new(ConstraintRegistry::new());
            let constraint = ConstraintId::try_from("env").unwrap();
            registry.register(constraint.clone(), "Env", CAPACITY).await.unwrap();
            let coordinator = Coordinator::new(
                registry,
                Arc::new(InMemoryInstanceStore::new()),
                Arc::new(WakeupBus::new()),
                &Config::default(),
            );

            let mut ids: Vec<InstanceId> = Vec::new();
            for (n, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Acquire { unit, permits } => {
                        let outcome = coordinator
                            .acquire(
                                &constraint,
                                &units()[unit],
                                permits,
                                HoldingScope::Workflow(format!("wf-{n}")),
                            )
                            .await
                            .unwrap();
                        prop_assert_eq!(
                            outcome.state == InstanceState::Rejected,
                            permits > CAPACITY
                        );
                        ids.push(outcome.instance_id);
                    }
                    Op::Release(pick) if !ids.is_empty() => {
                        coordinator.release(&ids[pick % ids.len()]).await.unwrap();
                    }
                    Op::ReleaseOldest if !ids.is_empty() => {
                        coordinator.release(&ids[0]).await.unwrap();
                    }
                    _ => {}
                }
                check_invariants(&snapshot(&coordinator, &ids).await)?;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
