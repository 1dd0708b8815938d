//! Ordering properties of the context's build and teardown plans.

use rtrt_gpu::{
    build_plan, teardown_plan, OptionalResources, ResourceKind, ResourceLedger, TeardownStep,
};

fn destroy_order(optional: OptionalResources) -> Vec<ResourceKind> {
    teardown_plan(optional)
        .into_iter()
        .filter_map(|step| match step {
            TeardownStep::Destroy(kind) => Some(kind),
            _ => None,
        })
        .collect()
}

fn position(order: &[ResourceKind], kind: ResourceKind) -> Option<usize> {
    order.iter().position(|&k| k == kind)
}

#[test]
fn dependents_are_destroyed_before_their_dependencies() {
    for optional in OptionalResources::permutations() {
        let order = destroy_order(optional);
        for &kind in &order {
            let at = position(&order, kind).unwrap();
            for &dep in kind.dependencies() {
                let dep_at = position(&order, dep)
                    .unwrap_or_else(|| panic!("{dep} missing from teardown ({optional:?})"));
                assert!(at < dep_at, "{kind} destroyed after {dep} ({optional:?})");
            }
        }
    }
}

#[test]
fn dependencies_are_created_before_their_dependents() {
    for optional in OptionalResources::permutations() {
        let order = build_plan(optional);
        for &kind in &order {
            let at = position(&order, kind).unwrap();
            for &dep in kind.dependencies() {
                let dep_at = position(&order, dep).unwrap();
                assert!(dep_at < at, "{kind} created before {dep} ({optional:?})");
            }
        }
    }
}

#[test]
fn idle_waits_precede_every_destroy() {
    for optional in OptionalResources::permutations() {
        let plan = teardown_plan(optional);
        let first_destroy = plan
            .iter()
            .position(|step| matches!(step, TeardownStep::Destroy(_)))
            .unwrap();
        let idle = plan
            .iter()
            .position(|step| *step == TeardownStep::WaitDeviceIdle)
            .unwrap();
        assert!(idle < first_destroy);
    }
}

#[test]
fn surface_before_denoise_before_device() {
    let order = destroy_order(OptionalResources {
        overlay: true,
        denoise: true,
    });
    let surface = position(&order, ResourceKind::Surface).unwrap();
    let denoise = position(&order, ResourceKind::DenoisePass).unwrap();
    let pool = position(&order, ResourceKind::CommandPool).unwrap();
    let device = position(&order, ResourceKind::Device).unwrap();
    assert!(surface < denoise);
    assert!(denoise < pool);
    assert!(pool < device);
    assert_eq!(order.last(), Some(&ResourceKind::Instance));
}

#[test]
fn build_then_teardown_leaves_nothing_live() {
    for optional in OptionalResources::permutations() {
        let mut ledger = ResourceLedger::new();
        for kind in build_plan(optional) {
            ledger.record_created(kind).unwrap();
        }
        assert_eq!(ledger.optional_resources(), optional);

        for step in teardown_plan(ledger.optional_resources()) {
            if let TeardownStep::Destroy(kind) = step {
                ledger.record_destroyed(kind).unwrap();
            }
        }
        assert_eq!(ledger.live_count(), 0, "{optional:?}");
        for kind in ResourceKind::ALL {
            assert!(!ledger.is_live(kind));
        }
    }
}

#[test]
fn reversed_teardown_is_rejected() {
    let optional = OptionalResources::default();
    let mut ledger = ResourceLedger::new();
    for kind in build_plan(optional) {
        ledger.record_created(kind).unwrap();
    }
    let mut reversed = destroy_order(optional);
    reversed.reverse();
    assert_eq!(reversed[0], ResourceKind::Instance);
    assert!(ledger.record_destroyed(reversed[0]).is_err());
}
