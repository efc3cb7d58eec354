use adapt_signal::prelude::*;
use adapt_signal::EffectFn;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::{Arc, Mutex};

struct Ctx {
    store: SignalStore,
    order: Arc<Mutex<Vec<usize>>>,
}

impl EffectHost for Ctx {
    fn signals(&self) -> &SignalStore {
        &self.store
    }

    fn signals_mut(&mut self) -> &mut SignalStore {
        &mut self.store
    }
}

fn recorder(tag: usize, deps: Vec<SignalId>) -> EffectFn<Ctx> {
    Box::new(move |ctx: &mut Ctx| {
        for dep in &deps {
            ctx.store.get(*dep).map_err(|e| EffectFault(e.to_string()))?;
        }
        ctx.order.lock().unwrap().push(tag);
        Ok(())
    })
}

fn build(signal_count: usize) -> (Ctx, Vec<SignalId>) {
    let mut store = SignalStore::new();
    let ids = (0..signal_count)
        .map(|i| {
            store
                .define(SignalKey::new(SignalDomain::Content, format!("s{i}")), SignalValue::Int(0))
                .unwrap()
        })
        .collect();
    (
        Ctx {
            store,
            order: Arc::new(Mutex::new(Vec::new())),
        },
        ids,
    )
}

#[test]
fn dependency_set_is_subset_of_scope_signals() {
    let (mut ctx, ids) = build(3);
    let mut scheduler = EffectScheduler::new(4);
    let effect = scheduler
        .register("reads-two", Phase::Observe, recorder(0, vec![ids[0], ids[2]]))
        .unwrap();
    scheduler.flush(Phase::Observe, &mut ctx).unwrap();

    let deps = scheduler.dependencies(effect).unwrap();
    assert_eq!(deps.iter().copied().collect::<Vec<_>>(), vec![ids[0], ids[2]]);
    assert!(deps.iter().all(|id| ctx.store.key(*id).is_ok()));
}

#[test]
fn burst_of_changes_reruns_dependent_once() {
    let (mut ctx, ids) = build(3);
    let mut scheduler = EffectScheduler::new(4);
    let effect = scheduler
        .register("reads-all", Phase::Propose, recorder(0, ids.clone()))
        .unwrap();
    scheduler.flush(Phase::Propose, &mut ctx).unwrap();

    for id in &ids {
        ctx.store.set(*id, SignalValue::Int(9)).unwrap();
    }
    let report = scheduler.flush(Phase::Propose, &mut ctx).unwrap();
    assert_eq!(report.executed, vec![effect]);
    assert_eq!(scheduler.run_count(effect), Some(2));
}

proptest! {
    #[test]
    fn prop_dirty_effects_fire_in_registration_order(
        deps in proptest::collection::vec(proptest::collection::vec(0usize..4, 0..3), 1..8),
        changed in 0usize..4,
    ) {
        let (mut ctx, ids) = build(4);
        let mut scheduler = EffectScheduler::new(4);
        for (tag, dep_idx) in deps.iter().enumerate() {
            let dep_ids = dep_idx.iter().map(|i| ids[*i]).collect();
            scheduler.register(format!("e{tag}"), Phase::Observe, recorder(tag, dep_ids)).unwrap();
        }
        scheduler.flush(Phase::Observe, &mut ctx).unwrap();
        ctx.order.lock().unwrap().clear();

        ctx.store.set(ids[changed], SignalValue::Int(1)).unwrap();
        scheduler.flush(Phase::Observe, &mut ctx).unwrap();

        let order = ctx.order.lock().unwrap().clone();
        let expected: Vec<usize> = deps
            .iter()
            .enumerate()
            .filter(|(_, d)| d.contains(&changed))
            .map(|(tag, _)| tag)
            .collect();
        prop_assert_eq!(order, expected);
    }
}
