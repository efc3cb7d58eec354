//! Effect Scheduler
//!
//! Maintains the dependency graph between effects and the signals they last
//! read, and re-runs stale effects deterministically.
//!
//! # Invariants
//!
//! - Dirty effects run in registration order, never by priority.
//! - An effect only ever runs in the phase it was registered in.
//! - Changes made while an effect runs never re-dirty that same effect.
//! - Re-runs are batched per round; a flush gives up after `max_rounds`.

use crate::error::SchedulerError;
use crate::phase::Phase;
use crate::store::{SignalId, SignalStore};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Closure run by an effect
pub type EffectFn<C> = Box<dyn FnMut(&mut C) -> Result<(), EffectFault> + Send>;

/// Access to the store backing an effect context
pub trait EffectHost {
    /// Shared access, used for dependency tracking
    fn signals(&self) -> &SignalStore;

    /// Exclusive access, used to drain changes between runs
    fn signals_mut(&mut self) -> &mut SignalStore;
}

/// Identity of a registered effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EffectId(pub u32);

/// Contained failure of one effect run
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct EffectFault(pub String);

struct Effect<C> {
    id: EffectId,
    name: String,
    phase: Phase,
    deps: BTreeSet<SignalId>,
    dirty: bool,
    runs: u32,
    run: EffectFn<C>,
}

impl<C> fmt::Debug for Effect<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("deps", &self.deps)
            .field("dirty", &self.dirty)
            .field("runs", &self.runs)
            .finish_non_exhaustive()
    }
}

/// Outcome of one flush
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Effects executed, in execution order
    pub executed: Vec<EffectId>,
    /// Effects that returned a fault
    pub faults: Vec<(EffectId, EffectFault)>,
    /// Rounds needed to settle
    pub rounds: usize,
    /// Dependents of changed signals that belong to another phase and were not queued
    pub cross_phase: Vec<EffectId>,
}

/// Dependency-tracked re-execution engine for one request scope
pub struct EffectScheduler<C> {
    effects: Vec<Effect<C>>,
    max_rounds: usize,
    disposed: bool,
}

impl<C> fmt::Debug for EffectScheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectScheduler")
            .field("effects", &self.effects)
            .field("max_rounds", &self.max_rounds)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl<C: EffectHost> EffectScheduler<C> {
    /// Create a scheduler that settles within `max_rounds`
    #[must_use]
    pub fn new(max_rounds: usize) -> Self {
        Self {
            effects: Vec::new(),
            max_rounds: max_rounds.max(1),
            disposed: false,
        }
    }

    /// Register an effect bound to `phase`; it starts dirty
    pub fn register(
        &mut self,
        name: impl Into<String>,
        phase: Phase,
        run: EffectFn<C>,
    ) -> Result<EffectId, SchedulerError> {
        if self.disposed {
            return Err(SchedulerError::Disposed);
        }
        let id = EffectId(u32::try_from(self.effects.len()).map_err(|_| SchedulerError::Disposed)?);
        let name = name.into();
        tracing::trace!(effect = %name, %phase, "effect registered");
        self.effects.push(Effect {
            id,
            name,
            phase,
            deps: BTreeSet::new(),
            dirty: true,
            runs: 0,
            run,
        });
        Ok(id)
    }

    /// Queue an effect for the given phase
    ///
    /// # Errors
    /// `PhaseViolation` when `phase` is not the effect's registration phase.
    pub fn schedule(&mut self, id: EffectId, phase: Phase) -> Result<(), SchedulerError> {
        if self.disposed {
            return Err(SchedulerError::Disposed);
        }
        let effect = self
            .effects
            .get_mut(id.0 as usize)
            .ok_or(SchedulerError::UnknownEffect(id.0))?;
        if effect.phase != phase {
            return Err(SchedulerError::PhaseViolation {
                effect: effect.name.clone(),
                registered: effect.phase,
                requested: phase,
            });
        }
        effect.dirty = true;
        Ok(())
    }

    /// Mark dependents of `changed` dirty
    ///
    /// Dependents registered in another phase are reported, not queued.
    pub fn notify(&mut self, changed: &[SignalId], phase: Phase) -> Vec<EffectId> {
        let mut report = FlushReport::default();
        self.mark(changed, phase, None, &mut report);
        report.cross_phase
    }

    fn mark(&mut self, changed: &[SignalId], phase: Phase, running: Option<usize>, report: &mut FlushReport) {
        if changed.is_empty() {
            return;
        }
        for (idx, effect) in self.effects.iter_mut().enumerate() {
            if Some(idx) == running || !changed.iter().any(|s| effect.deps.contains(s)) {
                continue;
            }
            if effect.phase == phase {
                effect.dirty = true;
            } else if !report.cross_phase.contains(&effect.id) {
                tracing::debug!(effect = %effect.name, registered = %effect.phase, %phase, "cross-phase dependent not queued");
                report.cross_phase.push(effect.id);
            }
        }
    }

    /// Run dirty effects of `phase` until settled
    pub fn flush(&mut self, phase: Phase, ctx: &mut C) -> Result<FlushReport, SchedulerError> {
        if self.disposed {
            return Err(SchedulerError::Disposed);
        }
        let mut report = FlushReport::default();

        let outside = ctx.signals_mut().drain_changes();
        self.mark(&outside, phase, None, &mut report);

        loop {
            let batch: Vec<usize> = self
                .effects
                .iter()
                .enumerate()
                .filter(|(_, e)| e.phase == phase && e.dirty)
                .map(|(i, _)| i)
                .collect();
            if batch.is_empty() {
                return Ok(report);
            }
            if report.rounds >= self.max_rounds {
                return Err(SchedulerError::Unsettled {
                    phase,
                    rounds: report.rounds,
                });
            }
            report.rounds += 1;

            for idx in batch {
                let effect = &mut self.effects[idx];
                if !effect.dirty {
                    continue;
                }
                effect.dirty = false;

                ctx.signals().begin_tracking();
                let result = (effect.run)(ctx);
                effect.deps = ctx.signals().end_tracking();
                effect.runs += 1;
                report.executed.push(effect.id);

                if let Err(fault) = result {
                    tracing::warn!(effect = %effect.name, %fault, "effect fault contained");
                    report.faults.push((effect.id, fault));
                }

                let changed = ctx.signals_mut().drain_changes();
                self.mark(&changed, phase, Some(idx), &mut report);
            }
        }
    }

    /// Signals an effect read during its last run
    #[must_use]
    pub fn dependencies(&self, id: EffectId) -> Option<&BTreeSet<SignalId>> {
        self.effects.get(id.0 as usize).map(|e| &e.deps)
    }

    /// How many times an effect has run
    #[must_use]
    pub fn run_count(&self, id: EffectId) -> Option<u32> {
        self.effects.get(id.0 as usize).map(|e| e.runs)
    }

    /// Number of registered effects
    #[must_use]
    pub fn len(&self) -> usize {
        self.effects.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Drop every effect; later flushes fail with [`SchedulerError::Disposed`]
    pub fn dispose(&mut self) {
        self.effects.clear();
        self.disposed = true;
    }

    /// Whether the scheduler has been disposed
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SignalDomain, SignalKey};
    use crate::value::SignalValue;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Ctx {
        store: SignalStore,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl EffectHost for Ctx {
        fn signals(&self) -> &SignalStore {
            &self.store
        }

        fn signals_mut(&mut self) -> &mut SignalStore {
            &mut self.store
        }
    }

    fn define(ctx: &mut Ctx, name: &str, v: i64) -> SignalId {
        ctx.store
            .define(SignalKey::new(SignalDomain::Request, name), SignalValue::Int(v))
            .unwrap()
    }

    fn logger(name: &'static str, dep: SignalId) -> EffectFn<Ctx> {
        Box::new(move |ctx: &mut Ctx| {
            ctx.store.get(dep).map_err(|e| EffectFault(e.to_string()))?;
            ctx.log.lock().unwrap().push(name.to_string());
            Ok(())
        })
    }

    #[test]
    fn effects_run_in_registration_order() {
        let mut ctx = Ctx::default();
        let a = define(&mut ctx, "a", 1);
        let mut scheduler = EffectScheduler::new(4);
        scheduler.register("second", Phase::Observe, logger("second", a)).unwrap();
        scheduler.register("first", Phase::Observe, logger("first", a)).unwrap();

        let report = scheduler.flush(Phase::Observe, &mut ctx).unwrap();
        assert_eq!(report.executed, vec![EffectId(0), EffectId(1)]);
        assert_eq!(*ctx.log.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn only_dependents_rerun_after_change() {
        let mut ctx = Ctx::default();
        let a = define(&mut ctx, "a", 1);
        let b = define(&mut ctx, "b", 1);
        let mut scheduler = EffectScheduler::new(4);
        let ea = scheduler.register("on-a", Phase::Observe, logger("on-a", a)).unwrap();
        let eb = scheduler.register("on-b", Phase::Observe, logger("on-b", b)).unwrap();
        scheduler.flush(Phase::Observe, &mut ctx).unwrap();

        ctx.store.set(b, SignalValue::Int(2)).unwrap();
        let report = scheduler.flush(Phase::Observe, &mut ctx).unwrap();
        assert_eq!(report.executed, vec![eb]);
        assert_eq!(scheduler.run_count(ea), Some(1));
        assert_eq!(scheduler.run_count(eb), Some(2));
    }

    #[test]
    fn effect_does_not_wake_itself() {
        let mut ctx = Ctx::default();
        let a = define(&mut ctx, "a", 0);
        let mut scheduler = EffectScheduler::new(2);
        let id = scheduler
            .register(
                "incr",
                Phase::Apply,
                Box::new(move |ctx: &mut Ctx| {
                    let v = ctx.store.get(a).map_err(|e| EffectFault(e.to_string()))?;
                    if let SignalValue::Int(n) = v {
                        ctx.store.set(a, SignalValue::Int(n + 1)).map_err(|e| EffectFault(e.to_string()))?;
                    }
                    Ok(())
                }),
            )
            .unwrap();
        let report = scheduler.flush(Phase::Apply, &mut ctx).unwrap();
        assert_eq!(report.rounds, 1);
        assert_eq!(scheduler.run_count(id), Some(1));
    }

    #[test]
    fn writer_wakes_later_reader_in_same_round() {
        let mut ctx = Ctx::default();
        let a = define(&mut ctx, "a", 0);
        let mut scheduler = EffectScheduler::new(4);
        scheduler
            .register(
                "writer",
                Phase::Apply,
                Box::new(move |ctx: &mut Ctx| {
                    ctx.store.set(a, SignalValue::Int(7)).map_err(|e| EffectFault(e.to_string()))?;
                    Ok(())
                }),
            )
            .unwrap();
        let reader = scheduler.register("reader", Phase::Apply, logger("reader", a)).unwrap();
        let report = scheduler.flush(Phase::Apply, &mut ctx).unwrap();
        assert_eq!(report.rounds, 1);
        assert_eq!(scheduler.run_count(reader), Some(1));
    }

    #[test]
    fn cross_phase_dependents_are_not_queued() {
        let mut ctx = Ctx::default();
        let a = define(&mut ctx, "a", 0);
        let mut scheduler = EffectScheduler::new(4);
        let observer = scheduler.register("observer", Phase::Observe, logger("observer", a)).unwrap();
        scheduler.flush(Phase::Observe, &mut ctx).unwrap();

        ctx.store.set(a, SignalValue::Int(1)).unwrap();
        let report = scheduler.flush(Phase::Propose, &mut ctx).unwrap();
        assert!(report.executed.is_empty());
        assert_eq!(report.cross_phase, vec![observer]);
        assert_eq!(scheduler.run_count(observer), Some(1));
    }

    #[test]
    fn scheduling_into_other_phase_is_a_violation() {
        let mut ctx = Ctx::default();
        let a = define(&mut ctx, "a", 0);
        let mut scheduler = EffectScheduler::new(4);
        let id = scheduler.register("observer", Phase::Observe, logger("observer", a)).unwrap();
        assert!(matches!(
            scheduler.schedule(id, Phase::Propose),
            Err(SchedulerError::PhaseViolation { registered: Phase::Observe, requested: Phase::Propose, .. })
        ));
        assert!(scheduler.schedule(id, Phase::Observe).is_ok());
    }

    #[test]
    fn faults_are_contained() {
        let mut ctx = Ctx::default();
        let a = define(&mut ctx, "a", 0);
        let mut scheduler = EffectScheduler::new(4);
        scheduler
            .register("broken", Phase::Observe, Box::new(|_: &mut Ctx| Err(EffectFault("boom".into()))))
            .unwrap();
        scheduler.register("fine", Phase::Observe, logger("fine", a)).unwrap();
        let report = scheduler.flush(Phase::Observe, &mut ctx).unwrap();
        assert_eq!(report.faults.len(), 1);
        assert_eq!(*ctx.log.lock().unwrap(), vec!["fine"]);
    }

    #[test]
    fn ping_pong_is_bounded() {
        let mut ctx = Ctx::default();
        let a = define(&mut ctx, "a", 0);
        let b = define(&mut ctx, "b", 0);
        let mut scheduler = EffectScheduler::new(3);
        let bump = |from: SignalId, to: SignalId| -> EffectFn<Ctx> {
            Box::new(move |ctx: &mut Ctx| {
                if let Ok(SignalValue::Int(n)) = ctx.store.get(from) {
                    let _ = ctx.store.set(to, SignalValue::Int(n + 1));
                }
                Ok(())
            })
        };
        scheduler.register("a->b", Phase::Observe, bump(a, b)).unwrap();
        scheduler.register("b->a", Phase::Observe, bump(b, a)).unwrap();
        assert!(matches!(
            scheduler.flush(Phase::Observe, &mut ctx),
            Err(SchedulerError::Unsettled { rounds: 3, .. })
        ));
    }

    #[test]
    fn disposed_scheduler_refuses_work() {
        let mut ctx = Ctx::default();
        let mut scheduler: EffectScheduler<Ctx> = EffectScheduler::new(4);
        scheduler.dispose();
        assert_eq!(scheduler.flush(Phase::Observe, &mut ctx), Err(SchedulerError::Disposed));
        assert!(scheduler
            .register("late", Phase::Observe, Box::new(|_: &mut Ctx| Ok(())))
            .is_err());
    }
}
