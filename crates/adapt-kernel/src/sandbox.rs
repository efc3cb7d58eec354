//! Sandbox Manager
//!
//! Owns validated extensions, hands out script instances per request and
//! takes them back for reuse. Every invocation runs behind a [`SandboxHost`]
//! which:
//! - charges each step and host call against a fresh [`Meter`]
//! - refuses host functions missing from the instance's namespace
//! - checks the action against the current phase
//! - checks signal reads against the declared read domains
//!
//! Failures are converted into [`SandboxError`]s, all of which are contained
//! to the offending extension except cancellation.

use crate::budget::{ExecutionBudget, Meter};
use crate::error::{EngineError, ManifestError, PhaseViolation, SandboxError};
use crate::manifest::{CapabilityManifest, ExtensionKind, ExtensionManifest};
use crate::phase::Action;
use crate::script::{Entry, Host, HostCallError, HostFn, Script, ScriptError, ScriptFactory, ScriptValue};
use adapt_signal::SignalKey;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use semver::Version;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Validated extension and its script factory
pub struct LoadedExtension {
    manifest: CapabilityManifest,
    order: usize,
    factory: Arc<dyn ScriptFactory>,
}

impl fmt::Debug for LoadedExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedExtension")
            .field("id", &self.manifest.id)
            .field("kind", &self.manifest.kind)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl LoadedExtension {
    /// Checked manifest
    #[must_use]
    pub fn manifest(&self) -> &CapabilityManifest {
        &self.manifest
    }

    /// Registration order
    #[must_use]
    pub fn order(&self) -> usize {
        self.order
    }
}

/// A script instance activated for one request
pub struct ExtensionInstance {
    extension: Arc<LoadedExtension>,
    script: Box<dyn Script>,
    invocations: u64,
    reused: bool,
}

impl fmt::Debug for ExtensionInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionInstance")
            .field("id", &self.extension.manifest.id)
            .field("invocations", &self.invocations)
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}

impl ExtensionInstance {
    /// Extension id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.extension.manifest.id
    }

    /// Plugin or Theme
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ExtensionKind {
        self.extension.manifest.kind
    }

    /// Checked manifest
    #[inline]
    #[must_use]
    pub fn manifest(&self) -> &CapabilityManifest {
        &self.extension.manifest
    }

    /// Registration order
    #[inline]
    #[must_use]
    pub fn order(&self) -> usize {
        self.extension.order
    }

    /// Invocations during this activation
    #[must_use]
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Whether this instance came from the idle pool
    #[must_use]
    pub fn was_reused(&self) -> bool {
        self.reused
    }
}

/// Engine side of host calls
///
/// Implemented by the request scope. Gating has already happened by the time
/// `dispatch` runs.
pub trait HostBridge {
    /// Check an action against the current phase
    fn check_phase(&self, action: Action, kind: ExtensionKind) -> Result<(), PhaseViolation>;

    /// Whether the request has been cancelled
    fn cancelled(&self) -> bool;

    /// Execute a permitted host function
    fn dispatch(
        &mut self,
        caller: &CapabilityManifest,
        function: HostFn,
        args: &[ScriptValue],
        meter: &mut Meter,
    ) -> Result<ScriptValue, HostCallError>;

    /// A call was refused by a gate
    fn denied(&mut self, caller: &CapabilityManifest, error: &HostCallError);
}

/// Signal named by the first argument of a signal-reading host function
pub(crate) fn signal_arg(function: HostFn, args: &[ScriptValue]) -> Result<SignalKey, HostCallError> {
    match args.first() {
        Some(ScriptValue::Str(name)) => SignalKey::parse(name),
        Some(ScriptValue::Signal(key)) => Some(key.clone()),
        _ => None,
    }
    .ok_or_else(|| HostCallError::BadArguments {
        function,
        reason: "first argument must be a qualified signal name".into(),
    })
}

/// Metered, gated [`Host`] handed to scripts
pub struct SandboxHost<'a> {
    manifest: &'a CapabilityManifest,
    bridge: &'a mut dyn HostBridge,
    meter: Meter,
}

impl fmt::Debug for SandboxHost<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHost")
            .field("extension", &self.manifest.id)
            .field("meter", &self.meter)
            .finish_non_exhaustive()
    }
}

impl SandboxHost<'_> {
    fn live(&self) -> Result<(), HostCallError> {
        if self.bridge.cancelled() {
            Err(HostCallError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Phase rules are checked before registration, so an action that is
    /// never legal for this extension kind reports the phase it broke.
    fn gate(&mut self, function: HostFn, args: &[ScriptValue]) -> Result<(), HostCallError> {
        let domain = match function {
            HostFn::SignalGet | HostFn::SignalHas | HostFn::Transform => Some(signal_arg(function, args)?.domain),
            _ => None,
        };
        self.bridge.check_phase(Action::of(function, domain), self.manifest.kind)?;
        if !self.manifest.registers(function) {
            return Err(HostCallError::Unregistered(function));
        }
        if let Some(domain) = domain {
            if !self.manifest.capabilities.reads(domain) {
                return Err(HostCallError::CapabilityDenied(format!(
                    "{} of {domain} signals without read:{domain}",
                    function.as_str()
                )));
            }
        }
        Ok(())
    }
}

impl Host for SandboxHost<'_> {
    fn extension_id(&self) -> &str {
        &self.manifest.id
    }

    fn config(&self) -> &serde_json::Value {
        &self.manifest.config
    }

    fn budget(&self) -> ExecutionBudget {
        self.meter.budget()
    }

    fn step(&mut self, ops: u64) -> Result<(), HostCallError> {
        self.live()?;
        Ok(self.meter.charge(ops)?)
    }

    fn enter(&mut self) -> Result<(), HostCallError> {
        self.live()?;
        Ok(self.meter.enter()?)
    }

    fn leave(&mut self) {
        self.meter.leave();
    }

    fn hold(&mut self, value: &ScriptValue) -> Result<(), HostCallError> {
        Ok(self.meter.check_value(value)?)
    }

    fn call(&mut self, function: HostFn, args: &[ScriptValue]) -> Result<ScriptValue, HostCallError> {
        self.live()?;
        self.meter.charge(1)?;
        for arg in args {
            self.meter.check_value(arg)?;
        }
        if let Err(refused) = self.gate(function, args) {
            if matches!(
                refused,
                HostCallError::Unregistered(_) | HostCallError::CapabilityDenied(_) | HostCallError::Phase(_)
            ) {
                self.bridge.denied(self.manifest, &refused);
            }
            return Err(refused);
        }
        let result = self.bridge.dispatch(self.manifest, function, args, &mut self.meter)?;
        self.meter.check_value(&result)?;
        Ok(result)
    }
}

/// Pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Fresh instances created
    pub instantiated: usize,
    /// Activations served from the idle pool
    pub reused: usize,
    /// Instances returned
    pub released: usize,
    /// Instances currently checked out
    pub active: usize,
}

/// Loads, pools and runs extensions
pub struct SandboxManager {
    budget: ExecutionBudget,
    engine_version: Version,
    idle_per_extension: usize,
    registry: IndexMap<String, Arc<LoadedExtension>>,
    idle: DashMap<String, Vec<Box<dyn Script>>>,
    stats: Mutex<PoolStats>,
    admission: Arc<Semaphore>,
}

impl fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxManager")
            .field("budget", &self.budget)
            .field("engine_version", &self.engine_version)
            .field("extensions", &self.registry.keys().collect::<Vec<_>>())
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl SandboxManager {
    /// Manager with a uniform budget
    #[must_use]
    pub fn new(budget: ExecutionBudget, engine_version: Version, idle_per_extension: usize, max_concurrent: usize) -> Self {
        Self {
            budget,
            engine_version,
            idle_per_extension,
            registry: IndexMap::new(),
            idle: DashMap::new(),
            stats: Mutex::new(PoolStats::default()),
            admission: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Validate a manifest against this engine without loading it
    pub fn check(&self, manifest: &ExtensionManifest) -> Result<CapabilityManifest, ManifestError> {
        manifest.validate(&self.engine_version)
    }

    /// Validate and register an extension; returns its registration order
    pub fn load(&mut self, manifest: &ExtensionManifest, factory: Arc<dyn ScriptFactory>) -> Result<usize, ManifestError> {
        let checked = self.check(manifest).map_err(|e| {
            tracing::warn!(extension = %manifest.id, error = %e, "extension rejected");
            e
        })?;
        if self.registry.contains_key(&checked.id) {
            return Err(ManifestError::Duplicate(checked.id));
        }
        let order = self.registry.len();
        tracing::info!(extension = %checked.id, kind = %checked.kind, order, "extension loaded");
        self.registry.insert(
            checked.id.clone(),
            Arc::new(LoadedExtension {
                manifest: checked,
                order,
                factory,
            }),
        );
        Ok(order)
    }

    /// Loaded extensions in registration order
    pub fn extensions(&self) -> impl Iterator<Item = &Arc<LoadedExtension>> {
        self.registry.values()
    }

    /// Loaded extension by id
    #[must_use]
    pub fn extension(&self, id: &str) -> Option<&Arc<LoadedExtension>> {
        self.registry.get(id)
    }

    /// The uniform budget
    #[must_use]
    pub fn budget(&self) -> ExecutionBudget {
        self.budget
    }

    /// Running engine version
    #[must_use]
    pub fn engine_version(&self) -> &Version {
        &self.engine_version
    }

    /// Wait for a request slot
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit, EngineError> {
        Arc::clone(&self.admission)
            .acquire_owned()
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))
    }

    /// Take an instance for a request, reusing an idle one when possible
    pub fn activate(&self, id: &str) -> Result<ExtensionInstance, SandboxError> {
        let extension = self
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::UnknownExtension(id.to_string()))?;
        let pooled = self.idle.get_mut(id).and_then(|mut idle| idle.pop());
        let mut stats = self.stats.lock();
        stats.active += 1;
        let (script, reused) = match pooled {
            Some(script) => {
                stats.reused += 1;
                (script, true)
            }
            None => {
                stats.instantiated += 1;
                (extension.factory.instantiate(), false)
            }
        };
        tracing::debug!(extension = %id, reused, "instance activated");
        Ok(ExtensionInstance {
            extension,
            script,
            invocations: 0,
            reused,
        })
    }

    /// Return an instance; its script globals are reset before pooling
    pub fn release(&self, instance: ExtensionInstance) {
        let ExtensionInstance {
            extension, mut script, ..
        } = instance;
        script.reset();
        {
            let mut stats = self.stats.lock();
            stats.active = stats.active.saturating_sub(1);
            stats.released += 1;
        }
        let mut idle = self.idle.entry(extension.manifest.id.clone()).or_default();
        if idle.len() < self.idle_per_extension {
            idle.push(script);
        }
    }

    /// Run one entry point of an instance
    ///
    /// A breached budget or a cancelled request takes precedence over
    /// whatever the script itself returned.
    #[tracing::instrument(level = "debug", skip_all, fields(extension = %instance.id(), %entry))]
    pub fn invoke(
        &self,
        instance: &mut ExtensionInstance,
        entry: Entry,
        bridge: &mut dyn HostBridge,
        deadline: Option<Instant>,
    ) -> Result<ScriptValue, SandboxError> {
        instance.invocations += 1;
        let manifest = &instance.extension.manifest;
        let extension = manifest.id.clone();
        let mut host = SandboxHost {
            manifest,
            bridge,
            meter: Meter::new(self.budget, deadline),
        };
        let result = instance.script.invoke(entry, &mut host);
        let tripped = host.meter.tripped();
        let cancelled = host.bridge.cancelled();

        if cancelled {
            return Err(SandboxError::Cancelled { extension });
        }
        if let Some(exceeded) = tripped {
            return Err(SandboxError::BudgetExceeded { extension, exceeded });
        }
        result.map_err(|error| match error {
            ScriptError::Host(HostCallError::Unregistered(function)) => SandboxError::CapabilityViolation {
                extension,
                detail: format!("host function `{function}` is not registered"),
            },
            ScriptError::Host(HostCallError::CapabilityDenied(detail)) => {
                SandboxError::CapabilityViolation { extension, detail }
            }
            ScriptError::Host(HostCallError::Phase(violation)) => SandboxError::PhaseViolation { extension, violation },
            ScriptError::Host(HostCallError::Budget(exceeded)) => SandboxError::BudgetExceeded { extension, exceeded },
            ScriptError::Host(HostCallError::Cancelled) => SandboxError::Cancelled { extension },
            ScriptError::Host(other) => SandboxError::ScriptFault {
                extension,
                message: other.to_string(),
            },
            ScriptError::Thrown(message) => SandboxError::ScriptFault { extension, message },
        })
    }

    /// Pool counters
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats.lock().clone()
    }

    /// Idle instances held for an extension
    #[must_use]
    pub fn idle_count(&self, id: &str) -> usize {
        self.idle.get(id).map_or(0, |idle| idle.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetDimension;
    use crate::phase::PhaseController;
    use crate::script::{HostExt, ScriptBuilder};
    use adapt_signal::Phase;

    struct Bridge {
        phases: PhaseController,
        cancelled: bool,
        calls: Vec<HostFn>,
        denied: Vec<String>,
    }

    impl Bridge {
        fn new(phase: Phase) -> Self {
            let mut phases = PhaseController::new();
            while phases.current() != phase {
                let next = phases.current().next().unwrap();
                phases.advance(next).unwrap();
            }
            Self {
                phases,
                cancelled: false,
                calls: Vec::new(),
                denied: Vec::new(),
            }
        }
    }

    impl HostBridge for Bridge {
        fn check_phase(&self, action: Action, kind: ExtensionKind) -> Result<(), PhaseViolation> {
            self.phases.check(action, kind)
        }

        fn cancelled(&self) -> bool {
            self.cancelled
        }

        fn dispatch(
            &mut self,
            _caller: &CapabilityManifest,
            function: HostFn,
            _args: &[ScriptValue],
            _meter: &mut Meter,
        ) -> Result<ScriptValue, HostCallError> {
            self.calls.push(function);
            Ok(ScriptValue::Str("ok".into()))
        }

        fn denied(&mut self, caller: &CapabilityManifest, error: &HostCallError) {
            self.denied.push(format!("{}: {error}", caller.id));
        }
    }

    fn manifest(id: &str, caps: &[&str], functions: &[&str]) -> ExtensionManifest {
        ExtensionManifest {
            id: id.into(),
            kind: ExtensionKind::Plugin,
            version: "1.0.0".into(),
            engine: "*".into(),
            priority: 0,
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            host_functions: functions.iter().map(|s| s.to_string()).collect(),
            config: serde_json::Value::Null,
        }
    }

    fn manager(max_operations: u64) -> SandboxManager {
        let budget = ExecutionBudget {
            max_operations,
            ..ExecutionBudget::default()
        };
        SandboxManager::new(budget, Version::new(0, 1, 0), 2, 4)
    }

    #[test]
    fn duplicate_load_is_rejected() {
        let mut sandbox = manager(100);
        let m = manifest("p", &[], &[]);
        assert_eq!(sandbox.load(&m, Arc::new(ScriptBuilder::new())).unwrap(), 0);
        assert!(matches!(
            sandbox.load(&m, Arc::new(ScriptBuilder::new())),
            Err(ManifestError::Duplicate(_))
        ));
    }

    #[test]
    fn unregistered_functions_are_violations() {
        let mut sandbox = manager(100);
        let script = ScriptBuilder::new().on(Entry::Observe, |_, host| Ok(host.log("hi")?));
        sandbox.load(&manifest("p", &[], &[]), Arc::new(script)).unwrap();
        let mut instance = sandbox.activate("p").unwrap();
        let mut bridge = Bridge::new(Phase::Observe);
        let err = sandbox.invoke(&mut instance, Entry::Observe, &mut bridge, None).unwrap_err();
        assert!(matches!(err, SandboxError::CapabilityViolation { .. }));
        assert!(bridge.calls.is_empty());
        assert_eq!(bridge.denied.len(), 1);
    }

    #[test]
    fn read_domains_are_enforced() {
        let mut sandbox = manager(100);
        let script = ScriptBuilder::new().on(Entry::Observe, |_, host| Ok(host.get("content.body")?));
        sandbox
            .load(&manifest("p", &["read:request"], &["signal.get"]), Arc::new(script))
            .unwrap();
        let mut instance = sandbox.activate("p").unwrap();
        let err = sandbox
            .invoke(&mut instance, Entry::Observe, &mut Bridge::new(Phase::Observe), None)
            .unwrap_err();
        assert!(err.to_string().contains("read:content"));
    }

    #[test]
    fn phase_violation_can_be_caught_by_script() {
        let mut sandbox = manager(100);
        let script = ScriptBuilder::new().on(Entry::Observe, |_, host| {
            let refused = host.propose_status(200);
            assert!(matches!(refused, Err(HostCallError::Phase(_))));
            Ok(ScriptValue::Bool(true))
        });
        sandbox
            .load(&manifest("p", &["propose:status"], &["propose.status"]), Arc::new(script))
            .unwrap();
        let mut instance = sandbox.activate("p").unwrap();
        let mut bridge = Bridge::new(Phase::Observe);
        assert_eq!(
            sandbox.invoke(&mut instance, Entry::Observe, &mut bridge, None).unwrap(),
            ScriptValue::Bool(true)
        );
        assert!(bridge.calls.is_empty());
        assert_eq!(bridge.denied.len(), 1);
    }

    #[test]
    fn themes_proposing_in_apply_break_the_phase() {
        let mut sandbox = manager(100);
        let mut theme = manifest("t", &["write:status"], &["response.status"]);
        theme.kind = ExtensionKind::Theme;
        let script = ScriptBuilder::new().on(Entry::Apply, |_, host| Ok(host.propose_status(500)?));
        sandbox.load(&theme, Arc::new(script)).unwrap();
        let mut instance = sandbox.activate("t").unwrap();
        let mut bridge = Bridge::new(Phase::Apply);
        match sandbox.invoke(&mut instance, Entry::Apply, &mut bridge, None) {
            Err(SandboxError::PhaseViolation { extension, violation }) => {
                assert_eq!(extension, "t");
                assert_eq!(violation.phase, Phase::Apply);
                assert_eq!(violation.kind, ExtensionKind::Theme);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(bridge.calls.is_empty());
        assert_eq!(bridge.denied.len(), 1);
    }

    #[test]
    fn budget_breach_wins_even_if_swallowed() {
        let mut sandbox = manager(10);
        let script = ScriptBuilder::new().on(Entry::Propose, |_, host| {
            for _ in 0..100 {
                if host.step(1).is_err() {
                    break;
                }
            }
            Ok(ScriptValue::Null)
        });
        sandbox.load(&manifest("p", &[], &[]), Arc::new(script)).unwrap();
        let mut instance = sandbox.activate("p").unwrap();
        match sandbox.invoke(&mut instance, Entry::Propose, &mut Bridge::new(Phase::Propose), None) {
            Err(SandboxError::BudgetExceeded { extension, exceeded }) => {
                assert_eq!(extension, "p");
                assert_eq!(exceeded.dimension, BudgetDimension::Operations);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cancellation_is_not_contained() {
        let mut sandbox = manager(100);
        let script = ScriptBuilder::new().on(Entry::Observe, |_, host| {
            host.step(1)?;
            Ok(ScriptValue::Null)
        });
        sandbox.load(&manifest("p", &[], &[]), Arc::new(script)).unwrap();
        let mut instance = sandbox.activate("p").unwrap();
        let mut bridge = Bridge::new(Phase::Observe);
        bridge.cancelled = true;
        let err = sandbox.invoke(&mut instance, Entry::Observe, &mut bridge, None).unwrap_err();
        assert!(!err.is_contained());
    }

    #[test]
    fn released_instances_are_reset_and_reused() {
        let mut sandbox = manager(100);
        let script = ScriptBuilder::new().on(Entry::Observe, |globals, _| {
            let previous = globals.insert("secret".into(), ScriptValue::from("request-1"));
            Ok(previous.unwrap_or(ScriptValue::Null))
        });
        sandbox.load(&manifest("p", &[], &[]), Arc::new(script)).unwrap();

        let mut first = sandbox.activate("p").unwrap();
        let mut bridge = Bridge::new(Phase::Observe);
        sandbox.invoke(&mut first, Entry::Observe, &mut bridge, None).unwrap();
        sandbox.release(first);
        assert_eq!(sandbox.idle_count("p"), 1);

        let mut second = sandbox.activate("p").unwrap();
        assert!(second.was_reused());
        let leaked = sandbox.invoke(&mut second, Entry::Observe, &mut bridge, None).unwrap();
        assert_eq!(leaked, ScriptValue::Null);
        sandbox.release(second);

        let stats = sandbox.stats();
        assert_eq!(stats.instantiated, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn unknown_extension_cannot_activate() {
        let sandbox = manager(100);
        assert!(matches!(sandbox.activate("nope"), Err(SandboxError::UnknownExtension(_))));
    }
}
