//! Scope lifecycle, isolation and cancellation

use adapt_kernel::budget::{BudgetDimension, ExecutionBudget};
use adapt_kernel::config::{EngineConfig, TraceConfig};
use adapt_kernel::manifest::ExtensionKind;
use adapt_kernel::script::{Entry, HostExt, HostFn, ScriptBuilder, ScriptValue};
use adapt_kernel::trace::TraceKind;
use adapt_kernel::{ContentDescriptor, EngineError, RequestDescriptor};
use adapt_signal::{Phase, SignalDomain, SignalKey, SignalValue};
use adapt_test_utils::{
    applying_theme, engine, engine_with, failing_theme, header_plugin, manifest, plugin_manifest, proposing_plugin,
    status_plugin,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn path_watcher(runs: Arc<AtomicUsize>) -> adapt_test_utils::Extension {
    proposing_plugin(
        "watcher",
        ScriptBuilder::new().on(Entry::Observe, move |_, host| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(host.get("request.path")?)
        }),
    )
}

#[test]
fn observe_effects_rerun_only_on_relevant_changes() {
    let runs = Arc::new(AtomicUsize::new(0));
    let engine = engine(vec![path_watcher(Arc::clone(&runs)), applying_theme("theme")]);
    let mut scope = engine
        .open_scope(RequestDescriptor::get("/a"), ContentDescriptor::new())
        .unwrap();
    scope.run_observe().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let path = SignalKey::new(SignalDomain::Request, "path");
    scope.set_signal(&path, "/b".into()).unwrap();
    scope.run_observe().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    scope.set_signal(&path, "/b".into()).unwrap();
    scope
        .set_signal(&SignalKey::new(SignalDomain::Request, "method"), "POST".into())
        .unwrap();
    scope.run_observe().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn nothing_runs_once_finalize_begins() {
    let runs = Arc::new(AtomicUsize::new(0));
    let engine = engine(vec![path_watcher(Arc::clone(&runs)), applying_theme("theme")]);
    let mut scope = engine
        .open_scope(RequestDescriptor::get("/a"), ContentDescriptor::new())
        .unwrap();
    scope.run_observe().unwrap();
    scope.run_propose().unwrap();
    scope.run_apply().unwrap();
    let outcome = scope.finalize().unwrap();
    let after = runs.load(Ordering::SeqCst);

    assert!(scope.is_disposed());
    assert_eq!(scope.effect_count(), 0);
    assert!(matches!(scope.run_observe(), Err(EngineError::Disposed)));
    assert!(matches!(
        scope.set_signal(&SignalKey::new(SignalDomain::Request, "path"), "/z".into()),
        Err(EngineError::Disposed)
    ));
    assert_eq!(runs.load(Ordering::SeqCst), after);
    assert!(matches!(outcome.trace.events.last().map(|e| &e.kind), Some(TraceKind::Disposed)));
    assert!(outcome.trace.verify_integrity().is_ok());
}

#[test]
fn host_must_follow_phase_order() {
    let engine = engine(vec![applying_theme("theme")]);
    let mut scope = engine
        .open_scope(RequestDescriptor::get("/"), ContentDescriptor::new())
        .unwrap();
    assert!(matches!(scope.run_apply(), Err(EngineError::Protocol { .. })));
    assert!(matches!(scope.finalize(), Err(EngineError::Protocol { .. })));
    scope.run_observe().unwrap();
    scope.run_propose().unwrap();
    assert!(matches!(scope.run_observe(), Err(EngineError::Protocol { .. })));
    assert!(matches!(scope.run_propose(), Err(EngineError::Protocol { .. })));
}

#[test]
fn theme_writes_outside_apply_change_nothing() {
    let early = manifest("early", ExtensionKind::Theme, &["write:*"], &["response.status"]);
    let script = ScriptBuilder::new().on(Entry::Observe, |_, host| {
        let _ = host.set_status(418);
        Ok(ScriptValue::Null)
    });
    let engine = engine_with(EngineConfig::default(), vec![(early, Arc::new(script))]).unwrap();
    let mut scope = engine
        .open_scope(RequestDescriptor::get("/"), ContentDescriptor::new())
        .unwrap();
    scope.run_observe().unwrap();

    let status = scope.signal(&SignalKey::new(SignalDomain::Response, "status")).unwrap();
    assert_eq!(status, SignalValue::Int(200));
    let trace = scope.trace();
    let violation = trace
        .find(|k| matches!(k, TraceKind::PhaseViolation { .. }))
        .next()
        .unwrap();
    assert_eq!(violation.phase, Phase::Observe);
}

#[test]
fn themes_cannot_propose_during_apply() {
    let late = manifest("late", ExtensionKind::Theme, &["read:plugins", "write:*"], &["proposals.apply"]);
    let script = ScriptBuilder::new().on(Entry::Apply, |_, host| {
        let _ = host.propose_status(500);
        Ok(host.call(HostFn::ProposalsApply, &[])?)
    });
    let engine = engine_with(EngineConfig::default(), vec![status_plugin("ok", 200), (late, Arc::new(script))]).unwrap();
    let outcome = engine
        .handle_blocking(RequestDescriptor::get("/"), ContentDescriptor::new())
        .unwrap();

    assert_eq!(outcome.response.status, 200);
    let violation = outcome
        .trace
        .find(|k| matches!(k, TraceKind::PhaseViolation { extension, .. } if extension == "late"))
        .next()
        .unwrap();
    assert_eq!(violation.phase, Phase::Apply);
    assert!(outcome
        .trace
        .find(|k| matches!(k, TraceKind::CapabilityViolation { .. }))
        .next()
        .is_none());
}

#[test]
fn unregistered_host_functions_are_contained() {
    let (mut snoop, _) = status_plugin("snoop", 200);
    snoop.host_functions = vec!["propose.status".into()];
    let script = ScriptBuilder::new().on(Entry::Propose, |_, host| {
        host.call(HostFn::SecretGet, &["db-password".into()])?;
        Ok(host.propose_status(503)?)
    });
    let engine = engine(vec![
        (snoop, Arc::new(script)),
        header_plugin("foo", "X-Foo", "bar"),
        applying_theme("theme"),
    ]);
    let outcome = engine
        .handle_blocking(RequestDescriptor::get("/"), ContentDescriptor::new())
        .unwrap();
    assert_eq!(outcome.response.status, 200);
    assert_eq!(outcome.response.header("x-foo"), Some("bar"));
    assert!(outcome
        .trace
        .find(|k| matches!(k, TraceKind::CapabilityViolation { extension, .. } if extension == "snoop"))
        .next()
        .is_some());
}

#[test]
fn undeclared_capabilities_are_refused_at_load() {
    let greedy = plugin_manifest("greedy", &["write:body"], &["response.body"]);
    let engine = engine_with(
        EngineConfig::default(),
        vec![
            (greedy, Arc::new(ScriptBuilder::new())),
            applying_theme("theme"),
        ],
    )
    .unwrap();
    assert_eq!(engine.rejected().len(), 1);
    assert_eq!(engine.rejected()[0].id, "greedy");
    assert!(engine.sandbox().extension("greedy").is_none());
}

#[test]
fn failing_theme_yields_a_generic_error() {
    let engine = engine(vec![header_plugin("foo", "X-Foo", "bar"), failing_theme("broken")]);
    let outcome = engine
        .handle_blocking(RequestDescriptor::get("/"), ContentDescriptor::new())
        .unwrap();
    assert_eq!(outcome.response.status, 500);
    assert_eq!(outcome.response.body_string().unwrap(), "Internal Server Error");
    assert!(outcome.response.header("x-foo").is_none());
    let failure = outcome
        .trace
        .find(|k| matches!(k, TraceKind::ThemeFailed { .. }))
        .next()
        .unwrap();
    match &failure.kind {
        TraceKind::ThemeFailed { extension, error } => {
            assert_eq!(extension, "broken");
            assert!(error.contains("template exploded"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn pooled_instances_do_not_leak_state() {
    let counter = proposing_plugin(
        "counter",
        ScriptBuilder::new()
            .on(Entry::Observe, |globals, _| {
                let seen = globals.get("seen").and_then(ScriptValue::as_int).unwrap_or(0) + 1;
                globals.insert("seen".into(), ScriptValue::Int(seen));
                Ok(ScriptValue::Null)
            })
            .on(Entry::Propose, |globals, host| {
                let seen = globals.get("seen").and_then(ScriptValue::as_int).unwrap_or(0);
                Ok(host.propose_header("X-Seen", &seen.to_string())?)
            }),
    );
    let engine = engine(vec![counter, applying_theme("theme")]);

    let first = engine
        .handle_blocking(RequestDescriptor::get("/"), ContentDescriptor::new())
        .unwrap();
    let second = engine
        .handle_blocking(RequestDescriptor::get("/"), ContentDescriptor::new())
        .unwrap();

    assert_eq!(first.response.header("x-seen"), Some("1"));
    assert_eq!(second.response.header("x-seen"), Some("1"));
    assert!(second
        .trace
        .find(|k| matches!(k, TraceKind::ExtensionActivated { extension, reused: true } if extension == "counter"))
        .next()
        .is_some());
    let stats = engine.sandbox().stats();
    assert_eq!(stats.active, 0);
    assert!(stats.reused >= 2);
}

#[tokio::test]
async fn identical_inputs_give_identical_proposals() {
    let engine = engine(vec![
        status_plugin("a", 200),
        header_plugin("b", "X-B", "1"),
        status_plugin("c", 404),
        header_plugin("d", "X-D", "2"),
        applying_theme("theme"),
    ]);
    let first = engine
        .dry_run(RequestDescriptor::get("/same"), ContentDescriptor::new())
        .await
        .unwrap();
    let second = engine
        .dry_run(RequestDescriptor::get("/same"), ContentDescriptor::new())
        .await
        .unwrap();
    assert_eq!(first.proposals, second.proposals);
    assert_eq!(first.proposals.len(), 4);
    assert_ne!(first.request_id, second.request_id);
    assert!(first
        .trace
        .find(|k| matches!(k, TraceKind::PhaseEntered))
        .all(|e| e.phase != Phase::Apply));
}

#[test]
fn wall_clock_limit_aborts_slow_plugins() {
    let slow = proposing_plugin(
        "slow",
        ScriptBuilder::new().on(Entry::Propose, |_, host| loop {
            std::thread::sleep(Duration::from_millis(2));
            host.step(1)?;
        }),
    );
    let config = EngineConfig::default().with_phase_timeout(Duration::from_millis(20));
    let engine = engine_with(config, vec![slow, applying_theme("theme")]).unwrap();
    let outcome = engine
        .handle_blocking(RequestDescriptor::get("/"), ContentDescriptor::new())
        .unwrap();
    assert_eq!(outcome.response.status, 200);
    assert!(outcome
        .trace
        .find(|k| matches!(
            k,
            TraceKind::BudgetExceeded {
                dimension: BudgetDimension::WallClock,
                ..
            }
        ))
        .next()
        .is_some());
}

#[tokio::test]
async fn dropping_the_request_cancels_and_disposes() {
    let stalled = proposing_plugin(
        "stalled",
        ScriptBuilder::new().on(Entry::Observe, |_, host| loop {
            std::thread::sleep(Duration::from_millis(1));
            host.step(1)?;
        }),
    );
    let config = EngineConfig::default()
        .with_phase_timeout(Duration::from_secs(60))
        .with_budget(ExecutionBudget {
            max_operations: u64::MAX,
            ..ExecutionBudget::default()
        });
    let engine = engine_with(config, vec![stalled, applying_theme("theme")]).unwrap();

    let request = engine.handle(RequestDescriptor::get("/"), ContentDescriptor::new());
    assert!(tokio::time::timeout(Duration::from_millis(50), request).await.is_err());

    let mut waited = 0;
    while engine.sandbox().stats().active > 0 && waited < 200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert_eq!(engine.sandbox().stats().active, 0);
    assert_eq!(engine.sandbox().idle_count("stalled"), 1);
}

#[test]
fn trace_headers_are_attached_on_request() {
    let config = EngineConfig::default().with_trace(TraceConfig {
        expose_headers: true,
        ..TraceConfig::default()
    });
    let reader = proposing_plugin(
        "reader",
        ScriptBuilder::new().on(Entry::Propose, |_, host| {
            host.get("request.method")?;
            Ok(host.propose_header("X-Read", "yes")?)
        }),
    );
    let engine = engine_with(config, vec![reader, applying_theme("theme")]).unwrap();
    let outcome = engine
        .handle_blocking(RequestDescriptor::get("/"), ContentDescriptor::new())
        .unwrap();
    assert_eq!(
        outcome.response.header("x-adapt-trace-signals-read"),
        Some("request.method")
    );
    assert_eq!(
        outcome.response.header("x-adapt-trace-proposals-applied"),
        Some("0:reader:header")
    );
    assert_eq!(
        outcome.response.header("x-adapt-trace-request-id"),
        Some(outcome.trace.request_id.as_str())
    );
}
