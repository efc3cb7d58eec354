//! End-to-end request scenarios

use adapt_kernel::budget::{BudgetDimension, ExecutionBudget};
use adapt_kernel::config::EngineConfig;
use adapt_kernel::script::{Entry, HostExt, ScriptBuilder, ScriptValue};
use adapt_kernel::trace::TraceKind;
use adapt_kernel::{ContentDescriptor, RequestDescriptor};
use adapt_signal::Phase;
use adapt_test_utils::{
    applying_theme, engine, engine_with, header_plugin, html, proposing_plugin, spinning_plugin, status_plugin,
    with_priority, WordBody,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn proposed_header_reaches_the_response() {
    let engine = engine(vec![header_plugin("foo", "X-Foo", "bar"), applying_theme("theme")]);
    let response = engine
        .handle(RequestDescriptor::get("/blog/post-1"), ContentDescriptor::new())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.header("X-Foo"), Some("bar"));
}

#[tokio::test]
async fn proposing_during_observe_is_refused_and_contained() {
    let eager = proposing_plugin(
        "eager",
        ScriptBuilder::new().on(Entry::Observe, |_, host| Ok(host.propose_status(200)?)),
    );
    let engine = engine(vec![eager, header_plugin("foo", "X-Foo", "bar"), applying_theme("theme")]);
    let outcome = engine
        .execute(RequestDescriptor::get("/blog/post-1"), ContentDescriptor::new())
        .await
        .unwrap();

    assert_eq!(outcome.response.status, 200);
    assert_eq!(outcome.response.header("x-foo"), Some("bar"));
    let violation = outcome
        .trace
        .find(|k| matches!(k, TraceKind::PhaseViolation { extension, .. } if extension == "eager"))
        .next()
        .unwrap();
    assert_eq!(violation.phase, Phase::Observe);
    assert!(outcome
        .trace
        .find(|k| matches!(k, TraceKind::ProposalSubmitted { extension, .. } if extension == "eager"))
        .next()
        .is_none());
}

#[test]
fn caught_phase_violation_does_not_fail_the_plugin() {
    let careful = proposing_plugin(
        "careful",
        ScriptBuilder::new().on(Entry::Observe, |_, host| {
            let refused = host.propose_status(418).is_err();
            Ok(ScriptValue::Bool(refused))
        }),
    );
    let engine = engine(vec![careful, applying_theme("theme")]);
    let outcome = engine
        .handle_blocking(RequestDescriptor::get("/"), ContentDescriptor::new())
        .unwrap();
    assert_eq!(outcome.response.status, 200);
    assert!(outcome.trace.find(|k| matches!(k, TraceKind::PhaseViolation { .. })).next().is_some());
    assert!(outcome.trace.find(|k| matches!(k, TraceKind::ExtensionFailed { .. })).next().is_none());
}

#[test]
fn word_count_streams_a_large_body() {
    let counter = proposing_plugin(
        "counter",
        ScriptBuilder::new()
            .on(Entry::Observe, |globals, host| {
                let words = host.transform("content.body", serde_json::json!({"op": "word_count"}))?;
                globals.insert("words".into(), words.clone());
                Ok(words)
            })
            .on(Entry::Propose, |globals, host| {
                let words = globals.get("words").and_then(ScriptValue::as_int).unwrap_or(-1);
                Ok(host.propose_header("X-Words", &words.to_string())?)
            }),
    );
    let body = WordBody::new(10_000, 250);
    let served = body.served();
    let config = EngineConfig::default().with_budget(ExecutionBudget {
        max_string_bytes: 16 * 1024,
        ..ExecutionBudget::default()
    });
    let engine = engine_with(config, vec![counter, applying_theme("theme")]).unwrap();
    assert!(body.chunk_bytes() < 16 * 1024);

    let outcome = engine
        .handle_blocking(
            RequestDescriptor::get("/long-read"),
            ContentDescriptor::new().with_body(body.handle()),
        )
        .unwrap();

    assert_eq!(outcome.response.header("x-words"), Some("10000"));
    assert_eq!(served.load(Ordering::Relaxed), 40);
    assert!(outcome.trace.signals_read().contains(&"content.body".to_string()));
}

#[test]
fn budget_breach_drops_only_that_plugin() {
    let config = EngineConfig::default().with_budget(ExecutionBudget {
        max_operations: 1_000,
        ..ExecutionBudget::default()
    });
    let engine = engine_with(
        config,
        vec![
            spinning_plugin("spinner"),
            header_plugin("foo", "X-Foo", "bar"),
            applying_theme("theme"),
        ],
    )
    .unwrap();
    let outcome = engine
        .handle_blocking(RequestDescriptor::get("/"), ContentDescriptor::new())
        .unwrap();

    assert_eq!(outcome.response.status, 200);
    assert_eq!(outcome.response.header("x-foo"), Some("bar"));
    let breach = outcome
        .trace
        .find(|k| matches!(k, TraceKind::BudgetExceeded { .. }))
        .next()
        .unwrap();
    match &breach.kind {
        TraceKind::BudgetExceeded {
            extension,
            dimension,
            limit,
            ..
        } => {
            assert_eq!(extension, "spinner");
            assert_eq!(*dimension, BudgetDimension::Operations);
            assert_eq!(*limit, 1_000);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(outcome
        .trace
        .find(|k| matches!(k, TraceKind::ProposalsDropped { extension, count: 1 } if extension == "spinner"))
        .next()
        .is_some());
}

#[test]
fn conflicting_statuses_are_resolved_and_explained() {
    let engine = engine(vec![
        status_plugin("found", 200),
        status_plugin("missing", 404),
        applying_theme("theme"),
    ]);
    let mut scope = engine
        .open_scope(RequestDescriptor::get("/maybe"), ContentDescriptor::new())
        .unwrap();
    scope.run_observe().unwrap();
    scope.run_propose().unwrap();
    scope.run_apply().unwrap();

    let statuses: Vec<(String, u16)> = scope
        .aggregated()
        .unwrap()
        .statuses()
        .map(|(p, code)| (p.source_extension_id.clone(), code))
        .collect();
    assert_eq!(statuses, vec![("found".to_string(), 200), ("missing".to_string(), 404)]);

    let outcome = scope.finalize().unwrap();
    assert_eq!(outcome.response.status, 200);
    let discarded = outcome.trace.proposals_discarded();
    assert_eq!(discarded.len(), 1);
    assert_eq!(discarded[0].0, 1);
    assert_eq!(discarded[0].1, "missing");
    assert!(!discarded[0].2.is_empty());
}

#[test]
fn priority_beats_submission_order() {
    let (missing, factory) = status_plugin("missing", 404);
    let engine = engine(vec![
        status_plugin("found", 200),
        (with_priority(missing, 5), factory),
        applying_theme("theme"),
    ]);
    let outcome = engine
        .handle_blocking(RequestDescriptor::get("/maybe"), ContentDescriptor::new())
        .unwrap();
    assert_eq!(outcome.response.status, 404);
    assert_eq!(outcome.trace.proposals_discarded()[0].1, "found");
}

#[test]
fn conditional_transforms_only_touch_matching_content() {
    let badge = proposing_plugin(
        "badge",
        ScriptBuilder::new().on(Entry::Propose, |_, host| {
            Ok(host.propose_transform(serde_json::json!({
                "op": "insert_html",
                "selector": "main",
                "position": "append",
                "html": "<aside>new</aside>",
                "conditions": {"content_types": ["text/html"], "path_prefix": "/blog"}
            }))?)
        }),
    );
    let engine = engine(vec![badge, applying_theme("theme")]);

    let blog = engine
        .handle_blocking(RequestDescriptor::get("/blog/post-1"), html("<main><p>x</p></main>"))
        .unwrap();
    assert_eq!(blog.response.body_string().unwrap(), "<main><p>x</p><aside>new</aside></main>");

    let about = engine
        .handle_blocking(RequestDescriptor::get("/about"), html("<main><p>x</p></main>"))
        .unwrap();
    assert_eq!(about.response.body_string().unwrap(), "<main><p>x</p></main>");
    assert_eq!(about.trace.proposals_discarded().len(), 1);
}
