//! JavaScript extensions driven through the engine

use adapt_kernel::budget::{BudgetDimension, ExecutionBudget};
use adapt_kernel::config::EngineConfig;
use adapt_kernel::trace::TraceKind;
use adapt_kernel::{ContentDescriptor, RequestDescriptor};
use adapt_test_utils::{applying_theme, engine, engine_with, header_plugin, js_plugin};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn script_headers_reach_the_response() {
    let greeter = js_plugin(
        "greeter",
        r#"
        extension.propose = () => {
          propose.header("X-Greeting", "hello");
          return null;
        };
        "#,
    );
    let engine = engine(vec![greeter, applying_theme("theme")]);
    let response = engine
        .handle(RequestDescriptor::get("/"), ContentDescriptor::new())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-greeting"), Some("hello"));
}

#[test]
fn runaway_scripts_lose_only_their_proposals() {
    let config = EngineConfig::default().with_budget(ExecutionBudget {
        max_operations: 1_000,
        ..ExecutionBudget::default()
    });
    let spinner = js_plugin(
        "spinner",
        r#"
        extension.propose = () => {
          propose.status(418);
          while (true) {}
        };
        "#,
    );
    let engine = engine_with(
        config,
        vec![spinner, header_plugin("foo", "X-Foo", "bar"), applying_theme("theme")],
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

#[tokio::test]
async fn pooled_scripts_start_each_request_fresh() {
    let counter = js_plugin(
        "counter",
        r#"
        let seen = 0;
        extension.propose = () => {
          seen += 1;
          propose.header("X-Seen", String(seen));
          return null;
        };
        "#,
    );
    let engine = engine(vec![counter, applying_theme("theme")]);
    for _ in 0..2 {
        let response = engine
            .handle(RequestDescriptor::get("/"), ContentDescriptor::new())
            .await
            .unwrap();
        assert_eq!(response.header("x-seen"), Some("1"));
    }
}
