//! Sandbox lifecycle, invocation and confinement against real isolates.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::*;
use fathom_runtime::{DisposeReason, RuntimeError, SandboxManager};
use fathom_types::{InvocationContext, PipelineBundle, ProfileUser};
use serde_json::{json, Value};

const SLOW_OR_SPIN: &str = r#"
export default (ctx, events, user) => {
  if (ctx.mode === "spin") {
    while (true) {}
  }
  if (ctx.mode === "slow") {
    const end = Date.now() + 300;
    while (Date.now() < end) {}
  }
  return { properties: { count: events.length } };
};
"#;

fn mode(name: &str) -> InvocationContext {
    InvocationContext::new().with_property("mode", json!(name))
}

#[tokio::test]
async fn test_concrete_pb1_scenario() {
    let manager = manager();
    let v1 = bundle("pb1", vec![function("f1", COUNT_EVENTS, "h1")]);

    let first = manager
        .invoke(&v1, &InvocationContext::new(), &events(3), &user())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.properties, json!({"count": 3}).as_object().unwrap().clone());
    let first_generation = manager.generation("pb1").await.unwrap();
    let first_hash = manager.peek("pb1").await.unwrap().content_hash().to_string();

    let v2 = bundle("pb1", vec![function("f1", COUNT_EVENTS, "h2")]);
    let second = manager
        .invoke(&v2, &InvocationContext::new(), &events(3), &user())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.properties["count"], 3);

    let second_sandbox = manager.peek("pb1").await.unwrap();
    assert_ne!(second_sandbox.content_hash(), first_hash);
    assert!(second_sandbox.generation() > first_generation);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_cache_stability() {
    let manager = manager();
    let b = bundle("pb1", vec![function("f1", COUNT_EVENTS, "h1")]);

    let first = manager.sandbox(&b).await.unwrap();
    for n in 0..5 {
        let result = manager
            .invoke(&b, &InvocationContext::new(), &events(n), &user())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.properties["count"], n);
    }
    let again = manager.sandbox(&b).await.unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    let stats = manager.stats().await;
    assert_eq!(stats.compiles, 1);
    assert_eq!(stats.cache_hits, 6);
    assert_eq!(stats.live, 1);
    manager.shutdown().await;
}

async fn assert_supersedes(before: PipelineBundle, after: PipelineBundle) {
    let manager = manager();
    let old = manager.sandbox(&before).await.unwrap();
    let new = manager.sandbox(&after).await.unwrap();

    assert!(!Arc::ptr_eq(&old, &new));
    assert!(new.generation() > old.generation());
    // In-flight calls may still finish during the grace period.
    assert!(!old.is_disposed());

    settle(Duration::from_millis(300)).await;
    assert_eq!(old.dispose_reason(), Some(DisposeReason::Superseded));
    assert!(!old.dispose(DisposeReason::Evicted));
    assert!(!new.is_disposed());

    let stats = manager.stats().await;
    assert_eq!(stats.compiles, 2);
    assert_eq!(stats.disposals, 1);
    assert_eq!(stats.live, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_code_hash_change_recompiles_once() {
    let f1 = function("f1", COUNT_EVENTS, "h1");
    let f2 = function("f2", COUNT_EVENTS, "h2");
    let changed = function("f2", COUNT_EVENTS, "h2b");
    assert_supersedes(
        bundle("pb1", vec![f1.clone(), f2]),
        bundle("pb1", vec![f1, changed]),
    )
    .await;
}

#[tokio::test]
async fn test_reordering_functions_recompiles() {
    let f1 = function("f1", COUNT_EVENTS, "h1");
    let f2 = function("f2", COUNT_EVENTS, "h2");
    assert_supersedes(
        bundle("pb1", vec![f1.clone(), f2.clone()]),
        bundle("pb1", vec![f2, f1]),
    )
    .await;
}

#[tokio::test]
async fn test_updated_at_change_recompiles() {
    let before = bundle("pb1", vec![function("f1", COUNT_EVENTS, "h1")]);
    let mut after = before.clone();
    after.spec.updated_at = after.spec.updated_at + ChronoDuration::seconds(1);
    assert_supersedes(before, after).await;
}

#[tokio::test]
async fn test_import_confinement() {
    let manager = manager();
    let other = function("f2", COUNT_EVENTS, "h2");
    let targets = [
        "./helpers.js",
        "@fathom/missing",
        "fathom:udf/fn-f2-f2",
        "fathom:lib/functions",
        "fathom:internal",
        "fathom:chain",
        "node:fs",
        "ext:core/ops",
        "https://example.com/mod.js",
    ];

    for (index, target) in targets.iter().enumerate() {
        let code = format!(
            "import * as x from {target:?};\nexport default () => ({{ properties: {{ ok: typeof x }} }});"
        );
        let b = bundle(
            &format!("confined-{index}"),
            vec![function("f1", &code, "h1"), other.clone()],
        );
        match manager.sandbox(&b).await {
            Err(RuntimeError::Compile(err)) => {
                assert_eq!(err.function_id.as_deref(), Some("f1"), "{target}: {err}");
            }
            other => panic!("import of {target} should fail to link, got {other:?}"),
        }
    }

    let stats = manager.stats().await;
    assert_eq!(stats.compiles, 0);
    assert_eq!(stats.compile_failures, targets.len() as u64);
}

#[tokio::test]
async fn test_library_imports_link() {
    let manager = manager();
    let code = r#"
import { log } from "@fathom/functions";
import crypto from "@fathom/crypto";
export default () => ({ properties: { log: typeof log.info, hash: typeof crypto.hash } });
"#;
    let b = bundle("pb1", vec![function("f1", code, "h1")]);
    let result = manager
        .invoke(&b, &InvocationContext::new(), &[], &user())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.properties["log"], "function");
    assert_eq!(result.properties["hash"], "function");
    manager.shutdown().await;
}

#[tokio::test]
async fn test_host_globals_are_unreachable() {
    let manager = manager();
    let code = r#"
export default () => {
  let generated;
  try {
    generated = Function("return 1")();
  } catch (e) {
    generated = e.name;
  }
  let evaluated;
  try {
    evaluated = globalThis.__bootstrap.core.evalContext("1 + 41");
  } catch (e) {
    evaluated = e.name;
  }
  const internals = Object.getOwnPropertyNames(globalThis).filter((name) =>
    (name.startsWith("__") && name !== "__fathomRunChain") ||
    name === "Deno" ||
    name === "WebAssembly"
  );
  return {
    properties: {
      deno: typeof Deno,
      bootstrap: typeof globalThis.__bootstrap,
      infra: typeof globalThis.__infra,
      bridge: typeof globalThis.__fathomBridge,
      evalFn: typeof eval,
      ctor: typeof (() => {}).constructor,
      generated,
      evaluated,
      internals,
      consoleResult: typeof console.log("not printed"),
    },
  };
};
"#;
    let b = bundle("pb1", vec![function("f1", code, "h1")]);
    let result = manager
        .invoke(&b, &InvocationContext::new(), &[], &user())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.properties["deno"], "undefined");
    assert_eq!(result.properties["bridge"], "undefined");
    assert_eq!(result.properties["evalFn"], "undefined");
    assert_eq!(result.properties["ctor"], "undefined");
    assert_eq!(result.properties["generated"], "EvalError");
    assert_eq!(result.properties["bootstrap"], "undefined");
    assert_eq!(result.properties["infra"], "undefined");
    assert_eq!(result.properties["evaluated"], "TypeError");
    assert_eq!(result.properties["internals"], json!([]));
    assert_eq!(result.properties["consoleResult"], "undefined");
    manager.shutdown().await;
}

#[tokio::test]
async fn test_dynamic_import_rejected_at_call_time() {
    let manager = manager();
    let code = r#"
export default async () => {
  const lib = await import("@fathom/functions");
  return { properties: { loaded: typeof lib } };
};
"#;
    let b = bundle("pb1", vec![function("f1", code, "h1")]);
    let err = manager
        .invoke(&b, &InvocationContext::new(), &[], &user())
        .await
        .unwrap_err();
    match err {
        RuntimeError::Guest(e) => assert!(e.message.contains("dynamic import"), "{}", e.message),
        other => panic!("expected guest error, got {other:?}"),
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn test_compile_error_replayed_until_hash_changes() {
    let manager = manager();
    let broken = bundle("pb1", vec![function("f1", "export default (", "h1")]);

    let first = manager.sandbox(&broken).await.unwrap_err();
    let second = manager.sandbox(&broken).await.unwrap_err();
    match (&first, &second) {
        (RuntimeError::Compile(a), RuntimeError::Compile(b)) => {
            assert_eq!(a, b);
            assert_eq!(a.function_id.as_deref(), Some("f1"));
        }
        other => panic!("expected compile errors, got {other:?}"),
    }
    assert_eq!(manager.stats().await.compile_failures, 1);

    let fixed = bundle("pb1", vec![function("f1", COUNT_EVENTS, "h2")]);
    let result = manager
        .invoke(&fixed, &InvocationContext::new(), &events(2), &user())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.properties["count"], 2);
    assert_eq!(manager.generation("pb1").await, Some(2));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_missing_default_export_is_attributed() {
    let manager = manager();
    let b = bundle(
        "pb1",
        vec![
            function("f1", COUNT_EVENTS, "h1"),
            function("f2", "export const config = { name: 'x' };", "h2"),
        ],
    );
    match manager.sandbox(&b).await {
        Err(RuntimeError::Compile(err)) => {
            assert_eq!(err.function_id.as_deref(), Some("f2"));
            assert!(err.message.contains("default"), "{}", err.message);
        }
        other => panic!("expected compile error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_timeout_disposes_whole_sandbox() {
    let mut section = section();
    section.invoke_timeout_ms = 300;
    let manager = manager_with(section);
    let b = bundle("pb1", vec![function("f1", SLOW_OR_SPIN, "h1")]);
    let sandbox = manager.sandbox(&b).await.unwrap();

    let (spin, ok, batch, person) = (mode("spin"), mode("ok"), events(1), user());
    let spinning = sandbox.invoke(&spin, &batch, &person);
    let queued = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        sandbox.invoke(&ok, &batch, &person).await
    };
    let (spinning, queued) = tokio::join!(spinning, queued);

    assert!(matches!(spinning, Err(RuntimeError::Timeout { timeout_ms: 300 })));
    assert!(matches!(
        queued,
        Err(RuntimeError::Disposed {
            reason: DisposeReason::Timeout
        })
    ));
    assert!(sandbox.is_disposed());
    assert!(spinning.unwrap_err().is_droppable());

    let late = sandbox.invoke(&mode("ok"), &events(1), &user()).await;
    assert!(matches!(late, Err(RuntimeError::Disposed { .. })));
}

#[tokio::test]
async fn test_self_heals_after_timeout() {
    let mut section = section();
    section.invoke_timeout_ms = 300;
    let manager = manager_with(section);
    let b = bundle("pb1", vec![function("f1", SLOW_OR_SPIN, "h1")]);

    let failed = manager.invoke(&b, &mode("spin"), &events(1), &user()).await;
    assert!(matches!(failed, Err(RuntimeError::Timeout { .. })));
    assert_eq!(manager.generation("pb1").await, Some(1));

    let healed = manager
        .invoke(&b, &mode("ok"), &events(4), &user())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(healed.properties["count"], 4);
    assert_eq!(manager.generation("pb1").await, Some(2));
    assert_eq!(manager.stats().await.retries, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_unrelated_disposal_retries_once_on_healed_sandbox() {
    let manager = manager();
    let b = bundle("pb1", vec![function("f1", SLOW_OR_SPIN, "h1")]);
    manager.sandbox(&b).await.unwrap();

    let call = {
        let manager = manager.clone();
        let b = b.clone();
        tokio::spawn(async move { manager.invoke(&b, &mode("slow"), &events(2), &user()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.evict("pb1").await);
    let replacement = manager.sandbox(&b).await.unwrap();
    assert_eq!(replacement.generation(), 2);

    let result = call.await.unwrap().unwrap().unwrap();
    assert_eq!(result.properties["count"], 2);
    assert_eq!(manager.stats().await.retries, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_round_trip_fidelity() {
    let manager = manager();
    let code = r#"
export default (ctx, events, user) => ({
  properties: { traits: user.traits, events, region: ctx.region, userId: user.userId },
});
"#;
    let b = bundle("pb1", vec![function("f1", code, "h1")]);
    let traits = json!({
        "nested": {"list": [1, 2.5, -3, null, true, "x"], "empty": {}},
        "unicode": "héllo ✓ 日本",
        "quote": "\"</script>\\",
        "big": 9007199254740991u64,
        "flag": false
    });
    let mut user = ProfileUser::new("u-42");
    user.traits = traits.as_object().unwrap().clone();
    let events = vec![
        json!({"type": "track", "properties": {"price": 9.99, "tags": ["a", "b"]}}),
        json!({"type": "identify", "traits": {"email": null}}),
    ];
    let context = InvocationContext::new().with_property("region", json!("eu-west"));

    let result = manager
        .invoke(&b, &context, &events, &user)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result.properties["traits"], traits);
    assert_eq!(result.properties["events"], Value::Array(events));
    assert_eq!(result.properties["region"], "eu-west");
    assert_eq!(result.properties["userId"], "u-42");
    manager.shutdown().await;
}

#[tokio::test]
async fn test_non_object_results_mean_no_result() {
    let manager = manager();
    for (index, body) in ["undefined", "null", "42", "\"text\"", "[1, 2]"].iter().enumerate() {
        let code = format!("export default () => {body};");
        let b = bundle(&format!("pb{index}"), vec![function("f1", &code, "h1")]);
        let result = manager
            .invoke(&b, &InvocationContext::new(), &[], &user())
            .await
            .unwrap();
        assert!(result.is_none(), "{body} should produce no result");
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn test_structured_and_plain_guest_errors() {
    let manager = manager();
    let code = r#"
export default (ctx) => {
  if (ctx.kind === "structured") {
    throw new Error(JSON.stringify({ message: "rate limited", retryable: true, retryAfterMs: 250 }));
  }
  if (ctx.kind === "string") {
    throw "plain failure";
  }
  null.boom;
};
"#;
    let b = bundle("pb1", vec![function("f1", code, "h1")]);
    let ctx = |kind: &str| InvocationContext::new().with_property("kind", json!(kind));

    match manager.invoke(&b, &ctx("structured"), &[], &user()).await {
        Err(RuntimeError::Application(err)) => {
            assert_eq!(err.message, "rate limited");
            assert_eq!(err.retry_after_ms(), Some(250));
            assert!(RuntimeError::Application(err).is_retryable());
        }
        other => panic!("expected application error, got {other:?}"),
    }
    match manager.invoke(&b, &ctx("string"), &[], &user()).await {
        Err(RuntimeError::Guest(err)) => assert_eq!(err.message, "plain failure"),
        other => panic!("expected guest error, got {other:?}"),
    }
    match manager.invoke(&b, &ctx("type"), &[], &user()).await {
        Err(RuntimeError::Guest(err)) => {
            assert_eq!(err.name, "TypeError");
            assert!(err.stack.is_some());
        }
        other => panic!("expected guest error, got {other:?}"),
    }

    // Guest errors leave the sandbox healthy.
    assert_eq!(manager.stats().await.compiles, 1);
    assert!(!manager.peek("pb1").await.unwrap().is_disposed());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_guest_state_does_not_leak_between_pipelines() {
    let manager = manager();
    let code = r#"
globalThis.counter = (globalThis.counter ?? 0) + 1;
export default () => ({ properties: { counter: globalThis.counter } });
"#;
    let a = bundle("pb-a", vec![function("f1", code, "h1")]);
    let b = bundle("pb-b", vec![function("f1", code, "h1")]);

    let ra = manager.invoke(&a, &InvocationContext::new(), &[], &user()).await.unwrap().unwrap();
    let rb = manager.invoke(&b, &InvocationContext::new(), &[], &user()).await.unwrap().unwrap();
    assert_eq!(ra.properties["counter"], 1);
    assert_eq!(rb.properties["counter"], 1);
    assert_eq!(manager.stats().await.live, 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_evict_sweep_and_shutdown() {
    let mut section = section();
    section.cache_ttl_secs = 1;
    let manager = manager_with(section);
    let a = bundle("pb-a", vec![function("f1", COUNT_EVENTS, "h1")]);
    let b = bundle("pb-b", vec![function("f1", COUNT_EVENTS, "h1")]);
    let c = bundle("pb-c", vec![function("f1", COUNT_EVENTS, "h1")]);

    let sa = manager.sandbox(&a).await.unwrap();
    assert!(manager.evict("pb-a").await);
    assert_eq!(sa.dispose_reason(), Some(DisposeReason::Evicted));
    assert!(!manager.evict("pb-a").await);

    let sb = manager.sandbox(&b).await.unwrap();
    settle(Duration::from_millis(1200)).await;
    let sc = manager.sandbox(&c).await.unwrap();
    assert_eq!(manager.sweep_expired().await, 1);
    assert_eq!(sb.dispose_reason(), Some(DisposeReason::Expired));
    assert!(!sc.is_disposed());

    manager.shutdown().await;
    assert_eq!(sc.dispose_reason(), Some(DisposeReason::Shutdown));
    let stats = manager.stats().await;
    assert_eq!(stats.live, 0);
    assert_eq!(stats.disposals, 3);
}

#[tokio::test]
async fn test_expired_entry_recompiles_on_access() {
    let mut section = section();
    section.cache_ttl_secs = 1;
    let manager = manager_with(section);
    let b = bundle("pb1", vec![function("f1", COUNT_EVENTS, "h1")]);

    let first = manager.sandbox(&b).await.unwrap();
    settle(Duration::from_millis(1200)).await;
    let second = manager.sandbox(&b).await.unwrap();

    assert_eq!(first.dispose_reason(), Some(DisposeReason::Expired));
    assert_eq!(second.generation(), first.generation() + 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_evicted_pipeline_leaves_slot_map() {
    let mut section = section();
    section.cache_ttl_secs = 1;
    let manager = manager_with(section);
    let a = bundle("pb-a", vec![function("f1", COUNT_EVENTS, "h1")]);
    let b = bundle("pb-b", vec![function("f1", COUNT_EVENTS, "h1")]);

    let first = manager.sandbox(&a).await.unwrap();
    manager.sandbox(&b).await.unwrap();
    assert_eq!(manager.tracked_pipelines(), 2);

    assert!(manager.evict("pb-a").await);
    assert_eq!(manager.tracked_pipelines(), 1);
    assert_eq!(manager.generation("pb-a").await, None);

    let again = manager.sandbox(&a).await.unwrap();
    assert!(again.generation() > first.generation());
    assert_eq!(manager.tracked_pipelines(), 2);

    settle(Duration::from_millis(1200)).await;
    assert_eq!(manager.sweep_expired().await, 2);
    assert_eq!(manager.tracked_pipelines(), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_disposal_releases_bridge_services() {
    let (bridge, logger, _) = bridge();
    let baseline = Arc::strong_count(&logger);
    let manager = SandboxManager::new(&section(), bridge);
    let v1 = bundle("pb1", vec![function("f1", COUNT_EVENTS, "h1")]);
    let v2 = bundle("pb1", vec![function("f1", COUNT_EVENTS, "h2")]);

    manager.sandbox(&v1).await.unwrap();
    assert_eq!(Arc::strong_count(&logger), baseline + 1);

    manager.sandbox(&v2).await.unwrap();
    settle(Duration::from_millis(300)).await;
    assert_eq!(Arc::strong_count(&logger), baseline + 1);

    assert!(manager.evict("pb1").await);
    settle(Duration::from_millis(300)).await;
    assert_eq!(Arc::strong_count(&logger), baseline);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_in_flight_call_survives_supersession() {
    let mut section = section();
    section.grace_period_ms = 1000;
    let manager = manager_with(section);
    let before = bundle("pb1", vec![function("f1", SLOW_OR_SPIN, "h1")]);
    let after = bundle("pb1", vec![function("f1", SLOW_OR_SPIN, "h2")]);
    let old = manager.sandbox(&before).await.unwrap();

    let call = {
        let old = old.clone();
        tokio::spawn(async move { old.invoke(&mode("slow"), &events(2), &user()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let new = manager.sandbox(&after).await.unwrap();
    assert!(!Arc::ptr_eq(&old, &new));

    let result = call.await.unwrap().unwrap().unwrap();
    assert_eq!(result.properties["count"], 2);
    assert!(!old.is_disposed());

    settle(Duration::from_millis(1200)).await;
    assert_eq!(old.dispose_reason(), Some(DisposeReason::Superseded));
    manager.shutdown().await;
}
