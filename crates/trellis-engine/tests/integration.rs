//! End-to-end tests: parse DOT, build the graph, run the engine, check the
//! terminal state, context, events, and checkpoint artifacts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use trellis_core::{Context, Outcome, Result, StageStatus, TrellisError, Value};
use trellis_engine::{
    CollectingObserver, ConditionalHandler, Engine, EngineConfig, EventKind, ExitHandler,
    FnObserver, Graph, HandlerRegistry, Node, NodeHandler, RetryPolicy, RunHooks,
    ScriptedInterviewer, StartHandler, WaitHumanHandler,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build_graph(dot: &str) -> Graph {
    let doc = trellis_dot::parse(dot).expect("DOT parse failed");
    Graph::from_dot(doc).expect("graph build failed")
}

fn test_config(dir: &tempfile::TempDir) -> EngineConfig {
    EngineConfig::new(dir.path()).retry_policy(RetryPolicy::immediate())
}

/// Codergen stand-in: marks each node done and bumps a shared step counter
/// through the context, so resumed runs must restore state exactly.
struct CountingHandler;

#[async_trait]
impl NodeHandler for CountingHandler {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    async fn execute(
        &self,
        node: &Node,
        context: &Context,
        _graph: &Graph,
        _hooks: &RunHooks,
    ) -> Result<Outcome> {
        let steps = context
            .get("steps")
            .await
            .and_then(|v| v.as_int())
            .unwrap_or(0);
        Ok(Outcome::success(format!("done: {}", node.id))
            .with_update(format!("{}.done", node.id), Value::Bool(true))
            .with_update("steps", Value::Int(steps + 1)))
    }
}

fn counting_registry() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(ConditionalHandler);
    reg.register(CountingHandler);
    reg
}

// ---------------------------------------------------------------------------
// Scenario 1: linear pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_pipeline_visits_in_order() {
    let graph = build_graph(
        r#"digraph L {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            a [prompt="step a"] ; b [prompt="step b"]
            start -> a -> b -> finish
        }"#,
    );
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::with_default_registry();

    let result = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();

    assert_eq!(result.visited, vec!["start", "a", "b", "finish"]);
    for id in ["start", "a", "b", "finish"] {
        assert_eq!(result.node_outcomes[id].status, StageStatus::Success);
    }
    // Run directory artifacts: manifest, rolling checkpoint, stage outputs.
    assert!(result.run_dir.join("manifest.json").exists());
    assert!(result.run_dir.join("checkpoint.json").exists());
    assert!(result.run_dir.join("a/prompt.md").exists());
    assert!(result.run_dir.join("a/response.md").exists());
    assert!(result.run_dir.join("a/status.json").exists());
}

// ---------------------------------------------------------------------------
// Scenario 2: conditional branch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn conditional_branch_routes_on_outcome() {
    let graph = build_graph(
        r#"digraph B {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            check [prompt="check"]
            ok [prompt="ok"] ; recover [prompt="recover"]
            start -> check
            check -> ok [condition="outcome=success"]
            check -> recover [condition="outcome!=success"]
            ok -> finish
            recover -> finish
        }"#,
    );
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(counting_registry());

    let result = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();

    assert!(result.visited.contains(&"ok".to_string()));
    assert!(!result.visited.contains(&"recover".to_string()));
}

#[tokio::test]
async fn conditional_branch_routes_on_context_key() {
    struct EnvSetter;

    #[async_trait]
    impl NodeHandler for EnvSetter {
        fn handler_type(&self) -> &str {
            "codergen"
        }
        async fn execute(
            &self,
            _node: &Node,
            _context: &Context,
            _graph: &Graph,
            _hooks: &RunHooks,
        ) -> Result<Outcome> {
            Ok(Outcome::success("set").with_update("env", Value::String("prod".into())))
        }
    }

    let graph = build_graph(
        r#"digraph B {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            setup
            prod_path ; dev_path
            start -> setup
            setup -> prod_path [condition="context.env=prod"]
            setup -> dev_path [condition="context.env=dev"]
            prod_path -> finish
            dev_path -> finish
        }"#,
    );
    let mut reg = counting_registry();
    reg.register(EnvSetter);
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(reg);

    let result = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();
    assert!(result.visited.contains(&"prod_path".to_string()));
    assert!(!result.visited.contains(&"dev_path".to_string()));
}

// ---------------------------------------------------------------------------
// Scenario 3: retry then succeed
// ---------------------------------------------------------------------------

struct FlakyHandler {
    calls: Arc<AtomicUsize>,
    failures_before_success: usize,
}

#[async_trait]
impl NodeHandler for FlakyHandler {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    async fn execute(
        &self,
        _node: &Node,
        _context: &Context,
        _graph: &Graph,
        _hooks: &RunHooks,
    ) -> Result<Outcome> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            Ok(Outcome::fail("transient failure"))
        } else {
            Ok(Outcome::success("recovered"))
        }
    }
}

fn flaky_registry(calls: Arc<AtomicUsize>, failures: usize) -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(FlakyHandler {
        calls,
        failures_before_success: failures,
    });
    reg
}

#[tokio::test]
async fn retry_then_succeed_counts_invocations() {
    let graph = build_graph(
        r#"digraph R {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            t [max_retries=2, prompt="flaky"]
            start -> t -> finish
        }"#,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(flaky_registry(calls.clone(), 2));

    let result = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.retry_counts.get("t"), Some(&2));
    assert_eq!(result.node_outcomes["t"].status, StageStatus::Success);
}

#[tokio::test]
async fn retry_bound_is_max_retries_plus_one() {
    // Always fails, but a fail-condition edge keeps the pipeline moving.
    let graph = build_graph(
        r#"digraph R {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            t [max_retries=3, prompt="flaky"]
            start -> t
            t -> finish [condition="outcome=fail"]
        }"#,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(flaky_registry(calls.clone(), usize::MAX));

    let result = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(result.node_outcomes["t"].status, StageStatus::Fail);
}

#[tokio::test]
async fn stage_retrying_events_emitted() {
    let graph = build_graph(
        r#"digraph R {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            t [max_retries=2, prompt="flaky"]
            start -> t -> finish
        }"#,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(flaky_registry(calls, 2));
    let observer = CollectingObserver::new();
    engine.events().subscribe(observer.clone());

    engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();

    let attempts: Vec<u32> = observer
        .events()
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::StageRetrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
}

// ---------------------------------------------------------------------------
// Scenario 4: goal gates
// ---------------------------------------------------------------------------

/// Fails the gated node on the first pass, succeeds after.
struct SecondPassHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl NodeHandler for SecondPassHandler {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    async fn execute(
        &self,
        node: &Node,
        _context: &Context,
        _graph: &Graph,
        _hooks: &RunHooks,
    ) -> Result<Outcome> {
        if node.id == "impl" && self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Outcome::fail("not good enough"))
        } else {
            Ok(Outcome::success("fine"))
        }
    }
}

#[tokio::test]
async fn goal_gate_routes_to_retry_target_then_succeeds() {
    let graph = build_graph(
        r#"digraph G {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            plan [prompt="plan"]
            impl [goal_gate=true, retry_target="plan", prompt="implement"]
            start -> plan -> impl -> finish
        }"#,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(SecondPassHandler {
        calls: calls.clone(),
    });
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(reg);

    let result = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();

    // impl ran twice: initial failure, then success after the gate jump.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let plan_visits = result.visited.iter().filter(|id| *id == "plan").count();
    assert_eq!(plan_visits, 2);
    assert_eq!(result.node_outcomes["impl"].status, StageStatus::Success);
}

#[tokio::test]
async fn goal_gate_without_retry_target_fails_pipeline() {
    let graph = build_graph(
        r#"digraph G {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            impl [goal_gate=true, prompt="implement"]
            start -> impl -> finish
        }"#,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(flaky_registry(calls, usize::MAX));

    let err = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap_err();
    assert!(matches!(err, TrellisError::GoalGateUnmet { node } if node == "impl"));
}

#[tokio::test]
async fn same_gate_failing_twice_consecutively_aborts() {
    let graph = build_graph(
        r#"digraph G {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            plan [prompt="plan"]
            impl [goal_gate=true, retry_target="plan", prompt="implement"]
            start -> plan -> impl -> finish
        }"#,
    );
    // impl never succeeds; after the second gate failure the engine aborts
    // rather than looping forever.
    struct AlwaysFailImpl;

    #[async_trait]
    impl NodeHandler for AlwaysFailImpl {
        fn handler_type(&self) -> &str {
            "codergen"
        }
        async fn execute(
            &self,
            node: &Node,
            _c: &Context,
            _g: &Graph,
            _h: &RunHooks,
        ) -> Result<Outcome> {
            if node.id == "impl" {
                Ok(Outcome::fail("never passes"))
            } else {
                Ok(Outcome::success("ok"))
            }
        }
    }

    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(AlwaysFailImpl);
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(reg);

    let err = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap_err();
    assert!(matches!(err, TrellisError::GoalGateUnmet { node } if node == "impl"));
}

#[tokio::test]
async fn graph_level_retry_target_is_fallback() {
    let graph = build_graph(
        r#"digraph G {
            retry_target = "plan"
            start [shape=Mdiamond]
            finish [shape=Msquare]
            plan [prompt="plan"]
            impl [goal_gate=true, prompt="implement"]
            start -> plan -> impl -> finish
        }"#,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(SecondPassHandler {
        calls: calls.clone(),
    });
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(reg);

    let result = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(result.visited.iter().filter(|id| *id == "plan").count() >= 2);
}

// ---------------------------------------------------------------------------
// Scenario 5: checkpoint and resume
// ---------------------------------------------------------------------------

fn resume_graph() -> Graph {
    build_graph(
        r#"digraph P {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            a ; b ; c
            start -> a -> b -> c -> finish
        }"#,
    )
}

#[tokio::test]
async fn interrupted_run_resumes_to_identical_context() {
    // Uninterrupted reference run.
    let dir_full = tempfile::tempdir().unwrap();
    let engine = Engine::new(counting_registry());
    let reference = engine
        .run(&resume_graph(), Context::new(), &test_config(&dir_full))
        .await
        .unwrap();

    // Interrupt after the second checkpoint write.
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(counting_registry());
    let cancel = engine.cancel_flag();
    let saves = Arc::new(AtomicUsize::new(0));
    {
        let saves = saves.clone();
        engine.events().subscribe(Arc::new(FnObserver(move |event| {
            if matches!(event.kind, EventKind::CheckpointSaved { .. })
                && saves.fetch_add(1, Ordering::SeqCst) + 1 == 2
            {
                cancel.cancel();
            }
        })));
    }
    let err = engine
        .run(&resume_graph(), Context::new(), &test_config(&dir))
        .await
        .unwrap_err();
    assert!(matches!(err, TrellisError::Cancelled));

    // Resume with a fresh engine and a fresh context.
    let engine = Engine::new(counting_registry());
    let resumed = engine
        .run(
            &resume_graph(),
            Context::new(),
            &test_config(&dir).resume(true),
        )
        .await
        .unwrap();

    assert_eq!(resumed.final_context, reference.final_context);
    assert_eq!(resumed.final_context.get("steps"), Some(&Value::Int(3)));
    // The resumed run ends at the same node list tail.
    assert_eq!(resumed.visited.last(), reference.visited.last());
}

#[tokio::test]
async fn resume_without_checkpoint_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(counting_registry());
    let result = engine
        .run(
            &resume_graph(),
            Context::new(),
            &test_config(&dir).resume(true),
        )
        .await
        .unwrap();
    assert_eq!(result.visited.first().map(String::as_str), Some("start"));
}

#[tokio::test]
async fn checkpoint_document_has_expected_fields() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(counting_registry());
    let result = engine
        .run(&resume_graph(), Context::new(), &test_config(&dir))
        .await
        .unwrap();

    let raw = std::fs::read_to_string(result.run_dir.join("checkpoint.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["graph_name"], "P");
    assert!(doc["run_id"].as_str().unwrap().starts_with("run_"));
    assert!(doc["current_node_id"].is_string());
    assert!(doc["context_snapshot"].is_object());
    assert!(doc["retry_counts"].is_object());
    assert!(doc["visited"].is_array());
    assert!(doc["timestamp"].is_string());
}

// ---------------------------------------------------------------------------
// Scenario 6: variable expansion
// ---------------------------------------------------------------------------

struct PromptRecorder {
    prompts: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl NodeHandler for PromptRecorder {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    async fn execute(
        &self,
        node: &Node,
        _context: &Context,
        _graph: &Graph,
        _hooks: &RunHooks,
    ) -> Result<Outcome> {
        self.prompts
            .lock()
            .unwrap()
            .push(node.prompt.clone().unwrap_or_default());
        Ok(Outcome::success("ok").with_update("branch", Value::String("main".into())))
    }
}

#[tokio::test]
async fn prompts_expand_goal_and_context() {
    let graph = build_graph(
        r#"digraph V {
            goal = "X"
            start [shape=Mdiamond]
            finish [shape=Msquare]
            a [prompt="do $goal"]
            b [prompt="on $context.branch, then $unknown."]
            start -> a -> b -> finish
        }"#,
    );
    let prompts = Arc::new(Mutex::new(Vec::new()));
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(PromptRecorder {
        prompts: prompts.clone(),
    });
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(reg);

    engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();

    let seen = prompts.lock().unwrap().clone();
    assert_eq!(seen, vec!["do X".to_string(), "on main, then .".to_string()]);
}

// ---------------------------------------------------------------------------
// Failure paths and events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fail_with_no_matching_edge_is_pipeline_failure() {
    let graph = build_graph(
        r#"digraph F {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            t [prompt="flaky"]
            start -> t
            t -> finish [condition="outcome=success"]
        }"#,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(flaky_registry(calls, usize::MAX));
    let observer = CollectingObserver::new();
    engine.events().subscribe(observer.clone());

    let err = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap_err();
    assert!(matches!(err, TrellisError::NoOutgoingEdge { node } if node == "t"));
    assert!(observer
        .events()
        .iter()
        .any(|e| matches!(&e.kind, EventKind::PipelineFailed { reason } if reason == "no_outgoing_edge")));
}

#[tokio::test]
async fn invalid_graph_is_rejected_before_execution() {
    let graph = build_graph("digraph Bad { a -> b }");
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::with_default_registry();

    let err = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap_err();
    assert!(matches!(err, TrellisError::Validation(_)));
}

#[tokio::test]
async fn missing_handler_is_engine_error() {
    let graph = build_graph(
        r#"digraph M {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            t [type="exotic"]
            start -> t -> finish
        }"#,
    );
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::with_default_registry();

    let err = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap_err();
    assert!(
        matches!(err, TrellisError::MissingHandler { ref handler_type, .. } if handler_type == "exotic")
    );
}

#[tokio::test]
async fn event_stream_order_for_linear_run() {
    let graph = build_graph(
        r#"digraph E {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            a
            start -> a -> finish
        }"#,
    );
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(counting_registry());
    let observer = CollectingObserver::new();
    engine.events().subscribe(observer.clone());

    engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();

    assert_eq!(
        observer.kinds(),
        vec![
            "pipeline_started",
            "stage_started",   // start
            "stage_completed",
            "checkpoint_saved",
            "stage_started",   // a
            "stage_completed",
            "checkpoint_saved",
            "stage_started",   // finish
            "stage_completed",
            "checkpoint_saved",
            "pipeline_completed",
        ]
    );
}

// ---------------------------------------------------------------------------
// Human gate end-to-end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn human_gate_routes_by_answer() {
    let graph = build_graph(
        r#"digraph H {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            review [shape=hexagon, label="Review", prompt="Ship it?"]
            ship ; fix
            start -> review
            review -> ship [label="&Yes"]
            review -> fix [label="&No"]
            ship -> finish
            fix -> finish
        }"#,
    );
    let mut reg = counting_registry();
    reg.register(WaitHumanHandler::new(Arc::new(ScriptedInterviewer::new(
        vec![trellis_engine::Answer {
            choice: "No".into(),
            custom_text: None,
        }],
    ))));
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(reg);

    let result = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();

    assert!(result.visited.contains(&"fix".to_string()));
    assert!(!result.visited.contains(&"ship".to_string()));
}

// ---------------------------------------------------------------------------
// Parallel fan-out end-to-end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_fan_out_and_fan_in() {
    let graph = build_graph(
        r#"digraph P {
            start [shape=Mdiamond]
            finish [shape=Msquare]
            fork [shape=component]
            worker_a ; worker_b
            merge [shape=tripleoctagon]
            start -> fork
            fork -> worker_a
            fork -> worker_b
            fork -> merge [weight=10]
            worker_a -> merge
            worker_b -> merge
            merge -> finish
        }"#,
    );
    // Every fork edge is a branch (the merge branch is a harmless
    // pass-through); the weight then routes the walk itself to merge.
    let mut reg = counting_registry();
    reg.register(trellis_engine::ParallelHandler);
    reg.register(trellis_engine::FanInHandler);
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(reg);

    let result = engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();

    assert!(result.visited.contains(&"fork".to_string()));
    assert!(result.visited.contains(&"merge".to_string()));
    assert_eq!(
        result.final_context.get("parallel.branch_count"),
        Some(&Value::Int(3))
    );
    assert!(result.final_context.contains_key("fan_in.selected"));
}

// ---------------------------------------------------------------------------
// Default max retry from graph attributes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn graph_default_max_retry_applies_to_plain_nodes() {
    let graph = build_graph(
        r#"digraph D {
            default_max_retry = 2
            start [shape=Mdiamond]
            finish [shape=Msquare]
            t [prompt="flaky"]
            start -> t -> finish
        }"#,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(flaky_registry(calls.clone(), 2));

    engine
        .run(&graph, Context::new(), &test_config(&dir))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
