//! End-to-end scenarios against the dispatcher with a mock provider

use serde_json::json;
use std::sync::Arc;
use taskloom::dispatcher::{exit_code, DispatchOutput, Dispatcher};
use taskloom_core::{FailureReason, TaskStatus, Template};
use taskloom_engine::{Engine, EngineConfig};
use taskloom_llm::{MockBehavior, MockProvider};
use taskloom_tools::create_default_registry;

fn dispatcher_with(provider: MockProvider) -> (Dispatcher, Arc<Engine>) {
    let workdir = std::env::temp_dir();
    let config = EngineConfig {
        workdir: workdir.clone(),
        ..Default::default()
    };
    let engine = Arc::new(Engine::new(
        Arc::new(provider),
        create_default_registry(&workdir),
        config,
    ));
    (Dispatcher::new(engine.clone()), engine)
}

fn unwrap_result(output: DispatchOutput) -> taskloom_core::TaskResult {
    match output {
        DispatchOutput::Result(result) => result,
        other => panic!("expected a task result, got {:?}", other),
    }
}

// ===========================================================================
// S1 — parameter substitution
// ===========================================================================

#[tokio::test]
async fn s1_parameter_substitution() {
    let (dispatcher, engine) = dispatcher_with(MockProvider::echo());
    engine
        .templates()
        .register(Template::new("echo", "Say: {{x}}").with_params(["x"]))
        .unwrap();

    let output = dispatcher.dispatch("echo x=hello").await;
    assert_eq!(output.exit_code(), exit_code::SUCCESS);
    let result = unwrap_result(output);
    assert_eq!(result.status, TaskStatus::Complete);
    assert_eq!(result.content, "Say: hello");
    assert_eq!(result.notes.template_used.as_deref(), Some("echo"));
}

// ===========================================================================
// S2 — unknown placeholder rejected at registration
// ===========================================================================

#[test]
fn s2_unknown_placeholder_fails_registration() {
    let workdir = std::env::temp_dir();
    let engine = Engine::new(
        Arc::new(MockProvider::echo()),
        create_default_registry(&workdir),
        EngineConfig::default(),
    );

    let broken = Template::new("broken", "{{y}}").with_params(["x"]);
    let error = engine.templates().register(broken).unwrap_err();
    assert!(error.to_string().contains("y"), "{}", error);
    assert!(engine.templates().find("broken").is_none());
}

// ===========================================================================
// S3 — context mutual exclusion, no LLM call
// ===========================================================================

#[tokio::test]
async fn s3_context_mutual_exclusion() {
    let provider = MockProvider::echo();
    let (dispatcher, engine) = dispatcher_with(provider);
    engine
        .templates()
        .register(Template::new("echo", "Say: {{x}}").with_params(["x"]))
        .unwrap();

    let source = r#"(echo (x "hi") (context (inherit_context "full") (fresh_context "enabled")))"#;
    let result = unwrap_result(dispatcher.dispatch(source).await);
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(
        result.failure_reason(),
        Some(FailureReason::ContextConstraintViolation)
    );
}

// ===========================================================================
// S4 — depth limit
// ===========================================================================

#[tokio::test]
async fn s4_depth_limit() {
    let behaviors: Vec<MockBehavior> = (0..10)
        .map(|i| MockBehavior::ToolCall {
            name: "spawn_subtask".into(),
            args: json!({"task": "recurse", "inputs": {"step": i}}),
        })
        .collect();
    let (dispatcher, engine) = dispatcher_with(MockProvider::sequence(behaviors));
    engine
        .templates()
        .register(Template::new("recurse", "Go deeper: {{step}}").with_params(["step"]))
        .unwrap();

    let output = dispatcher
        .dispatch("recurse step=start max_depth=3")
        .await;
    assert_eq!(output.exit_code(), exit_code::TASK_FAILURE);
    let result = unwrap_result(output);
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(
        result.failure_reason(),
        Some(FailureReason::ExecutionHalted)
    );
    let details = result.notes.error.unwrap().details.unwrap();
    assert_eq!(details["depth"], 3);
}

// ===========================================================================
// S5 — let and closure
// ===========================================================================

#[tokio::test]
async fn s5_let_and_closure() {
    let (dispatcher, _) = dispatcher_with(MockProvider::echo());
    let result = unwrap_result(
        dispatcher
            .dispatch("(let ((n 10)) ((lambda (x) (+ x n)) 5))")
            .await,
    );
    assert_eq!(result.status, TaskStatus::Complete);
    assert_eq!(result.content, "15");
}

// ===========================================================================
// S6 — CONTINUATION and tool-response stitching
// ===========================================================================

#[tokio::test]
async fn s6_continuation_stitching() {
    let provider = MockProvider::sequence(vec![
        MockBehavior::ToolCall {
            name: "spawn_subtask".into(),
            args: json!({"task": "answer", "inputs": {"q": "life"}}),
        },
        MockBehavior::Text("42".into()),
        MockBehavior::Text("answer=42".into()),
    ]);
    let (dispatcher, engine) = dispatcher_with(provider);
    engine
        .templates()
        .register(Template::new("parent", "Find: {{goal}}").with_params(["goal"]))
        .unwrap();
    engine
        .templates()
        .register(Template::new("answer", "Q: {{q}}").with_params(["q"]))
        .unwrap();

    let result = unwrap_result(dispatcher.dispatch("parent goal=everything").await);
    assert_eq!(result.status, TaskStatus::Complete);
    assert_eq!(result.content, "answer=42");
    let history = result.notes.iteration_history.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "42");
}

// ===========================================================================
// Dispatcher surface
// ===========================================================================

#[tokio::test]
async fn unknown_identifier_exits_6() {
    let (dispatcher, _) = dispatcher_with(MockProvider::echo());
    let output = dispatcher.dispatch("no_such_thing x=1").await;
    assert_eq!(output.exit_code(), exit_code::IDENTIFIER_NOT_FOUND);
}

#[tokio::test]
async fn malformed_json_value_exits_3() {
    let (dispatcher, engine) = dispatcher_with(MockProvider::echo());
    engine
        .templates()
        .register(Template::new("echo", "Say: {{x}}").with_params(["x"]))
        .unwrap();

    let output = dispatcher.dispatch("echo x='{not json}'").await;
    assert_eq!(output.exit_code(), exit_code::INPUT_VALIDATION);
    let result = unwrap_result(output);
    assert_eq!(
        result.failure_reason(),
        Some(FailureReason::InputValidationFailure)
    );
}

#[tokio::test]
async fn sexp_parse_error_exits_2() {
    let (dispatcher, _) = dispatcher_with(MockProvider::echo());
    let output = dispatcher.dispatch("(+ 1 2").await;
    assert_eq!(output.exit_code(), exit_code::PARSE_ERROR);
    assert!(matches!(output, DispatchOutput::ParseError(_)));
}

#[tokio::test]
async fn extra_input_exits_3() {
    let (dispatcher, engine) = dispatcher_with(MockProvider::echo());
    engine
        .templates()
        .register(Template::new("echo", "Say: {{x}}").with_params(["x"]))
        .unwrap();

    let output = dispatcher.dispatch("echo x=hi zz=nope").await;
    assert_eq!(output.exit_code(), exit_code::INPUT_VALIDATION);
}

#[tokio::test]
async fn template_help_lists_params_without_executing() {
    let provider = MockProvider::echo();
    let (dispatcher, engine) = dispatcher_with(provider);
    engine
        .templates()
        .register(
            Template::new("echo", "Say: {{x}}")
                .with_params(["x"])
                .with_description("Echo a value"),
        )
        .unwrap();

    let output = dispatcher.dispatch("echo --help").await;
    assert_eq!(output.exit_code(), exit_code::SUCCESS);
    match output {
        DispatchOutput::Help(text) => {
            assert!(text.contains("echo"));
            assert!(text.contains("Echo a value"));
            assert!(text.contains("x"));
        }
        other => panic!("expected help, got {:?}", other),
    }
}

#[tokio::test]
async fn direct_tool_dispatch() {
    let (dispatcher, _) = dispatcher_with(MockProvider::echo());
    let output = dispatcher
        .dispatch("system:run_script script='echo from-tool'")
        .await;
    assert_eq!(output.exit_code(), exit_code::SUCCESS);
    let result = unwrap_result(output);
    assert_eq!(result.content, "from-tool");
}

#[tokio::test]
async fn workflow_composes_tasks_and_arithmetic() {
    let (dispatcher, engine) = dispatcher_with(MockProvider::echo());
    engine
        .templates()
        .register(Template::new("echo", "Say: {{x}}").with_params(["x"]))
        .unwrap();

    let source = r#"
        (progn
          (bind greeting (echo "hi"))
          (if greeting (+ 40 2) 0))
    "#;
    let result = unwrap_result(dispatcher.dispatch(source).await);
    assert_eq!(result.content, "42");
}

#[tokio::test]
async fn loop_drives_repeated_task_invocations() {
    let (dispatcher, engine) = dispatcher_with(MockProvider::echo());
    engine
        .templates()
        .register(Template::new("echo", "Say: {{x}}").with_params(["x"]))
        .unwrap();

    let result = unwrap_result(dispatcher.dispatch(r#"(loop 3 (echo "again"))"#).await);
    assert_eq!(result.status, TaskStatus::Complete);
    assert_eq!(result.content, "Say: again");
}
