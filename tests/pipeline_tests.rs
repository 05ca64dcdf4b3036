//! Runtime behaviour across run, pause, approval and resume

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lobster::commands::{item_stream, ItemStream};
use lobster::{
    CommandRegistry, Error, GateStatus, Outcome, ResumeToken, Result, RunStatus, Runtime,
    StageContext, StageHandler, StageOutput, StateManager,
};

/// Counts how often it runs and emits the count
struct Counter(Arc<AtomicUsize>);

#[async_trait]
impl StageHandler for Counter {
    async fn execute(&self, _ctx: &StageContext, _input: ItemStream) -> Result<StageOutput> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StageOutput::Items(item_stream(vec![json!(n)])))
    }

    fn usage(&self) -> &str {
        "count"
    }
}

/// Always fails
struct Fail;

#[async_trait]
impl StageHandler for Fail {
    async fn execute(&self, ctx: &StageContext, _input: ItemStream) -> Result<StageOutput> {
        Err(ctx.error("induced failure"))
    }

    fn usage(&self) -> &str {
        "fail"
    }
}

/// Reads only the first input item
struct First;

#[async_trait]
impl StageHandler for First {
    async fn execute(&self, _ctx: &StageContext, mut input: ItemStream) -> Result<StageOutput> {
        let first = input.next().await.transpose()?;
        Ok(StageOutput::Items(item_stream(first.into_iter().collect())))
    }

    fn usage(&self) -> &str {
        "first"
    }
}

/// Reports whether it was given input
struct HasInput;

#[async_trait]
impl StageHandler for HasInput {
    async fn execute(&self, ctx: &StageContext, _input: ItemStream) -> Result<StageOutput> {
        Ok(StageOutput::Items(item_stream(vec![json!(ctx.has_input)])))
    }

    fn usage(&self) -> &str {
        "has-input"
    }
}

fn runtime_with_counter() -> (Runtime, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let mut runtime = Runtime::in_memory("wf");
    runtime
        .registry_mut()
        .register("count", Counter(count.clone()));
    runtime.registry_mut().register("fail", Fail);
    runtime.registry_mut().register("first", First);
    runtime.registry_mut().register("has-input", HasInput);
    (runtime, count)
}

fn error_kind(outcome: &Outcome) -> &str {
    match outcome {
        Outcome::Error { kind, .. } => kind,
        other => panic!("expected error outcome, got {:?}", other),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_end_to_end_hello_world() {
    let runtime = Runtime::in_memory("wf");

    let paused = runtime
        .run("exec echo hello | approve | exec echo world")
        .await;
    assert_eq!(paused.status(), "paused");
    assert_eq!(paused.output(), Some(&[json!("hello")][..]));
    match &paused {
        Outcome::Paused { gate, .. } => {
            assert_eq!(gate.workflow_id, "wf");
            assert_eq!(gate.gate_id, "stage-1");
        }
        other => panic!("expected pause, got {:?}", other),
    }

    runtime
        .gates()
        .approve("wf", "stage-1", "alice", None)
        .unwrap();
    let done = runtime.resume(paused.token().unwrap()).await;
    assert_eq!(done, Outcome::Complete { output: Some(vec![json!("world")]) });
}

#[tokio::test]
async fn test_stage_after_pending_gate_never_runs() {
    let (runtime, count) = runtime_with_counter();

    let outcome = runtime.run("echo A | approve | count").await;
    assert!(outcome.is_paused());
    assert_eq!(outcome.output(), Some(&[json!("A")][..]));
    assert_eq!(count.load(Ordering::SeqCst), 0);

    // Resuming while still pending pauses again at the same gate
    let again = runtime.resume(outcome.token().unwrap()).await;
    assert!(again.is_paused());
    assert_eq!(again.token(), outcome.token());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rejected_gate_is_terminal() {
    let (runtime, count) = runtime_with_counter();
    let paused = runtime.run("echo A | approve | count").await;

    runtime
        .gates()
        .reject("wf", "stage-1", Some("not today".into()))
        .unwrap();
    let outcome = runtime.resume(paused.token().unwrap()).await;

    assert_eq!(error_kind(&outcome), "gate_rejected");
    match &outcome {
        Outcome::Error { error, stage_index, .. } => {
            assert!(error.contains("not today"), "{error}");
            assert_eq!(*stage_index, Some(1));
        }
        _ => unreachable!(),
    }
    assert_eq!(count.load(Ordering::SeqCst), 0);

    let record = runtime.state().load_run("wf").unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.token.is_none());
}

#[tokio::test]
async fn test_reset_gate_makes_run_resumable_again() {
    let (runtime, count) = runtime_with_counter();
    let paused = runtime.run("echo A | approve | count").await;
    let token = paused.token().unwrap().to_string();

    runtime.gates().reject("wf", "stage-1", None).unwrap();
    assert!(runtime.resume(&token).await.is_error());

    runtime.gates().reset("wf", "stage-1").unwrap();
    assert!(runtime.resume(&token).await.is_paused());

    runtime.gates().approve("wf", "stage-1", "bob", None).unwrap();
    let done = runtime.resume(&token).await;
    assert_eq!(done.output(), Some(&[json!(1)][..]));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_command_is_an_error_outcome() {
    let runtime = Runtime::in_memory("wf");
    let outcome = runtime.run("bogus_cmd x").await;

    assert_eq!(error_kind(&outcome), "unknown_command");
    match outcome {
        Outcome::Error { error, stage_index, command, .. } => {
            assert!(error.contains("bogus_cmd"));
            assert_eq!(stage_index, Some(0));
            assert_eq!(command.as_deref(), Some("bogus_cmd"));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_failure_stops_the_pipeline() {
    let (runtime, count) = runtime_with_counter();
    let outcome = runtime.run("echo A | fail | count").await;

    assert_eq!(error_kind(&outcome), "handler_execution");
    assert!(outcome.token().is_none());
    assert_eq!(count.load(Ordering::SeqCst), 0);

    let record = runtime.state().load_run("wf").unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.stage_index, 1);
    assert!(record.error.unwrap().contains("induced failure"));
}

#[tokio::test]
async fn test_each_stage_replaces_the_carried_value() {
    let (runtime, _) = runtime_with_counter();
    let outcome = runtime.run("echo A | echo B | count | count").await;
    assert_eq!(outcome, Outcome::Complete { output: Some(vec![json!(2)]) });
}

#[tokio::test]
async fn test_approved_gate_passes_input_through() {
    let (runtime, _) = runtime_with_counter();
    runtime
        .gates()
        .approve("wf", "deploy", "alice", None)
        .unwrap();

    let outcome = runtime.run("echo A | approve deploy | first").await;
    assert_eq!(outcome.output(), Some(&[json!("A")][..]));
}

#[tokio::test]
async fn test_named_gate_is_shared_across_runs() {
    let (runtime, _) = runtime_with_counter();
    assert!(runtime.run("echo a | approve release").await.is_paused());
    assert!(runtime.run("echo b | approve release | count").await.is_paused());

    runtime.gates().approve("wf", "release", "alice", None).unwrap();
    assert!(runtime.run("echo c | approve release").await.is_complete());
}

#[tokio::test]
async fn test_gate_first_has_no_input() {
    let (runtime, _) = runtime_with_counter();
    let paused = runtime.run("approve | has-input").await;

    match &paused {
        Outcome::Paused { output, gate, .. } => {
            assert_eq!(*output, None);
            assert_eq!(gate.gate_id, "stage-0");
        }
        other => panic!("expected pause, got {:?}", other),
    }

    runtime.gates().approve("wf", "stage-0", "alice", None).unwrap();
    let done = runtime.resume(paused.token().unwrap()).await;
    assert_eq!(done.output(), Some(&[json!(false)][..]));

    let fed = runtime.run("echo x | has-input").await;
    assert_eq!(fed.output(), Some(&[json!(true)][..]));
}

#[tokio::test]
async fn test_empty_output_differs_from_no_input() {
    let (runtime, _) = runtime_with_counter();
    let outcome = runtime.run("echo '[]' | json parse | json values | has-input").await;
    // `json values` of an empty array yields no items, which is still input
    assert_eq!(outcome.output(), Some(&[json!(true)][..]));
}

#[tokio::test]
async fn test_last_registration_wins() {
    let (mut runtime, _) = runtime_with_counter();
    runtime.registry_mut().register("echo", Fail);
    assert!(runtime.run("echo hi").await.is_error());
}

#[tokio::test]
async fn test_token_carries_everything() {
    let (runtime, _) = runtime_with_counter();
    let paused = runtime
        .run("echo '{\"a\": [1, 2.5, null]}' | json parse | approve")
        .await;

    let decoded = ResumeToken::decode(paused.token().unwrap()).unwrap();
    assert_eq!(decoded.stage_index, 2);
    assert_eq!(decoded.workflow_id.as_deref(), Some("wf"));
    assert_eq!(decoded.carried, Some(vec![json!({"a": [1, 2.5, null]})]));

    // A runtime sharing only the gate store can resume from the token alone
    let other = Runtime::new(
        CommandRegistry::with_builtins(),
        runtime.state().clone(),
        "somewhere-else",
    );
    other.gates().approve("wf", "stage-2", "alice", None).unwrap();
    let done = other.resume(paused.token().unwrap()).await;
    assert_eq!(done.output(), Some(&[json!({"a": [1, 2.5, null]})][..]));
}

#[tokio::test]
async fn test_tampered_token_is_rejected() {
    let runtime = Runtime::in_memory("wf");
    let paused = runtime.run("echo a | approve").await;
    let mut token = paused.token().unwrap().to_string();
    token.insert(3, '!');

    assert_eq!(error_kind(&runtime.resume(&token).await), "invalid_token");
    assert_eq!(error_kind(&runtime.resume("").await), "invalid_token");

    let escaping = ResumeToken::new("echo a | approve", 1, None)
        .with_workflow("../x")
        .encode()
        .unwrap();
    assert_eq!(error_kind(&runtime.resume(&escaping).await), "invalid_token");
}

#[tokio::test]
async fn test_resume_workflow_uses_stored_token() {
    let (runtime, count) = runtime_with_counter();
    let paused = runtime.run("echo a | approve | count").await;

    let record = runtime.state().load_run("wf").unwrap();
    assert_eq!(record.status, RunStatus::Paused);
    assert_eq!(record.token.as_deref(), paused.token());

    runtime.gates().approve("wf", "stage-1", "alice", None).unwrap();
    let done = runtime.resume_workflow("wf").await;
    assert!(done.is_complete());
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(
        runtime.state().load_run("wf").unwrap().status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn test_file_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = Runtime::new(
        CommandRegistry::with_builtins(),
        StateManager::file(dir.path()),
        "nightly",
    );
    let paused = first.run("echo built | approve --prompt 'ship?'").await;
    match &paused {
        Outcome::Paused { prompt, .. } => assert_eq!(prompt.as_deref(), Some("ship?")),
        other => panic!("expected pause, got {:?}", other),
    }
    drop(first);

    let second = Runtime::new(
        CommandRegistry::with_builtins(),
        StateManager::file(dir.path()),
        "nightly",
    );
    let gate = second.gates().get("nightly", "stage-1").unwrap().unwrap();
    assert_eq!(gate.status, GateStatus::Pending);
    assert_eq!(gate.prompt.as_deref(), Some("ship?"));

    second
        .gates()
        .approve("nightly", "stage-1", "ops", None)
        .unwrap();
    let done = second.resume_workflow("nightly").await;
    assert_eq!(done.output(), Some(&[json!("built")][..]));
}

#[tokio::test]
async fn test_approving_rejected_gate_needs_reset() {
    let runtime = Runtime::in_memory("wf");
    runtime.gates().reject("wf", "g", None).unwrap();
    let err = runtime
        .gates()
        .approve("wf", "g", "alice", None)
        .unwrap_err();
    assert!(matches!(err, Error::GateTransition(_)));
}

#[tokio::test]
async fn test_outcome_serializes_as_tagged_record() {
    let runtime = Runtime::in_memory("wf");
    let value: Value = serde_json::to_value(runtime.run("echo hi").await).unwrap();
    assert_eq!(value, json!({"status": "complete", "output": ["hi"]}));
}
