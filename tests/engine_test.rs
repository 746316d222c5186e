//! End-to-end tests for the research workflow engine
//!
//! The model and search collaborators are scripted fakes; checkpoints go to
//! the in-memory store or to SQLite on a temp file.

use async_trait::async_trait;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use company_research::config::{DatabaseConfig, EngineConfig};
use company_research::error::{
    EngineError, ModelError, ModelResult, SearchError, SearchResult, StorageError, StorageResult,
};
use company_research::model::{ModelTask, StructuredModel, StructuredRequest};
use company_research::research::{
    event_channel, event_names, ProgressEvent, ResearchConfig, RunOutcome, Session, StepName,
    WorkflowEngine, WorkflowState,
};
use company_research::search::{SearchHit, SearchProvider};
use company_research::storage::{
    CheckpointRecord, Checkpointer, MemoryCheckpointer, SqliteCheckpointer,
};

// ============================================================================
// Fakes
// ============================================================================

/// Answers every task with canned output. Reflection verdicts are queued;
/// an empty queue means "satisfied".
#[derive(Default)]
struct ScriptedModel {
    verdicts: Mutex<VecDeque<Value>>,
    calls: Mutex<Vec<ModelTask>>,
    fail_on: Option<ModelTask>,
}

impl ScriptedModel {
    fn unsatisfied(times: usize) -> Self {
        let model = Self::default();
        for i in 0..times {
            model.verdicts.lock().unwrap().push_back(json!({
                "isSatisfactory": false,
                "missingFields": ["funding_summary"],
                "searchQueries": [format!("acme funding round {}", i + 1)],
                "reasoning": "funding is missing"
            }));
        }
        model
    }

    fn failing_on(task: ModelTask) -> Self {
        Self {
            fail_on: Some(task),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<ModelTask> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, task: ModelTask) -> usize {
        self.calls().iter().filter(|t| **t == task).count()
    }
}

#[async_trait]
impl StructuredModel for ScriptedModel {
    async fn invoke_structured(&self, request: StructuredRequest) -> ModelResult<Value> {
        let pass = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.task);
            calls.iter().filter(|t| **t == request.task).count()
        };

        if self.fail_on == Some(request.task) {
            return Err(ModelError::Malformed {
                message: "scripted failure".to_string(),
            });
        }

        Ok(match request.task {
            ModelTask::GenerateQueries => json!({
                "queries": [format!("acme founders {}", pass), format!("acme product {}", pass)]
            }),
            ModelTask::SynthesizeNotes => json!({ "notes": [format!("note from pass {}", pass)] }),
            ModelTask::ExtractSchema => json!({
                "company_name": "Acme",
                "founding_year": 1999,
                "founder_names": ["Jane Doe"]
            }),
            ModelTask::Reflect => self.verdicts.lock().unwrap().pop_front().unwrap_or_else(|| {
                json!({
                    "isSatisfactory": true,
                    "missingFields": [],
                    "searchQueries": [],
                    "reasoning": "complete"
                })
            }),
        })
    }
}

/// Returns one shared and one query-specific hit per query.
#[derive(Default)]
struct ScriptedSearch {
    queries: Mutex<Vec<String>>,
    fail: bool,
}

impl ScriptedSearch {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    async fn search(&self, query: &str, _max_results: u32) -> SearchResult<Vec<SearchHit>> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.fail {
            return Err(SearchError::Api {
                status: 503,
                message: "search unavailable".to_string(),
            });
        }
        Ok(vec![
            hit("https://acme.example/about"),
            hit(&format!("https://news.example/{}", query.replace(' ', "-"))),
        ])
    }
}

/// Signals when a search starts, then never finishes.
#[derive(Default)]
struct StalledSearch {
    started: Notify,
}

#[async_trait]
impl SearchProvider for StalledSearch {
    async fn search(&self, _query: &str, _max_results: u32) -> SearchResult<Vec<SearchHit>> {
        self.started.notify_one();
        std::future::pending().await
    }
}

/// Loads nothing and refuses every save.
struct BrokenCheckpointer;

#[async_trait]
impl Checkpointer for BrokenCheckpointer {
    async fn save(&self, _record: &CheckpointRecord) -> StorageResult<()> {
        Err(StorageError::Query {
            message: "disk full".to_string(),
        })
    }

    async fn load(&self, _session_id: &str) -> StorageResult<Option<CheckpointRecord>> {
        Ok(None)
    }

    async fn delete(&self, _session_id: &str) -> StorageResult<()> {
        Ok(())
    }
}

fn hit(url: &str) -> SearchHit {
    SearchHit {
        title: format!("Title of {}", url),
        url: url.to_string(),
        content: format!("Snippet from {}", url),
        raw_content: Some(format!("Full text of {}", url)),
        score: 0.9,
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn engine_config(suspend_after: Vec<StepName>) -> EngineConfig {
    EngineConfig {
        suspend_after,
        ..EngineConfig::default()
    }
}

fn session(id: &str, max_reflection_steps: u32) -> Session {
    Session::new(id, "Acme").with_config(ResearchConfig {
        max_reflection_steps,
        ..ResearchConfig::default()
    })
}

async fn run(
    engine: &WorkflowEngine,
    session: Session,
) -> (Result<RunOutcome, EngineError>, Vec<ProgressEvent>) {
    let (sink, stream) = event_channel(256);
    let outcome = engine.run(session, sink, CancellationToken::new()).await;
    (outcome, stream.collect().await)
}

async fn resume(
    engine: &WorkflowEngine,
    session_id: &str,
) -> (Result<RunOutcome, EngineError>, Vec<ProgressEvent>) {
    let (sink, stream) = event_channel(256);
    let outcome = engine
        .resume(session_id, Value::Null, sink, CancellationToken::new())
        .await;
    (outcome, stream.collect().await)
}

fn names(events: &[ProgressEvent]) -> Vec<&str> {
    events.iter().map(|e| e.name.as_str()).collect()
}

fn awaiting(outcome: &RunOutcome) -> StepName {
    match outcome {
        RunOutcome::Suspended { awaiting, .. } => *awaiting,
        other => panic!("expected suspension, got {:?}", other),
    }
}

// ============================================================================
// Full runs
// ============================================================================

#[tokio::test]
async fn test_single_pass_run_completes() {
    let model = Arc::new(ScriptedModel::default());
    let search = Arc::new(ScriptedSearch::default());
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let engine = WorkflowEngine::new(
        model.clone(),
        search.clone(),
        checkpointer.clone(),
        engine_config(vec![]),
    );

    let (outcome, events) = run(&engine, session("a", 0)).await;

    assert_eq!(
        names(&events),
        vec![
            event_names::GENERATED_QUERIES,
            event_names::EXECUTED_QUERIES,
            event_names::GENERATED_NOTES,
            event_names::NOTES_TO_SCHEMA,
            event_names::REFLECTION,
            event_names::END,
        ]
    );

    let output = match outcome.unwrap() {
        RunOutcome::Completed(output) => output,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(output.extracted_info["company_name"], "Acme");
    assert_eq!(output.reflection_steps_taken, 0);
    assert!(output.search_results.is_none());

    let end = events.last().unwrap();
    assert_eq!(end.data["info"]["founding_year"], 1999);
    assert!(end.data.get("searchResults").is_none());

    assert!(events[1].data.get("elapsedMs").is_some());
    assert!(events[3].data.get("elapsedMs").is_some());
    assert!(events[0].data.get("elapsedMs").is_none());

    assert_eq!(search.queries().len(), 2);
    assert_eq!(
        model.calls(),
        vec![
            ModelTask::GenerateQueries,
            ModelTask::SynthesizeNotes,
            ModelTask::ExtractSchema,
            ModelTask::Reflect,
        ]
    );

    let record = checkpointer.load("a").await.unwrap().unwrap();
    assert!(record.is_completed());
}

#[tokio::test]
async fn test_include_search_results_returns_deduplicated_hits() {
    let engine = WorkflowEngine::new(
        Arc::new(ScriptedModel::default()),
        Arc::new(ScriptedSearch::default()),
        Arc::new(MemoryCheckpointer::new()),
        engine_config(vec![]),
    );
    let session = Session::new("a2", "Acme").with_config(ResearchConfig {
        include_search_results: true,
        ..ResearchConfig::default()
    });

    let (outcome, events) = run(&engine, session).await;

    // Two queries share one URL: three unique sources
    let results = events.last().unwrap().data["searchResults"].clone();
    assert_eq!(results.as_array().unwrap().len(), 3);

    match outcome.unwrap() {
        RunOutcome::Completed(output) => {
            assert_eq!(output.search_results.unwrap().len(), 3);
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unsatisfied_reflection_loops_once_then_ends() {
    let model = Arc::new(ScriptedModel::unsatisfied(1));
    let search = Arc::new(ScriptedSearch::default());
    let engine = WorkflowEngine::new(
        model.clone(),
        search.clone(),
        Arc::new(MemoryCheckpointer::new()),
        engine_config(vec![]),
    );

    let (outcome, events) = run(&engine, session("b", 1)).await;

    assert_eq!(
        names(&events),
        vec![
            event_names::GENERATED_QUERIES,
            event_names::EXECUTED_QUERIES,
            event_names::GENERATED_NOTES,
            event_names::NOTES_TO_SCHEMA,
            event_names::REFLECTION,
            event_names::REROUTE,
            event_names::GENERATED_QUERIES,
            event_names::EXECUTED_QUERIES,
            event_names::GENERATED_NOTES,
            event_names::NOTES_TO_SCHEMA,
            event_names::REFLECTION,
            event_names::END,
        ]
    );

    let reroute = &events[5];
    assert_eq!(reroute.data["reroute"], "generate_queries");
    assert_eq!(reroute.data["reflectionStepsTaken"], 1);

    // Second search pass only runs the follow-up and the new queries
    let searched = search.queries();
    assert_eq!(searched.len(), 5);
    assert!(searched[2..].contains(&"acme funding round 1".to_string()));
    assert!(!searched[2..].contains(&"acme founders 1".to_string()));

    match outcome.unwrap() {
        RunOutcome::Completed(output) => assert_eq!(output.reflection_steps_taken, 1),
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reflection_budget_bounds_passes() {
    for budget in 0..4u32 {
        let model = Arc::new(ScriptedModel::unsatisfied(10));
        let engine = WorkflowEngine::new(
            model.clone(),
            Arc::new(ScriptedSearch::default()),
            Arc::new(MemoryCheckpointer::new()),
            engine_config(vec![]),
        );

        let (outcome, events) = run(&engine, session("bounded", budget)).await;

        assert_eq!(
            model.count(ModelTask::Reflect),
            budget as usize + 1,
            "budget {}",
            budget
        );
        assert_eq!(
            events.iter().filter(|e| e.name == event_names::REROUTE).count(),
            budget as usize
        );
        assert_eq!(events.last().unwrap().name, event_names::END);

        match outcome.unwrap() {
            RunOutcome::Completed(output) => {
                assert_eq!(output.reflection_steps_taken, budget + 1)
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }
}

// ============================================================================
// Suspension and resume
// ============================================================================

#[tokio::test]
async fn test_suspends_after_every_default_point() {
    let model = Arc::new(ScriptedModel::default());
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let engine = WorkflowEngine::new(
        model.clone(),
        Arc::new(ScriptedSearch::default()),
        checkpointer.clone(),
        EngineConfig::default(),
    );

    let (outcome, events) = run(&engine, session("c", 0)).await;
    assert_eq!(awaiting(&outcome.unwrap()), StepName::ExecuteSearch);
    assert_eq!(
        names(&events),
        vec![event_names::GENERATED_QUERIES, event_names::AWAITING]
    );
    assert_eq!(events[1].data["awaiting"], "execute_search");

    for expected in [StepName::Synthesize, StepName::Extract, StepName::Reflect] {
        let (outcome, events) = resume(&engine, "c").await;
        assert_eq!(awaiting(&outcome.unwrap()), expected);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].name, event_names::AWAITING);

        let record = checkpointer.load("c").await.unwrap().unwrap();
        assert_eq!(record.next_step, expected);
    }

    let (outcome, events) = resume(&engine, "c").await;
    assert!(matches!(outcome.unwrap(), RunOutcome::Completed(_)));
    assert_eq!(
        names(&events),
        vec![event_names::REFLECTION, event_names::END]
    );
    assert_eq!(model.count(ModelTask::GenerateQueries), 1);
}

#[tokio::test]
async fn test_resume_in_another_engine_instance() {
    let dir = tempfile::tempdir().unwrap();
    let db = DatabaseConfig {
        path: dir.path().join("research.db"),
        max_connections: 2,
    };

    let first_model = Arc::new(ScriptedModel::default());
    let first = WorkflowEngine::new(
        first_model.clone(),
        Arc::new(ScriptedSearch::default()),
        Arc::new(SqliteCheckpointer::new(&db).await.unwrap()),
        engine_config(vec![StepName::GenerateQueries]),
    );
    let (outcome, _) = run(&first, session("d", 0)).await;
    assert_eq!(awaiting(&outcome.unwrap()), StepName::ExecuteSearch);
    drop(first);

    let second_model = Arc::new(ScriptedModel::default());
    let second_search = Arc::new(ScriptedSearch::default());
    let second = WorkflowEngine::new(
        second_model.clone(),
        second_search.clone(),
        Arc::new(SqliteCheckpointer::new(&db).await.unwrap()),
        engine_config(vec![StepName::GenerateQueries]),
    );
    let (outcome, events) = resume(&second, "d").await;

    assert!(matches!(outcome.unwrap(), RunOutcome::Completed(_)));
    assert_eq!(events[0].name, event_names::EXECUTED_QUERIES);
    assert_eq!(second_model.count(ModelTask::GenerateQueries), 0);
    // The queries generated by the first instance are the ones searched
    assert_eq!(
        second_search.queries(),
        vec!["acme founders 1".to_string(), "acme product 1".to_string()]
    );
    assert_eq!(first_model.count(ModelTask::GenerateQueries), 1);
}

#[tokio::test]
async fn test_resume_input_does_not_change_state() {
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let engine = WorkflowEngine::new(
        Arc::new(ScriptedModel::default()),
        Arc::new(ScriptedSearch::default()),
        checkpointer.clone(),
        engine_config(vec![StepName::GenerateQueries, StepName::ExecuteSearch]),
    );
    run(&engine, session("e", 0)).await.0.unwrap();
    let before = checkpointer.load("e").await.unwrap().unwrap();

    let (sink, _stream) = event_channel(256);
    let outcome = engine
        .resume(
            "e",
            json!({"approved": true, "comment": "looks fine"}),
            sink,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(awaiting(&outcome), StepName::Synthesize);

    let after = checkpointer.load("e").await.unwrap().unwrap();
    assert_eq!(after.state.search_queries, before.state.search_queries);
    assert_eq!(after.session, before.session);
}

#[tokio::test]
async fn test_non_suspension_steps_in_config_are_ignored() {
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let engine = WorkflowEngine::new(
        Arc::new(ScriptedModel::default()),
        Arc::new(ScriptedSearch::default()),
        checkpointer.clone(),
        engine_config(vec![StepName::Reflect, StepName::Terminal]),
    );

    let (outcome, events) = run(&engine, session("r", 0)).await;

    assert!(matches!(outcome.unwrap(), RunOutcome::Completed(_)));
    assert_eq!(
        names(&events).last().copied(),
        Some(event_names::END),
        "events: {:?}",
        names(&events)
    );
    assert!(!names(&events).contains(&event_names::AWAITING));
    assert!(checkpointer.load("r").await.unwrap().unwrap().is_completed());
}

// ============================================================================
// Misuse
// ============================================================================

#[tokio::test]
async fn test_resume_without_checkpoint_is_misuse() {
    let engine = WorkflowEngine::new(
        Arc::new(ScriptedModel::default()),
        Arc::new(ScriptedSearch::default()),
        Arc::new(MemoryCheckpointer::new()),
        EngineConfig::default(),
    );

    let (outcome, events) = resume(&engine, "ghost").await;
    assert!(matches!(outcome, Err(EngineError::ConcurrencyMisuse { .. })));
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_resume_completed_session_is_misuse() {
    let engine = WorkflowEngine::new(
        Arc::new(ScriptedModel::default()),
        Arc::new(ScriptedSearch::default()),
        Arc::new(MemoryCheckpointer::new()),
        engine_config(vec![]),
    );
    run(&engine, session("done", 0)).await.0.unwrap();

    let (outcome, _) = resume(&engine, "done").await;
    assert!(matches!(outcome, Err(EngineError::ConcurrencyMisuse { .. })));
}

#[tokio::test]
async fn test_run_on_existing_session_is_misuse() {
    let model = Arc::new(ScriptedModel::default());
    let engine = WorkflowEngine::new(
        model.clone(),
        Arc::new(ScriptedSearch::default()),
        Arc::new(MemoryCheckpointer::new()),
        EngineConfig::default(),
    );
    run(&engine, session("twice", 0)).await.0.unwrap();

    let (outcome, events) = run(&engine, session("twice", 0)).await;
    assert!(matches!(outcome, Err(EngineError::ConcurrencyMisuse { .. })));
    assert!(events.is_empty());
    assert_eq!(model.count(ModelTask::GenerateQueries), 1);
}

#[tokio::test]
async fn test_concurrent_resume_is_misuse() {
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let seed = Session::new("busy", "Acme");
    let mut state = WorkflowState::default();
    state.search_queries = vec!["acme founders".to_string()];
    checkpointer
        .save(&CheckpointRecord::new(&seed, &state, StepName::ExecuteSearch))
        .await
        .unwrap();

    let search = Arc::new(StalledSearch::default());
    let engine = WorkflowEngine::new(
        Arc::new(ScriptedModel::default()),
        search.clone(),
        checkpointer,
        EngineConfig::default(),
    );

    let cancel = CancellationToken::new();
    let (first, _events) = engine.resume_streaming("busy", Value::Null, cancel.clone());
    search.started.notified().await;

    let (outcome, _) = resume(&engine, "busy").await;
    assert!(matches!(outcome, Err(EngineError::ConcurrencyMisuse { .. })));

    cancel.cancel();
    let first = first.await.unwrap();
    assert!(matches!(first, Err(EngineError::Cancelled { .. })));

    // The lease is released once the first call is done; a pre-cancelled
    // resume gets past it and stops at the first step
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let outcome = engine
        .resume("busy", Value::Null, event_channel(8).0, cancelled)
        .await;
    assert!(matches!(outcome, Err(EngineError::Cancelled { .. })));
}

#[tokio::test]
async fn test_invalid_session_never_starts() {
    let model = Arc::new(ScriptedModel::default());
    let engine = WorkflowEngine::new(
        model.clone(),
        Arc::new(ScriptedSearch::default()),
        Arc::new(MemoryCheckpointer::new()),
        EngineConfig::default(),
    );

    let (outcome, events) = run(&engine, Session::new("v", "")).await;
    assert!(matches!(outcome, Err(EngineError::Validation(_))));
    assert!(events.is_empty());
    assert!(model.calls().is_empty());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_search_failure_fails_run_without_terminal_event() {
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let engine = WorkflowEngine::new(
        Arc::new(ScriptedModel::default()),
        Arc::new(ScriptedSearch::failing()),
        checkpointer.clone(),
        engine_config(vec![]),
    );

    let (outcome, events) = run(&engine, session("f", 0)).await;

    assert!(matches!(outcome, Err(EngineError::Search { .. })));
    assert_eq!(names(&events), vec![event_names::GENERATED_QUERIES]);
    assert!(checkpointer.is_empty().await);
}

#[tokio::test]
async fn test_model_failure_keeps_last_checkpoint() {
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let engine = WorkflowEngine::new(
        Arc::new(ScriptedModel::failing_on(ModelTask::SynthesizeNotes)),
        Arc::new(ScriptedSearch::default()),
        checkpointer.clone(),
        EngineConfig::default(),
    );

    run(&engine, session("g", 0)).await.0.unwrap();
    resume(&engine, "g").await.0.unwrap();

    let (outcome, events) = resume(&engine, "g").await;
    assert!(matches!(outcome, Err(EngineError::Model { .. })));
    assert!(events.iter().all(|e| !e.is_terminal()));

    // Still resumable from the step that failed
    let record = checkpointer.load("g").await.unwrap().unwrap();
    assert_eq!(record.next_step, StepName::Synthesize);
}

#[tokio::test]
async fn test_persistence_failure_emits_no_awaiting() {
    let engine = WorkflowEngine::new(
        Arc::new(ScriptedModel::default()),
        Arc::new(ScriptedSearch::default()),
        Arc::new(BrokenCheckpointer),
        EngineConfig::default(),
    );

    let (outcome, events) = run(&engine, session("h", 0)).await;

    assert!(matches!(outcome, Err(EngineError::Persistence(_))));
    assert_eq!(names(&events), vec![event_names::GENERATED_QUERIES]);
}

#[tokio::test]
async fn test_cancellation_mid_search_writes_nothing() {
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let search = Arc::new(StalledSearch::default());
    let engine = WorkflowEngine::new(
        Arc::new(ScriptedModel::default()),
        search.clone(),
        checkpointer.clone(),
        engine_config(vec![]),
    );

    let cancel = CancellationToken::new();
    let (handle, mut events) = engine.start(session("i", 0), cancel.clone());

    let first = events.next().await.unwrap();
    assert_eq!(first.name, event_names::GENERATED_QUERIES);
    search.started.notified().await;
    cancel.cancel();

    let outcome = handle.await.unwrap();
    assert!(matches!(outcome, Err(EngineError::Cancelled { .. })));
    assert!(events.next().await.is_none());
    assert!(checkpointer.is_empty().await);
}

#[tokio::test]
async fn test_cancellation_frees_run_blocked_on_stalled_consumer() {
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let engine = WorkflowEngine::new(
        Arc::new(ScriptedModel::default()),
        Arc::new(ScriptedSearch::default()),
        checkpointer.clone(),
        EngineConfig {
            event_buffer: 1,
            ..engine_config(vec![])
        },
    );

    // The stream stays open but is never read, so the second event blocks
    let cancel = CancellationToken::new();
    let (handle, _events) = engine.start(session("stall", 0), cancel.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run stayed blocked after cancellation")
        .unwrap();
    assert!(matches!(outcome, Err(EngineError::Cancelled { .. })));
    assert!(checkpointer.is_empty().await);
}
