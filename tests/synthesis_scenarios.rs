//! End-to-end content-block scenarios through the engine facade

mod common;

use std::sync::Arc;

use common::{engine, engine_with, KeywordEmbedder, ScriptedBackend, Step};
use deck_context::chunking::{Document, DocumentMetadata, TextRange};
use deck_context::contradiction::{ResolutionRule, ResolutionStatus};
use deck_context::error::ContextError;
use deck_context::memory::MemoryEvent;
use deck_context::router::{TaskDescriptor, TaskType};
use deck_context::synthesis::{ContentRequest, SynthesisStage};

const MEMO_LINE: &str = "Q3 revenue = $10M.\n";
const AUDITED_LINE: &str = "Q3 revenue = $12M.";

/// Two chunks: the memo's figure, then the audited report's figure
fn revenue_document() -> Document {
    let text = format!("{}{}", MEMO_LINE, AUDITED_LINE);
    let meta = DocumentMetadata::new("Board Deck", "internal_memo").with_provenance_span(
        TextRange::new(MEMO_LINE.len(), text.len()),
        "audited_report",
        None,
    );
    Document::new("deck", text, meta)
}

fn headcount_document() -> Document {
    Document::new(
        "people",
        "Headcount was 1,200 employees.",
        DocumentMetadata::new("People Update", "press_release"),
    )
}

fn outline(session_id: &str, topic: &str) -> ContentRequest {
    ContentRequest::new(session_id, topic, TaskDescriptor::new(TaskType::Outline))
}

#[tokio::test]
async fn test_revenue_contradiction_keeps_trusted_source() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::replying("writer", "Q3 revenue was $12M [F1].");
    let engine = engine(dir.path(), backend.clone()).await;

    assert_eq!(engine.ingest(revenue_document()).await.unwrap(), 2);
    let session = engine.start_session(None).await.unwrap();

    let block = engine
        .generate_block(outline(&session, "Q3 revenue"))
        .await
        .unwrap();

    // only the audited chunk is cited
    assert_eq!(block.citations, vec!["deck#0001".to_string()]);
    assert_eq!(block.facts.len(), 1);
    let kept = &block.facts[0];
    assert_eq!(kept.value.numeric(), Some(12_000_000.0));
    assert_eq!(kept.provenance, "audited_report");
    for fact in &block.facts {
        assert!(!fact.supporting.is_empty(), "unattributed fact {}", fact.id);
    }

    assert_eq!(block.resolutions.len(), 1);
    let record = &block.resolutions[0];
    assert_eq!(record.rule, Some(ResolutionRule::SourceTrust));
    assert_ne!(record.status, ResolutionStatus::Open);
    assert_eq!(record.kept, vec![kept.id.clone()]);
    assert_eq!(block.model, "writer");
    assert!(block.relaxations.is_empty());

    let scope = engine.session_scope(&session).await.unwrap();
    assert!(scope.accepted.contains_key(&kept.id));
    assert_eq!(scope.superseded.len(), 1);
    let loser = scope.superseded.values().next().unwrap();
    assert_eq!(loser.fact.value.numeric(), Some(10_000_000.0));
    assert_eq!(loser.record_id, record.id);
    assert_eq!(scope.steps.len(), 1);
    assert_eq!(scope.known_chunks.len(), 2);
    assert!(!scope.summary.is_empty());

    // the prompt never offered the losing figure
    let prompt = backend.prompts.lock().unwrap()[0].clone();
    assert!(prompt.contains("[F1]"));
    assert!(!prompt.contains("[F2]"));
}

#[tokio::test]
async fn test_repeat_request_adds_no_contradictions() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::replying("writer", "Q3 revenue was $12M [F1].");
    let engine = engine(dir.path(), backend).await;
    engine.ingest(revenue_document()).await.unwrap();
    let session = engine.start_session(None).await.unwrap();

    engine
        .generate_block(outline(&session, "Q3 revenue"))
        .await
        .unwrap();
    let again = engine
        .generate_block(outline(&session, "Q3 revenue"))
        .await
        .unwrap();

    assert!(again.resolutions.is_empty());
    assert_eq!(again.facts.len(), 1);
    let scope = engine.session_scope(&session).await.unwrap();
    assert_eq!(scope.contradictions.len(), 1);
    assert!(scope.open_contradictions().next().is_none());
    assert_eq!(scope.steps.len(), 2);
}

#[tokio::test]
async fn test_roadmap_query_misses_without_touching_other_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::replying("writer", "Q3 revenue was $12M [F1].");
    let embedder = Arc::new(KeywordEmbedder::new(vec!["revenue", "margin", "headcount"]));
    let engine = engine_with(dir.path(), embedder, backend.clone()).await;
    engine.ingest(revenue_document()).await.unwrap();

    let lost = engine.start_session(Some("lost".to_string())).await.unwrap();
    let busy = engine.start_session(Some("busy".to_string())).await.unwrap();
    let lost_before = engine.session_scope(&lost).await.unwrap();

    let roadmap = outline(&lost, "product roadmap");
    let roadmap_id = roadmap.request_id.clone();
    let (missed, emitted) = tokio::join!(
        engine.generate_block(roadmap),
        engine.generate_block(outline(&busy, "Q3 revenue")),
    );

    let failure = missed.unwrap_err();
    assert_eq!(failure.stage, SynthesisStage::Retrieved);
    assert_eq!(failure.session_id, lost);
    assert!(matches!(
        failure.error,
        ContextError::RetrievalMiss {
            found: 0,
            required: 1,
            ..
        }
    ));
    assert!(emitted.is_ok());
    assert_eq!(backend.calls(), 1);

    assert_eq!(engine.session_scope(&lost).await.unwrap(), lost_before);
    let busy_scope = engine.session_scope(&busy).await.unwrap();
    assert_eq!(busy_scope.steps.len(), 1);

    let log = engine.memory().audit_log().read(&lost).await.unwrap();
    assert!(log.iter().any(|entry| matches!(
        &entry.event,
        MemoryEvent::RequestFailed { request_id, .. } if *request_id == roadmap_id
    )));
}

#[tokio::test]
async fn test_cancel_during_model_call_keeps_last_emitted_state() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(
        "writer",
        vec![
            Step::Reply("Q3 revenue was $12M [F1].".to_string()),
            Step::Hang,
        ],
    );
    let engine = engine(dir.path(), backend.clone()).await;
    engine.ingest(revenue_document()).await.unwrap();
    engine.ingest(headcount_document()).await.unwrap();
    let session = engine.start_session(None).await.unwrap();

    engine
        .generate_block(outline(&session, "Q3 revenue"))
        .await
        .unwrap();
    let emitted = engine.session_scope(&session).await.unwrap();

    let (result, cancelled) = tokio::join!(
        engine.generate_block(outline(&session, "Headcount")),
        async {
            backend.started.notified().await;
            engine.cancel_session(&session).await
        }
    );
    cancelled.unwrap();

    let failure = result.unwrap_err();
    assert_eq!(failure.stage, SynthesisStage::ModelInvoked);
    assert!(failure.is_cancelled());

    let after = engine.session_scope(&session).await.unwrap();
    assert_eq!(after, emitted);
    assert!(after
        .accepted
        .values()
        .all(|fact| fact.predicate != "headcount"));
}

#[tokio::test]
async fn test_ungrounded_output_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::replying("writer", "Q3 revenue was $15M, up 40% [F1].");
    let engine = engine(dir.path(), backend).await;
    engine.ingest(revenue_document()).await.unwrap();
    let session = engine.start_session(None).await.unwrap();
    let before = engine.session_scope(&session).await.unwrap();

    let failure = engine
        .generate_block(outline(&session, "Q3 revenue"))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, SynthesisStage::Validated);
    match &failure.error {
        ContextError::GroundingViolation { claims } => assert!(!claims.is_empty()),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.session_scope(&session).await.unwrap(), before);
}

#[tokio::test]
async fn test_model_failure_is_retried_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(
        "writer",
        vec![
            Step::Fail("upstream 503".to_string()),
            Step::Reply("Q3 revenue was $12M [F1].".to_string()),
        ],
    );
    let mut config = common::test_config(dir.path());
    config.retry.max_attempts = 3;
    config.retry.initial_backoff_ms = 1;
    config.retry.jitter = 0.0;

    let index = Arc::new(deck_context::index::EmbeddingIndex::new(
        config.index.clone(),
        Arc::new(deck_context::index::HashingEmbedder::new(384)),
    ));
    let memory = Arc::new(
        deck_context::memory::ContextMemory::open(config.memory.clone())
            .await
            .unwrap(),
    );
    let extractor = Arc::new(deck_context::facts::PatternExtractor::with_defaults().unwrap());
    let engine = deck_context::ContextEngine::assemble(
        config,
        index,
        memory,
        common::router_with(backend.clone()),
        extractor,
    )
    .unwrap();

    engine.ingest(revenue_document()).await.unwrap();
    let session = engine.start_session(None).await.unwrap();
    let block = engine
        .generate_block(outline(&session, "Q3 revenue"))
        .await
        .unwrap();

    assert_eq!(block.attempts, 2);
    assert_eq!(backend.calls(), 2);
    let log = engine.memory().audit_log().read(&session).await.unwrap();
    assert!(log.iter().any(|entry| matches!(
        &entry.event,
        MemoryEvent::RetryAttempted { attempt: 1, .. }
    )));
}

#[tokio::test]
async fn test_restored_session_continues_from_log() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::replying("writer", "Q3 revenue was $12M [F1].");
    let session;
    let emitted;
    {
        let engine = engine(dir.path(), backend.clone()).await;
        engine.ingest(revenue_document()).await.unwrap();
        session = engine.start_session(None).await.unwrap();
        engine
            .generate_block(outline(&session, "Q3 revenue"))
            .await
            .unwrap();
        emitted = engine.session_scope(&session).await.unwrap();
    }

    let engine = engine(dir.path(), backend).await;
    engine.restore_session(&session).await.unwrap();
    assert_eq!(engine.session_scope(&session).await.unwrap(), emitted);
}

#[tokio::test]
async fn test_figure_borrowed_from_another_metric_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::replying("writer", "Q3 profit was $12M.");
    let engine = engine(dir.path(), backend).await;
    engine.ingest(revenue_document()).await.unwrap();
    let session = engine.start_session(None).await.unwrap();
    let before = engine.session_scope(&session).await.unwrap();

    let failure = engine
        .generate_block(outline(&session, "Q3 revenue"))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, SynthesisStage::Validated);
    match &failure.error {
        ContextError::GroundingViolation { claims } => {
            assert!(claims.iter().any(|c| c.contains("profit")), "{:?}", claims)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.session_scope(&session).await.unwrap(), before);
}

#[tokio::test]
async fn test_output_without_supplied_facts_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::replying("writer", "Revenue doubled and margins hit record highs.");
    let engine = engine(dir.path(), backend).await;
    engine.ingest(revenue_document()).await.unwrap();
    let session = engine.start_session(None).await.unwrap();

    let failure = engine
        .generate_block(outline(&session, "Q3 revenue"))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, SynthesisStage::Validated);
    assert!(matches!(failure.error, ContextError::GroundingViolation { .. }));
    assert!(engine.session_scope(&session).await.unwrap().steps.is_empty());
}

#[tokio::test]
async fn test_topic_without_facts_never_reaches_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::replying("writer", "The launch slipped [F1].");
    let engine = engine(dir.path(), backend.clone()).await;
    engine
        .ingest(Document::new(
            "ops",
            "The launch timeline slipped by two weeks.",
            DocumentMetadata::new("Ops Memo", "internal_memo"),
        ))
        .await
        .unwrap();
    let session = engine.start_session(None).await.unwrap();

    let failure = engine
        .generate_block(outline(&session, "launch timeline"))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, SynthesisStage::ModelInvoked);
    assert!(matches!(failure.error, ContextError::GroundingViolation { .. }));
    assert_eq!(backend.calls(), 0);
}
