//! Retrieval-augmented answering against the in-memory store and fake
//! collaborators.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use codelore::answer::{AnswerEvent, Answerer, NO_CONTEXT_ANSWER, RETRIEVAL_LIMIT};
use codelore::error::{LoreError, UpstreamError};
use codelore::store::InMemoryStore;

use common::{seed_doc, Ending, FakeEmbedder, FakeModel};

fn answerer(
    store: &Arc<InMemoryStore>,
    embedder: FakeEmbedder,
    model: &Arc<FakeModel>,
) -> Answerer {
    Answerer::new(store.clone(), store.clone(), Arc::new(embedder), model.clone())
}

async fn seed_abc(store: &InMemoryStore) {
    // Against a query of [1, 0]: B scores 1.0, C ~0.707, A 0.0.
    seed_doc(store, "p", "A", Some(vec![0.0, 1.0])).await;
    seed_doc(store, "p", "B", Some(vec![1.0, 0.0])).await;
    seed_doc(store, "p", "C", Some(vec![1.0, 1.0])).await;
}

#[tokio::test]
async fn test_empty_index_returns_fixed_answer_without_generation() {
    let store = Arc::new(InMemoryStore::new());
    let model = Arc::new(FakeModel::new(&["unused"], Ending::Complete));
    let answerer = answerer(&store, FakeEmbedder::constant(vec![1.0, 0.0]), &model);

    let answer = answerer.ask_question("What does X do?", "p").await.unwrap();

    assert!(answer.references.is_empty());
    assert_eq!(answer.output.collect_text().await.unwrap(), NO_CONTEXT_ANSWER);
    assert_eq!(model.completions.load(Ordering::SeqCst), 0);
    assert_eq!(store.usage_events().len(), 1);
}

#[tokio::test]
async fn test_unembedded_rows_do_not_count_as_context() {
    let store = Arc::new(InMemoryStore::new());
    seed_doc(store.as_ref(), "p", "pending.rs", None).await;
    seed_doc(store.as_ref(), "other", "elsewhere.rs", Some(vec![1.0, 0.0])).await;
    let model = Arc::new(FakeModel::new(&["unused"], Ending::Complete));
    let answerer = answerer(&store, FakeEmbedder::constant(vec![1.0, 0.0]), &model);

    let answer = answerer.ask_question("anything?", "p").await.unwrap();
    assert!(answer.references.is_empty());
    assert_eq!(answer.output.collect_text().await.unwrap(), NO_CONTEXT_ANSWER);
}

#[tokio::test]
async fn test_references_and_prompt_follow_similarity_order() {
    let store = Arc::new(InMemoryStore::new());
    seed_abc(&store).await;
    let model = Arc::new(FakeModel::new(&["B ", "handles ", "it."], Ending::Complete));
    let answerer = answerer(&store, FakeEmbedder::constant(vec![1.0, 0.0]), &model);

    let answer = answerer.ask_question("Who handles it?", "p").await.unwrap();

    let names: Vec<&str> = answer
        .references
        .iter()
        .map(|r| r.source_unit_name.as_str())
        .collect();
    assert_eq!(names, vec!["B", "C", "A"]);
    assert_eq!(answer.references[0].raw_content, "// contents of B");
    assert_eq!(answer.references[0].summary, "what B does");

    assert_eq!(answer.output.collect_text().await.unwrap(), "B handles it.");

    let prompt = model.prompt();
    let b = prompt.find("source: B").unwrap();
    let c = prompt.find("source: C").unwrap();
    let a = prompt.find("source: A").unwrap();
    assert!(b < c && c < a);
    assert!(prompt.contains("Who handles it?"));
}

#[tokio::test]
async fn test_retrieval_is_bounded() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..(RETRIEVAL_LIMIT + 5) {
        seed_doc(store.as_ref(), "p", &format!("f{}.rs", i), Some(vec![1.0, i as f32])).await;
    }
    let model = Arc::new(FakeModel::new(&["ok"], Ending::Complete));
    let answerer = answerer(&store, FakeEmbedder::constant(vec![1.0, 0.0]), &model);

    let answer = answerer.ask_question("q", "p").await.unwrap();
    assert_eq!(answer.references.len(), RETRIEVAL_LIMIT);
    assert_eq!(answer.references[0].source_unit_name, "f0.rs");
}

#[tokio::test]
async fn test_fragments_arrive_in_order_then_done() {
    let store = Arc::new(InMemoryStore::new());
    seed_abc(&store).await;
    let model = Arc::new(FakeModel::new(&["one", "two", "three"], Ending::Complete));
    let answerer = answerer(&store, FakeEmbedder::constant(vec![1.0, 0.0]), &model);

    let mut output = answerer.ask_question("q", "p").await.unwrap().output;
    let mut events = Vec::new();
    while let Some(event) = output.next_event().await {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            AnswerEvent::Delta("one".into()),
            AnswerEvent::Delta("two".into()),
            AnswerEvent::Delta("three".into()),
            AnswerEvent::Done,
        ]
    );
}

#[tokio::test]
async fn test_mid_stream_failure_ends_with_failed() {
    let store = Arc::new(InMemoryStore::new());
    seed_abc(&store).await;
    let model = Arc::new(FakeModel::new(&["partial"], Ending::FailMidStream));
    let answerer = answerer(&store, FakeEmbedder::constant(vec![1.0, 0.0]), &model);

    let mut output = answerer.ask_question("q", "p").await.unwrap().output;
    assert_eq!(output.next_event().await, Some(AnswerEvent::Delta("partial".into())));
    match output.next_event().await {
        Some(AnswerEvent::Failed(message)) => assert!(message.contains("connection reset")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(output.next_event().await, None);
}

#[tokio::test]
async fn test_generation_failure_still_counts_usage() {
    let store = Arc::new(InMemoryStore::new());
    seed_abc(&store).await;
    let model = Arc::new(FakeModel::new(&[], Ending::FailToStart));
    let answerer = answerer(&store, FakeEmbedder::constant(vec![1.0, 0.0]), &model);

    let answer = answerer.ask_question("q", "p").await.unwrap();
    assert_eq!(answer.references.len(), 3);
    let err = answer.output.collect_text().await.unwrap_err();
    assert!(err.contains("503"));
    assert_eq!(store.usage_events().len(), 1);
}

#[tokio::test]
async fn test_every_question_is_metered_once() {
    let store = Arc::new(InMemoryStore::new());
    let model = Arc::new(FakeModel::new(&["fine"], Ending::Complete));
    let answerer = answerer(&store, FakeEmbedder::constant(vec![1.0, 0.0]), &model);

    // Empty context, then a successful answer.
    answerer.ask_question("first", "p").await.unwrap();
    seed_abc(&store).await;
    let answer = answerer.ask_question("second", "p").await.unwrap();
    answer.output.collect_text().await.unwrap();

    let events = store.usage_events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.project_id == "p" && e.request_count == 1));
}

#[tokio::test]
async fn test_embedding_failure_is_an_error_after_usage() {
    let store = Arc::new(InMemoryStore::new());
    seed_abc(&store).await;
    let model = Arc::new(FakeModel::new(&["unused"], Ending::Complete));
    let answerer = answerer(&store, FakeEmbedder::failing(), &model);

    let err = match answerer.ask_question("q", "p").await {
        Ok(_) => panic!("expected embedding failure"),
        Err(e) => e,
    };
    assert!(matches!(
        err,
        LoreError::Embedding(UpstreamError::AuthExpired { .. })
    ));
    assert_eq!(store.usage_events().len(), 1);
    assert_eq!(model.completions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_query_dimension_mismatch() {
    let store = Arc::new(InMemoryStore::new());
    seed_abc(&store).await;
    let model = Arc::new(FakeModel::new(&["unused"], Ending::Complete));
    let answerer = answerer(&store, FakeEmbedder::constant(vec![1.0, 0.0, 0.0]), &model);

    let result = answerer.ask_question("q", "p").await;
    assert!(matches!(result, Err(LoreError::DimensionMismatch { .. })));
}

#[tokio::test]
async fn test_dropping_the_stream_cancels_generation() {
    let store = Arc::new(InMemoryStore::new());
    seed_abc(&store).await;
    let model = Arc::new(FakeModel::new(&["first"], Ending::Hang));
    let answerer = answerer(&store, FakeEmbedder::constant(vec![1.0, 0.0]), &model);

    let mut output = answerer.ask_question("q", "p").await.unwrap().output;
    assert_eq!(output.next_event().await, Some(AnswerEvent::Delta("first".into())));
    assert!(!model.stream_dropped.load(Ordering::SeqCst));

    drop(output);

    let cancelled = tokio::time::timeout(Duration::from_secs(2), async {
        while !model.stream_dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(cancelled.is_ok(), "generation kept running after the stream was dropped");
}
