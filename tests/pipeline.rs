use std::path::Path;
use std::sync::{Arc, Mutex};

use pdfrag::context::ContextSettings;
use pdfrag::embedder::HashingEmbedder;
use pdfrag::{
    AppContext, ChunkerConfig, ConversationTurn, Embedder, IndexBackend, IndexEntry,
    LlmProvider, ProviderRequest, RagError, RagResult, VectorIndex,
};
use pretty_assertions::assert_eq;

const CORPUS: &str = "AI is intelligence. ML is a subset of AI. DL is a subset of ML.";

#[derive(Clone, Default)]
struct RecordingProvider {
    prompts: Arc<Mutex<Vec<String>>>,
}

impl LlmProvider for RecordingProvider {
    fn answer(&self, request: &ProviderRequest) -> RagResult<String> {
        let mut prompts = self.prompts.lock().expect("lock");
        prompts.push(request.prompt.to_string());
        Ok(format!("answer {}", prompts.len()))
    }

    fn model(&self) -> &str {
        "recording"
    }
}

fn settings(dir: &Path, backend: IndexBackend) -> ContextSettings {
    ContextSettings {
        chunker: ChunkerConfig::new(50, 10).expect("chunker config"),
        index_backend: backend,
        persist_dir: dir.to_path_buf(),
        ..ContextSettings::default()
    }
}

#[test]
fn question_retrieves_the_matching_sentence() {
    for backend in [IndexBackend::Flat, IndexBackend::Sqlite] {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = AppContext::initialize(&settings(dir.path(), backend)).expect("context");
        let report = context.ingest_text("ai.pdf", CORPUS).expect("ingest");
        assert!(report.chunk_count >= 1);

        let hits = context.similar("What is ML?", 1).expect("similar");
        assert_eq!(hits.len(), 1);
        assert!(
            hits[0].segment.text.contains("ML is a subset of AI."),
            "{backend}: {:?}",
            hits[0].segment.text
        );
    }
}

#[test]
fn follow_up_prompt_contains_first_exchange_verbatim() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = RecordingProvider::default();
    let context = AppContext::initialize(&settings(dir.path(), IndexBackend::Flat))
        .expect("context")
        .with_provider(Some(Box::new(provider.clone())));
    context.ingest_text("ai.pdf", CORPUS).expect("ingest");

    let first = context.chat("What is ML?", &[]).expect("first turn");
    assert_eq!(first.updated_turns.len(), 1);
    let second = context
        .chat("And what is DL?", &first.updated_turns)
        .expect("second turn");
    assert_eq!(
        second.updated_turns,
        vec![
            ConversationTurn::new("What is ML?", "answer 1"),
            ConversationTurn::new("And what is DL?", "answer 2"),
        ]
    );

    let prompts = provider.prompts.lock().expect("lock");
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("Conversation history"));
    assert!(prompts[1].contains("Q: What is ML?\nA: answer 1\n"));
    assert!(prompts[1].ends_with("Question: And what is DL?\n\nDetailed answer:"));
}

#[test]
fn empty_index_answers_from_no_context() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = RecordingProvider::default();
    let context = AppContext::initialize(&settings(dir.path(), IndexBackend::Flat))
        .expect("context")
        .with_provider(Some(Box::new(provider.clone())));
    let answer = context.ask("Anything indexed?", 4).expect("answer");
    assert!(answer.cited_segments.is_empty());
    let prompts = provider.prompts.lock().expect("lock");
    assert!(prompts[0].contains("(no relevant context was found)"));
}

#[test]
fn restart_restores_documents_for_both_backends() {
    for backend in [IndexBackend::Flat, IndexBackend::Sqlite] {
        let dir = tempfile::tempdir().expect("tempdir");
        let before = {
            let context =
                AppContext::initialize(&settings(dir.path(), backend)).expect("context");
            context.ingest_text("ai.pdf", CORPUS).expect("ingest");
            context.persist().expect("persist");
            context.similar("subset", 2).expect("similar")
        };
        let context = AppContext::initialize(&settings(dir.path(), backend)).expect("reopen");
        assert_eq!(context.status().expect("status").documents_count, 2);
        assert_eq!(context.similar("subset", 2).expect("similar"), before);
    }
}

#[test]
fn corrupt_snapshot_fails_start_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let context =
            AppContext::initialize(&settings(dir.path(), IndexBackend::Flat)).expect("context");
        context.ingest_text("ai.pdf", CORPUS).expect("ingest");
    }
    std::fs::write(dir.path().join("flat").join("index.bin"), b"garbage").expect("corrupt");
    let err = AppContext::initialize(&settings(dir.path(), IndexBackend::Flat))
        .err()
        .expect("start-up must fail");
    assert!(matches!(err, RagError::CorruptIndex { .. }), "{err}");
}

#[test]
fn top_k_is_a_prefix_of_top_k_plus_one() {
    let embedder = Embedder::Local(HashingEmbedder::new(128));
    let texts = [
        "rust ownership and borrowing",
        "borrow checker rules",
        "async runtimes schedule tasks",
        "tokio is an async runtime",
        "ownership moves values",
        "lifetimes annotate borrows",
    ];
    for backend in [IndexBackend::Flat, IndexBackend::Sqlite] {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = VectorIndex::new(backend, dir.path());
        let vectors = embedder.embed_batch(&texts).expect("embed");
        index
            .insert(
                vectors
                    .into_iter()
                    .zip(texts)
                    .enumerate()
                    .map(|(idx, (vector, text))| IndexEntry {
                        vector,
                        segment: pdfrag::Segment {
                            text: text.to_string(),
                            source: "notes.pdf".to_string(),
                            sequence_index: idx,
                            length: text.len(),
                            start_offset: 0,
                        },
                    })
                    .collect(),
            )
            .expect("insert");
        let query = embedder.embed_one("ownership borrow").expect("query");
        for k in 0..texts.len() {
            let shorter = index.query(&query, k, None).expect("k");
            let longer = index.query(&query, k + 1, None).expect("k+1");
            assert_eq!(shorter[..], longer[..k], "{backend} k={k}");
        }
    }
}
