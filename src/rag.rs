//! Retrieval-augmented generation over the vector index.
//!
//! One request walks `received -> embedded -> retrieved -> prompted -> generated`
//! and ends in `done` or `failed`. Nothing is retried; the first failing stage
//! ends the request with the originating error.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embedder::Embedder;
use crate::error::{RagError, RagResult};
use crate::index::{QueryResult, VectorIndex};
use crate::providers::{LlmProvider, ProviderRequest};

/// Segments retrieved per question unless the caller asks otherwise.
pub const DEFAULT_TOP_K: usize = 4;
/// Prior turns folded into the prompt.
pub const MAX_HISTORY_TURNS: usize = 3;

const INSTRUCTION: &str = "Use the following context to answer the question. If the answer cannot be found in the context, say that you don't know; do not try to make up an answer.";
const NO_CONTEXT_INSTRUCTION: &str = "No relevant context was found for this question. Reply that you do not have enough information to answer it; do not try to make up an answer.";
const NO_CONTEXT: &str = "(no relevant context was found)";

/// One question/answer exchange, owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// User question.
    pub question: String,
    /// Generated answer.
    pub answer: String,
}

impl ConversationTurn {
    /// Convenience constructor.
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// Request lifecycle stage, recorded in trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Question accepted.
    Received,
    /// Question vector computed.
    Embedded,
    /// Nearest segments fetched.
    Retrieved,
    /// Prompt assembled.
    Prompted,
    /// Model answered.
    Generated,
    /// Answer returned to the caller.
    Done,
    /// A stage failed.
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Embedded => "embedded",
            Self::Retrieved => "retrieved",
            Self::Prompted => "prompted",
            Self::Generated => "generated",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Turns a question into its query vector.
pub trait QuestionEmbedder: Send + Sync {
    /// Embeds `question` with the same model that embedded the indexed segments.
    fn embed_question(&self, question: &str) -> RagResult<Vec<f32>>;
}

impl QuestionEmbedder for Embedder {
    fn embed_question(&self, question: &str) -> RagResult<Vec<f32>> {
        self.embed_one(question)
    }
}

/// Sampling parameters forwarded to the generation model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token ceiling.
    pub max_tokens: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1000,
        }
    }
}

/// Output of the retrieval half of a request.
#[derive(Debug, Clone)]
pub struct PreparedPrompt {
    /// Question as asked.
    pub question: String,
    /// Rendered prompt text.
    pub prompt: String,
    /// Segments placed in the prompt, nearest first.
    pub cited_segments: QueryResult,
    /// Every turn the caller supplied, uncapped.
    pub prior_turns: Vec<ConversationTurn>,
}

/// Final result of a request.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    /// Model answer.
    pub answer: String,
    /// Segments the answer was conditioned on.
    pub cited_segments: QueryResult,
    /// Prior turns followed by this exchange.
    pub updated_turns: Vec<ConversationTurn>,
}

/// Borrowing view over the pipeline components for one request.
pub struct RagGenerator<'a> {
    embedder: &'a dyn QuestionEmbedder,
    index: &'a VectorIndex,
    provider: Option<&'a dyn LlmProvider>,
    sampling: SamplingParams,
}

impl<'a> RagGenerator<'a> {
    /// Generator without a generation model; only [`RagGenerator::prepare`] succeeds.
    pub fn new(embedder: &'a dyn QuestionEmbedder, index: &'a VectorIndex) -> Self {
        Self {
            embedder,
            index,
            provider: None,
            sampling: SamplingParams::default(),
        }
    }

    /// Attaches the generation model.
    pub fn with_provider(mut self, provider: Option<&'a dyn LlmProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Overrides the sampling parameters.
    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Embeds the question, retrieves `k` segments and renders the prompt.
    pub fn prepare(
        &self,
        question: &str,
        history: &[ConversationTurn],
        k: usize,
    ) -> RagResult<PreparedPrompt> {
        let question = question.trim();
        if question.is_empty() {
            return Err(failed(
                Stage::Received,
                RagError::InvalidInput("question must not be empty".to_string()),
            ));
        }
        debug!(stage = %Stage::Received, k, history = history.len(), "rag request");

        let vector = self
            .embedder
            .embed_question(question)
            .map_err(|err| failed(Stage::Embedded, RagError::EmbeddingFailure(Box::new(err))))?;
        debug!(stage = %Stage::Embedded, dimension = vector.len());

        let cited_segments =
            retrieve(self.index, &vector, k).map_err(|err| failed(Stage::Retrieved, err))?;
        debug!(stage = %Stage::Retrieved, hits = cited_segments.len());

        let prompt = build_prompt(question, &cited_segments, recent_turns(history));
        debug!(stage = %Stage::Prompted, prompt_chars = prompt.len());

        Ok(PreparedPrompt {
            question: question.to_string(),
            prompt,
            cited_segments,
            prior_turns: history.to_vec(),
        })
    }

    /// Sends a prepared prompt to the generation model.
    pub fn generate(&self, prepared: PreparedPrompt) -> RagResult<Answer> {
        let provider = self.provider.ok_or_else(|| {
            failed(
                Stage::Generated,
                RagError::Configuration(
                    "answer generation is disabled: no API key for the generation provider"
                        .to_string(),
                ),
            )
        })?;
        let request = ProviderRequest {
            prompt: &prepared.prompt,
            temperature: self.sampling.temperature,
            max_tokens: self.sampling.max_tokens,
        };
        let answer = provider.answer(&request).map_err(|err| {
            failed(Stage::Generated, RagError::GenerationFailure(Box::new(err)))
        })?;
        debug!(stage = %Stage::Generated, model = provider.model(), answer_chars = answer.len());

        let mut updated_turns = prepared.prior_turns;
        updated_turns.push(ConversationTurn::new(prepared.question, answer.clone()));
        debug!(stage = %Stage::Done, turns = updated_turns.len());
        Ok(Answer {
            answer,
            cited_segments: prepared.cited_segments,
            updated_turns,
        })
    }

    /// Full request: [`RagGenerator::prepare`] then [`RagGenerator::generate`].
    pub fn answer(
        &self,
        question: &str,
        history: &[ConversationTurn],
        k: usize,
    ) -> RagResult<Answer> {
        let prepared = self.prepare(question, history, k)?;
        self.generate(prepared)
    }
}

fn failed(stage: Stage, err: RagError) -> RagError {
    debug!(stage = %Stage::Failed, failed_at = %stage, error = %err);
    err
}

/// Top-`k` lookup that treats a missing or empty index as "no context".
pub fn retrieve(index: &VectorIndex, vector: &[f32], k: usize) -> RagResult<QueryResult> {
    if !index.is_initialized() || index.count() == 0 {
        return Ok(Vec::new());
    }
    index.query(vector, k, None)
}

fn recent_turns(history: &[ConversationTurn]) -> &[ConversationTurn] {
    &history[history.len().saturating_sub(MAX_HISTORY_TURNS)..]
}

/// Renders the fixed prompt template.
pub fn build_prompt(
    question: &str,
    segments: &QueryResult,
    history: &[ConversationTurn],
) -> String {
    let mut prompt = String::new();
    if segments.is_empty() {
        prompt.push_str(NO_CONTEXT_INSTRUCTION);
    } else {
        prompt.push_str(INSTRUCTION);
    }
    prompt.push_str("\n\nContext:\n");
    prompt.push_str(&render_context(segments));
    prompt.push_str("\n\n");
    if !history.is_empty() {
        prompt.push_str("Conversation history:\n");
        for turn in history {
            prompt.push_str(&format!("Q: {}\nA: {}\n", turn.question, turn.answer));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!("Question: {question}\n\nDetailed answer:"));
    prompt
}

fn render_context(segments: &QueryResult) -> String {
    if segments.is_empty() {
        return NO_CONTEXT.to_string();
    }
    segments
        .iter()
        .enumerate()
        .map(|(idx, hit)| {
            format!(
                "[{}] (source: {}, chunk {})\n{}",
                idx + 1,
                hit.segment.source,
                hit.segment.sequence_index,
                hit.segment.text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Segment;
    use crate::embedder::HashingEmbedder;
    use crate::index::{IndexBackend, IndexEntry, ScoredSegment};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct Fixed(Vec<f32>);

    impl QuestionEmbedder for Fixed {
        fn embed_question(&self, _question: &str) -> RagResult<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    impl QuestionEmbedder for Broken {
        fn embed_question(&self, _question: &str) -> RagResult<Vec<f32>> {
            Err(RagError::Provider("connection refused".to_string()))
        }
    }

    #[derive(Default)]
    struct Recording {
        prompts: Mutex<Vec<String>>,
    }

    impl LlmProvider for Recording {
        fn answer(&self, request: &ProviderRequest) -> RagResult<String> {
            let mut prompts = self.prompts.lock().expect("lock");
            prompts.push(request.prompt.to_string());
            Ok(format!("answer {}", prompts.len()))
        }

        fn model(&self) -> &str {
            "recording"
        }
    }

    struct Failing;

    impl LlmProvider for Failing {
        fn answer(&self, _request: &ProviderRequest) -> RagResult<String> {
            Err(RagError::Provider("rate limited".to_string()))
        }

        fn model(&self) -> &str {
            "failing"
        }
    }

    fn segment(source: &str, idx: usize, text: &str) -> Segment {
        Segment {
            text: text.to_string(),
            source: source.to_string(),
            sequence_index: idx,
            length: text.chars().count(),
            start_offset: 0,
        }
    }

    fn index_with(entries: Vec<(Vec<f32>, Segment)>) -> VectorIndex {
        let mut index = VectorIndex::new(IndexBackend::Flat, "unused");
        index
            .insert(
                entries
                    .into_iter()
                    .map(|(vector, segment)| IndexEntry { vector, segment })
                    .collect(),
            )
            .expect("insert");
        index
    }

    #[test]
    fn prompt_lists_context_history_and_question() {
        let hits = vec![
            ScoredSegment {
                segment: segment("a.pdf", 2, "Rust is a language."),
                distance: 0.1,
            },
            ScoredSegment {
                segment: segment("b.pdf", 0, "Cargo builds crates."),
                distance: 0.4,
            },
        ];
        let history = vec![ConversationTurn::new("What is Rust?", "A language.")];
        let prompt = build_prompt("Who builds crates?", &hits, &history);
        assert_eq!(
            prompt,
            "Use the following context to answer the question. If the answer cannot be found in the context, say that you don't know; do not try to make up an answer.\n\n\
             Context:\n\
             [1] (source: a.pdf, chunk 2)\nRust is a language.\n\n\
             [2] (source: b.pdf, chunk 0)\nCargo builds crates.\n\n\
             Conversation history:\nQ: What is Rust?\nA: A language.\n\n\
             Question: Who builds crates?\n\nDetailed answer:"
        );
    }

    #[test]
    fn empty_context_asks_model_to_admit_ignorance() {
        let prompt = build_prompt("Anything?", &Vec::new(), &[]);
        assert!(prompt.starts_with(NO_CONTEXT_INSTRUCTION));
        assert!(prompt.contains("Context:\n(no relevant context was found)\n\nQuestion: Anything?"));
        assert!(!prompt.contains("Conversation history"));
    }

    #[test]
    fn uninitialised_index_yields_empty_retrieval() {
        let index = VectorIndex::new(IndexBackend::Flat, "unused");
        let embedder = Fixed(vec![1.0, 0.0]);
        let prepared = RagGenerator::new(&embedder, &index)
            .prepare("What is ML?", &[], DEFAULT_TOP_K)
            .expect("prepare");
        assert!(prepared.cited_segments.is_empty());
        assert!(prepared.prompt.contains(NO_CONTEXT));
    }

    #[test]
    fn history_is_capped_to_recent_turns() {
        let index = index_with(vec![(vec![1.0, 0.0], segment("a.pdf", 0, "alpha"))]);
        let embedder = Fixed(vec![1.0, 0.0]);
        let history: Vec<_> = (1..=5)
            .map(|n| ConversationTurn::new(format!("q{n}"), format!("a{n}")))
            .collect();
        let prepared = RagGenerator::new(&embedder, &index)
            .prepare("next", &history, 1)
            .expect("prepare");
        assert!(!prepared.prompt.contains("Q: q2\n"));
        assert!(prepared.prompt.contains("Q: q3\nA: a3\nQ: q4\nA: a4\nQ: q5\nA: a5\n"));
        assert_eq!(prepared.prior_turns.len(), 5);
    }

    #[test]
    fn answer_appends_turn_and_cites_segments() {
        let index = index_with(vec![
            (vec![1.0, 0.0], segment("a.pdf", 0, "alpha")),
            (vec![0.0, 1.0], segment("a.pdf", 1, "beta")),
        ]);
        let embedder = Fixed(vec![0.0, 1.0]);
        let provider = Recording::default();
        let history = vec![ConversationTurn::new("first?", "first!")];
        let answer = RagGenerator::new(&embedder, &index)
            .with_provider(Some(&provider))
            .answer("second?", &history, 1)
            .expect("answer");
        assert_eq!(answer.answer, "answer 1");
        assert_eq!(answer.cited_segments.len(), 1);
        assert_eq!(answer.cited_segments[0].segment.text, "beta");
        assert_eq!(
            answer.updated_turns,
            vec![
                ConversationTurn::new("first?", "first!"),
                ConversationTurn::new("second?", "answer 1"),
            ]
        );
        let prompts = provider.prompts.lock().expect("lock");
        assert!(prompts[0].contains("Q: first?\nA: first!"));
    }

    #[test]
    fn failures_are_wrapped_per_stage() {
        let index = VectorIndex::new(IndexBackend::Flat, "unused");
        let err = RagGenerator::new(&Broken, &index)
            .prepare("q", &[], 4)
            .expect_err("embedding fails");
        assert!(matches!(err, RagError::EmbeddingFailure(_)));
        assert!(err.to_string().contains("connection refused"), "{err}");

        let embedder = Fixed(vec![1.0]);
        let err = RagGenerator::new(&embedder, &index)
            .with_provider(Some(&Failing))
            .answer("q", &[], 4)
            .expect_err("generation fails");
        assert!(matches!(err, RagError::GenerationFailure(_)));

        let err = RagGenerator::new(&embedder, &index)
            .answer("q", &[], 4)
            .expect_err("no provider");
        assert!(matches!(err, RagError::Configuration(_)));

        let err = RagGenerator::new(&embedder, &index)
            .prepare("   ", &[], 4)
            .expect_err("blank question");
        assert!(err.is_client_error());
    }

    #[test]
    fn embedder_implements_question_embedding() {
        let embedder = Embedder::Local(HashingEmbedder::new(8));
        let vector = embedder.embed_question("hello").expect("embed");
        assert_eq!(vector.len(), 8);
    }
}
