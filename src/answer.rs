//! Retrieval-augmented question answering.
//!
//! [`Answerer::ask_question`] records usage, embeds the question, retrieves
//! the [`RETRIEVAL_LIMIT`] most similar indexed documents, and streams a
//! grounded answer from the language model.
//!
//! The answer is an [`AnswerStream`] fed by a spawned relay task through a
//! bounded channel. Dropping the stream closes the channel; the relay notices
//! and drops the upstream generation, which aborts the HTTP request.

use anyhow::Result;
use futures::stream::{Stream, StreamExt};
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::LoreError;
use crate::llm::{create_model, LanguageModel};
use crate::models::{FileReference, ScoredDocument};
use crate::store::{SemanticIndex, SqliteStore, UsageMeter};

/// Maximum number of documents placed in the context block.
pub const RETRIEVAL_LIMIT: usize = 10;

/// Fixed reply when retrieval finds nothing, and the reply the model is told
/// to give when the context is insufficient.
pub const NO_CONTEXT_ANSWER: &str = "I don't have enough context to answer your question.";

const RELAY_BUFFER: usize = 16;

/// One item of an answer stream. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerEvent {
    Delta(String),
    Done,
    Failed(String),
}

impl AnswerEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, AnswerEvent::Delta(_))
    }
}

/// Ordered answer fragments ending in exactly one terminal event.
pub struct AnswerStream {
    rx: mpsc::Receiver<AnswerEvent>,
    finished: bool,
}

impl AnswerStream {
    fn new(rx: mpsc::Receiver<AnswerEvent>) -> Self {
        Self {
            rx,
            finished: false,
        }
    }

    /// A stream that yields `text` once and completes.
    pub fn completed(text: &str) -> Self {
        let (tx, rx) = mpsc::channel(2);
        let _ = tx.try_send(AnswerEvent::Delta(text.to_string()));
        let _ = tx.try_send(AnswerEvent::Done);
        Self::new(rx)
    }

    pub async fn next_event(&mut self) -> Option<AnswerEvent> {
        self.next().await
    }

    /// Concatenates every fragment; a terminal failure becomes `Err`.
    pub async fn collect_text(mut self) -> Result<String, String> {
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event {
                AnswerEvent::Delta(fragment) => text.push_str(&fragment),
                AnswerEvent::Done => break,
                AnswerEvent::Failed(message) => return Err(message),
            }
        }
        Ok(text)
    }
}

impl Stream for AnswerStream {
    type Item = AnswerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                this.finished = event.is_terminal();
                Poll::Ready(Some(event))
            }
            // Sender gone without a terminal event: the relay task died.
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(AnswerEvent::Failed(
                    "answer generation ended unexpectedly".to_string(),
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A streamed answer with the documents it was grounded on, most similar first.
pub struct Answer {
    pub output: AnswerStream,
    pub references: Vec<FileReference>,
}

pub struct Answerer {
    usage: Arc<dyn UsageMeter>,
    index: Arc<dyn SemanticIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    model: Arc<dyn LanguageModel>,
}

impl Answerer {
    pub fn new(
        usage: Arc<dyn UsageMeter>,
        index: Arc<dyn SemanticIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            usage,
            index,
            embedder,
            model,
        }
    }

    /// Builds an answerer over the SQLite store with the configured
    /// embedding provider and language model.
    pub fn from_config(config: &Config, store: Arc<SqliteStore>) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let model = create_model(&config.llm)?;
        Ok(Self::new(store.clone(), store, embedder, model))
    }

    /// Answers `question` from the project's indexed documents.
    ///
    /// The question is counted against the project's usage before anything
    /// else, whether or not an answer can be produced. Usage, embedding, and
    /// retrieval failures are returned as `Err`; generation failures arrive
    /// as a terminal [`AnswerEvent::Failed`] on the stream.
    pub async fn ask_question(&self, question: &str, project_id: &str) -> Result<Answer, LoreError> {
        self.usage.record_question(project_id).await?;

        let embedding = self
            .embedder
            .embed(question)
            .await
            .map_err(LoreError::Embedding)?;

        let hits = self
            .index
            .query(project_id, &embedding, RETRIEVAL_LIMIT)
            .await?;

        if hits.is_empty() {
            tracing::info!(project = project_id, "no indexed context; returning fixed answer");
            return Ok(Answer {
                output: AnswerStream::completed(NO_CONTEXT_ANSWER),
                references: Vec::new(),
            });
        }

        tracing::debug!(
            project = project_id,
            hits = hits.len(),
            top = hits[0].similarity,
            "retrieved context"
        );

        let prompt = build_prompt(question, &hits);
        let references = hits.into_iter().map(FileReference::from).collect();

        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        tokio::spawn(relay(self.model.clone(), prompt, tx));

        Ok(Answer {
            output: AnswerStream::new(rx),
            references,
        })
    }
}

/// Forwards model output into the channel until completion, failure, or the
/// consumer dropping its end.
async fn relay(model: Arc<dyn LanguageModel>, prompt: String, tx: mpsc::Sender<AnswerEvent>) {
    let generation = async {
        let mut tokens = match model.complete(&prompt).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(error = %e, "failed to start generation");
                let _ = tx.send(AnswerEvent::Failed(e.to_string())).await;
                return;
            }
        };

        while let Some(item) = tokens.next().await {
            match item {
                Ok(fragment) => {
                    if tx.send(AnswerEvent::Delta(fragment)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "generation failed mid-stream");
                    let _ = tx.send(AnswerEvent::Failed(e.to_string())).await;
                    return;
                }
            }
        }

        let _ = tx.send(AnswerEvent::Done).await;
    };

    tokio::select! {
        _ = generation => {}
        _ = tx.closed() => {
            tracing::debug!("answer stream dropped; cancelling generation");
        }
    }
}

/// Assembles the grounded prompt: context entries in ranked order, then the
/// question, then the answering rules.
pub fn build_prompt(question: &str, context: &[ScoredDocument]) -> String {
    let mut block = String::new();
    for doc in context {
        block.push_str(&format!(
            "source: {}\ncode content: {}\nsummary of file: {}\n\n",
            doc.source_unit_name, doc.raw_content, doc.summary
        ));
    }

    format!(
        "You are an AI code assistant answering questions about a codebase for a \
technical audience that is new to it. You are knowledgeable, helpful and precise, \
and you explain step by step when the question is about code.\n\
\n\
START CONTEXT BLOCK\n\
{block}\
END OF CONTEXT BLOCK\n\
\n\
START QUESTION\n\
{question}\n\
END OF QUESTION\n\
\n\
Use only the CONTEXT BLOCK above to answer. If the context does not contain the \
answer, reply exactly: \"{fallback}\" Do not apologise for previous answers and do \
not invent anything that is not drawn directly from the context. Answer in markdown, \
including code snippets where they help.",
        block = block,
        question = question,
        fallback = NO_CONTEXT_ANSWER,
    )
}

/// CLI entry point for `lore ask`.
pub async fn run_ask(config: &Config, project_id: &str, question: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool));
    let answerer = Answerer::from_config(config, store)?;

    let Answer {
        mut output,
        references,
    } = answerer.ask_question(question, project_id).await?;

    let mut stdout = std::io::stdout();
    while let Some(event) = output.next_event().await {
        match event {
            AnswerEvent::Delta(fragment) => {
                write!(stdout, "{}", fragment)?;
                stdout.flush()?;
            }
            AnswerEvent::Done => break,
            AnswerEvent::Failed(message) => {
                println!();
                anyhow::bail!("answer generation failed: {}", message);
            }
        }
    }
    println!();

    if !references.is_empty() {
        println!();
        println!("references:");
        for (i, reference) in references.iter().enumerate() {
            println!("  {}. {}", i + 1, reference.source_unit_name);
        }
    }

    Ok(())
}
