//! In-process fakes for the external collaborators.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use codelore::embedding::EmbeddingProvider;
use codelore::error::UpstreamError;
use codelore::github::{CommitSource, RepoSlug};
use codelore::llm::{LanguageModel, TokenStream};
use codelore::models::{CommitInfo, IndexedDocument, Project};
use codelore::store::{InMemoryStore, SemanticIndex};

pub const REPO_URL: &str = "https://github.com/acme/widgets";

pub fn day(n: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, n, 12, 0, 0).unwrap()
}

pub fn commit(hash: &str, date: DateTime<Utc>) -> CommitInfo {
    CommitInfo {
        hash: hash.to_string(),
        message: format!("change {}", hash),
        author_name: "Grace".to_string(),
        author_avatar_url: "https://avatars.example/grace.png".to_string(),
        date,
    }
}

pub fn project(id: &str, github_url: Option<&str>) -> Project {
    Project {
        id: id.to_string(),
        name: id.to_string(),
        github_url: github_url.map(str::to_string),
        created_at: Utc::now(),
    }
}

// ─── Commit source ──────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeSource {
    pub commits: Mutex<Vec<CommitInfo>>,
    pub failing_diffs: Mutex<HashSet<String>>,
    pub list_error: Mutex<Option<u16>>,
    pub list_calls: AtomicUsize,
    pub diff_calls: AtomicUsize,
}

impl FakeSource {
    pub fn with_commits(commits: Vec<CommitInfo>) -> Self {
        let source = Self::default();
        *source.commits.lock().unwrap() = commits;
        source
    }

    pub fn set_commits(&self, commits: Vec<CommitInfo>) {
        *self.commits.lock().unwrap() = commits;
    }

    pub fn fail_diff(&self, hash: &str) {
        self.failing_diffs.lock().unwrap().insert(hash.to_string());
    }

    pub fn heal_diffs(&self) {
        self.failing_diffs.lock().unwrap().clear();
    }

    pub fn fail_listing(&self, status: u16) {
        *self.list_error.lock().unwrap() = Some(status);
    }
}

#[async_trait]
impl CommitSource for FakeSource {
    async fn list_commits(&self, _repo: &RepoSlug) -> Result<Vec<CommitInfo>, UpstreamError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.list_error.lock().unwrap() {
            return Err(UpstreamError::from_status("GitHub", status, "nope".to_string()));
        }
        Ok(self.commits.lock().unwrap().clone())
    }

    async fn get_diff(&self, repo_url: &str, commit_hash: &str) -> Result<String, UpstreamError> {
        self.diff_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_diffs.lock().unwrap().contains(commit_hash) {
            return Err(UpstreamError::from_status("GitHub", 502, "bad gateway".to_string()));
        }
        Ok(format!("diff of {} at {}", commit_hash, repo_url))
    }
}

// ─── Language model ─────────────────────────────────────────────────

/// How a streamed completion ends after its tokens.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    Complete,
    FailMidStream,
    FailToStart,
    Hang,
}

pub struct FakeModel {
    pub tokens: Vec<String>,
    pub ending: Ending,
    pub summaries: AtomicUsize,
    pub completions: AtomicUsize,
    pub last_prompt: Mutex<Option<String>>,
    /// Commits whose diff the model refuses to summarise.
    pub failing_summaries: Mutex<HashSet<String>>,
    /// Set when a completion stream is dropped.
    pub stream_dropped: Arc<AtomicBool>,
}

impl FakeModel {
    pub fn new(tokens: &[&str], ending: Ending) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            ending,
            summaries: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
            failing_summaries: Mutex::new(HashSet::new()),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn summarizer() -> Self {
        Self::new(&[], Ending::Complete)
    }

    pub fn fail_summary(&self, hash: &str) {
        self.failing_summaries.lock().unwrap().insert(hash.to_string());
    }

    pub fn prompt(&self) -> String {
        self.last_prompt.lock().unwrap().clone().unwrap_or_default()
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LanguageModel for FakeModel {
    async fn complete(&self, prompt: &str) -> Result<TokenStream, UpstreamError> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(prompt.to_string());

        if self.ending == Ending::FailToStart {
            return Err(UpstreamError::from_status("language model", 503, "overloaded".into()));
        }

        let head = stream::iter(self.tokens.clone().into_iter().map(Ok));
        let tail: BoxStream<'static, Result<String, UpstreamError>> = match self.ending {
            Ending::FailMidStream => stream::once(async {
                Err(UpstreamError::malformed("language model", "connection reset"))
            })
            .boxed(),
            Ending::Hang => stream::pending().boxed(),
            _ => stream::empty().boxed(),
        };

        let guard = DropFlag(self.stream_dropped.clone());
        let tokens = head.chain(tail).map(move |item| {
            let _keep = &guard;
            item
        });
        Ok(Box::pin(tokens))
    }

    async fn summarize(&self, text: &str) -> Result<String, UpstreamError> {
        self.summaries.fetch_add(1, Ordering::SeqCst);
        // Diffs from FakeSource read "diff of <hash> at <url>".
        let refused = self
            .failing_summaries
            .lock()
            .unwrap()
            .iter()
            .any(|hash| text.starts_with(&format!("diff of {} ", hash)));
        if refused {
            return Err(UpstreamError::from_status("language model", 500, "model crashed".into()));
        }
        Ok(format!("summary: {}", text))
    }
}

// ─── Embedding provider ─────────────────────────────────────────────

pub struct FakeEmbedder {
    pub vectors: HashMap<String, Vec<f32>>,
    pub fallback: Vec<f32>,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn constant(vector: Vec<f32>) -> Self {
        Self {
            vectors: HashMap::new(),
            fallback: vector,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::constant(vec![0.0, 0.0])
        }
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake"
    }

    fn dims(&self) -> usize {
        self.fallback.len()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(UpstreamError::AuthExpired { service: "embedding provider" });
        }
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

// ─── Index seeding ──────────────────────────────────────────────────

pub async fn seed_doc(
    index: &dyn SemanticIndex,
    project_id: &str,
    name: &str,
    embedding: Option<Vec<f32>>,
) {
    index
        .upsert_document(&IndexedDocument {
            project_id: project_id.to_string(),
            source_unit_name: name.to_string(),
            raw_content: format!("// contents of {}", name),
            summary: format!("what {} does", name),
            embedding,
        })
        .await
        .unwrap();
}

pub fn memory_store_with(projects: &[Project]) -> Arc<InMemoryStore> {
    let store = InMemoryStore::new();
    for p in projects {
        store.insert_project(p.clone());
    }
    Arc::new(store)
}
