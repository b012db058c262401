//! Storage abstraction for the ingestion and answering engine.
//!
//! Four narrow traits describe the only storage contracts the engine relies
//! on, so the pipeline and the answerer can run against SQLite in production
//! and against [`memory::InMemoryStore`] in tests.
//!
//! | Trait | Used by | Purpose |
//! |-------|---------|---------|
//! | [`ProjectStore`] | pipeline, CLI | resolve a project's repository URL |
//! | [`CommitLedger`] | pipeline | dedup lookup and batch append of processed commits |
//! | [`SemanticIndex`] | answerer, indexer | nearest-neighbour query over summary embeddings |
//! | [`UsageMeter`] | answerer | one event per question asked |
//!
//! Implementations provide atomic single-row and batch operations but no
//! isolation across calls. The ledger must reject a second row for the same
//! `(project_id, commit_hash)` by itself.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::embedding::cosine_similarity;
use crate::error::LoreError;
use crate::models::{Commit, IndexedDocument, Project, ScoredDocument};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create_project(&self, name: &str, github_url: Option<&str>)
        -> Result<Project, LoreError>;

    async fn get_project(&self, id: &str) -> Result<Option<Project>, LoreError>;

    async fn list_projects(&self) -> Result<Vec<Project>, LoreError>;
}

#[async_trait]
pub trait CommitLedger: Send + Sync {
    /// Hashes of every commit already recorded for the project.
    async fn processed_hashes(&self, project_id: &str) -> Result<HashSet<String>, LoreError>;

    /// Appends a batch atomically. Commits whose `(project_id, commit_hash)`
    /// is already present are ignored. Returns the number of rows written.
    async fn append_commits(&self, commits: &[Commit]) -> Result<u64, LoreError>;

    /// Commit log for a project, newest first.
    async fn list_commits(
        &self,
        project_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Commit>, LoreError>;
}

#[async_trait]
pub trait SemanticIndex: Send + Sync {
    /// Returns at most `k` of the project's embedded rows, most similar first.
    async fn query(
        &self,
        project_id: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredDocument>, LoreError>;

    /// Inserts or replaces the row keyed by `(project_id, source_unit_name)`.
    async fn upsert_document(&self, doc: &IndexedDocument) -> Result<(), LoreError>;
}

#[async_trait]
pub trait UsageMeter: Send + Sync {
    async fn record_question(&self, project_id: &str) -> Result<(), LoreError>;

    /// Sum of recorded requests at or after `since`.
    async fn requests_since(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, LoreError>;
}

/// Scores `(key, embedding)` pairs against the query and keeps the `k` most
/// similar, returning each key with its score.
///
/// The sort is stable, so rows with identical scores keep storage order and
/// rows with different scores are never swapped. A row whose score is not a
/// finite number (a corrupt vector) is left out of the result.
pub(crate) fn rank_by_similarity<K>(
    rows: Vec<(K, Vec<f32>)>,
    query: &[f32],
    k: usize,
) -> Result<Vec<(K, f64)>, LoreError> {
    if let Some((_, embedding)) = rows.iter().find(|(_, e)| e.len() != query.len()) {
        return Err(LoreError::DimensionMismatch {
            expected: embedding.len(),
            actual: query.len(),
        });
    }

    let total = rows.len();
    let mut scored: Vec<(K, f64)> = rows
        .into_iter()
        .map(|(key, embedding)| (key, cosine_similarity(query, &embedding)))
        .filter(|(_, score)| score.is_finite())
        .collect();
    if scored.len() < total {
        tracing::warn!(
            skipped = total - scored.len(),
            "ignoring embeddings with non-finite similarity"
        );
    }

    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);
    Ok(scored)
}
