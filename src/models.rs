//! Core data models shared by the ingestion and answering paths.
//!
//! All records are flat and keyed by `(project_id, natural key)`; nothing here
//! is ever mutated in place or garbage-collected.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A registered project. The engine only reads `id` and `github_url`.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub github_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A commit as reported by the upstream commit source.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
    pub author_name: String,
    pub author_avatar_url: String,
    pub date: DateTime<Utc>,
}

/// A processed commit stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Commit {
    pub project_id: String,
    pub commit_hash: String,
    pub message: String,
    pub author_name: String,
    pub author_avatar_url: String,
    pub date: DateTime<Utc>,
    pub summary: Option<String>,
}

impl Commit {
    pub fn from_info(project_id: &str, info: &CommitInfo, summary: String) -> Self {
        Self {
            project_id: project_id.to_string(),
            commit_hash: info.hash.clone(),
            message: info.message.clone(),
            author_name: info.author_name.clone(),
            author_avatar_url: info.author_avatar_url.clone(),
            date: info.date,
            summary: Some(summary),
        }
    }
}

/// One row of the semantic index: a source unit (usually a file) with its
/// summary and the embedding of that summary.
#[derive(Debug, Clone)]
pub struct IndexedDocument {
    pub project_id: String,
    pub source_unit_name: String,
    pub raw_content: String,
    pub summary: String,
    pub embedding: Option<Vec<f32>>,
}

/// A retrieval hit with its similarity to the query (`1 - cosine distance`).
#[derive(Debug, Clone, Serialize)]
pub struct ScoredDocument {
    pub source_unit_name: String,
    pub raw_content: String,
    pub summary: String,
    pub similarity: f64,
}

/// Reference returned alongside an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReference {
    pub source_unit_name: String,
    pub raw_content: String,
    pub summary: String,
}

impl From<ScoredDocument> for FileReference {
    fn from(doc: ScoredDocument) -> Self {
        Self {
            source_unit_name: doc.source_unit_name,
            raw_content: doc.raw_content,
            summary: doc.summary,
        }
    }
}

/// One question asked against a project.
#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub project_id: String,
    pub request_count: i64,
    pub timestamp: DateTime<Utc>,
}
