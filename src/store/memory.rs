//! In-memory store implementing every storage trait.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Vector search is the
//! same brute-force ranking the SQLite store uses. Nothing is persisted.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::LoreError;
use crate::models::{Commit, IndexedDocument, Project, ScoredDocument, UsageEvent};

use super::{rank_by_similarity, CommitLedger, ProjectStore, SemanticIndex, UsageMeter};

/// In-memory store for tests and throwaway runs.
pub struct InMemoryStore {
    projects: RwLock<HashMap<String, Project>>,
    // Keyed by (project_id, commit_hash).
    commits: RwLock<HashMap<(String, String), Commit>>,
    documents: RwLock<Vec<IndexedDocument>>,
    usage: RwLock<Vec<UsageEvent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            commits: RwLock::new(HashMap::new()),
            documents: RwLock::new(Vec::new()),
            usage: RwLock::new(Vec::new()),
        }
    }

    /// Registers a project under a caller-chosen id.
    pub fn insert_project(&self, project: Project) {
        self.projects
            .write()
            .unwrap()
            .insert(project.id.clone(), project);
    }

    /// All usage events recorded so far.
    pub fn usage_events(&self) -> Vec<UsageEvent> {
        self.usage.read().unwrap().clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectStore for InMemoryStore {
    async fn create_project(
        &self,
        name: &str,
        github_url: Option<&str>,
    ) -> Result<Project, LoreError> {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            github_url: github_url.map(str::to_string),
            created_at: Utc::now(),
        };
        self.insert_project(project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, LoreError> {
        Ok(self.projects.read().unwrap().get(id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, LoreError> {
        let mut projects: Vec<Project> = self.projects.read().unwrap().values().cloned().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(projects)
    }
}

#[async_trait]
impl CommitLedger for InMemoryStore {
    async fn processed_hashes(&self, project_id: &str) -> Result<HashSet<String>, LoreError> {
        Ok(self
            .commits
            .read()
            .unwrap()
            .keys()
            .filter(|(pid, _)| pid == project_id)
            .map(|(_, hash)| hash.clone())
            .collect())
    }

    async fn append_commits(&self, commits: &[Commit]) -> Result<u64, LoreError> {
        // One write guard for the whole batch keeps it atomic.
        let mut stored = self.commits.write().unwrap();
        let mut written = 0u64;
        for commit in commits {
            let key = (commit.project_id.clone(), commit.commit_hash.clone());
            if let std::collections::hash_map::Entry::Vacant(slot) = stored.entry(key) {
                slot.insert(commit.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn list_commits(
        &self,
        project_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Commit>, LoreError> {
        let mut commits: Vec<Commit> = self
            .commits
            .read()
            .unwrap()
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect();
        commits.sort_by(|a, b| b.date.cmp(&a.date).then(a.commit_hash.cmp(&b.commit_hash)));
        if let Some(limit) = limit {
            commits.truncate(limit);
        }
        Ok(commits)
    }
}

#[async_trait]
impl SemanticIndex for InMemoryStore {
    async fn query(
        &self,
        project_id: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredDocument>, LoreError> {
        let documents = self.documents.read().unwrap();
        let rows: Vec<(&IndexedDocument, Vec<f32>)> = documents
            .iter()
            .filter(|d| d.project_id == project_id)
            .filter_map(|d| d.embedding.as_ref().map(|e| (d, e.clone())))
            .collect();

        Ok(rank_by_similarity(rows, embedding, k)?
            .into_iter()
            .map(|(d, similarity)| ScoredDocument {
                source_unit_name: d.source_unit_name.clone(),
                raw_content: d.raw_content.clone(),
                summary: d.summary.clone(),
                similarity,
            })
            .collect())
    }

    async fn upsert_document(&self, doc: &IndexedDocument) -> Result<(), LoreError> {
        let mut documents = self.documents.write().unwrap();

        if let Some(new_vec) = &doc.embedding {
            let existing = documents.iter().find(|d| {
                d.project_id == doc.project_id
                    && d.source_unit_name != doc.source_unit_name
                    && d.embedding.is_some()
            });
            if let Some(other) = existing.and_then(|d| d.embedding.as_ref()) {
                if other.len() != new_vec.len() {
                    return Err(LoreError::DimensionMismatch {
                        expected: other.len(),
                        actual: new_vec.len(),
                    });
                }
            }
        }

        match documents.iter_mut().find(|d| {
            d.project_id == doc.project_id && d.source_unit_name == doc.source_unit_name
        }) {
            Some(slot) => *slot = doc.clone(),
            None => documents.push(doc.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl UsageMeter for InMemoryStore {
    async fn record_question(&self, project_id: &str) -> Result<(), LoreError> {
        self.usage.write().unwrap().push(UsageEvent {
            project_id: project_id.to_string(),
            request_count: 1,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn requests_since(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, LoreError> {
        Ok(self
            .usage
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.project_id == project_id && e.timestamp >= since)
            .map(|e| e.request_count)
            .sum())
    }
}
