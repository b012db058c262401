//! SQLite-backed implementation of every storage trait.
//!
//! SQLite has no vector operator, so [`SemanticIndex::query`] loads only the
//! project's `(rowid, embedding)` pairs, ranks them exactly in Rust, then
//! reads content for the top `k` rows.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::LoreError;
use crate::models::{Commit, IndexedDocument, Project, ScoredDocument};

use super::{rank_by_similarity, CommitLedger, ProjectStore, SemanticIndex, UsageMeter};

/// SQLite implementation of the storage traits over a shared [`SqlitePool`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn project_from_row(row: &sqlx::sqlite::SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        name: row.get("name"),
        github_url: row.get("github_url"),
        created_at: from_ts(row.get("created_at")),
    }
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn create_project(
        &self,
        name: &str,
        github_url: Option<&str>,
    ) -> Result<Project, LoreError> {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            github_url: github_url.map(str::to_string),
            created_at: from_ts(Utc::now().timestamp()),
        };

        sqlx::query("INSERT INTO projects (id, name, github_url, created_at) VALUES (?, ?, ?, ?)")
            .bind(&project.id)
            .bind(&project.name)
            .bind(&project.github_url)
            .bind(project.created_at.timestamp())
            .execute(&self.pool)
            .await?;

        Ok(project)
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, LoreError> {
        let row = sqlx::query("SELECT id, name, github_url, created_at FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(project_from_row))
    }

    async fn list_projects(&self) -> Result<Vec<Project>, LoreError> {
        let rows = sqlx::query(
            "SELECT id, name, github_url, created_at FROM projects ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(project_from_row).collect())
    }
}

#[async_trait]
impl CommitLedger for SqliteStore {
    async fn processed_hashes(&self, project_id: &str) -> Result<HashSet<String>, LoreError> {
        let hashes: Vec<String> =
            sqlx::query_scalar("SELECT commit_hash FROM commits WHERE project_id = ?")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(hashes.into_iter().collect())
    }

    async fn append_commits(&self, commits: &[Commit]) -> Result<u64, LoreError> {
        if commits.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for commit in commits {
            let result = sqlx::query(
                r#"
                INSERT INTO commits (id, project_id, commit_hash, message, author_name,
                                     author_avatar_url, commit_date, summary, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(project_id, commit_hash) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&commit.project_id)
            .bind(&commit.commit_hash)
            .bind(&commit.message)
            .bind(&commit.author_name)
            .bind(&commit.author_avatar_url)
            .bind(commit.date.timestamp())
            .bind(&commit.summary)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        // Dropping the transaction on an earlier `?` rolls the batch back.
        tx.commit().await?;
        Ok(written)
    }

    async fn list_commits(
        &self,
        project_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Commit>, LoreError> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT project_id, commit_hash, message, author_name, author_avatar_url,
                   commit_date, summary
            FROM commits
            WHERE project_id = ?
            ORDER BY commit_date DESC, commit_hash ASC
            LIMIT ?
            "#,
        )
        .bind(project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Commit {
                project_id: row.get("project_id"),
                commit_hash: row.get("commit_hash"),
                message: row.get("message"),
                author_name: row.get("author_name"),
                author_avatar_url: row.get("author_avatar_url"),
                date: from_ts(row.get("commit_date")),
                summary: row.get("summary"),
            })
            .collect())
    }
}

#[async_trait]
impl SemanticIndex for SqliteStore {
    async fn query(
        &self,
        project_id: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredDocument>, LoreError> {
        let rows = sqlx::query(
            r#"
            SELECT rowid AS row_id, embedding
            FROM source_code_embeddings
            WHERE project_id = ? AND embedding IS NOT NULL
            ORDER BY rowid
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let vectors: Vec<(i64, Vec<f32>)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                (row.get("row_id"), blob_to_vec(&blob))
            })
            .collect();

        let ranked = rank_by_similarity(vectors, embedding, k)?;
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        // Content is loaded for the winners only.
        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT rowid AS row_id, source_unit_name, raw_content, summary \
             FROM source_code_embeddings WHERE rowid IN (",
        );
        let mut ids = builder.separated(", ");
        for (rowid, _) in &ranked {
            ids.push_bind(*rowid);
        }
        ids.push_unseparated(")");
        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut by_rowid: HashMap<i64, sqlx::sqlite::SqliteRow> = rows
            .into_iter()
            .map(|row| (row.get("row_id"), row))
            .collect();

        Ok(ranked
            .into_iter()
            .filter_map(|(rowid, similarity)| {
                let row = by_rowid.remove(&rowid)?;
                Some(ScoredDocument {
                    source_unit_name: row.get("source_unit_name"),
                    raw_content: row.get("raw_content"),
                    summary: row.get("summary"),
                    similarity,
                })
            })
            .collect())
    }

    async fn upsert_document(&self, doc: &IndexedDocument) -> Result<(), LoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(vector) = &doc.embedding {
            let existing: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT dims FROM source_code_embeddings
                WHERE project_id = ? AND source_unit_name != ? AND dims IS NOT NULL
                LIMIT 1
                "#,
            )
            .bind(&doc.project_id)
            .bind(&doc.source_unit_name)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(dims) = existing {
                if dims as usize != vector.len() {
                    return Err(LoreError::DimensionMismatch {
                        expected: dims as usize,
                        actual: vector.len(),
                    });
                }
            }
        }

        sqlx::query(
            r#"
            INSERT INTO source_code_embeddings (id, project_id, source_unit_name, raw_content,
                                                summary, embedding, dims, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project_id, source_unit_name) DO UPDATE SET
                raw_content = excluded.raw_content,
                summary = excluded.summary,
                embedding = excluded.embedding,
                dims = excluded.dims,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&doc.project_id)
        .bind(&doc.source_unit_name)
        .bind(&doc.raw_content)
        .bind(&doc.summary)
        .bind(doc.embedding.as_deref().map(vec_to_blob))
        .bind(doc.embedding.as_ref().map(|v| v.len() as i64))
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl UsageMeter for SqliteStore {
    async fn record_question(&self, project_id: &str) -> Result<(), LoreError> {
        sqlx::query("INSERT INTO usage (id, project_id, api_requests, created_at) VALUES (?, ?, 1, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(project_id)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn requests_since(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, LoreError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(api_requests), 0) FROM usage WHERE project_id = ? AND created_at >= ?",
        )
        .bind(project_id)
        .bind(since.timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }
}
