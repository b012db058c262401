//! Commit ingestion pipeline.
//!
//! One poll resolves the project's repository, lists its commits, keeps the
//! newest [`COMMIT_WINDOW`], drops those already in the ledger, summarises the
//! rest concurrently, and appends them to the ledger in a single batch.
//!
//! Per-commit failures (diff fetch, summarisation) never abort the poll; what
//! happens to the affected commit is governed by [`SummaryFailurePolicy`].

use anyhow::Result;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;

use crate::config::{Config, IngestConfig};
use crate::db;
use crate::error::{LoreError, UpstreamError};
use crate::github::{parse_repo_url, trim_repo_url, CommitSource, GitHubSource};
use crate::llm::{create_model, LanguageModel};
use crate::models::{Commit, CommitInfo};
use crate::store::{CommitLedger, ProjectStore, SqliteStore};

/// Number of most recent commits considered per poll.
pub const COMMIT_WINDOW: usize = 10;

/// What to do with a commit whose summary could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryFailurePolicy {
    /// Persist the commit with an empty summary. It is never retried.
    Blank,
    /// Leave the commit out of the ledger so the next poll retries it.
    Skip,
}

impl SummaryFailurePolicy {
    pub fn from_config(config: &IngestConfig) -> Self {
        match config.on_summary_failure.as_str() {
            "skip" => SummaryFailurePolicy::Skip,
            _ => SummaryFailurePolicy::Blank,
        }
    }
}

/// Outcome of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    /// Commits returned by the commit source.
    pub fetched: usize,
    /// Commits inside the window that were not yet in the ledger.
    pub unprocessed: usize,
    /// Rows actually written to the ledger.
    pub persisted: u64,
    pub blank_summaries: usize,
    pub skipped: usize,
}

pub struct CommitPipeline {
    projects: Arc<dyn ProjectStore>,
    ledger: Arc<dyn CommitLedger>,
    source: Arc<dyn CommitSource>,
    model: Arc<dyn LanguageModel>,
    policy: SummaryFailurePolicy,
    max_diff_chars: usize,
}

impl CommitPipeline {
    pub fn new(
        projects: Arc<dyn ProjectStore>,
        ledger: Arc<dyn CommitLedger>,
        source: Arc<dyn CommitSource>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let defaults = IngestConfig::default();
        Self {
            projects,
            ledger,
            source,
            model,
            policy: SummaryFailurePolicy::from_config(&defaults),
            max_diff_chars: defaults.max_diff_chars,
        }
    }

    pub fn with_policy(mut self, policy: SummaryFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_diff_chars(mut self, max_diff_chars: usize) -> Self {
        self.max_diff_chars = max_diff_chars;
        self
    }

    /// Builds a pipeline over the SQLite store with GitHub and the
    /// configured language model.
    pub fn from_config(config: &Config, store: Arc<SqliteStore>) -> Result<Self> {
        let source = Arc::new(GitHubSource::new(&config.github)?);
        let model = create_model(&config.llm)?;
        Ok(Self::new(store.clone(), store, source, model)
            .with_policy(SummaryFailurePolicy::from_config(&config.ingest))
            .with_max_diff_chars(config.ingest.max_diff_chars))
    }

    /// Ingests the newest unprocessed commits of a project.
    ///
    /// Fails without writing anything when the project is unknown, has no
    /// repository URL, has an undecomposable URL, or its commits cannot be
    /// listed. Summarisation failures are handled per commit.
    pub async fn poll_commits(&self, project_id: &str) -> Result<PollReport, LoreError> {
        let project = self
            .projects
            .get_project(project_id)
            .await?
            .ok_or_else(|| LoreError::ProjectNotFound(project_id.to_string()))?;

        let repo_url = project
            .github_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| LoreError::MissingRepository(project_id.to_string()))?;
        let slug = parse_repo_url(repo_url)?;
        let repo_url = trim_repo_url(repo_url);

        let mut listed = self
            .source
            .list_commits(&slug)
            .await
            .map_err(LoreError::CommitListing)?;
        let fetched = listed.len();

        // Stable: commits with equal dates keep upstream order.
        listed.sort_by(|a, b| b.date.cmp(&a.date));
        listed.truncate(COMMIT_WINDOW);

        let processed = self.ledger.processed_hashes(project_id).await?;
        let unprocessed: Vec<CommitInfo> = listed
            .into_iter()
            .filter(|c| !processed.contains(&c.hash))
            .collect();

        let mut report = PollReport {
            fetched,
            unprocessed: unprocessed.len(),
            ..Default::default()
        };

        if unprocessed.is_empty() {
            tracing::info!(project = project_id, repo = %slug, fetched, "no new commits");
            return Ok(report);
        }

        let outcomes = join_all(
            unprocessed
                .iter()
                .map(|commit| self.summarize_commit(repo_url, &commit.hash)),
        )
        .await;

        let mut batch = Vec::with_capacity(unprocessed.len());
        for (info, outcome) in unprocessed.iter().zip(outcomes) {
            match outcome {
                Ok(summary) => batch.push(Commit::from_info(project_id, info, summary)),
                Err(e) => match self.policy {
                    SummaryFailurePolicy::Blank => {
                        tracing::warn!(
                            project = project_id,
                            commit = %info.hash,
                            error = %e,
                            "summarization failed; storing blank summary"
                        );
                        report.blank_summaries += 1;
                        batch.push(Commit::from_info(project_id, info, String::new()));
                    }
                    SummaryFailurePolicy::Skip => {
                        tracing::warn!(
                            project = project_id,
                            commit = %info.hash,
                            error = %e,
                            "summarization failed; leaving commit for the next poll"
                        );
                        report.skipped += 1;
                    }
                },
            }
        }

        report.persisted = self.ledger.append_commits(&batch).await?;

        tracing::info!(
            project = project_id,
            repo = %slug,
            fetched = report.fetched,
            persisted = report.persisted,
            blank = report.blank_summaries,
            skipped = report.skipped,
            "poll complete"
        );

        Ok(report)
    }

    async fn summarize_commit(
        &self,
        repo_url: &str,
        commit_hash: &str,
    ) -> Result<String, UpstreamError> {
        let diff = self.source.get_diff(repo_url, commit_hash).await?;
        let diff = truncate_chars(diff, self.max_diff_chars);
        self.model.summarize(&diff).await
    }
}

/// Keeps at most `max_chars` characters of `text`.
fn truncate_chars(mut text: String, max_chars: usize) -> String {
    if let Some((byte_idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(byte_idx);
    }
    text
}

/// CLI entry point for `lore poll`.
pub async fn run_poll(config: &Config, project_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool));
    let pipeline = CommitPipeline::from_config(config, store)?;

    let report = pipeline.poll_commits(project_id).await?;

    println!("poll {}", project_id);
    println!("  fetched: {} commits", report.fetched);
    println!("  new in window: {}", report.unprocessed);
    println!("  persisted: {}", report.persisted);
    if report.blank_summaries > 0 {
        println!("  blank summaries: {}", report.blank_summaries);
    }
    if report.skipped > 0 {
        println!("  skipped (retry next poll): {}", report.skipped);
    }
    println!("ok");

    Ok(())
}
