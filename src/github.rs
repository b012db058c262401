//! Commit source abstraction and the GitHub implementation.
//!
//! [`CommitSource`] is the only view the ingestion pipeline has of the
//! source-control host: list a repository's recent commits, and fetch one
//! commit's unified diff.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::config::GithubConfig;
use crate::error::{LoreError, UpstreamError};
use crate::models::CommitInfo;

const SERVICE: &str = "GitHub";

/// `owner/repo` pair decomposed from a repository URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
    pub owner: String,
    pub repo: String,
}

impl std::fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Strips surrounding whitespace, trailing `/` and a `.git` suffix.
pub fn trim_repo_url(url: &str) -> &str {
    let trimmed = url.trim().trim_end_matches('/');
    trimmed.strip_suffix(".git").unwrap_or(trimmed)
}

/// Takes the last two path segments of a repository URL as `owner/repo`.
///
/// A trailing `/` and a `.git` suffix are ignored, so
/// `https://github.com/rust-lang/cargo.git/` resolves to `rust-lang/cargo`.
pub fn parse_repo_url(url: &str) -> Result<RepoSlug, LoreError> {
    let trimmed = trim_repo_url(url);

    let mut segments = trimmed.rsplit('/');
    let repo = segments.next().unwrap_or_default();
    let owner = segments.next().unwrap_or_default();

    if owner.is_empty() || repo.is_empty() || owner.ends_with(':') {
        return Err(LoreError::InvalidRepositoryUrl(url.to_string()));
    }

    Ok(RepoSlug {
        owner: owner.to_string(),
        repo: repo.to_string(),
    })
}

/// Lists commits and fetches diffs from a source-control host.
#[async_trait]
pub trait CommitSource: Send + Sync {
    /// Recent commits of the repository, in no guaranteed order.
    async fn list_commits(&self, repo: &RepoSlug) -> Result<Vec<CommitInfo>, UpstreamError>;

    /// Unified diff of one commit.
    async fn get_diff(&self, repo_url: &str, commit_hash: &str) -> Result<String, UpstreamError>;
}

/// [`CommitSource`] backed by the GitHub REST API.
pub struct GitHubSource {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
    per_page: u32,
}

impl GitHubSource {
    /// Builds the client. A missing token is allowed (public repositories,
    /// lower rate limit) and logged.
    pub fn new(config: &GithubConfig) -> anyhow::Result<Self> {
        let token = std::env::var(&config.token_env).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            tracing::warn!(
                env = %config.token_env,
                "no GitHub token set; using unauthenticated requests"
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("codelore/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token,
            per_page: config.per_page,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl CommitSource for GitHubSource {
    async fn list_commits(&self, repo: &RepoSlug) -> Result<Vec<CommitInfo>, UpstreamError> {
        let url = format!(
            "{}/repos/{}/{}/commits?per_page={}",
            self.api_base, repo.owner, repo.repo, self.per_page
        );

        let response = self
            .authorize(self.client.get(&url))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| UpstreamError::transport(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status.as_u16(), body));
        }

        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::transport(SERVICE, e))?;
        parse_commit_list(&body)
    }

    async fn get_diff(&self, repo_url: &str, commit_hash: &str) -> Result<String, UpstreamError> {
        let url = format!(
            "{}/commit/{}.diff",
            repo_url.trim_end_matches('/'),
            commit_hash
        );

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github.v3.diff")
            .send()
            .await
            .map_err(|e| UpstreamError::transport(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status.as_u16(), body));
        }

        response
            .text()
            .await
            .map_err(|e| UpstreamError::transport(SERVICE, e))
    }
}

// ============ Response parsing ============

#[derive(Deserialize)]
struct ApiCommit {
    sha: String,
    commit: ApiCommitDetail,
    author: Option<ApiUser>,
}

#[derive(Deserialize)]
struct ApiCommitDetail {
    message: Option<String>,
    author: Option<ApiGitAuthor>,
}

#[derive(Deserialize)]
struct ApiGitAuthor {
    name: Option<String>,
    date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ApiUser {
    avatar_url: Option<String>,
}

/// Parses the `GET /repos/{owner}/{repo}/commits` payload.
///
/// A commit without an author date is rejected: the pipeline orders by date
/// and cannot place it.
fn parse_commit_list(body: &str) -> Result<Vec<CommitInfo>, UpstreamError> {
    let commits: Vec<ApiCommit> =
        serde_json::from_str(body).map_err(|e| UpstreamError::malformed(SERVICE, e.to_string()))?;

    commits
        .into_iter()
        .map(|c| {
            let git_author = c.commit.author;
            let date = git_author
                .as_ref()
                .and_then(|a| a.date)
                .ok_or_else(|| {
                    UpstreamError::malformed(SERVICE, format!("commit {} has no author date", c.sha))
                })?;
            Ok(CommitInfo {
                message: c.commit.message.unwrap_or_default(),
                author_name: git_author.and_then(|a| a.name).unwrap_or_default(),
                author_avatar_url: c.author.and_then(|u| u.avatar_url).unwrap_or_default(),
                date,
                hash: c.sha,
            })
        })
        .collect()
}
