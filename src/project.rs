//! Project registration, commit log, and usage reporting commands.

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::config::Config;
use crate::db;
use crate::error::LoreError;
use crate::github::parse_repo_url;
use crate::store::{CommitLedger, ProjectStore, SqliteStore, UsageMeter};

/// Default usage window in days.
pub const USAGE_WINDOW_DAYS: i64 = 30;

/// Questions asked against a project over the last `days` days.
pub async fn recent_usage(
    meter: &dyn UsageMeter,
    project_id: &str,
    days: i64,
) -> Result<i64, LoreError> {
    let since = Utc::now() - Duration::days(days);
    meter.requests_since(project_id, since).await
}

pub async fn run_project_add(config: &Config, url: &str, name: Option<&str>) -> Result<()> {
    // Reject URLs the pipeline could never poll.
    let slug = parse_repo_url(url)?;
    let name = name.map(str::to_string).unwrap_or_else(|| slug.repo.clone());

    let store = SqliteStore::new(db::connect(config).await?);
    let project = store.create_project(&name, Some(url)).await?;

    println!("project add {}", slug);
    println!("  id: {}", project.id);
    println!("  name: {}", project.name);
    println!("ok");
    Ok(())
}

pub async fn run_project_list(config: &Config) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let projects = store.list_projects().await?;

    if projects.is_empty() {
        println!("No projects registered. Use `lore project add <url>`.");
        return Ok(());
    }

    println!("{:<38} {:<20} REPOSITORY", "ID", "NAME");
    for p in &projects {
        println!(
            "{:<38} {:<20} {}",
            p.id,
            p.name,
            p.github_url.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn run_commits(config: &Config, project_id: &str, limit: Option<usize>) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    if store.get_project(project_id).await?.is_none() {
        return Err(LoreError::ProjectNotFound(project_id.to_string()).into());
    }

    let commits = store.list_commits(project_id, limit).await?;
    if commits.is_empty() {
        println!("No commits recorded. Run `lore poll {}`.", project_id);
        return Ok(());
    }

    for c in &commits {
        let short = c.commit_hash.get(..7).unwrap_or(&c.commit_hash);
        let subject = c.message.lines().next().unwrap_or("");
        println!(
            "{} {} {} ({})",
            short,
            c.date.format("%Y-%m-%d"),
            subject,
            c.author_name
        );
        match c.summary.as_deref() {
            Some(summary) if !summary.is_empty() => {
                for line in summary.lines() {
                    println!("    {}", line);
                }
            }
            _ => println!("    (no summary)"),
        }
    }
    Ok(())
}

pub async fn run_usage(config: &Config, project_id: &str, days: i64) -> Result<()> {
    if days <= 0 {
        anyhow::bail!("--days must be > 0");
    }
    let store = SqliteStore::new(db::connect(config).await?);
    let total = recent_usage(&store, project_id, days).await?;

    println!("usage {}", project_id);
    println!("  window: {} days", days);
    println!("  questions: {}", total);
    Ok(())
}
