use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates every table and index. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            github_url TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The UNIQUE constraint is the only guard against two concurrent polls
    // persisting the same commit.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS commits (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            commit_hash TEXT NOT NULL,
            message TEXT NOT NULL,
            author_name TEXT NOT NULL,
            author_avatar_url TEXT NOT NULL,
            commit_date INTEGER NOT NULL,
            summary TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(project_id, commit_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_code_embeddings (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            source_unit_name TEXT NOT NULL,
            raw_content TEXT NOT NULL,
            summary TEXT NOT NULL,
            embedding BLOB,
            dims INTEGER,
            updated_at INTEGER NOT NULL,
            UNIQUE(project_id, source_unit_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            api_requests INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_commits_project_date ON commits(project_id, commit_date DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embeddings_project ON source_code_embeddings(project_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_usage_project_created ON usage(project_id, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
