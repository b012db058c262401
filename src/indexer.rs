//! Write side of the semantic index.
//!
//! A source unit is stored with its raw content and a summary; the summary
//! is what gets embedded and compared against questions.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{LoreError, UpstreamError};
use crate::models::IndexedDocument;
use crate::store::{SemanticIndex, SqliteStore};

/// Embeds `summary` and upserts the document.
///
/// With the embedding provider disabled the document is stored without a
/// vector and stays invisible to retrieval until re-indexed.
pub async fn index_source_unit(
    index: &dyn SemanticIndex,
    embedder: &dyn EmbeddingProvider,
    project_id: &str,
    source_unit_name: &str,
    raw_content: &str,
    summary: &str,
) -> Result<IndexedDocument, LoreError> {
    let embedding = match embedder.embed(summary).await {
        Ok(vector) => Some(vector),
        Err(UpstreamError::Disabled { .. }) => {
            tracing::warn!(
                source = source_unit_name,
                "embedding provider disabled; storing document without a vector"
            );
            None
        }
        Err(e) => return Err(LoreError::Embedding(e)),
    };

    let doc = IndexedDocument {
        project_id: project_id.to_string(),
        source_unit_name: source_unit_name.to_string(),
        raw_content: raw_content.to_string(),
        summary: summary.to_string(),
        embedding,
    };
    index.upsert_document(&doc).await?;
    Ok(doc)
}

/// CLI entry point for `lore index put`.
pub async fn run_index_put(
    config: &Config,
    project_id: &str,
    path: &Path,
    summary: &str,
) -> Result<()> {
    let raw_content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read source file: {}", path.display()))?;
    let source_unit_name = path.to_string_lossy();

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let embedder: Arc<dyn EmbeddingProvider> = create_provider(&config.embedding)?;

    let doc = index_source_unit(
        &store,
        embedder.as_ref(),
        project_id,
        &source_unit_name,
        &raw_content,
        summary,
    )
    .await?;

    println!("index put {}", doc.source_unit_name);
    println!("  project: {}", project_id);
    println!("  content: {} bytes", doc.raw_content.len());
    match &doc.embedding {
        Some(vector) => println!("  embedding: {} dims ({})", vector.len(), embedder.model_name()),
        None => println!("  embedding: none (provider disabled)"),
    }
    println!("ok");

    Ok(())
}
