//! # codelore
//!
//! Ingests a project's recent git commits with model-written summaries, and
//! answers questions about its code from an embedding index of source files.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ CommitSource │──▶│   Pipeline   │──▶│ Commit ledger │
//! │   (GitHub)   │   │ diff→summary │   │   (SQLite)    │
//! └──────────────┘   └──────────────┘   └───────────────┘
//!
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ question │──▶│  Embedding   │──▶│ Semantic     │──▶│ LanguageModel│──▶ AnswerStream
//! └──────────┘   │  provider    │   │ index (k=10) │   │  (streamed)  │
//!                └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lore init
//! lore project add https://github.com/owner/repo
//! lore poll <project-id>
//! lore index put <project-id> src/main.rs --summary "CLI entry point"
//! lore ask <project-id> "Where is the CLI parsed?"
//! lore serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Upstream and engine error taxonomy |
//! | [`store`] | Storage traits, SQLite and in-memory stores |
//! | [`github`] | Commit source (GitHub REST) |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Language model abstraction (streamed and one-shot) |
//! | [`ingest`] | Commit ingestion pipeline |
//! | [`indexer`] | Semantic index write path |
//! | [`answer`] | Retrieval-augmented answering |
//! | [`project`] | Project, commit log and usage commands |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod github;
pub mod indexer;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod project;
pub mod server;
pub mod store;
