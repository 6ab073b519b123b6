//! # vault-rag
//!
//! Retrieval-augmented question answering over an Obsidian-style vault of
//! Markdown notes. The retrieval pipeline itself lives in
//! [`vault_rag_core`]; this crate supplies storage, providers and the
//! command-line and HTTP surfaces.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────┐
//! │    Vault    │──▶│   Ingestor   │──▶│   SQLite    │
//! │  Markdown   │   │ Chunk+Embed  │   │ FTS5+Vec   │
//! └─────────────┘   └──────────────┘   └─────┬──────┘
//!                                            │
//!                     ┌──────────────────────┤
//!                     ▼                      ▼
//!               ┌────────────┐        ┌────────────┐
//!               │  Pipeline  │──LLM──▶│ CLI / HTTP │
//!               │ retrieve → │        │  (vrag)    │
//!               │ rank → ask │        └────────────┘
//!               └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_index`] | SQLite implementation of the index traits |
//! | [`vault`] | Vault scanning and note parsing |
//! | [`ingest`] | Ingestion pipeline |
//! | [`embedding`] | HTTP embedding providers |
//! | [`llm`] | Streaming LLM providers |
//! | [`orchestrator`] | Per-request stage machine, timeouts, cancellation |
//! | [`search`], [`ask`], [`stats`] | CLI commands |
//! | [`server`] | HTTP API |
//! | [`logging`] | Tracing setup |

pub mod ask;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod orchestrator;
pub mod search;
pub mod server;
pub mod sqlite_index;
pub mod stats;
pub mod vault;
