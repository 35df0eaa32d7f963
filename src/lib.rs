//! # Session RAG
//!
//! Session-scoped document question answering.
//!
//! A user opens a session, uploads PDF, DOCX or plain-text documents, and
//! asks questions answered by a hosted LLM from the most similar chunks of
//! those documents only. Every session has its own file area and its own
//! vector collection; nothing is shared between sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────┐   ┌────────────────┐
//! │ SessionStore │──▶│ IngestionPipeline │──▶│ EmbeddingIndexer│
//! │ files/index  │   │ extract + chunk   │   │ embed + persist │
//! └──────────────┘   └───────────────────┘   └───────┬────────┘
//!                                                    │ SQLite / session
//!                    ┌───────────┐   ┌───────────────┴┐   ┌────────────┐
//!   query ─────────▶ │ Retriever │──▶│ PromptAssembler │──▶│ Generation │
//!                    └───────────┘   └────────────────┘   └────────────┘
//! ```
//!
//! [`orchestrator::QueryOrchestrator`] drives both flows and the session
//! state machine; the CLI (`srag`), the HTTP server and the benchmark runner
//! sit on top of it.
//!
//! ## Quick Start
//!
//! ```bash
//! srag session new                      # prints a session id
//! srag ingest <id> report.pdf notes.md
//! srag ask <id> "What does the report conclude?" --sources
//! srag serve                            # HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors per stage |
//! | [`session`] | Session lifecycle, layout and locking |
//! | [`extract`] | PDF / DOCX / text extraction |
//! | [`chunk`] | Overlapping boundary-aware chunking |
//! | [`ingest`] | Ingestion pipeline |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Per-session SQLite vector collection |
//! | [`indexer`] | Embedding and persistence |
//! | [`retrieve`] | Similarity search |
//! | [`prompt`] | Prompt assembly |
//! | [`generation`] | Model catalog and chat completions client |
//! | [`orchestrator`] | End-to-end ingest and query |
//! | [`bench`] | Single-document benchmark runner |
//! | [`server`] | HTTP API |

pub mod bench;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod indexer;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod retrieve;
pub mod server;
pub mod session;
pub mod store;
