//! # ReplyHub Core
//!
//! Shared, runtime-agnostic logic for ReplyHub: knowledge-chunk models,
//! channel visibility, similarity ranking, context assembly, chunking,
//! the store traits, and the customer handoff state machine.
//!
//! This crate contains no tokio, sqlx, network, or filesystem I/O. The
//! application crate supplies the SQLite store, remote embedding
//! providers, deadlines, and the real-time broadcast hub.
//!
//! ## Pipeline
//!
//! ```text
//! query ──▶ EmbeddingProvider ──▶ DocumentStore::query ──▶ rank ──▶ assemble ──▶ LLM
//!                                                           │
//!                                              adaptive threshold + fallback
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Chunks, channels, customer state, agents |
//! | [`embedding`] | Embedding trait, hash embedder, vector helpers |
//! | [`rank`] | Hybrid cosine/text scoring with adaptive threshold |
//! | [`context`] | Query-focused excerpts under a character budget |
//! | [`chunk`] | Paragraph-boundary chunker for ingestion |
//! | [`state`] | Pure customer-state transitions |
//! | [`handoff`] | CAS-driven state machine and agent assignment |
//! | [`store`] | Storage traits and the in-memory backend |
//! | [`error`] | Typed handoff errors |

pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod handoff;
pub mod models;
pub mod rank;
pub mod state;
pub mod store;
