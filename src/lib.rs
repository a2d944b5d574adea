//! # ReplyHub
//!
//! Retrieval and human-handoff coordination for page-based customer
//! support bots.
//!
//! Each inbound customer message is answered by an LLM responder grounded
//! in the page's knowledge chunks, unless a human agent owns the
//! conversation. Agents claim and release customers through a
//! compare-and-swap state machine, and every change is pushed to the
//! tenant's connected dashboards.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌───────────┐
//! │  Ingest   │──▶│ DocumentStore│──▶│ Retrieval │──▶ Responder
//! │ text/URL  │   │   (SQLite)   │   │  Engine   │
//! └───────────┘   └──────────────┘   └───────────┘
//!                                           │
//!      ┌──────────────────┐         ┌───────▼──────┐     ┌──────────┐
//!      │ CustomerState    │◀───────▶│ Conversation │────▶│   Hub    │──▶ dashboards
//!      │ (versioned CAS)  │         │    Flow      │     │ (per-WS) │
//!      └──────────────────┘         └──────────────┘     └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the store traits |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`ingest`] | Split, embed and upsert knowledge |
//! | [`engine`] | Retrieval with deadline and degradation reporting |
//! | [`responder`] | LLM reply generation |
//! | [`cache`] | Tenant settings behind an injected cache |
//! | [`events`] | Dashboard event payloads |
//! | [`hub`] | Per-tenant connection registry |
//! | [`flow`] | Inbound message and agent action handling |
//! | [`server`] | HTTP and WebSocket server |

pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod events;
pub mod flow;
pub mod hub;
pub mod ingest;
pub mod migrate;
pub mod responder;
pub mod server;
pub mod sqlite_store;
