//! # Chat Harvest
//!
//! Incremental backup of IDE chat sessions into a local SQLite store.
//!
//! Chat Harvest walks an editor's workspace storage, normalizes every chat
//! session it finds regardless of payload version, classifies it as
//! conversation, code edit or mixed, and upserts only what changed since
//! the last run. Per-workspace aggregates and hourly/daily activity
//! buckets are kept consistent with the sessions in the same transaction,
//! and every run leaves an append-only record behind.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────┐   ┌─────────────────┐
//! │ Workspace    │──▶│ Normalize → Classify │──▶│ SQLite          │
//! │ storage      │   │ → Fingerprint        │   │ sessions,       │
//! │ (read-only)  │   │ (parallel, blocking) │   │ aggregates,     │
//! └──────────────┘   └──────────────────────┘   │ backup_runs     │
//!                                               └────────┬────────┘
//!                                    ┌───────────────────┤
//!                                    ▼                   ▼
//!                              metrics readers     search indexer
//!                                                  (harvest export)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init                  # create the store
//! harvest sources               # check what would be read
//! harvest sync                  # back up new and changed sessions
//! harvest stats                 # summarize the store
//! harvest export -o units.json  # text units for an indexer
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Fatal errors and per-item issues |
//! | [`models`] | Core data types |
//! | [`source`] | Workspace storage reader |
//! | [`normalize`] | Payload shapes → canonical sessions |
//! | [`classify`] | Conversation / code edit / mixed |
//! | [`fingerprint`] | Change detection |
//! | [`store`] | Transactional store writer |
//! | [`sync`] | Run coordinator |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod fingerprint;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod source;
pub mod sources;
pub mod stats;
pub mod store;
pub mod sync;
