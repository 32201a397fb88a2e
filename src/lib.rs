//! # scoreport
//!
//! Score normalization and orphan retry for rhythm-game score imports.
//!
//! Raw play records arrive in source-specific formats (an IR push, a JSON
//! export). Each record is converted into a canonical score against a
//! reference catalog of songs and charts, deduplicated, and committed, or
//! classified as a failure. Records that refer to charts the catalog does
//! not know yet are kept as *orphans* and retried later, once the catalog
//! catches up.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ FileSource  │──▶│ Orchestrator │──▶│    SQLite     │
//! │ JSON/JSONL  │   │ (per user)   │   │ scores + PBs  │
//! └─────────────┘   └──────┬───────┘   │ orphan_scores │
//!                          │ not found │ import_locks  │
//!                          ▼           └───────▲───────┘
//!                   ┌──────────────┐           │
//!                   │  Reconciler  │───────────┘
//!                   └──────────────┘
//! ```
//!
//! The storage-agnostic pieces (model, converter contract, orchestrator,
//! reconciler) live in `scoreport-core`; this crate adds configuration,
//! logging, the SQLite backend, the concrete converters, and the CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! scoreport init
//! scoreport import ir/fervidex plays.jsonl --user 1 \
//!     --context '{"version": "27", "timeReceived": 1625142600000}'
//! scoreport orphans list
//! scoreport orphans reconcile
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | Catalog, scores, PBs, blacklist |
//! | [`sqlite_orphans`] | Orphan store |
//! | [`sqlite_locks`] | Per-user locks |
//! | [`converters`] | Built-in converter registry |
//! | [`sources`] | File record sources |
//! | [`ingest`] | Import runs (inline and background) |
//! | [`reconcile_cmd`] | Orphan, blacklist, and lock commands |
//! | [`progress`] | Import progress rendering |
//! | [`stats`] | Database statistics |

pub mod config;
pub mod converter_fervidex;
pub mod converter_mer;
pub mod converters;
pub mod db;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod progress;
pub mod reconcile_cmd;
pub mod sources;
pub mod sqlite_locks;
pub mod sqlite_orphans;
pub mod sqlite_store;
pub mod stats;

pub use scoreport_core as core;
