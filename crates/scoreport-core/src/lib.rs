//! # scoreport core
//!
//! Storage-agnostic logic for scoreport: the canonical score model, the
//! converter contract, the conversion failure taxonomy, the collaborator
//! traits (catalog, orphan store, user locks, score store), and the two
//! drivers built on top of them: the import [`Orchestrator`](import::Orchestrator)
//! and the orphan [`Reconciler`](reconcile::Reconciler).
//!
//! This crate contains no SQL, filesystem I/O, or async runtime. Every
//! collaborator has an in-memory implementation in [`store::memory`] so
//! the pipeline can be exercised end to end in unit tests.
//!
//! ```text
//!  RecordSource ──▶ Orchestrator ──▶ Converter ──▶ Catalog
//!                       │                │
//!                       │     ┌──────────┼───────────────┐
//!                       ▼     ▼          ▼               ▼
//!                  UserLocks  commit   skip (log)   OrphanStore
//!                             │                          │
//!                             ▼                          │
//!                  ScoreStore + PersonalBestMerge ◀── Reconciler
//! ```

pub mod convert;
pub mod dedup;
pub mod failure;
pub mod import;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod score_utils;
pub mod source;
pub mod store;
