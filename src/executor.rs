//! Per-request query execution.
//!
//! A [`QueryExecutor`] is a short-lived value orchestrating one
//! `(plan, bind-vars, tx)` request against the engine's pools, policy gate,
//! consolidator and row cache. Dispatch is one-shot by plan id:
//!
//! - DDL runs under an implicit transaction and notifies the schema
//!   registry afterwards.
//! - In-transaction DMLs run on the pinned connection and schedule
//!   commit-time cache invalidation through dirty keys.
//! - Out-of-transaction reads consolidate identical statements and read
//!   through the primary-key row cache.
//! - Out-of-transaction DMLs run under an implicit transaction when
//!   auto-commit is enabled.

mod core;
mod rowbuild;

pub use self::core::QueryExecutor;
pub use self::rowbuild::{apply_filter, apply_filter_with_pk_defaults, validate_row};
