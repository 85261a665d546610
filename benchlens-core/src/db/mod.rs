//! Database layer for benchlens
//!
//! This module provides the analytics store using SQLite with:
//! - Schema migrations
//! - Atomic per-type replacement of entity baselines
//! - Aggregate snapshots and the append-only sync log

pub mod repo;
pub mod schema;

pub use repo::Database;
