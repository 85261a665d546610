//! # benchlens-core
//!
//! Core library for benchlens - benchmarked insights for marketplace entities.
//!
//! This library provides:
//! - Domain types for baselines, aggregates, dashboard periods and insight records
//! - Database storage layer with SQLite
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Data flows through two paths that meet in the analytics store:
//! - **Sync:** bulk query results are organized per entity, aggregated into a
//!   platform snapshot and written atomically per entity type
//! - **Generation:** current-period metrics are compared against the stored
//!   baseline and snapshot, sent to an insight collaborator, validated and
//!   tallied into an insight record
//!
//! ## Example
//!
//! ```rust,no_run
//! use benchlens_core::{Config, Database, SyncCoordinator, QueryResults};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let config = Config::load().expect("failed to load config");
//!
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let input = QueryResults::load(Path::new("buyer_overview.json")).expect("failed to read input");
//! let coordinator = SyncCoordinator::new(Arc::new(db), config);
//! let result = coordinator.sync_entity_type(&input).expect("sync failed");
//! println!("{} entities synced", result.entities);
//! ```

// Re-export commonly used items at the crate root
pub use cache::AggregateCache;
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use pipeline::{GenerationJob, GenerationOutcome, InsightPipeline};
pub use sync::{SyncCoordinator, TypeSyncResult};
pub use types::*;

// Public modules
pub mod aggregate;
pub mod benchmark;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod insights;
pub mod logging;
pub mod organizer;
pub mod pipeline;
pub mod sync;
pub mod types;
