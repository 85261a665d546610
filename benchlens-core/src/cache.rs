//! Aggregate cache
//!
//! Session-scoped memoization in front of [`Database::get_aggregate`]. The
//! cache is an explicit object handed to the generation pipeline; its
//! lifetime is the session. There is no TTL: a newer snapshot becomes visible
//! only after [`AggregateCache::clear`] or in a new cache.
//!
//! Missing snapshots are not cached, so a sync that lands mid-session is
//! picked up by the next lookup for that type.

use crate::db::Database;
use crate::error::Result;
use crate::types::AggregateSnapshot;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

pub struct AggregateCache {
    db: Arc<Database>,
    entries: RwLock<HashMap<String, Arc<AggregateSnapshot>>>,
    store_reads: AtomicUsize,
}

impl AggregateCache {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            entries: RwLock::new(HashMap::new()),
            store_reads: AtomicUsize::new(0),
        }
    }

    /// Snapshot for `entity_type`, reading the store at most once per type
    /// while the snapshot exists.
    pub fn get(&self, entity_type: &str) -> Result<Option<Arc<AggregateSnapshot>>> {
        if let Some(hit) = self.entries.read().unwrap().get(entity_type) {
            return Ok(Some(Arc::clone(hit)));
        }

        // Re-check under the write lock so concurrent misses read the store once.
        let mut entries = self.entries.write().unwrap();
        if let Some(hit) = entries.get(entity_type) {
            return Ok(Some(Arc::clone(hit)));
        }

        self.store_reads.fetch_add(1, Ordering::Relaxed);
        match self.db.get_aggregate(entity_type)? {
            Some(snapshot) => {
                tracing::debug!(
                    entity_type,
                    calculated_at = %snapshot.calculated_at,
                    "Cached aggregate snapshot"
                );
                let snapshot = Arc::new(snapshot);
                entries.insert(entity_type.to_string(), Arc::clone(&snapshot));
                Ok(Some(snapshot))
            }
            None => {
                tracing::debug!(entity_type, "No aggregate snapshot in store");
                Ok(None)
            }
        }
    }

    /// Drop every cached snapshot
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    /// Number of reads that went through to the store
    pub fn store_reads(&self) -> usize {
        self.store_reads.load(Ordering::Relaxed)
    }

    /// Number of cached entity types
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
