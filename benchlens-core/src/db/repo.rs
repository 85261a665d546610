//! Database repository layer
//!
//! Provides the analytics store operations: baseline replacement and reads,
//! aggregate snapshots, the sync log, and health statistics.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

/// Timestamps are stored in one fixed-width UTC format so that text ordering
/// matches time ordering.
fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn check_entity_type(entity_type: &str, entities: &[EntityBaseline]) -> Result<()> {
    match entities.iter().find(|e| e.entity_type != entity_type) {
        Some(stray) => Err(Error::Persistence(format!(
            "baseline for {} has type {}, expected {}",
            stray.entity_id, stray.entity_type, entity_type
        ))),
        None => Ok(()),
    }
}

/// Delete the stored set of `entity_type` and insert `entities`, keeping
/// `created_at` of ids already present. Returns the number of rows removed.
///
/// Callers own the surrounding transaction.
fn write_entities(conn: &Connection, entity_type: &str, entities: &[EntityBaseline]) -> Result<usize> {
    let previous_created: HashMap<String, String> = {
        let mut stmt =
            conn.prepare("SELECT entity_id, created_at FROM entities WHERE entity_type = ?")?;
        let created = stmt
            .query_map([entity_type], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        created
    };

    let removed = conn.execute("DELETE FROM entities WHERE entity_type = ?", [entity_type])?;

    let mut insert = conn.prepare(
        r#"
        INSERT INTO entities (entity_id, entity_type, queries_data, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )?;
    for entity in entities {
        let created_at = previous_created
            .get(&entity.entity_id)
            .cloned()
            .unwrap_or_else(|| timestamp(&entity.created_at));
        insert.execute(params![
            entity.entity_id,
            entity_type,
            serde_json::to_string(&entity.queries)?,
            created_at,
            timestamp(&entity.updated_at),
        ])?;
    }

    Ok(removed)
}

fn upsert_aggregate(conn: &Connection, snapshot: &AggregateSnapshot) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO aggregates (entity_type, aggregates_data, calculated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(entity_type) DO UPDATE SET
            aggregates_data = excluded.aggregates_data,
            calculated_at = excluded.calculated_at
        "#,
        params![
            snapshot.entity_type,
            serde_json::to_string(snapshot)?,
            timestamp(&snapshot.calculated_at),
        ],
    )?;
    Ok(())
}

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA cache_size = -64000;  -- 64MB cache
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Entity baselines
    // ============================================

    /// Replace every baseline of `entity_type` with `entities`.
    ///
    /// Runs as a single transaction: either the whole new set is committed or
    /// the previous set stays exactly as it was. `created_at` survives for
    /// entities that were already present.
    pub fn replace_entities(&self, entity_type: &str, entities: &[EntityBaseline]) -> Result<usize> {
        check_entity_type(entity_type, entities)?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let removed = write_entities(&tx, entity_type, entities)?;
        tx.commit()?;

        tracing::debug!(
            entity_type,
            removed,
            inserted = entities.len(),
            "Replaced entity baselines"
        );
        Ok(entities.len())
    }

    /// Replace the baselines of `entity_type` and store its aggregate snapshot
    /// in one transaction.
    ///
    /// Readers see either the previous baselines and snapshot or the new ones.
    /// A failure on either write leaves both untouched.
    pub fn replace_type_snapshot(
        &self,
        entity_type: &str,
        entities: &[EntityBaseline],
        snapshot: &AggregateSnapshot,
    ) -> Result<usize> {
        check_entity_type(entity_type, entities)?;
        if snapshot.entity_type != entity_type {
            return Err(Error::Persistence(format!(
                "aggregate snapshot has type {}, expected {}",
                snapshot.entity_type, entity_type
            )));
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let removed = write_entities(&tx, entity_type, entities)?;
        upsert_aggregate(&tx, snapshot)?;
        tx.commit()?;

        tracing::debug!(
            entity_type,
            removed,
            inserted = entities.len(),
            total_count = snapshot.total_count,
            "Replaced entity baselines and aggregate snapshot"
        );
        Ok(entities.len())
    }

    /// Get one entity's baseline. `None` means the entity is unknown.
    pub fn get_entity(&self, entity_id: &str, entity_type: &str) -> Result<Option<EntityBaseline>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM entities WHERE entity_id = ?1 AND entity_type = ?2",
            params![entity_id, entity_type],
            Self::row_to_entity,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_entity(row: &Row) -> rusqlite::Result<EntityBaseline> {
        let queries_str: String = row.get("queries_data")?;
        let created_at_str: String = row.get("created_at")?;
        let updated_at_str: String = row.get("updated_at")?;

        let queries = serde_json::from_str(&queries_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(EntityBaseline {
            entity_id: row.get("entity_id")?,
            entity_type: row.get("entity_type")?,
            queries,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }

    /// Ids of all stored entities of a type, sorted
    pub fn list_entity_ids(&self, entity_type: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT entity_id FROM entities WHERE entity_type = ? ORDER BY entity_id")?;
        let ids = stmt
            .query_map([entity_type], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Number of stored entities of a type
    pub fn count_entities(&self, entity_type: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE entity_type = ?",
            [entity_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ============================================
    // Aggregates
    // ============================================

    /// Insert or replace the snapshot for its entity type
    pub fn put_aggregate(&self, snapshot: &AggregateSnapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        upsert_aggregate(&conn, snapshot)
    }

    /// Get the snapshot for a type. `None` means no sync has produced one yet.
    pub fn get_aggregate(&self, entity_type: &str) -> Result<Option<AggregateSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                "SELECT aggregates_data FROM aggregates WHERE entity_type = ?",
                [entity_type],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    // ============================================
    // Sync log
    // ============================================

    /// Append an entry; returns its row id
    pub fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sync_log (synced_at, entity_type, entities_count, duration_s, status, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                timestamp(&entry.synced_at),
                entry.entity_type,
                entry.entities_count as i64,
                entry.duration_seconds,
                entry.status.as_str(),
                entry.error_message,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent sync log entries, newest first
    pub fn get_sync_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM sync_log ORDER BY synced_at DESC, id DESC LIMIT ?")?;
        let entries = stmt
            .query_map([limit as i64], Self::row_to_sync_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn row_to_sync_log(row: &Row) -> rusqlite::Result<SyncLogEntry> {
        let synced_at_str: String = row.get("synced_at")?;
        let status_str: String = row.get("status")?;
        let entities_count: i64 = row.get("entities_count")?;

        Ok(SyncLogEntry {
            id: Some(row.get("id")?),
            synced_at: parse_timestamp(&synced_at_str),
            entity_type: row.get("entity_type")?,
            entities_count: entities_count.max(0) as usize,
            duration_seconds: row.get("duration_s")?,
            status: status_str.parse().unwrap_or(SyncStatus::Error),
            error_message: row.get("error_message")?,
        })
    }

    // ============================================
    // Health
    // ============================================

    /// Get total database size in bytes.
    pub fn get_database_size(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();

        let page_count: u64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: u64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(page_count * page_size)
    }

    /// Per-type counts, the latest sync and database size
    pub fn get_health(&self) -> Result<StoreHealth> {
        let database_bytes = self.get_database_size()?;

        let (entity_counts, aggregate_types) = {
            let conn = self.conn.lock().unwrap();

            let mut stmt = conn.prepare(
                "SELECT entity_type, COUNT(*) FROM entities GROUP BY entity_type ORDER BY entity_type",
            )?;
            let entity_counts = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
                })?
                .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

            let mut stmt = conn.prepare("SELECT entity_type FROM aggregates ORDER BY entity_type")?;
            let aggregate_types = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;

            (entity_counts, aggregate_types)
        };

        let last_sync = self.get_sync_log(1)?.into_iter().next();

        Ok(StoreHealth {
            entity_counts,
            aggregate_types,
            last_sync,
            database_bytes,
        })
    }
}
