//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: baselines, aggregates, sync log
    r#"
    -- ============================================
    -- Baselines (replaced wholesale per entity type)
    -- ============================================

    CREATE TABLE IF NOT EXISTS entities (
        entity_id        TEXT NOT NULL,
        entity_type      TEXT NOT NULL,
        queries_data     JSON NOT NULL,
        created_at       DATETIME NOT NULL,
        updated_at       DATETIME NOT NULL,

        PRIMARY KEY (entity_id, entity_type)
    );

    -- ============================================
    -- Aggregates (one snapshot per entity type)
    -- ============================================

    CREATE TABLE IF NOT EXISTS aggregates (
        entity_type      TEXT PRIMARY KEY,
        aggregates_data  JSON NOT NULL,
        calculated_at    DATETIME NOT NULL
    );

    -- ============================================
    -- Sync log (insert-only)
    -- ============================================

    CREATE TABLE IF NOT EXISTS sync_log (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        synced_at        DATETIME NOT NULL,
        entity_type      TEXT NOT NULL,
        entities_count   INTEGER NOT NULL,
        duration_s       REAL NOT NULL,
        status           TEXT NOT NULL,
        error_message    TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);
    "#,
    // Version 2: sync log read paths
    r#"
    CREATE INDEX IF NOT EXISTS idx_sync_log_synced_at ON sync_log(synced_at DESC);
    CREATE INDEX IF NOT EXISTS idx_sync_log_type ON sync_log(entity_type, synced_at DESC);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["entities", "aggregates", "sync_log"] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_entities_primary_key_is_composite() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let insert = "INSERT INTO entities (entity_id, entity_type, queries_data, created_at, updated_at)
                      VALUES (?1, ?2, '{}', 'now', 'now')";
        conn.execute(insert, ["1", "buyer"]).unwrap();
        conn.execute(insert, ["1", "seller"]).unwrap();
        assert!(conn.execute(insert, ["1", "buyer"]).is_err());
    }
}
