//! SQLite schema definitions and migrations.

use rusqlite::Connection;

use crate::error::GuardResult;

use super::backend::internal_error;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> GuardResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, 1)?;
        migrate_schema(conn, 1)?;
    } else if current_version < SCHEMA_VERSION {
        migrate_schema(conn, current_version)?;
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> GuardResult<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| internal_error(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> GuardResult<()> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| internal_error(format!("Failed to clear schema_version: {}", e)))?;

    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
        .map_err(|e| internal_error(format!("Failed to set schema_version: {}", e)))?;

    Ok(())
}

/// Create the initial schema (version 1).
fn create_schema_v1(conn: &Connection) -> GuardResult<()> {
    let tables = [
        (
            "tenants",
            "CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                specialty TEXT,
                subscription_tier TEXT NOT NULL DEFAULT 'free',
                max_users INTEGER,
                max_forms INTEGER,
                max_submissions INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )",
        ),
        (
            "user_profiles",
            "CREATE TABLE IF NOT EXISTS user_profiles (
                user_id TEXT PRIMARY KEY,
                primary_tenant_id TEXT REFERENCES tenants(id),
                updated_at TEXT NOT NULL
            )",
        ),
        (
            "tenant_memberships",
            "CREATE TABLE IF NOT EXISTS tenant_memberships (
                user_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                role TEXT NOT NULL,
                permissions TEXT NOT NULL DEFAULT '{}',
                is_active INTEGER NOT NULL DEFAULT 1,
                invited_by TEXT,
                joined_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (user_id, tenant_id)
            )",
        ),
        (
            "records",
            "CREATE TABLE IF NOT EXISTS records (
                table_name TEXT NOT NULL,
                id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                data TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (table_name, id)
            )",
        ),
        (
            "audit_outbox",
            "CREATE TABLE IF NOT EXISTS audit_outbox (
                outbox_id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL,
                enqueued_at TEXT NOT NULL
            )",
        ),
        (
            "audit_log",
            "CREATE TABLE IF NOT EXISTS audit_log (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                table_name TEXT NOT NULL,
                action TEXT NOT NULL,
                record_id TEXT,
                old_values TEXT,
                new_values TEXT,
                actor_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                created_at TEXT NOT NULL,
                request_metadata TEXT NOT NULL DEFAULT '{}'
            )",
        ),
    ];

    for (name, sql) in tables {
        conn.execute(sql, [])
            .map_err(|e| internal_error(format!("Failed to create {} table: {}", name, e)))?;
    }

    create_indexes(conn)
}

fn create_indexes(conn: &Connection) -> GuardResult<()> {
    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_memberships_user ON tenant_memberships(user_id, is_active)",
        "CREATE INDEX IF NOT EXISTS idx_memberships_tenant ON tenant_memberships(tenant_id, is_active)",
        "CREATE INDEX IF NOT EXISTS idx_records_tenant ON records(tenant_id, table_name)",
    ];

    for sql in indexes {
        conn.execute(sql, [])
            .map_err(|e| internal_error(format!("Failed to create index: {}", e)))?;
    }

    Ok(())
}

/// Run migrations from a version to the current version.
fn migrate_schema(conn: &Connection, from_version: i32) -> GuardResult<()> {
    let mut version = from_version;

    while version < SCHEMA_VERSION {
        match version {
            1 => migrate_v1_to_v2(conn)?,
            _ => {
                return Err(internal_error(format!(
                    "Unknown schema version: {}",
                    version
                )));
            }
        }
        version += 1;
        set_schema_version(conn, version)?;
    }

    Ok(())
}

/// Migrate from schema version 1 to version 2.
///
/// Makes `audit_log` append-only and adds the indexes used by compliance
/// reads.
fn migrate_v1_to_v2(conn: &Connection) -> GuardResult<()> {
    let migrations = [
        "CREATE TRIGGER IF NOT EXISTS audit_log_no_update
            BEFORE UPDATE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit_log is append-only');
            END",
        "CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
            BEFORE DELETE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit_log is append-only');
            END",
        "CREATE INDEX IF NOT EXISTS idx_audit_tenant_time ON audit_log(tenant_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_audit_record ON audit_log(tenant_id, table_name, record_id)",
        "CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log(actor_id, created_at)",
    ];

    for sql in migrations {
        conn.execute(sql, [])
            .map_err(|e| internal_error(format!("Migration v1->v2 failed: {}", e)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_schema_reaches_current_version() {
        let conn = fresh();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = fresh();
        initialize_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_audit_log_rejects_update_and_delete() {
        let conn = fresh();
        conn.execute(
            "INSERT INTO audit_log (id, table_name, action, actor_id, tenant_id, outcome, created_at)
             VALUES ('e1', 'patients', 'read', 'alice', 'clinic-a', 'success', '2026-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();

        assert!(
            conn.execute("UPDATE audit_log SET outcome = 'denied'", [])
                .is_err()
        );
        assert!(conn.execute("DELETE FROM audit_log", []).is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
