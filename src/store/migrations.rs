//! Version-tracked database migrations for the libSQL rule store.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "forwarding_rules",
        sql: r#"
            CREATE TABLE IF NOT EXISTS forwarding_rules (
                rule_name TEXT PRIMARY KEY,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                source_channel_id INTEGER NOT NULL,
                target_channel_ids TEXT NOT NULL DEFAULT '[]',

                EditOptions_PrependText TEXT,
                EditOptions_AppendText TEXT,
                EditOptions_RemoveSourceForwardHeader INTEGER NOT NULL DEFAULT 0,
                EditOptions_RemoveLinks INTEGER NOT NULL DEFAULT 0,
                EditOptions_StripFormatting INTEGER NOT NULL DEFAULT 0,
                EditOptions_CustomFooter TEXT,
                EditOptions_DropAuthor INTEGER NOT NULL DEFAULT 0,
                EditOptions_DropMediaCaptions INTEGER NOT NULL DEFAULT 0,
                EditOptions_NoForwards INTEGER NOT NULL DEFAULT 0,

                FilterOptions_AllowedMessageTypes TEXT NOT NULL DEFAULT '[]',
                FilterOptions_AllowedMimeTypes TEXT NOT NULL DEFAULT '[]',
                FilterOptions_ContainsText TEXT,
                FilterOptions_ContainsTextIsRegex INTEGER NOT NULL DEFAULT 0,
                FilterOptions_ContainsTextRegexOptions INTEGER NOT NULL DEFAULT 0,
                FilterOptions_AllowedSenderUserIds TEXT NOT NULL DEFAULT '[]',
                FilterOptions_BlockedSenderUserIds TEXT NOT NULL DEFAULT '[]',
                FilterOptions_IgnoreEditedMessages INTEGER NOT NULL DEFAULT 0,
                FilterOptions_IgnoreServiceMessages INTEGER NOT NULL DEFAULT 0,
                FilterOptions_MinMessageLength INTEGER,
                FilterOptions_MaxMessageLength INTEGER,

                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_forwarding_rules_source
                ON forwarding_rules(source_channel_id);

            CREATE TABLE IF NOT EXISTS text_replacement_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_name TEXT NOT NULL REFERENCES forwarding_rules(rule_name) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                find TEXT NOT NULL,
                replace_with TEXT NOT NULL DEFAULT '',
                is_regex INTEGER NOT NULL DEFAULT 0,
                regex_options INTEGER NOT NULL DEFAULT 0,
                UNIQUE (rule_name, position)
            );
            CREATE INDEX IF NOT EXISTS idx_text_replacement_rules_rule
                ON text_replacement_rules(rule_name);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
