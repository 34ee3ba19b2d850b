//! `SQLite` schema bootstrap logic.
//!
//! Table definitions use `CREATE TABLE IF NOT EXISTS` and are safe to
//! re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS epic_state (
    epic_key        TEXT PRIMARY KEY NOT NULL,
    repo            TEXT NOT NULL,
    epic_number     INTEGER NOT NULL,
    snapshot        TEXT,
    local_repo_path TEXT,
    active          INTEGER NOT NULL DEFAULT 0,
    updated_at      TEXT NOT NULL,
    archived_at     TEXT
);

CREATE INDEX IF NOT EXISTS idx_epic_state_active ON epic_state(active);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
