//! Durable epic snapshot records keyed by epic identity.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::epic::{EpicId, EpicSnapshot};
use crate::{AppError, Result};

use super::db::Database;

/// Persisted state for one epic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpicRecord {
    /// Epic identity.
    pub id: EpicId,
    /// Last-known-good tracker snapshot, if one was ever synced.
    pub snapshot: Option<EpicSnapshot>,
    /// Last-used local repository path.
    pub local_repo_path: Option<String>,
    /// Whether monitoring resumes on this epic at startup.
    pub active: bool,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// When the epic was unlinked.
    pub archived_at: Option<DateTime<Utc>>,
}

/// Repository wrapper around `SQLite` for epic records.
#[derive(Clone)]
pub struct EpicRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct EpicRow {
    repo: String,
    epic_number: i64,
    snapshot: Option<String>,
    local_repo_path: Option<String>,
    active: i64,
    updated_at: String,
    archived_at: Option<String>,
}

impl EpicRow {
    /// Convert a database row into the domain record.
    fn into_record(self) -> Result<EpicRecord> {
        let number = u64::try_from(self.epic_number)
            .map_err(|e| AppError::Db(format!("invalid epic_number: {e}")))?;
        let snapshot = self
            .snapshot
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid snapshot: {e}")))?;
        let updated_at = parse_timestamp(&self.updated_at, "updated_at")?;
        let archived_at = self
            .archived_at
            .as_deref()
            .map(|raw| parse_timestamp(raw, "archived_at"))
            .transpose()?;

        Ok(EpicRecord {
            id: EpicId::new(self.repo, number),
            snapshot,
            local_repo_path: self.local_repo_path,
            active: self.active != 0,
            updated_at,
            archived_at,
        })
    }
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

fn epic_number_param(id: &EpicId) -> Result<i64> {
    i64::try_from(id.number)
        .map_err(|_| AppError::Validation(format!("epic number out of range: {}", id.number)))
}

const SELECT_COLUMNS: &str =
    "SELECT repo, epic_number, snapshot, local_repo_path, active, updated_at, archived_at \
     FROM epic_state";

impl EpicRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Upsert the latest snapshot, leaving path and active flag untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if serialization or the write fails.
    pub async fn save_snapshot(&self, snapshot: &EpicSnapshot) -> Result<()> {
        let id = &snapshot.epic.id;
        let encoded = serde_json::to_string(snapshot)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO epic_state (epic_key, repo, epic_number, snapshot, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(epic_key) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at",
        )
        .bind(id.key())
        .bind(&id.repo)
        .bind(epic_number_param(id)?)
        .bind(&encoded)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Retrieve the record for an epic.
    ///
    /// Returns `Ok(None)` if the epic was never stored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or decoding fails.
    pub async fn load(&self, id: &EpicId) -> Result<Option<EpicRecord>> {
        let row: Option<EpicRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE epic_key = ?1"))
            .bind(id.key())
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(EpicRow::into_record).transpose()
    }

    /// Remember the local checkout used for an epic.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn set_local_repo_path(&self, id: &EpicId, path: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO epic_state (epic_key, repo, epic_number, local_repo_path, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(epic_key) DO UPDATE SET
                local_repo_path = excluded.local_repo_path,
                updated_at = excluded.updated_at",
        )
        .bind(id.key())
        .bind(&id.repo)
        .bind(epic_number_param(id)?)
        .bind(path)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Mark an epic as the one to resume on startup, clearing any other.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn set_active(&self, id: &EpicId) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.db.begin().await?;

        sqlx::query("UPDATE epic_state SET active = 0 WHERE active = 1 AND epic_key <> ?1")
            .bind(id.key())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO epic_state (epic_key, repo, epic_number, active, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(epic_key) DO UPDATE SET
                active = 1,
                archived_at = NULL,
                updated_at = excluded.updated_at",
        )
        .bind(id.key())
        .bind(&id.repo)
        .bind(epic_number_param(id)?)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Epic marked active, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or decoding fails.
    pub async fn active(&self) -> Result<Option<EpicRecord>> {
        let row: Option<EpicRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE active = 1 LIMIT 1"))
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(EpicRow::into_record).transpose()
    }

    /// Unlink an epic: clear its active flag and stamp `archived_at`.
    ///
    /// Returns `false` when the epic is unknown.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn archive(&self, id: &EpicId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE epic_state SET active = 0, archived_at = ?1, updated_at = ?1 WHERE epic_key = ?2",
        )
        .bind(&now)
        .bind(id.key())
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All stored epics, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or decoding fails.
    pub async fn list(&self) -> Result<Vec<EpicRecord>> {
        let rows: Vec<EpicRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY updated_at DESC"))
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(EpicRow::into_record).collect()
    }
}
