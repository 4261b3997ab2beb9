use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use loadout_core::domain::contact::ContactId;
use loadout_core::domain::execution::{CursorId, CursorState, ExecutionCursor};
use loadout_core::domain::loadout::{LoadoutId, TenantId};

use super::decode::{parse_enum, parse_optional_timestamp, parse_timestamp, parse_u32};
use super::{CursorRepository, RepositoryError};
use crate::DbPool;

const SELECT_CURSOR: &str = "SELECT
        id,
        tenant_id,
        loadout_id,
        loadout_version,
        contact_id,
        step_index,
        attempts,
        state,
        due_at,
        last_attempt_at,
        last_error,
        lease_owner,
        lease_expires_at,
        state_version,
        created_at,
        updated_at
     FROM execution_cursor";

#[derive(Clone)]
pub struct SqlCursorRepository {
    pool: DbPool,
}

impl SqlCursorRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CursorRepository for SqlCursorRepository {
    async fn find(&self, id: &CursorId) -> Result<Option<ExecutionCursor>, RepositoryError> {
        let sql = format!("{SELECT_CURSOR} WHERE id = ?");
        let row = sqlx::query(&sql).bind(&id.0).fetch_optional(&self.pool).await?;
        row.map(cursor_from_row).transpose()
    }

    async fn list_for_loadout(
        &self,
        loadout_id: &LoadoutId,
    ) -> Result<Vec<ExecutionCursor>, RepositoryError> {
        let sql = format!("{SELECT_CURSOR} WHERE loadout_id = ? ORDER BY created_at ASC, id ASC");
        let rows = sqlx::query(&sql).bind(&loadout_id.0).fetch_all(&self.pool).await?;
        rows.into_iter().map(cursor_from_row).collect()
    }

    async fn list_due(
        &self,
        loadout_id: &LoadoutId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExecutionCursor>, RepositoryError> {
        // RFC 3339 text in UTC orders lexically, so the comparisons stay in SQL.
        let sql = format!(
            "{SELECT_CURSOR}
             WHERE loadout_id = ?
               AND state = 'advancing'
               AND due_at <= ?
               AND (lease_owner IS NULL OR lease_expires_at <= ?)
             ORDER BY due_at ASC, id ASC
             LIMIT ?"
        );
        let now = now.to_rfc3339();
        let rows = sqlx::query(&sql)
            .bind(&loadout_id.0)
            .bind(&now)
            .bind(&now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(cursor_from_row).collect()
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionCursor>, RepositoryError> {
        let sql = format!(
            "{SELECT_CURSOR}
             WHERE lease_owner IS NOT NULL AND lease_expires_at <= ?
             ORDER BY lease_expires_at ASC"
        );
        let rows = sqlx::query(&sql).bind(now.to_rfc3339()).fetch_all(&self.pool).await?;
        rows.into_iter().map(cursor_from_row).collect()
    }

    async fn insert(&self, cursor: ExecutionCursor) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO execution_cursor (
                id,
                tenant_id,
                loadout_id,
                loadout_version,
                contact_id,
                step_index,
                attempts,
                state,
                due_at,
                last_attempt_at,
                last_error,
                lease_owner,
                lease_expires_at,
                state_version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(&cursor.id.0)
        .bind(&cursor.tenant_id.0)
        .bind(&cursor.loadout_id.0)
        .bind(i64::from(cursor.loadout_version))
        .bind(&cursor.contact_id.0)
        .bind(i64::from(cursor.step_index))
        .bind(i64::from(cursor.attempts))
        .bind(cursor.state.as_str())
        .bind(cursor.due_at.to_rfc3339())
        .bind(cursor.last_attempt_at.map(|value| value.to_rfc3339()))
        .bind(cursor.last_error.as_deref())
        .bind(cursor.lease_owner.as_deref())
        .bind(cursor.lease_expires_at.map(|value| value.to_rfc3339()))
        .bind(i64::from(cursor.state_version))
        .bind(cursor.created_at.to_rfc3339())
        .bind(cursor.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_swap(
        &self,
        cursor: ExecutionCursor,
        expected_state_version: u32,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE execution_cursor SET
                loadout_version = ?,
                step_index = ?,
                attempts = ?,
                state = ?,
                due_at = ?,
                last_attempt_at = ?,
                last_error = ?,
                lease_owner = ?,
                lease_expires_at = ?,
                state_version = ?,
                updated_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(i64::from(cursor.loadout_version))
        .bind(i64::from(cursor.step_index))
        .bind(i64::from(cursor.attempts))
        .bind(cursor.state.as_str())
        .bind(cursor.due_at.to_rfc3339())
        .bind(cursor.last_attempt_at.map(|value| value.to_rfc3339()))
        .bind(cursor.last_error.as_deref())
        .bind(cursor.lease_owner.as_deref())
        .bind(cursor.lease_expires_at.map(|value| value.to_rfc3339()))
        .bind(i64::from(cursor.state_version))
        .bind(cursor.updated_at.to_rfc3339())
        .bind(&cursor.id.0)
        .bind(i64::from(expected_state_version))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(
        &self,
        id: &CursorId,
        expected_state_version: u32,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM execution_cursor WHERE id = ? AND state_version = ?")
            .bind(&id.0)
            .bind(i64::from(expected_state_version))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_for_loadout(&self, loadout_id: &LoadoutId) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM execution_cursor WHERE loadout_id = ?")
            .bind(&loadout_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn cursor_from_row(row: SqliteRow) -> Result<ExecutionCursor, RepositoryError> {
    Ok(ExecutionCursor {
        id: CursorId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        loadout_id: LoadoutId(row.try_get("loadout_id")?),
        loadout_version: parse_u32("loadout_version", row.try_get("loadout_version")?)?,
        contact_id: ContactId(row.try_get("contact_id")?),
        step_index: parse_u32("step_index", row.try_get("step_index")?)?,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        state: parse_enum("cursor state", row.try_get("state")?, CursorState::parse)?,
        due_at: parse_timestamp("due_at", row.try_get("due_at")?)?,
        last_attempt_at: parse_optional_timestamp(
            "last_attempt_at",
            row.try_get("last_attempt_at")?,
        )?,
        last_error: row.try_get("last_error")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: parse_optional_timestamp(
            "lease_expires_at",
            row.try_get("lease_expires_at")?,
        )?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
