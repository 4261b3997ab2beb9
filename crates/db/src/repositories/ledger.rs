use sqlx::{sqlite::SqliteRow, Row};

use loadout_core::domain::agent::{Action, AgentType, Channel};
use loadout_core::domain::contact::ContactId;
use loadout_core::domain::execution::{DedupKey, DispatchRecord, DispatchState};
use loadout_core::domain::loadout::{LoadoutId, TenantId};

use super::decode::{parse_enum, parse_timestamp, parse_u32};
use super::{DispatchLedgerRepository, RepositoryError};
use crate::DbPool;

const SELECT_RECORD: &str = "SELECT
        dedup_key,
        tenant_id,
        loadout_id,
        loadout_version,
        contact_id,
        step_index,
        agent_type,
        action,
        channel,
        state,
        external_ref,
        attempt_count,
        last_error,
        created_at,
        updated_at
     FROM dispatch_ledger";

#[derive(Clone)]
pub struct SqlDispatchLedgerRepository {
    pool: DbPool,
}

impl SqlDispatchLedgerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn write(&self, record: &DispatchRecord, replace: bool) -> Result<(), RepositoryError> {
        let conflict = if replace {
            "ON CONFLICT(dedup_key) DO UPDATE SET
                state = excluded.state,
                external_ref = excluded.external_ref,
                attempt_count = excluded.attempt_count,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at"
        } else {
            "ON CONFLICT(dedup_key) DO NOTHING"
        };
        let sql = format!(
            "INSERT INTO dispatch_ledger (
                dedup_key,
                tenant_id,
                loadout_id,
                loadout_version,
                contact_id,
                step_index,
                agent_type,
                action,
                channel,
                state,
                external_ref,
                attempt_count,
                last_error,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             {conflict}"
        );

        sqlx::query(&sql)
            .bind(record.dedup_key.as_str())
            .bind(&record.tenant_id.0)
            .bind(&record.loadout_id.0)
            .bind(i64::from(record.loadout_version))
            .bind(&record.contact_id.0)
            .bind(i64::from(record.step_index))
            .bind(record.agent_type.as_str())
            .bind(record.action.as_str())
            .bind(record.channel.as_str())
            .bind(record.state.as_str())
            .bind(record.external_ref.as_deref())
            .bind(i64::from(record.attempt_count))
            .bind(record.last_error.as_deref())
            .bind(record.created_at.to_rfc3339())
            .bind(record.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl DispatchLedgerRepository for SqlDispatchLedgerRepository {
    async fn find(&self, dedup_key: &DedupKey) -> Result<Option<DispatchRecord>, RepositoryError> {
        let sql = format!("{SELECT_RECORD} WHERE dedup_key = ?");
        let row = sqlx::query(&sql).bind(dedup_key.as_str()).fetch_optional(&self.pool).await?;
        row.map(record_from_row).transpose()
    }

    async fn reserve(&self, record: DispatchRecord) -> Result<DispatchRecord, RepositoryError> {
        self.write(&record, false).await?;
        self.find(&record.dedup_key).await?.ok_or_else(|| {
            RepositoryError::NotFound(format!("dispatch record `{}`", record.dedup_key.as_str()))
        })
    }

    async fn save(&self, record: DispatchRecord) -> Result<(), RepositoryError> {
        self.write(&record, true).await
    }

    async fn list_for_contact(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<Vec<DispatchRecord>, RepositoryError> {
        let sql = format!(
            "{SELECT_RECORD} WHERE tenant_id = ? AND contact_id = ? ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(&tenant_id.0)
            .bind(&contact_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: SqliteRow) -> Result<DispatchRecord, RepositoryError> {
    Ok(DispatchRecord {
        dedup_key: DedupKey(row.try_get("dedup_key")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        loadout_id: LoadoutId(row.try_get("loadout_id")?),
        loadout_version: parse_u32("loadout_version", row.try_get("loadout_version")?)?,
        contact_id: ContactId(row.try_get("contact_id")?),
        step_index: parse_u32("step_index", row.try_get("step_index")?)?,
        agent_type: parse_enum("agent type", row.try_get("agent_type")?, AgentType::parse)?,
        action: Action::from(row.try_get::<String, _>("action")?),
        channel: parse_enum("channel", row.try_get("channel")?, Channel::parse)?,
        state: parse_enum("dispatch state", row.try_get("state")?, DispatchState::parse)?,
        external_ref: row.try_get("external_ref")?,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        last_error: row.try_get("last_error")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
