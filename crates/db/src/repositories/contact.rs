use sqlx::{sqlite::SqliteRow, Row};

use loadout_core::domain::agent::AgentType;
use loadout_core::domain::contact::{ActivityEntry, ActivityKind, Contact, ContactId, ContactStage};
use loadout_core::domain::loadout::{LoadoutId, TenantId};

use super::decode::{
    parse_decimal, parse_enum, parse_json, parse_optional_timestamp, parse_timestamp, to_json,
};
use super::{ContactRepository, RepositoryError};
use crate::DbPool;

#[derive(Clone)]
pub struct SqlContactRepository {
    pool: DbPool,
}

impl SqlContactRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ContactRepository for SqlContactRepository {
    async fn find(
        &self,
        tenant_id: &TenantId,
        id: &ContactId,
    ) -> Result<Option<Contact>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                tenant_id,
                id,
                stage,
                score,
                tags_json,
                attributes_json,
                opted_out_json,
                last_contacted_at,
                created_at,
                updated_at
             FROM contact
             WHERE tenant_id = ? AND id = ?",
        )
        .bind(&tenant_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(contact_from_row).transpose()
    }

    async fn save(&self, contact: Contact) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO contact (
                tenant_id,
                id,
                stage,
                score,
                tags_json,
                attributes_json,
                opted_out_json,
                last_contacted_at,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, id) DO UPDATE SET
                stage = excluded.stage,
                score = excluded.score,
                tags_json = excluded.tags_json,
                attributes_json = excluded.attributes_json,
                opted_out_json = excluded.opted_out_json,
                last_contacted_at = excluded.last_contacted_at,
                updated_at = excluded.updated_at",
        )
        .bind(&contact.tenant_id.0)
        .bind(&contact.id.0)
        .bind(contact.stage.as_str())
        .bind(contact.score.to_string())
        .bind(to_json("tags_json", &contact.tags)?)
        .bind(to_json("attributes_json", &contact.attributes)?)
        .bind(to_json("opted_out_json", &contact.opted_out_channels)?)
        .bind(contact.last_contacted_at.map(|value| value.to_rfc3339()))
        .bind(contact.created_at.to_rfc3339())
        .bind(contact.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_activity(&self, entry: ActivityEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO contact_activity (
                id,
                tenant_id,
                contact_id,
                loadout_id,
                kind,
                agent_type,
                action,
                detail,
                external_ref,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.tenant_id.0)
        .bind(&entry.contact_id.0)
        .bind(&entry.loadout_id.0)
        .bind(entry.kind.as_str())
        .bind(entry.agent_type.as_ref().map(AgentType::as_str))
        .bind(entry.action.as_deref())
        .bind(&entry.detail)
        .bind(entry.external_ref.as_deref())
        .bind(entry.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_activity(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<Vec<ActivityEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                tenant_id,
                contact_id,
                loadout_id,
                kind,
                agent_type,
                action,
                detail,
                external_ref,
                occurred_at
             FROM contact_activity
             WHERE tenant_id = ? AND contact_id = ?
             ORDER BY occurred_at ASC, rowid ASC",
        )
        .bind(&tenant_id.0)
        .bind(&contact_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(activity_from_row).collect()
    }
}

fn contact_from_row(row: SqliteRow) -> Result<Contact, RepositoryError> {
    Ok(Contact {
        id: ContactId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        stage: parse_enum("contact stage", row.try_get("stage")?, ContactStage::parse)?,
        score: parse_decimal("score", row.try_get("score")?)?,
        tags: parse_json("tags_json", row.try_get("tags_json")?)?,
        attributes: parse_json("attributes_json", row.try_get("attributes_json")?)?,
        opted_out_channels: parse_json("opted_out_json", row.try_get("opted_out_json")?)?,
        last_contacted_at: parse_optional_timestamp(
            "last_contacted_at",
            row.try_get("last_contacted_at")?,
        )?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn activity_from_row(row: SqliteRow) -> Result<ActivityEntry, RepositoryError> {
    let agent_type = row
        .try_get::<Option<String>, _>("agent_type")?
        .map(|value| parse_enum("agent type", value, AgentType::parse))
        .transpose()?;

    Ok(ActivityEntry {
        id: row.try_get("id")?,
        tenant_id: TenantId(row.try_get("tenant_id")?),
        contact_id: ContactId(row.try_get("contact_id")?),
        loadout_id: LoadoutId(row.try_get("loadout_id")?),
        kind: parse_enum("activity kind", row.try_get("kind")?, ActivityKind::parse)?,
        agent_type,
        action: row.try_get("action")?,
        detail: row.try_get("detail")?,
        external_ref: row.try_get("external_ref")?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
