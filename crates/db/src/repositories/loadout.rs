use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, Sqlite};

use loadout_core::domain::loadout::{
    LoadoutConfig, LoadoutId, LoadoutStatus, TenantActivation, TenantId,
};

use super::decode::{
    parse_enum, parse_json, parse_optional_u32, parse_timestamp, parse_u32, to_json,
};
use super::{ActivationCommit, LoadoutRepository, RepositoryError};
use crate::DbPool;

const SELECT_LOADOUT: &str = "SELECT
        id,
        tenant_id,
        name,
        description,
        industry,
        agents_json,
        chain_json,
        settings_json,
        status,
        version,
        stopped_at_version,
        created_at,
        updated_at
     FROM loadout";

#[derive(Clone)]
pub struct SqlLoadoutRepository {
    pool: DbPool,
}

impl SqlLoadoutRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LoadoutRepository for SqlLoadoutRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &LoadoutId,
    ) -> Result<Option<LoadoutConfig>, RepositoryError> {
        fetch_loadout(&self.pool, tenant_id, id).await
    }

    async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<LoadoutConfig>, RepositoryError> {
        let sql = format!("{SELECT_LOADOUT} WHERE tenant_id = ? ORDER BY created_at ASC, id ASC");
        let rows = sqlx::query(&sql).bind(&tenant_id.0).fetch_all(&self.pool).await?;
        rows.into_iter().map(loadout_from_row).collect()
    }

    async fn list_active(&self) -> Result<Vec<LoadoutConfig>, RepositoryError> {
        let sql = format!("{SELECT_LOADOUT} WHERE status = 'active' ORDER BY tenant_id ASC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(loadout_from_row).collect()
    }

    async fn insert(&self, loadout: LoadoutConfig) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO loadout (
                id,
                tenant_id,
                name,
                description,
                industry,
                agents_json,
                chain_json,
                settings_json,
                status,
                version,
                stopped_at_version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&loadout.id.0)
        .bind(&loadout.tenant_id.0)
        .bind(&loadout.name)
        .bind(&loadout.description)
        .bind(loadout.industry.as_deref())
        .bind(to_json("agents_json", &loadout.agents)?)
        .bind(to_json("chain_json", &loadout.chain)?)
        .bind(to_json("settings_json", &loadout.settings)?)
        .bind(loadout.status.as_str())
        .bind(i64::from(loadout.version))
        .bind(loadout.stopped_at_version.map(i64::from))
        .bind(loadout.created_at.to_rfc3339())
        .bind(loadout.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(
        &self,
        loadout: LoadoutConfig,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE loadout SET
                name = ?,
                description = ?,
                industry = ?,
                agents_json = ?,
                chain_json = ?,
                settings_json = ?,
                version = ?,
                updated_at = ?
             WHERE id = ? AND tenant_id = ? AND version = ? AND status != 'archived'",
        )
        .bind(&loadout.name)
        .bind(&loadout.description)
        .bind(loadout.industry.as_deref())
        .bind(to_json("agents_json", &loadout.agents)?)
        .bind(to_json("chain_json", &loadout.chain)?)
        .bind(to_json("settings_json", &loadout.settings)?)
        .bind(i64::from(loadout.version))
        .bind(loadout.updated_at.to_rfc3339())
        .bind(&loadout.id.0)
        .bind(&loadout.tenant_id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(missing_or_conflict(
                fetch_loadout(&self.pool, &loadout.tenant_id, &loadout.id).await?,
                &loadout.id,
                expected_version,
            ));
        }
        Ok(())
    }

    async fn archive(
        &self,
        tenant_id: &TenantId,
        id: &LoadoutId,
        expected_version: u32,
        now: DateTime<Utc>,
    ) -> Result<LoadoutConfig, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE loadout SET status = 'archived', version = version + 1, updated_at = ?
             WHERE id = ? AND tenant_id = ? AND version = ? AND status != 'archived'",
        )
        .bind(now.to_rfc3339())
        .bind(&id.0)
        .bind(&tenant_id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let current = fetch_loadout(&mut *tx, tenant_id, id).await?;
            return Err(missing_or_conflict(current, id, expected_version));
        }

        sqlx::query(
            "UPDATE tenant_activation
             SET active_loadout_id = NULL, version = version + 1, updated_at = ?
             WHERE tenant_id = ? AND active_loadout_id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(&tenant_id.0)
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;

        let archived = fetch_loadout(&mut *tx, tenant_id, id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("loadout `{}`", id.0)))?;
        tx.commit().await?;
        Ok(archived)
    }

    async fn tenant_activation(
        &self,
        tenant_id: &TenantId,
    ) -> Result<TenantActivation, RepositoryError> {
        fetch_activation(&self.pool, tenant_id).await
    }

    async fn swap_active(
        &self,
        tenant_id: &TenantId,
        target: Option<&LoadoutId>,
        expected_version: u32,
        now: DateTime<Utc>,
    ) -> Result<ActivationCommit, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let current = fetch_activation(&mut *tx, tenant_id).await?;
        if current.version != expected_version {
            return Err(RepositoryError::ActivationConflict {
                tenant_id: tenant_id.0.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut stopped = None;
        if let Some(previous) = current.active_loadout_id.as_ref().filter(|id| Some(*id) != target)
        {
            sqlx::query(
                "UPDATE loadout SET status = 'draft', stopped_at_version = version, updated_at = ?
                 WHERE id = ? AND tenant_id = ? AND status = 'active'",
            )
            .bind(now.to_rfc3339())
            .bind(&previous.0)
            .bind(&tenant_id.0)
            .execute(&mut *tx)
            .await?;
            stopped = fetch_loadout(&mut *tx, tenant_id, previous).await?;
        }

        let mut activated = None;
        if let Some(target) = target {
            let result = sqlx::query(
                "UPDATE loadout SET status = 'active', updated_at = ?
                 WHERE id = ? AND tenant_id = ? AND status != 'archived'",
            )
            .bind(now.to_rfc3339())
            .bind(&target.0)
            .bind(&tenant_id.0)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(RepositoryError::NotFound(format!(
                    "activatable loadout `{}` for tenant `{}`",
                    target.0, tenant_id.0
                )));
            }
            activated = fetch_loadout(&mut *tx, tenant_id, target).await?;
        }

        let next_version = expected_version + 1;
        let result = sqlx::query(
            "INSERT INTO tenant_activation (tenant_id, active_loadout_id, version, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(tenant_id) DO UPDATE SET
                active_loadout_id = excluded.active_loadout_id,
                version = excluded.version,
                updated_at = excluded.updated_at
             WHERE tenant_activation.version = ?",
        )
        .bind(&tenant_id.0)
        .bind(target.map(|id| id.0.as_str()))
        .bind(i64::from(next_version))
        .bind(now.to_rfc3339())
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let actual = fetch_activation(&mut *tx, tenant_id).await?.version;
            return Err(RepositoryError::ActivationConflict {
                tenant_id: tenant_id.0.clone(),
                expected: expected_version,
                actual,
            });
        }

        tx.commit().await?;

        Ok(ActivationCommit {
            activation: TenantActivation {
                tenant_id: tenant_id.clone(),
                active_loadout_id: target.cloned(),
                version: next_version,
                updated_at: now,
            },
            activated,
            stopped,
        })
    }
}

async fn fetch_loadout<'e, E>(
    executor: E,
    tenant_id: &TenantId,
    id: &LoadoutId,
) -> Result<Option<LoadoutConfig>, RepositoryError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!("{SELECT_LOADOUT} WHERE id = ? AND tenant_id = ?");
    let row = sqlx::query(&sql).bind(&id.0).bind(&tenant_id.0).fetch_optional(executor).await?;
    row.map(loadout_from_row).transpose()
}

async fn fetch_activation<'e, E>(
    executor: E,
    tenant_id: &TenantId,
) -> Result<TenantActivation, RepositoryError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT tenant_id, active_loadout_id, version, updated_at
         FROM tenant_activation
         WHERE tenant_id = ?",
    )
    .bind(&tenant_id.0)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(row) => Ok(TenantActivation {
            tenant_id: TenantId(row.try_get("tenant_id")?),
            active_loadout_id: row
                .try_get::<Option<String>, _>("active_loadout_id")?
                .map(LoadoutId),
            version: parse_u32("version", row.try_get("version")?)?,
            updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        }),
        None => Ok(TenantActivation::vacant(tenant_id.clone())),
    }
}

fn missing_or_conflict(
    current: Option<LoadoutConfig>,
    id: &LoadoutId,
    expected_version: u32,
) -> RepositoryError {
    match current {
        Some(_) => {
            RepositoryError::VersionConflict { id: id.0.clone(), expected: expected_version }
        }
        None => RepositoryError::NotFound(format!("loadout `{}`", id.0)),
    }
}

fn loadout_from_row(row: SqliteRow) -> Result<LoadoutConfig, RepositoryError> {
    Ok(LoadoutConfig {
        id: LoadoutId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        industry: row.try_get("industry")?,
        agents: parse_json("agents_json", row.try_get("agents_json")?)?,
        chain: parse_json("chain_json", row.try_get("chain_json")?)?,
        settings: parse_json("settings_json", row.try_get("settings_json")?)?,
        status: parse_enum("loadout status", row.try_get("status")?, LoadoutStatus::parse)?,
        version: parse_u32("version", row.try_get("version")?)?,
        stopped_at_version: parse_optional_u32(
            "stopped_at_version",
            row.try_get("stopped_at_version")?,
        )?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
