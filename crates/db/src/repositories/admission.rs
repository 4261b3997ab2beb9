use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;

use loadout_core::admission::SlotOutcome;
use loadout_core::domain::execution::DedupKey;
use loadout_core::domain::loadout::TenantId;

use super::decode::{day_key, parse_u32};
use super::{AdmissionRepository, RepositoryError};
use crate::DbPool;

#[derive(Clone)]
pub struct SqlAdmissionRepository {
    pool: DbPool,
}

impl SqlAdmissionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AdmissionRepository for SqlAdmissionRepository {
    async fn try_admit(
        &self,
        tenant_id: &TenantId,
        local_day: NaiveDate,
        dedup_key: &DedupKey,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<SlotOutcome, RepositoryError> {
        let day = day_key(local_day);

        // Count and insert in one statement so concurrent workers cannot both
        // take the last slot.
        let inserted = sqlx::query(
            "INSERT INTO admission_slot (tenant_id, local_day, dedup_key, admitted_at)
             SELECT ?, ?, ?, ?
             WHERE (
                SELECT COUNT(*) FROM admission_slot WHERE tenant_id = ? AND local_day = ?
             ) < ?
             ON CONFLICT(tenant_id, local_day, dedup_key) DO NOTHING",
        )
        .bind(&tenant_id.0)
        .bind(&day)
        .bind(dedup_key.as_str())
        .bind(now.to_rfc3339())
        .bind(&tenant_id.0)
        .bind(&day)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            let admitted_today = self.admitted_count(tenant_id, local_day).await?;
            return Ok(SlotOutcome::Granted { admitted_today });
        }

        let held = sqlx::query(
            "SELECT COUNT(*) AS count FROM admission_slot
             WHERE tenant_id = ? AND local_day = ? AND dedup_key = ?",
        )
        .bind(&tenant_id.0)
        .bind(&day)
        .bind(dedup_key.as_str())
        .fetch_one(&self.pool)
        .await?
        .try_get::<i64, _>("count")?;

        Ok(if held > 0 { SlotOutcome::AlreadyGranted } else { SlotOutcome::Exhausted })
    }

    async fn admitted_count(
        &self,
        tenant_id: &TenantId,
        local_day: NaiveDate,
    ) -> Result<u32, RepositoryError> {
        let count = sqlx::query(
            "SELECT COUNT(*) AS count FROM admission_slot WHERE tenant_id = ? AND local_day = ?",
        )
        .bind(&tenant_id.0)
        .bind(day_key(local_day))
        .fetch_one(&self.pool)
        .await?
        .try_get::<i64, _>("count")?;

        parse_u32("count", count)
    }
}
