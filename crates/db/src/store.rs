//! Versioned, tenant-scoped loadout CRUD.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use loadout_core::builder::{build_loadout, revise_loadout, BuildRequest, LoadoutUpdate};
use loadout_core::domain::loadout::{LoadoutConfig, LoadoutId, LoadoutStatus, TenantId};
use loadout_core::errors::ApplicationError;

use crate::repositories::{CursorRepository, LoadoutRepository};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ArchiveOutcome {
    pub loadout: LoadoutConfig,
    pub cursors_removed: u64,
}

#[derive(Clone)]
pub struct ConfigurationStore {
    loadouts: Arc<dyn LoadoutRepository>,
    cursors: Arc<dyn CursorRepository>,
}

impl ConfigurationStore {
    pub fn new(loadouts: Arc<dyn LoadoutRepository>, cursors: Arc<dyn CursorRepository>) -> Self {
        Self { loadouts, cursors }
    }

    pub async fn create(
        &self,
        tenant_id: &TenantId,
        request: BuildRequest,
        now: DateTime<Utc>,
    ) -> Result<LoadoutConfig, ApplicationError> {
        let loadout = build_loadout(tenant_id.clone(), request, now)?;
        self.loadouts.insert(loadout.clone()).await?;

        info!(
            event_name = "store.loadout.created",
            tenant_id = %tenant_id.0,
            loadout_id = %loadout.id.0,
            chain_type = ?loadout.chain.chain_type,
            steps = loadout.chain.steps.len(),
            "loadout created"
        );
        Ok(loadout)
    }

    pub async fn get(
        &self,
        tenant_id: &TenantId,
        id: &LoadoutId,
    ) -> Result<LoadoutConfig, ApplicationError> {
        self.loadouts
            .find_by_id(tenant_id, id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("loadout `{}`", id.0)))
    }

    pub async fn list(&self, tenant_id: &TenantId) -> Result<Vec<LoadoutConfig>, ApplicationError> {
        Ok(self.loadouts.list_for_tenant(tenant_id).await?)
    }

    /// Applies `update` when `expected_version` still matches the stored
    /// loadout. The chain is recompiled and the version bumped.
    pub async fn update(
        &self,
        tenant_id: &TenantId,
        id: &LoadoutId,
        expected_version: u32,
        update: LoadoutUpdate,
        now: DateTime<Utc>,
    ) -> Result<LoadoutConfig, ApplicationError> {
        let current = self.get(tenant_id, id).await?;
        if current.status == LoadoutStatus::Archived {
            return Err(ApplicationError::Conflict(format!("loadout `{}` is archived", id.0)));
        }
        if current.version != expected_version {
            return Err(ApplicationError::Conflict(format!(
                "loadout `{}` is at version {}, not {expected_version}",
                id.0, current.version
            )));
        }

        let revised = revise_loadout(&current, update, now)?;
        self.loadouts.update(revised.clone(), expected_version).await?;

        info!(
            event_name = "store.loadout.updated",
            tenant_id = %tenant_id.0,
            loadout_id = %id.0,
            version = revised.version,
            "loadout updated"
        );
        Ok(revised)
    }

    /// Archives the loadout, clears it from the tenant activation row and
    /// destroys its cursors.
    pub async fn archive(
        &self,
        tenant_id: &TenantId,
        id: &LoadoutId,
        expected_version: u32,
        now: DateTime<Utc>,
    ) -> Result<ArchiveOutcome, ApplicationError> {
        let loadout = self.loadouts.archive(tenant_id, id, expected_version, now).await?;
        let cursors_removed = self.cursors.delete_for_loadout(id).await?;

        info!(
            event_name = "store.loadout.archived",
            tenant_id = %tenant_id.0,
            loadout_id = %id.0,
            cursors_removed,
            "loadout archived"
        );
        Ok(ArchiveOutcome { loadout, cursors_removed })
    }
}
