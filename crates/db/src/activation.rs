//! Single-active-loadout enforcement.
//!
//! Every activation and deactivation is one swap of the tenant activation
//! row. The swap either lands completely or not at all; lock contention
//! retries the whole swap, and a stale row version surfaces as a conflict.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use loadout_core::domain::loadout::{
    LoadoutConfig, LoadoutId, LoadoutStatus, TenantActivation, TenantId,
};
use loadout_core::errors::ApplicationError;

use crate::repositories::{ActivationCommit, LoadoutRepository, RepositoryError};

const MAX_SWAP_ATTEMPTS: u32 = 4;
const CONTENTION_BACKOFF_MS: u64 = 20;

/// How existing cursors behave after an activation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Same version that was stopped: cursors continue from their index.
    Resume,
    /// New or edited version: cursors restart at step 0.
    Restart,
    /// The loadout was already active; nothing changed.
    AlreadyActive,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActivationReport {
    pub activation: TenantActivation,
    pub loadout: LoadoutConfig,
    pub mode: ResumeMode,
    pub stopped: Option<LoadoutConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeactivationReport {
    pub activation: TenantActivation,
    pub stopped: LoadoutConfig,
}

#[derive(Clone)]
pub struct ActivationManager {
    loadouts: Arc<dyn LoadoutRepository>,
}

impl ActivationManager {
    pub fn new(loadouts: Arc<dyn LoadoutRepository>) -> Self {
        Self { loadouts }
    }

    pub async fn current(
        &self,
        tenant_id: &TenantId,
    ) -> Result<TenantActivation, ApplicationError> {
        Ok(self.loadouts.tenant_activation(tenant_id).await?)
    }

    /// Makes `loadout_id` the tenant's only active loadout.
    ///
    /// With `expected_version` the caller pins the activation row version it
    /// last saw and receives a conflict if someone else swapped first. Without
    /// it the manager re-reads the row and tries again.
    pub async fn activate(
        &self,
        tenant_id: &TenantId,
        loadout_id: &LoadoutId,
        expected_version: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<ActivationReport, ApplicationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let target = self.require_loadout(tenant_id, loadout_id).await?;
            if target.status == LoadoutStatus::Archived {
                return Err(ApplicationError::Conflict(format!(
                    "loadout `{}` is archived and cannot be activated",
                    loadout_id.0
                )));
            }

            let current = self.loadouts.tenant_activation(tenant_id).await?;
            if let Some(expected) = expected_version {
                if expected != current.version {
                    return Err(RepositoryError::ActivationConflict {
                        tenant_id: tenant_id.0.clone(),
                        expected,
                        actual: current.version,
                    }
                    .into());
                }
            }

            if current.active_loadout_id.as_ref() == Some(loadout_id) && target.is_active() {
                return Ok(ActivationReport {
                    activation: current,
                    loadout: target,
                    mode: ResumeMode::AlreadyActive,
                    stopped: None,
                });
            }

            let mode = if target.resumes_on_activation() {
                ResumeMode::Resume
            } else {
                ResumeMode::Restart
            };

            match self.loadouts.swap_active(tenant_id, Some(loadout_id), current.version, now).await
            {
                Ok(ActivationCommit { activation, activated, stopped }) => {
                    let loadout = activated.unwrap_or(target);
                    info!(
                        event_name = "activation.loadout.activated",
                        tenant_id = %tenant_id.0,
                        loadout_id = %loadout_id.0,
                        loadout_version = loadout.version,
                        activation_version = activation.version,
                        mode = ?mode,
                        stopped_loadout_id = stopped.as_ref().map(|stopped| stopped.id.0.as_str()),
                        "loadout activated"
                    );
                    return Ok(ActivationReport { activation, loadout, mode, stopped });
                }
                Err(error) if self.should_retry(&error, expected_version, attempt) => {
                    self.back_off(tenant_id, &error, attempt).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Stops the tenant's active loadout. Scheduling halts; the loadout keeps
    /// its cursors and records the version it was stopped at.
    pub async fn deactivate(
        &self,
        tenant_id: &TenantId,
        loadout_id: &LoadoutId,
        expected_version: u32,
        now: DateTime<Utc>,
    ) -> Result<DeactivationReport, ApplicationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let current = self.loadouts.tenant_activation(tenant_id).await?;
            if current.active_loadout_id.as_ref() != Some(loadout_id) {
                return Err(ApplicationError::Conflict(format!(
                    "loadout `{}` is not the active loadout for tenant `{}`",
                    loadout_id.0, tenant_id.0
                )));
            }

            match self.loadouts.swap_active(tenant_id, None, expected_version, now).await {
                Ok(ActivationCommit { activation, stopped: Some(stopped), .. }) => {
                    info!(
                        event_name = "activation.loadout.deactivated",
                        tenant_id = %tenant_id.0,
                        loadout_id = %loadout_id.0,
                        stopped_at_version = stopped.stopped_at_version,
                        activation_version = activation.version,
                        "loadout deactivated"
                    );
                    return Ok(DeactivationReport { activation, stopped });
                }
                Ok(ActivationCommit { .. }) => {
                    return Err(ApplicationError::NotFound(format!("loadout `{}`", loadout_id.0)));
                }
                Err(error) if self.should_retry(&error, Some(expected_version), attempt) => {
                    self.back_off(tenant_id, &error, attempt).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn require_loadout(
        &self,
        tenant_id: &TenantId,
        loadout_id: &LoadoutId,
    ) -> Result<LoadoutConfig, ApplicationError> {
        self.loadouts
            .find_by_id(tenant_id, loadout_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("loadout `{}`", loadout_id.0)))
    }

    fn should_retry(
        &self,
        error: &RepositoryError,
        expected_version: Option<u32>,
        attempt: u32,
    ) -> bool {
        if attempt >= MAX_SWAP_ATTEMPTS {
            return false;
        }
        match error {
            RepositoryError::ActivationConflict { .. } => expected_version.is_none(),
            other => other.is_contention(),
        }
    }

    async fn back_off(&self, tenant_id: &TenantId, error: &RepositoryError, attempt: u32) {
        warn!(
            event_name = "activation.swap.retry",
            tenant_id = %tenant_id.0,
            attempt,
            error = %error,
            "activation swap did not commit; retrying"
        );
        tokio::time::sleep(Duration::from_millis(CONTENTION_BACKOFF_MS * u64::from(attempt)))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Utc};

    use loadout_core::builder::{build_loadout, BuildRequest};
    use loadout_core::domain::loadout::{LoadoutConfig, LoadoutStatus, TenantId};
    use loadout_core::errors::ApplicationError;

    use super::{ActivationManager, ResumeMode};
    use crate::repositories::{
        InMemoryLoadoutRepository, LoadoutRepository, SqlLoadoutRepository,
    };
    use crate::{connect_with_settings, migrations};

    fn tenant() -> TenantId {
        TenantId("tenant-a".to_string())
    }

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-04T10:00:00Z").expect("valid").with_timezone(&Utc)
    }

    fn loadout(preset: &str) -> LoadoutConfig {
        build_loadout(tenant(), BuildRequest::from_preset(preset, preset), at()).expect("builds")
    }

    async fn active_ids(repo: &dyn LoadoutRepository) -> Vec<String> {
        repo.list_active()
            .await
            .expect("list active")
            .into_iter()
            .filter(|loadout| loadout.tenant_id == tenant())
            .map(|loadout| loadout.id.0)
            .collect()
    }

    #[tokio::test]
    async fn activating_b_while_a_is_active_leaves_only_b_active() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let repo = Arc::new(SqlLoadoutRepository::new(pool.clone()));
        let manager = ActivationManager::new(repo.clone());

        let a = loadout("saas");
        let b = loadout("agency");
        repo.insert(a.clone()).await.expect("insert a");
        repo.insert(b.clone()).await.expect("insert b");

        let first = manager.activate(&tenant(), &a.id, None, at()).await.expect("activate a");
        assert_eq!(first.mode, ResumeMode::Restart);
        assert_eq!(active_ids(repo.as_ref()).await, vec![a.id.0.clone()]);

        let second = manager.activate(&tenant(), &b.id, None, at()).await.expect("activate b");
        assert_eq!(second.stopped.as_ref().map(|stopped| &stopped.id), Some(&a.id));
        assert_eq!(active_ids(repo.as_ref()).await, vec![b.id.0.clone()]);

        let stopped_a = repo.find_by_id(&tenant(), &a.id).await.expect("find").expect("row");
        assert_eq!(stopped_a.status, LoadoutStatus::Draft);
        assert_eq!(stopped_a.stopped_at_version, Some(stopped_a.version));

        pool.close().await;
    }

    #[tokio::test]
    async fn reactivating_the_stopped_version_resumes_and_an_edit_restarts() {
        let repo = Arc::new(InMemoryLoadoutRepository::default());
        let manager = ActivationManager::new(repo.clone());
        let a = loadout("saas");
        repo.insert(a.clone()).await.expect("insert");

        let activated = manager.activate(&tenant(), &a.id, None, at()).await.expect("activate");
        let stopped = manager
            .deactivate(&tenant(), &a.id, activated.activation.version, at())
            .await
            .expect("deactivate");
        assert_eq!(stopped.stopped.stopped_at_version, Some(1));
        assert_eq!(stopped.activation.active_loadout_id, None);

        let resumed = manager.activate(&tenant(), &a.id, None, at()).await.expect("reactivate");
        assert_eq!(resumed.mode, ResumeMode::Resume);

        let again = manager.activate(&tenant(), &a.id, None, at()).await.expect("idempotent");
        assert_eq!(again.mode, ResumeMode::AlreadyActive);

        let deactivated = manager
            .deactivate(&tenant(), &a.id, resumed.activation.version, at())
            .await
            .expect("deactivate again");
        let mut edited = deactivated.stopped.clone();
        edited.version += 1;
        repo.update(edited, deactivated.stopped.version).await.expect("edit");

        let restarted = manager.activate(&tenant(), &a.id, None, at()).await.expect("activate");
        assert_eq!(restarted.mode, ResumeMode::Restart);
    }

    #[tokio::test]
    async fn pinned_stale_activation_version_is_a_conflict() {
        let repo = Arc::new(InMemoryLoadoutRepository::default());
        let manager = ActivationManager::new(repo.clone());
        let a = loadout("saas");
        let b = loadout("agency");
        repo.insert(a.clone()).await.expect("insert");
        repo.insert(b.clone()).await.expect("insert");

        manager.activate(&tenant(), &a.id, Some(0), at()).await.expect("activate a");
        let stale = manager.activate(&tenant(), &b.id, Some(0), at()).await;
        assert!(matches!(stale, Err(ApplicationError::Conflict(_))));
        assert_eq!(active_ids(repo.as_ref()).await, vec![a.id.0.clone()]);
    }

    #[tokio::test]
    async fn concurrent_activations_leave_exactly_one_active_loadout() {
        let repo = Arc::new(InMemoryLoadoutRepository::default());
        let manager = ActivationManager::new(repo.clone());
        let candidates = ["saas", "agency", "recruiting", "ecommerce"]
            .into_iter()
            .map(loadout)
            .collect::<Vec<_>>();
        for candidate in &candidates {
            repo.insert(candidate.clone()).await.expect("insert");
        }

        let handles = candidates
            .iter()
            .map(|candidate| {
                let manager = manager.clone();
                let id = candidate.id.clone();
                tokio::spawn(async move { manager.activate(&tenant(), &id, None, at()).await })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.expect("join").expect("activation eventually commits");
        }

        let active = active_ids(repo.as_ref()).await;
        assert_eq!(active.len(), 1);
        let row = manager.current(&tenant()).await.expect("row");
        assert_eq!(row.active_loadout_id.map(|id| id.0), active.first().cloned());
    }

    #[tokio::test]
    async fn archived_or_missing_loadouts_cannot_be_activated() {
        let repo = Arc::new(InMemoryLoadoutRepository::default());
        let manager = ActivationManager::new(repo.clone());
        let a = loadout("saas");
        repo.insert(a.clone()).await.expect("insert");
        repo.archive(&tenant(), &a.id, 1, at()).await.expect("archive");

        let archived = manager.activate(&tenant(), &a.id, None, at()).await;
        assert!(matches!(archived, Err(ApplicationError::Conflict(_))));

        let missing = manager.activate(&tenant(), &loadout("saas").id, None, at()).await;
        assert!(matches!(missing, Err(ApplicationError::NotFound(_))));
    }
}
