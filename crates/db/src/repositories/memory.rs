use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use loadout_core::admission::SlotOutcome;
use loadout_core::domain::contact::{ActivityEntry, Contact, ContactId};
use loadout_core::domain::execution::{
    CursorId, CursorState, DedupKey, DispatchRecord, ExecutionCursor,
};
use loadout_core::domain::loadout::{
    LoadoutConfig, LoadoutId, LoadoutStatus, TenantActivation, TenantId,
};

use super::{
    ActivationCommit, AdmissionRepository, ContactRepository, CursorRepository,
    DispatchLedgerRepository, LoadoutRepository, RepositoryError,
};

#[derive(Default)]
struct LoadoutTables {
    loadouts: HashMap<String, LoadoutConfig>,
    activations: HashMap<String, TenantActivation>,
}

#[derive(Default)]
pub struct InMemoryLoadoutRepository {
    tables: RwLock<LoadoutTables>,
}

impl LoadoutTables {
    fn owned(&self, tenant_id: &TenantId, id: &LoadoutId) -> Option<&LoadoutConfig> {
        self.loadouts.get(&id.0).filter(|loadout| &loadout.tenant_id == tenant_id)
    }

    fn activation(&self, tenant_id: &TenantId) -> TenantActivation {
        self.activations
            .get(&tenant_id.0)
            .cloned()
            .unwrap_or_else(|| TenantActivation::vacant(tenant_id.clone()))
    }
}

#[async_trait::async_trait]
impl LoadoutRepository for InMemoryLoadoutRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &LoadoutId,
    ) -> Result<Option<LoadoutConfig>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.owned(tenant_id, id).cloned())
    }

    async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<LoadoutConfig>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut loadouts = tables
            .loadouts
            .values()
            .filter(|loadout| &loadout.tenant_id == tenant_id)
            .cloned()
            .collect::<Vec<_>>();
        loadouts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(loadouts)
    }

    async fn list_active(&self) -> Result<Vec<LoadoutConfig>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut active = tables
            .loadouts
            .values()
            .filter(|loadout| loadout.is_active())
            .cloned()
            .collect::<Vec<_>>();
        active.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(active)
    }

    async fn insert(&self, loadout: LoadoutConfig) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.loadouts.contains_key(&loadout.id.0) {
            return Err(RepositoryError::VersionConflict {
                id: loadout.id.0.clone(),
                expected: 0,
            });
        }
        tables.loadouts.insert(loadout.id.0.clone(), loadout);
        Ok(())
    }

    async fn update(
        &self,
        loadout: LoadoutConfig,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .loadouts
            .get_mut(&loadout.id.0)
            .filter(|stored| stored.tenant_id == loadout.tenant_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("loadout `{}`", loadout.id.0)))?;
        if stored.version != expected_version || stored.status == LoadoutStatus::Archived {
            return Err(RepositoryError::VersionConflict {
                id: loadout.id.0.clone(),
                expected: expected_version,
            });
        }

        let status = stored.status;
        let stopped_at_version = stored.stopped_at_version;
        *stored = LoadoutConfig { status, stopped_at_version, ..loadout };
        Ok(())
    }

    async fn archive(
        &self,
        tenant_id: &TenantId,
        id: &LoadoutId,
        expected_version: u32,
        now: DateTime<Utc>,
    ) -> Result<LoadoutConfig, RepositoryError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .loadouts
            .get_mut(&id.0)
            .filter(|stored| &stored.tenant_id == tenant_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("loadout `{}`", id.0)))?;
        if stored.version != expected_version || stored.status == LoadoutStatus::Archived {
            return Err(RepositoryError::VersionConflict {
                id: id.0.clone(),
                expected: expected_version,
            });
        }
        stored.status = LoadoutStatus::Archived;
        stored.version += 1;
        stored.updated_at = now;
        let archived = stored.clone();

        if let Some(row) = tables.activations.get_mut(&tenant_id.0) {
            if row.active_loadout_id.as_ref() == Some(id) {
                row.active_loadout_id = None;
                row.version += 1;
                row.updated_at = now;
            }
        }
        Ok(archived)
    }

    async fn tenant_activation(
        &self,
        tenant_id: &TenantId,
    ) -> Result<TenantActivation, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.activation(tenant_id))
    }

    async fn swap_active(
        &self,
        tenant_id: &TenantId,
        target: Option<&LoadoutId>,
        expected_version: u32,
        now: DateTime<Utc>,
    ) -> Result<ActivationCommit, RepositoryError> {
        let mut tables = self.tables.write().await;

        let current = tables.activation(tenant_id);
        if current.version != expected_version {
            return Err(RepositoryError::ActivationConflict {
                tenant_id: tenant_id.0.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }

        if let Some(target) = target {
            let activatable = tables
                .owned(tenant_id, target)
                .is_some_and(|loadout| loadout.status != LoadoutStatus::Archived);
            if !activatable {
                return Err(RepositoryError::NotFound(format!(
                    "activatable loadout `{}` for tenant `{}`",
                    target.0, tenant_id.0
                )));
            }
        }

        let mut stopped = None;
        if let Some(previous) = current.active_loadout_id.as_ref().filter(|id| Some(*id) != target)
        {
            if let Some(loadout) = tables.loadouts.get_mut(&previous.0) {
                if loadout.status == LoadoutStatus::Active {
                    loadout.status = LoadoutStatus::Draft;
                    loadout.stopped_at_version = Some(loadout.version);
                    loadout.updated_at = now;
                }
                stopped = Some(loadout.clone());
            }
        }

        let mut activated = None;
        if let Some(loadout) = target.and_then(|target| tables.loadouts.get_mut(&target.0)) {
            loadout.status = LoadoutStatus::Active;
            loadout.updated_at = now;
            activated = Some(loadout.clone());
        }

        let activation = TenantActivation {
            tenant_id: tenant_id.clone(),
            active_loadout_id: target.cloned(),
            version: expected_version + 1,
            updated_at: now,
        };
        tables.activations.insert(tenant_id.0.clone(), activation.clone());

        Ok(ActivationCommit { activation, activated, stopped })
    }
}

#[derive(Default)]
pub struct InMemoryCursorRepository {
    cursors: RwLock<HashMap<String, ExecutionCursor>>,
}

#[async_trait::async_trait]
impl CursorRepository for InMemoryCursorRepository {
    async fn find(&self, id: &CursorId) -> Result<Option<ExecutionCursor>, RepositoryError> {
        let cursors = self.cursors.read().await;
        Ok(cursors.get(&id.0).cloned())
    }

    async fn list_for_loadout(
        &self,
        loadout_id: &LoadoutId,
    ) -> Result<Vec<ExecutionCursor>, RepositoryError> {
        let cursors = self.cursors.read().await;
        let mut listed = cursors
            .values()
            .filter(|cursor| &cursor.loadout_id == loadout_id)
            .cloned()
            .collect::<Vec<_>>();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(listed)
    }

    async fn list_due(
        &self,
        loadout_id: &LoadoutId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExecutionCursor>, RepositoryError> {
        let cursors = self.cursors.read().await;
        let mut due = cursors
            .values()
            .filter(|cursor| {
                &cursor.loadout_id == loadout_id
                    && cursor.state == CursorState::Advancing
                    && cursor.due_at <= now
                    && !cursor.is_leased_at(now)
            })
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.0.cmp(&b.id.0)));
        due.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(due)
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionCursor>, RepositoryError> {
        let cursors = self.cursors.read().await;
        Ok(cursors
            .values()
            .filter(|cursor| {
                cursor.lease_owner.is_some()
                    && cursor.lease_expires_at.is_some_and(|expiry| expiry <= now)
            })
            .cloned()
            .collect())
    }

    async fn insert(&self, cursor: ExecutionCursor) -> Result<bool, RepositoryError> {
        let mut cursors = self.cursors.write().await;
        if cursors.contains_key(&cursor.id.0) {
            return Ok(false);
        }
        cursors.insert(cursor.id.0.clone(), cursor);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        cursor: ExecutionCursor,
        expected_state_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut cursors = self.cursors.write().await;
        match cursors.get_mut(&cursor.id.0) {
            Some(stored) if stored.state_version == expected_state_version => {
                *stored = cursor;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(
        &self,
        id: &CursorId,
        expected_state_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut cursors = self.cursors.write().await;
        let matches =
            cursors.get(&id.0).is_some_and(|stored| stored.state_version == expected_state_version);
        if matches {
            cursors.remove(&id.0);
        }
        Ok(matches)
    }

    async fn delete_for_loadout(&self, loadout_id: &LoadoutId) -> Result<u64, RepositoryError> {
        let mut cursors = self.cursors.write().await;
        let before = cursors.len();
        cursors.retain(|_, cursor| &cursor.loadout_id != loadout_id);
        Ok((before - cursors.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryDispatchLedgerRepository {
    records: RwLock<HashMap<String, DispatchRecord>>,
}

#[async_trait::async_trait]
impl DispatchLedgerRepository for InMemoryDispatchLedgerRepository {
    async fn find(&self, dedup_key: &DedupKey) -> Result<Option<DispatchRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(dedup_key.as_str()).cloned())
    }

    async fn reserve(&self, record: DispatchRecord) -> Result<DispatchRecord, RepositoryError> {
        let mut records = self.records.write().await;
        Ok(records.entry(record.dedup_key.0.clone()).or_insert(record).clone())
    }

    async fn save(&self, record: DispatchRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        records.insert(record.dedup_key.0.clone(), record);
        Ok(())
    }

    async fn list_for_contact(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<Vec<DispatchRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut listed = records
            .values()
            .filter(|record| &record.tenant_id == tenant_id && &record.contact_id == contact_id)
            .cloned()
            .collect::<Vec<_>>();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(listed)
    }
}

#[derive(Default)]
pub struct InMemoryAdmissionRepository {
    slots: RwLock<HashMap<(String, NaiveDate), BTreeSet<String>>>,
}

#[async_trait::async_trait]
impl AdmissionRepository for InMemoryAdmissionRepository {
    async fn try_admit(
        &self,
        tenant_id: &TenantId,
        local_day: NaiveDate,
        dedup_key: &DedupKey,
        limit: u32,
        _now: DateTime<Utc>,
    ) -> Result<SlotOutcome, RepositoryError> {
        let mut slots = self.slots.write().await;
        let held = slots.entry((tenant_id.0.clone(), local_day)).or_default();

        if held.contains(dedup_key.as_str()) {
            return Ok(SlotOutcome::AlreadyGranted);
        }
        if held.len() >= usize::try_from(limit).unwrap_or(usize::MAX) {
            return Ok(SlotOutcome::Exhausted);
        }
        held.insert(dedup_key.0.clone());
        Ok(SlotOutcome::Granted { admitted_today: u32::try_from(held.len()).unwrap_or(u32::MAX) })
    }

    async fn admitted_count(
        &self,
        tenant_id: &TenantId,
        local_day: NaiveDate,
    ) -> Result<u32, RepositoryError> {
        let slots = self.slots.read().await;
        let count = slots.get(&(tenant_id.0.clone(), local_day)).map_or(0, BTreeSet::len);
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

#[derive(Default)]
pub struct InMemoryContactRepository {
    contacts: RwLock<HashMap<(String, String), Contact>>,
    activity: RwLock<Vec<ActivityEntry>>,
}

#[async_trait::async_trait]
impl ContactRepository for InMemoryContactRepository {
    async fn find(
        &self,
        tenant_id: &TenantId,
        id: &ContactId,
    ) -> Result<Option<Contact>, RepositoryError> {
        let contacts = self.contacts.read().await;
        Ok(contacts.get(&(tenant_id.0.clone(), id.0.clone())).cloned())
    }

    async fn save(&self, contact: Contact) -> Result<(), RepositoryError> {
        let mut contacts = self.contacts.write().await;
        contacts.insert((contact.tenant_id.0.clone(), contact.id.0.clone()), contact);
        Ok(())
    }

    async fn append_activity(&self, entry: ActivityEntry) -> Result<(), RepositoryError> {
        let mut activity = self.activity.write().await;
        activity.push(entry);
        Ok(())
    }

    async fn list_activity(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<Vec<ActivityEntry>, RepositoryError> {
        let activity = self.activity.read().await;
        Ok(activity
            .iter()
            .filter(|entry| &entry.tenant_id == tenant_id && &entry.contact_id == contact_id)
            .cloned()
            .collect())
    }
}
