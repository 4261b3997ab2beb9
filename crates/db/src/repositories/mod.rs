use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use loadout_core::admission::SlotOutcome;
use loadout_core::domain::contact::{ActivityEntry, Contact, ContactId};
use loadout_core::domain::execution::{CursorId, DedupKey, DispatchRecord, ExecutionCursor};
use loadout_core::domain::loadout::{LoadoutConfig, LoadoutId, TenantActivation, TenantId};
use loadout_core::errors::ApplicationError;

pub mod admission;
pub mod contact;
pub mod cursor;
mod decode;
pub mod ledger;
pub mod loadout;
pub mod memory;

pub use admission::SqlAdmissionRepository;
pub use contact::SqlContactRepository;
pub use cursor::SqlCursorRepository;
pub use ledger::SqlDispatchLedgerRepository;
pub use loadout::SqlLoadoutRepository;
pub use memory::{
    InMemoryAdmissionRepository, InMemoryContactRepository, InMemoryCursorRepository,
    InMemoryDispatchLedgerRepository, InMemoryLoadoutRepository,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("version conflict on `{id}`: expected version {expected}")]
    VersionConflict { id: String, expected: u32 },
    #[error(
        "activation conflict for tenant `{tenant_id}`: expected version {expected}, found {actual}"
    )]
    ActivationConflict { tenant_id: String, expected: u32, actual: u32 },
}

impl RepositoryError {
    /// SQLite lock contention; the whole operation may be retried.
    pub fn is_contention(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(error)) => {
                matches!(error.code().as_deref(), Some("5" | "6" | "261" | "262" | "517"))
            }
            Self::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::NotFound(what) => Self::NotFound(what),
            RepositoryError::VersionConflict { .. }
            | RepositoryError::ActivationConflict { .. } => Self::Conflict(error.to_string()),
            RepositoryError::Database(_) | RepositoryError::Decode(_) => {
                Self::Persistence(error.to_string())
            }
        }
    }
}

/// What one swap of the tenant activation row changed.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivationCommit {
    pub activation: TenantActivation,
    /// The loadout now active, as stored after the swap.
    pub activated: Option<LoadoutConfig>,
    /// The loadout moved back to draft, with `stopped_at_version` recorded.
    pub stopped: Option<LoadoutConfig>,
}

#[async_trait]
pub trait LoadoutRepository: Send + Sync {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &LoadoutId,
    ) -> Result<Option<LoadoutConfig>, RepositoryError>;

    async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<LoadoutConfig>, RepositoryError>;

    async fn list_active(&self) -> Result<Vec<LoadoutConfig>, RepositoryError>;

    async fn insert(&self, loadout: LoadoutConfig) -> Result<(), RepositoryError>;

    /// Writes the structural fields of `loadout` if the stored version still
    /// equals `expected_version`. Status is owned by activation and archive.
    async fn update(
        &self,
        loadout: LoadoutConfig,
        expected_version: u32,
    ) -> Result<(), RepositoryError>;

    /// Versioned archive. Clears the tenant activation row when it points at
    /// this loadout.
    async fn archive(
        &self,
        tenant_id: &TenantId,
        id: &LoadoutId,
        expected_version: u32,
        now: DateTime<Utc>,
    ) -> Result<LoadoutConfig, RepositoryError>;

    async fn tenant_activation(
        &self,
        tenant_id: &TenantId,
    ) -> Result<TenantActivation, RepositoryError>;

    /// Points the tenant activation row at `target` (or clears it) in one
    /// transaction: the previous active loadout drops to draft first, then the
    /// target becomes active. Fails with `ActivationConflict` when the row's
    /// version is not `expected_version`.
    async fn swap_active(
        &self,
        tenant_id: &TenantId,
        target: Option<&LoadoutId>,
        expected_version: u32,
        now: DateTime<Utc>,
    ) -> Result<ActivationCommit, RepositoryError>;
}

#[async_trait]
pub trait CursorRepository: Send + Sync {
    async fn find(&self, id: &CursorId) -> Result<Option<ExecutionCursor>, RepositoryError>;

    async fn list_for_loadout(
        &self,
        loadout_id: &LoadoutId,
    ) -> Result<Vec<ExecutionCursor>, RepositoryError>;

    /// Advancing cursors due at `now` whose lease is free or lapsed, oldest
    /// wake-up first.
    async fn list_due(
        &self,
        loadout_id: &LoadoutId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExecutionCursor>, RepositoryError>;

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionCursor>, RepositoryError>;

    /// Returns `false` when the loadout already holds a cursor for the contact.
    async fn insert(&self, cursor: ExecutionCursor) -> Result<bool, RepositoryError>;

    /// Replaces the stored cursor when its `state_version` is still
    /// `expected_state_version`. Returns `false` when another writer won.
    async fn compare_and_swap(
        &self,
        cursor: ExecutionCursor,
        expected_state_version: u32,
    ) -> Result<bool, RepositoryError>;

    async fn delete(
        &self,
        id: &CursorId,
        expected_state_version: u32,
    ) -> Result<bool, RepositoryError>;

    async fn delete_for_loadout(&self, loadout_id: &LoadoutId) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait DispatchLedgerRepository: Send + Sync {
    async fn find(&self, dedup_key: &DedupKey) -> Result<Option<DispatchRecord>, RepositoryError>;

    /// Inserts `record` unless its dedup key is already present, and returns
    /// whatever is stored under the key afterwards.
    async fn reserve(&self, record: DispatchRecord) -> Result<DispatchRecord, RepositoryError>;

    async fn save(&self, record: DispatchRecord) -> Result<(), RepositoryError>;

    async fn list_for_contact(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<Vec<DispatchRecord>, RepositoryError>;
}

#[async_trait]
pub trait AdmissionRepository: Send + Sync {
    /// Takes one slot of the tenant's daily cap for `dedup_key`. Repeat
    /// requests for a key that already holds a slot do not consume another.
    async fn try_admit(
        &self,
        tenant_id: &TenantId,
        local_day: NaiveDate,
        dedup_key: &DedupKey,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<SlotOutcome, RepositoryError>;

    async fn admitted_count(
        &self,
        tenant_id: &TenantId,
        local_day: NaiveDate,
    ) -> Result<u32, RepositoryError>;
}

#[async_trait]
pub trait ContactRepository: Send + Sync {
    async fn find(
        &self,
        tenant_id: &TenantId,
        id: &ContactId,
    ) -> Result<Option<Contact>, RepositoryError>;

    async fn save(&self, contact: Contact) -> Result<(), RepositoryError>;

    async fn append_activity(&self, entry: ActivityEntry) -> Result<(), RepositoryError>;

    async fn list_activity(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<Vec<ActivityEntry>, RepositoryError>;
}
