use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::agent::{Action, AgentType, Channel};
use crate::domain::contact::ContactId;
use crate::domain::loadout::{LoadoutId, TenantId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorId(pub String);

impl CursorId {
    /// Cursors are keyed by loadout and contact; a loadout version change
    /// rewrites the existing cursor instead of creating a second one.
    pub fn for_contact(loadout_id: &LoadoutId, contact_id: &ContactId) -> Self {
        Self(format!("{}:{}", loadout_id.0, contact_id.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorState {
    Advancing,
    Paused,
    NeedsAttention,
    Completed,
}

impl CursorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advancing => "advancing",
            Self::Paused => "paused",
            Self::NeedsAttention => "needs_attention",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "advancing" => Some(Self::Advancing),
            "paused" => Some(Self::Paused),
            "needs_attention" => Some(Self::NeedsAttention),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Per-contact progress through one loadout's chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCursor {
    pub id: CursorId,
    pub tenant_id: TenantId,
    pub loadout_id: LoadoutId,
    pub loadout_version: u32,
    pub contact_id: ContactId,
    pub step_index: u32,
    pub attempts: u32,
    pub state: CursorState,
    pub due_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionCursor {
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_expires_at.is_some_and(|expiry| expiry > now)
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.state == CursorState::Advancing && self.due_at <= now
    }
}

/// Idempotency key for one dispatch: contact, step, tenant-local calendar day
/// and loadout version. Stored as a SHA-256 hex digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey(pub String);

impl DedupKey {
    pub fn derive(
        loadout_id: &LoadoutId,
        loadout_version: u32,
        contact_id: &ContactId,
        step_index: u32,
        local_day: NaiveDate,
    ) -> Self {
        let material = format!(
            "{}|v{}|{}|{}|{}",
            loadout_id.0,
            loadout_version,
            contact_id.0,
            step_index,
            local_day.format("%Y-%m-%d")
        );
        let mut hasher = Sha256::new();
        hasher.update(material.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Reserved,
    Completed,
    Failed,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reserved" => Some(Self::Reserved),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Ledger row guarding one external side effect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub dedup_key: DedupKey,
    pub tenant_id: TenantId,
    pub loadout_id: LoadoutId,
    pub loadout_version: u32,
    pub contact_id: ContactId,
    pub step_index: u32,
    pub agent_type: AgentType,
    pub action: Action,
    pub channel: Channel,
    pub state: DispatchState,
    pub external_ref: Option<String>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchRecord {
    pub fn is_completed(&self) -> bool {
        self.state == DispatchState::Completed && self.external_ref.is_some()
    }
}
