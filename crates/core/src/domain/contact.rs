use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::agent::{ActionEffect, AgentType, Channel};
use crate::domain::loadout::{LoadoutId, TenantId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(pub String);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStage {
    New,
    Prospect,
    Researched,
    Qualified,
    Contacted,
    Engaged,
    MeetingBooked,
    Won,
    Lost,
    Nurture,
}

impl ContactStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Prospect => "prospect",
            Self::Researched => "researched",
            Self::Qualified => "qualified",
            Self::Contacted => "contacted",
            Self::Engaged => "engaged",
            Self::MeetingBooked => "meeting_booked",
            Self::Won => "won",
            Self::Lost => "lost",
            Self::Nurture => "nurture",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Some(Self::New),
            "prospect" => Some(Self::Prospect),
            "researched" => Some(Self::Researched),
            "qualified" => Some(Self::Qualified),
            "contacted" => Some(Self::Contacted),
            "engaged" => Some(Self::Engaged),
            "meeting_booked" => Some(Self::MeetingBooked),
            "won" => Some(Self::Won),
            "lost" => Some(Self::Lost),
            "nurture" => Some(Self::Nurture),
            _ => None,
        }
    }
}

/// Free-form value stored on a contact by action effects or the CRM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(Decimal),
    Text(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub tenant_id: TenantId,
    pub stage: ContactStage,
    pub score: Decimal,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub opted_out_channels: BTreeSet<Channel>,
    pub last_contacted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(id: impl Into<String>, tenant_id: TenantId, score: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: ContactId(id.into()),
            tenant_id,
            stage: ContactStage::New,
            score,
            tags: BTreeSet::new(),
            attributes: BTreeMap::new(),
            opted_out_channels: BTreeSet::new(),
            last_contacted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn opted_out_of(&self, channel: Channel) -> bool {
        channel != Channel::Internal && self.opted_out_channels.contains(&channel)
    }

    /// Writes a successful action's declared effect back onto the contact.
    pub fn apply_effect(&mut self, effect: &ActionEffect, now: DateTime<Utc>) {
        if effect.is_noop() {
            return;
        }
        if let Some(stage) = effect.stage {
            self.stage = stage;
        }
        for flag in &effect.set_flags {
            self.attributes.insert((*flag).to_string(), AttributeValue::Bool(true));
        }
        if effect.touches_contact {
            self.last_contacted_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Whole days since the last touch, or `None` when never contacted.
    pub fn days_since_contact(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_contacted_at.map(|at| (now - at).num_days().max(0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Enrolled,
    Dispatched,
    Skipped,
    Deferred,
    DispatchFailed,
    NeedsAttention,
    ChainCompleted,
    ChainPaused,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enrolled => "enrolled",
            Self::Dispatched => "dispatched",
            Self::Skipped => "skipped",
            Self::Deferred => "deferred",
            Self::DispatchFailed => "dispatch_failed",
            Self::NeedsAttention => "needs_attention",
            Self::ChainCompleted => "chain_completed",
            Self::ChainPaused => "chain_paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "enrolled" => Some(Self::Enrolled),
            "dispatched" => Some(Self::Dispatched),
            "skipped" => Some(Self::Skipped),
            "deferred" => Some(Self::Deferred),
            "dispatch_failed" => Some(Self::DispatchFailed),
            "needs_attention" => Some(Self::NeedsAttention),
            "chain_completed" => Some(Self::ChainCompleted),
            "chain_paused" => Some(Self::ChainPaused),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: String,
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    pub loadout_id: LoadoutId,
    pub kind: ActivityKind,
    pub agent_type: Option<AgentType>,
    pub action: Option<String>,
    pub detail: String,
    pub external_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}
