use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentConfig, AgentType, Channel};
use crate::domain::chain::ChainConfig;
use crate::errors::ConfigError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoadoutId(pub String);

impl fmt::Display for LoadoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadoutStatus {
    Draft,
    Active,
    Published,
    Archived,
}

impl LoadoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "published" => Some(Self::Published),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn can_activate(&self) -> bool {
        matches!(self, Self::Draft | Self::Published | Self::Active)
    }
}

/// Tenant-local clock offset. Stored as text (`UTC`, `+05:30`, `-0800`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Timezone(FixedOffset);

impl Timezone {
    pub fn utc() -> Self {
        Self(Utc.fix())
    }

    pub fn offset(&self) -> FixedOffset {
        self.0
    }

    pub fn local(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        instant.with_timezone(&self.0)
    }
}

impl Default for Timezone {
    fn default() -> Self {
        Self::utc()
    }
}

impl FromStr for Timezone {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let raw = value.trim();
        if raw.eq_ignore_ascii_case("utc") || raw.eq_ignore_ascii_case("z") || raw.is_empty() {
            return Ok(Self::utc());
        }

        let invalid = || ConfigError::InvalidSettings(format!("unsupported timezone `{raw}`"));
        let (sign, rest) = match raw.as_bytes().first() {
            Some(b'+') => (1, &raw[1..]),
            Some(b'-') => (-1, &raw[1..]),
            _ => return Err(invalid()),
        };
        let digits: String = rest.chars().filter(|ch| *ch != ':').collect();
        if digits.len() != 4 || !digits.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(invalid());
        }
        let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
        let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
        if hours > 14 || minutes > 59 {
            return Err(invalid());
        }

        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).map(Self).ok_or_else(invalid)
    }
}

impl TryFrom<String> for Timezone {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timezone> for String {
    fn from(value: Timezone) -> Self {
        let seconds = value.0.local_minus_utc();
        if seconds == 0 {
            return "UTC".to_string();
        }
        let sign = if seconds < 0 { '-' } else { '+' };
        let seconds = seconds.abs();
        format!("{sign}{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl BusinessHours {
    pub fn contains_hour(&self, hour: u32) -> bool {
        hour >= self.start_hour && hour < self.end_hour
    }
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self { start_hour: 9, end_hour: 17 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadoutSettings {
    #[serde(default)]
    pub timezone: Timezone,
    #[serde(default)]
    pub business_hours: BusinessHours,
    pub max_contacts_per_day: u32,
    pub allowed_channels: Vec<Channel>,
    #[serde(default)]
    pub notification_email: Option<String>,
    #[serde(default)]
    pub webhook_urls: Vec<String>,
}

impl Default for LoadoutSettings {
    fn default() -> Self {
        Self {
            timezone: Timezone::utc(),
            business_hours: BusinessHours::default(),
            max_contacts_per_day: 100,
            allowed_channels: vec![Channel::Email],
            notification_email: None,
            webhook_urls: Vec::new(),
        }
    }
}

impl LoadoutSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let hours = self.business_hours;
        if hours.start_hour >= hours.end_hour || hours.end_hour > 24 {
            return Err(ConfigError::InvalidSettings(format!(
                "business hours must satisfy 0 <= start < end <= 24 (got {}..{})",
                hours.start_hour, hours.end_hour
            )));
        }

        if self.allowed_channels.is_empty() {
            return Err(ConfigError::InvalidSettings(
                "allowed_channels must name at least one channel".to_string(),
            ));
        }

        for url in &self.webhook_urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidSettings(format!(
                    "webhook target `{url}` must start with http:// or https://"
                )));
            }
        }

        if let Some(email) = &self.notification_email {
            if !email.contains('@') {
                return Err(ConfigError::InvalidSettings(format!(
                    "notification email `{email}` is not an address"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadoutConfig {
    pub id: LoadoutId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: String,
    pub industry: Option<String>,
    pub agents: Vec<AgentConfig>,
    pub chain: ChainConfig,
    pub settings: LoadoutSettings,
    pub status: LoadoutStatus,
    pub version: u32,
    pub stopped_at_version: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoadoutConfig {
    pub fn agent(&self, agent_type: AgentType) -> Option<&AgentConfig> {
        self.agents.iter().find(|agent| agent.agent_type == agent_type)
    }

    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentConfig> {
        self.agents.iter().filter(|agent| agent.enabled)
    }

    pub fn is_active(&self) -> bool {
        self.status == LoadoutStatus::Active
    }

    /// True when reactivating this loadout continues existing cursors instead
    /// of starting them over.
    pub fn resumes_on_activation(&self) -> bool {
        self.stopped_at_version == Some(self.version)
    }
}

/// The per-tenant row that names the single active loadout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantActivation {
    pub tenant_id: TenantId,
    pub active_loadout_id: Option<LoadoutId>,
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}

impl TenantActivation {
    pub fn vacant(tenant_id: TenantId) -> Self {
        Self { tenant_id, active_loadout_id: None, version: 0, updated_at: Utc::now() }
    }
}
