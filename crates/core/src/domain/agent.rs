use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::contact::ContactStage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Scout,
    Researcher,
    Qualifier,
    Outreach,
    Closer,
    Ops,
    Caller,
}

impl AgentType {
    pub const ALL: [AgentType; 7] = [
        Self::Scout,
        Self::Researcher,
        Self::Qualifier,
        Self::Outreach,
        Self::Closer,
        Self::Ops,
        Self::Caller,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scout => "scout",
            Self::Researcher => "researcher",
            Self::Qualifier => "qualifier",
            Self::Outreach => "outreach",
            Self::Closer => "closer",
            Self::Ops => "ops",
            Self::Caller => "caller",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scout" => Some(Self::Scout),
            "researcher" => Some(Self::Researcher),
            "qualifier" => Some(Self::Qualifier),
            "outreach" => Some(Self::Outreach),
            "closer" => Some(Self::Closer),
            "ops" => Some(Self::Ops),
            "caller" => Some(Self::Caller),
            _ => None,
        }
    }

    /// The action compiled for this agent when the chain uses default steps.
    pub fn default_action(&self) -> Action {
        match self {
            Self::Scout => Action::DiscoverLeads,
            Self::Researcher => Action::EnrichContact,
            Self::Qualifier => Action::Qualify,
            Self::Outreach => Action::EnrollSequence,
            Self::Closer => Action::BookMeeting,
            Self::Ops => Action::SyncCrm,
            Self::Caller => Action::PlaceCall,
        }
    }

    /// Agents that reach the contact through a messaging or voice channel.
    pub fn is_contact_facing(&self) -> bool {
        matches!(self, Self::Outreach | Self::Closer | Self::Caller)
    }

    pub fn default_channels(&self) -> Vec<Channel> {
        match self {
            Self::Outreach => vec![Channel::Email, Channel::Sms, Channel::Whatsapp],
            Self::Closer => vec![Channel::Email, Channel::Social],
            Self::Caller => vec![Channel::Voice],
            Self::Scout | Self::Researcher | Self::Qualifier | Self::Ops => {
                vec![Channel::Internal]
            }
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Whatsapp,
    Social,
    Voice,
    Internal,
}

impl Channel {
    pub const ALL: [Channel; 6] =
        [Self::Email, Self::Sms, Self::Whatsapp, Self::Social, Self::Voice, Self::Internal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Whatsapp => "whatsapp",
            Self::Social => "social",
            Self::Voice => "voice",
            Self::Internal => "internal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "email" => Some(Self::Email),
            "sms" => Some(Self::Sms),
            "whatsapp" => Some(Self::Whatsapp),
            "social" => Some(Self::Social),
            "voice" => Some(Self::Voice),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named action a chain step asks an agent to perform.
///
/// Known actions carry a declared effect on the contact; anything else is a
/// `Custom` action that is dispatched verbatim and has no effect.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Action {
    DiscoverLeads,
    EnrichContact,
    Qualify,
    EnrollSequence,
    BookMeeting,
    SyncCrm,
    PlaceCall,
    Custom(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Self::DiscoverLeads => "discover_leads",
            Self::EnrichContact => "enrich_contact",
            Self::Qualify => "qualify",
            Self::EnrollSequence => "enroll_sequence",
            Self::BookMeeting => "book_meeting",
            Self::SyncCrm => "sync_crm",
            Self::PlaceCall => "place_call",
            Self::Custom(name) => name.as_str(),
        }
    }

    pub fn effect(&self) -> ActionEffect {
        match self {
            Self::DiscoverLeads => ActionEffect::stage(ContactStage::Prospect),
            Self::EnrichContact => {
                ActionEffect::stage(ContactStage::Researched).with_flag("enriched")
            }
            Self::Qualify => ActionEffect::stage(ContactStage::Qualified).with_flag("qualified"),
            Self::EnrollSequence | Self::PlaceCall => {
                ActionEffect::stage(ContactStage::Contacted).touching_contact()
            }
            Self::BookMeeting => ActionEffect::stage(ContactStage::MeetingBooked),
            Self::SyncCrm | Self::Custom(_) => ActionEffect::default(),
        }
    }
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "discover_leads" => Self::DiscoverLeads,
            "enrich_contact" => Self::EnrichContact,
            "qualify" => Self::Qualify,
            "enroll_sequence" => Self::EnrollSequence,
            "book_meeting" => Self::BookMeeting,
            "sync_crm" => Self::SyncCrm,
            "place_call" => Self::PlaceCall,
            _ => Self::Custom(value.trim().to_string()),
        }
    }
}

impl From<Action> for String {
    fn from(value: Action) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful dispatch writes back to the contact.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionEffect {
    pub stage: Option<ContactStage>,
    pub set_flags: Vec<&'static str>,
    pub touches_contact: bool,
}

impl ActionEffect {
    fn stage(stage: ContactStage) -> Self {
        Self { stage: Some(stage), ..Self::default() }
    }

    fn with_flag(mut self, flag: &'static str) -> Self {
        self.set_flags.push(flag);
        self
    }

    fn touching_contact(mut self) -> Self {
        self.touches_contact = true;
        self
    }

    pub fn is_noop(&self) -> bool {
        self.stage.is_none() && self.set_flags.is_empty() && !self.touches_contact
    }
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub allowed_channels: Vec<Channel>,
    #[serde(default)]
    pub qualification_threshold: Option<rust_decimal::Decimal>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            allowed_channels: Vec::new(),
            qualification_threshold: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            schedule: None,
            extensions: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_type: AgentType,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: AgentSettings,
}

fn enabled_by_default() -> bool {
    true
}

impl AgentConfig {
    pub fn new(agent_type: AgentType) -> Self {
        Self { agent_type, enabled: true, settings: AgentSettings::default() }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_threshold(mut self, threshold: rust_decimal::Decimal) -> Self {
        self.settings.qualification_threshold = Some(threshold);
        self
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.settings.allowed_channels = channels;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.settings.max_attempts = max_attempts;
        self
    }

    /// Channels this agent may use, falling back to the archetype defaults.
    pub fn channels(&self) -> Vec<Channel> {
        if self.settings.allowed_channels.is_empty() {
            self.agent_type.default_channels()
        } else {
            self.settings.allowed_channels.clone()
        }
    }

    /// First channel usable by this agent under the loadout's allowed list.
    /// Internal work is never restricted by the loadout.
    pub fn resolve_channel(&self, loadout_channels: &[Channel]) -> Option<Channel> {
        self.channels().into_iter().find(|channel| {
            *channel == Channel::Internal || loadout_channels.contains(channel)
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.settings.max_attempts.max(1)
    }
}
