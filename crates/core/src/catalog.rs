//! Built-in agent archetypes and industry presets.
//!
//! The catalog is static data assembled once per process. Presets are plain
//! inputs for the builder; they compile through the same path as user input.

use std::sync::OnceLock;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::agent::{Action, AgentConfig, AgentType, Channel, DEFAULT_MAX_ATTEMPTS};
use crate::domain::chain::{ChainType, StepDefinition};
use crate::domain::loadout::{BusinessHours, LoadoutSettings, Timezone};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentTemplate {
    pub agent_type: AgentType,
    pub display_name: &'static str,
    pub description: &'static str,
    pub default_action: Action,
    pub default_channels: Vec<Channel>,
    pub default_instructions: &'static str,
    pub default_max_attempts: u32,
    pub default_threshold: Option<Decimal>,
}

impl AgentTemplate {
    /// An agent config seeded from this template's defaults.
    pub fn instantiate(&self) -> AgentConfig {
        let mut agent =
            AgentConfig::new(self.agent_type).with_max_attempts(self.default_max_attempts);
        agent.settings.instructions = self.default_instructions.to_string();
        agent.settings.qualification_threshold = self.default_threshold;
        agent
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndustryPreset {
    pub id: &'static str,
    pub name: &'static str,
    pub industry: &'static str,
    pub description: &'static str,
    pub tags: Vec<&'static str>,
    pub chain_type: ChainType,
    pub agents: Vec<AgentConfig>,
    pub custom_steps: Vec<StepDefinition>,
    pub settings: LoadoutSettings,
}

impl IndustryPreset {
    fn matches(&self, needle: &str) -> bool {
        let contains = |haystack: &str| haystack.to_ascii_lowercase().contains(needle);
        contains(self.id)
            || contains(self.name)
            || contains(self.industry)
            || contains(self.description)
            || self.tags.iter().any(|tag| contains(tag))
    }
}

pub fn agent_templates() -> &'static [AgentTemplate] {
    static TEMPLATES: OnceLock<Vec<AgentTemplate>> = OnceLock::new();
    TEMPLATES.get_or_init(build_agent_templates)
}

pub fn agent_template(agent_type: AgentType) -> Option<&'static AgentTemplate> {
    agent_templates().iter().find(|template| template.agent_type == agent_type)
}

pub fn presets() -> &'static [IndustryPreset] {
    static PRESETS: OnceLock<Vec<IndustryPreset>> = OnceLock::new();
    PRESETS.get_or_init(build_presets)
}

pub fn preset(id: &str) -> Option<&'static IndustryPreset> {
    let id = id.trim();
    presets().iter().find(|preset| preset.id.eq_ignore_ascii_case(id))
}

/// Case-insensitive search over name, industry, description and tags.
/// An empty query matches everything; the industry filter is exact.
pub fn search_presets(query: &str, industry: Option<&str>) -> Vec<&'static IndustryPreset> {
    let needle = query.trim().to_ascii_lowercase();
    presets()
        .iter()
        .filter(|preset| {
            industry.map_or(true, |wanted| preset.industry.eq_ignore_ascii_case(wanted.trim()))
        })
        .filter(|preset| needle.is_empty() || preset.matches(&needle))
        .collect()
}

fn build_agent_templates() -> Vec<AgentTemplate> {
    AgentType::ALL
        .into_iter()
        .map(|agent_type| {
            let (display_name, description, default_instructions) = template_text(agent_type);
            AgentTemplate {
                agent_type,
                display_name,
                description,
                default_action: agent_type.default_action(),
                default_channels: agent_type.default_channels(),
                default_instructions,
                default_max_attempts: DEFAULT_MAX_ATTEMPTS,
                default_threshold: (agent_type == AgentType::Qualifier).then(|| Decimal::from(40)),
            }
        })
        .collect()
}

fn template_text(agent_type: AgentType) -> (&'static str, &'static str, &'static str) {
    match agent_type {
        AgentType::Scout => (
            "Scout",
            "Finds new leads matching the ideal customer profile.",
            "Search configured sources for companies and people that fit the target profile.",
        ),
        AgentType::Researcher => (
            "Researcher",
            "Enriches contacts with firmographic and role data.",
            "Collect company size, role, recent news and public signals for each contact.",
        ),
        AgentType::Qualifier => (
            "Qualifier",
            "Scores contacts and marks those worth pursuing.",
            "Score fit and intent; mark the contact qualified when the score clears the threshold.",
        ),
        AgentType::Outreach => (
            "Outreach",
            "Enrolls qualified contacts into a multi-channel sequence.",
            "Send a short personalised opener and follow up on the allowed channels.",
        ),
        AgentType::Closer => (
            "Closer",
            "Books meetings with engaged contacts.",
            "Propose meeting times and confirm a booking with engaged contacts.",
        ),
        AgentType::Ops => (
            "Ops",
            "Keeps the CRM in sync with chain activity.",
            "Write stage changes and activity to the CRM of record.",
        ),
        AgentType::Caller => (
            "Caller",
            "Places voice calls to contacts.",
            "Call the contact, introduce the offer and log the outcome.",
        ),
    }
}

fn agent(agent_type: AgentType) -> AgentConfig {
    agent_template(agent_type)
        .map(AgentTemplate::instantiate)
        .unwrap_or_else(|| AgentConfig::new(agent_type))
}

fn qualifier(threshold: i64) -> AgentConfig {
    agent(AgentType::Qualifier).with_threshold(Decimal::from(threshold))
}

fn settings(
    timezone: Timezone,
    hours: (u32, u32),
    max_contacts_per_day: u32,
    allowed_channels: Vec<Channel>,
) -> LoadoutSettings {
    LoadoutSettings {
        timezone,
        business_hours: BusinessHours { start_hour: hours.0, end_hour: hours.1 },
        max_contacts_per_day,
        allowed_channels,
        notification_email: None,
        webhook_urls: Vec::new(),
    }
}

fn offset(raw: &str) -> Timezone {
    raw.parse().unwrap_or_default()
}

fn build_presets() -> Vec<IndustryPreset> {
    vec![
        IndustryPreset {
            id: "saas",
            name: "SaaS Pipeline Accelerator",
            industry: "saas",
            description: "Prospect, qualify and book demos for B2B software products.",
            tags: vec!["b2b", "demos", "outbound"],
            chain_type: ChainType::FullAutonomous,
            agents: vec![
                agent(AgentType::Scout),
                agent(AgentType::Researcher),
                qualifier(40),
                agent(AgentType::Outreach).with_channels(vec![Channel::Email]),
                agent(AgentType::Closer),
                agent(AgentType::Ops),
            ],
            custom_steps: Vec::new(),
            settings: settings(
                Timezone::utc(),
                (9, 17),
                200,
                vec![Channel::Email, Channel::Social],
            ),
        },
        IndustryPreset {
            id: "real_estate",
            name: "Real Estate Lead Follow-Up",
            industry: "real_estate",
            description: "Qualify buyer and seller leads, then text and call them; agents close.",
            tags: vec!["property", "sms", "calls", "local"],
            chain_type: ChainType::Hybrid,
            agents: vec![
                agent(AgentType::Scout),
                qualifier(50),
                agent(AgentType::Outreach).with_channels(vec![Channel::Sms, Channel::Email]),
                agent(AgentType::Caller),
                agent(AgentType::Closer),
            ],
            custom_steps: Vec::new(),
            settings: settings(
                offset("-05:00"),
                (9, 19),
                75,
                vec![Channel::Sms, Channel::Email, Channel::Voice],
            ),
        },
        IndustryPreset {
            id: "agency",
            name: "Agency New Business",
            industry: "agency",
            description: "Research brands, pitch the qualified ones and follow up two days later.",
            tags: vec!["marketing", "pitch", "follow-up", "b2b"],
            chain_type: ChainType::Custom,
            agents: vec![
                agent(AgentType::Researcher),
                qualifier(60),
                agent(AgentType::Outreach).with_channels(vec![Channel::Email, Channel::Social]),
                agent(AgentType::Closer),
            ],
            custom_steps: vec![
                StepDefinition::new(AgentType::Researcher),
                StepDefinition::new(AgentType::Qualifier).when("score >= 60"),
                StepDefinition::new(AgentType::Outreach).when("qualified == true"),
                StepDefinition::new(AgentType::Outreach)
                    .with_action(Action::Custom("send_follow_up".to_string()))
                    .when("stage == contacted")
                    .after_minutes(2 * 24 * 60),
                StepDefinition::new(AgentType::Closer).when("qualified == true"),
            ],
            settings: settings(
                offset("+00:00"),
                (9, 18),
                60,
                vec![Channel::Email, Channel::Social, Channel::Whatsapp],
            ),
        },
        IndustryPreset {
            id: "ecommerce",
            name: "E-commerce Inbound Conversion",
            industry: "ecommerce",
            description: "Convert inbound sign-ups and abandoned carts over SMS and WhatsApp.",
            tags: vec!["retail", "inbound", "carts", "b2c"],
            chain_type: ChainType::Inbound,
            agents: vec![
                agent(AgentType::Researcher),
                qualifier(30),
                agent(AgentType::Outreach),
                agent(AgentType::Ops),
            ],
            custom_steps: Vec::new(),
            settings: settings(
                Timezone::utc(),
                (8, 20),
                500,
                vec![Channel::Email, Channel::Sms, Channel::Whatsapp],
            ),
        },
        IndustryPreset {
            id: "recruiting",
            name: "Recruiting Talent Sourcing",
            industry: "recruiting",
            description: "Source candidates, screen them against the role and reach out.",
            tags: vec!["talent", "candidates", "hiring"],
            chain_type: ChainType::FullAutonomous,
            agents: vec![
                agent(AgentType::Scout),
                agent(AgentType::Researcher),
                qualifier(70),
                agent(AgentType::Outreach).with_channels(vec![Channel::Email, Channel::Social]),
                agent(AgentType::Ops),
            ],
            custom_steps: Vec::new(),
            settings: settings(
                offset("+01:00"),
                (9, 17),
                120,
                vec![Channel::Email, Channel::Social],
            ),
        },
        IndustryPreset {
            id: "local_services",
            name: "Local Services Win-Back",
            industry: "local_services",
            description: "Win back past customers of home services by text and phone.",
            tags: vec!["win-back", "sms", "calls", "local", "re-engagement"],
            chain_type: ChainType::ReEngagement,
            agents: vec![
                agent(AgentType::Researcher),
                agent(AgentType::Outreach).with_channels(vec![Channel::Sms]),
                agent(AgentType::Caller),
                agent(AgentType::Ops),
            ],
            custom_steps: Vec::new(),
            settings: settings(
                offset("-08:00"),
                (8, 18),
                50,
                vec![Channel::Sms, Channel::Voice, Channel::Email],
            ),
        },
    ]
}
