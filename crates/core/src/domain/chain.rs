use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::domain::agent::{Action, AgentType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    FullAutonomous,
    Hybrid,
    Inbound,
    ReEngagement,
    Custom,
}

impl ChainType {
    pub const ALL: [ChainType; 5] =
        [Self::FullAutonomous, Self::Hybrid, Self::Inbound, Self::ReEngagement, Self::Custom];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullAutonomous => "full_autonomous",
            Self::Hybrid => "hybrid",
            Self::Inbound => "inbound",
            Self::ReEngagement => "re_engagement",
            Self::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "full_autonomous" => Some(Self::FullAutonomous),
            "hybrid" => Some(Self::Hybrid),
            "inbound" => Some(Self::Inbound),
            "re_engagement" => Some(Self::ReEngagement),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    /// Whether the default compilation for this chain type includes a step
    /// for `agent_type`. Custom chains include exactly what the caller lists.
    pub fn includes(&self, agent_type: AgentType) -> bool {
        match self {
            Self::FullAutonomous | Self::Custom => true,
            Self::Hybrid => agent_type != AgentType::Closer,
            Self::Inbound => !matches!(agent_type, AgentType::Scout | AgentType::Caller),
            Self::ReEngagement => agent_type != AgentType::Scout,
        }
    }
}

/// Caller-supplied step for custom chains, before validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub agent_type: AgentType,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub delay_minutes: Option<u32>,
}

impl StepDefinition {
    pub fn new(agent_type: AgentType) -> Self {
        Self { agent_type, action: None, condition: None, delay_minutes: None }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn after_minutes(mut self, minutes: u32) -> Self {
        self.delay_minutes = Some(minutes);
        self
    }
}

/// One compiled, executable chain step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub agent_type: AgentType,
    pub action: Action,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub delay_minutes: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_type: ChainType,
    /// Source definitions kept so custom chains recompile on every edit.
    #[serde(default)]
    pub custom_steps: Vec<StepDefinition>,
    pub steps: Vec<Step>,
}

impl ChainConfig {
    pub fn step(&self, index: u32) -> Option<&Step> {
        self.steps.get(index as usize)
    }

    pub fn len(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
