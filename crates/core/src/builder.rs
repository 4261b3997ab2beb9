//! Loadout composition and revision.
//!
//! The builder is the only place a [`LoadoutConfig`] is assembled. New
//! loadouts always start as version 1 drafts; revisions bump the version and
//! recompile the chain so a stored loadout never carries a stale chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog;
use crate::compiler::compile_chain;
use crate::domain::agent::AgentConfig;
use crate::domain::chain::{ChainConfig, ChainType, StepDefinition};
use crate::domain::loadout::{LoadoutConfig, LoadoutId, LoadoutSettings, LoadoutStatus, TenantId};
use crate::errors::ConfigError;

/// Request to create a loadout, optionally seeded from an industry preset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub agents: Option<Vec<AgentConfig>>,
    #[serde(default)]
    pub chain_type: Option<ChainType>,
    #[serde(default)]
    pub custom_steps: Option<Vec<StepDefinition>>,
    #[serde(default)]
    pub settings: Option<LoadoutSettings>,
}

impl BuildRequest {
    pub fn from_preset(name: impl Into<String>, preset: impl Into<String>) -> Self {
        Self { name: name.into(), preset: Some(preset.into()), ..Self::default() }
    }

    pub fn blank(name: impl Into<String>, agents: Vec<AgentConfig>) -> Self {
        Self { name: name.into(), agents: Some(agents), ..Self::default() }
    }
}

/// Partial edit of an existing loadout. Absent fields keep their value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadoutUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub agents: Option<Vec<AgentConfig>>,
    #[serde(default)]
    pub chain_type: Option<ChainType>,
    #[serde(default)]
    pub custom_steps: Option<Vec<StepDefinition>>,
    #[serde(default)]
    pub settings: Option<LoadoutSettings>,
}

pub fn new_loadout_id() -> LoadoutId {
    LoadoutId(format!("LO-{}", Uuid::new_v4()))
}

pub fn build_loadout(
    tenant_id: TenantId,
    request: BuildRequest,
    now: DateTime<Utc>,
) -> Result<LoadoutConfig, ConfigError> {
    let name = request.name.trim().to_string();
    if name.is_empty() {
        return Err(ConfigError::MissingField("name"));
    }

    let preset = match request.preset.as_deref() {
        Some(id) => {
            Some(catalog::preset(id).ok_or_else(|| ConfigError::UnknownPreset(id.to_string()))?)
        }
        None => None,
    };

    let agents = match (request.agents, preset) {
        (Some(agents), _) => agents,
        (None, Some(preset)) => preset.agents.clone(),
        (None, None) => return Err(ConfigError::MissingField("agents")),
    };
    let chain_type = request
        .chain_type
        .or_else(|| preset.map(|preset| preset.chain_type))
        .unwrap_or(ChainType::FullAutonomous);
    let custom_steps = request
        .custom_steps
        .or_else(|| preset.map(|preset| preset.custom_steps.clone()))
        .unwrap_or_default();
    let settings = request
        .settings
        .or_else(|| preset.map(|preset| preset.settings.clone()))
        .unwrap_or_default();
    let description = request
        .description
        .or_else(|| preset.map(|preset| preset.description.to_string()))
        .unwrap_or_default();
    let industry = request.industry.or_else(|| preset.map(|preset| preset.industry.to_string()));

    settings.validate()?;
    let steps = compile_chain(&agents, chain_type, &custom_steps, &settings)?;

    Ok(LoadoutConfig {
        id: new_loadout_id(),
        tenant_id,
        name,
        description,
        industry,
        agents,
        chain: ChainConfig { chain_type, custom_steps, steps },
        settings,
        status: LoadoutStatus::Draft,
        version: 1,
        stopped_at_version: None,
        created_at: now,
        updated_at: now,
    })
}

/// Applies an edit and recompiles. The returned config carries the next
/// version; persisting it is the store's optimistic write.
pub fn revise_loadout(
    current: &LoadoutConfig,
    update: LoadoutUpdate,
    now: DateTime<Utc>,
) -> Result<LoadoutConfig, ConfigError> {
    let mut next = current.clone();

    if let Some(name) = update.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::MissingField("name"));
        }
        next.name = name;
    }
    if let Some(description) = update.description {
        next.description = description;
    }
    if let Some(industry) = update.industry {
        next.industry = Some(industry).filter(|value| !value.trim().is_empty());
    }
    if let Some(agents) = update.agents {
        next.agents = agents;
    }
    if let Some(chain_type) = update.chain_type {
        next.chain.chain_type = chain_type;
    }
    if let Some(custom_steps) = update.custom_steps {
        next.chain.custom_steps = custom_steps;
    }
    if let Some(settings) = update.settings {
        next.settings = settings;
    }

    recompile(&mut next)?;
    next.version = current.version + 1;
    next.updated_at = now;
    Ok(next)
}

pub fn recompile(loadout: &mut LoadoutConfig) -> Result<(), ConfigError> {
    loadout.settings.validate()?;
    loadout.chain.steps = compile_chain(
        &loadout.agents,
        loadout.chain.chain_type,
        &loadout.chain.custom_steps,
        &loadout.settings,
    )?;
    Ok(())
}
