use loadout_core::catalog::search_presets;
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct PresetSummary {
    id: &'static str,
    name: &'static str,
    industry: &'static str,
    chain_type: &'static str,
    agents: Vec<String>,
}

pub fn run(query: &str, industry: Option<&str>) -> CommandResult {
    let matches = search_presets(query, industry)
        .into_iter()
        .map(|preset| PresetSummary {
            id: preset.id,
            name: preset.name,
            industry: preset.industry,
            chain_type: preset.chain_type.as_str(),
            agents: preset.agents.iter().map(|agent| agent.agent_type.to_string()).collect(),
        })
        .collect::<Vec<_>>();

    if matches.is_empty() {
        return CommandResult::failure("presets", "not_found", "no presets matched", 1);
    }

    match serde_json::to_string(&matches) {
        Ok(listing) => CommandResult { exit_code: 0, output: listing },
        Err(error) => CommandResult::failure("presets", "serialization", error.to_string(), 7),
    }
}
