//! Chain compilation.
//!
//! Turns an agent list and a chain type into the ordered, typed steps the
//! execution engine walks. Every failure is a [`ConfigError`]; a chain that
//! compiles is safe to execute.

use std::collections::BTreeSet;

use crate::condition::Condition;
use crate::domain::agent::{AgentConfig, AgentType};
use crate::domain::chain::{ChainType, Step, StepDefinition};
use crate::domain::loadout::LoadoutSettings;
use crate::errors::ConfigError;

pub const QUALIFIED_GUARD: &str = "qualified == true";

pub fn compile_chain(
    agents: &[AgentConfig],
    chain_type: ChainType,
    custom_steps: &[StepDefinition],
    settings: &LoadoutSettings,
) -> Result<Vec<Step>, ConfigError> {
    ensure_unique_agents(agents)?;

    let definitions = match chain_type {
        ChainType::Custom => custom_steps.to_vec(),
        _ => default_definitions(agents, chain_type),
    };

    let mut steps = Vec::with_capacity(definitions.len());
    for (index, definition) in definitions.iter().enumerate() {
        let agent = agents
            .iter()
            .find(|agent| agent.agent_type == definition.agent_type)
            .ok_or(ConfigError::UnknownAgent { index, agent_type: definition.agent_type })?;
        if !agent.enabled {
            return Err(ConfigError::DisabledAgent { index, agent_type: agent.agent_type });
        }

        let repeats_previous = index > 0 && definitions[index - 1].agent_type == agent.agent_type;
        if repeats_previous && definition.condition.is_none() {
            return Err(ConfigError::UnguardedRepeat { index, agent_type: agent.agent_type });
        }

        let condition = definition
            .condition
            .as_deref()
            .map(Condition::parse)
            .transpose()
            .map_err(|error| ConfigError::InvalidCondition { index, error })?;

        if agent.agent_type.is_contact_facing()
            && agent.resolve_channel(&settings.allowed_channels).is_none()
        {
            return Err(ConfigError::NoUsableChannel(agent.agent_type));
        }

        steps.push(Step {
            agent_type: agent.agent_type,
            action: definition.action.clone().unwrap_or_else(|| agent.agent_type.default_action()),
            condition,
            delay_minutes: definition.delay_minutes,
        });
    }

    if steps.is_empty() {
        return Err(ConfigError::EmptyChain);
    }

    Ok(steps)
}

fn ensure_unique_agents(agents: &[AgentConfig]) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for agent in agents {
        if !seen.insert(agent.agent_type) {
            return Err(ConfigError::DuplicateAgent(agent.agent_type));
        }
    }
    Ok(())
}

/// One step per enabled agent admitted by the chain type, in agent-list
/// order, with the qualifier threshold and qualified guards attached.
fn default_definitions(agents: &[AgentConfig], chain_type: ChainType) -> Vec<StepDefinition> {
    let mut qualifier_seen = false;
    agents
        .iter()
        .filter(|agent| agent.enabled && chain_type.includes(agent.agent_type))
        .map(|agent| {
            let mut definition = StepDefinition::new(agent.agent_type);
            match agent.agent_type {
                AgentType::Qualifier => {
                    if let Some(threshold) = agent.settings.qualification_threshold {
                        definition = definition.when(format!("score >= {threshold}"));
                    }
                    qualifier_seen = true;
                }
                agent_type if agent_type.is_contact_facing() && qualifier_seen => {
                    definition = definition.when(QUALIFIED_GUARD);
                }
                _ => {}
            }
            definition
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{compile_chain, QUALIFIED_GUARD};
    use crate::condition::ConditionError;
    use crate::domain::agent::{Action, AgentConfig, AgentType, Channel};
    use crate::domain::chain::{ChainType, StepDefinition};
    use crate::domain::loadout::LoadoutSettings;
    use crate::errors::ConfigError;

    fn every_agent() -> Vec<AgentConfig> {
        AgentType::ALL.into_iter().map(AgentConfig::new).collect()
    }

    fn open_settings() -> LoadoutSettings {
        LoadoutSettings { allowed_channels: Channel::ALL.to_vec(), ..LoadoutSettings::default() }
    }

    fn agent_types(steps: &[crate::domain::chain::Step]) -> Vec<AgentType> {
        steps.iter().map(|step| step.agent_type).collect()
    }

    #[test]
    fn full_autonomous_emits_one_default_step_per_enabled_agent_in_order() {
        let mut agents = every_agent();
        agents[1] = AgentConfig::new(AgentType::Researcher).disabled();

        let steps = compile_chain(&agents, ChainType::FullAutonomous, &[], &open_settings())
            .expect("chain compiles");

        assert_eq!(
            agent_types(&steps),
            vec![
                AgentType::Scout,
                AgentType::Qualifier,
                AgentType::Outreach,
                AgentType::Closer,
                AgentType::Ops,
                AgentType::Caller,
            ]
        );
        assert_eq!(steps[0].action, Action::DiscoverLeads);
        assert_eq!(steps[4].action, Action::SyncCrm);
        assert_eq!(steps[5].action, Action::PlaceCall);
    }

    #[test]
    fn chain_types_drop_their_excluded_agents() {
        let agents = every_agent();
        let settings = open_settings();

        let hybrid = compile_chain(&agents, ChainType::Hybrid, &[], &settings).expect("hybrid");
        assert!(!agent_types(&hybrid).contains(&AgentType::Closer));
        assert_eq!(hybrid.len(), 6);

        let inbound = compile_chain(&agents, ChainType::Inbound, &[], &settings).expect("inbound");
        assert_eq!(
            agent_types(&inbound),
            vec![
                AgentType::Researcher,
                AgentType::Qualifier,
                AgentType::Outreach,
                AgentType::Closer,
                AgentType::Ops,
            ]
        );

        let re_engagement =
            compile_chain(&agents, ChainType::ReEngagement, &[], &settings).expect("re-engage");
        assert_eq!(re_engagement[0].agent_type, AgentType::Researcher);
        assert!(agent_types(&re_engagement).contains(&AgentType::Caller));
    }

    #[test]
    fn qualifier_threshold_and_downstream_guards_are_attached() {
        let agents = vec![
            AgentConfig::new(AgentType::Outreach),
            AgentConfig::new(AgentType::Qualifier).with_threshold(Decimal::new(455, 1)),
            AgentConfig::new(AgentType::Closer),
            AgentConfig::new(AgentType::Ops),
        ];

        let steps = compile_chain(&agents, ChainType::FullAutonomous, &[], &open_settings())
            .expect("chain compiles");

        assert!(steps[0].condition.is_none(), "outreach before the qualifier stays unguarded");
        assert_eq!(steps[1].condition.as_ref().map(|c| c.source()), Some("score >= 45.5"));
        assert_eq!(steps[2].condition.as_ref().map(|c| c.source()), Some(QUALIFIED_GUARD));
        assert!(steps[3].condition.is_none(), "ops is not contact facing");
    }

    #[test]
    fn custom_steps_keep_actions_conditions_and_delays() {
        let agents =
            vec![AgentConfig::new(AgentType::Qualifier), AgentConfig::new(AgentType::Outreach)];
        let custom = vec![
            StepDefinition::new(AgentType::Qualifier).when("score >= 10"),
            StepDefinition::new(AgentType::Outreach),
            StepDefinition::new(AgentType::Outreach)
                .with_action(Action::Custom("send_follow_up".to_string()))
                .when("stage == contacted")
                .after_minutes(90),
        ];

        let steps = compile_chain(&agents, ChainType::Custom, &custom, &open_settings())
            .expect("custom chain compiles");

        assert_eq!(steps.len(), 3);
        assert!(steps[1].condition.is_none(), "custom chains get no implicit guards");
        assert_eq!(steps[2].action, Action::Custom("send_follow_up".to_string()));
        assert_eq!(steps[2].delay_minutes, Some(90));
    }

    #[test]
    fn references_to_missing_or_disabled_agents_fail() {
        let agents = vec![
            AgentConfig::new(AgentType::Qualifier),
            AgentConfig::new(AgentType::Closer).disabled(),
        ];

        let missing = compile_chain(
            &agents,
            ChainType::Custom,
            &[StepDefinition::new(AgentType::Scout)],
            &open_settings(),
        );
        assert_eq!(
            missing,
            Err(ConfigError::UnknownAgent { index: 0, agent_type: AgentType::Scout })
        );

        let disabled = compile_chain(
            &agents,
            ChainType::Custom,
            &[StepDefinition::new(AgentType::Qualifier), StepDefinition::new(AgentType::Closer)],
            &open_settings(),
        );
        assert_eq!(
            disabled,
            Err(ConfigError::DisabledAgent { index: 1, agent_type: AgentType::Closer })
        );
    }

    #[test]
    fn unguarded_consecutive_repeat_fails() {
        let agents = vec![AgentConfig::new(AgentType::Outreach)];
        let custom = vec![
            StepDefinition::new(AgentType::Outreach),
            StepDefinition::new(AgentType::Outreach),
        ];

        let result = compile_chain(&agents, ChainType::Custom, &custom, &open_settings());
        assert_eq!(
            result,
            Err(ConfigError::UnguardedRepeat { index: 1, agent_type: AgentType::Outreach })
        );
    }

    #[test]
    fn malformed_condition_reports_the_step() {
        let agents = vec![AgentConfig::new(AgentType::Qualifier)];
        let custom = vec![StepDefinition::new(AgentType::Qualifier).when("score >")];

        let result = compile_chain(&agents, ChainType::Custom, &custom, &open_settings());
        assert!(matches!(
            result,
            Err(ConfigError::InvalidCondition {
                index: 0,
                error: ConditionError::UnexpectedCharacter('>', _)
            })
        ));
    }

    #[test]
    fn empty_chain_and_duplicate_agents_fail() {
        let all_disabled = vec![AgentConfig::new(AgentType::Scout).disabled()];
        assert_eq!(
            compile_chain(&all_disabled, ChainType::FullAutonomous, &[], &open_settings()),
            Err(ConfigError::EmptyChain)
        );
        assert_eq!(
            compile_chain(&[], ChainType::Custom, &[], &open_settings()),
            Err(ConfigError::EmptyChain)
        );

        let duplicated = vec![AgentConfig::new(AgentType::Ops), AgentConfig::new(AgentType::Ops)];
        assert_eq!(
            compile_chain(&duplicated, ChainType::FullAutonomous, &[], &open_settings()),
            Err(ConfigError::DuplicateAgent(AgentType::Ops))
        );
    }

    #[test]
    fn contact_facing_agent_without_an_allowed_channel_fails() {
        let agents = vec![AgentConfig::new(AgentType::Caller), AgentConfig::new(AgentType::Ops)];
        let email_only = LoadoutSettings {
            allowed_channels: vec![Channel::Email],
            ..LoadoutSettings::default()
        };

        assert_eq!(
            compile_chain(&agents, ChainType::FullAutonomous, &[], &email_only),
            Err(ConfigError::NoUsableChannel(AgentType::Caller))
        );
    }
}
