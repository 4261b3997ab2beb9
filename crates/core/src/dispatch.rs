//! Action provider port.
//!
//! Every channel (and `internal` work such as research or CRM sync) is served
//! by one [`ActionProvider`]. Providers receive the dedup key with each
//! request and must treat it as an idempotency key on their side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::agent::{Action, AgentConfig, AgentType, Channel};
use crate::domain::contact::Contact;
use crate::domain::execution::DedupKey;
use crate::domain::loadout::{LoadoutId, TenantId};
use crate::execution_engine::RetryPolicy;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub dedup_key: DedupKey,
    pub tenant_id: TenantId,
    pub loadout_id: LoadoutId,
    pub step_index: u32,
    pub agent_type: AgentType,
    pub action: Action,
    pub channel: Channel,
    pub contact: Contact,
    pub agent: AgentConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub external_ref: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("transient dispatch failure: {0}")]
    Transient(String),
    #[error("permanent dispatch failure: {0}")]
    Permanent(String),
}

impl DispatchError {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Transient(_) => RetryPolicy::Retry,
            Self::Permanent(_) => RetryPolicy::FailTerminal,
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }
}

#[async_trait]
pub trait ActionProvider: Send + Sync {
    fn channel(&self) -> Channel;

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::DispatchError;
    use crate::execution_engine::RetryPolicy;

    #[test]
    fn error_class_selects_retry_policy() {
        let transient = DispatchError::Transient("gateway timeout".to_string());
        let permanent = DispatchError::Permanent("invalid recipient".to_string());

        assert_eq!(transient.retry_policy(), RetryPolicy::Retry);
        assert_eq!(permanent.retry_policy(), RetryPolicy::FailTerminal);
        assert_eq!(permanent.class(), "permanent");
    }
}
