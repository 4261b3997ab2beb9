pub mod admission;
pub mod builder;
pub mod catalog;
pub mod clock;
pub mod compiler;
pub mod condition;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod execution_engine;

pub use admission::{AdmissionController, AdmissionDecision, Deferral, DeferralReason, SlotOutcome};
pub use builder::{build_loadout, revise_loadout, BuildRequest, LoadoutUpdate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compiler::compile_chain;
pub use condition::{Condition, ConditionError};
pub use dispatch::{ActionProvider, DispatchError, DispatchReceipt, DispatchRequest};
pub use domain::agent::{Action, AgentConfig, AgentType, Channel};
pub use domain::chain::{ChainConfig, ChainType, Step, StepDefinition};
pub use domain::contact::{ActivityEntry, ActivityKind, Contact, ContactId, ContactStage};
pub use domain::execution::{CursorState, DedupKey, DispatchRecord, ExecutionCursor};
pub use domain::loadout::{LoadoutConfig, LoadoutId, LoadoutStatus, TenantActivation, TenantId};
pub use errors::{ApplicationError, ConfigError, InterfaceError};
pub use execution_engine::{CursorEngine, CursorOutcome, ExecutionEngineConfig, RetryPolicy};
