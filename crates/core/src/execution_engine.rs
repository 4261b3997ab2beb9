//! Deterministic Cursor Engine
//!
//! Pure state machine for per-contact chain progress. Every method takes a
//! cursor by value and returns the next cursor plus the outcome the caller
//! must persist; nothing here performs I/O. Delays and backoff are expressed
//! as `due_at` timestamps so suspension survives restarts.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use thiserror::Error;

use crate::admission::{Deferral, DeferralReason};
use crate::domain::agent::{AgentConfig, Channel};
use crate::domain::chain::Step;
use crate::domain::contact::{Contact, ContactId};
use crate::domain::execution::{CursorId, CursorState, DedupKey, ExecutionCursor};
use crate::domain::loadout::LoadoutConfig;

/// Configuration for the cursor engine
#[derive(Clone, Debug)]
pub struct ExecutionEngineConfig {
    /// How long a claimed cursor stays leased before another worker may take it
    pub lease_seconds: i64,
    /// Base delay in seconds between retries
    pub retry_base_delay_seconds: i64,
    /// Backoff multiplier for retries
    pub retry_backoff_multiplier: u32,
    /// Upper bound for a single backoff delay
    pub retry_max_delay_seconds: i64,
}

impl Default for ExecutionEngineConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 300,
            retry_base_delay_seconds: 30,
            retry_backoff_multiplier: 2,
            retry_max_delay_seconds: 3600,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("invalid cursor transition from {from:?} to {to:?}: {reason}")]
    InvalidTransition { from: CursorState, to: CursorState, reason: String },
    #[error("claim conflict: cursor {0:?} already leased by {1}")]
    ClaimConflict(CursorId, String),
    #[error("cursor {0:?} is not leased by {1}")]
    LeaseNotHeld(CursorId, String),
    #[error("cursor not yet due: {0:?}")]
    CursorNotYetDue(CursorId),
}

/// Policy for handling failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry with exponential backoff until the attempt ceiling
    Retry,
    /// Escalate immediately
    FailTerminal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    ConditionFalse,
    AgentUnavailable,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConditionFalse => "condition_false",
            Self::AgentUnavailable => "agent_unavailable",
        }
    }
}

/// Everything needed to dispatch the step a cursor points at.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchPlan {
    pub step_index: u32,
    pub step: Step,
    pub agent: AgentConfig,
    pub channel: Channel,
    pub local_day: NaiveDate,
    pub dedup_key: DedupKey,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StepPlan {
    /// Cursor belongs to an older loadout version.
    Restart,
    Skip { step_index: u32, reason: SkipReason },
    Dispatch(Box<DispatchPlan>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorOutcome {
    Claimed,
    Advanced { next_index: u32 },
    Completed,
    Paused,
    Deferred(DeferralReason),
    RetryScheduled { attempt: u32 },
    NeedsAttention,
    Restarted,
    Released,
    Reset,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorTransition {
    pub cursor: ExecutionCursor,
    pub outcome: CursorOutcome,
}

#[derive(Clone, Debug)]
pub struct CursorEngine {
    config: ExecutionEngineConfig,
}

impl CursorEngine {
    pub fn new() -> Self {
        Self::with_config(ExecutionEngineConfig::default())
    }

    pub fn with_config(config: ExecutionEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutionEngineConfig {
        &self.config
    }

    /// Create the cursor for a contact entering the loadout's chain.
    pub fn enroll(
        &self,
        loadout: &LoadoutConfig,
        contact_id: ContactId,
        now: DateTime<Utc>,
    ) -> ExecutionCursor {
        ExecutionCursor {
            id: CursorId::for_contact(&loadout.id, &contact_id),
            tenant_id: loadout.tenant_id.clone(),
            loadout_id: loadout.id.clone(),
            loadout_version: loadout.version,
            contact_id,
            step_index: 0,
            attempts: 0,
            state: CursorState::Advancing,
            due_at: due_for_step(loadout, 0, now),
            last_attempt_at: None,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
            state_version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move a cursor back to step 0 of the loadout's current version. The
    /// lease, if any, is kept so the caller can continue with the same claim.
    pub fn restart(
        &self,
        mut cursor: ExecutionCursor,
        loadout: &LoadoutConfig,
        now: DateTime<Utc>,
    ) -> CursorTransition {
        cursor.loadout_version = loadout.version;
        cursor.step_index = 0;
        cursor.attempts = 0;
        cursor.state = CursorState::Advancing;
        cursor.due_at = due_for_step(loadout, 0, now);
        cursor.last_error = None;
        touch(&mut cursor, now);
        CursorTransition { cursor, outcome: CursorOutcome::Restarted }
    }

    /// Take the lease on a due cursor. An unexpired lease held by another
    /// worker is a conflict; an expired one may be stolen.
    pub fn claim(
        &self,
        mut cursor: ExecutionCursor,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CursorTransition, ExecutionError> {
        if cursor.state != CursorState::Advancing {
            return Err(ExecutionError::InvalidTransition {
                from: cursor.state,
                to: CursorState::Advancing,
                reason: "only advancing cursors can be claimed".to_string(),
            });
        }

        if cursor.is_leased_at(now) && cursor.lease_owner.as_deref() != Some(worker_id) {
            return Err(ExecutionError::ClaimConflict(
                cursor.id.clone(),
                cursor.lease_owner.clone().unwrap_or_default(),
            ));
        }

        if now < cursor.due_at {
            return Err(ExecutionError::CursorNotYetDue(cursor.id.clone()));
        }

        cursor.lease_owner = Some(worker_id.to_string());
        cursor.lease_expires_at = Some(now + Duration::seconds(self.config.lease_seconds));
        touch(&mut cursor, now);
        Ok(CursorTransition { cursor, outcome: CursorOutcome::Claimed })
    }

    /// Decide what to do with the step the cursor points at.
    pub fn plan(
        &self,
        cursor: &ExecutionCursor,
        loadout: &LoadoutConfig,
        contact: &Contact,
        local_day: NaiveDate,
        now: DateTime<Utc>,
    ) -> StepPlan {
        if cursor.loadout_version != loadout.version {
            return StepPlan::Restart;
        }

        let step_index = cursor.step_index;
        let Some(step) = loadout.chain.step(step_index) else {
            return StepPlan::Restart;
        };

        if let Some(condition) = &step.condition {
            if !condition.evaluate(contact, now) {
                return StepPlan::Skip { step_index, reason: SkipReason::ConditionFalse };
            }
        }

        let agent = loadout.agent(step.agent_type).filter(|agent| agent.enabled);
        let channel =
            agent.and_then(|agent| agent.resolve_channel(&loadout.settings.allowed_channels));
        let (Some(agent), Some(channel)) = (agent, channel) else {
            return StepPlan::Skip { step_index, reason: SkipReason::AgentUnavailable };
        };

        StepPlan::Dispatch(Box::new(DispatchPlan {
            step_index,
            step: step.clone(),
            agent: agent.clone(),
            channel,
            local_day,
            dedup_key: DedupKey::derive(
                &loadout.id,
                loadout.version,
                &cursor.contact_id,
                step_index,
                local_day,
            ),
        }))
    }

    /// Advance past a step whose condition was false.
    pub fn skip_step(
        &self,
        cursor: ExecutionCursor,
        worker_id: &str,
        loadout: &LoadoutConfig,
        now: DateTime<Utc>,
    ) -> Result<CursorTransition, ExecutionError> {
        self.ensure_lease(&cursor, worker_id, now)?;
        Ok(advance(cursor, loadout, false, now))
    }

    /// Advance past a step whose dispatch completed.
    pub fn complete_step(
        &self,
        cursor: ExecutionCursor,
        worker_id: &str,
        loadout: &LoadoutConfig,
        now: DateTime<Utc>,
    ) -> Result<CursorTransition, ExecutionError> {
        self.ensure_lease(&cursor, worker_id, now)?;
        Ok(advance(cursor, loadout, true, now))
    }

    /// Hold the cursor on its step until the deferral lifts.
    pub fn defer_step(
        &self,
        mut cursor: ExecutionCursor,
        worker_id: &str,
        deferral: Deferral,
        now: DateTime<Utc>,
    ) -> Result<CursorTransition, ExecutionError> {
        self.ensure_lease(&cursor, worker_id, now)?;
        cursor.due_at = deferral.until;
        release_lease(&mut cursor);
        touch(&mut cursor, now);
        Ok(CursorTransition { cursor, outcome: CursorOutcome::Deferred(deferral.reason) })
    }

    /// Record a failed dispatch.
    ///
    /// Retryable failures below the agent's attempt ceiling are rescheduled
    /// with exponential backoff. Exhaustion and terminal failures park the
    /// cursor in `needs_attention` at its current step.
    pub fn fail_step(
        &self,
        mut cursor: ExecutionCursor,
        worker_id: &str,
        error: impl Into<String>,
        retry_policy: RetryPolicy,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<CursorTransition, ExecutionError> {
        self.ensure_lease(&cursor, worker_id, now)?;

        cursor.attempts += 1;
        cursor.last_attempt_at = Some(now);
        cursor.last_error = Some(error.into());
        release_lease(&mut cursor);
        touch(&mut cursor, now);

        let should_retry =
            matches!(retry_policy, RetryPolicy::Retry) && cursor.attempts < max_attempts.max(1);

        if should_retry {
            cursor.due_at = now + self.backoff_delay(cursor.attempts - 1);
            let attempt = cursor.attempts;
            Ok(CursorTransition { cursor, outcome: CursorOutcome::RetryScheduled { attempt } })
        } else {
            cursor.state = CursorState::NeedsAttention;
            Ok(CursorTransition { cursor, outcome: CursorOutcome::NeedsAttention })
        }
    }

    /// Drop the lease without moving the cursor. Used when the loadout is
    /// no longer active or the worker is shutting down.
    pub fn release(
        &self,
        mut cursor: ExecutionCursor,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CursorTransition, ExecutionError> {
        if cursor.lease_owner.as_deref() != Some(worker_id) {
            return Err(ExecutionError::LeaseNotHeld(cursor.id.clone(), worker_id.to_string()));
        }
        release_lease(&mut cursor);
        touch(&mut cursor, now);
        Ok(CursorTransition { cursor, outcome: CursorOutcome::Released })
    }

    /// Operator reset of a parked cursor: same step, fresh attempts, due now.
    pub fn reset(
        &self,
        mut cursor: ExecutionCursor,
        now: DateTime<Utc>,
    ) -> Result<CursorTransition, ExecutionError> {
        if cursor.state != CursorState::NeedsAttention {
            return Err(ExecutionError::InvalidTransition {
                from: cursor.state,
                to: CursorState::Advancing,
                reason: "only cursors needing attention can be retried".to_string(),
            });
        }
        cursor.state = CursorState::Advancing;
        cursor.attempts = 0;
        cursor.due_at = now;
        cursor.last_error = None;
        release_lease(&mut cursor);
        touch(&mut cursor, now);
        Ok(CursorTransition { cursor, outcome: CursorOutcome::Reset })
    }

    /// Cursors whose lease has lapsed, returned with the lease cleared so a
    /// scheduler can hand them out again.
    pub fn recover_expired_leases(
        &self,
        cursors: Vec<ExecutionCursor>,
        reference_time: DateTime<Utc>,
    ) -> Vec<ExecutionCursor> {
        cursors
            .into_iter()
            .filter(|cursor| {
                cursor.lease_owner.is_some()
                    && cursor.lease_expires_at.is_some_and(|expiry| expiry <= reference_time)
            })
            .map(|mut cursor| {
                release_lease(&mut cursor);
                touch(&mut cursor, reference_time);
                cursor
            })
            .collect()
    }

    /// `base * multiplier^retry`, capped.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = i64::from(self.config.retry_backoff_multiplier.max(1))
            .checked_pow(retry)
            .unwrap_or(i64::MAX);
        let seconds = self
            .config
            .retry_base_delay_seconds
            .saturating_mul(factor)
            .min(self.config.retry_max_delay_seconds)
            .max(0);
        Duration::seconds(seconds)
    }

    fn ensure_lease(
        &self,
        cursor: &ExecutionCursor,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ExecutionError> {
        if cursor.state != CursorState::Advancing {
            return Err(ExecutionError::InvalidTransition {
                from: cursor.state,
                to: CursorState::Advancing,
                reason: "cursor is not advancing".to_string(),
            });
        }
        if cursor.lease_owner.as_deref() != Some(worker_id) || !cursor.is_leased_at(now) {
            return Err(ExecutionError::LeaseNotHeld(cursor.id.clone(), worker_id.to_string()));
        }
        Ok(())
    }
}

impl Default for CursorEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn advance(
    mut cursor: ExecutionCursor,
    loadout: &LoadoutConfig,
    dispatched: bool,
    now: DateTime<Utc>,
) -> CursorTransition {
    let next_index = cursor.step_index + 1;
    cursor.attempts = 0;
    cursor.last_error = None;
    cursor.last_attempt_at = Some(now);
    release_lease(&mut cursor);
    touch(&mut cursor, now);

    if next_index >= loadout.chain.len() {
        cursor.step_index = loadout.chain.len();
        let (state, outcome) = if dispatched {
            (CursorState::Completed, CursorOutcome::Completed)
        } else {
            (CursorState::Paused, CursorOutcome::Paused)
        };
        cursor.state = state;
        return CursorTransition { cursor, outcome };
    }

    cursor.step_index = next_index;
    cursor.due_at = due_for_step(loadout, next_index, now);
    CursorTransition { cursor, outcome: CursorOutcome::Advanced { next_index } }
}

fn due_for_step(loadout: &LoadoutConfig, index: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    loadout
        .chain
        .step(index)
        .and_then(|step| step.delay_minutes)
        .map(|minutes| now + Duration::minutes(i64::from(minutes)))
        .unwrap_or(now)
}

fn release_lease(cursor: &mut ExecutionCursor) {
    cursor.lease_owner = None;
    cursor.lease_expires_at = None;
}

fn touch(cursor: &mut ExecutionCursor, now: DateTime<Utc>) {
    cursor.state_version += 1;
    cursor.updated_at = now;
}
