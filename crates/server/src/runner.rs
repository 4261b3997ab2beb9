//! Drives execution cursors through their loadout's chain.
//!
//! The runner owns the side effects around the pure [`CursorEngine`]
//! transitions: it persists every transition with a state-version compare and
//! swap, consults the admission controller and the dispatch ledger before any
//! provider call, and writes the contact activity log.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use loadout_core::admission::{AdmissionController, AdmissionDecision, Deferral};
use loadout_core::clock::Clock;
use loadout_core::dispatch::{DispatchError, DispatchRequest};
use loadout_core::domain::agent::AgentType;
use loadout_core::domain::contact::{ActivityEntry, ActivityKind, Contact, ContactId};
use loadout_core::domain::execution::{
    CursorId, CursorState, DispatchRecord, DispatchState, ExecutionCursor,
};
use loadout_core::domain::loadout::{LoadoutConfig, LoadoutId, TenantId};
use loadout_core::errors::ApplicationError;
use loadout_core::execution_engine::{
    CursorEngine, CursorOutcome, CursorTransition, DispatchPlan, ExecutionError, RetryPolicy,
    StepPlan,
};
use loadout_db::repositories::{
    AdmissionRepository, ContactRepository, CursorRepository, DispatchLedgerRepository,
    InMemoryAdmissionRepository, InMemoryContactRepository, InMemoryCursorRepository,
    InMemoryDispatchLedgerRepository, InMemoryLoadoutRepository, LoadoutRepository,
    SqlAdmissionRepository, SqlContactRepository, SqlCursorRepository,
    SqlDispatchLedgerRepository, SqlLoadoutRepository,
};
use loadout_db::DbPool;

use crate::notify::{NeedsAttentionNotice, Notifier};
use crate::providers::ProviderRegistry;

/// Every repository the runtime talks to, behind trait objects.
#[derive(Clone)]
pub struct Repositories {
    pub loadouts: Arc<dyn LoadoutRepository>,
    pub cursors: Arc<dyn CursorRepository>,
    pub ledger: Arc<dyn DispatchLedgerRepository>,
    pub admission: Arc<dyn AdmissionRepository>,
    pub contacts: Arc<dyn ContactRepository>,
}

impl Repositories {
    pub fn sql(pool: &DbPool) -> Self {
        Self {
            loadouts: Arc::new(SqlLoadoutRepository::new(pool.clone())),
            cursors: Arc::new(SqlCursorRepository::new(pool.clone())),
            ledger: Arc::new(SqlDispatchLedgerRepository::new(pool.clone())),
            admission: Arc::new(SqlAdmissionRepository::new(pool.clone())),
            contacts: Arc::new(SqlContactRepository::new(pool.clone())),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            loadouts: Arc::new(InMemoryLoadoutRepository::default()),
            cursors: Arc::new(InMemoryCursorRepository::default()),
            ledger: Arc::new(InMemoryDispatchLedgerRepository::default()),
            admission: Arc::new(InMemoryAdmissionRepository::default()),
            contacts: Arc::new(InMemoryContactRepository::default()),
        }
    }
}

/// The event that brings a contact into the active loadout's chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollTrigger {
    /// First sighting of the contact.
    Created,
    /// The contact re-entered the funnel. Paused cursors start over.
    ReEntry,
}

impl EnrollTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::ReEntry => "re_entry",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollStatus {
    Enrolled,
    Restarted,
    AlreadyEnrolled,
    /// The contact already finished this loadout's chain; only a re-entry
    /// event starts it again.
    AlreadyCompleted,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnrollOutcome {
    /// `None` when the contact completed the chain and was not re-enrolled.
    pub cursor: Option<ExecutionCursor>,
    pub status: EnrollStatus,
}

/// Why a worker stopped processing a cursor before it parked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    LoadoutInactive,
    NotDue,
    NotClaimable,
    /// Another writer changed the cursor between read and write.
    LostRace,
    /// Shutdown began; the cursor stays due for the next start.
    ShuttingDown,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub cursor_id: CursorId,
    pub outcomes: Vec<CursorOutcome>,
    pub halted: Option<HaltReason>,
}

impl RunReport {
    fn new(cursor_id: CursorId) -> Self {
        Self { cursor_id, outcomes: Vec::new(), halted: None }
    }

    pub fn last_outcome(&self) -> Option<CursorOutcome> {
        self.outcomes.last().copied()
    }
}

pub struct ChainRunner {
    repos: Repositories,
    providers: Arc<ProviderRegistry>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    engine: CursorEngine,
    admission: AdmissionController,
    stop: watch::Sender<bool>,
}

impl ChainRunner {
    pub fn new(
        repos: Repositories,
        providers: Arc<ProviderRegistry>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        engine: CursorEngine,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            repos,
            providers,
            notifier,
            clock,
            engine,
            admission: AdmissionController::new(),
            stop,
        }
    }

    /// Asks every `process` call to stop before its next step. A step that
    /// is already dispatching runs to completion.
    pub fn begin_shutdown(&self) {
        if !self.stop.send_replace(true) {
            info!(event_name = "engine.shutdown.requested", "engine shutdown requested");
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Creates the contact's cursor on the tenant's active loadout. A
    /// re-entry event restarts a paused cursor or a completed chain; a
    /// duplicate `created` event never does.
    pub async fn enroll(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
        trigger: EnrollTrigger,
    ) -> Result<EnrollOutcome, ApplicationError> {
        let now = self.clock.now();
        let activation = self.repos.loadouts.tenant_activation(tenant_id).await?;
        let loadout = match &activation.active_loadout_id {
            Some(id) => self.repos.loadouts.find_by_id(tenant_id, id).await?,
            None => None,
        }
        .filter(LoadoutConfig::is_active)
        .ok_or_else(|| {
            ApplicationError::Conflict(format!("tenant `{}` has no active loadout", tenant_id.0))
        })?;

        self.repos
            .contacts
            .find(tenant_id, contact_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("contact `{}`", contact_id.0)))?;

        let cursor_id = CursorId::for_contact(&loadout.id, contact_id);
        let existing = self.repos.cursors.find(&cursor_id).await?;
        let (cursor, status) = match existing {
            None if trigger == EnrollTrigger::Created
                && self.completed_chain(tenant_id, &loadout.id, contact_id).await? =>
            {
                debug!(
                    event_name = "engine.contact.already_completed",
                    tenant_id = %tenant_id.0,
                    loadout_id = %loadout.id.0,
                    contact_id = %contact_id.0,
                    "contact already completed this chain"
                );
                return Ok(EnrollOutcome { cursor: None, status: EnrollStatus::AlreadyCompleted });
            }
            None => {
                let cursor = self.engine.enroll(&loadout, contact_id.clone(), now);
                if !self.repos.cursors.insert(cursor.clone()).await? {
                    let stored = self.repos.cursors.find(&cursor_id).await?.unwrap_or(cursor);
                    let status = EnrollStatus::AlreadyEnrolled;
                    return Ok(EnrollOutcome { cursor: Some(stored), status });
                }
                (cursor, EnrollStatus::Enrolled)
            }
            Some(cursor)
                if trigger == EnrollTrigger::ReEntry && cursor.state == CursorState::Paused =>
            {
                let expected = cursor.state_version;
                let restarted = self.engine.restart(cursor, &loadout, now).cursor;
                if !self.repos.cursors.compare_and_swap(restarted.clone(), expected).await? {
                    return Err(ApplicationError::Conflict(format!(
                        "cursor `{}` changed while re-entering",
                        cursor_id.0
                    )));
                }
                (restarted, EnrollStatus::Restarted)
            }
            Some(cursor) => {
                return Ok(EnrollOutcome {
                    cursor: Some(cursor),
                    status: EnrollStatus::AlreadyEnrolled,
                });
            }
        };

        self.record(activity(&cursor, ActivityKind::Enrolled, now).detail(trigger.as_str())).await?;
        info!(
            event_name = "engine.contact.enrolled",
            tenant_id = %tenant_id.0,
            loadout_id = %loadout.id.0,
            contact_id = %contact_id.0,
            trigger = trigger.as_str(),
            "contact enrolled in chain"
        );
        Ok(EnrollOutcome { cursor: Some(cursor), status })
    }

    async fn completed_chain(
        &self,
        tenant_id: &TenantId,
        loadout_id: &LoadoutId,
        contact_id: &ContactId,
    ) -> Result<bool, ApplicationError> {
        let activity = self.repos.contacts.list_activity(tenant_id, contact_id).await?;
        Ok(activity.iter().any(|entry| {
            entry.kind == ActivityKind::ChainCompleted && &entry.loadout_id == loadout_id
        }))
    }

    /// Operator retry of a cursor parked in `needs_attention`.
    pub async fn retry(
        &self,
        tenant_id: &TenantId,
        loadout_id: &LoadoutId,
        contact_id: &ContactId,
    ) -> Result<ExecutionCursor, ApplicationError> {
        let now = self.clock.now();
        let cursor_id = CursorId::for_contact(loadout_id, contact_id);
        let cursor = self
            .repos
            .cursors
            .find(&cursor_id)
            .await?
            .filter(|cursor| &cursor.tenant_id == tenant_id)
            .ok_or_else(|| ApplicationError::NotFound(format!("cursor `{}`", cursor_id.0)))?;

        let expected = cursor.state_version;
        let reset = self.engine.reset(cursor, now).map_err(engine_error)?.cursor;
        if !self.repos.cursors.compare_and_swap(reset.clone(), expected).await? {
            return Err(ApplicationError::Conflict(format!(
                "cursor `{}` changed during retry",
                cursor_id.0
            )));
        }

        info!(
            event_name = "engine.cursor.retried",
            tenant_id = %tenant_id.0,
            cursor_id = %cursor_id.0,
            step_index = reset.step_index,
            "cursor reset by operator"
        );
        Ok(reset)
    }

    /// Clears lapsed leases so crashed workers' cursors become claimable.
    pub async fn recover_leases(&self) -> Result<usize, ApplicationError> {
        let now = self.clock.now();
        let expired = self.repos.cursors.list_expired_leases(now).await?;
        let expected: HashMap<CursorId, u32> =
            expired.iter().map(|cursor| (cursor.id.clone(), cursor.state_version)).collect();

        let mut recovered = 0;
        for cursor in self.engine.recover_expired_leases(expired, now) {
            let Some(version) = expected.get(&cursor.id).copied() else {
                continue;
            };
            let cursor_id = cursor.id.clone();
            if self.repos.cursors.compare_and_swap(cursor, version).await? {
                recovered += 1;
                debug!(
                    event_name = "engine.lease.recovered",
                    cursor_id = %cursor_id.0,
                    "expired lease cleared"
                );
            }
        }
        Ok(recovered)
    }

    /// Due cursors of every active loadout, at most `batch` per loadout.
    pub async fn due_cursors(&self, batch: u32) -> Result<Vec<ExecutionCursor>, ApplicationError> {
        let now = self.clock.now();
        let mut due = Vec::new();
        for loadout in self.repos.loadouts.list_active().await? {
            due.extend(self.repos.cursors.list_due(&loadout.id, now, batch).await?);
        }
        Ok(due)
    }

    /// One scheduler pass executed inline: recover leases, then process every
    /// due cursor on behalf of `worker_id`.
    pub async fn run_pending(
        &self,
        worker_id: &str,
        batch: u32,
    ) -> Result<Vec<RunReport>, ApplicationError> {
        self.recover_leases().await?;
        let mut reports = Vec::new();
        for cursor in self.due_cursors(batch).await? {
            reports.push(self.process(cursor, worker_id).await?);
        }
        Ok(reports)
    }

    /// Claims `cursor` and executes steps until it parks, waits on a delay,
    /// or its loadout stops being active.
    pub async fn process(
        &self,
        cursor: ExecutionCursor,
        worker_id: &str,
    ) -> Result<RunReport, ApplicationError> {
        let mut report = RunReport::new(cursor.id.clone());
        let mut cursor = cursor;

        loop {
            if self.is_stopping() {
                report.halted = Some(HaltReason::ShuttingDown);
                break;
            }

            let now = self.clock.now();
            let loadout = self
                .repos
                .loadouts
                .find_by_id(&cursor.tenant_id, &cursor.loadout_id)
                .await?
                .filter(LoadoutConfig::is_active);
            let Some(loadout) = loadout else {
                report.halted = Some(HaltReason::LoadoutInactive);
                break;
            };

            let expected = cursor.state_version;
            let claimed = match self.engine.claim(cursor, worker_id, now) {
                Ok(transition) => transition.cursor,
                Err(ExecutionError::CursorNotYetDue(_)) => {
                    report.halted = Some(HaltReason::NotDue);
                    break;
                }
                Err(_) => {
                    report.halted = Some(HaltReason::NotClaimable);
                    break;
                }
            };
            if !self.repos.cursors.compare_and_swap(claimed.clone(), expected).await? {
                report.halted = Some(HaltReason::LostRace);
                break;
            }

            let turn = Turn { loadout: &loadout, worker_id, now };
            let Some(next) = self.execute_step(&turn, claimed, &mut report).await? else {
                break;
            };
            let keep_going = matches!(report.last_outcome(), Some(CursorOutcome::Advanced { .. }))
                && next.due_at <= self.clock.now();
            if !keep_going {
                break;
            }
            cursor = next;
        }

        Ok(report)
    }

    /// Runs the step a freshly claimed cursor points at. Returns the persisted
    /// cursor, or `None` once it is gone or another writer took over.
    async fn execute_step(
        &self,
        turn: &Turn<'_>,
        cursor: ExecutionCursor,
        report: &mut RunReport,
    ) -> Result<Option<ExecutionCursor>, ApplicationError> {
        let contact = self.repos.contacts.find(&cursor.tenant_id, &cursor.contact_id).await?;
        let Some(contact) = contact else {
            let error = DispatchError::Permanent(format!(
                "contact `{}` no longer exists",
                cursor.contact_id.0
            ));
            return self.fail(turn, cursor, None, error, report).await;
        };

        let local_day = self.admission.local_day(&turn.loadout.settings, turn.now);
        let mut cursor = cursor;
        let mut plan = self.engine.plan(&cursor, turn.loadout, &contact, local_day, turn.now);

        if plan == StepPlan::Restart {
            let expected = cursor.state_version;
            let from_version = cursor.loadout_version;
            let transition = self.engine.restart(cursor, turn.loadout, turn.now);
            info!(
                event_name = "engine.cursor.restarted",
                cursor_id = %transition.cursor.id.0,
                from_version,
                to_version = turn.loadout.version,
                "cursor restarted on the current loadout version"
            );
            let Some(restarted) = self.persist(transition, expected, report).await? else {
                return Ok(None);
            };
            if restarted.due_at > turn.now {
                let expected = restarted.state_version;
                let released = self
                    .engine
                    .release(restarted, turn.worker_id, turn.now)
                    .map_err(engine_error)?;
                return self.persist(released, expected, report).await;
            }
            cursor = restarted;
            plan = self.engine.plan(&cursor, turn.loadout, &contact, local_day, turn.now);
        }

        match plan {
            StepPlan::Restart => {
                let expected = cursor.state_version;
                let released =
                    self.engine.release(cursor, turn.worker_id, turn.now).map_err(engine_error)?;
                self.persist(released, expected, report).await
            }
            StepPlan::Skip { step_index, reason } => {
                let mut entry =
                    activity(&cursor, ActivityKind::Skipped, turn.now).detail(reason.as_str());
                if let Some(step) = turn.loadout.chain.step(step_index) {
                    entry = entry.step(step.agent_type, step.action.as_str());
                }
                self.record(entry).await?;
                debug!(
                    event_name = "engine.step.skipped",
                    cursor_id = %cursor.id.0,
                    step_index,
                    reason = reason.as_str(),
                    "step skipped"
                );

                let expected = cursor.state_version;
                let transition = self
                    .engine
                    .skip_step(cursor, turn.worker_id, turn.loadout, turn.now)
                    .map_err(engine_error)?;
                self.finish_advance(transition, expected, report).await
            }
            StepPlan::Dispatch(plan) => {
                self.dispatch_step(turn, cursor, contact, *plan, report).await
            }
        }
    }

    async fn dispatch_step(
        &self,
        turn: &Turn<'_>,
        cursor: ExecutionCursor,
        contact: Contact,
        plan: DispatchPlan,
        report: &mut RunReport,
    ) -> Result<Option<ExecutionCursor>, ApplicationError> {
        let settings = &turn.loadout.settings;

        if let Some(completion) = self.repos.ledger.find(&plan.dedup_key).await?.and_then(replay) {
            return self.complete(turn, cursor, contact, &plan, completion, report).await;
        }

        if let Err(deferral) = self.admission.screen(settings, &contact, plan.channel, turn.now) {
            return self.defer(turn, cursor, &plan, deferral, report).await;
        }

        let slot = self
            .repos
            .admission
            .try_admit(
                &turn.loadout.tenant_id,
                plan.local_day,
                &plan.dedup_key,
                settings.max_contacts_per_day,
                turn.now,
            )
            .await?;
        if let AdmissionDecision::Defer(deferral) = self.admission.decide(settings, slot, turn.now)
        {
            return self.defer(turn, cursor, &plan, deferral, report).await;
        }

        let reserved = reservation(&cursor, turn.loadout, &plan, turn.now);
        let mut record = self.repos.ledger.reserve(reserved).await?;
        if let Some(completion) = replay(record.clone()) {
            return self.complete(turn, cursor, contact, &plan, completion, report).await;
        }

        let request = DispatchRequest {
            dedup_key: plan.dedup_key.clone(),
            tenant_id: turn.loadout.tenant_id.clone(),
            loadout_id: turn.loadout.id.clone(),
            step_index: plan.step_index,
            agent_type: plan.step.agent_type,
            action: plan.step.action.clone(),
            channel: plan.channel,
            contact: contact.clone(),
            agent: plan.agent.clone(),
        };

        record.attempt_count += 1;
        record.updated_at = turn.now;
        match self.providers.dispatch(&request).await {
            Ok(receipt) => {
                record.state = DispatchState::Completed;
                record.external_ref = Some(receipt.external_ref.clone());
                record.last_error = None;
                self.repos.ledger.save(record).await?;
                let completion = Completion { external_ref: receipt.external_ref, replayed: false };
                self.complete(turn, cursor, contact, &plan, completion, report).await
            }
            Err(error) => {
                record.state = DispatchState::Failed;
                record.last_error = Some(error.to_string());
                self.repos.ledger.save(record).await?;
                self.fail(turn, cursor, Some(&plan), error, report).await
            }
        }
    }

    /// Applies the action's effect to the contact and advances the cursor.
    /// Replays of an already-completed dispatch write no second activity.
    async fn complete(
        &self,
        turn: &Turn<'_>,
        cursor: ExecutionCursor,
        mut contact: Contact,
        plan: &DispatchPlan,
        completion: Completion,
        report: &mut RunReport,
    ) -> Result<Option<ExecutionCursor>, ApplicationError> {
        let effect = plan.step.action.effect();
        if !effect.is_noop() {
            contact.apply_effect(&effect, turn.now);
            self.repos.contacts.save(contact).await?;
        }

        let Completion { external_ref, replayed } = completion;
        if replayed {
            info!(
                event_name = "engine.dispatch.replayed",
                cursor_id = %cursor.id.0,
                dedup_key = plan.dedup_key.as_str(),
                external_ref = %external_ref,
                "dispatch already recorded; provider not called"
            );
        } else {
            self.record(
                activity(&cursor, ActivityKind::Dispatched, turn.now)
                    .step(plan.step.agent_type, plan.step.action.as_str())
                    .detail(plan.channel.to_string())
                    .external_ref(external_ref.clone()),
            )
            .await?;
            info!(
                event_name = "engine.step.dispatched",
                tenant_id = %cursor.tenant_id.0,
                cursor_id = %cursor.id.0,
                step_index = plan.step_index,
                agent_type = %plan.step.agent_type,
                channel = %plan.channel,
                external_ref = %external_ref,
                "step dispatched"
            );
        }

        let expected = cursor.state_version;
        let transition = self
            .engine
            .complete_step(cursor, turn.worker_id, turn.loadout, turn.now)
            .map_err(engine_error)?;
        self.finish_advance(transition, expected, report).await
    }

    async fn defer(
        &self,
        turn: &Turn<'_>,
        cursor: ExecutionCursor,
        plan: &DispatchPlan,
        deferral: Deferral,
        report: &mut RunReport,
    ) -> Result<Option<ExecutionCursor>, ApplicationError> {
        self.record(
            activity(&cursor, ActivityKind::Deferred, turn.now)
                .step(plan.step.agent_type, plan.step.action.as_str())
                .detail(deferral.reason.as_str()),
        )
        .await?;
        info!(
            event_name = "engine.step.deferred",
            cursor_id = %cursor.id.0,
            step_index = plan.step_index,
            reason = deferral.reason.as_str(),
            until = %deferral.until.to_rfc3339(),
            "step deferred"
        );

        let expected = cursor.state_version;
        let transition = self
            .engine
            .defer_step(cursor, turn.worker_id, deferral, turn.now)
            .map_err(engine_error)?;
        self.persist(transition, expected, report).await
    }

    /// Records a failed step. Exhausted or terminal failures park the cursor
    /// and notify the operator.
    async fn fail(
        &self,
        turn: &Turn<'_>,
        cursor: ExecutionCursor,
        plan: Option<&DispatchPlan>,
        error: DispatchError,
        report: &mut RunReport,
    ) -> Result<Option<ExecutionCursor>, ApplicationError> {
        let (policy, max_attempts) = match plan {
            Some(plan) => (error.retry_policy(), plan.agent.max_attempts()),
            None => (RetryPolicy::FailTerminal, 1),
        };

        let mut entry =
            activity(&cursor, ActivityKind::DispatchFailed, turn.now).detail(error.to_string());
        if let Some(plan) = plan {
            entry = entry.step(plan.step.agent_type, plan.step.action.as_str());
        }
        self.record(entry).await?;
        warn!(
            event_name = "engine.step.failed",
            cursor_id = %cursor.id.0,
            step_index = cursor.step_index,
            error_class = error.class(),
            error = %error,
            "step dispatch failed"
        );

        let expected = cursor.state_version;
        let transition = self
            .engine
            .fail_step(cursor, turn.worker_id, error.to_string(), policy, max_attempts, turn.now)
            .map_err(engine_error)?;
        let parked = transition.outcome == CursorOutcome::NeedsAttention;
        let Some(cursor) = self.persist(transition, expected, report).await? else {
            return Ok(None);
        };

        if parked {
            self.record(
                activity(&cursor, ActivityKind::NeedsAttention, turn.now)
                    .detail(cursor.last_error.clone().unwrap_or_default()),
            )
            .await?;
            let notice = NeedsAttentionNotice {
                event: "cursor.needs_attention",
                tenant_id: cursor.tenant_id.clone(),
                loadout_id: cursor.loadout_id.clone(),
                contact_id: cursor.contact_id.clone(),
                step_index: cursor.step_index,
                agent_type: plan.map(|plan| plan.step.agent_type),
                attempts: cursor.attempts,
                last_error: cursor.last_error.clone(),
                operator_email: turn.loadout.settings.notification_email.clone(),
                occurred_at: turn.now,
            };
            self.notifier.needs_attention(&notice, &turn.loadout.settings.webhook_urls).await;
        }
        Ok(Some(cursor))
    }

    /// Persists an advance. Completed cursors are deleted; paused ones stay
    /// for a later re-entry.
    async fn finish_advance(
        &self,
        transition: CursorTransition,
        expected: u32,
        report: &mut RunReport,
    ) -> Result<Option<ExecutionCursor>, ApplicationError> {
        let now = transition.cursor.updated_at;
        match transition.outcome {
            CursorOutcome::Completed => {
                let cursor = transition.cursor;
                if !self.repos.cursors.delete(&cursor.id, expected).await? {
                    report.halted = Some(HaltReason::LostRace);
                    return Ok(None);
                }
                report.outcomes.push(CursorOutcome::Completed);
                self.record(activity(&cursor, ActivityKind::ChainCompleted, now)).await?;
                info!(
                    event_name = "engine.chain.completed",
                    tenant_id = %cursor.tenant_id.0,
                    loadout_id = %cursor.loadout_id.0,
                    contact_id = %cursor.contact_id.0,
                    "contact completed the chain"
                );
                Ok(None)
            }
            CursorOutcome::Paused => {
                let Some(cursor) = self.persist(transition, expected, report).await? else {
                    return Ok(None);
                };
                self.record(activity(&cursor, ActivityKind::ChainPaused, now)).await?;
                info!(
                    event_name = "engine.chain.paused",
                    tenant_id = %cursor.tenant_id.0,
                    contact_id = %cursor.contact_id.0,
                    "chain ended without a dispatch; cursor paused"
                );
                Ok(Some(cursor))
            }
            _ => self.persist(transition, expected, report).await,
        }
    }

    async fn persist(
        &self,
        transition: CursorTransition,
        expected: u32,
        report: &mut RunReport,
    ) -> Result<Option<ExecutionCursor>, ApplicationError> {
        let CursorTransition { cursor, outcome } = transition;
        if !self.repos.cursors.compare_and_swap(cursor.clone(), expected).await? {
            report.halted = Some(HaltReason::LostRace);
            return Ok(None);
        }
        report.outcomes.push(outcome);
        Ok(Some(cursor))
    }

    async fn record(&self, entry: ActivityEntry) -> Result<(), ApplicationError> {
        Ok(self.repos.contacts.append_activity(entry).await?)
    }
}

/// What one claimed cursor is being executed against.
struct Turn<'a> {
    loadout: &'a LoadoutConfig,
    worker_id: &'a str,
    now: DateTime<Utc>,
}

struct Completion {
    external_ref: String,
    replayed: bool,
}

/// A ledger record that already carries a provider reference.
fn replay(record: DispatchRecord) -> Option<Completion> {
    if !record.is_completed() {
        return None;
    }
    record.external_ref.map(|external_ref| Completion { external_ref, replayed: true })
}

fn engine_error(error: ExecutionError) -> ApplicationError {
    ApplicationError::Conflict(error.to_string())
}

fn reservation(
    cursor: &ExecutionCursor,
    loadout: &LoadoutConfig,
    plan: &DispatchPlan,
    now: DateTime<Utc>,
) -> DispatchRecord {
    DispatchRecord {
        dedup_key: plan.dedup_key.clone(),
        tenant_id: loadout.tenant_id.clone(),
        loadout_id: loadout.id.clone(),
        loadout_version: loadout.version,
        contact_id: cursor.contact_id.clone(),
        step_index: plan.step_index,
        agent_type: plan.step.agent_type,
        action: plan.step.action.clone(),
        channel: plan.channel,
        state: DispatchState::Reserved,
        external_ref: None,
        attempt_count: 0,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

fn activity(cursor: &ExecutionCursor, kind: ActivityKind, now: DateTime<Utc>) -> ActivityEntry {
    ActivityEntry {
        id: format!("ACT-{}", uuid::Uuid::new_v4()),
        tenant_id: cursor.tenant_id.clone(),
        contact_id: cursor.contact_id.clone(),
        loadout_id: cursor.loadout_id.clone(),
        kind,
        agent_type: None,
        action: None,
        detail: String::new(),
        external_ref: None,
        occurred_at: now,
    }
}

trait ActivityEntryExt {
    fn step(self, agent_type: AgentType, action: &str) -> Self;
    fn detail(self, detail: impl Into<String>) -> Self;
    fn external_ref(self, external_ref: String) -> Self;
}

impl ActivityEntryExt for ActivityEntry {
    fn step(mut self, agent_type: AgentType, action: &str) -> Self {
        self.agent_type = Some(agent_type);
        self.action = Some(action.to_string());
        self
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    fn external_ref(mut self, external_ref: String) -> Self {
        self.external_ref = Some(external_ref);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;
    use tokio::sync::Mutex;

    use loadout_core::admission::DeferralReason;
    use loadout_core::builder::{build_loadout, BuildRequest, LoadoutUpdate};
    use loadout_core::clock::{Clock, ManualClock};
    use loadout_core::dispatch::DispatchError;
    use loadout_core::domain::agent::{AgentConfig, AgentType, Channel};
    use loadout_core::domain::chain::{ChainType, StepDefinition};
    use loadout_core::domain::contact::{
        ActivityKind, AttributeValue, Contact, ContactId, ContactStage,
    };
    use loadout_core::domain::execution::{CursorId, CursorState, DispatchState, ExecutionCursor};
    use loadout_core::domain::loadout::{LoadoutConfig, LoadoutSettings, TenantId};
    use loadout_core::errors::ApplicationError;
    use loadout_core::execution_engine::{CursorEngine, CursorOutcome};
    use loadout_db::{ActivationManager, ConfigurationStore, ResumeMode};

    use super::{ChainRunner, EnrollStatus, EnrollTrigger, HaltReason, Repositories, RunReport};
    use crate::notify::{DeliveryReport, NeedsAttentionNotice, Notifier};
    use crate::providers::{GatedProvider, ProviderRegistry, RecordingProvider};

    const WORKER: &str = "worker-1";

    #[derive(Default)]
    struct CapturingNotifier {
        notices: Mutex<Vec<NeedsAttentionNotice>>,
    }

    #[async_trait]
    impl Notifier for CapturingNotifier {
        async fn needs_attention(
            &self,
            notice: &NeedsAttentionNotice,
            _webhook_urls: &[String],
        ) -> DeliveryReport {
            self.notices.lock().await.push(notice.clone());
            DeliveryReport::default()
        }
    }

    struct Harness {
        runner: ChainRunner,
        repos: Repositories,
        activation: ActivationManager,
        clock: ManualClock,
        email: Arc<RecordingProvider>,
        internal: Arc<RecordingProvider>,
        gate: Option<Arc<GatedProvider>>,
        notifier: Arc<CapturingNotifier>,
        loadout: LoadoutConfig,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).single().expect("valid")
    }

    fn tenant() -> TenantId {
        TenantId("tenant-a".to_string())
    }

    fn settings(max_contacts_per_day: u32) -> LoadoutSettings {
        LoadoutSettings {
            max_contacts_per_day,
            allowed_channels: vec![Channel::Email],
            notification_email: Some("ops@example.test".to_string()),
            webhook_urls: vec!["https://hooks.example.test/loadout".to_string()],
            ..LoadoutSettings::default()
        }
    }

    /// qualifier (score >= 40) -> outreach (qualified == true)
    fn gated() -> BuildRequest {
        BuildRequest {
            settings: Some(settings(100)),
            ..BuildRequest::blank(
                "gated",
                vec![
                    AgentConfig::new(AgentType::Qualifier).with_threshold(Decimal::from(40)),
                    AgentConfig::new(AgentType::Outreach),
                ],
            )
        }
    }

    /// researcher -> outreach one hour later -> ops
    fn drip() -> BuildRequest {
        BuildRequest {
            chain_type: Some(ChainType::Custom),
            custom_steps: Some(vec![
                StepDefinition::new(AgentType::Researcher),
                StepDefinition::new(AgentType::Outreach).after_minutes(60),
                StepDefinition::new(AgentType::Ops),
            ]),
            settings: Some(settings(100)),
            ..BuildRequest::blank(
                "drip",
                vec![
                    AgentConfig::new(AgentType::Researcher),
                    AgentConfig::new(AgentType::Outreach),
                    AgentConfig::new(AgentType::Ops),
                ],
            )
        }
    }

    fn outreach_only(max_contacts_per_day: u32, max_attempts: u32) -> BuildRequest {
        BuildRequest {
            settings: Some(settings(max_contacts_per_day)),
            ..BuildRequest::blank(
                "outreach",
                vec![AgentConfig::new(AgentType::Outreach).with_max_attempts(max_attempts)],
            )
        }
    }

    async fn harness(request: BuildRequest) -> Harness {
        build_harness(request, false).await
    }

    /// Same as [`harness`], but the first internal dispatch blocks on `gate`.
    async fn gated_harness(request: BuildRequest) -> Harness {
        build_harness(request, true).await
    }

    async fn build_harness(request: BuildRequest, gated: bool) -> Harness {
        let clock = ManualClock::new(start());
        let repos = Repositories::in_memory();
        let email = Arc::new(RecordingProvider::new(Channel::Email));
        let internal = Arc::new(RecordingProvider::new(Channel::Internal));
        let mut registry = ProviderRegistry::new();
        registry.register(email.clone(), 4);
        let gate = gated.then(|| Arc::new(GatedProvider::new(internal.clone())));
        match &gate {
            Some(gate) => registry.register(gate.clone(), 4),
            None => registry.register(internal.clone(), 4),
        }
        let notifier = Arc::new(CapturingNotifier::default());

        let runner = ChainRunner::new(
            repos.clone(),
            Arc::new(registry),
            notifier.clone(),
            Arc::new(clock.clone()),
            CursorEngine::new(),
        );

        let loadout = build_loadout(tenant(), request, start()).expect("loadout builds");
        repos.loadouts.insert(loadout.clone()).await.expect("insert loadout");
        let activation = ActivationManager::new(repos.loadouts.clone());
        let report =
            activation.activate(&tenant(), &loadout.id, None, start()).await.expect("activate");

        Harness {
            runner,
            repos,
            activation,
            clock,
            email,
            internal,
            gate,
            notifier,
            loadout: report.loadout,
        }
    }

    impl Harness {
        async fn add_contact(&self, id: &str, score: i64) -> ContactId {
            let contact = Contact::new(id, tenant(), Decimal::from(score));
            self.repos.contacts.save(contact).await.expect("save contact");
            let contact_id = ContactId(id.to_string());
            let outcome = self
                .runner
                .enroll(&tenant(), &contact_id, EnrollTrigger::Created)
                .await
                .expect("enroll");
            assert_eq!(outcome.status, EnrollStatus::Enrolled);
            contact_id
        }

        async fn run(&self) -> Vec<RunReport> {
            self.runner.run_pending(WORKER, 50).await.expect("run pending")
        }

        async fn cursor(&self, contact_id: &ContactId) -> Option<ExecutionCursor> {
            let id = CursorId::for_contact(&self.loadout.id, contact_id);
            self.repos.cursors.find(&id).await.expect("find cursor")
        }

        async fn contact(&self, contact_id: &ContactId) -> Contact {
            self.repos.contacts.find(&tenant(), contact_id).await.expect("find").expect("exists")
        }

        async fn activity(&self, contact_id: &ContactId) -> Vec<ActivityKind> {
            self.repos
                .contacts
                .list_activity(&tenant(), contact_id)
                .await
                .expect("activity")
                .into_iter()
                .map(|entry| entry.kind)
                .collect()
        }
    }

    #[tokio::test]
    async fn low_score_contact_skips_gated_steps_and_pauses() {
        let h = harness(gated()).await;
        let cold = h.add_contact("C-cold", 20).await;

        let reports = h.run().await;

        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].outcomes,
            vec![CursorOutcome::Advanced { next_index: 1 }, CursorOutcome::Paused]
        );
        assert!(h.email.requests().await.is_empty());
        assert!(h.internal.requests().await.is_empty());
        assert_eq!(h.cursor(&cold).await.expect("paused cursor stays").state, CursorState::Paused);
        assert_eq!(
            h.activity(&cold).await,
            vec![
                ActivityKind::Enrolled,
                ActivityKind::Skipped,
                ActivityKind::Skipped,
                ActivityKind::ChainPaused
            ]
        );
    }

    #[tokio::test]
    async fn qualifying_contact_unlocks_the_guarded_step() {
        let h = harness(gated()).await;
        let warm = h.add_contact("C-warm", 55).await;

        let reports = h.run().await;

        assert_eq!(
            reports[0].outcomes,
            vec![CursorOutcome::Advanced { next_index: 1 }, CursorOutcome::Completed]
        );
        assert_eq!(h.internal.requests().await.len(), 1);
        assert_eq!(h.email.requests().await.len(), 1);
        assert!(h.cursor(&warm).await.is_none(), "completed cursors are removed");

        let contact = h.contact(&warm).await;
        assert_eq!(contact.stage, ContactStage::Contacted);
        assert_eq!(contact.attributes.get("qualified"), Some(&AttributeValue::Bool(true)));
        assert!(contact.last_contacted_at.is_some());
        assert_eq!(h.activity(&warm).await.last(), Some(&ActivityKind::ChainCompleted));
    }

    #[tokio::test]
    async fn re_entry_restarts_a_paused_cursor() {
        let h = harness(gated()).await;
        let contact_id = h.add_contact("C-late", 20).await;
        h.run().await;

        let mut contact = h.contact(&contact_id).await;
        contact.score = Decimal::from(70);
        h.repos.contacts.save(contact).await.expect("save");

        let again = h
            .runner
            .enroll(&tenant(), &contact_id, EnrollTrigger::Created)
            .await
            .expect("enroll");
        assert_eq!(again.status, EnrollStatus::AlreadyEnrolled);

        let reentered = h
            .runner
            .enroll(&tenant(), &contact_id, EnrollTrigger::ReEntry)
            .await
            .expect("re-enter");
        assert_eq!(reentered.status, EnrollStatus::Restarted);
        assert_eq!(reentered.cursor.expect("restarted cursor").step_index, 0);

        let reports = h.run().await;
        assert_eq!(reports[0].last_outcome(), Some(CursorOutcome::Completed));
        assert_eq!(h.email.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_created_event_does_not_restart_a_completed_chain() {
        let h = harness(outreach_only(100, 3)).await;
        let contact_id = h.add_contact("C-done", 50).await;
        let reports = h.run().await;
        assert_eq!(reports[0].last_outcome(), Some(CursorOutcome::Completed));
        assert!(h.cursor(&contact_id).await.is_none());

        h.clock.advance(Duration::days(1));
        let duplicate = h
            .runner
            .enroll(&tenant(), &contact_id, EnrollTrigger::Created)
            .await
            .expect("duplicate created event");
        assert_eq!(duplicate.status, EnrollStatus::AlreadyCompleted);
        assert!(duplicate.cursor.is_none());
        assert!(h.run().await.is_empty());
        assert_eq!(h.email.requests().await.len(), 1);

        let reentered = h
            .runner
            .enroll(&tenant(), &contact_id, EnrollTrigger::ReEntry)
            .await
            .expect("re-enter");
        assert_eq!(reentered.status, EnrollStatus::Enrolled);
        h.run().await;
        assert_eq!(h.email.requests().await.len(), 2);
    }

    /// researcher -> outreach -> ops, all due immediately
    fn back_to_back() -> BuildRequest {
        BuildRequest {
            custom_steps: Some(vec![
                StepDefinition::new(AgentType::Researcher),
                StepDefinition::new(AgentType::Outreach),
                StepDefinition::new(AgentType::Ops),
            ]),
            ..drip()
        }
    }

    #[tokio::test]
    async fn shutdown_halts_a_chain_between_steps() {
        let h = gated_harness(back_to_back()).await;
        let contact_id = h.add_contact("C-stop", 50).await;
        let cursor = h.cursor(&contact_id).await.expect("cursor");
        let gate = h.gate.clone().expect("gated harness");

        let (report, ()) = tokio::join!(h.runner.process(cursor, WORKER), async {
            gate.entered.notified().await;
            h.runner.begin_shutdown();
            gate.release.notify_one();
        });
        let report = report.expect("process");

        assert_eq!(report.outcomes, vec![CursorOutcome::Advanced { next_index: 1 }]);
        assert_eq!(report.halted, Some(HaltReason::ShuttingDown));
        assert_eq!(h.internal.requests().await.len(), 1, "the in-flight step finished");
        assert!(h.email.requests().await.is_empty(), "no step started after shutdown");

        let parked = h.cursor(&contact_id).await.expect("cursor");
        assert_eq!(parked.step_index, 1);
        assert!(parked.due_at <= h.clock.now(), "the next step stays due for the next start");
        let records =
            h.repos.ledger.list_for_contact(&tenant(), &contact_id).await.expect("ledger");
        assert!(records.iter().all(|record| record.state == DispatchState::Completed));

        let reports = h.run().await;
        assert!(reports.iter().all(|report| report.halted == Some(HaltReason::ShuttingDown)));
        assert!(h.email.requests().await.is_empty());
    }

    #[tokio::test]
    async fn enrollment_requires_an_active_loadout_and_a_known_contact() {
        let h = harness(gated()).await;

        let missing = h
            .runner
            .enroll(&tenant(), &ContactId("C-ghost".to_string()), EnrollTrigger::Created)
            .await;
        assert!(matches!(missing, Err(ApplicationError::NotFound(_))));

        let other = TenantId("tenant-b".to_string());
        let contact = Contact::new("C-b", other.clone(), Decimal::from(50));
        h.repos.contacts.save(contact).await.expect("save");
        let inactive =
            h.runner.enroll(&other, &ContactId("C-b".to_string()), EnrollTrigger::Created).await;
        assert!(matches!(inactive, Err(ApplicationError::Conflict(_))));
    }

    #[tokio::test]
    async fn replayed_step_never_calls_the_provider_twice() {
        let h = harness(gated()).await;
        let warm = h.add_contact("C-warm", 55).await;
        h.run().await;
        let refs_before = h.email.issued_count().await;

        // A worker that dispatched but died before persisting its advance
        // leaves the contact back at step 0.
        let stale = CursorEngine::new().enroll(&h.loadout, warm.clone(), h.clock.now());
        assert!(h.repos.cursors.insert(stale).await.expect("insert"));

        let reports = h.run().await;

        assert_eq!(reports[0].last_outcome(), Some(CursorOutcome::Completed));
        assert_eq!(h.internal.requests().await.len(), 1);
        assert_eq!(h.email.requests().await.len(), 1);
        assert_eq!(h.email.issued_count().await, refs_before);

        let dispatched = h
            .activity(&warm)
            .await
            .into_iter()
            .filter(|kind| *kind == ActivityKind::Dispatched)
            .count();
        assert_eq!(dispatched, 2, "replays write no second dispatch activity");
    }

    #[tokio::test]
    async fn daily_cap_defers_the_next_contact_to_the_following_window() {
        let h = harness(outreach_only(2, 3)).await;
        let mut contacts = Vec::new();
        for id in ["C-1", "C-2", "C-3"] {
            contacts.push(h.add_contact(id, 50).await);
        }

        let reports = h.run().await;

        let completed = reports
            .iter()
            .filter(|report| report.last_outcome() == Some(CursorOutcome::Completed))
            .count();
        let deferred = reports
            .iter()
            .filter(|report| {
                report.last_outcome()
                    == Some(CursorOutcome::Deferred(DeferralReason::DailyCapReached))
            })
            .count();
        assert_eq!((completed, deferred), (2, 1));
        assert_eq!(h.email.requests().await.len(), 2);

        let today = NaiveDate::from_ymd_opt(2026, 3, 4).expect("valid");
        let admitted = h.repos.admission.admitted_count(&tenant(), today).await.expect("count");
        assert_eq!(admitted, 2);

        let mut waiting = Vec::new();
        for contact_id in &contacts {
            if let Some(cursor) = h.cursor(contact_id).await {
                waiting.push(cursor);
            }
        }
        assert_eq!(waiting.len(), 1);
        let next_window = Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).single().expect("valid");
        assert_eq!(waiting[0].due_at, next_window);

        h.clock.set(next_window + Duration::minutes(5));
        let reports = h.run().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].last_outcome(), Some(CursorOutcome::Completed));
        assert_eq!(h.email.requests().await.len(), 3);
    }

    #[tokio::test]
    async fn opted_out_and_after_hours_steps_are_deferred_without_a_slot() {
        let h = harness(outreach_only(10, 3)).await;
        let mut contact = Contact::new("C-out", tenant(), Decimal::from(50));
        contact.opted_out_channels.insert(Channel::Email);
        h.repos.contacts.save(contact).await.expect("save");
        let opted_out = ContactId("C-out".to_string());
        h.runner.enroll(&tenant(), &opted_out, EnrollTrigger::Created).await.expect("enroll");

        let reports = h.run().await;
        assert_eq!(
            reports[0].last_outcome(),
            Some(CursorOutcome::Deferred(DeferralReason::ChannelOptedOut(Channel::Email)))
        );

        h.clock.set(Utc.with_ymd_and_hms(2026, 3, 4, 20, 0, 0).single().expect("valid"));
        let late = h.add_contact("C-late", 50).await;
        let reports = h.run().await;
        assert_eq!(
            reports[0].last_outcome(),
            Some(CursorOutcome::Deferred(DeferralReason::OutsideBusinessHours))
        );
        let cursor = h.cursor(&late).await.expect("cursor");
        assert_eq!(cursor.due_at, Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).single().expect("ok"));

        assert!(h.email.requests().await.is_empty());
        let today = NaiveDate::from_ymd_opt(2026, 3, 4).expect("valid");
        let admitted = h.repos.admission.admitted_count(&tenant(), today).await.expect("count");
        assert_eq!(admitted, 0);
    }

    #[tokio::test]
    async fn deactivation_halts_and_reactivation_resumes_at_the_same_step() {
        let h = harness(drip()).await;
        let contact_id = h.add_contact("C-drip", 50).await;

        let reports = h.run().await;
        assert_eq!(reports[0].outcomes, vec![CursorOutcome::Advanced { next_index: 1 }]);
        assert_eq!(h.cursor(&contact_id).await.expect("cursor").step_index, 1);

        let current = h.activation.current(&tenant()).await.expect("activation");
        h.activation
            .deactivate(&tenant(), &h.loadout.id, current.version, h.clock.now())
            .await
            .expect("deactivate");

        h.clock.advance(Duration::hours(2));
        assert!(h.run().await.is_empty(), "inactive loadouts are not scheduled");
        assert_eq!(h.cursor(&contact_id).await.expect("cursor").step_index, 1);

        let report = h
            .activation
            .activate(&tenant(), &h.loadout.id, None, h.clock.now())
            .await
            .expect("reactivate");
        assert_eq!(report.mode, ResumeMode::Resume);

        let reports = h.run().await;
        assert_eq!(
            reports[0].outcomes,
            vec![CursorOutcome::Advanced { next_index: 2 }, CursorOutcome::Completed]
        );
        let internal_steps: Vec<u32> =
            h.internal.requests().await.iter().map(|request| request.step_index).collect();
        let email_steps: Vec<u32> =
            h.email.requests().await.iter().map(|request| request.step_index).collect();
        assert_eq!(internal_steps, vec![0, 2]);
        assert_eq!(email_steps, vec![1]);
    }

    #[tokio::test]
    async fn edited_loadout_restarts_cursors_on_the_new_version() {
        let h = harness(drip()).await;
        let contact_id = h.add_contact("C-drip", 50).await;
        h.run().await;

        let store = ConfigurationStore::new(h.repos.loadouts.clone(), h.repos.cursors.clone());
        let update = LoadoutUpdate {
            description: Some("slower drip".to_string()),
            ..LoadoutUpdate::default()
        };
        let edited = store
            .update(&tenant(), &h.loadout.id, h.loadout.version, update, h.clock.now())
            .await
            .expect("update");
        assert_eq!(edited.version, h.loadout.version + 1);

        h.clock.advance(Duration::hours(2));
        let reports = h.run().await;

        assert_eq!(
            reports[0].outcomes,
            vec![CursorOutcome::Restarted, CursorOutcome::Advanced { next_index: 1 }]
        );
        let cursor = h.cursor(&contact_id).await.expect("cursor");
        assert_eq!(cursor.loadout_version, edited.version);
        assert_eq!(cursor.step_index, 1);
        assert_eq!(h.internal.requests().await.len(), 2, "new version dispatches step 0 again");
    }

    #[tokio::test]
    async fn exhausted_retries_park_the_cursor_and_notify() {
        let h = harness(outreach_only(10, 2)).await;
        let contact_id = h.add_contact("C-flaky", 50).await;
        h.email.fail_next(DispatchError::Transient("gateway timeout".to_string())).await;
        h.email.fail_next(DispatchError::Transient("gateway timeout".to_string())).await;

        let reports = h.run().await;
        assert_eq!(reports[0].outcomes, vec![CursorOutcome::RetryScheduled { attempt: 1 }]);
        let waiting = h.cursor(&contact_id).await.expect("cursor");
        assert_eq!(waiting.due_at, h.clock.now() + Duration::seconds(30));

        h.clock.advance(Duration::minutes(1));
        let reports = h.run().await;
        assert_eq!(reports[0].outcomes, vec![CursorOutcome::NeedsAttention]);

        let parked = h.cursor(&contact_id).await.expect("cursor");
        assert_eq!(parked.state, CursorState::NeedsAttention);
        assert_eq!(parked.attempts, 2);
        assert!(h.run().await.is_empty(), "parked cursors are not scheduled");

        let notices = h.notifier.notices.lock().await.clone();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].attempts, 2);
        assert_eq!(notices[0].agent_type, Some(AgentType::Outreach));
        assert!(notices[0].last_error.as_deref().unwrap_or("").contains("gateway timeout"));
        assert_eq!(notices[0].operator_email.as_deref(), Some("ops@example.test"));

        let records =
            h.repos.ledger.list_for_contact(&tenant(), &contact_id).await.expect("ledger");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, DispatchState::Failed);
        assert_eq!(records[0].attempt_count, 2);

        let reset =
            h.runner.retry(&tenant(), &h.loadout.id, &contact_id).await.expect("operator retry");
        assert_eq!(reset.state, CursorState::Advancing);
        assert_eq!(reset.attempts, 0);

        let reports = h.run().await;
        assert_eq!(reports[0].last_outcome(), Some(CursorOutcome::Completed));
        assert_eq!(h.email.requests().await.len(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_parks_immediately() {
        let h = harness(outreach_only(10, 5)).await;
        let contact_id = h.add_contact("C-bounce", 50).await;
        h.email.fail_next(DispatchError::Permanent("mailbox does not exist".to_string())).await;

        let reports = h.run().await;

        assert_eq!(reports[0].outcomes, vec![CursorOutcome::NeedsAttention]);
        assert_eq!(h.cursor(&contact_id).await.expect("cursor").attempts, 1);
        assert_eq!(h.notifier.notices.lock().await.len(), 1);
        assert!(h.activity(&contact_id).await.contains(&ActivityKind::NeedsAttention));
    }

    #[tokio::test]
    async fn retry_rejects_cursors_that_are_not_parked() {
        let h = harness(drip()).await;
        let contact_id = h.add_contact("C-busy", 50).await;

        let result = h.runner.retry(&tenant(), &h.loadout.id, &contact_id).await;
        assert!(matches!(result, Err(ApplicationError::Conflict(_))));

        let unknown =
            h.runner.retry(&tenant(), &h.loadout.id, &ContactId("C-none".to_string())).await;
        assert!(matches!(unknown, Err(ApplicationError::NotFound(_))));
    }

    #[tokio::test]
    async fn expired_leases_are_recovered_for_another_worker() {
        let h = harness(outreach_only(10, 3)).await;
        let contact_id = h.add_contact("C-crash", 50).await;

        let cursor = h.cursor(&contact_id).await.expect("cursor");
        let expected = cursor.state_version;
        let claimed =
            CursorEngine::new().claim(cursor, "worker-dead", h.clock.now()).expect("claim").cursor;
        assert!(h.repos.cursors.compare_and_swap(claimed, expected).await.expect("cas"));

        assert!(h.run().await.is_empty(), "leased cursors are not handed out");

        h.clock.advance(Duration::minutes(10));
        let reports = h.run().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].last_outcome(), Some(CursorOutcome::Completed));
    }
}
