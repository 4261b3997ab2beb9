//! JSON API for the template catalog, loadout configuration, activation,
//! contact events and cursor inspection.
//!
//! Catalog:
//! - `GET    /api/v1/templates`
//! - `GET    /api/v1/presets?q=&industry=`
//! - `GET    /api/v1/presets/{id}`
//!
//! Tenant scoped (`/api/v1/tenants/{tenant}`):
//! - `GET    /loadouts`, `POST /loadouts`
//! - `GET    /loadouts/{id}`, `PATCH /loadouts/{id}`, `DELETE /loadouts/{id}?expected_version=`
//! - `POST   /loadouts/{id}/activate`, `POST /loadouts/{id}/deactivate`
//! - `GET    /activation`
//! - `GET    /loadouts/{id}/cursors`
//! - `POST   /loadouts/{id}/cursors/{contact_id}/retry`
//! - `PUT    /contacts/{contact_id}`
//! - `GET    /contacts/{contact_id}/activity`
//! - `POST   /contacts/{contact_id}/events`

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use loadout_core::builder::{BuildRequest, LoadoutUpdate};
use loadout_core::catalog::{self, AgentTemplate, IndustryPreset};
use loadout_core::domain::agent::Channel;
use loadout_core::domain::contact::{
    ActivityEntry, AttributeValue, Contact, ContactId, ContactStage,
};
use loadout_core::domain::execution::ExecutionCursor;
use loadout_core::domain::loadout::{LoadoutConfig, LoadoutId, TenantActivation, TenantId};
use loadout_core::errors::{ApplicationError, InterfaceError};
use loadout_db::{
    ActivationManager, ActivationReport, ArchiveOutcome, ConfigurationStore, DeactivationReport,
};

use crate::runner::{ChainRunner, EnrollOutcome, EnrollTrigger, Repositories};

#[derive(Clone)]
pub struct AppState {
    store: ConfigurationStore,
    activation: ActivationManager,
    runner: Arc<ChainRunner>,
    repos: Repositories,
}

impl AppState {
    pub fn new(repos: Repositories, runner: Arc<ChainRunner>) -> Self {
        Self {
            store: ConfigurationStore::new(repos.loadouts.clone(), repos.cursors.clone()),
            activation: ActivationManager::new(repos.loadouts.clone()),
            runner,
            repos,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: &'static str,
    pub detail: String,
    pub correlation_id: String,
}

type Rejection = (StatusCode, Json<ApiError>);
type ApiResult<T> = Result<Json<T>, Rejection>;

#[derive(Debug, Default, Deserialize)]
pub struct PresetQuery {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLoadoutRequest {
    pub expected_version: u32,
    #[serde(flatten)]
    pub update: LoadoutUpdate,
}

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    pub expected_version: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivationRequest {
    /// Loadout version the caller saw. Omit to activate whatever is stored.
    #[serde(default)]
    pub expected_version: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeactivationRequest {
    /// Activation row version the caller saw. Omit to use the current one.
    #[serde(default)]
    pub expected_version: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ContactUpsert {
    pub score: Decimal,
    #[serde(default)]
    pub stage: Option<ContactStage>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub opted_out_channels: BTreeSet<Channel>,
}

#[derive(Debug, Deserialize)]
pub struct ContactEvent {
    pub trigger: EnrollTrigger,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let tenant_routes = Router::new()
        .route("/loadouts", get(list_loadouts).post(create_loadout))
        .route("/loadouts/{id}", get(get_loadout).patch(update_loadout).delete(archive_loadout))
        .route("/loadouts/{id}/activate", post(activate_loadout))
        .route("/loadouts/{id}/deactivate", post(deactivate_loadout))
        .route("/loadouts/{id}/cursors", get(list_cursors))
        .route("/loadouts/{id}/cursors/{contact_id}/retry", post(retry_cursor))
        .route("/activation", get(current_activation))
        .route("/contacts/{contact_id}", put(upsert_contact))
        .route("/contacts/{contact_id}/activity", get(contact_activity))
        .route("/contacts/{contact_id}/events", post(contact_event));

    Router::new()
        .route("/api/v1/templates", get(list_templates))
        .route("/api/v1/presets", get(list_presets))
        .route("/api/v1/presets/{id}", get(get_preset))
        .nest("/api/v1/tenants/{tenant}", tenant_routes)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

pub async fn list_templates() -> Json<Vec<AgentTemplate>> {
    Json(catalog::agent_templates().to_vec())
}

pub async fn list_presets(Query(query): Query<PresetQuery>) -> Json<Vec<IndustryPreset>> {
    let q = query.q.unwrap_or_default();
    Json(
        catalog::search_presets(&q, query.industry.as_deref())
            .into_iter()
            .cloned()
            .collect(),
    )
}

pub async fn get_preset(Path(id): Path<String>) -> ApiResult<IndustryPreset> {
    catalog::preset(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| reject(ApplicationError::NotFound(format!("preset `{id}`"))))
}

// ---------------------------------------------------------------------------
// Loadouts
// ---------------------------------------------------------------------------

pub async fn list_loadouts(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<Vec<LoadoutConfig>> {
    state.store.list(&TenantId(tenant)).await.map(Json).map_err(reject)
}

pub async fn create_loadout(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(request): Json<BuildRequest>,
) -> Result<(StatusCode, Json<LoadoutConfig>), Rejection> {
    let now = state.runner.now();
    let loadout = state.store.create(&TenantId(tenant), request, now).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(loadout)))
}

pub async fn get_loadout(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<LoadoutConfig> {
    state.store.get(&TenantId(tenant), &LoadoutId(id)).await.map(Json).map_err(reject)
}

pub async fn update_loadout(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    Json(request): Json<UpdateLoadoutRequest>,
) -> ApiResult<LoadoutConfig> {
    let now = state.runner.now();
    state
        .store
        .update(&TenantId(tenant), &LoadoutId(id), request.expected_version, request.update, now)
        .await
        .map(Json)
        .map_err(reject)
}

pub async fn archive_loadout(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<ArchiveOutcome> {
    let now = state.runner.now();
    state
        .store
        .archive(&TenantId(tenant), &LoadoutId(id), query.expected_version, now)
        .await
        .map(Json)
        .map_err(reject)
}

pub async fn activate_loadout(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    Json(request): Json<ActivationRequest>,
) -> ApiResult<ActivationReport> {
    let now = state.runner.now();
    state
        .activation
        .activate(&TenantId(tenant), &LoadoutId(id), request.expected_version, now)
        .await
        .map(Json)
        .map_err(reject)
}

pub async fn deactivate_loadout(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    Json(request): Json<DeactivationRequest>,
) -> ApiResult<DeactivationReport> {
    let tenant = TenantId(tenant);
    let expected_version = match request.expected_version {
        Some(version) => version,
        None => state.activation.current(&tenant).await.map_err(reject)?.version,
    };
    let now = state.runner.now();
    state
        .activation
        .deactivate(&tenant, &LoadoutId(id), expected_version, now)
        .await
        .map(Json)
        .map_err(reject)
}

pub async fn current_activation(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<TenantActivation> {
    state.activation.current(&TenantId(tenant)).await.map(Json).map_err(reject)
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

pub async fn list_cursors(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<Vec<ExecutionCursor>> {
    let loadout = state.store.get(&TenantId(tenant), &LoadoutId(id)).await.map_err(reject)?;
    state
        .repos
        .cursors
        .list_for_loadout(&loadout.id)
        .await
        .map(Json)
        .map_err(|error| reject(error.into()))
}

pub async fn retry_cursor(
    State(state): State<AppState>,
    Path((tenant, id, contact_id)): Path<(String, String, String)>,
) -> ApiResult<ExecutionCursor> {
    state
        .runner
        .retry(&TenantId(tenant), &LoadoutId(id), &ContactId(contact_id))
        .await
        .map(Json)
        .map_err(reject)
}

// ---------------------------------------------------------------------------
// Contacts
// ---------------------------------------------------------------------------

pub async fn upsert_contact(
    State(state): State<AppState>,
    Path((tenant, contact_id)): Path<(String, String)>,
    Json(body): Json<ContactUpsert>,
) -> ApiResult<Contact> {
    let tenant = TenantId(tenant);
    let id = ContactId(contact_id);
    let now = state.runner.now();

    let existing = state.repos.contacts.find(&tenant, &id).await.map_err(|e| reject(e.into()))?;
    let mut contact = existing.unwrap_or_else(|| {
        let mut contact = Contact::new(id.0.clone(), tenant.clone(), body.score);
        contact.created_at = now;
        contact
    });
    contact.score = body.score;
    if let Some(stage) = body.stage {
        contact.stage = stage;
    }
    contact.tags = body.tags;
    contact.attributes.extend(body.attributes);
    contact.opted_out_channels = body.opted_out_channels;
    contact.updated_at = now;

    state.repos.contacts.save(contact.clone()).await.map_err(|e| reject(e.into()))?;
    info!(
        event_name = "api.contact.upserted",
        tenant_id = %tenant.0,
        contact_id = %id.0,
        "contact stored"
    );
    Ok(Json(contact))
}

pub async fn contact_activity(
    State(state): State<AppState>,
    Path((tenant, contact_id)): Path<(String, String)>,
) -> ApiResult<Vec<ActivityEntry>> {
    state
        .repos
        .contacts
        .list_activity(&TenantId(tenant), &ContactId(contact_id))
        .await
        .map(Json)
        .map_err(|error| reject(error.into()))
}

pub async fn contact_event(
    State(state): State<AppState>,
    Path((tenant, contact_id)): Path<(String, String)>,
    Json(event): Json<ContactEvent>,
) -> ApiResult<EnrollOutcome> {
    state
        .runner
        .enroll(&TenantId(tenant), &ContactId(contact_id), event.trigger)
        .await
        .map(Json)
        .map_err(reject)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

fn reject(error: ApplicationError) -> Rejection {
    let interface = error.into_interface(format!("req-{}", Uuid::new_v4()));
    let status = match &interface {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
        InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!(
            event_name = "api.request.failed",
            correlation_id = interface.correlation_id(),
            code = interface.code(),
            detail = interface.message(),
            "request failed"
        );
    }

    (
        status,
        Json(ApiError {
            error: interface.user_message().to_string(),
            code: interface.code(),
            detail: interface.message().to_string(),
            correlation_id: interface.correlation_id().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        extract::{Path, Query, State},
        http::{Request, StatusCode},
        Json,
    };
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use tower::ServiceExt;

    use loadout_core::builder::{BuildRequest, LoadoutUpdate};
    use loadout_core::clock::ManualClock;
    use loadout_core::config::NotificationsConfig;
    use loadout_core::domain::agent::Channel;
    use loadout_core::domain::loadout::LoadoutStatus;
    use loadout_core::execution_engine::CursorEngine;
    use loadout_db::ResumeMode;

    use super::*;
    use crate::notify::WebhookNotifier;
    use crate::providers::{ProviderRegistry, RecordingProvider};
    use crate::runner::EnrollStatus;

    const TENANT: &str = "tenant-a";

    fn state() -> AppState {
        let start = Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).single().expect("valid");
        let clock = ManualClock::new(start);
        let repos = Repositories::in_memory();
        let mut registry = ProviderRegistry::new();
        for channel in [Channel::Email, Channel::Internal] {
            registry.register(Arc::new(RecordingProvider::new(channel)), 2);
        }
        let notifier = WebhookNotifier::from_config(&NotificationsConfig {
            enabled: false,
            signing_secret: None,
            timeout_secs: 1,
        })
        .expect("notifier");
        let runner = ChainRunner::new(
            repos.clone(),
            Arc::new(registry),
            Arc::new(notifier),
            Arc::new(clock),
            CursorEngine::new(),
        );
        AppState::new(repos, Arc::new(runner))
    }

    fn tenant_path() -> Path<String> {
        Path(TENANT.to_string())
    }

    fn loadout_path(id: &LoadoutId) -> Path<(String, String)> {
        Path((TENANT.to_string(), id.0.clone()))
    }

    async fn created(state: &AppState, preset: &str) -> LoadoutConfig {
        let (status, Json(loadout)) = create_loadout(
            State(state.clone()),
            tenant_path(),
            Json(BuildRequest::from_preset(format!("{preset} loadout"), preset)),
        )
        .await
        .expect("create");
        assert_eq!(status, StatusCode::CREATED);
        loadout
    }

    #[tokio::test]
    async fn presets_are_searchable_and_unknown_ids_are_404() {
        let Json(all) = list_presets(Query(PresetQuery::default())).await;
        assert_eq!(all.len(), catalog::presets().len());

        let Json(filtered) = list_presets(Query(PresetQuery {
            q: None,
            industry: Some(all[0].industry.to_string()),
        }))
        .await;
        assert!(!filtered.is_empty());
        assert!(filtered.iter().all(|preset| preset.industry == all[0].industry));

        let Json(saas) = get_preset(Path("saas".to_string())).await.expect("saas preset");
        assert_eq!(saas.id, "saas");

        let (status, Json(body)) =
            get_preset(Path("zeppelins".to_string())).await.expect_err("unknown preset");
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "not_found");
        assert!(body.correlation_id.starts_with("req-"));

        let Json(templates) = list_templates().await;
        assert_eq!(templates.len(), catalog::agent_templates().len());
    }

    #[tokio::test]
    async fn loadout_lifecycle_through_handlers() {
        let state = state();
        let saas = created(&state, "saas").await;
        assert_eq!(saas.status, LoadoutStatus::Draft);

        let Json(listed) = list_loadouts(State(state.clone()), tenant_path()).await.expect("list");
        assert_eq!(listed.len(), 1);

        let Json(updated) = update_loadout(
            State(state.clone()),
            loadout_path(&saas.id),
            Json(UpdateLoadoutRequest {
                expected_version: saas.version,
                update: LoadoutUpdate {
                    name: Some("renamed".to_string()),
                    ..LoadoutUpdate::default()
                },
            }),
        )
        .await
        .expect("update");
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.version, saas.version + 1);

        let (status, _) = update_loadout(
            State(state.clone()),
            loadout_path(&saas.id),
            Json(UpdateLoadoutRequest {
                expected_version: saas.version,
                update: LoadoutUpdate::default(),
            }),
        )
        .await
        .expect_err("stale version");
        assert_eq!(status, StatusCode::CONFLICT);

        let Json(report) = activate_loadout(
            State(state.clone()),
            loadout_path(&saas.id),
            Json(ActivationRequest::default()),
        )
        .await
        .expect("activate");
        assert_eq!(report.mode, ResumeMode::Restart);
        assert!(report.loadout.is_active());

        let Json(activation) =
            current_activation(State(state.clone()), tenant_path()).await.expect("activation");
        assert_eq!(activation.active_loadout_id, Some(saas.id.clone()));

        let Json(stopped) = deactivate_loadout(
            State(state.clone()),
            loadout_path(&saas.id),
            Json(DeactivationRequest::default()),
        )
        .await
        .expect("deactivate");
        assert_eq!(stopped.stopped.id, saas.id);
        assert_eq!(stopped.activation.active_loadout_id, None);

        let Json(archived) = archive_loadout(
            State(state.clone()),
            loadout_path(&saas.id),
            Query(VersionQuery { expected_version: updated.version }),
        )
        .await
        .expect("archive");
        assert_eq!(archived.loadout.status, LoadoutStatus::Archived);
    }

    #[tokio::test]
    async fn activating_a_second_loadout_replaces_the_first() {
        let state = state();
        let first = created(&state, "saas").await;
        let second = created(&state, "agency").await;

        for loadout in [&first, &second] {
            activate_loadout(
                State(state.clone()),
                loadout_path(&loadout.id),
                Json(ActivationRequest::default()),
            )
            .await
            .expect("activate");
        }

        let Json(listed) = list_loadouts(State(state.clone()), tenant_path()).await.expect("list");
        let active: Vec<_> = listed.iter().filter(|loadout| loadout.is_active()).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
    }

    #[tokio::test]
    async fn contact_events_enroll_into_the_active_loadout() {
        let state = state();
        let contact_path = || Path((TENANT.to_string(), "C-1".to_string()));

        let Json(contact) = upsert_contact(
            State(state.clone()),
            contact_path(),
            Json(ContactUpsert {
                score: Decimal::from(65),
                stage: None,
                tags: BTreeSet::from(["trial".to_string()]),
                attributes: BTreeMap::new(),
                opted_out_channels: BTreeSet::new(),
            }),
        )
        .await
        .expect("upsert");
        assert_eq!(contact.score, Decimal::from(65));

        let (status, Json(body)) = contact_event(
            State(state.clone()),
            contact_path(),
            Json(ContactEvent { trigger: EnrollTrigger::Created }),
        )
        .await
        .expect_err("no active loadout yet");
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.code, "conflict");

        let saas = created(&state, "saas").await;
        activate_loadout(
            State(state.clone()),
            loadout_path(&saas.id),
            Json(ActivationRequest::default()),
        )
        .await
        .expect("activate");

        let Json(outcome) = contact_event(
            State(state.clone()),
            contact_path(),
            Json(ContactEvent { trigger: EnrollTrigger::Created }),
        )
        .await
        .expect("enroll");
        assert_eq!(outcome.status, EnrollStatus::Enrolled);

        let Json(cursors) =
            list_cursors(State(state.clone()), loadout_path(&saas.id)).await.expect("cursors");
        assert_eq!(cursors.len(), 1);

        let Json(activity) =
            contact_activity(State(state.clone()), contact_path()).await.expect("activity");
        assert_eq!(activity.len(), 1);

        let (status, _) = retry_cursor(
            State(state.clone()),
            Path((TENANT.to_string(), saas.id.0.clone(), "C-1".to_string())),
        )
        .await
        .expect_err("cursor is not parked");
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn router_serves_catalog_and_rejects_invalid_loadouts() {
        let app = router(state());

        let response = app
            .clone()
            .oneshot(Request::get("/api/v1/presets/saas").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let invalid = serde_json::json!({ "name": "empty", "agents": [] });
        let response = app
            .oneshot(
                Request::post(format!("/api/v1/tenants/{TENANT}/loadouts"))
                    .header("content-type", "application/json")
                    .body(Body::from(invalid.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
