use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use loadout_core::domain::agent::Channel;
use loadout_db::DbPool;
use serde::Serialize;

/// Static facts about the running engine, captured at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSummary {
    pub workers: usize,
    pub provider_channels: Vec<Channel>,
    pub dry_run: bool,
}

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    engine: EngineSummary,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub engine: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, engine: EngineSummary) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, engine })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let engine = engine_check(&state.engine);
    let ready = database.status == "ready" && engine.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        engine,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn engine_check(engine: &EngineSummary) -> HealthCheck {
    if engine.workers == 0 {
        return HealthCheck { status: "degraded", detail: "no engine workers running".to_string() };
    }
    if engine.provider_channels.is_empty() {
        return HealthCheck {
            status: "degraded",
            detail: "no action providers configured".to_string(),
        };
    }

    let channels =
        engine.provider_channels.iter().map(Channel::to_string).collect::<Vec<_>>().join(",");
    let mode = if engine.dry_run { "dry-run" } else { "live" };
    HealthCheck {
        status: "ready",
        detail: format!("{} workers, {mode} providers: {channels}", engine.workers),
    }
}
