use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use leadflow_agent::AgentSystem;
use leadflow_core::domain::message::AgentRole;
use leadflow_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    system: Arc<AgentSystem>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub agents: HealthCheck,
    pub database: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, system: Arc<AgentSystem>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, system })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let agents = agents_check(&state.system);
    let database = database_check(&state.db_pool).await;
    let ready = agents.status == "ready" && database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        agents,
        database,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

fn agents_check(system: &AgentSystem) -> HealthCheck {
    let stats = system.system_stats();
    if stats.active_agents.iter().any(|agent| agent == AgentRole::Coordinator.as_str()) {
        HealthCheck {
            status: "ready",
            detail: format!(
                "{} agents registered, {} executions in flight",
                stats.agent_count, stats.active_executions
            ),
        }
    } else {
        HealthCheck { status: "degraded", detail: "coordinator is not registered".to_string() }
    }
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
