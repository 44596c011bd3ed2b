use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use leadflow_agent::{AgentSystem, ProcessOptions, SystemStats};
use leadflow_core::domain::execution::{ExecutionId, ExecutionResult};
use leadflow_core::domain::lead::{LeadData, LeadId};
use leadflow_core::errors::{ApplicationError, DomainError, InterfaceError};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct LeadsState {
    pub system: Arc<AgentSystem>,
    pub default_timeout: Duration,
}

/// Body of `POST /leads`. Only `message` is required; a lead without an id
/// gets a fresh one.
#[derive(Debug, Deserialize)]
pub struct SubmitLead {
    #[serde(default)]
    pub lead: Option<LeadData>,
    pub message: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default = "default_wait")]
    pub wait_for_completion: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_channel() -> String {
    "web".to_string()
}

fn default_wait() -> bool {
    true
}

#[derive(Debug)]
pub enum ApiError {
    Interface(InterfaceError),
    NotFound { message: String, correlation_id: String },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message, correlation_id) = match self {
            Self::Interface(error) => {
                let message = error.user_message();
                match error {
                    InterfaceError::BadRequest { correlation_id, .. } => {
                        (StatusCode::BAD_REQUEST, "bad_request", message, correlation_id)
                    }
                    InterfaceError::ServiceUnavailable { correlation_id, .. } => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "service_unavailable",
                        message,
                        correlation_id,
                    ),
                    InterfaceError::Internal { correlation_id, .. } => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal", message, correlation_id)
                    }
                }
            }
            Self::NotFound { message, correlation_id } => {
                let body = json!({
                    "error": "not_found",
                    "message": message,
                    "correlation_id": correlation_id,
                });
                return (StatusCode::NOT_FOUND, Json(body)).into_response();
            }
        };

        let body = json!({ "error": kind, "message": message, "correlation_id": correlation_id });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: LeadsState) -> Router {
    Router::new()
        .route("/leads", post(submit_lead))
        .route("/executions/{id}", get(execution))
        .route("/system/stats", get(stats))
        .with_state(state)
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| ExecutionId::generate().0)
}

pub async fn submit_lead(
    State(state): State<LeadsState>,
    headers: HeaderMap,
    Json(request): Json<SubmitLead>,
) -> Result<(StatusCode, Json<ExecutionResult>), ApiError> {
    let correlation_id = correlation_id(&headers);
    if request.message.trim().is_empty() {
        let error = ApplicationError::from(DomainError::InvariantViolation(
            "message must not be empty".to_string(),
        ));
        return Err(ApiError::Interface(error.into_interface(correlation_id)));
    }

    let lead = request.lead.unwrap_or_else(|| LeadData::new(LeadId::generate()));
    let mut options = ProcessOptions {
        wait_for_completion: request.wait_for_completion,
        timeout: request.timeout_ms.map(Duration::from_millis).unwrap_or(state.default_timeout),
        ..ProcessOptions::default()
    };
    if let Some(tenant_id) = request.tenant_id {
        options.tenant_id = tenant_id;
    }

    let result = state
        .system
        .process_lead(lead, &request.message, &request.channel, options)
        .await
        .map_err(|error| {
            warn!(
                event_name = "server.lead.rejected",
                correlation_id = %correlation_id,
                error = %error,
                "lead could not be processed"
            );
            ApiError::Interface(ApplicationError::from(error).into_interface(correlation_id.clone()))
        })?;

    info!(
        event_name = "server.lead.processed",
        correlation_id = %correlation_id,
        execution_id = %result.execution_id,
        lead_id = %result.lead_id,
        status = result.status.as_str(),
        "lead submitted through http"
    );

    let status =
        if request.wait_for_completion { StatusCode::OK } else { StatusCode::ACCEPTED };
    Ok((status, Json(result)))
}

pub async fn execution(
    State(state): State<LeadsState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let correlation_id = correlation_id(&headers);
    match state.system.execution(&ExecutionId(id.clone())).await {
        Ok(Some(result)) => Ok(Json(result)),
        Ok(None) => Err(ApiError::NotFound {
            message: format!("execution `{id}` was not found"),
            correlation_id,
        }),
        Err(error) => {
            Err(ApiError::Interface(ApplicationError::from(error).into_interface(correlation_id)))
        }
    }
}

pub async fn stats(State(state): State<LeadsState>) -> Json<SystemStats> {
    Json(state.system.system_stats())
}
