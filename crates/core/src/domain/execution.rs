use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::lead::LeadId;
use crate::domain::message::AgentId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Well-known stage names written by the pipeline agents.
pub mod stages {
    pub const QUALIFICATION: &str = "qualification";
    pub const LEGAL_VALIDATION: &str = "legal_validation";
    pub const PROPOSAL: &str = "proposal";
    pub const MESSAGE_SENT: &str = "message_sent";
    pub const ANALYSIS: &str = "analysis";
    pub const ONBOARDING: &str = "onboarding";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    /// `pending -> processing -> {completed | failed | timeout}`. A run can
    /// also fail or time out before it starts processing; terminal states
    /// never change again.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Timeout)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Timeout)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an agent reports when it finishes a unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage_name: String,
    pub agent_name: AgentId,
    pub result: Value,
    pub tokens: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl StageOutcome {
    pub fn success(
        stage_name: impl Into<String>,
        agent_name: AgentId,
        result: Value,
        tokens: u64,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            agent_name,
            result,
            tokens,
            success: true,
            error: None,
        }
    }

    pub fn failure(
        stage_name: impl Into<String>,
        agent_name: AgentId,
        error: impl Into<String>,
        tokens: u64,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            agent_name,
            result: Value::Null,
            tokens,
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    pub agent_name: AgentId,
    pub result: Value,
    pub tokens: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

impl StageResult {
    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds().max(0)
    }
}

/// Persisted state of one lead-processing run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub lead_id: LeadId,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    pub stages: Vec<StageResult>,
    pub total_tokens: u64,
    pub estimated_cost: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn stage(&self, stage_name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|stage| stage.stage_name == stage_name)
    }

    fn successful_stage_result(&self, stage_name: &str) -> Option<Value> {
        self.stage(stage_name).filter(|stage| stage.success).map(|stage| stage.result.clone())
    }
}

/// Caller-facing view of a run, with the well-known stages lifted into
/// typed fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub lead_id: LeadId,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    pub stages: Vec<StageResult>,
    pub total_tokens: u64,
    pub estimated_cost: Decimal,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub qualification_result: Option<Value>,
    pub legal_validation: Option<Value>,
    pub proposal: Option<Value>,
    pub message_sent: Option<Value>,
}

impl From<&ExecutionRecord> for ExecutionResult {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.execution_id.clone(),
            lead_id: record.lead_id.clone(),
            tenant_id: record.tenant_id.clone(),
            status: record.status,
            stages: record.stages.clone(),
            total_tokens: record.total_tokens,
            estimated_cost: record.estimated_cost,
            started_at: record.created_at,
            completed_at: record.completed_at,
            duration_ms: record
                .completed_at
                .map(|completed_at| (completed_at - record.created_at).num_milliseconds()),
            error: record.error.clone(),
            qualification_result: record.successful_stage_result(stages::QUALIFICATION),
            legal_validation: record.successful_stage_result(stages::LEGAL_VALIDATION),
            proposal: record.successful_stage_result(stages::PROPOSAL),
            message_sent: record.successful_stage_result(stages::MESSAGE_SENT),
        }
    }
}
