use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::context::{DecisionRecord, LeadStage};
use crate::domain::execution::ExecutionId;

/// Mailbox address of an agent registered with a router.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<AgentRole> for AgentId {
    fn from(role: AgentRole) -> Self {
        role.id()
    }
}

/// The closed set of agents that make up the lead pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coordinator,
    Qualifier,
    Legal,
    Commercial,
    Communicator,
    Analyst,
    CustomerSuccess,
}

impl AgentRole {
    pub const ALL: [AgentRole; 7] = [
        Self::Coordinator,
        Self::Qualifier,
        Self::Legal,
        Self::Commercial,
        Self::Communicator,
        Self::Analyst,
        Self::CustomerSuccess,
    ];

    /// Agents the coordinator is allowed to hand a lead to.
    pub const ROUTABLE: [AgentRole; 6] = [
        Self::Qualifier,
        Self::Legal,
        Self::Commercial,
        Self::Communicator,
        Self::Analyst,
        Self::CustomerSuccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "Coordinator",
            Self::Qualifier => "Qualifier",
            Self::Legal => "Legal",
            Self::Commercial => "Commercial",
            Self::Communicator => "Communicator",
            Self::Analyst => "Analyst",
            Self::CustomerSuccess => "CustomerSuccess",
        }
    }

    /// Lenient parse used on model output: case, separators and an `Agent`
    /// suffix are ignored (`customer_success`, `CustomerSuccessAgent`).
    pub fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .trim()
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        let normalized = normalized.strip_suffix("agent").unwrap_or(&normalized);

        match normalized {
            "coordinator" => Some(Self::Coordinator),
            "qualifier" | "qualification" => Some(Self::Qualifier),
            "legal" => Some(Self::Legal),
            "commercial" => Some(Self::Commercial),
            "communicator" | "communication" => Some(Self::Communicator),
            "analyst" | "analytics" => Some(Self::Analyst),
            "customersuccess" => Some(Self::CustomerSuccess),
            _ => None,
        }
    }

    pub fn id(&self) -> AgentId {
        AgentId(self.as_str().to_string())
    }

    /// Task an agent performs when it is the routing target of the coordinator.
    pub fn default_task(&self) -> TaskKind {
        match self {
            Self::Coordinator => TaskKind::ProcessLead,
            Self::Qualifier => TaskKind::Qualify,
            Self::Legal => TaskKind::ValidateLegal,
            Self::Commercial => TaskKind::CreateProposal,
            Self::Communicator => TaskKind::SendMessage,
            Self::Analyst => TaskKind::Analyze,
            Self::CustomerSuccess => TaskKind::Onboard,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    DataShare,
    DecisionRequest,
    DecisionResponse,
    StatusUpdate,
    ErrorReport,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskRequest => "task_request",
            Self::TaskResponse => "task_response",
            Self::DataShare => "data_share",
            Self::DecisionRequest => "decision_request",
            Self::DecisionResponse => "decision_response",
            Self::StatusUpdate => "status_update",
            Self::ErrorReport => "error_report",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ProcessLead,
    Qualify,
    ValidateLegal,
    CreateProposal,
    SendMessage,
    Analyze,
    Onboard,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessLead => "process_lead",
            Self::Qualify => "qualify",
            Self::ValidateLegal => "validate_legal",
            Self::CreateProposal => "create_proposal",
            Self::SendMessage => "send_message",
            Self::Analyze => "analyze",
            Self::Onboard => "onboard",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: TaskKind,
    pub instructions: Option<String>,
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task: TaskKind,
    pub success: bool,
    pub result: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataShare {
    pub key: String,
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub question: String,
    pub options: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub decision: DecisionRecord,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub stage: LeadStage,
    pub note: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub original_message_id: MessageId,
    pub error: String,
}

/// Message body; the variant is the message type, so every type carries a
/// body of a fixed shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum MessagePayload {
    TaskRequest(TaskRequest),
    TaskResponse(TaskResponse),
    DataShare(DataShare),
    DecisionRequest(DecisionRequest),
    DecisionResponse(DecisionResponse),
    StatusUpdate(StatusUpdate),
    ErrorReport(ErrorReport),
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::TaskRequest(_) => MessageType::TaskRequest,
            Self::TaskResponse(_) => MessageType::TaskResponse,
            Self::DataShare(_) => MessageType::DataShare,
            Self::DecisionRequest(_) => MessageType::DecisionRequest,
            Self::DecisionResponse(_) => MessageType::DecisionResponse,
            Self::StatusUpdate(_) => MessageType::StatusUpdate,
            Self::ErrorReport(_) => MessageType::ErrorReport,
        }
    }

    pub fn task(task: TaskKind, data: Value) -> Self {
        Self::TaskRequest(TaskRequest { task, instructions: None, data })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: MessageId,
    pub execution_id: ExecutionId,
    pub from: AgentId,
    pub to: AgentId,
    pub payload: MessagePayload,
    pub timestamp: DateTime<Utc>,
    pub priority: MessagePriority,
    pub requires_response: bool,
}

impl AgentMessage {
    /// Requests (tasks and decisions) expect a response by default.
    pub fn new(
        execution_id: ExecutionId,
        from: AgentId,
        to: AgentId,
        payload: MessagePayload,
        priority: MessagePriority,
    ) -> Self {
        let requires_response = matches!(
            payload,
            MessagePayload::TaskRequest(_) | MessagePayload::DecisionRequest(_)
        );
        Self {
            id: MessageId::generate(),
            execution_id,
            from,
            to,
            payload,
            timestamp: Utc::now(),
            priority,
            requires_response,
        }
    }

    pub fn with_requires_response(mut self, requires_response: bool) -> Self {
        self.requires_response = requires_response;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Builds the `ErrorReport` sent back to the originator of this message.
    pub fn error_report(&self, reporter: AgentId, error: impl Into<String>) -> AgentMessage {
        AgentMessage::new(
            self.execution_id.clone(),
            reporter,
            self.from.clone(),
            MessagePayload::ErrorReport(ErrorReport {
                original_message_id: self.id.clone(),
                error: error.into(),
            }),
            MessagePriority::High,
        )
        .with_requires_response(false)
    }
}
