use thiserror::Error;

use leadflow_core::domain::execution::ExecutionId;
use leadflow_core::domain::message::{AgentId, MessageType};
use leadflow_core::errors::ApplicationError;
use leadflow_core::store::StoreError;

use crate::llm::LlmError;
use crate::router::RoutingError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("execution {0} is not active")]
    UnknownExecution(ExecutionId),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("prompt template failed: {0}")]
    Template(String),
    #[error("agent {agent} does not handle {message_type:?} messages")]
    UnsupportedMessage { agent: AgentId, message_type: MessageType },
    #[error("malformed {message_type:?} message: {reason}")]
    MalformedMessage { message_type: MessageType, reason: String },
}

/// Failures of the orchestrator surface itself. Business failures of a run
/// are reported through its `ExecutionResult`, not here.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SystemError {
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("agent system has been shut down")]
    ShutDown,
}

impl From<SystemError> for ApplicationError {
    fn from(error: SystemError) -> Self {
        match error {
            SystemError::Routing(error) => Self::Configuration(error.to_string()),
            SystemError::Agent(AgentError::Llm(error)) => Self::Integration(error.to_string()),
            SystemError::Agent(error) => Self::Configuration(error.to_string()),
            SystemError::Store(error) => Self::Persistence(error.to_string()),
            SystemError::ShutDown => Self::Integration("agent system is shut down".to_string()),
        }
    }
}
