//! The pipeline agents.
//!
//! Coordinator routes a new lead; Qualifier, Legal, Commercial and
//! Communicator form the main chain; Analyst and CustomerSuccess are single
//! stage agents the coordinator may route to directly. Every handler reads
//! its run from the message's execution id and keeps no state of its own.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use leadflow_core::domain::context::LeadStage;
use leadflow_core::domain::message::{
    AgentId, AgentMessage, AgentRole, MessagePayload, TaskKind, TaskRequest,
};

use crate::errors::AgentError;
use crate::registry::ActiveRun;
use crate::runtime::{AgentRuntime, AiReply};

pub mod analyst;
pub mod commercial;
pub mod communicator;
pub mod coordinator;
pub mod customer_success;
pub mod legal;
pub mod qualifier;

pub use analyst::Analyst;
pub use commercial::Commercial;
pub use communicator::Communicator;
pub use coordinator::{Coordinator, RoutingDecision};
pub use customer_success::CustomerSuccess;
pub use legal::Legal;
pub use qualifier::Qualifier;

#[async_trait]
pub trait Agent: Send + Sync {
    fn role(&self) -> AgentRole;

    fn id(&self) -> AgentId {
        self.role().id()
    }

    async fn handle_message(
        &self,
        runtime: &AgentRuntime,
        message: &AgentMessage,
    ) -> Result<(), AgentError>;
}

pub fn default_agent(role: AgentRole) -> Arc<dyn Agent> {
    match role {
        AgentRole::Coordinator => Arc::new(Coordinator),
        AgentRole::Qualifier => Arc::new(Qualifier),
        AgentRole::Legal => Arc::new(Legal),
        AgentRole::Commercial => Arc::new(Commercial),
        AgentRole::Communicator => Arc::new(Communicator),
        AgentRole::Analyst => Arc::new(Analyst),
        AgentRole::CustomerSuccess => Arc::new(CustomerSuccess),
    }
}

pub fn default_agents() -> Vec<Arc<dyn Agent>> {
    AgentRole::ALL.into_iter().map(default_agent).collect()
}

/// Model output of one stage.
pub(crate) struct StageReply {
    pub value: Value,
    pub tokens: u64,
}

/// The task body when `message` asks for `task`.
///
/// `Ok(None)` means the message is not a task request at all; a task request
/// for some other task is an error, reported back to the sender.
pub(crate) fn expect_task<'a>(
    runtime: &AgentRuntime,
    message: &'a AgentMessage,
    task: TaskKind,
) -> Result<Option<&'a TaskRequest>, AgentError> {
    match &message.payload {
        MessagePayload::TaskRequest(body) if body.task == task => Ok(Some(body)),
        MessagePayload::TaskRequest(_) => Err(AgentError::UnsupportedMessage {
            agent: runtime.agent().clone(),
            message_type: message.message_type(),
        }),
        _ => Ok(None),
    }
}

/// Runs the agent's completion for `stage`. On failure the stage is recorded
/// as failed, the run is failed and `None` is returned.
pub(crate) async fn call_model(
    runtime: &AgentRuntime,
    run: &ActiveRun,
    stage: &str,
    data: &Value,
) -> Option<AiReply> {
    run.tracker.start_stage(stage).await;
    let context = run.context.snapshot();

    let prompt = match runtime.services().templates.task_prompt(runtime.role(), &context, data) {
        Ok(prompt) => prompt,
        Err(error) => {
            runtime.fail_stage(run, stage, &error, 0).await;
            return None;
        }
    };

    match runtime.process_with_ai_retry(&prompt, &context, data, runtime.max_retries()).await {
        Ok(reply) => Some(reply),
        Err(error) => {
            runtime.fail_stage(run, stage, &error, 0).await;
            None
        }
    }
}

/// `call_model` followed by structured-output extraction.
pub(crate) async fn run_stage(
    runtime: &AgentRuntime,
    run: &ActiveRun,
    stage: &str,
    data: &Value,
) -> Option<StageReply> {
    let reply = call_model(runtime, run, stage, data).await?;
    Some(StageReply { value: runtime.parse_object(&reply, run), tokens: reply.usage.total_tokens })
}

pub(crate) fn advance(runtime: &AgentRuntime, run: &ActiveRun, stage: LeadStage) {
    if let Err(error) = run.context.update(|context| context.advance_stage(stage)) {
        warn!(
            event_name = "agent.stage_transition_rejected",
            correlation_id = %run.execution_id(),
            agent = %runtime.agent(),
            error = %error,
            "lead stage left unchanged"
        );
    }
}

/// Messages no agent acts on beyond bookkeeping. An error report fails the
/// run it belongs to, since a downstream agent could not do its part.
pub(crate) async fn handle_notification(
    runtime: &AgentRuntime,
    message: &AgentMessage,
) -> Result<(), AgentError> {
    match &message.payload {
        MessagePayload::ErrorReport(report) => {
            warn!(
                event_name = "agent.error_report_received",
                correlation_id = %message.execution_id,
                agent = %runtime.agent(),
                from = %message.from,
                error = %report.error,
                "downstream agent reported a failure"
            );
            if let Some(run) = runtime.services().executions.get(&message.execution_id) {
                run.tracker
                    .mark_failed(format!("{} reported: {}", message.from, report.error))
                    .await;
            }
            Ok(())
        }
        MessagePayload::StatusUpdate(update) => {
            info!(
                event_name = "agent.status_update",
                correlation_id = %message.execution_id,
                agent = %runtime.agent(),
                from = %message.from,
                stage = update.stage.as_str(),
                note = %update.note,
                "status update"
            );
            Ok(())
        }
        MessagePayload::TaskResponse(_)
        | MessagePayload::DataShare(_)
        | MessagePayload::DecisionResponse(_) => {
            debug!(
                event_name = "agent.notification",
                correlation_id = %message.execution_id,
                agent = %runtime.agent(),
                from = %message.from,
                message_type = message.message_type().as_str(),
                "notification received"
            );
            Ok(())
        }
        MessagePayload::TaskRequest(_) | MessagePayload::DecisionRequest(_) => {
            Err(AgentError::UnsupportedMessage {
                agent: runtime.agent().clone(),
                message_type: message.message_type(),
            })
        }
    }
}
