use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use leadflow_core::domain::context::{ConversationEntry, LeadStage};
use leadflow_core::domain::execution::stages;
use leadflow_core::domain::message::{AgentMessage, AgentRole, TaskKind};

use super::{advance, call_model, expect_task, handle_notification, Agent};
use crate::errors::AgentError;
use crate::json::safe_parse_json;
use crate::runtime::AgentRuntime;

const PROPOSAL: &str = "proposal";

/// Writes the message the lead receives and closes the run.
///
/// A reply without a `mensagem` field is sent as plain text, since a model
/// that ignores the JSON format usually still writes a usable message.
pub struct Communicator;

#[async_trait]
impl Agent for Communicator {
    fn role(&self) -> AgentRole {
        AgentRole::Communicator
    }

    async fn handle_message(
        &self,
        runtime: &AgentRuntime,
        message: &AgentMessage,
    ) -> Result<(), AgentError> {
        let Some(task) = expect_task(runtime, message, TaskKind::SendMessage)? else {
            return handle_notification(runtime, message).await;
        };
        let Some(run) = runtime.live_run(message).await? else {
            return Ok(());
        };
        let Some(reply) = call_model(runtime, &run, stages::MESSAGE_SENT, &task.data).await else {
            return Ok(());
        };

        let text = safe_parse_json(&reply.text)
            .ok()
            .and_then(|value| value.get("mensagem").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| reply.text.trim().to_string());
        let kind = task.data.get("kind").and_then(Value::as_str).unwrap_or(PROPOSAL);
        let channel = run.context.update(|context| {
            context.append_conversation(ConversationEntry::from_agent(
                runtime.agent().clone(),
                text.clone(),
            ));
            context.metadata.channel.clone()
        });

        runtime
            .record_success(
                &run,
                stages::MESSAGE_SENT,
                json!({ "mensagem": text, "canal": channel, "tipo": kind }),
                reply.usage.total_tokens,
            )
            .await;
        if kind == PROPOSAL {
            advance(runtime, &run, LeadStage::ProposalSent);
        }
        info!(
            event_name = "communicator.message_sent",
            correlation_id = %run.execution_id(),
            channel = %channel,
            kind,
            "message drafted for the lead"
        );

        runtime.complete_run(&run).await;
        Ok(())
    }
}
