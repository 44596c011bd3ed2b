use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use leadflow_core::domain::context::LeadStage;
use leadflow_core::domain::execution::stages;
use leadflow_core::domain::message::{AgentMessage, AgentRole, TaskKind};

use super::{advance, expect_task, handle_notification, run_stage, Agent};
use crate::errors::AgentError;
use crate::runtime::AgentRuntime;

pub struct Legal;

#[async_trait]
impl Agent for Legal {
    fn role(&self) -> AgentRole {
        AgentRole::Legal
    }

    async fn handle_message(
        &self,
        runtime: &AgentRuntime,
        message: &AgentMessage,
    ) -> Result<(), AgentError> {
        let Some(task) = expect_task(runtime, message, TaskKind::ValidateLegal)? else {
            return handle_notification(runtime, message).await;
        };
        let Some(run) = runtime.live_run(message).await? else {
            return Ok(());
        };
        advance(runtime, &run, LeadStage::LegalValidation);
        let Some(reply) = run_stage(runtime, &run, stages::LEGAL_VALIDATION, &task.data).await
        else {
            return Ok(());
        };

        let validation = reply.value;
        let viable = validation.get("viavel").and_then(Value::as_bool).unwrap_or(false);
        runtime
            .record_success(&run, stages::LEGAL_VALIDATION, validation.clone(), reply.tokens)
            .await;
        info!(
            event_name = "legal.validated",
            correlation_id = %run.execution_id(),
            viable,
            "legal validation finished"
        );

        let qualification = task.data.get("qualification").cloned().unwrap_or(Value::Null);
        if viable {
            runtime
                .forward(
                    &run,
                    AgentRole::Commercial,
                    TaskKind::CreateProposal,
                    json!({ "qualification": qualification, "legal_validation": validation }),
                )
                .await
        } else {
            advance(runtime, &run, LeadStage::ClosedLost);
            let reason =
                validation.get("fundamentacao").and_then(Value::as_str).unwrap_or_default();
            runtime
                .forward(
                    &run,
                    AgentRole::Communicator,
                    TaskKind::SendMessage,
                    json!({ "kind": "decline", "reason": reason, "legal_validation": validation }),
                )
                .await
        }
    }
}
