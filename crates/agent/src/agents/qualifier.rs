use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use leadflow_core::domain::context::{DecisionRecord, LeadStage};
use leadflow_core::domain::execution::stages;
use leadflow_core::domain::message::{AgentMessage, AgentRole, TaskKind};

use super::{advance, expect_task, handle_notification, run_stage, Agent};
use crate::errors::AgentError;
use crate::runtime::AgentRuntime;

/// Decides whether the lead describes a case the firm takes. Qualified leads
/// go to legal validation, the rest are closed and receive a decline.
pub struct Qualifier;

#[async_trait]
impl Agent for Qualifier {
    fn role(&self) -> AgentRole {
        AgentRole::Qualifier
    }

    async fn handle_message(
        &self,
        runtime: &AgentRuntime,
        message: &AgentMessage,
    ) -> Result<(), AgentError> {
        let Some(task) = expect_task(runtime, message, TaskKind::Qualify)? else {
            return handle_notification(runtime, message).await;
        };
        let Some(run) = runtime.live_run(message).await? else {
            return Ok(());
        };
        let Some(reply) = run_stage(runtime, &run, stages::QUALIFICATION, &task.data).await else {
            return Ok(());
        };

        let qualification = reply.value;
        let qualified = qualification.get("qualificado").and_then(Value::as_bool).unwrap_or(false);
        let reason = qualification.get("motivo").and_then(Value::as_str).unwrap_or_default();
        runtime
            .record_success(&run, stages::QUALIFICATION, qualification.clone(), reply.tokens)
            .await;

        let record = DecisionRecord {
            decision_maker: runtime.agent().clone(),
            decision: if qualified { "qualified" } else { "not_qualified" }.to_string(),
            reasoning: reason.to_string(),
            confidence: qualification.get("confianca").and_then(Value::as_f64).unwrap_or(1.0),
            timestamp: Utc::now(),
        };
        run.context.update(|context| context.record_decision(runtime.agent(), record));
        let area = qualification.get("area_juridica").and_then(Value::as_str).unwrap_or_default();
        info!(
            event_name = "qualifier.decided",
            correlation_id = %run.execution_id(),
            qualified,
            area,
            "qualification finished"
        );

        if qualified {
            advance(runtime, &run, LeadStage::Qualified);
            runtime
                .forward(
                    &run,
                    AgentRole::Legal,
                    TaskKind::ValidateLegal,
                    json!({ "qualification": qualification }),
                )
                .await
        } else {
            advance(runtime, &run, LeadStage::ClosedLost);
            runtime
                .forward(
                    &run,
                    AgentRole::Communicator,
                    TaskKind::SendMessage,
                    json!({ "kind": "decline", "reason": reason, "qualification": qualification }),
                )
                .await
        }
    }
}
