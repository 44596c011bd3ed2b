use async_trait::async_trait;

use leadflow_core::domain::context::LeadStage;
use leadflow_core::domain::execution::stages;
use leadflow_core::domain::message::{AgentMessage, AgentRole, TaskKind};

use super::{advance, expect_task, handle_notification, run_stage, Agent};
use crate::errors::AgentError;
use crate::runtime::AgentRuntime;

/// Onboards a lead that already signed; the lead is closed as won.
pub struct CustomerSuccess;

#[async_trait]
impl Agent for CustomerSuccess {
    fn role(&self) -> AgentRole {
        AgentRole::CustomerSuccess
    }

    async fn handle_message(
        &self,
        runtime: &AgentRuntime,
        message: &AgentMessage,
    ) -> Result<(), AgentError> {
        let Some(task) = expect_task(runtime, message, TaskKind::Onboard)? else {
            return handle_notification(runtime, message).await;
        };
        let Some(run) = runtime.live_run(message).await? else {
            return Ok(());
        };
        let Some(reply) = run_stage(runtime, &run, stages::ONBOARDING, &task.data).await else {
            return Ok(());
        };

        runtime.record_success(&run, stages::ONBOARDING, reply.value, reply.tokens).await;
        advance(runtime, &run, LeadStage::ClosedWon);
        runtime.complete_run(&run).await;
        Ok(())
    }
}
