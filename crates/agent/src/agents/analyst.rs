use async_trait::async_trait;

use leadflow_core::domain::execution::stages;
use leadflow_core::domain::message::{AgentMessage, AgentRole, TaskKind};

use super::{expect_task, handle_notification, run_stage, Agent};
use crate::errors::AgentError;
use crate::runtime::AgentRuntime;

/// Summarizes the lead for the sales team. Single stage; ends the run.
pub struct Analyst;

#[async_trait]
impl Agent for Analyst {
    fn role(&self) -> AgentRole {
        AgentRole::Analyst
    }

    async fn handle_message(
        &self,
        runtime: &AgentRuntime,
        message: &AgentMessage,
    ) -> Result<(), AgentError> {
        let Some(task) = expect_task(runtime, message, TaskKind::Analyze)? else {
            return handle_notification(runtime, message).await;
        };
        let Some(run) = runtime.live_run(message).await? else {
            return Ok(());
        };
        let Some(reply) = run_stage(runtime, &run, stages::ANALYSIS, &task.data).await else {
            return Ok(());
        };

        runtime.record_success(&run, stages::ANALYSIS, reply.value, reply.tokens).await;
        runtime.complete_run(&run).await;
        Ok(())
    }
}
