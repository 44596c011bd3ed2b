use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use leadflow_core::domain::context::LeadStage;
use leadflow_core::domain::execution::stages;
use leadflow_core::domain::message::{AgentMessage, AgentRole, TaskKind};

use super::{advance, expect_task, handle_notification, run_stage, Agent};
use crate::errors::AgentError;
use crate::runtime::AgentRuntime;

/// Drafts the fee proposal and hands it to the communicator.
pub struct Commercial;

#[async_trait]
impl Agent for Commercial {
    fn role(&self) -> AgentRole {
        AgentRole::Commercial
    }

    async fn handle_message(
        &self,
        runtime: &AgentRuntime,
        message: &AgentMessage,
    ) -> Result<(), AgentError> {
        let Some(task) = expect_task(runtime, message, TaskKind::CreateProposal)? else {
            return handle_notification(runtime, message).await;
        };
        let Some(run) = runtime.live_run(message).await? else {
            return Ok(());
        };
        let Some(reply) = run_stage(runtime, &run, stages::PROPOSAL, &task.data).await else {
            return Ok(());
        };

        let proposal = reply.value;
        runtime.record_success(&run, stages::PROPOSAL, proposal.clone(), reply.tokens).await;
        advance(runtime, &run, LeadStage::ProposalCreated);
        let fee = proposal.get("honorarios").map(ToString::to_string).unwrap_or_default();
        info!(
            event_name = "commercial.proposal_created",
            correlation_id = %run.execution_id(),
            fee = %fee,
            "proposal drafted"
        );

        runtime
            .forward(
                &run,
                AgentRole::Communicator,
                TaskKind::SendMessage,
                json!({ "kind": "proposal", "proposal": proposal }),
            )
            .await
    }
}
