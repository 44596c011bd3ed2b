use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use leadflow_core::domain::context::{DecisionRecord, LeadStage};
use leadflow_core::domain::message::{
    AgentMessage, AgentRole, DecisionRequest, DecisionResponse, MessagePayload, MessagePriority,
    MessageType, TaskKind,
};

use super::{advance, expect_task, handle_notification, Agent};
use crate::errors::AgentError;
use crate::registry::ActiveRun;
use crate::runtime::AgentRuntime;

const DEFAULT_ROUTE: AgentRole = AgentRole::Qualifier;
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Where the coordinator sends a lead, and why.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingDecision {
    pub next_agent: AgentRole,
    pub reasoning: String,
    pub confidence: f64,
    /// The model gave no usable answer and the default route was taken.
    pub fallback: bool,
}

impl RoutingDecision {
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self { next_agent: DEFAULT_ROUTE, reasoning: reason.into(), confidence: 0.0, fallback: true }
    }

    /// Reads `{"next_agent", "reasoning", "confidence"}`. Routing is total:
    /// anything that does not name a registered agent other than the
    /// coordinator itself becomes the default route.
    pub fn from_model_output(value: &Value, is_registered: impl Fn(AgentRole) -> bool) -> Self {
        let Some(name) = value.get("next_agent").and_then(Value::as_str) else {
            return Self::fallback("model output did not name a next agent");
        };
        let role = match AgentRole::parse(name) {
            Some(AgentRole::Coordinator) | None => {
                return Self::fallback(format!("`{name}` is not a routable agent"));
            }
            Some(role) => role,
        };
        if !is_registered(role) {
            return Self::fallback(format!("agent {role} is not registered"));
        }

        let confidence = value
            .get("confidence")
            .and_then(Value::as_f64)
            .filter(|confidence| confidence.is_finite())
            .map_or(DEFAULT_CONFIDENCE, |confidence| confidence.clamp(0.0, 1.0));
        let reasoning =
            value.get("reasoning").and_then(Value::as_str).unwrap_or_default().to_string();

        Self { next_agent: role, reasoning, confidence, fallback: false }
    }
}

pub struct Coordinator;

#[async_trait]
impl Agent for Coordinator {
    fn role(&self) -> AgentRole {
        AgentRole::Coordinator
    }

    async fn handle_message(
        &self,
        runtime: &AgentRuntime,
        message: &AgentMessage,
    ) -> Result<(), AgentError> {
        if let MessagePayload::DecisionRequest(request) = &message.payload {
            return answer_decision(runtime, message, request).await;
        }
        let Some(task) = expect_task(runtime, message, TaskKind::ProcessLead)? else {
            return handle_notification(runtime, message).await;
        };
        let Some(run) = runtime.live_run(message).await? else {
            return Ok(());
        };

        let decision = decide(runtime, &run, &task.data).await;
        if decision.fallback {
            runtime.metrics().record_routing_default();
            warn!(
                event_name = "coordinator.routing_default",
                correlation_id = %run.execution_id(),
                reason = %decision.reasoning,
                next_agent = decision.next_agent.as_str(),
                "routing fell back to the default agent"
            );
        }
        info!(
            event_name = "coordinator.routed",
            correlation_id = %run.execution_id(),
            next_agent = decision.next_agent.as_str(),
            confidence = decision.confidence,
            "lead routed"
        );

        let record = DecisionRecord {
            decision_maker: runtime.agent().clone(),
            decision: format!("route_to_{}", decision.next_agent.as_str()),
            reasoning: decision.reasoning.clone(),
            confidence: decision.confidence,
            timestamp: Utc::now(),
        };
        run.context.update(|context| context.record_decision(runtime.agent(), record));
        advance(runtime, &run, LeadStage::Analyzing);

        let target = decision.next_agent;
        runtime
            .forward(&run, target, target.default_task(), json!({ "routing": decision.reasoning }))
            .await
    }
}

async fn decide(runtime: &AgentRuntime, run: &ActiveRun, data: &Value) -> RoutingDecision {
    let context = run.context.snapshot();
    let reply = match runtime.services().templates.task_prompt(runtime.role(), &context, data) {
        Ok(prompt) => {
            runtime.process_with_ai_retry(&prompt, &context, data, runtime.max_retries()).await
        }
        Err(error) => Err(error),
    };

    match reply {
        Ok(reply) => {
            let value = runtime.parse_object(&reply, run);
            RoutingDecision::from_model_output(&value, |role| runtime.is_registered(role))
        }
        Err(error) => RoutingDecision::fallback(format!("routing call failed: {error}")),
    }
}

/// Picks one of the offered options. A reply naming none of them falls back
/// to the first option; a request without options is refused.
async fn answer_decision(
    runtime: &AgentRuntime,
    message: &AgentMessage,
    request: &DecisionRequest,
) -> Result<(), AgentError> {
    let Some(first_option) = request.options.first() else {
        return Err(AgentError::MalformedMessage {
            message_type: MessageType::DecisionRequest,
            reason: "no options to choose from".to_string(),
        });
    };
    let run = runtime.run(message)?;
    let context = run.context.snapshot();
    let data = json!({ "question": request.question, "options": request.options });

    let prompt = runtime.services().templates.task_prompt(runtime.role(), &context, &data)?;
    let reply = runtime.process_with_ai_retry(&prompt, &context, &data, runtime.max_retries()).await?;
    let value = runtime.parse_object(&reply, &run);

    let chosen = ["decision", "next_agent"]
        .iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .find(|candidate| request.options.iter().any(|option| option == candidate))
        .map(str::to_string);
    let decision = match chosen {
        Some(decision) => decision,
        None => {
            runtime.metrics().record_routing_default();
            first_option.clone()
        }
    };

    let record = DecisionRecord {
        decision_maker: runtime.agent().clone(),
        decision,
        reasoning: value.get("reasoning").and_then(Value::as_str).unwrap_or_default().to_string(),
        confidence: value
            .get("confidence")
            .and_then(Value::as_f64)
            .map_or(DEFAULT_CONFIDENCE, |confidence| confidence.clamp(0.0, 1.0)),
        timestamp: Utc::now(),
    };
    let response = AgentMessage::new(
        message.execution_id.clone(),
        runtime.agent().clone(),
        message.from.clone(),
        MessagePayload::DecisionResponse(DecisionResponse { decision: record }),
        MessagePriority::High,
    );
    runtime.send(response)
}
