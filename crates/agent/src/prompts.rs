use serde_json::Value;
use tera::{Context, Tera};

use leadflow_core::domain::context::SharedContext;
use leadflow_core::domain::message::AgentRole;

use crate::errors::AgentError;

const TASK_TEMPLATE: &str = "task.tera";

/// Instruction templates of the built-in agents plus the shared task prompt.
pub struct PromptTemplates {
    tera: Tera,
}

impl PromptTemplates {
    pub fn new() -> Result<Self, AgentError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (template_name(AgentRole::Coordinator), include_str!("../templates/coordinator.tera")),
            (template_name(AgentRole::Qualifier), include_str!("../templates/qualifier.tera")),
            (template_name(AgentRole::Legal), include_str!("../templates/legal.tera")),
            (template_name(AgentRole::Commercial), include_str!("../templates/commercial.tera")),
            (
                template_name(AgentRole::Communicator),
                include_str!("../templates/communicator.tera"),
            ),
            (template_name(AgentRole::Analyst), include_str!("../templates/analyst.tera")),
            (
                template_name(AgentRole::CustomerSuccess),
                include_str!("../templates/customer_success.tera"),
            ),
            (TASK_TEMPLATE, include_str!("../templates/task.tera")),
        ])
        .map_err(|error| AgentError::Template(error.to_string()))?;
        Ok(Self { tera })
    }

    /// The agent's instructions, used as the system prompt.
    pub fn system_prompt(
        &self,
        role: AgentRole,
        context: &SharedContext,
        data: &Value,
    ) -> Result<String, AgentError> {
        let mut values = base_context(role, context);
        let agents: Vec<&str> = AgentRole::ROUTABLE.iter().map(AgentRole::as_str).collect();
        values.insert("agents", &agents);
        values.insert("kind", data.get("kind").and_then(Value::as_str).unwrap_or("proposal"));
        self.render(template_name(role), &values)
    }

    /// Lead, conversation and upstream stage data, used as the user prompt.
    pub fn task_prompt(
        &self,
        role: AgentRole,
        context: &SharedContext,
        data: &Value,
    ) -> Result<String, AgentError> {
        let mut values = base_context(role, context);
        values.insert("message", context.latest_lead_message().unwrap_or(""));
        values.insert("history", &context.conversation_history);
        let data = match data {
            Value::Null => String::new(),
            Value::Object(map) if map.is_empty() => String::new(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        };
        values.insert("data", &data);
        self.render(TASK_TEMPLATE, &values)
    }

    fn render(&self, name: &str, values: &Context) -> Result<String, AgentError> {
        self.tera
            .render(name, values)
            .map(|rendered| rendered.trim().to_string())
            .map_err(|error| AgentError::Template(format!("{name}: {error}")))
    }
}

fn template_name(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Coordinator => "coordinator.tera",
        AgentRole::Qualifier => "qualifier.tera",
        AgentRole::Legal => "legal.tera",
        AgentRole::Commercial => "commercial.tera",
        AgentRole::Communicator => "communicator.tera",
        AgentRole::Analyst => "analyst.tera",
        AgentRole::CustomerSuccess => "customer_success.tera",
    }
}

fn base_context(role: AgentRole, context: &SharedContext) -> Context {
    let mut values = Context::new();
    values.insert("agent", role.as_str());
    values.insert("lead_name", context.lead.display_name());
    values.insert("lead_email", &context.lead.email);
    values.insert("channel", &context.metadata.channel);
    values.insert("stage", context.current_stage.as_str());
    values
}
