//! Helpers every agent handler goes through: run lookup, completion calls
//! with memory and knowledge augmentation, retry, structured-output parsing
//! and routing combined with run bookkeeping.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use leadflow_core::config::MemoryConfig;
use leadflow_core::domain::context::SharedContext;
use leadflow_core::domain::execution::{ExecutionResult, StageOutcome, StageResult};
use leadflow_core::domain::message::{
    AgentId, AgentMessage, AgentRole, MessagePayload, MessagePriority, TaskKind,
};
use leadflow_core::memory::{KnowledgeBase, MemoryEntry, MemoryQuery, MemoryStore};

use crate::errors::AgentError;
use crate::json::safe_parse_json;
use crate::llm::{CompletionSettings, LlmClient, TokenUsage};
use crate::metrics::FallbackMetrics;
use crate::prompts::PromptTemplates;
use crate::registry::{ActiveRun, ExecutionRegistry};
use crate::retry::RetryPolicy;
use crate::router::Router;

/// Fire-and-forget work spawned by agents, kept so callers can wait for it
/// before tearing the system down.
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Waits for everything spawned so far.
    pub async fn drain(&self) {
        let mut pending =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while pending.join_next().await.is_some() {}
    }
}

/// Collaborators shared by every agent of one system.
pub struct AgentServices {
    pub router: Arc<Router>,
    pub executions: Arc<ExecutionRegistry>,
    pub llm: Arc<dyn LlmClient>,
    pub memory: Arc<dyn MemoryStore>,
    pub knowledge: Arc<dyn KnowledgeBase>,
    pub metrics: Arc<FallbackMetrics>,
    pub templates: Arc<PromptTemplates>,
    pub completion: CompletionSettings,
    pub memory_settings: MemoryConfig,
    pub retry: RetryPolicy,
    pub background: Arc<BackgroundTasks>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AiReply {
    pub text: String,
    pub usage: TokenUsage,
}

/// Per-agent view of the services, bound to the agent's identity.
pub struct AgentRuntime {
    agent: AgentId,
    role: AgentRole,
    services: Arc<AgentServices>,
}

impl AgentRuntime {
    pub fn new(agent: AgentId, role: AgentRole, services: Arc<AgentServices>) -> Self {
        Self { agent, role, services }
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn services(&self) -> &AgentServices {
        &self.services
    }

    pub fn metrics(&self) -> &FallbackMetrics {
        &self.services.metrics
    }

    pub fn max_retries(&self) -> u32 {
        self.services.retry.max_attempts
    }

    /// The run a message belongs to.
    pub fn run(&self, message: &AgentMessage) -> Result<ActiveRun, AgentError> {
        self.services
            .executions
            .get(&message.execution_id)
            .ok_or_else(|| AgentError::UnknownExecution(message.execution_id.clone()))
    }

    /// The run a message belongs to, or `None` when it already finished and
    /// the message can be dropped.
    pub async fn live_run(&self, message: &AgentMessage) -> Result<Option<ActiveRun>, AgentError> {
        let run = self.run(message)?;
        if run.tracker.is_terminal().await {
            debug!(
                event_name = "agent.message_dropped",
                correlation_id = %message.execution_id,
                agent = %self.agent,
                message_id = %message.id,
                "execution already finished"
            );
            return Ok(None);
        }
        Ok(Some(run))
    }

    pub fn is_registered(&self, role: AgentRole) -> bool {
        self.services.router.is_registered(&role.id())
    }

    /// One completion call with the agent's instructions as system prompt.
    ///
    /// The prompt is augmented with recalled memories and knowledge passages
    /// when memory is enabled; each section is capped at `max_context_chars`.
    /// A memory entry describing the exchange is stored in the background.
    pub async fn process_with_ai(
        &self,
        prompt: &str,
        context: &SharedContext,
        data: &Value,
    ) -> Result<AiReply, AgentError> {
        let system_prompt = self.services.templates.system_prompt(self.role, context, data)?;
        let user_prompt = self.augment(prompt, context).await;
        let request = self.services.completion.request(system_prompt, user_prompt);

        let response = self.services.llm.complete(request).await?;
        info!(
            event_name = "agent.ai_call",
            correlation_id = %context.metadata.execution_id,
            agent = %self.agent,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            total_tokens = response.usage.total_tokens,
            "completion received"
        );

        if self.services.memory_settings.enabled {
            self.remember(prompt, &response.text, context);
        }
        Ok(AiReply { text: response.text, usage: response.usage })
    }

    /// `process_with_ai` with exponential backoff; `max_retries` counts
    /// attempts, the first one included.
    pub async fn process_with_ai_retry(
        &self,
        prompt: &str,
        context: &SharedContext,
        data: &Value,
        max_retries: u32,
    ) -> Result<AiReply, AgentError> {
        let policy = self.services.retry.with_max_attempts(max_retries);
        policy
            .run(
                |_| self.process_with_ai(prompt, context, data),
                |attempt, error, delay| {
                    self.services.metrics.record_ai_retry();
                    warn!(
                        event_name = "agent.ai_retry",
                        correlation_id = %context.metadata.execution_id,
                        agent = %self.agent,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "completion failed, retrying"
                    );
                },
            )
            .await
    }

    /// Structured output of a reply, or an empty object when none can be
    /// extracted. The fallback is counted.
    pub fn parse_object(&self, reply: &AiReply, run: &ActiveRun) -> Value {
        match safe_parse_json(&reply.text) {
            Ok(value) => value,
            Err(error) => {
                self.services.metrics.record_parse_failure();
                warn!(
                    event_name = "agent.parse_fallback",
                    correlation_id = %run.execution_id(),
                    agent = %self.agent,
                    error = %error,
                    "model output had no JSON object, continuing with empty result"
                );
                Value::Object(Map::new())
            }
        }
    }

    pub async fn record_success(
        &self,
        run: &ActiveRun,
        stage: &str,
        result: Value,
        tokens: u64,
    ) -> Option<StageResult> {
        run.tracker
            .record_stage(StageOutcome::success(stage, self.agent.clone(), result, tokens))
            .await
    }

    /// Records a failed stage and fails the run.
    pub async fn fail_stage(&self, run: &ActiveRun, stage: &str, error: &AgentError, tokens: u64) {
        warn!(
            event_name = "agent.stage_failed",
            correlation_id = %run.execution_id(),
            agent = %self.agent,
            stage,
            error = %error,
            "stage failed"
        );
        run.tracker
            .record_stage(StageOutcome::failure(stage, self.agent.clone(), error.to_string(), tokens))
            .await;
        run.tracker.mark_failed(format!("{stage} failed: {error}")).await;
    }

    /// Sends a task to the next agent of the run. A routing failure fails
    /// the run, since the pipeline cannot continue.
    pub async fn forward(
        &self,
        run: &ActiveRun,
        to: AgentRole,
        task: TaskKind,
        data: Value,
    ) -> Result<(), AgentError> {
        let message = AgentMessage::new(
            run.execution_id().clone(),
            self.agent.clone(),
            to.id(),
            MessagePayload::task(task, data),
            MessagePriority::High,
        );
        if let Err(error) = self.services.router.route_message(message) {
            run.tracker.mark_failed(format!("routing to {to} failed: {error}")).await;
            return Err(error.into());
        }
        Ok(())
    }

    pub fn send(&self, message: AgentMessage) -> Result<(), AgentError> {
        self.services.router.route_message(message).map_err(AgentError::from)
    }

    pub async fn complete_run(&self, run: &ActiveRun) -> Option<ExecutionResult> {
        run.tracker.mark_completed().await
    }

    async fn augment(&self, prompt: &str, context: &SharedContext) -> String {
        let settings = &self.services.memory_settings;
        if !settings.enabled {
            return prompt.to_string();
        }

        let tenant_id = &context.metadata.tenant_id;
        let mut sections = vec![prompt.to_string()];

        let query = MemoryQuery {
            query: prompt.to_string(),
            tenant_id: tenant_id.clone(),
            lead_id: Some(context.lead_id.clone()),
            agent_name: None,
            limit: settings.recall_limit,
            threshold: settings.recall_threshold,
        };
        match self.services.memory.recall(&query).await {
            Ok(memories) if !memories.is_empty() => {
                let lines: Vec<String> =
                    memories.iter().map(|memory| format!("- {}", memory.content)).collect();
                sections.push(section("Memórias relevantes", &lines, settings.max_context_chars));
            }
            Ok(_) => {}
            Err(error) => warn!(
                event_name = "agent.memory_recall_failed",
                correlation_id = %context.metadata.execution_id,
                agent = %self.agent,
                error = %error,
                "memory recall failed, continuing without memories"
            ),
        }

        match self.services.knowledge.search(tenant_id, prompt, settings.knowledge_limit).await {
            Ok(passages) if !passages.is_empty() => {
                let lines: Vec<String> = passages
                    .iter()
                    .map(|passage| format!("### {}\n{}", passage.title, passage.content))
                    .collect();
                sections.push(section("Base de conhecimento", &lines, settings.max_context_chars));
            }
            Ok(_) => {}
            Err(error) => warn!(
                event_name = "agent.knowledge_search_failed",
                correlation_id = %context.metadata.execution_id,
                agent = %self.agent,
                error = %error,
                "knowledge search failed, continuing without passages"
            ),
        }

        sections.join("\n\n")
    }

    fn remember(&self, prompt: &str, answer: &str, context: &SharedContext) {
        let entry = MemoryEntry {
            tenant_id: context.metadata.tenant_id.clone(),
            lead_id: Some(context.lead_id.clone()),
            agent_name: Some(self.agent.clone()),
            content: format!("{}\n{}", excerpt(prompt, 500), excerpt(answer, 1000)),
            metadata: json!({
                "execution_id": context.metadata.execution_id,
                "channel": context.metadata.channel,
            }),
            created_at: Utc::now(),
        };
        let memory = self.services.memory.clone();
        let metrics = self.services.metrics.clone();
        let agent = self.agent.clone();
        let execution_id = context.metadata.execution_id.clone();

        self.services.background.spawn(async move {
            if let Err(error) = memory.store(entry).await {
                metrics.record_memory_store_failure();
                warn!(
                    event_name = "agent.memory_store_failed",
                    correlation_id = %execution_id,
                    agent = %agent,
                    error = %error,
                    "memory store failed"
                );
            }
        });
    }
}

/// A titled block of lines, cut at whole lines to fit `max_chars`.
fn section(title: &str, lines: &[String], max_chars: usize) -> String {
    let mut body = String::new();
    for line in lines {
        let needed = line.chars().count() + usize::from(!body.is_empty());
        if body.chars().count() + needed > max_chars {
            break;
        }
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(line);
    }
    if body.is_empty() {
        if let Some(first) = lines.first() {
            body = excerpt(first, max_chars);
        }
    }
    format!("## {title}\n{body}")
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}
