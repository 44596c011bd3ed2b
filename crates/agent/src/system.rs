//! The orchestrator value: agent mailboxes, router, run registry and the
//! `process_lead` entry point. One `AgentSystem` is built at startup and
//! shared by reference; tests build as many isolated systems as they need.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use leadflow_core::config::{AppConfig, MemoryConfig};
use leadflow_core::domain::context::{ContextMetadata, SharedContext};
use leadflow_core::domain::execution::{ExecutionId, ExecutionResult};
use leadflow_core::domain::lead::LeadData;
use leadflow_core::domain::message::{
    AgentId, AgentMessage, AgentRole, MessagePayload, MessagePriority, TaskKind,
};
use leadflow_core::execution_engine::{ExecutionEngine, ExecutionEngineConfig};
use leadflow_core::memory::{KnowledgeBase, MemoryStore};
use leadflow_core::store::ExecutionStore;

use crate::agents::{default_agents, Agent};
use crate::errors::{AgentError, SystemError};
use crate::llm::{CompletionSettings, LlmClient};
use crate::mailbox::spawn_mailbox;
use crate::metrics::{FallbackMetrics, FallbackSnapshot};
use crate::prompts::PromptTemplates;
use crate::registry::{ActiveRun, ExecutionRegistry};
use crate::retry::RetryPolicy;
use crate::router::{Router, RoutingError};
use crate::runtime::{AgentRuntime, AgentServices, BackgroundTasks};
use crate::tracker::{CompletionError, ExecutionTracker};

/// Sender id of messages injected from outside the agent set.
pub const SYSTEM_SENDER: &str = "System";
pub const DEFAULT_TENANT: &str = "default";

/// External collaborators of the agents.
#[derive(Clone)]
pub struct SystemServices {
    pub llm: Arc<dyn LlmClient>,
    pub store: Arc<dyn ExecutionStore>,
    pub memory: Arc<dyn MemoryStore>,
    pub knowledge: Arc<dyn KnowledgeBase>,
}

#[derive(Clone, Debug)]
pub struct SystemSettings {
    /// Deadline of every run, enforced by its tracker.
    pub execution_timeout: Duration,
    pub gc_delay: Duration,
    pub history_capacity: usize,
    pub engine: ExecutionEngineConfig,
    pub completion: CompletionSettings,
    pub retry: RetryPolicy,
    pub memory: MemoryConfig,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(60),
            gc_delay: Duration::from_secs(300),
            history_capacity: 1000,
            engine: ExecutionEngineConfig::default(),
            completion: CompletionSettings::default(),
            retry: RetryPolicy::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl SystemSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let orchestrator = &config.orchestrator;
        Self {
            execution_timeout: orchestrator.execution_timeout(),
            gc_delay: orchestrator.gc_delay(),
            history_capacity: orchestrator.history_capacity,
            engine: ExecutionEngineConfig { cost_per_1k_tokens: orchestrator.cost_per_1k_tokens },
            completion: CompletionSettings::from(&config.llm),
            retry: RetryPolicy::new(config.llm.max_retries, orchestrator.retry_base_delay()),
            memory: config.memory.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessOptions {
    pub wait_for_completion: bool,
    /// How long the caller waits; the run's own deadline is separate.
    pub timeout: Duration,
    pub tenant_id: String,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            wait_for_completion: true,
            timeout: Duration::from_secs(60),
            tenant_id: DEFAULT_TENANT.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SystemStats {
    pub agent_count: usize,
    pub message_count: u64,
    pub active_agents: Vec<String>,
    pub active_executions: usize,
    pub fallbacks: FallbackSnapshot,
}

pub struct AgentSystem {
    services: Arc<AgentServices>,
    store: Arc<dyn ExecutionStore>,
    engine: ExecutionEngine,
    execution_timeout: Duration,
    mailboxes: Mutex<HashMap<AgentId, JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl AgentSystem {
    pub fn new(services: SystemServices, settings: SystemSettings) -> Result<Self, AgentError> {
        let agent_services = AgentServices {
            router: Arc::new(Router::new(settings.history_capacity)),
            executions: Arc::new(ExecutionRegistry::new(settings.gc_delay)),
            llm: services.llm,
            memory: services.memory,
            knowledge: services.knowledge,
            metrics: Arc::new(FallbackMetrics::default()),
            templates: Arc::new(PromptTemplates::new()?),
            completion: settings.completion,
            memory_settings: settings.memory,
            retry: settings.retry,
            background: Arc::new(BackgroundTasks::default()),
        };

        Ok(Self {
            services: Arc::new(agent_services),
            store: services.store,
            engine: ExecutionEngine::with_config(settings.engine),
            execution_timeout: settings.execution_timeout,
            mailboxes: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Registers the built-in agents whose ids are still free. Calling it
    /// again is a no-op, and agents registered beforehand are kept.
    pub fn initialize(&self) {
        let mut registered = 0;
        for agent in default_agents() {
            if !self.services.router.is_registered(&agent.id()) {
                self.register(agent);
                registered += 1;
            }
        }
        if registered > 0 {
            info!(
                event_name = "system.initialized",
                registered,
                agents = self.services.router.agent_names().len(),
                "agent system initialized"
            );
        }
    }

    /// Starts the agent's mailbox and points its id at it. An agent already
    /// registered under the same id stops once its queued messages drain.
    pub fn register(&self, agent: Arc<dyn Agent>) {
        let id = agent.id();
        let runtime = AgentRuntime::new(id.clone(), agent.role(), self.services.clone());
        let (sender, handle) = spawn_mailbox(agent, runtime);

        if self.services.router.register(id.clone(), sender).is_some() {
            info!(event_name = "system.agent_replaced", agent = %id, "agent replaced");
        }
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner).insert(id, handle);
    }

    pub fn services(&self) -> &AgentServices {
        &self.services
    }

    /// Runs one lead through the pipeline.
    ///
    /// Business outcomes, including failed and timed out runs, come back as
    /// an `ExecutionResult`; only a missing coordinator or a shut down system
    /// is an error. When the caller's wait ends first, the run is marked
    /// `timeout` and its partial aggregate is returned.
    pub async fn process_lead(
        &self,
        lead: LeadData,
        message: &str,
        channel: &str,
        options: ProcessOptions,
    ) -> Result<ExecutionResult, SystemError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SystemError::ShutDown);
        }
        let coordinator = AgentRole::Coordinator.id();
        if !self.services.router.is_registered(&coordinator) {
            return Err(RoutingError::AgentNotFound(coordinator).into());
        }

        let execution_id = ExecutionId::generate();
        info!(
            event_name = "system.lead_received",
            correlation_id = %execution_id,
            lead_id = %lead.id,
            channel,
            tenant_id = %options.tenant_id,
            "processing lead"
        );

        let tracker = ExecutionTracker::create(
            self.engine.clone(),
            self.store.clone(),
            execution_id.clone(),
            lead.id.clone(),
            &options.tenant_id,
            self.execution_timeout,
        )
        .await;
        let context = SharedContext::new(
            lead,
            message,
            ContextMetadata {
                channel: channel.to_string(),
                tenant_id: options.tenant_id.clone(),
                execution_id: execution_id.clone(),
            },
        );
        self.services.executions.insert(ActiveRun::new(tracker.clone(), context));
        tracker.mark_processing().await;

        let kickoff = AgentMessage::new(
            execution_id.clone(),
            AgentId::new(SYSTEM_SENDER),
            coordinator,
            MessagePayload::task(
                TaskKind::ProcessLead,
                json!({ "message": message, "channel": channel }),
            ),
            MessagePriority::High,
        )
        .with_requires_response(false);
        if let Err(error) = self.services.router.route_message(kickoff) {
            tracker.mark_failed(format!("could not reach the coordinator: {error}")).await;
            return Err(error.into());
        }

        if !options.wait_for_completion {
            return Ok(tracker.result().await);
        }

        let result = match tracker.wait_for_completion(options.timeout).await {
            Ok(result) => result,
            Err(CompletionError::Rejected(result)) => *result,
            Err(CompletionError::WaitTimedOut(waited)) => {
                let reason = format!("no result within {} ms", waited.as_millis());
                match tracker.mark_timeout(reason).await {
                    Some(result) => result,
                    None => tracker.result().await,
                }
            }
        };
        info!(
            event_name = "system.lead_finished",
            correlation_id = %execution_id,
            status = result.status.as_str(),
            stages = result.stages.len(),
            total_tokens = result.total_tokens,
            "lead processed"
        );
        Ok(result)
    }

    pub fn route_message(&self, message: AgentMessage) -> Result<(), SystemError> {
        self.services.router.route_message(message)?;
        Ok(())
    }

    pub fn system_stats(&self) -> SystemStats {
        let router = &self.services.router;
        let active_agents: Vec<String> =
            router.agent_names().into_iter().map(|agent| agent.0).collect();
        SystemStats {
            agent_count: active_agents.len(),
            message_count: router.message_count(),
            active_agents,
            active_executions: self.services.executions.len(),
            fallbacks: self.services.metrics.snapshot(),
        }
    }

    pub fn message_history(&self) -> Vec<AgentMessage> {
        self.services.router.history()
    }

    /// Live view of an in-flight run, otherwise the persisted record.
    pub async fn execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionResult>, SystemError> {
        if let Some(run) = self.services.executions.get(execution_id) {
            return Ok(Some(run.tracker.result().await));
        }
        let record = self.store.find_execution(execution_id).await?;
        Ok(record.as_ref().map(ExecutionResult::from))
    }

    /// Waits until memory writes spawned by the agents and the execution
    /// writes queued by live runs have reached their stores. Callers that
    /// close the database afterwards bound this with their own timeout.
    pub async fn settle(&self) {
        self.services.background.drain().await;
        for run in self.services.executions.runs() {
            run.tracker.flush().await;
        }
    }

    /// Stops every agent and forgets runs, history and counters. Runs still
    /// in flight are failed. `initialize` brings the default agents back.
    pub async fn reset(&self) {
        self.stop("agent system reset").await;
        self.services.metrics.reset();
        info!(event_name = "system.reset", "agent system reset");
    }

    /// Like `reset`, and later `process_lead` calls are refused.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop("agent system shut down").await;
        info!(event_name = "system.shutdown", "agent system shut down");
    }

    async fn stop(&self, reason: &str) {
        self.services.router.clear();
        let handles: Vec<JoinHandle<()>> = self
            .mailboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.abort();
        }

        for run in self.services.executions.clear() {
            if run.tracker.mark_failed(reason).await.is_some() {
                warn!(
                    event_name = "system.run_abandoned",
                    correlation_id = %run.execution_id(),
                    reason,
                    "in-flight execution failed on stop"
                );
            }
        }
    }
}
