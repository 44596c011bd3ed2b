use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use leadflow_agent::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage};
use leadflow_agent::retry::RetryPolicy;
use leadflow_agent::router::RoutingError;
use leadflow_agent::runtime::AgentRuntime;
use leadflow_agent::{
    Agent, AgentError, AgentSystem, ProcessOptions, SystemError, SystemServices, SystemSettings,
};
use leadflow_core::domain::execution::{
    ExecutionId, ExecutionRecord, ExecutionResult, ExecutionStatus, StageResult,
};
use leadflow_core::domain::lead::{LeadData, LeadId};
use leadflow_core::domain::message::{
    AgentId, AgentMessage, AgentRole, DecisionRequest, MessagePayload, MessagePriority, TaskKind,
};
use leadflow_core::config::MemoryConfig;
use leadflow_core::memory::{DisabledMemory, MemoryEntry, MemoryQuery, MemorySearchResult, MemoryStore};
use leadflow_core::store::{ExecutionStore, StoreError};
use leadflow_db::InMemoryExecutionStore;

enum Reply {
    Text(String),
    Fail(LlmError),
    Hang,
}

fn text(value: Value) -> Reply {
    Reply::Text(value.to_string())
}

type Script = dyn Fn(AgentRole, usize, &CompletionRequest) -> Reply + Send + Sync;

/// Completion stub that answers per agent, recognized by the agent name in
/// the system prompt.
struct ScriptedLlm {
    script: Box<Script>,
    calls: Mutex<HashMap<AgentRole, usize>>,
}

impl ScriptedLlm {
    fn new(script: impl Fn(AgentRole, usize, &CompletionRequest) -> Reply + Send + Sync + 'static) -> Self {
        Self { script: Box::new(script), calls: Mutex::new(HashMap::new()) }
    }

    fn calls(&self, role: AgentRole) -> usize {
        self.calls.lock().expect("calls lock").get(&role).copied().unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let role = AgentRole::ALL
            .into_iter()
            .find(|role| request.system_prompt.contains(&format!("agente {} ", role.as_str())))
            .expect("system prompt names the agent");
        let call = {
            let mut calls = self.calls.lock().expect("calls lock");
            let count = calls.entry(role).or_default();
            *count += 1;
            *count
        };

        match (self.script)(role, call, &request) {
            Reply::Text(text) => Ok(CompletionResponse { text, usage: TokenUsage::new(10, 5) }),
            Reply::Fail(error) => Err(error),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Happy path answers; `Lead:` in the task prompt is echoed back by the
/// communicator so results can be matched to their lead.
fn happy(role: AgentRole, _call: usize, request: &CompletionRequest) -> Reply {
    match role {
        AgentRole::Coordinator => text(json!({
            "next_agent": "Qualifier",
            "reasoning": "lead novo",
            "confidence": 0.8
        })),
        AgentRole::Qualifier => text(json!({
            "qualificado": true,
            "area_juridica": "trabalhista",
            "urgencia": "alta",
            "motivo": "demissão sem justa causa"
        })),
        AgentRole::Legal => Reply::Text(
            "Análise concluída:\n```json\n{\"viavel\": true, \"fundamentacao\": \"CLT art. 477\",}\n```"
                .to_string(),
        ),
        AgentRole::Commercial => text(json!({
            "titulo": "Reclamação trabalhista",
            "escopo": "verbas rescisórias",
            "honorarios": 3500,
            "forma_pagamento": "30% êxito",
            "validade_dias": 15
        })),
        AgentRole::Communicator => {
            let lead = request
                .user_prompt
                .lines()
                .find_map(|line| line.strip_prefix("Lead: "))
                .unwrap_or("cliente");
            text(json!({ "mensagem": format!("Olá {lead}, segue nossa proposta.") }))
        }
        AgentRole::Analyst | AgentRole::CustomerSuccess => text(json!({ "resumo": "ok" })),
    }
}

struct Harness {
    system: AgentSystem,
    llm: Arc<ScriptedLlm>,
    store: Arc<InMemoryExecutionStore>,
}

fn harness(llm: ScriptedLlm) -> Harness {
    let llm = Arc::new(llm);
    let store = Arc::new(InMemoryExecutionStore::default());
    let settings = SystemSettings {
        retry: RetryPolicy::new(3, Duration::from_millis(1)),
        ..SystemSettings::default()
    };
    let system = AgentSystem::new(
        SystemServices {
            llm: llm.clone(),
            store: store.clone(),
            memory: Arc::new(DisabledMemory),
            knowledge: Arc::new(DisabledMemory),
        },
        settings,
    )
    .expect("system");
    system.initialize();
    Harness { system, llm, store }
}

fn lead(id: &str, name: &str) -> LeadData {
    LeadData::new(LeadId(id.to_string())).with_name(name)
}

fn options() -> ProcessOptions {
    ProcessOptions { timeout: Duration::from_secs(5), ..ProcessOptions::default() }
}

fn stage_names(result: &ExecutionResult) -> Vec<&str> {
    result.stages.iter().map(|stage| stage.stage_name.as_str()).collect()
}

#[tokio::test]
async fn dismissed_worker_lead_runs_through_the_whole_pipeline() {
    let harness = harness(ScriptedLlm::new(happy));

    let result = harness
        .system
        .process_lead(lead("L-100", "Joana"), "Fui demitido sem justa causa", "whatsapp", options())
        .await
        .expect("result");

    assert_eq!(result.status, ExecutionStatus::Completed, "{:?}", result.error);
    assert_eq!(
        stage_names(&result),
        vec!["qualification", "legal_validation", "proposal", "message_sent"]
    );
    let qualification = result.qualification_result.as_ref().expect("qualification");
    assert_eq!(qualification["area_juridica"], "trabalhista");
    assert_eq!(result.legal_validation.as_ref().expect("legal")["viavel"], true);
    assert_eq!(result.proposal.as_ref().expect("proposal")["honorarios"], 3500);
    let message = result.message_sent.as_ref().expect("message");
    assert_eq!(message["canal"], "whatsapp");
    assert_eq!(message["tipo"], "proposal");
    assert!(message["mensagem"].as_str().expect("text").contains("Joana"));
    assert_eq!(result.total_tokens, 60);
    assert!(result.completed_at.is_some());

    harness.system.settle().await;
    let stored = harness
        .store
        .find_execution(&result.execution_id)
        .await
        .expect("store read")
        .expect("stored record");
    assert_eq!(stored.status, ExecutionStatus::Completed);
    assert_eq!(stored.stages.len(), 4);

    let stats = harness.system.system_stats();
    assert_eq!(stats.fallbacks.routing_defaults, 0);
    assert_eq!(stats.fallbacks.parse_failures, 0);
    assert_eq!(stats.message_count, 5);
}

#[tokio::test]
async fn hanging_coordinator_returns_a_timed_out_partial_result() {
    let harness = harness(ScriptedLlm::new(|role, call, request| match role {
        AgentRole::Coordinator => Reply::Hang,
        _ => happy(role, call, request),
    }));

    let started = Instant::now();
    let result = harness
        .system
        .process_lead(
            lead("L-101", "Pedro"),
            "Fui demitido sem justa causa",
            "web",
            ProcessOptions { timeout: Duration::from_millis(50), ..ProcessOptions::default() },
        )
        .await
        .expect("timeouts resolve");

    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(result.stages.is_empty());
    assert!(result.error.expect("reason").contains("50 ms"));

    let live = harness.system.execution(&result.execution_id).await.expect("lookup");
    assert_eq!(live.expect("still registered").status, ExecutionStatus::Timeout);
}

#[tokio::test]
async fn messages_to_unknown_agents_are_rejected_synchronously() {
    let harness = harness(ScriptedLlm::new(happy));
    let message = AgentMessage::new(
        leadflow_core::domain::execution::ExecutionId("exec-x".to_string()),
        AgentId::new("System"),
        AgentId::new("DoesNotExist"),
        MessagePayload::task(TaskKind::Analyze, json!({})),
        MessagePriority::Low,
    );

    let error = harness.system.route_message(message).expect_err("unknown agent");

    assert_eq!(
        error,
        SystemError::Routing(RoutingError::AgentNotFound(AgentId::new("DoesNotExist")))
    );
    assert!(harness.system.message_history().is_empty());
}

#[tokio::test]
async fn unknown_routing_answer_falls_back_to_qualification() {
    let harness = harness(ScriptedLlm::new(|role, call, request| match role {
        AgentRole::Coordinator => text(json!({ "next_agent": "Marketing" })),
        _ => happy(role, call, request),
    }));

    let result = harness
        .system
        .process_lead(lead("L-102", "Ana"), "Preciso de ajuda", "email", options())
        .await
        .expect("result");

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(stage_names(&result)[0], "qualification");
    assert_eq!(harness.llm.calls(AgentRole::Qualifier), 1);
    assert_eq!(harness.system.system_stats().fallbacks.routing_defaults, 1);
}

#[tokio::test]
async fn transient_completion_failures_are_retried() {
    let harness = harness(ScriptedLlm::new(|role, call, request| match (role, call) {
        (AgentRole::Qualifier, 1) => Reply::Fail(LlmError::Unreachable("refused".to_string())),
        (AgentRole::Qualifier, 2) => {
            Reply::Fail(LlmError::Service { status: 503, message: "busy".to_string() })
        }
        _ => happy(role, call, request),
    }));

    let result = harness
        .system
        .process_lead(lead("L-103", "Rui"), "Fui demitido sem justa causa", "web", options())
        .await
        .expect("result");

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(harness.llm.calls(AgentRole::Qualifier), 3);
    assert_eq!(harness.system.system_stats().fallbacks.ai_retries, 2);
}

#[tokio::test]
async fn unqualified_lead_receives_a_decline() {
    let harness = harness(ScriptedLlm::new(|role, call, request| match role {
        AgentRole::Qualifier => text(json!({ "qualificado": false, "motivo": "fora da área" })),
        AgentRole::Communicator => text(json!({ "mensagem": "Infelizmente não podemos ajudar." })),
        _ => happy(role, call, request),
    }));

    let result = harness
        .system
        .process_lead(lead("L-104", "Bia"), "Quero abrir uma empresa", "web", options())
        .await
        .expect("result");

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(stage_names(&result), vec!["qualification", "message_sent"]);
    assert!(result.proposal.is_none());
    assert_eq!(result.message_sent.expect("message")["tipo"], "decline");
    assert_eq!(harness.llm.calls(AgentRole::Legal), 0);
}

#[tokio::test]
async fn unparsable_qualification_counts_and_declines() {
    let harness = harness(ScriptedLlm::new(|role, call, request| match role {
        AgentRole::Qualifier => Reply::Text("Não consegui avaliar.".to_string()),
        _ => happy(role, call, request),
    }));

    let result = harness
        .system
        .process_lead(lead("L-105", "Caio"), "???", "web", options())
        .await
        .expect("result");

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.qualification_result, Some(json!({})));
    assert_eq!(harness.system.system_stats().fallbacks.parse_failures, 1);
}

#[tokio::test]
async fn exhausted_retries_fail_the_run_with_a_failed_stage() {
    let harness = harness(ScriptedLlm::new(|role, call, request| match role {
        AgentRole::Legal => Reply::Fail(LlmError::Unreachable("down".to_string())),
        _ => happy(role, call, request),
    }));

    let result = harness
        .system
        .process_lead(lead("L-106", "Lia"), "Fui demitido sem justa causa", "web", options())
        .await
        .expect("failures resolve");

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(stage_names(&result), vec!["qualification", "legal_validation"]);
    assert!(!result.stages[1].success);
    assert!(result.legal_validation.is_none());
    assert!(result.error.expect("reason").contains("legal_validation failed"));
    assert_eq!(harness.llm.calls(AgentRole::Legal), 3);
    assert_eq!(harness.llm.calls(AgentRole::Commercial), 0);
}

#[tokio::test]
async fn concurrent_leads_keep_their_own_context() {
    let harness = Arc::new(harness(ScriptedLlm::new(happy)));

    let runs = ["Joana", "Pedro", "Ana", "Rui"].map(|name| {
        let harness = harness.clone();
        tokio::spawn(async move {
            harness
                .system
                .process_lead(lead(&format!("L-{name}"), name), "Fui demitido", "web", options())
                .await
                .map(|result| (name, result))
        })
    });

    for run in runs {
        let (name, result) = run.await.expect("task").expect("result");
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.lead_id, LeadId(format!("L-{name}")));
        let message = result.message_sent.expect("message");
        assert_eq!(message["mensagem"], format!("Olá {name}, segue nossa proposta."));
    }
    assert_eq!(harness.system.system_stats().active_executions, 4);
}

/// Agent that hands every message it receives to the test.
struct Listener {
    inbox: mpsc::UnboundedSender<AgentMessage>,
}

#[async_trait]
impl Agent for Listener {
    fn role(&self) -> AgentRole {
        AgentRole::Analyst
    }

    fn id(&self) -> AgentId {
        AgentId::new("Listener")
    }

    async fn handle_message(
        &self,
        _runtime: &AgentRuntime,
        message: &AgentMessage,
    ) -> Result<(), AgentError> {
        let _ = self.inbox.send(message.clone());
        Ok(())
    }
}

fn decision_request(execution_id: &ExecutionId, options: &[&str]) -> AgentMessage {
    AgentMessage::new(
        execution_id.clone(),
        AgentId::new("Listener"),
        AgentRole::Coordinator.id(),
        MessagePayload::DecisionRequest(DecisionRequest {
            question: "Quem cuida do caso?".to_string(),
            options: options.iter().map(|option| option.to_string()).collect(),
        }),
        MessagePriority::Medium,
    )
}

async fn next_message(inbox: &mut mpsc::UnboundedReceiver<AgentMessage>) -> AgentMessage {
    tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("reply in time")
        .expect("inbox open")
}

#[tokio::test]
async fn coordinator_answers_decision_requests_from_the_offered_options() {
    let harness = harness(ScriptedLlm::new(|role, call, request| match (role, call) {
        (AgentRole::Coordinator, 2) => {
            text(json!({ "decision": "Legal", "reasoning": "precisa de parecer", "confidence": 0.9 }))
        }
        (AgentRole::Coordinator, 3) => text(json!({ "decision": "Marketing" })),
        _ => happy(role, call, request),
    }));
    let result = harness
        .system
        .process_lead(lead("L-107", "Joana"), "Fui demitido sem justa causa", "web", options())
        .await
        .expect("result");
    let (inbox, mut received) = mpsc::unbounded_channel();
    harness.system.register(Arc::new(Listener { inbox }));

    let request = decision_request(&result.execution_id, &["Legal", "Commercial"]);
    assert!(request.requires_response);
    harness.system.route_message(request).expect("routed");
    let reply = next_message(&mut received).await;

    let MessagePayload::DecisionResponse(response) = &reply.payload else {
        panic!("expected a decision response, got {:?}", reply.payload);
    };
    assert_eq!(reply.from, AgentRole::Coordinator.id());
    assert_eq!(reply.execution_id, result.execution_id);
    assert_eq!(response.decision.decision, "Legal");
    assert_eq!(response.decision.reasoning, "precisa de parecer");
    assert_eq!(response.decision.confidence, 0.9);
    assert_eq!(harness.system.system_stats().fallbacks.routing_defaults, 0);

    harness
        .system
        .route_message(decision_request(&result.execution_id, &["Legal", "Commercial"]))
        .expect("routed");
    let reply = next_message(&mut received).await;

    let MessagePayload::DecisionResponse(response) = &reply.payload else {
        panic!("expected a decision response, got {:?}", reply.payload);
    };
    assert_eq!(response.decision.decision, "Legal");
    assert_eq!(harness.system.system_stats().fallbacks.routing_defaults, 1);
    assert_eq!(harness.llm.calls(AgentRole::Coordinator), 3);
}

#[tokio::test]
async fn decision_request_without_options_is_reported_back() {
    let harness = harness(ScriptedLlm::new(happy));
    let result = harness
        .system
        .process_lead(lead("L-108", "Pedro"), "Fui demitido sem justa causa", "web", options())
        .await
        .expect("result");
    let (inbox, mut received) = mpsc::unbounded_channel();
    harness.system.register(Arc::new(Listener { inbox }));

    let request = decision_request(&result.execution_id, &[]);
    let request_id = request.id.clone();
    harness.system.route_message(request).expect("routed");
    let reply = next_message(&mut received).await;

    let MessagePayload::ErrorReport(report) = &reply.payload else {
        panic!("expected an error report, got {:?}", reply.payload);
    };
    assert_eq!(report.original_message_id, request_id);
    assert!(report.error.contains("no options"), "{}", report.error);
    assert_eq!(harness.llm.calls(AgentRole::Coordinator), 1);
    assert_eq!(harness.system.system_stats().fallbacks.routing_defaults, 0);
}

/// In-memory store whose stage writes take `delay`.
struct SlowStageStore {
    inner: InMemoryExecutionStore,
    delay: Duration,
}

#[async_trait]
impl ExecutionStore for SlowStageStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.inner.create_execution(record).await
    }

    async fn update_status(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.inner.update_status(execution_id, status, error).await
    }

    async fn record_stage(
        &self,
        execution_id: &ExecutionId,
        stage: &StageResult,
        estimated_cost: Decimal,
    ) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.record_stage(execution_id, stage, estimated_cost).await
    }

    async fn complete(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.inner.complete(record).await
    }

    async fn fail(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        error: &str,
    ) -> Result<(), StoreError> {
        self.inner.fail(execution_id, status, error).await
    }

    async fn find_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        self.inner.find_execution(execution_id).await
    }
}

#[tokio::test(start_paused = true)]
async fn caller_timeout_holds_while_the_store_is_slow() {
    let llm = Arc::new(ScriptedLlm::new(|role, call, request| match role {
        AgentRole::Legal => Reply::Hang,
        _ => happy(role, call, request),
    }));
    let store = Arc::new(SlowStageStore {
        inner: InMemoryExecutionStore::default(),
        delay: Duration::from_secs(3),
    });
    let system = AgentSystem::new(
        SystemServices {
            llm,
            store: store.clone(),
            memory: Arc::new(DisabledMemory),
            knowledge: Arc::new(DisabledMemory),
        },
        SystemSettings {
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            ..SystemSettings::default()
        },
    )
    .expect("system");
    system.initialize();

    let started = tokio::time::Instant::now();
    let result = system
        .process_lead(
            lead("L-109", "Lia"),
            "Fui demitido sem justa causa",
            "web",
            ProcessOptions { timeout: Duration::from_millis(100), ..ProcessOptions::default() },
        )
        .await
        .expect("timeouts resolve");

    assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert_eq!(stage_names(&result), vec!["qualification"]);

    system.settle().await;
    let stored = store
        .find_execution(&result.execution_id)
        .await
        .expect("store read")
        .expect("stored record");
    assert_eq!(stored.status, ExecutionStatus::Timeout);
    assert_eq!(stored.stages.len(), 1);
}

/// Memory whose writes land after `delay`.
#[derive(Default)]
struct SlowMemory {
    delay: Duration,
    entries: Mutex<Vec<MemoryEntry>>,
}

#[async_trait]
impl MemoryStore for SlowMemory {
    async fn recall(&self, _query: &MemoryQuery) -> Result<Vec<MemorySearchResult>, StoreError> {
        Ok(Vec::new())
    }

    async fn store(&self, entry: MemoryEntry) -> Result<String, StoreError> {
        tokio::time::sleep(self.delay).await;
        let mut entries = self.entries.lock().expect("entries lock");
        entries.push(entry);
        Ok(format!("mem-{}", entries.len()))
    }
}

#[tokio::test]
async fn settle_waits_for_pending_memory_writes() {
    let memory = Arc::new(SlowMemory { delay: Duration::from_millis(50), ..SlowMemory::default() });
    let system = AgentSystem::new(
        SystemServices {
            llm: Arc::new(ScriptedLlm::new(happy)),
            store: Arc::new(InMemoryExecutionStore::default()),
            memory: memory.clone(),
            knowledge: Arc::new(DisabledMemory),
        },
        SystemSettings {
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            memory: MemoryConfig { enabled: true, ..MemoryConfig::default() },
            ..SystemSettings::default()
        },
    )
    .expect("system");
    system.initialize();

    let result = system
        .process_lead(lead("L-110", "Rui"), "Fui demitido sem justa causa", "web", options())
        .await
        .expect("result");
    assert_eq!(result.status, ExecutionStatus::Completed);

    system.settle().await;
    let entries = memory.entries.lock().expect("entries lock");
    assert_eq!(entries.len(), 5);
    assert!(entries.iter().all(|entry| entry.lead_id == Some(LeadId("L-110".to_string()))));
    assert_eq!(system.system_stats().fallbacks.memory_store_failures, 0);
}
