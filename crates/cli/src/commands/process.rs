use std::sync::Arc;
use std::time::Duration;

use leadflow_agent::{
    AgentSystem, HttpLlmClient, ProcessOptions, SystemServices, SystemSettings,
};
use leadflow_core::config::{AppConfig, LoadOptions};
use leadflow_core::domain::execution::{ExecutionResult, ExecutionStatus};
use leadflow_core::domain::lead::{LeadData, LeadId};
use leadflow_db::{
    connect_with_config, migrations, SqlExecutionRepository, SqlKnowledgeRepository,
    SqlMemoryRepository,
};

use crate::commands::CommandResult;

#[derive(Clone, Debug, Default)]
pub struct ProcessArgs {
    pub message: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub channel: String,
    pub timeout_ms: Option<u64>,
}

type Failure = (&'static str, String, u8);

/// Upper bound on waiting for pending memory and execution writes before the
/// pool closes.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs one lead against the configured provider and database. The output
/// is the execution result as JSON; runs that did not complete exit with 1.
pub fn run(args: ProcessArgs) -> CommandResult {
    run_with(LoadOptions::default(), args)
}

pub fn run_with(options: LoadOptions, args: ProcessArgs) -> CommandResult {
    if args.message.trim().is_empty() {
        return CommandResult::failure("process", "invalid_input", "--message must not be empty", 2);
    }
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "process",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "process",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    match runtime.block_on(process(config, args)) {
        Ok(result) => render(&result),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("process", error_class, message, exit_code)
        }
    }
}

async fn process(config: AppConfig, args: ProcessArgs) -> Result<ExecutionResult, Failure> {
    let pool = connect_with_config(&config.database)
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4))?;
    migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), 5))?;

    let llm = HttpLlmClient::from_config(&config.llm)
        .map_err(|error| ("completion_provider", error.to_string(), 6))?;
    let system = AgentSystem::new(
        SystemServices {
            llm: Arc::new(llm),
            store: Arc::new(SqlExecutionRepository::new(pool.clone())),
            memory: Arc::new(SqlMemoryRepository::new(pool.clone())),
            knowledge: Arc::new(SqlKnowledgeRepository::new(pool.clone())),
        },
        SystemSettings::from_config(&config),
    )
    .map_err(|error| ("agent_init", error.to_string(), 6))?;
    system.initialize();

    let mut lead = LeadData::new(LeadId::generate());
    lead.name = args.name;
    lead.email = args.email;
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.orchestrator.execution_timeout());
    let options = ProcessOptions { timeout, ..ProcessOptions::default() };

    let result = system
        .process_lead(lead, &args.message, &args.channel, options)
        .await
        .map_err(|error| ("pipeline", error.to_string(), 6));
    let _ = tokio::time::timeout(SETTLE_TIMEOUT, system.settle()).await;
    system.shutdown().await;
    pool.close().await;
    result
}

fn render(result: &ExecutionResult) -> CommandResult {
    let exit_code = if result.status == ExecutionStatus::Completed { 0 } else { 1 };
    match serde_json::to_string_pretty(result) {
        Ok(output) => CommandResult { exit_code, output },
        Err(error) => CommandResult::failure("process", "serialization", error.to_string(), 7),
    }
}
