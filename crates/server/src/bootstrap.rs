use std::sync::Arc;

use leadflow_agent::{
    AgentError, AgentSystem, HttpLlmClient, LlmClient, LlmError, SystemServices, SystemSettings,
};
use leadflow_core::config::{AppConfig, ConfigError};
use leadflow_db::{
    connect_with_config, migrations, DbPool, SqlExecutionRepository, SqlKnowledgeRepository,
    SqlMemoryRepository,
};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub system: Arc<AgentSystem>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("completion provider setup failed: {0}")]
    Provider(#[from] LlmError),
    #[error("agent system setup failed: {0}")]
    Agent(#[from] AgentError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let llm = HttpLlmClient::from_config(&config.llm)?;
    bootstrap_with_llm(config, Arc::new(llm)).await
}

/// Connects, migrates and starts the agents around the given completion
/// client. Every agent is registered before this returns.
pub async fn bootstrap_with_llm(
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        provider = config.llm.provider.as_str(),
        model = %config.llm.model,
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let system = AgentSystem::new(
        SystemServices {
            llm,
            store: Arc::new(SqlExecutionRepository::new(db_pool.clone())),
            memory: Arc::new(SqlMemoryRepository::new(db_pool.clone())),
            knowledge: Arc::new(SqlKnowledgeRepository::new(db_pool.clone())),
        },
        SystemSettings::from_config(&config),
    )?;
    system.initialize();
    info!(
        event_name = "system.bootstrap.agents_started",
        correlation_id = "bootstrap",
        agent_count = system.system_stats().agent_count,
        "agent system initialized"
    );

    Ok(Application { config, db_pool, system: Arc::new(system) })
}
