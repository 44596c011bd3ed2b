//! Deterministic execution state machine
//!
//! Pure transition logic for lead-processing runs: status changes, stage
//! merging and cost estimation. The async tracker in the agent crate wraps
//! this engine with timers, persistence and the completion signal.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::execution::{
    ExecutionId, ExecutionRecord, ExecutionResult, ExecutionStatus, StageOutcome, StageResult,
};
use crate::domain::lead::LeadId;

/// Configuration for the execution engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionEngineConfig {
    /// Flat price per thousand tokens used for the cost estimate
    pub cost_per_1k_tokens: Decimal,
}

impl Default for ExecutionEngineConfig {
    fn default() -> Self {
        Self { cost_per_1k_tokens: Decimal::new(2, 3) }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("invalid execution transition from {from} to {to}")]
    InvalidTransition { from: ExecutionStatus, to: ExecutionStatus },
    #[error("execution {execution_id} already reached terminal state {status}")]
    AlreadyTerminal { execution_id: ExecutionId, status: ExecutionStatus },
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionEngine {
    config: ExecutionEngineConfig,
}

impl ExecutionEngine {
    pub fn new() -> Self {
        Self::with_config(ExecutionEngineConfig::default())
    }

    pub fn with_config(config: ExecutionEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutionEngineConfig {
        &self.config
    }

    /// Fresh record in `pending`.
    pub fn create_record(
        &self,
        execution_id: ExecutionId,
        lead_id: LeadId,
        tenant_id: impl Into<String>,
    ) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            execution_id,
            lead_id,
            tenant_id: tenant_id.into(),
            status: ExecutionStatus::Pending,
            stages: Vec::new(),
            total_tokens: 0,
            estimated_cost: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    pub fn transition(
        &self,
        record: &mut ExecutionRecord,
        to: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), ExecutionError> {
        if record.status.is_terminal() {
            return Err(ExecutionError::AlreadyTerminal {
                execution_id: record.execution_id.clone(),
                status: record.status,
            });
        }
        if !record.status.can_transition_to(to) {
            return Err(ExecutionError::InvalidTransition { from: record.status, to });
        }

        let now = Utc::now();
        record.status = to;
        record.updated_at = now;
        if to.is_terminal() {
            record.completed_at = Some(now);
            record.estimated_cost = self.estimate_cost(record.total_tokens);
        }
        if error.is_some() {
            record.error = error;
        }
        Ok(())
    }

    /// Merges a stage outcome into the record.
    ///
    /// A repeated stage name replaces the earlier result in place but keeps
    /// its `started_at`. Tokens always accumulate.
    pub fn record_stage(
        &self,
        record: &mut ExecutionRecord,
        outcome: StageOutcome,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<StageResult, ExecutionError> {
        if record.status.is_terminal() {
            return Err(ExecutionError::AlreadyTerminal {
                execution_id: record.execution_id.clone(),
                status: record.status,
            });
        }

        let now = Utc::now();
        let existing_index =
            record.stages.iter().position(|stage| stage.stage_name == outcome.stage_name);
        let started_at = existing_index
            .map(|index| record.stages[index].started_at)
            .or(started_at)
            .unwrap_or(now);

        let stage = StageResult {
            stage_name: outcome.stage_name,
            agent_name: outcome.agent_name,
            result: outcome.result,
            tokens: outcome.tokens,
            started_at,
            completed_at: now,
            success: outcome.success,
            error: outcome.error,
        };

        match existing_index {
            Some(index) => record.stages[index] = stage.clone(),
            None => record.stages.push(stage.clone()),
        }

        record.total_tokens = record.total_tokens.saturating_add(stage.tokens);
        record.estimated_cost = self.estimate_cost(record.total_tokens);
        record.updated_at = now;

        Ok(stage)
    }

    /// `processing -> completed`, returning the caller-facing result.
    pub fn complete(&self, record: &mut ExecutionRecord) -> Result<ExecutionResult, ExecutionError> {
        self.transition(record, ExecutionStatus::Completed, None)?;
        Ok(ExecutionResult::from(&*record))
    }

    pub fn estimate_cost(&self, total_tokens: u64) -> Decimal {
        Decimal::from(total_tokens) / Decimal::from(1000) * self.config.cost_per_1k_tokens
    }
}
