//! Persistence port for execution records.
//!
//! Every operation is keyed by execution id and is safe to repeat. Token
//! counters accumulate on the store side so concurrent stage writes for the
//! same run never lose tokens; other fields are last-write-wins.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::execution::{ExecutionId, ExecutionRecord, ExecutionStatus, StageResult};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("store decode failure: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts the record; a second call with the same id is a no-op.
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    async fn update_status(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Upserts the stage row and adds `stage.tokens` to the run total.
    async fn record_stage(
        &self,
        execution_id: &ExecutionId,
        stage: &StageResult,
        estimated_cost: Decimal,
    ) -> Result<(), StoreError>;

    /// Writes the final aggregate of a completed run.
    async fn complete(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Moves the run into `failed` or `timeout` with the given reason.
    async fn fail(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        error: &str,
    ) -> Result<(), StoreError>;

    async fn find_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, StoreError>;
}

/// Store used when no database is configured; drops every write.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopExecutionStore;

#[async_trait]
impl ExecutionStore for NoopExecutionStore {
    async fn create_execution(&self, _record: &ExecutionRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn update_status(
        &self,
        _execution_id: &ExecutionId,
        _status: ExecutionStatus,
        _error: Option<&str>,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn record_stage(
        &self,
        _execution_id: &ExecutionId,
        _stage: &StageResult,
        _estimated_cost: Decimal,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn complete(&self, _record: &ExecutionRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn fail(
        &self,
        _execution_id: &ExecutionId,
        _status: ExecutionStatus,
        _error: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_execution(
        &self,
        _execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(None)
    }
}
