use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use leadflow_core::domain::execution::{
    ExecutionId, ExecutionRecord, ExecutionStatus, StageResult,
};
use leadflow_core::domain::lead::LeadId;
use leadflow_core::domain::message::AgentId;
use leadflow_core::store::{ExecutionStore, StoreError};

use super::{parse_optional_timestamp, parse_timestamp, parse_u64, to_i64, RepositoryError};
use crate::DbPool;

pub struct SqlExecutionRepository {
    pool: DbPool,
}

impl SqlExecutionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Most recently created runs first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM execution ORDER BY created_at DESC LIMIT ?")
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load(&ExecutionId(id)).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn load(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                lead_id,
                tenant_id,
                status,
                total_tokens,
                estimated_cost,
                error,
                created_at,
                updated_at,
                completed_at
             FROM execution
             WHERE id = ?",
        )
        .bind(&execution_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let stage_rows = sqlx::query(
            "SELECT
                stage_name,
                agent_name,
                result_json,
                tokens,
                success,
                error,
                started_at,
                completed_at
             FROM execution_stage
             WHERE execution_id = ?
             ORDER BY started_at ASC, rowid ASC",
        )
        .bind(&execution_id.0)
        .fetch_all(&self.pool)
        .await?;

        let stages = stage_rows.into_iter().map(stage_from_row).collect::<Result<Vec<_>, _>>()?;
        execution_from_row(row, stages).map(Some)
    }

    async fn insert(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO execution (
                id,
                lead_id,
                tenant_id,
                status,
                total_tokens,
                estimated_cost,
                error,
                created_at,
                updated_at,
                completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&record.execution_id.0)
        .bind(&record.lead_id.0)
        .bind(&record.tenant_id)
        .bind(record.status.as_str())
        .bind(to_i64(record.total_tokens))
        .bind(record.estimated_cost.to_string())
        .bind(record.error.as_deref())
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .bind(record.completed_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_stage(
        &self,
        execution_id: &ExecutionId,
        stage: &StageResult,
        estimated_cost: Decimal,
    ) -> Result<(), RepositoryError> {
        let result_json = serde_json::to_string(&stage.result)
            .map_err(|error| RepositoryError::Decode(format!("stage result: {error}")))?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO execution_stage (
                execution_id,
                stage_name,
                agent_name,
                result_json,
                tokens,
                success,
                error,
                started_at,
                completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(execution_id, stage_name) DO UPDATE SET
                agent_name = excluded.agent_name,
                result_json = excluded.result_json,
                tokens = excluded.tokens,
                success = excluded.success,
                error = excluded.error,
                completed_at = excluded.completed_at",
        )
        .bind(&execution_id.0)
        .bind(&stage.stage_name)
        .bind(&stage.agent_name.0)
        .bind(result_json)
        .bind(to_i64(stage.tokens))
        .bind(stage.success)
        .bind(stage.error.as_deref())
        .bind(stage.started_at.to_rfc3339())
        .bind(stage.completed_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE execution
             SET total_tokens = total_tokens + ?,
                 estimated_cost = ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(to_i64(stage.tokens))
        .bind(estimated_cost.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(&execution_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_status(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let completed_at = status.is_terminal().then(|| now.clone());

        sqlx::query(
            "UPDATE execution
             SET status = ?,
                 error = COALESCE(?, error),
                 updated_at = ?,
                 completed_at = COALESCE(completed_at, ?)
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(&now)
        .bind(completed_at)
        .bind(&execution_id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finalize(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE execution
             SET status = ?,
                 total_tokens = MAX(total_tokens, ?),
                 estimated_cost = ?,
                 error = ?,
                 updated_at = ?,
                 completed_at = ?
             WHERE id = ?",
        )
        .bind(record.status.as_str())
        .bind(to_i64(record.total_tokens))
        .bind(record.estimated_cost.to_string())
        .bind(record.error.as_deref())
        .bind(record.updated_at.to_rfc3339())
        .bind(record.completed_at.map(|value| value.to_rfc3339()))
        .bind(&record.execution_id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for SqlExecutionRepository {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        Ok(self.insert(record).await?)
    }

    async fn update_status(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        Ok(self.set_status(execution_id, status, error).await?)
    }

    async fn record_stage(
        &self,
        execution_id: &ExecutionId,
        stage: &StageResult,
        estimated_cost: Decimal,
    ) -> Result<(), StoreError> {
        Ok(self.upsert_stage(execution_id, stage, estimated_cost).await?)
    }

    async fn complete(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        Ok(self.finalize(record).await?)
    }

    async fn fail(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        error: &str,
    ) -> Result<(), StoreError> {
        Ok(self.set_status(execution_id, status, Some(error)).await?)
    }

    async fn find_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.load(execution_id).await?)
    }
}

fn execution_from_row(
    row: SqliteRow,
    stages: Vec<StageResult>,
) -> Result<ExecutionRecord, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ExecutionStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown execution status `{status_raw}`")))?;
    let cost_raw = row.try_get::<String, _>("estimated_cost")?;
    let estimated_cost = Decimal::from_str(&cost_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid estimated_cost `{cost_raw}` ({error})"))
    })?;

    Ok(ExecutionRecord {
        execution_id: ExecutionId(row.try_get("id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        tenant_id: row.try_get("tenant_id")?,
        status,
        stages,
        total_tokens: parse_u64("total_tokens", row.try_get("total_tokens")?)?,
        estimated_cost,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
        error: row.try_get("error")?,
    })
}

fn stage_from_row(row: SqliteRow) -> Result<StageResult, RepositoryError> {
    let result_raw = row.try_get::<String, _>("result_json")?;
    let result = serde_json::from_str(&result_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid stage result_json ({error})")))?;

    Ok(StageResult {
        stage_name: row.try_get("stage_name")?,
        agent_name: AgentId(row.try_get("agent_name")?),
        result,
        tokens: parse_u64("tokens", row.try_get("tokens")?)?,
        started_at: parse_timestamp("started_at", row.try_get("started_at")?)?,
        completed_at: parse_timestamp("completed_at", row.try_get("completed_at")?)?,
        success: row.try_get("success")?,
        error: row.try_get("error")?,
    })
}
