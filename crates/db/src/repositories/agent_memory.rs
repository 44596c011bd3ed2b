use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use leadflow_core::memory::{
    rank_by_score, relevance_score, KnowledgeBase, KnowledgePassage, MemoryEntry, MemoryQuery,
    MemorySearchResult, MemoryStore,
};
use leadflow_core::store::StoreError;

use super::{parse_timestamp, RepositoryError};
use crate::DbPool;

/// Upper bound on rows scored per recall; the newest rows in scope win.
const RECALL_CANDIDATE_WINDOW: i64 = 200;

pub struct SqlMemoryRepository {
    pool: DbPool,
}

impl SqlMemoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, entry: MemoryEntry) -> Result<String, RepositoryError> {
        let id = Uuid::new_v4().to_string();
        let metadata_json = serde_json::to_string(&entry.metadata)
            .map_err(|error| RepositoryError::Decode(format!("memory metadata: {error}")))?;

        sqlx::query(
            "INSERT INTO agent_memory (
                id,
                tenant_id,
                lead_id,
                agent_name,
                content,
                metadata_json,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&entry.tenant_id)
        .bind(entry.lead_id.as_ref().map(|lead_id| lead_id.0.as_str()))
        .bind(entry.agent_name.as_ref().map(|agent| agent.0.as_str()))
        .bind(&entry.content)
        .bind(metadata_json)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn candidates(&self, query: &MemoryQuery) -> Result<Vec<SqliteRow>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, content, created_at
             FROM agent_memory
             WHERE tenant_id = ?
               AND (? IS NULL OR lead_id = ?)
               AND (? IS NULL OR agent_name = ?)
             ORDER BY created_at DESC
             LIMIT ?",
        )
        .bind(&query.tenant_id)
        .bind(query.lead_id.as_ref().map(|lead_id| lead_id.0.as_str()))
        .bind(query.lead_id.as_ref().map(|lead_id| lead_id.0.as_str()))
        .bind(query.agent_name.as_ref().map(|agent| agent.0.as_str()))
        .bind(query.agent_name.as_ref().map(|agent| agent.0.as_str()))
        .bind(RECALL_CANDIDATE_WINDOW)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl MemoryStore for SqlMemoryRepository {
    async fn recall(&self, query: &MemoryQuery) -> Result<Vec<MemorySearchResult>, StoreError> {
        let rows = self.candidates(query).await?;
        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let content: String = row.try_get("content").map_err(RepositoryError::from)?;
            let score = relevance_score(&query.query, &content);
            if score < query.threshold || score == 0.0 {
                continue;
            }
            scored.push(MemorySearchResult {
                id: row.try_get("id").map_err(RepositoryError::from)?,
                content,
                score,
                created_at: parse_timestamp(
                    "created_at",
                    row.try_get("created_at").map_err(RepositoryError::from)?,
                )?,
            });
        }

        Ok(rank_by_score(scored, query.limit, |result| result.score))
    }

    async fn store(&self, entry: MemoryEntry) -> Result<String, StoreError> {
        Ok(self.insert(entry).await?)
    }
}

pub struct SqlKnowledgeRepository {
    pool: DbPool,
}

impl SqlKnowledgeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces a passage; returns its id.
    pub async fn upsert_passage(
        &self,
        id: Option<&str>,
        tenant_id: &str,
        title: &str,
        content: &str,
    ) -> Result<String, RepositoryError> {
        let id = id.map(str::to_string).unwrap_or_else(|| Uuid::new_v4().to_string());

        sqlx::query(
            "INSERT INTO knowledge_passage (id, tenant_id, title, content, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                title = excluded.title,
                content = excluded.content",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(title)
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }
}

#[async_trait]
impl KnowledgeBase for SqlKnowledgeRepository {
    async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgePassage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, title, content FROM knowledge_passage WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let mut passages = Vec::new();
        for row in rows {
            let passage = passage_from_row(row)?;
            let score = relevance_score(query, &format!("{} {}", passage.title, passage.content));
            if score > 0.0 {
                passages.push(KnowledgePassage { score, ..passage });
            }
        }

        Ok(rank_by_score(passages, limit, |passage| passage.score))
    }
}

fn passage_from_row(row: SqliteRow) -> Result<KnowledgePassage, RepositoryError> {
    Ok(KnowledgePassage {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        score: 0.0,
    })
}
