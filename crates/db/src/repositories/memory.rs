use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use leadflow_core::domain::execution::{
    ExecutionId, ExecutionRecord, ExecutionStatus, StageResult,
};
use leadflow_core::memory::{
    rank_by_score, relevance_score, KnowledgeBase, KnowledgePassage, MemoryEntry, MemoryQuery,
    MemorySearchResult, MemoryStore,
};
use leadflow_core::store::{ExecutionStore, StoreError};

#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<String, ExecutionRecord>>,
}

impl InMemoryExecutionStore {
    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.is_empty()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        executions.entry(record.execution_id.0.clone()).or_insert_with(|| record.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        if let Some(record) = executions.get_mut(&execution_id.0) {
            let now = Utc::now();
            record.status = status;
            record.updated_at = now;
            if let Some(error) = error {
                record.error = Some(error.to_string());
            }
            if status.is_terminal() && record.completed_at.is_none() {
                record.completed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn record_stage(
        &self,
        execution_id: &ExecutionId,
        stage: &StageResult,
        estimated_cost: Decimal,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let record = executions
            .get_mut(&execution_id.0)
            .ok_or_else(|| StoreError::Backend(format!("unknown execution `{execution_id}`")))?;

        match record.stages.iter_mut().find(|existing| existing.stage_name == stage.stage_name) {
            Some(existing) => {
                let started_at = existing.started_at;
                *existing = StageResult { started_at, ..stage.clone() };
            }
            None => record.stages.push(stage.clone()),
        }
        record.total_tokens = record.total_tokens.saturating_add(stage.tokens);
        record.estimated_cost = estimated_cost;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn complete(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let stored = executions.entry(record.execution_id.0.clone()).or_insert_with(|| record.clone());
        let total_tokens = stored.total_tokens.max(record.total_tokens);
        *stored = ExecutionRecord { total_tokens, ..record.clone() };
        Ok(())
    }

    async fn fail(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        error: &str,
    ) -> Result<(), StoreError> {
        self.update_status(execution_id, status, Some(error)).await
    }

    async fn find_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let executions = self.executions.read().await;
        Ok(executions.get(&execution_id.0).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryMemoryStore {
    entries: RwLock<Vec<(String, MemoryEntry)>>,
}

impl InMemoryMemoryStore {
    pub async fn entries(&self) -> Vec<MemoryEntry> {
        self.entries.read().await.iter().map(|(_, entry)| entry.clone()).collect()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn recall(&self, query: &MemoryQuery) -> Result<Vec<MemorySearchResult>, StoreError> {
        let entries = self.entries.read().await;
        let matches = entries
            .iter()
            .filter(|(_, entry)| entry.tenant_id == query.tenant_id)
            .filter(|(_, entry)| query.lead_id.is_none() || entry.lead_id == query.lead_id)
            .filter(|(_, entry)| query.agent_name.is_none() || entry.agent_name == query.agent_name)
            .filter_map(|(id, entry)| {
                let score = relevance_score(&query.query, &entry.content);
                (score > 0.0 && score >= query.threshold).then(|| MemorySearchResult {
                    id: id.clone(),
                    content: entry.content.clone(),
                    score,
                    created_at: entry.created_at,
                })
            })
            .collect();

        Ok(rank_by_score(matches, query.limit, |result| result.score))
    }

    async fn store(&self, entry: MemoryEntry) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.entries.write().await.push((id.clone(), entry));
        Ok(id)
    }
}

#[derive(Default)]
pub struct InMemoryKnowledgeBase {
    passages: RwLock<Vec<KnowledgePassage>>,
}

impl InMemoryKnowledgeBase {
    pub async fn add_passage(&self, tenant_id: &str, title: &str, content: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.passages.write().await.push(KnowledgePassage {
            id: id.clone(),
            tenant_id: tenant_id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            score: 0.0,
        });
        id
    }
}

#[async_trait]
impl KnowledgeBase for InMemoryKnowledgeBase {
    async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgePassage>, StoreError> {
        let passages = self.passages.read().await;
        let matches = passages
            .iter()
            .filter(|passage| passage.tenant_id == tenant_id)
            .filter_map(|passage| {
                let score =
                    relevance_score(query, &format!("{} {}", passage.title, passage.content));
                (score > 0.0).then(|| KnowledgePassage { score, ..passage.clone() })
            })
            .collect();

        Ok(rank_by_score(matches, limit, |passage| passage.score))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::json;

    use leadflow_core::domain::execution::{
        ExecutionId, ExecutionRecord, ExecutionStatus, StageResult,
    };
    use leadflow_core::domain::lead::LeadId;
    use leadflow_core::domain::message::AgentRole;
    use leadflow_core::memory::{KnowledgeBase, MemoryEntry, MemoryQuery, MemoryStore};
    use leadflow_core::store::ExecutionStore;

    use crate::repositories::{InMemoryExecutionStore, InMemoryKnowledgeBase, InMemoryMemoryStore};

    fn record(id: &str) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            execution_id: ExecutionId(id.to_string()),
            lead_id: LeadId("L-1".to_string()),
            tenant_id: "default".to_string(),
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

    fn stage(name: &str, tokens: u64) -> StageResult {
        let now = Utc::now();
        StageResult {
            stage_name: name.to_string(),
            agent_name: AgentRole::Legal.id(),
            result: json!({"viavel": true}),
            tokens,
            started_at: now,
            completed_at: now,
            success: true,
            error: None,
        }
    }

    #[tokio::test]
    async fn in_memory_execution_store_accumulates_and_fails() {
        let store = InMemoryExecutionStore::default();
        let record = record("exec-mem-1");
        store.create_execution(&record).await.expect("create");

        store.record_stage(&record.execution_id, &stage("legal_validation", 40), Decimal::ZERO)
            .await
            .expect("stage");
        store.record_stage(&record.execution_id, &stage("legal_validation", 10), Decimal::ZERO)
            .await
            .expect("stage again");
        store.fail(&record.execution_id, ExecutionStatus::Failed, "boom").await.expect("fail");

        let found = store.find_execution(&record.execution_id).await.expect("find").expect("some");
        assert_eq!(found.total_tokens, 50);
        assert_eq!(found.stages.len(), 1);
        assert_eq!(found.status, ExecutionStatus::Failed);
        assert_eq!(found.error.as_deref(), Some("boom"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn in_memory_memory_store_filters_by_scope() {
        let store = InMemoryMemoryStore::default();
        store
            .store(MemoryEntry {
                tenant_id: "default".to_string(),
                lead_id: Some(LeadId("L-1".to_string())),
                agent_name: Some(AgentRole::Legal.id()),
                content: "viabilidade jurídica confirmada".to_string(),
                metadata: json!({}),
                created_at: Utc::now(),
            })
            .await
            .expect("store");

        let query = MemoryQuery {
            query: "viabilidade jurídica".to_string(),
            tenant_id: "default".to_string(),
            lead_id: None,
            agent_name: Some(AgentRole::Qualifier.id()),
            limit: 5,
            threshold: 0.3,
        };
        assert!(store.recall(&query).await.expect("recall").is_empty());

        let query = MemoryQuery { agent_name: Some(AgentRole::Legal.id()), ..query };
        assert_eq!(store.recall(&query).await.expect("recall").len(), 1);
    }

    #[tokio::test]
    async fn in_memory_knowledge_base_limits_results() {
        let kb = InMemoryKnowledgeBase::default();
        kb.add_passage("default", "FGTS", "multa de 40% do FGTS na demissão").await;
        kb.add_passage("default", "Aviso prévio", "aviso prévio proporcional na demissão").await;
        kb.add_passage("default", "Férias", "férias vencidas").await;

        let passages = kb.search("default", "demissão FGTS", 1).await.expect("search");

        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].title, "FGTS");
    }
}
