//! Long-term memory and knowledge-base ports consulted before each
//! completion call.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::lead::LeadId;
use crate::domain::message::AgentId;
use crate::store::StoreError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub tenant_id: String,
    pub lead_id: Option<LeadId>,
    pub agent_name: Option<AgentId>,
    pub content: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Scope and ranking limits for a recall.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryQuery {
    pub query: String,
    pub tenant_id: String,
    pub lead_id: Option<LeadId>,
    pub agent_name: Option<AgentId>,
    pub limit: usize,
    pub threshold: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemorySearchResult {
    pub id: String,
    pub content: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgePassage {
    pub id: String,
    pub tenant_id: String,
    pub title: String,
    pub content: String,
    pub score: f64,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Results ordered by descending score, all at or above the threshold.
    async fn recall(&self, query: &MemoryQuery) -> Result<Vec<MemorySearchResult>, StoreError>;

    /// Returns the id of the stored entry.
    async fn store(&self, entry: MemoryEntry) -> Result<String, StoreError>;
}

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgePassage>, StoreError>;
}

/// Memory backend for deployments without long-term memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledMemory;

#[async_trait]
impl MemoryStore for DisabledMemory {
    async fn recall(&self, _query: &MemoryQuery) -> Result<Vec<MemorySearchResult>, StoreError> {
        Ok(Vec::new())
    }

    async fn store(&self, _entry: MemoryEntry) -> Result<String, StoreError> {
        Ok(String::new())
    }
}

#[async_trait]
impl KnowledgeBase for DisabledMemory {
    async fn search(
        &self,
        _tenant_id: &str,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<KnowledgePassage>, StoreError> {
        Ok(Vec::new())
    }
}

fn terms(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|term| term.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Keyword relevance in `0.0..=1.0`: the share of distinct query terms
/// (three or more characters) that also appear in `content`.
pub fn relevance_score(query: &str, content: &str) -> f64 {
    let query_terms = terms(query);
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms = terms(content);
    let hits = query_terms.iter().filter(|term| content_terms.contains(*term)).count();
    hits as f64 / query_terms.len() as f64
}

/// Sorts by descending score and keeps the first `limit` entries.
pub fn rank_by_score<T>(mut items: Vec<T>, limit: usize, score: impl Fn(&T) -> f64) -> Vec<T> {
    items.sort_by(|a, b| score(b).partial_cmp(&score(a)).unwrap_or(std::cmp::Ordering::Equal));
    items.truncate(limit);
    items
}
