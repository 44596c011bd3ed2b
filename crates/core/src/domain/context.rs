use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::execution::ExecutionId;
use crate::domain::lead::{LeadData, LeadId};
use crate::domain::message::AgentId;
use crate::errors::DomainError;

/// Commercial stage of the lead, as seen by the agents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStage {
    New,
    Analyzing,
    Qualified,
    LegalValidation,
    ProposalCreated,
    ProposalSent,
    Negotiation,
    ClosedWon,
    ClosedLost,
}

impl LeadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Analyzing => "analyzing",
            Self::Qualified => "qualified",
            Self::LegalValidation => "legal_validation",
            Self::ProposalCreated => "proposal_created",
            Self::ProposalSent => "proposal_sent",
            Self::Negotiation => "negotiation",
            Self::ClosedWon => "closed_won",
            Self::ClosedLost => "closed_lost",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Some(Self::New),
            "analyzing" => Some(Self::Analyzing),
            "qualified" => Some(Self::Qualified),
            "legal_validation" => Some(Self::LegalValidation),
            "proposal_created" => Some(Self::ProposalCreated),
            "proposal_sent" => Some(Self::ProposalSent),
            "negotiation" => Some(Self::Negotiation),
            "closed_won" => Some(Self::ClosedWon),
            "closed_lost" => Some(Self::ClosedLost),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ClosedWon | Self::ClosedLost)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Analyzing => 1,
            Self::Qualified => 2,
            Self::LegalValidation => 3,
            Self::ProposalCreated => 4,
            Self::ProposalSent => 5,
            Self::Negotiation => 6,
            Self::ClosedWon | Self::ClosedLost => 7,
        }
    }

    /// Stages only move forward (re-entering the current stage is allowed);
    /// a lead can be lost from any open stage.
    pub fn can_advance_to(&self, next: LeadStage) -> bool {
        if self.is_closed() {
            return *self == next;
        }
        next == Self::ClosedLost || next.rank() >= self.rank()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_maker: AgentId,
    pub decision: String,
    pub reasoning: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    Lead,
    Agent,
    System,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: ConversationRole,
    pub agent: Option<AgentId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn from_lead(content: impl Into<String>) -> Self {
        Self {
            role: ConversationRole::Lead,
            agent: None,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_agent(agent: AgentId, content: impl Into<String>) -> Self {
        Self {
            role: ConversationRole::Agent,
            agent: Some(agent),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub channel: String,
    pub tenant_id: String,
    pub execution_id: ExecutionId,
}

/// Per-run state shared by the agents taking part in one execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    pub lead_id: LeadId,
    pub lead: LeadData,
    pub current_stage: LeadStage,
    pub decisions: BTreeMap<String, DecisionRecord>,
    pub conversation_history: Vec<ConversationEntry>,
    pub metadata: ContextMetadata,
}

impl SharedContext {
    pub fn new(lead: LeadData, message: &str, metadata: ContextMetadata) -> Self {
        let mut conversation_history = Vec::new();
        if !message.trim().is_empty() {
            conversation_history.push(ConversationEntry::from_lead(message));
        }

        Self {
            lead_id: lead.id.clone(),
            lead,
            current_stage: LeadStage::New,
            decisions: BTreeMap::new(),
            conversation_history,
            metadata,
        }
    }

    pub fn advance_stage(&mut self, next: LeadStage) -> Result<(), DomainError> {
        if !self.current_stage.can_advance_to(next) {
            return Err(DomainError::InvalidStageTransition { from: self.current_stage, to: next });
        }
        self.current_stage = next;
        Ok(())
    }

    pub fn record_decision(&mut self, agent: &AgentId, record: DecisionRecord) {
        self.decisions.insert(agent.0.clone(), record);
    }

    pub fn append_conversation(&mut self, entry: ConversationEntry) {
        self.conversation_history.push(entry);
    }

    /// The most recent message written by the lead, if any.
    pub fn latest_lead_message(&self) -> Option<&str> {
        self.conversation_history
            .iter()
            .rev()
            .find(|entry| entry.role == ConversationRole::Lead)
            .map(|entry| entry.content.as_str())
    }
}
