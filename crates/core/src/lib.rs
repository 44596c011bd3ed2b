pub mod config;
pub mod domain;
pub mod errors;
pub mod execution_engine;
pub mod memory;
pub mod store;

pub use domain::context::{
    ContextMetadata, ConversationEntry, ConversationRole, DecisionRecord, LeadStage, SharedContext,
};
pub use domain::execution::{
    stages, ExecutionId, ExecutionRecord, ExecutionResult, ExecutionStatus, StageOutcome,
    StageResult,
};
pub use domain::lead::{LeadData, LeadId};
pub use domain::message::{
    AgentId, AgentMessage, AgentRole, MessageId, MessagePayload, MessagePriority, MessageType,
    TaskKind,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use execution_engine::{ExecutionEngine, ExecutionEngineConfig, ExecutionError};
pub use memory::{
    DisabledMemory, KnowledgeBase, KnowledgePassage, MemoryEntry, MemoryQuery,
    MemorySearchResult, MemoryStore,
};
pub use store::{ExecutionStore, NoopExecutionStore, StoreError};
