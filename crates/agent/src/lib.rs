//! Agent runtime - LLM-backed lead pipeline
//!
//! Each agent is an independent task draining its own mailbox. Messages
//! travel through the `Router` and carry the execution id of their run; the
//! run's tracker and shared context live in the `ExecutionRegistry`, so an
//! agent never holds per-run state.
//!
//! # Flow
//!
//! 1. `AgentSystem::process_lead` creates the tracker and context and sends
//!    a `ProcessLead` task to the Coordinator.
//! 2. The Coordinator picks the next agent (Qualifier when in doubt).
//! 3. Qualifier, Legal and Commercial each record one stage and forward.
//! 4. The Communicator drafts the lead message and completes the run.
//!
//! # Failure model
//!
//! Completion calls retry with exponential backoff. Unparsable model output
//! degrades to an empty object and unusable routing to the default agent;
//! both are counted in `FallbackMetrics`. A stage that still fails records a
//! failed stage and fails its run, and the run deadline bounds everything.

pub mod agents;
pub mod errors;
pub mod json;
pub mod llm;
pub mod mailbox;
pub mod metrics;
pub mod prompts;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod router;
pub mod runtime;
pub mod system;
pub mod tracker;

pub use agents::Agent;
pub use errors::{AgentError, SystemError};
pub use llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage};
pub use providers::HttpLlmClient;
pub use system::{AgentSystem, ProcessOptions, SystemServices, SystemSettings, SystemStats};
