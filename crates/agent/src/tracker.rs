//! Async owner of one run's state machine.
//!
//! The tracker wraps the pure `ExecutionEngine` with a deadline, write-through
//! persistence and a completion signal. Any agent in the chain may finish or
//! fail the run; the first terminal transition wins and later writes are
//! dropped.
//!
//! Store writes are queued in transition order and applied by a writer task,
//! so no transition ever waits on the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use leadflow_core::domain::execution::{
    ExecutionId, ExecutionRecord, ExecutionResult, ExecutionStatus, StageOutcome, StageResult,
};
use leadflow_core::domain::lead::LeadId;
use leadflow_core::execution_engine::{ExecutionEngine, ExecutionError};
use leadflow_core::store::ExecutionStore;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("execution {} ended with status {}", .0.execution_id, .0.status)]
    Rejected(Box<ExecutionResult>),
    #[error("stopped waiting for execution after {0:?}")]
    WaitTimedOut(Duration),
}

struct TrackerState {
    record: ExecutionRecord,
    stage_starts: HashMap<String, DateTime<Utc>>,
}

enum StoreWrite {
    Create(ExecutionRecord),
    Status { status: ExecutionStatus },
    Stage { stage: StageResult, estimated_cost: Decimal },
    Complete(ExecutionRecord),
    Finish { status: ExecutionStatus, reason: String },
    Flush(oneshot::Sender<()>),
}

pub struct ExecutionTracker {
    engine: ExecutionEngine,
    execution_id: ExecutionId,
    state: AsyncMutex<TrackerState>,
    writes: mpsc::UnboundedSender<StoreWrite>,
    outcome: watch::Sender<Option<ExecutionResult>>,
    deadline: Mutex<Option<AbortHandle>>,
}

impl ExecutionTracker {
    /// Queues a `pending` record and arms the run deadline.
    pub async fn create(
        engine: ExecutionEngine,
        store: Arc<dyn ExecutionStore>,
        execution_id: ExecutionId,
        lead_id: LeadId,
        tenant_id: &str,
        timeout: Duration,
    ) -> Arc<Self> {
        let record = engine.create_record(execution_id.clone(), lead_id, tenant_id);
        let (writes, queued) = mpsc::unbounded_channel();
        tokio::spawn(write_through(store, execution_id.clone(), queued));

        let (outcome, _) = watch::channel(None);
        let tracker = Arc::new(Self {
            engine,
            execution_id,
            state: AsyncMutex::new(TrackerState {
                record: record.clone(),
                stage_starts: HashMap::new(),
            }),
            writes,
            outcome,
            deadline: Mutex::new(None),
        });
        tracker.queue(StoreWrite::Create(record));

        let weak = Arc::downgrade(&tracker);
        let deadline = tokio::spawn(expire_after(weak, timeout)).abort_handle();
        *tracker.deadline.lock().unwrap_or_else(PoisonError::into_inner) = Some(deadline);

        info!(
            event_name = "execution.created",
            correlation_id = %tracker.execution_id,
            timeout_ms = timeout.as_millis() as u64,
            "execution created"
        );
        tracker
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub async fn snapshot(&self) -> ExecutionRecord {
        self.state.lock().await.record.clone()
    }

    /// Current aggregate, partial while the run is live.
    pub async fn result(&self) -> ExecutionResult {
        ExecutionResult::from(&self.state.lock().await.record)
    }

    pub async fn status(&self) -> ExecutionStatus {
        self.state.lock().await.record.status
    }

    pub async fn is_terminal(&self) -> bool {
        self.status().await.is_terminal()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ExecutionResult>> {
        self.outcome.subscribe()
    }

    pub async fn mark_processing(&self) -> bool {
        let mut state = self.state.lock().await;
        match self.engine.transition(&mut state.record, ExecutionStatus::Processing, None) {
            Ok(()) => {
                self.queue(StoreWrite::Status { status: ExecutionStatus::Processing });
                true
            }
            Err(error) => {
                self.ignored_write("mark_processing", &error);
                false
            }
        }
    }

    /// Remembers when a stage began so its duration covers the model call.
    pub async fn start_stage(&self, stage_name: &str) {
        let mut state = self.state.lock().await;
        if state.record.status.is_terminal() {
            return;
        }
        state.stage_starts.entry(stage_name.to_string()).or_insert_with(Utc::now);
    }

    pub async fn record_stage(&self, outcome: StageOutcome) -> Option<StageResult> {
        let mut state = self.state.lock().await;
        let started_at = state.stage_starts.get(&outcome.stage_name).copied();
        let stage = match self.engine.record_stage(&mut state.record, outcome, started_at) {
            Ok(stage) => stage,
            Err(error) => {
                self.ignored_write("record_stage", &error);
                return None;
            }
        };
        self.queue(StoreWrite::Stage {
            stage: stage.clone(),
            estimated_cost: state.record.estimated_cost,
        });
        let total_tokens = state.record.total_tokens;
        drop(state);

        info!(
            event_name = "execution.stage_recorded",
            correlation_id = %self.execution_id,
            stage = %stage.stage_name,
            agent = %stage.agent_name,
            success = stage.success,
            tokens = stage.tokens,
            total_tokens,
            "stage recorded"
        );
        Some(stage)
    }

    pub async fn mark_completed(&self) -> Option<ExecutionResult> {
        let mut state = self.state.lock().await;
        let result = match self.engine.complete(&mut state.record) {
            Ok(result) => result,
            Err(error) => {
                self.ignored_write("mark_completed", &error);
                return None;
            }
        };
        self.queue(StoreWrite::Complete(state.record.clone()));
        drop(state);

        self.disarm();
        self.outcome.send_replace(Some(result.clone()));
        info!(
            event_name = "execution.completed",
            correlation_id = %self.execution_id,
            stages = result.stages.len(),
            total_tokens = result.total_tokens,
            estimated_cost = %result.estimated_cost,
            "execution completed"
        );
        Some(result)
    }

    pub async fn mark_failed(&self, reason: impl Into<String>) -> Option<ExecutionResult> {
        self.finish_unsuccessfully(ExecutionStatus::Failed, reason.into()).await
    }

    pub async fn mark_timeout(&self, reason: impl Into<String>) -> Option<ExecutionResult> {
        self.finish_unsuccessfully(ExecutionStatus::Timeout, reason.into()).await
    }

    /// Waits for the run to finish, bounded by `timeout`.
    ///
    /// Completed runs resolve with their result; failed or timed out runs
    /// are rejected with the aggregate at the moment they ended.
    pub async fn wait_for_completion(
        &self,
        timeout: Duration,
    ) -> Result<ExecutionResult, CompletionError> {
        let mut receiver = self.subscribe();
        let finished = tokio::time::timeout(timeout, async move {
            let outcome =
                receiver.wait_for(Option::is_some).await.ok().and_then(|outcome| outcome.clone());
            outcome
        })
        .await
        .map_err(|_| CompletionError::WaitTimedOut(timeout))?;

        let result = match finished {
            Some(result) => result,
            None => self.result().await,
        };
        if result.status == ExecutionStatus::Completed {
            Ok(result)
        } else {
            Err(CompletionError::Rejected(Box::new(result)))
        }
    }

    /// Resolves once every write queued so far has reached the store.
    pub async fn flush(&self) {
        let (done, flushed) = oneshot::channel();
        if self.writes.send(StoreWrite::Flush(done)).is_ok() {
            flushed.await.ok();
        }
    }

    /// Cancels the deadline without touching the record; used on shutdown.
    pub fn disarm(&self) {
        let handle = self.deadline.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn finish_unsuccessfully(
        &self,
        status: ExecutionStatus,
        reason: String,
    ) -> Option<ExecutionResult> {
        let mut state = self.state.lock().await;
        if let Err(error) = self.engine.transition(&mut state.record, status, Some(reason.clone()))
        {
            self.ignored_write(status.as_str(), &error);
            return None;
        }
        let result = ExecutionResult::from(&state.record);
        self.queue(StoreWrite::Finish { status, reason: reason.clone() });
        drop(state);

        self.disarm();
        self.outcome.send_replace(Some(result.clone()));
        warn!(
            event_name = "execution.failed",
            correlation_id = %self.execution_id,
            status = status.as_str(),
            reason = %reason,
            stages = result.stages.len(),
            "execution ended without completing"
        );
        Some(result)
    }

    /// Called with the state lock held so the queue follows transition order.
    fn queue(&self, write: StoreWrite) {
        if self.writes.send(write).is_err() {
            warn!(
                event_name = "execution.persist_failed",
                correlation_id = %self.execution_id,
                operation = "queue",
                "execution writer stopped; write dropped"
            );
        }
    }

    fn ignored_write(&self, operation: &str, error: &ExecutionError) {
        debug!(
            event_name = "execution.write_ignored",
            correlation_id = %self.execution_id,
            operation,
            error = %error,
            "ignoring write to finished execution"
        );
    }
}

async fn write_through(
    store: Arc<dyn ExecutionStore>,
    execution_id: ExecutionId,
    mut queued: mpsc::UnboundedReceiver<StoreWrite>,
) {
    while let Some(write) = queued.recv().await {
        let (operation, outcome) = match write {
            StoreWrite::Create(record) => ("create", store.create_execution(&record).await),
            StoreWrite::Status { status } => {
                ("update_status", store.update_status(&execution_id, status, None).await)
            }
            StoreWrite::Stage { stage, estimated_cost } => (
                "record_stage",
                store.record_stage(&execution_id, &stage, estimated_cost).await,
            ),
            StoreWrite::Complete(record) => ("complete", store.complete(&record).await),
            StoreWrite::Finish { status, reason } => {
                ("fail", store.fail(&execution_id, status, &reason).await)
            }
            StoreWrite::Flush(done) => {
                done.send(()).ok();
                continue;
            }
        };
        if let Err(error) = outcome {
            warn!(
                event_name = "execution.persist_failed",
                correlation_id = %execution_id,
                operation,
                error = %error,
                "execution store write failed"
            );
        }
    }
}

async fn expire_after(tracker: Weak<ExecutionTracker>, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(tracker) = tracker.upgrade() {
        tracker
            .mark_timeout(format!("execution exceeded {} ms", timeout.as_millis()))
            .await;
    }
}
