//! Runs in flight, keyed by execution id.
//!
//! Each entry pairs the run's tracker with its `SharedContext`. Agents are
//! stateless between messages and look the run up from the execution id the
//! message carries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tracing::debug;

use leadflow_core::domain::context::SharedContext;
use leadflow_core::domain::execution::ExecutionId;

use crate::tracker::ExecutionTracker;

/// One run's mutable context. Writes are short and never span an await.
#[derive(Debug)]
pub struct ContextCell {
    inner: Mutex<SharedContext>,
}

impl ContextCell {
    pub fn new(context: SharedContext) -> Self {
        Self { inner: Mutex::new(context) }
    }

    pub fn snapshot(&self) -> SharedContext {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn update<T>(&self, apply: impl FnOnce(&mut SharedContext) -> T) -> T {
        let mut context = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut context)
    }
}

#[derive(Clone)]
pub struct ActiveRun {
    pub tracker: Arc<ExecutionTracker>,
    pub context: Arc<ContextCell>,
}

impl ActiveRun {
    pub fn new(tracker: Arc<ExecutionTracker>, context: SharedContext) -> Self {
        Self { tracker, context: Arc::new(ContextCell::new(context)) }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        self.tracker.execution_id()
    }
}

type RunMap = RwLock<HashMap<ExecutionId, ActiveRun>>;

pub struct ExecutionRegistry {
    runs: Arc<RunMap>,
    gc_delay: Duration,
}

impl ExecutionRegistry {
    pub fn new(gc_delay: Duration) -> Self {
        Self { runs: Arc::new(RwLock::new(HashMap::new())), gc_delay }
    }

    /// Adds a run and schedules its removal `gc_delay` after it finishes.
    pub fn insert(&self, run: ActiveRun) {
        let execution_id = run.execution_id().clone();
        let mut outcome = run.tracker.subscribe();
        let runs = Arc::downgrade(&self.runs);
        let tracker = Arc::downgrade(&run.tracker);
        let gc_delay = self.gc_delay;

        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution_id.clone(), run);

        tokio::spawn(async move {
            if outcome.wait_for(Option::is_some).await.is_err() {
                return;
            }
            tokio::time::sleep(gc_delay).await;
            collect(&runs, &execution_id, &tracker);
        });
    }

    pub fn get(&self, execution_id: &ExecutionId) -> Option<ActiveRun> {
        self.runs.read().unwrap_or_else(PoisonError::into_inner).get(execution_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.runs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn runs(&self) -> Vec<ActiveRun> {
        self.runs.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    /// Drops every run and cancels their deadlines.
    pub fn clear(&self) -> Vec<ActiveRun> {
        let drained: Vec<ActiveRun> = self
            .runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, run)| run)
            .collect();
        for run in &drained {
            run.tracker.disarm();
        }
        drained
    }
}

fn collect(runs: &Weak<RunMap>, execution_id: &ExecutionId, tracker: &Weak<ExecutionTracker>) {
    let Some(runs) = runs.upgrade() else {
        return;
    };
    let mut runs = runs.write().unwrap_or_else(PoisonError::into_inner);
    let same_run = runs
        .get(execution_id)
        .is_some_and(|run| std::ptr::eq(Arc::as_ptr(&run.tracker), tracker.as_ptr()));
    if same_run {
        runs.remove(execution_id);
        debug!(
            event_name = "execution.collected",
            correlation_id = %execution_id,
            "finished execution removed from registry"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use leadflow_core::domain::context::{ContextMetadata, LeadStage, SharedContext};
    use leadflow_core::domain::execution::ExecutionId;
    use leadflow_core::domain::lead::{LeadData, LeadId};
    use leadflow_core::execution_engine::ExecutionEngine;
    use leadflow_db::InMemoryExecutionStore;

    use super::{ActiveRun, ExecutionRegistry};
    use crate::tracker::ExecutionTracker;

    async fn run() -> ActiveRun {
        let execution_id = ExecutionId::generate();
        let tracker = ExecutionTracker::create(
            ExecutionEngine::new(),
            Arc::new(InMemoryExecutionStore::default()),
            execution_id.clone(),
            LeadId("L-1".to_string()),
            "default",
            Duration::from_secs(600),
        )
        .await;
        let context = SharedContext::new(
            LeadData::new(LeadId("L-1".to_string())),
            "Preciso de ajuda com meu contrato",
            ContextMetadata {
                channel: "web".to_string(),
                tenant_id: "default".to_string(),
                execution_id,
            },
        );
        ActiveRun::new(tracker, context)
    }

    #[tokio::test(start_paused = true)]
    async fn finished_runs_are_collected_after_the_grace_period() {
        let registry = ExecutionRegistry::new(Duration::from_secs(300));
        let run = run().await;
        let execution_id = run.execution_id().clone();
        registry.insert(run.clone());

        run.tracker.mark_processing().await;
        run.tracker.mark_completed().await.expect("completed");

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(registry.get(&execution_id).is_some(), "still inside grace period");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.get(&execution_id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn live_runs_are_kept() {
        let registry = ExecutionRegistry::new(Duration::from_secs(1));
        let run = run().await;
        let execution_id = run.execution_id().clone();
        registry.insert(run);

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(registry.get(&execution_id).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn context_updates_are_visible_through_every_handle() {
        let registry = ExecutionRegistry::new(Duration::from_secs(1));
        let run = run().await;
        let execution_id = run.execution_id().clone();
        registry.insert(run);

        let first = registry.get(&execution_id).expect("run");
        first.context.update(|context| context.advance_stage(LeadStage::Qualified)).expect("advance");

        let second = registry.get(&execution_id).expect("run");
        assert_eq!(second.context.snapshot().current_stage, LeadStage::Qualified);

        assert_eq!(registry.clear().len(), 1);
        assert!(registry.is_empty());
    }
}
