use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use leadflow_core::domain::message::{AgentId, AgentMessage};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),
    #[error("mailbox of agent {0} is closed")]
    MailboxClosed(AgentId),
}

/// Name-keyed mailboxes plus a bounded log of routed messages.
///
/// Routing never awaits: the message is logged, counted and queued on the
/// target mailbox, and the call returns.
pub struct Router {
    mailboxes: RwLock<HashMap<AgentId, UnboundedSender<AgentMessage>>>,
    history: Mutex<VecDeque<AgentMessage>>,
    history_capacity: usize,
    message_count: AtomicU64,
}

impl Router {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(history_capacity.min(1024))),
            history_capacity,
            message_count: AtomicU64::new(0),
        }
    }

    /// Returns the mailbox previously registered under the same id, if any.
    pub fn register(
        &self,
        agent: AgentId,
        mailbox: UnboundedSender<AgentMessage>,
    ) -> Option<UnboundedSender<AgentMessage>> {
        self.mailboxes.write().unwrap_or_else(PoisonError::into_inner).insert(agent, mailbox)
    }

    pub fn is_registered(&self, agent: &AgentId) -> bool {
        self.mailboxes.read().unwrap_or_else(PoisonError::into_inner).contains_key(agent)
    }

    pub fn agent_names(&self) -> Vec<AgentId> {
        let mut names: Vec<AgentId> =
            self.mailboxes.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn route_message(&self, message: AgentMessage) -> Result<(), RoutingError> {
        let mailbox = self
            .mailboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.to)
            .cloned()
            .ok_or_else(|| RoutingError::AgentNotFound(message.to.clone()))?;

        debug!(
            event_name = "router.message_routed",
            correlation_id = %message.execution_id,
            message_id = %message.id,
            from = %message.from,
            to = %message.to,
            message_type = message.message_type().as_str(),
            priority = message.priority.as_str(),
            "routing message"
        );

        self.remember(message.clone());
        self.message_count.fetch_add(1, Ordering::Relaxed);
        let target = message.to.clone();
        mailbox.send(message).map_err(|_| RoutingError::MailboxClosed(target))
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Routed messages, oldest first.
    pub fn history(&self) -> Vec<AgentMessage> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    /// Forgets every mailbox, the history and the counter.
    pub fn clear(&self) {
        self.mailboxes.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.message_count.store(0, Ordering::Relaxed);
    }

    fn remember(&self, message: AgentMessage) {
        if self.history_capacity == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(message);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use leadflow_core::domain::execution::ExecutionId;
    use leadflow_core::domain::message::{
        AgentId, AgentMessage, AgentRole, MessagePayload, MessagePriority, TaskKind,
    };

    use super::{Router, RoutingError};

    fn message(to: AgentId, index: u64) -> AgentMessage {
        AgentMessage::new(
            ExecutionId("exec-router".to_string()),
            AgentRole::Coordinator.id(),
            to,
            MessagePayload::task(TaskKind::Qualify, json!({"index": index})),
            MessagePriority::Medium,
        )
    }

    #[test]
    fn unknown_target_is_rejected_and_not_logged() {
        let router = Router::new(10);

        let error = router
            .route_message(message(AgentId::new("DoesNotExist"), 0))
            .expect_err("unregistered target");

        assert_eq!(error, RoutingError::AgentNotFound(AgentId::new("DoesNotExist")));
        assert_eq!(router.message_count(), 0);
        assert!(router.history().is_empty());
    }

    #[tokio::test]
    async fn messages_arrive_in_order_and_history_is_bounded() {
        let router = Router::new(3);
        let (sender, mut receiver) = mpsc::unbounded_channel();
        router.register(AgentRole::Qualifier.id(), sender);

        for index in 0..5 {
            router.route_message(message(AgentRole::Qualifier.id(), index)).expect("routed");
        }

        for expected in 0..5 {
            let received = receiver.recv().await.expect("message");
            match received.payload {
                MessagePayload::TaskRequest(body) => assert_eq!(body.data["index"], expected),
                other => panic!("unexpected payload {other:?}"),
            }
        }

        assert_eq!(router.message_count(), 5);
        let history = router.history();
        assert_eq!(history.len(), 3);
        match &history[0].payload {
            MessagePayload::TaskRequest(body) => assert_eq!(body.data["index"], 2),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn closed_mailbox_is_reported() {
        let router = Router::new(10);
        let (sender, receiver) = mpsc::unbounded_channel();
        router.register(AgentRole::Legal.id(), sender);
        drop(receiver);

        let error = router.route_message(message(AgentRole::Legal.id(), 0)).expect_err("closed");

        assert_eq!(error, RoutingError::MailboxClosed(AgentRole::Legal.id()));
    }

    #[test]
    fn clear_forgets_agents_and_history() {
        let router = Router::new(10);
        let (sender, _receiver) = mpsc::unbounded_channel();
        router.register(AgentRole::Analyst.id(), sender);
        router.route_message(message(AgentRole::Analyst.id(), 0)).expect("routed");

        router.clear();

        assert!(router.agent_names().is_empty());
        assert_eq!(router.message_count(), 0);
        assert!(router.history().is_empty());
    }
}
