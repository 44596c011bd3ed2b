use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use leadflow_core::domain::message::AgentMessage;

use crate::agents::Agent;
use crate::runtime::AgentRuntime;

/// Starts the agent's mailbox task and returns its sender.
///
/// Messages are handled one at a time in arrival order. A failing handler
/// never stops the loop; if the message expected a response, an
/// `ErrorReport` is routed back to its sender instead.
pub fn spawn_mailbox(
    agent: Arc<dyn Agent>,
    runtime: AgentRuntime,
) -> (UnboundedSender<AgentMessage>, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<AgentMessage>();

    let handle = tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            debug!(
                event_name = "agent.message_received",
                correlation_id = %message.execution_id,
                agent = %runtime.agent(),
                message_id = %message.id,
                message_type = message.message_type().as_str(),
                "handling message"
            );

            let Err(error) = agent.handle_message(&runtime, &message).await else {
                continue;
            };
            warn!(
                event_name = "agent.handler_failed",
                correlation_id = %message.execution_id,
                agent = %runtime.agent(),
                message_id = %message.id,
                error = %error,
                "message handler failed"
            );

            if message.requires_response {
                let report = message.error_report(runtime.agent().clone(), error.to_string());
                if let Err(route_error) = runtime.send(report) {
                    warn!(
                        event_name = "agent.error_report_undeliverable",
                        correlation_id = %message.execution_id,
                        agent = %runtime.agent(),
                        to = %message.from,
                        error = %route_error,
                        "could not report handler failure"
                    );
                }
            }
        }
        debug!(event_name = "agent.mailbox_closed", agent = %runtime.agent(), "mailbox closed");
    });

    (sender, handle)
}
