//! Routing and delegation logic.
//!
//! The router is the sole owner of the registries. It drains the bus
//! mailbox one event at a time; handlers that never await mutate registry
//! state inline, so no locking is needed. The only suspending paths are the
//! ones that cross a connection boundary (agent-to-agent delegation), and
//! those run in spawned tasks that re-enter through the bus when they need
//! a registry transition applied.

mod delegation;
mod registration;
mod tasks;

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use switchboard_common::{Envelope, Payload, Result, SwitchboardError, TaskStatus};

use crate::bus::{Bus, BusEvent, Channel, ConnectionHandle, TaskOutcome};
use crate::config::OrchestratorConfig;
use crate::registry::{AgentRegistry, ServiceRegistry, ServiceTaskRegistry, TaskRegistry};

pub struct Router {
    config: OrchestratorConfig,
    bus: Bus,
    agents: AgentRegistry,
    services: ServiceRegistry,
    tasks: TaskRegistry,
    service_tasks: ServiceTaskRegistry,
    connections: HashMap<String, ConnectionHandle>,
}

impl Router {
    pub fn new(config: OrchestratorConfig, bus: Bus) -> Self {
        Self {
            config,
            bus,
            agents: AgentRegistry::new(),
            services: ServiceRegistry::new(),
            tasks: TaskRegistry::new(),
            service_tasks: ServiceTaskRegistry::new(),
            connections: HashMap::new(),
        }
    }

    /// Spawn the router loop on its own task.
    pub fn spawn(
        config: OrchestratorConfig,
        bus: Bus,
        rx: mpsc::UnboundedReceiver<BusEvent>,
    ) -> JoinHandle<()> {
        let router = Self::new(config, bus);
        tokio::spawn(router.run(rx))
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<BusEvent>) {
        info!("Router started");
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
        }
        info!("Router stopped");
    }

    fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Connected { handle } => {
                debug!(
                    channel = handle.channel.name(),
                    connection_id = %handle.id,
                    "Connection registered"
                );
                self.connections.insert(handle.id.clone(), handle);
            }
            BusEvent::Disconnected {
                channel,
                connection_id,
            } => self.handle_disconnect(channel, &connection_id),
            BusEvent::Inbound {
                channel,
                connection_id,
                envelope,
                payload,
            } => {
                if let Err(e) = self.handle_inbound(channel, &connection_id, &envelope, payload) {
                    self.reply_error(&connection_id, &envelope, &e);
                }
            }
            BusEvent::TaskFinished { task_id, outcome } => {
                self.handle_task_finished(&task_id, outcome)
            }
        }
    }

    fn handle_disconnect(&mut self, channel: Channel, connection_id: &str) {
        self.connections.remove(connection_id);
        for agent_id in self.agents.mark_offline_by_connection(connection_id) {
            info!(agent_id = %agent_id, "Agent marked offline after disconnect");
        }
        for service_id in self.services.mark_offline_by_connection(connection_id) {
            info!(service_id = %service_id, "Service marked offline after disconnect");
        }
        debug!(
            channel = channel.name(),
            connection_id = %connection_id,
            "Connection released"
        );
    }

    fn handle_inbound(
        &mut self,
        channel: Channel,
        connection_id: &str,
        envelope: &Envelope,
        payload: Payload,
    ) -> Result<()> {
        debug!(
            channel = channel.name(),
            connection_id = %connection_id,
            kind = %envelope.kind,
            id = %envelope.id,
            "Inbound message"
        );

        match payload {
            Payload::Ping(_) => self.handle_ping(connection_id, envelope),
            Payload::AgentRegister(content) => {
                self.handle_agent_register(connection_id, envelope, content)
            }
            Payload::ServiceRegister(content) => {
                self.handle_service_register(connection_id, envelope, content, false)
            }
            Payload::McpServerRegister(content) => {
                self.handle_service_register(connection_id, envelope, content, true)
            }
            Payload::ServiceStatusUpdate(content) => {
                self.handle_service_status_update(connection_id, content)
            }
            Payload::TaskCreate(content) => {
                self.handle_task_create(connection_id, envelope, content)
            }
            Payload::TaskStatus(content) => {
                self.handle_task_status(connection_id, envelope, content)
            }
            Payload::AgentList(content) => self.handle_agent_list(connection_id, envelope, content),
            Payload::McpServerList => self.handle_mcp_server_list(connection_id, envelope),
            Payload::TaskResult(content) => {
                self.handle_task_result(connection_id, envelope, content)
            }
            Payload::TaskError(content) => self.handle_task_error(connection_id, envelope, content),
            Payload::TaskNotification(content) => {
                self.handle_task_notification(connection_id, envelope, content)
            }
            Payload::AgentRequest(content) => {
                self.handle_agent_request(connection_id, envelope, content)
            }
            Payload::ServiceRequest(content) => {
                self.handle_service_request(connection_id, envelope, content)
            }
            Payload::ServiceTaskResult(content) => {
                self.handle_service_task_result(connection_id, envelope, content)
            }
            Payload::ServiceTaskNotification(content) => {
                self.handle_service_task_notification(connection_id, content)
            }
            Payload::ServiceError(content) => {
                self.handle_service_error(connection_id, envelope, content)
            }
            Payload::Custom { kind, .. } => {
                // Nothing consumes generic fallback messages today.
                warn!(
                    kind = %kind,
                    connection_id = %connection_id,
                    "Unconsumed custom message on service channel"
                );
                Ok(())
            }
            other => {
                warn!(kind = %other.kind(), "Unexpected payload reached the router");
                Err(SwitchboardError::Protocol(format!(
                    "unexpected message type '{}'",
                    other.kind()
                )))
            }
        }
    }

    // -----------------------------------------------------------------
    // Shared send helpers.
    // -----------------------------------------------------------------

    pub(crate) fn connection(&self, connection_id: &str) -> Option<&ConnectionHandle> {
        self.connections.get(connection_id)
    }

    /// Send a reply correlated to `request` back to its connection.
    pub(crate) fn reply(
        &self,
        connection_id: &str,
        request: &Envelope,
        payload: &Payload,
    ) -> Result<()> {
        let envelope = Envelope::reply_to(&request.id, payload)?;
        self.send_to(connection_id, envelope)
    }

    /// Send an `error` envelope referencing the offending request.
    pub(crate) fn reply_error(
        &self,
        connection_id: &str,
        request: &Envelope,
        error: &SwitchboardError,
    ) {
        debug!(
            connection_id = %connection_id,
            request_id = %request.id,
            error = %error,
            "Replying with error"
        );
        let envelope = Envelope::error_reply(Some(&request.id), error.to_string(), Some(error.code()));
        if self.send_to(connection_id, envelope).is_err() {
            debug!(connection_id = %connection_id, "Error reply dropped, connection gone");
        }
    }

    pub(crate) fn send_to(&self, connection_id: &str, envelope: Envelope) -> Result<()> {
        match self.connections.get(connection_id) {
            Some(handle) => handle.send(envelope),
            None => Err(SwitchboardError::ConnectionClosed),
        }
    }

    /// Resolve the connection that should receive messages for an entity id,
    /// falling back to treating the id as a raw connection id.
    pub(crate) fn connection_for_requester(&self, requester_id: &str) -> Option<&ConnectionHandle> {
        if let Some(agent) = self.agents.get(requester_id) {
            return self.connections.get(&agent.connection_id);
        }
        self.connections.get(requester_id)
    }

    /// The transition gatekeeps the merge: a task that is already terminal
    /// keeps its stored outcome untouched.
    fn handle_task_finished(&mut self, task_id: &str, outcome: TaskOutcome) {
        let (status, note) = match &outcome {
            TaskOutcome::Completed(_) => (TaskStatus::Completed, "delegate result received"),
            TaskOutcome::Failed(_) => (TaskStatus::Failed, "delegation failed"),
        };
        if let Err(e) = self.tasks.transition(task_id, status, Some(note.into()), None) {
            // Already terminal or removed; the audit trail stays as-is.
            debug!(task_id = %task_id, error = %e, "Task finish transition skipped");
            return;
        }
        let merged = match outcome {
            TaskOutcome::Completed(value) => self.tasks.merge_result(task_id, value),
            TaskOutcome::Failed(value) => self.tasks.merge_error(task_id, value),
        };
        if let Err(e) = merged {
            debug!(task_id = %task_id, error = %e, "Outcome merge skipped");
        }
    }
}
