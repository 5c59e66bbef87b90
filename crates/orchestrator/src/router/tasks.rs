//! Client task lifecycle, status queries, listings, and result fan-out.

use tracing::{debug, info};

use switchboard_common::{
    envelope::{
        AgentListRequest, AgentListResult, McpServerListResult, PingPong, TaskCreate, TaskCreated,
        TaskErrorContent, TaskExecute, TaskNotification, TaskResultContent, TaskStatusQuery,
        TaskStatusReport,
    },
    now_millis, Envelope, Payload, Result, ServiceKind, SwitchboardError, Task, TaskStatus,
};

use crate::registry::EntityFilter;

use super::Router;

impl Router {
    pub(super) fn handle_ping(&self, connection_id: &str, envelope: &Envelope) -> Result<()> {
        self.reply(
            connection_id,
            envelope,
            &Payload::Pong(PingPong {
                timestamp: Some(now_millis()),
            }),
        )
    }

    /// Client → agent task creation. Fails fast when the agent is unknown
    /// or offline; tasks are never queued for absent agents.
    pub(super) fn handle_task_create(
        &mut self,
        connection_id: &str,
        envelope: &Envelope,
        content: TaskCreate,
    ) -> Result<()> {
        if content.agent_name.trim().is_empty() {
            return Err(SwitchboardError::Validation(
                "task.create requires a non-empty 'agentName'".into(),
            ));
        }

        let (agent_id, agent_connection) = match self.agents.get_by_name(&content.agent_name) {
            Some(agent) if agent.status.is_online() => {
                (agent.id.clone(), agent.connection_id.clone())
            }
            _ => {
                return Err(SwitchboardError::NotFound(format!(
                    "agent '{}' not found or offline",
                    content.agent_name
                )))
            }
        };
        if self.connection(&agent_connection).is_none() {
            return Err(SwitchboardError::NotFound(format!(
                "agent '{}' has no live connection",
                content.agent_name
            )));
        }

        let task_type = content.task_type.unwrap_or_else(|| "task".to_string());
        let mut task = Task::new(&task_type).with_client(connection_id);
        if let Some(name) = content.name {
            task = task.with_name(name);
        }
        if let Some(metadata) = content.metadata.clone() {
            task.merge_metadata(metadata);
        }
        let task_id = task.id.clone();

        self.tasks.insert(task)?;
        self.tasks.assign(&task_id, &agent_id)?;

        // The execute envelope carries the task id so the agent's reply can
        // reference it as requestId.
        let execute = Envelope::with_id(
            task_id.clone(),
            &Payload::TaskExecute(TaskExecute {
                task_id: task_id.clone(),
                task_type,
                input: content.task_data,
                metadata: content.metadata,
            }),
        )?;
        self.send_to(&agent_connection, execute)?;

        info!(
            task_id = %task_id,
            agent_id = %agent_id,
            client = %connection_id,
            "Task created and forwarded"
        );
        self.reply(
            connection_id,
            envelope,
            &Payload::TaskCreated(TaskCreated {
                task_id,
                message: Some(format!("task assigned to '{}'", content.agent_name)),
            }),
        )
    }

    pub(super) fn handle_task_result(
        &mut self,
        connection_id: &str,
        envelope: &Envelope,
        content: TaskResultContent,
    ) -> Result<()> {
        let task_id = content
            .task_id
            .clone()
            .or_else(|| envelope.request_id.clone())
            .ok_or_else(|| {
                SwitchboardError::Validation(
                    "task.result requires 'taskId' or a requestId".into(),
                )
            })?;

        let agent_id = self
            .agents
            .get_by_connection(connection_id)
            .map(|a| a.id.clone());
        // Transition first: once a task is terminal its stored result is
        // authoritative, and a late duplicate must not overwrite it.
        self.tasks.transition(
            &task_id,
            TaskStatus::Completed,
            Some("result received".into()),
            agent_id.as_deref(),
        )?;
        self.tasks.merge_result(&task_id, content.result.clone())?;
        info!(task_id = %task_id, "Task completed");

        self.forward_to_task_client(
            &task_id,
            Payload::TaskResult(TaskResultContent {
                task_id: Some(task_id.clone()),
                result: content.result,
            }),
        );
        Ok(())
    }

    pub(super) fn handle_task_error(
        &mut self,
        connection_id: &str,
        envelope: &Envelope,
        content: TaskErrorContent,
    ) -> Result<()> {
        let task_id = content
            .task_id
            .clone()
            .or_else(|| envelope.request_id.clone())
            .ok_or_else(|| {
                SwitchboardError::Validation("task.error requires 'taskId' or a requestId".into())
            })?;

        let agent_id = self
            .agents
            .get_by_connection(connection_id)
            .map(|a| a.id.clone());
        // Same ordering as task.result: reject late duplicates before any
        // merge can touch the stored error.
        self.tasks.transition(
            &task_id,
            TaskStatus::Failed,
            Some("error received".into()),
            agent_id.as_deref(),
        )?;
        self.tasks.merge_error(&task_id, content.error.clone())?;
        info!(task_id = %task_id, "Task failed");

        self.forward_to_task_client(
            &task_id,
            Payload::TaskError(TaskErrorContent {
                task_id: Some(task_id.clone()),
                error: content.error,
            }),
        );
        Ok(())
    }

    pub(super) fn handle_task_notification(
        &mut self,
        _connection_id: &str,
        _envelope: &Envelope,
        content: TaskNotification,
    ) -> Result<()> {
        let task_id = content.task_id.clone();
        // First sign of life from the agent moves the task to in_progress.
        if self.tasks.get(&task_id).map(|t| t.status) == Some(TaskStatus::Assigned) {
            self.tasks.transition(
                &task_id,
                TaskStatus::InProgress,
                Some("notification received".into()),
                None,
            )?;
        }
        self.forward_to_task_client(&task_id, Payload::TaskNotification(content));
        Ok(())
    }

    /// Unknown task ids yield an error reply, never a hang.
    pub(super) fn handle_task_status(
        &self,
        connection_id: &str,
        envelope: &Envelope,
        content: TaskStatusQuery,
    ) -> Result<()> {
        let task = self
            .tasks
            .get(&content.task_id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("task '{}'", content.task_id)))?;

        self.reply(
            connection_id,
            envelope,
            &Payload::TaskStatusResult(TaskStatusReport {
                task_id: task.id.clone(),
                status: task.status,
                result: task.result.clone(),
                error: task.error.clone(),
            }),
        )
    }

    pub(super) fn handle_agent_list(
        &self,
        connection_id: &str,
        envelope: &Envelope,
        content: AgentListRequest,
    ) -> Result<()> {
        let filter = EntityFilter {
            status: content.status,
            capabilities: content.capabilities,
        };
        let agents = self.agents.list(&filter);
        self.reply(
            connection_id,
            envelope,
            &Payload::AgentListResult(AgentListResult { agents }),
        )
    }

    pub(super) fn handle_mcp_server_list(
        &self,
        connection_id: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        let servers = self
            .services
            .list_by_kind(ServiceKind::Mcp, &EntityFilter::default());
        self.reply(
            connection_id,
            envelope,
            &Payload::McpServerListResult(McpServerListResult { servers }),
        )
    }

    /// Push a terminal result or notification to the originating client.
    /// A disconnected client is not an error: the outcome stays in the
    /// registry for a later `task.status` poll, and nothing is retried.
    fn forward_to_task_client(&self, task_id: &str, payload: Payload) {
        let Some(client_id) = self.tasks.get(task_id).and_then(|t| t.client_id.clone()) else {
            return;
        };
        let forwarded = match Envelope::reply_to(task_id, &payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Failed to build forwarded envelope");
                return;
            }
        };
        match self.send_to(&client_id, forwarded) {
            Ok(()) => debug!(task_id = %task_id, client = %client_id, "Forwarded to client"),
            Err(_) => debug!(
                task_id = %task_id,
                client = %client_id,
                "Client disconnected; outcome retained for task.status"
            ),
        }
    }
}
