//! Agent-to-agent delegation and service task dispatch.
//!
//! Delegation chains two independent correlation lifetimes: the requester's
//! wait on its `agent.request`, and the orchestrator's nested wait on the
//! delegate's eventual reply. The delegate generates its own task id, so the
//! nested wait matches by response type (any-id mode) rather than by a
//! shared id. If the outer wait times out, the inner pending entries are
//! cancelled too; nothing may leak.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use switchboard_common::{
    envelope::{
        AgentRequest, ServiceErrorContent, ServiceRequest, ServiceTaskExecute,
        ServiceTaskNotification, ServiceTaskResult, TaskCreated, TaskExecute, TaskResultContent,
    },
    CorrelationKey, Envelope, MatchBy, Payload, Result, ServiceTask, SwitchboardError, Task,
    TaskStatus,
};

use crate::bus::{Bus, BusEvent, ConnectionHandle, TaskOutcome};

use super::Router;

impl Router {
    pub(super) fn handle_agent_request(
        &mut self,
        connection_id: &str,
        envelope: &Envelope,
        content: AgentRequest,
    ) -> Result<()> {
        if content.target_agent.trim().is_empty() {
            return Err(SwitchboardError::Validation(
                "agent.request requires a non-empty 'targetAgent'".into(),
            ));
        }

        let requester = self
            .connection(connection_id)
            .cloned()
            .ok_or(SwitchboardError::ConnectionClosed)?;
        let requester_id = self
            .agents
            .get_by_connection(connection_id)
            .map(|a| a.id.clone())
            .unwrap_or_else(|| connection_id.to_string());

        let (target_id, target_connection_id) =
            match self.agents.get_by_name(&content.target_agent) {
                Some(agent) if agent.status.is_online() => {
                    (agent.id.clone(), agent.connection_id.clone())
                }
                _ => {
                    return Err(SwitchboardError::Delegation {
                        target: content.target_agent.clone(),
                        message: "agent not found or offline".into(),
                    })
                }
            };
        let target = self
            .connection(&target_connection_id)
            .cloned()
            .ok_or_else(|| SwitchboardError::Delegation {
                target: content.target_agent.clone(),
                message: "agent has no live connection".into(),
            })?;

        let task = Task::new("delegation").with_requester(requester_id);
        let task_id = task.id.clone();
        self.tasks.insert(task)?;
        self.tasks.assign(&task_id, &target_id)?;

        let timeout = content
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.task_timeout());

        info!(
            task_id = %task_id,
            target = %content.target_agent,
            requester = %connection_id,
            "Delegating task"
        );

        let delegation = Delegation {
            task_id: task_id.clone(),
            target_name: content.target_agent,
            task_data: content.task_data,
        };
        let bus = self.bus.clone();
        let request_id = envelope.id.clone();
        tokio::spawn(async move {
            delegation.run(bus, requester, target, request_id, timeout).await;
        });
        Ok(())
    }

    /// Dispatch a function call to a backend service. Symmetric to client
    /// task creation, but against the service registries, with an optional
    /// notification subscription.
    pub(super) fn handle_service_request(
        &mut self,
        connection_id: &str,
        envelope: &Envelope,
        content: ServiceRequest,
    ) -> Result<()> {
        let service = match (&content.service_id, &content.service_name) {
            (Some(id), _) => self.services.get(id),
            (None, Some(name)) => self.services.get_by_name(name),
            (None, None) => {
                return Err(SwitchboardError::Validation(
                    "service.request requires 'serviceId' or 'serviceName'".into(),
                ))
            }
        };
        let (service_id, service_connection) = match service {
            Some(service) if service.status.is_online() => {
                (service.id.clone(), service.connection_id.clone())
            }
            _ => {
                let wanted = content
                    .service_id
                    .or(content.service_name)
                    .unwrap_or_default();
                return Err(SwitchboardError::NotFound(format!(
                    "service '{wanted}' not found or offline"
                )));
            }
        };
        if self.connection(&service_connection).is_none() {
            return Err(SwitchboardError::NotFound(format!(
                "service '{service_id}' has no live connection"
            )));
        }

        let requester_id = self
            .agents
            .get_by_connection(connection_id)
            .map(|a| a.id.clone())
            .unwrap_or_else(|| connection_id.to_string());

        let task = ServiceTask::new(&service_id, &content.function_name, content.params.clone())
            .with_requester(requester_id)
            .with_notifications(content.subscribe_notifications);
        let task_id = task.id.clone();
        self.service_tasks.insert(task)?;
        self.service_tasks.transition(&task_id, TaskStatus::Assigned)?;

        let execute = Envelope::with_id(
            task_id.clone(),
            &Payload::ServiceTaskExecute(ServiceTaskExecute {
                task_id: task_id.clone(),
                service_id: service_id.clone(),
                function_name: content.function_name,
                params: content.params,
            }),
        )?;
        self.send_to(&service_connection, execute)?;

        info!(
            task_id = %task_id,
            service_id = %service_id,
            requester = %connection_id,
            "Service task dispatched"
        );
        self.reply(
            connection_id,
            envelope,
            &Payload::TaskCreated(TaskCreated {
                task_id,
                message: Some("service task dispatched".into()),
            }),
        )
    }

    pub(super) fn handle_service_task_result(
        &mut self,
        _connection_id: &str,
        _envelope: &Envelope,
        content: ServiceTaskResult,
    ) -> Result<()> {
        let task_id = content.task_id.clone();
        self.service_tasks.complete(&task_id, content.result.clone())?;
        info!(task_id = %task_id, "Service task completed");

        self.forward_to_service_requester(
            &task_id,
            Payload::ServiceTaskResult(content),
        );
        Ok(())
    }

    pub(super) fn handle_service_error(
        &mut self,
        connection_id: &str,
        envelope: &Envelope,
        content: ServiceErrorContent,
    ) -> Result<()> {
        let task_id = content.task_id.clone().or_else(|| envelope.request_id.clone());
        let Some(task_id) = task_id else {
            // Service-level error not tied to a task.
            warn!(
                connection_id = %connection_id,
                message = %content.error.message,
                "Service reported an error"
            );
            return Ok(());
        };

        self.service_tasks.fail(&task_id, content.error.clone())?;
        info!(task_id = %task_id, "Service task failed");

        self.forward_to_service_requester(
            &task_id,
            Payload::ServiceError(ServiceErrorContent {
                task_id: Some(task_id.clone()),
                error: content.error,
            }),
        );
        Ok(())
    }

    /// Progress events stream to the requester only while a subscription is
    /// active; terminal status auto-unsubscribes, so late notifications are
    /// dropped. The terminal result stays authoritative.
    pub(super) fn handle_service_task_notification(
        &mut self,
        _connection_id: &str,
        content: ServiceTaskNotification,
    ) -> Result<()> {
        let Some(task) = self.service_tasks.get(&content.task_id) else {
            warn!(task_id = %content.task_id, "Notification for unknown service task dropped");
            return Ok(());
        };
        if !task.subscribe_notifications {
            return Ok(());
        }
        if task.status.is_terminal() {
            debug!(task_id = %content.task_id, "Late notification after terminal status dropped");
            return Ok(());
        }
        if task.status == TaskStatus::Assigned {
            self.service_tasks
                .transition(&content.task_id, TaskStatus::InProgress)?;
        }
        let task_id = content.task_id.clone();
        self.forward_to_service_requester(&task_id, Payload::ServiceTaskNotification(content));
        Ok(())
    }

    fn forward_to_service_requester(&self, task_id: &str, payload: Payload) {
        let Some(task) = self.service_tasks.get(task_id) else {
            return;
        };
        let Some(requester_id) = task.requester_id.clone() else {
            return;
        };
        let Some(handle) = self.connection_for_requester(&requester_id) else {
            debug!(
                task_id = %task_id,
                requester = %requester_id,
                "Requester disconnected; outcome retained"
            );
            return;
        };
        match Envelope::reply_to(task_id, &payload) {
            Ok(envelope) => {
                let _ = handle.send(envelope);
            }
            Err(e) => debug!(task_id = %task_id, error = %e, "Failed to build forwarded envelope"),
        }
    }
}

/// Outcome of one agent-to-agent delegation.
enum DelegationState {
    Resolved(Value),
    Failed(SwitchboardError),
}

struct Delegation {
    task_id: String,
    target_name: String,
    task_data: Value,
}

impl Delegation {
    /// Drive the nested wait and relay the outcome to the requester. The
    /// registry transition is applied by the router via a bus event.
    async fn run(
        self,
        bus: Bus,
        requester: ConnectionHandle,
        target: ConnectionHandle,
        request_id: String,
        timeout: Duration,
    ) {
        let state = self.await_delegate(&target, timeout).await;

        match state {
            DelegationState::Resolved(result) => {
                let payload = Payload::TaskResult(TaskResultContent {
                    task_id: Some(self.task_id.clone()),
                    result: result.clone(),
                });
                match Envelope::reply_to(&request_id, &payload) {
                    Ok(envelope) => {
                        let _ = requester.send(envelope);
                    }
                    Err(e) => warn!(error = %e, "Failed to build delegation reply"),
                }
                bus.publish(BusEvent::TaskFinished {
                    task_id: self.task_id,
                    outcome: TaskOutcome::Completed(result),
                });
            }
            DelegationState::Failed(error) => {
                info!(
                    task_id = %self.task_id,
                    target = %self.target_name,
                    error = %error,
                    "Delegation failed"
                );
                let envelope = Envelope::error_reply(
                    Some(&request_id),
                    error.to_string(),
                    Some(error.code()),
                );
                let _ = requester.send(envelope);
                bus.publish(BusEvent::TaskFinished {
                    task_id: self.task_id,
                    outcome: TaskOutcome::Failed(json!({
                        "message": error.to_string(),
                        "hop": self.target_name,
                    })),
                });
            }
        }
    }

    /// Send `task.execute` to the delegate and wait for its `task.result`
    /// or `task.error`, matched by type since the delegate tags the reply
    /// with its own task id. Both pending entries are removed on every exit
    /// path, including the outer timeout.
    async fn await_delegate(
        &self,
        target: &ConnectionHandle,
        timeout: Duration,
    ) -> DelegationState {
        let execute = match Envelope::with_id(
            self.task_id.clone(),
            &Payload::TaskExecute(TaskExecute {
                task_id: self.task_id.clone(),
                task_type: "delegation".into(),
                input: self.task_data.clone(),
                metadata: None,
            }),
        ) {
            Ok(envelope) => envelope,
            Err(e) => return DelegationState::Failed(e),
        };

        let correlations = target.correlations().clone();
        let result_key = CorrelationKey::Kind("task.result".into());
        let error_key = CorrelationKey::Kind("task.error".into());

        let result_rx = match correlations.register(
            &execute,
            &MatchBy::Kind {
                kind: "task.result".into(),
                any_id: true,
            },
            &target.id,
        ) {
            Ok(rx) => rx,
            Err(e) => return DelegationState::Failed(self.tag(e)),
        };
        let error_rx = match correlations.register(
            &execute,
            &MatchBy::Kind {
                kind: "task.error".into(),
                any_id: true,
            },
            &target.id,
        ) {
            Ok(rx) => rx,
            Err(e) => {
                correlations.remove(&result_key);
                return DelegationState::Failed(self.tag(e));
            }
        };

        if let Err(e) = target.send(execute) {
            correlations.remove(&result_key);
            correlations.remove(&error_key);
            return DelegationState::Failed(self.tag(e));
        }

        let waited = tokio::time::timeout(timeout, async {
            tokio::select! {
                reply = result_rx => reply.map(DelegateReply::Result),
                reply = error_rx => reply.map(DelegateReply::Error),
            }
        })
        .await;

        // Cancel-the-inner-on-outer-timeout: whichever entry did not fire
        // must not outlive this wait.
        correlations.remove(&result_key);
        correlations.remove(&error_key);

        match waited {
            Err(_) => DelegationState::Failed(SwitchboardError::Delegation {
                target: self.target_name.clone(),
                message: format!("no response within {timeout:?}"),
            }),
            Ok(Err(_)) => DelegationState::Failed(self.tag(SwitchboardError::ConnectionClosed)),
            Ok(Ok(DelegateReply::Result(envelope))) => match envelope.payload() {
                Ok(Payload::TaskResult(content)) => DelegationState::Resolved(content.result),
                Ok(_) | Err(_) => DelegationState::Resolved(envelope.content),
            },
            Ok(Ok(DelegateReply::Error(envelope))) => {
                let message = envelope
                    .content
                    .get("error")
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "delegate reported an error".to_string());
                DelegationState::Failed(SwitchboardError::Delegation {
                    target: self.target_name.clone(),
                    message,
                })
            }
        }
    }

    /// Tag transport failures with the hop that produced them.
    fn tag(&self, error: SwitchboardError) -> SwitchboardError {
        SwitchboardError::Delegation {
            target: self.target_name.clone(),
            message: error.to_string(),
        }
    }
}

enum DelegateReply {
    Result(Envelope),
    Error(Envelope),
}
