//! Registration handlers for agents, services, and MCP servers.

use tracing::info;

use switchboard_common::{
    envelope::{
        AgentRegister, AgentRegistered, McpServerRegistered, ServiceRegister, ServiceRegistered,
        ServiceStatusUpdate,
    },
    Agent, Envelope, EntityStatus, Payload, Result, Service, ServiceKind, SwitchboardError,
};

use super::Router;

impl Router {
    pub(super) fn handle_agent_register(
        &mut self,
        connection_id: &str,
        envelope: &Envelope,
        content: AgentRegister,
    ) -> Result<()> {
        if content.name.trim().is_empty() {
            return Err(SwitchboardError::Validation(
                "agent registration requires a non-empty 'name'".into(),
            ));
        }
        if let Some(id) = &content.id {
            // The same id may not be registered as a different entity kind.
            if self.services.get(id).is_some() {
                return Err(SwitchboardError::Registry(format!(
                    "id '{id}' is already registered as a service"
                )));
            }
        }

        let mut agent = Agent::new(&content.name, content.capabilities, connection_id);
        if let Some(id) = content.id {
            agent.id = id;
        }
        agent.status = EntityStatus::Online;

        let agent_id = agent.id.clone();
        let name = agent.name.clone();
        let superseded = self.agents.upsert(agent);
        for old_id in &superseded {
            info!(
                name = %name,
                old_id = %old_id,
                new_id = %agent_id,
                "Agent registration superseded"
            );
        }
        info!(agent_id = %agent_id, name = %name, connection_id = %connection_id, "Agent registered");

        self.reply(
            connection_id,
            envelope,
            &Payload::AgentRegistered(AgentRegistered {
                agent_id,
                name,
                message: "registered".into(),
            }),
        )
    }

    pub(super) fn handle_service_register(
        &mut self,
        connection_id: &str,
        envelope: &Envelope,
        content: ServiceRegister,
        mcp: bool,
    ) -> Result<()> {
        if content.name.trim().is_empty() {
            return Err(SwitchboardError::Validation(
                "service registration requires a non-empty 'name'".into(),
            ));
        }
        if let Some(id) = &content.id {
            if self.agents.get(id).is_some() {
                return Err(SwitchboardError::Registry(format!(
                    "id '{id}' is already registered as an agent"
                )));
            }
        }

        let kind = if mcp {
            ServiceKind::Mcp
        } else {
            ServiceKind::Backend
        };
        let mut service = Service::new(&content.name, content.capabilities, connection_id, kind);
        if let Some(id) = content.id {
            service.id = id;
        }

        let service_id = service.id.clone();
        let name = service.name.clone();
        let superseded = self.services.upsert(service);
        for old_id in &superseded {
            info!(
                name = %name,
                old_id = %old_id,
                new_id = %service_id,
                "Service registration superseded"
            );
        }
        info!(
            service_id = %service_id,
            name = %name,
            kind = ?kind,
            connection_id = %connection_id,
            "Service registered"
        );

        let payload = if mcp {
            Payload::McpServerRegistered(McpServerRegistered { service_id, name })
        } else {
            Payload::ServiceRegistered(ServiceRegistered {
                service_id,
                name,
                message: "registered".into(),
            })
        };
        self.reply(connection_id, envelope, &payload)
    }

    pub(super) fn handle_service_status_update(
        &mut self,
        connection_id: &str,
        content: ServiceStatusUpdate,
    ) -> Result<()> {
        let service_id = match content.service_id {
            Some(id) => id,
            None => self
                .services
                .get_by_connection(connection_id)
                .map(|s| s.id.clone())
                .ok_or_else(|| {
                    SwitchboardError::NotFound(format!(
                        "no service registered on connection '{connection_id}'"
                    ))
                })?,
        };
        self.services.set_status(&service_id, content.status)?;
        info!(service_id = %service_id, status = ?content.status, "Service status updated");
        Ok(())
    }
}
