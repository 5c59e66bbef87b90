//! Agent and service entity records.

use serde::{Deserialize, Serialize};

/// Online state of a registered agent or service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Online,
    Offline,
    Busy,
    Error,
    Initializing,
}

impl EntityStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online | Self::Busy | Self::Initializing)
    }
}

/// What kind of backend a service record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Backend,
    Mcp,
}

/// Common accessors shared by [`Agent`] and [`Service`] so one registry
/// implementation can manage both.
pub trait Entity: Clone {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn status(&self) -> EntityStatus;
    fn set_status(&mut self, status: EntityStatus);
    fn connection_id(&self) -> &str;
    fn capabilities(&self) -> &[String];

    /// True when every requested capability is present (conjunction).
    fn has_all_capabilities(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|cap| self.capabilities().iter().any(|c| c == cap))
    }
}

/// A registered agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: EntityStatus,
    pub connection_id: String,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        capabilities: Vec<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("agent_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            capabilities,
            status: EntityStatus::Online,
            connection_id: connection_id.into(),
        }
    }
}

impl Entity for Agent {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn status(&self) -> EntityStatus {
        self.status
    }
    fn set_status(&mut self, status: EntityStatus) {
        self.status = status;
    }
    fn connection_id(&self) -> &str {
        &self.connection_id
    }
    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }
}

/// A registered backend service (including MCP tool servers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: EntityStatus,
    pub connection_id: String,
    pub kind: ServiceKind,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        capabilities: Vec<String>,
        connection_id: impl Into<String>,
        kind: ServiceKind,
    ) -> Self {
        Self {
            id: format!("service_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            capabilities,
            status: EntityStatus::Online,
            connection_id: connection_id.into(),
            kind,
        }
    }
}

impl Entity for Service {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn status(&self) -> EntityStatus {
        self.status
    }
    fn set_status(&mut self, status: EntityStatus) {
        self.status = status;
    }
    fn connection_id(&self) -> &str {
        &self.connection_id
    }
    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_check_is_conjunctive() {
        let agent = Agent::new("worker", vec!["a".into(), "b".into()], "conn-1");

        assert!(agent.has_all_capabilities(&[]));
        assert!(agent.has_all_capabilities(&["a".into()]));
        assert!(agent.has_all_capabilities(&["a".into(), "b".into()]));
        // {a, c} requested but only {a, b} held: excluded
        assert!(!agent.has_all_capabilities(&["a".into(), "c".into()]));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&EntityStatus::Initializing).unwrap(),
            "\"initializing\""
        );
    }

    #[test]
    fn test_unique_entity_ids() {
        let a = Agent::new("x", vec![], "c1");
        let b = Agent::new("x", vec![], "c2");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("agent_"));
    }
}
