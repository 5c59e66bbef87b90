//! The wire envelope and its typed payloads.
//!
//! Every frame exchanged on a Switchboard connection is one JSON object:
//!
//! ```json
//! { "id": "...", "type": "agent.register", "timestamp": 1700000000000,
//!   "requestId": "...", "content": { ... } }
//! ```
//!
//! Parsing is two-step: the raw [`Envelope`] keeps `content` as an untyped
//! value so that a malformed or unknown `type` can still be answered with an
//! `error` envelope referencing the offending message id, and
//! [`Payload::from_parts`] is the single point where content is validated
//! into a typed variant.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::entity::{Agent, EntityStatus, Service};
use crate::error::{Result, SwitchboardError};
use crate::task::{ServiceTaskError, TaskStatus};

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A single message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message ID
    pub id: String,

    /// Dot-namespaced message type, e.g. `"agent.register"`
    #[serde(rename = "type")]
    pub kind: String,

    /// Unix millis; tolerant of string-encoded numbers on input
    #[serde(deserialize_with = "de_timestamp")]
    pub timestamp: u64,

    /// ID of the request this message responds to
    #[serde(
        rename = "requestId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<String>,

    /// Untyped payload; validated via [`Payload::from_parts`]
    #[serde(default)]
    pub content: Value,
}

/// Accepts either a JSON number or a numeric string for `timestamp`.
fn de_timestamp<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    match NumberOrString::deserialize(de)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl Envelope {
    /// Build an envelope with a fresh unique id.
    pub fn new(payload: &Payload) -> Result<Self> {
        Self::with_id(format!("msg_{}", uuid::Uuid::new_v4()), payload)
    }

    /// Build an envelope with a caller-supplied id. The id is never
    /// overwritten downstream.
    pub fn with_id(id: impl Into<String>, payload: &Payload) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            kind: payload.kind().to_string(),
            timestamp: now_millis(),
            request_id: None,
            content: payload.to_content()?,
        })
    }

    /// Build a reply to the message with the given id.
    pub fn reply_to(request_id: impl Into<String>, payload: &Payload) -> Result<Self> {
        let mut env = Self::new(payload)?;
        env.request_id = Some(request_id.into());
        Ok(env)
    }

    /// Build an `error` envelope. `request_id` references the offending
    /// message when one is known.
    pub fn error_reply(
        request_id: Option<&str>,
        message: impl Into<String>,
        code: Option<&str>,
    ) -> Self {
        let content = ErrorContent {
            message: message.into(),
            code: code.map(str::to_string),
        };
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            kind: "error".to_string(),
            timestamp: now_millis(),
            request_id: request_id.map(str::to_string),
            content: serde_json::to_value(&content).unwrap_or(Value::Null),
        }
    }

    /// Validate the untyped content into a typed payload.
    pub fn payload(&self) -> Result<Payload> {
        Payload::from_parts(&self.kind, self.content.clone()).map_err(|e| match e {
            SwitchboardError::UnsupportedType { kind, .. } => SwitchboardError::UnsupportedType {
                id: self.id.clone(),
                kind,
            },
            other => other,
        })
    }
}

// ---------------------------------------------------------------------------
// Content types, one struct per wire message.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegister {
    /// Entity id, assigned by the orchestrator when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistered {
    pub agent_id: String,
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub target_agent: String,
    #[serde(default)]
    pub task_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentListRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EntityStatus>,
    /// Conjunctive capability filter: every listed capability must be present
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentListResult {
    pub agents: Vec<Agent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreate {
    pub agent_name: String,
    #[serde(default)]
    pub task_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreated {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusQuery {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusReport {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecute {
    pub task_id: String,
    pub task_type: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultContent {
    /// Task id; the envelope `requestId` is consulted when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskErrorContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub error: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNotification {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegister {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistered {
    pub service_id: String,
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub status: EntityStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub function_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub subscribe_notifications: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTaskExecute {
    pub task_id: String,
    pub service_id: String,
    pub function_name: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTaskResult {
    pub task_id: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTaskNotification {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceErrorContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub error: ServiceTaskError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerListResult {
    pub servers: Vec<Service>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerRegistered {
    pub service_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPong {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub connection_id: String,
    pub channel: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

// ---------------------------------------------------------------------------
// The tagged union over all message types.
// ---------------------------------------------------------------------------

/// Typed view of an envelope's `(type, content)` pair.
#[derive(Debug, Clone)]
pub enum Payload {
    AgentRegister(AgentRegister),
    AgentRegistered(AgentRegistered),
    AgentRequest(AgentRequest),
    AgentList(AgentListRequest),
    AgentListResult(AgentListResult),
    TaskCreate(TaskCreate),
    TaskCreated(TaskCreated),
    TaskStatus(TaskStatusQuery),
    TaskStatusResult(TaskStatusReport),
    TaskExecute(TaskExecute),
    TaskResult(TaskResultContent),
    TaskError(TaskErrorContent),
    TaskNotification(TaskNotification),
    ServiceRegister(ServiceRegister),
    ServiceRegistered(ServiceRegistered),
    ServiceStatusUpdate(ServiceStatusUpdate),
    ServiceRequest(ServiceRequest),
    ServiceTaskExecute(ServiceTaskExecute),
    ServiceTaskResult(ServiceTaskResult),
    ServiceTaskNotification(ServiceTaskNotification),
    ServiceError(ServiceErrorContent),
    McpServerList,
    McpServerListResult(McpServerListResult),
    McpServerRegister(ServiceRegister),
    McpServerRegistered(McpServerRegistered),
    Ping(PingPong),
    Pong(PingPong),
    Welcome(Welcome),
    Error(ErrorContent),
    /// Escape hatch for the service channel's generic fallback; never
    /// produced by [`Payload::from_parts`].
    Custom { kind: String, content: Value },
}

impl Payload {
    /// The wire `type` tag for this payload.
    pub fn kind(&self) -> &str {
        match self {
            Self::AgentRegister(_) => "agent.register",
            Self::AgentRegistered(_) => "agent.registered",
            Self::AgentRequest(_) => "agent.request",
            Self::AgentList(_) => "agent.list",
            Self::AgentListResult(_) => "agent.list.result",
            Self::TaskCreate(_) => "task.create",
            Self::TaskCreated(_) => "task.created",
            Self::TaskStatus(_) => "task.status",
            Self::TaskStatusResult(_) => "task.status.result",
            Self::TaskExecute(_) => "task.execute",
            Self::TaskResult(_) => "task.result",
            Self::TaskError(_) => "task.error",
            Self::TaskNotification(_) => "task.notification",
            Self::ServiceRegister(_) => "service.register",
            Self::ServiceRegistered(_) => "service.registered",
            Self::ServiceStatusUpdate(_) => "service.status.update",
            Self::ServiceRequest(_) => "service.request",
            Self::ServiceTaskExecute(_) => "service.task.execute",
            Self::ServiceTaskResult(_) => "service.task.result",
            Self::ServiceTaskNotification(_) => "service.task.notification",
            Self::ServiceError(_) => "service.error",
            Self::McpServerList => "mcp.server.list",
            Self::McpServerListResult(_) => "mcp.server.list.result",
            Self::McpServerRegister(_) => "mcp.server.register",
            Self::McpServerRegistered(_) => "mcp.server.registered",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Welcome(_) => "welcome",
            Self::Error(_) => "error",
            Self::Custom { kind, .. } => kind,
        }
    }

    /// Validate `(type, content)` into a typed payload.
    ///
    /// Unknown types fail with [`SwitchboardError::UnsupportedType`]; a
    /// well-known type with malformed content fails with
    /// [`SwitchboardError::Validation`].
    pub fn from_parts(kind: &str, content: Value) -> Result<Self> {
        fn parse<T: serde::de::DeserializeOwned>(kind: &str, content: Value) -> Result<T> {
            serde_json::from_value(content).map_err(|e| {
                SwitchboardError::Validation(format!("invalid content for '{kind}': {e}"))
            })
        }

        Ok(match kind {
            "agent.register" => Self::AgentRegister(parse(kind, content)?),
            "agent.registered" => Self::AgentRegistered(parse(kind, content)?),
            "agent.request" => Self::AgentRequest(parse(kind, content)?),
            "agent.list" => Self::AgentList(parse(kind, content)?),
            "agent.list.result" => Self::AgentListResult(parse(kind, content)?),
            "task.create" => Self::TaskCreate(parse(kind, content)?),
            "task.created" => Self::TaskCreated(parse(kind, content)?),
            "task.status" => Self::TaskStatus(parse(kind, content)?),
            "task.status.result" => Self::TaskStatusResult(parse(kind, content)?),
            "task.execute" => Self::TaskExecute(parse(kind, content)?),
            "task.result" => Self::TaskResult(parse(kind, content)?),
            "task.error" => Self::TaskError(parse(kind, content)?),
            "task.notification" => Self::TaskNotification(parse(kind, content)?),
            "service.register" => Self::ServiceRegister(parse(kind, content)?),
            "service.registered" => Self::ServiceRegistered(parse(kind, content)?),
            "service.status.update" => Self::ServiceStatusUpdate(parse(kind, content)?),
            "service.request" => Self::ServiceRequest(parse(kind, content)?),
            "service.task.execute" => Self::ServiceTaskExecute(parse(kind, content)?),
            "service.task.result" => Self::ServiceTaskResult(parse(kind, content)?),
            "service.task.notification" => Self::ServiceTaskNotification(parse(kind, content)?),
            "service.error" => Self::ServiceError(parse(kind, content)?),
            "mcp.server.list" => Self::McpServerList,
            "mcp.server.list.result" => Self::McpServerListResult(parse(kind, content)?),
            "mcp.server.register" => Self::McpServerRegister(parse(kind, content)?),
            "mcp.server.registered" => Self::McpServerRegistered(parse(kind, content)?),
            "ping" => Self::Ping(parse(kind, content)?),
            "pong" => Self::Pong(parse(kind, content)?),
            "welcome" => Self::Welcome(parse(kind, content)?),
            "error" => Self::Error(parse(kind, content)?),
            other => {
                return Err(SwitchboardError::UnsupportedType {
                    id: String::new(),
                    kind: other.to_string(),
                })
            }
        })
    }

    /// Serialize back to the untyped `content` value.
    pub fn to_content(&self) -> Result<Value> {
        Ok(match self {
            Self::AgentRegister(c) => serde_json::to_value(c)?,
            Self::AgentRegistered(c) => serde_json::to_value(c)?,
            Self::AgentRequest(c) => serde_json::to_value(c)?,
            Self::AgentList(c) => serde_json::to_value(c)?,
            Self::AgentListResult(c) => serde_json::to_value(c)?,
            Self::TaskCreate(c) => serde_json::to_value(c)?,
            Self::TaskCreated(c) => serde_json::to_value(c)?,
            Self::TaskStatus(c) => serde_json::to_value(c)?,
            Self::TaskStatusResult(c) => serde_json::to_value(c)?,
            Self::TaskExecute(c) => serde_json::to_value(c)?,
            Self::TaskResult(c) => serde_json::to_value(c)?,
            Self::TaskError(c) => serde_json::to_value(c)?,
            Self::TaskNotification(c) => serde_json::to_value(c)?,
            Self::ServiceRegister(c) => serde_json::to_value(c)?,
            Self::ServiceRegistered(c) => serde_json::to_value(c)?,
            Self::ServiceStatusUpdate(c) => serde_json::to_value(c)?,
            Self::ServiceRequest(c) => serde_json::to_value(c)?,
            Self::ServiceTaskExecute(c) => serde_json::to_value(c)?,
            Self::ServiceTaskResult(c) => serde_json::to_value(c)?,
            Self::ServiceTaskNotification(c) => serde_json::to_value(c)?,
            Self::ServiceError(c) => serde_json::to_value(c)?,
            Self::McpServerList => Value::Object(Default::default()),
            Self::McpServerListResult(c) => serde_json::to_value(c)?,
            Self::McpServerRegister(c) => serde_json::to_value(c)?,
            Self::McpServerRegistered(c) => serde_json::to_value(c)?,
            Self::Ping(c) => serde_json::to_value(c)?,
            Self::Pong(c) => serde_json::to_value(c)?,
            Self::Welcome(c) => serde_json::to_value(c)?,
            Self::Error(c) => serde_json::to_value(c)?,
            Self::Custom { content, .. } => content.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip() {
        let payload = Payload::TaskCreate(TaskCreate {
            agent_name: "echo-agent".into(),
            task_data: json!({"msg": "hi"}),
            task_type: None,
            name: None,
            metadata: None,
        });
        let env = Envelope::new(&payload).unwrap();
        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();

        assert_eq!(back.id, env.id);
        assert_eq!(back.kind, "task.create");
        assert!(back.request_id.is_none());
        match back.payload().unwrap() {
            Payload::TaskCreate(c) => {
                assert_eq!(c.agent_name, "echo-agent");
                assert_eq!(c.task_data["msg"], "hi");
            }
            other => panic!("unexpected payload: {}", other.kind()),
        }
    }

    #[test]
    fn test_timestamp_accepts_number_or_string() {
        let as_number: Envelope = serde_json::from_value(json!({
            "id": "m1", "type": "ping", "timestamp": 1700000000000u64, "content": {}
        }))
        .unwrap();
        assert_eq!(as_number.timestamp, 1_700_000_000_000);

        let as_string: Envelope = serde_json::from_value(json!({
            "id": "m2", "type": "ping", "timestamp": "1700000000000", "content": {}
        }))
        .unwrap();
        assert_eq!(as_string.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_unknown_type_carries_offending_id() {
        let env: Envelope = serde_json::from_value(json!({
            "id": "m3", "type": "bogus.thing", "timestamp": 1, "content": {}
        }))
        .unwrap();
        match env.payload() {
            Err(SwitchboardError::UnsupportedType { id, kind }) => {
                assert_eq!(id, "m3");
                assert_eq!(kind, "bogus.thing");
            }
            other => panic!("expected UnsupportedType, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_field_is_validation_error() {
        // task.create without agentName
        let env: Envelope = serde_json::from_value(json!({
            "id": "m4", "type": "task.create", "timestamp": 1,
            "content": {"taskData": {}}
        }))
        .unwrap();
        assert!(matches!(
            env.payload(),
            Err(SwitchboardError::Validation(_))
        ));
    }

    #[test]
    fn test_error_reply_references_request() {
        let err = Envelope::error_reply(Some("req-9"), "no such task", Some("NOT_FOUND"));
        assert_eq!(err.kind, "error");
        assert_eq!(err.request_id.as_deref(), Some("req-9"));
        assert_eq!(err.content["message"], "no such task");
        assert_eq!(err.content["code"], "NOT_FOUND");
    }

    #[test]
    fn test_reply_to_sets_request_id() {
        let reply = Envelope::reply_to(
            "abc",
            &Payload::TaskCreated(TaskCreated {
                task_id: "task_1".into(),
                message: None,
            }),
        )
        .unwrap();
        assert_eq!(reply.request_id.as_deref(), Some("abc"));
        assert_eq!(reply.kind, "task.created");
    }
}
