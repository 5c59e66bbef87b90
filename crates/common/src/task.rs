//! Task and service-task records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::now_millis;

/// Lifecycle status of a task.
///
/// `pending → assigned → in_progress → {completed | failed | cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One audit-trail entry. History is append-only: entries are never
/// rewritten after being pushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub status: TaskStatus,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// A task routed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub task_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
    /// Connection id of the originating client, for result fan-out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Agent id of the requester, for delegated tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub history: Vec<HistoryEntry>,
}

impl Task {
    pub fn new(task_type: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            task_type: task_type.into(),
            name: None,
            status: TaskStatus::Pending,
            assignee_id: None,
            client_id: None,
            requester_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            error: None,
            metadata: None,
            history: vec![HistoryEntry {
                status: TaskStatus::Pending,
                timestamp: now,
                note: Some("created".into()),
                agent_id: None,
            }],
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = Some(requester_id.into());
        self
    }

    /// Merge a partial result into the stored one. Object results merge
    /// key-wise so previously stored fields survive; anything else replaces.
    pub fn merge_result(&mut self, incoming: Value) {
        self.result = Some(merge_values(self.result.take(), incoming));
        self.updated_at = now_millis();
    }

    /// Merge a partial error the same way results merge.
    pub fn merge_error(&mut self, incoming: Value) {
        self.error = Some(merge_values(self.error.take(), incoming));
        self.updated_at = now_millis();
    }

    /// Merge task metadata the same way results merge.
    pub fn merge_metadata(&mut self, incoming: Value) {
        self.metadata = Some(merge_values(self.metadata.take(), incoming));
        self.updated_at = now_millis();
    }
}

/// Object-merge two JSON values; non-objects replace.
pub(crate) fn merge_values(existing: Option<Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Object(mut base)), Value::Object(update)) => {
            for (k, v) in update {
                base.insert(k, v);
            }
            Value::Object(base)
        }
        (_, incoming) => incoming,
    }
}

/// Structured error attached to a failed service task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTaskError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// A task dispatched to a backend service. Simpler than [`Task`]: same
/// status field but no history list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTask {
    pub id: String,
    pub service_id: String,
    pub function_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub status: TaskStatus,
    /// Stream progress notifications back to the requester until terminal
    #[serde(default)]
    pub subscribe_notifications: bool,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceTaskError>,
}

impl ServiceTask {
    pub fn new(
        service_id: impl Into<String>,
        function_name: impl Into<String>,
        params: Value,
    ) -> Self {
        let now = now_millis();
        Self {
            id: format!("stask_{}", uuid::Uuid::new_v4()),
            service_id: service_id.into(),
            function_name: function_name.into(),
            params,
            requester_id: None,
            client_id: None,
            status: TaskStatus::Pending,
            subscribe_notifications: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = Some(requester_id.into());
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_notifications(mut self, subscribe: bool) -> Self {
        self.subscribe_notifications = subscribe;
        self
    }

    pub fn merge_result(&mut self, incoming: Value) {
        self.result = Some(merge_values(self.result.take(), incoming));
        self.updated_at = now_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_creation() {
        let task = Task::new("echo");

        assert!(task.id.starts_with("task_"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assignee_id.is_none());
        assert_eq!(task.history.len(), 1);
        assert_eq!(task.history[0].status, TaskStatus::Pending);
        assert!(task.created_at > 0);
    }

    #[test]
    fn test_task_unique_ids() {
        assert_ne!(Task::new("a").id, Task::new("a").id);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_merge_result_keeps_existing_fields() {
        let mut task = Task::new("echo");
        task.merge_result(json!({"partial": 1}));
        task.merge_result(json!({"final": 2}));

        let result = task.result.unwrap();
        assert_eq!(result["partial"], 1);
        assert_eq!(result["final"], 2);
    }

    #[test]
    fn test_merge_metadata_keeps_existing_fields() {
        let mut task = Task::new("echo");
        task.merge_metadata(json!({"origin": "cli"}));
        task.merge_metadata(json!({"attempt": 2}));

        let metadata = task.metadata.unwrap();
        assert_eq!(metadata["origin"], "cli");
        assert_eq!(metadata["attempt"], 2);
    }

    #[test]
    fn test_merge_result_non_object_replaces() {
        let mut task = Task::new("echo");
        task.merge_result(json!({"partial": 1}));
        task.merge_result(json!("done"));
        assert_eq!(task.result.unwrap(), json!("done"));
    }

    #[test]
    fn test_task_status_serialization() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let text = serde_json::to_string(&status).unwrap();
            let back: TaskStatus = serde_json::from_str(&text).unwrap();
            assert_eq!(back, status);
        }
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }

    #[test]
    fn test_service_task_error_round_trip() {
        let task = ServiceTask::new("service_1", "sum", json!({"a": 1}));
        let mut task: ServiceTask =
            serde_json::from_str(&serde_json::to_string(&task).unwrap()).unwrap();
        task.error = Some(ServiceTaskError {
            message: "boom".into(),
            code: Some("E_FN".into()),
            details: Some(json!({"line": 3})),
        });
        let text = serde_json::to_string(&task).unwrap();
        let back: ServiceTask = serde_json::from_str(&text).unwrap();
        assert_eq!(back.error.unwrap().code.as_deref(), Some("E_FN"));
    }
}
