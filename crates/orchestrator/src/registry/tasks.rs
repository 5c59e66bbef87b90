//! Task registry.
//!
//! Primary map keyed by task id plus two secondary indices (by assignee,
//! by client) that stay consistent with the primary on every insert and
//! remove. Status transitions append to the task's history; history is an
//! append-only audit trail.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use switchboard_common::{
    now_millis, HistoryEntry, Result, SwitchboardError, Task, TaskStatus,
};

#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Task>,
    by_assignee: HashMap<String, HashSet<String>>,
    by_client: HashMap<String, HashSet<String>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(SwitchboardError::Registry(format!(
                "task '{}' already registered",
                task.id
            )));
        }
        if let Some(assignee) = &task.assignee_id {
            self.by_assignee
                .entry(assignee.clone())
                .or_default()
                .insert(task.id.clone());
        }
        if let Some(client) = &task.client_id {
            self.by_client
                .entry(client.clone())
                .or_default()
                .insert(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn for_assignee(&self, assignee_id: &str) -> Vec<&Task> {
        self.ids_to_tasks(self.by_assignee.get(assignee_id))
    }

    pub fn for_client(&self, client_id: &str) -> Vec<&Task> {
        self.ids_to_tasks(self.by_client.get(client_id))
    }

    fn ids_to_tasks(&self, ids: Option<&HashSet<String>>) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = ids
            .into_iter()
            .flatten()
            .filter_map(|id| self.tasks.get(id))
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Assign the task to an agent: sets the assignee, updates the index,
    /// and records the `assigned` transition.
    pub fn assign(&mut self, id: &str, agent_id: &str) -> Result<&Task> {
        {
            let task = self
                .tasks
                .get_mut(id)
                .ok_or_else(|| SwitchboardError::NotFound(format!("task '{id}'")))?;
            if let Some(previous) = task.assignee_id.replace(agent_id.to_string()) {
                if let Some(ids) = self.by_assignee.get_mut(&previous) {
                    ids.remove(id);
                }
            }
        }
        self.by_assignee
            .entry(agent_id.to_string())
            .or_default()
            .insert(id.to_string());
        self.transition(id, TaskStatus::Assigned, None, Some(agent_id))
    }

    /// Apply a status transition: appends a history entry, bumps
    /// `updated_at`, and stamps `completed_at` on terminal statuses.
    /// Transitions out of a terminal status are rejected.
    pub fn transition(
        &mut self,
        id: &str,
        status: TaskStatus,
        note: Option<String>,
        agent_id: Option<&str>,
    ) -> Result<&Task> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("task '{id}'")))?;
        if task.status.is_terminal() {
            return Err(SwitchboardError::Registry(format!(
                "task '{id}' is already {:?}",
                task.status
            )));
        }

        let now = now_millis();
        task.status = status;
        task.updated_at = now;
        if status.is_terminal() {
            task.completed_at = Some(now);
        }
        task.history.push(HistoryEntry {
            status,
            timestamp: now,
            note,
            agent_id: agent_id.map(str::to_string),
        });
        Ok(&*task)
    }

    /// Merge a partial result without discarding previously stored fields.
    pub fn merge_result(&mut self, id: &str, result: Value) -> Result<()> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("task '{id}'")))?
            .merge_result(result);
        Ok(())
    }

    pub fn merge_error(&mut self, id: &str, error: Value) -> Result<()> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("task '{id}'")))?
            .merge_error(error);
        Ok(())
    }

    pub fn merge_metadata(&mut self, id: &str, metadata: Value) -> Result<()> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("task '{id}'")))?
            .merge_metadata(metadata);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        if let Some(assignee) = &task.assignee_id {
            if let Some(ids) = self.by_assignee.get_mut(assignee) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_assignee.remove(assignee);
                }
            }
        }
        if let Some(client) = &task.client_id {
            if let Some(ids) = self.by_client.get_mut(client) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_client.remove(client);
                }
            }
        }
        Some(task)
    }

    pub fn count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_for(client: &str) -> Task {
        Task::new("echo").with_client(client)
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let mut registry = TaskRegistry::new();
        let task = task_for("conn-1");
        let dup = task.clone();
        registry.insert(task).unwrap();
        assert!(matches!(
            registry.insert(dup),
            Err(SwitchboardError::Registry(_))
        ));
    }

    #[test]
    fn test_indices_follow_insert_and_remove() {
        let mut registry = TaskRegistry::new();
        let task = task_for("client-1");
        let id = task.id.clone();
        registry.insert(task).unwrap();
        registry.assign(&id, "agent-1").unwrap();

        assert_eq!(registry.for_client("client-1").len(), 1);
        assert_eq!(registry.for_assignee("agent-1").len(), 1);

        registry.remove(&id).unwrap();
        assert!(registry.for_client("client-1").is_empty());
        assert!(registry.for_assignee("agent-1").is_empty());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_reassignment_moves_index_entry() {
        let mut registry = TaskRegistry::new();
        let task = task_for("client-1");
        let id = task.id.clone();
        registry.insert(task).unwrap();
        registry.assign(&id, "agent-1").unwrap();
        registry.assign(&id, "agent-2").unwrap();

        assert!(registry.for_assignee("agent-1").is_empty());
        assert_eq!(registry.for_assignee("agent-2").len(), 1);
    }

    #[test]
    fn test_history_is_append_only_and_ordered() {
        let mut registry = TaskRegistry::new();
        let task = task_for("client-1");
        let id = task.id.clone();
        registry.insert(task).unwrap();

        let mut lengths = vec![registry.get(&id).unwrap().history.len()];
        registry.assign(&id, "agent-1").unwrap();
        lengths.push(registry.get(&id).unwrap().history.len());
        registry
            .transition(&id, TaskStatus::InProgress, None, Some("agent-1"))
            .unwrap();
        lengths.push(registry.get(&id).unwrap().history.len());
        let first_entry = registry.get(&id).unwrap().history[0].clone();
        registry
            .transition(&id, TaskStatus::Completed, Some("done".into()), None)
            .unwrap();
        lengths.push(registry.get(&id).unwrap().history.len());

        // Non-decreasing history length across updates.
        assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(lengths.last(), Some(&4));

        // Earlier entries are untouched by later transitions.
        let task = registry.get(&id).unwrap();
        assert_eq!(task.history[0].status, first_entry.status);
        assert_eq!(task.history[0].timestamp, first_entry.timestamp);

        let statuses: Vec<TaskStatus> = task.history.iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Pending,
                TaskStatus::Assigned,
                TaskStatus::InProgress,
                TaskStatus::Completed,
            ]
        );
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        let mut registry = TaskRegistry::new();
        let task = task_for("client-1");
        let id = task.id.clone();
        registry.insert(task).unwrap();
        registry
            .transition(&id, TaskStatus::Failed, None, None)
            .unwrap();

        assert!(registry
            .transition(&id, TaskStatus::Completed, None, None)
            .is_err());
        assert_eq!(registry.get(&id).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn test_merge_result_preserves_fields() {
        let mut registry = TaskRegistry::new();
        let task = task_for("client-1");
        let id = task.id.clone();
        registry.insert(task).unwrap();

        registry.merge_result(&id, json!({"partial": true})).unwrap();
        registry.merge_result(&id, json!({"echo": "hi"})).unwrap();

        let result = registry.get(&id).unwrap().result.clone().unwrap();
        assert_eq!(result["partial"], true);
        assert_eq!(result["echo"], "hi");
    }
}
