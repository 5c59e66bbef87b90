//! Service-task registry.
//!
//! Parallel to [`crate::registry::TaskRegistry`] but for tasks dispatched
//! to backend services. A service task may need lookup by service, by
//! requesting agent, and by originating client at the same time, hence the
//! three secondary indices.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use switchboard_common::{
    now_millis, Result, ServiceTask, ServiceTaskError, SwitchboardError, TaskStatus,
};

#[derive(Default)]
pub struct ServiceTaskRegistry {
    tasks: HashMap<String, ServiceTask>,
    by_service: HashMap<String, HashSet<String>>,
    by_requester: HashMap<String, HashSet<String>>,
    by_client: HashMap<String, HashSet<String>>,
}

impl ServiceTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: ServiceTask) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(SwitchboardError::Registry(format!(
                "service task '{}' already registered",
                task.id
            )));
        }
        self.by_service
            .entry(task.service_id.clone())
            .or_default()
            .insert(task.id.clone());
        if let Some(requester) = &task.requester_id {
            self.by_requester
                .entry(requester.clone())
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

    pub fn get(&self, id: &str) -> Option<&ServiceTask> {
        self.tasks.get(id)
    }

    pub fn for_service(&self, service_id: &str) -> Vec<&ServiceTask> {
        self.ids_to_tasks(self.by_service.get(service_id))
    }

    pub fn for_requester(&self, requester_id: &str) -> Vec<&ServiceTask> {
        self.ids_to_tasks(self.by_requester.get(requester_id))
    }

    pub fn for_client(&self, client_id: &str) -> Vec<&ServiceTask> {
        self.ids_to_tasks(self.by_client.get(client_id))
    }

    fn ids_to_tasks(&self, ids: Option<&HashSet<String>>) -> Vec<&ServiceTask> {
        let mut tasks: Vec<&ServiceTask> = ids
            .into_iter()
            .flatten()
            .filter_map(|id| self.tasks.get(id))
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn transition(&mut self, id: &str, status: TaskStatus) -> Result<&ServiceTask> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("service task '{id}'")))?;
        if task.status.is_terminal() {
            return Err(SwitchboardError::Registry(format!(
                "service task '{id}' is already {:?}",
                task.status
            )));
        }
        let now = now_millis();
        task.status = status;
        task.updated_at = now;
        if status.is_terminal() {
            task.completed_at = Some(now);
        }
        Ok(&*task)
    }

    /// Terminal success: mark completed, then merge the result. The
    /// transition runs first so a late duplicate cannot rewrite a stored
    /// outcome.
    pub fn complete(&mut self, id: &str, result: Value) -> Result<&ServiceTask> {
        self.transition(id, TaskStatus::Completed)?;
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("service task '{id}'")))?;
        task.merge_result(result);
        Ok(&*task)
    }

    /// Terminal failure with a structured error. Same ordering as
    /// [`Self::complete`].
    pub fn fail(&mut self, id: &str, error: ServiceTaskError) -> Result<&ServiceTask> {
        self.transition(id, TaskStatus::Failed)?;
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SwitchboardError::NotFound(format!("service task '{id}'")))?;
        task.error = Some(error);
        Ok(&*task)
    }

    pub fn remove(&mut self, id: &str) -> Option<ServiceTask> {
        let task = self.tasks.remove(id)?;
        Self::unindex(&mut self.by_service, &task.service_id, id);
        if let Some(requester) = &task.requester_id {
            Self::unindex(&mut self.by_requester, requester, id);
        }
        if let Some(client) = &task.client_id {
            Self::unindex(&mut self.by_client, client, id);
        }
        Some(task)
    }

    fn unindex(index: &mut HashMap<String, HashSet<String>>, key: &str, id: &str) {
        if let Some(ids) = index.get_mut(key) {
            ids.remove(id);
            if ids.is_empty() {
                index.remove(key);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stask() -> ServiceTask {
        ServiceTask::new("service-1", "sum", json!({"a": 1, "b": 2}))
            .with_requester("agent-1")
            .with_client("conn-9")
    }

    #[test]
    fn test_three_way_indexing() {
        let mut registry = ServiceTaskRegistry::new();
        let task = stask();
        let id = task.id.clone();
        registry.insert(task).unwrap();

        assert_eq!(registry.for_service("service-1").len(), 1);
        assert_eq!(registry.for_requester("agent-1").len(), 1);
        assert_eq!(registry.for_client("conn-9").len(), 1);

        registry.remove(&id).unwrap();
        assert!(registry.for_service("service-1").is_empty());
        assert!(registry.for_requester("agent-1").is_empty());
        assert!(registry.for_client("conn-9").is_empty());
    }

    #[test]
    fn test_complete_merges_and_stamps() {
        let mut registry = ServiceTaskRegistry::new();
        let task = stask();
        let id = task.id.clone();
        registry.insert(task).unwrap();
        registry.transition(&id, TaskStatus::Assigned).unwrap();

        registry.complete(&id, json!({"sum": 3})).unwrap();
        let task = registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.result.as_ref().unwrap()["sum"], 3);
    }

    #[test]
    fn test_fail_records_structured_error() {
        let mut registry = ServiceTaskRegistry::new();
        let task = stask();
        let id = task.id.clone();
        registry.insert(task).unwrap();

        registry
            .fail(
                &id,
                ServiceTaskError {
                    message: "function not found".into(),
                    code: Some("E_FN".into()),
                    details: None,
                },
            )
            .unwrap();
        let task = registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_ref().unwrap().code.as_deref(), Some("E_FN"));
    }

    #[test]
    fn test_terminal_is_final() {
        let mut registry = ServiceTaskRegistry::new();
        let task = stask();
        let id = task.id.clone();
        registry.insert(task).unwrap();
        registry.complete(&id, json!({})).unwrap();

        assert!(registry.transition(&id, TaskStatus::InProgress).is_err());
    }

    #[test]
    fn test_late_duplicate_outcome_leaves_stored_result_untouched() {
        let mut registry = ServiceTaskRegistry::new();
        let task = stask();
        let id = task.id.clone();
        registry.insert(task).unwrap();
        registry.complete(&id, json!({"sum": 3})).unwrap();

        assert!(registry.complete(&id, json!({"sum": 99})).is_err());
        assert!(registry
            .fail(
                &id,
                ServiceTaskError {
                    message: "late".into(),
                    code: None,
                    details: None,
                },
            )
            .is_err());

        let task = registry.get(&id).unwrap();
        assert_eq!(task.result.as_ref().unwrap()["sum"], 3);
        assert!(task.error.is_none());
        assert_eq!(task.status, TaskStatus::Completed);
    }
}
