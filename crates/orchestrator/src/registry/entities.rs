//! Agent and service registries.
//!
//! One generic store covers both entity kinds; the original deployment had
//! near-identical copies per kind. Name collisions are resolved by
//! supersession: a new registration under an online name demotes the old
//! holder to offline rather than rejecting the newcomer.

use std::collections::HashMap;

use switchboard_common::{
    Agent, Entity, EntityStatus, Result, Service, ServiceKind, SwitchboardError,
};

/// Filter for `list`: status equality plus a conjunctive capability match —
/// every requested capability must be present, not any.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub status: Option<EntityStatus>,
    pub capabilities: Vec<String>,
}

impl EntityFilter {
    pub fn online() -> Self {
        Self {
            status: Some(EntityStatus::Online),
            capabilities: Vec::new(),
        }
    }
}

/// Generic entity store keyed by id.
#[derive(Default)]
pub struct EntityRegistry<E: Entity> {
    by_id: HashMap<String, E>,
}

pub type AgentRegistry = EntityRegistry<Agent>;
pub type ServiceRegistry = EntityRegistry<Service>;

impl<E: Entity> EntityRegistry<E> {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
        }
    }

    /// Idempotent upsert keyed by id. Applies supersession: every *other*
    /// online entity holding the same name is marked offline. Returns the
    /// ids of superseded entities.
    pub fn upsert(&mut self, entity: E) -> Vec<String> {
        let mut superseded = Vec::new();
        for other in self.by_id.values_mut() {
            if other.id() != entity.id()
                && other.name() == entity.name()
                && other.status().is_online()
            {
                other.set_status(EntityStatus::Offline);
                superseded.push(other.id().to_string());
            }
        }
        self.by_id.insert(entity.id().to_string(), entity);
        superseded
    }

    pub fn get(&self, id: &str) -> Option<&E> {
        self.by_id.get(id)
    }

    /// Look up by name, preferring an online holder.
    pub fn get_by_name(&self, name: &str) -> Option<&E> {
        self.by_id
            .values()
            .filter(|e| e.name() == name)
            .max_by_key(|e| e.status().is_online())
    }

    pub fn get_by_connection(&self, connection_id: &str) -> Option<&E> {
        self.by_id
            .values()
            .find(|e| e.connection_id() == connection_id)
    }

    pub fn list(&self, filter: &EntityFilter) -> Vec<E> {
        let mut matches: Vec<E> = self
            .by_id
            .values()
            .filter(|e| filter.status.is_none_or(|s| e.status() == s))
            .filter(|e| e.has_all_capabilities(&filter.capabilities))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.name().cmp(b.name()));
        matches
    }

    pub fn set_status(&mut self, id: &str, status: EntityStatus) -> Result<()> {
        match self.by_id.get_mut(id) {
            Some(entity) => {
                entity.set_status(status);
                Ok(())
            }
            None => Err(SwitchboardError::NotFound(format!("entity '{id}'"))),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<E> {
        self.by_id.remove(id)
    }

    pub fn remove_by_connection(&mut self, connection_id: &str) -> Vec<E> {
        let ids: Vec<String> = self
            .by_id
            .values()
            .filter(|e| e.connection_id() == connection_id)
            .map(|e| e.id().to_string())
            .collect();
        ids.iter().filter_map(|id| self.by_id.remove(id)).collect()
    }

    /// Mark every entity on a closed connection offline. Returns their ids.
    pub fn mark_offline_by_connection(&mut self, connection_id: &str) -> Vec<String> {
        let mut marked = Vec::new();
        for entity in self.by_id.values_mut() {
            if entity.connection_id() == connection_id && entity.status().is_online() {
                entity.set_status(EntityStatus::Offline);
                marked.push(entity.id().to_string());
            }
        }
        marked
    }

    pub fn count(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl EntityRegistry<Service> {
    /// Services of one kind, e.g. registered MCP servers.
    pub fn list_by_kind(&self, kind: ServiceKind, filter: &EntityFilter) -> Vec<Service> {
        self.list(filter)
            .into_iter()
            .filter(|s| s.kind == kind)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, caps: &[&str], conn: &str) -> Agent {
        Agent::new(name, caps.iter().map(|c| c.to_string()).collect(), conn)
    }

    #[test]
    fn test_upsert_and_lookup() {
        let mut registry = AgentRegistry::new();
        let a = agent("echo-agent", &["echo"], "conn-1");
        let id = a.id.clone();
        registry.upsert(a);

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(&id).unwrap().name, "echo-agent");
        assert_eq!(registry.get_by_name("echo-agent").unwrap().id, id);
        assert_eq!(registry.get_by_connection("conn-1").unwrap().id, id);
    }

    #[test]
    fn test_name_supersession_leaves_one_online() {
        let mut registry = AgentRegistry::new();
        let old = agent("worker", &[], "conn-1");
        let old_id = old.id.clone();
        registry.upsert(old);

        let new = agent("worker", &[], "conn-2");
        let new_id = new.id.clone();
        let superseded = registry.upsert(new);

        assert_eq!(superseded, vec![old_id.clone()]);
        assert_eq!(registry.get(&old_id).unwrap().status, EntityStatus::Offline);
        assert_eq!(registry.get(&new_id).unwrap().status, EntityStatus::Online);

        let online: Vec<_> = registry
            .list(&EntityFilter::online())
            .into_iter()
            .filter(|a| a.name == "worker")
            .collect();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, new_id);

        // Lookup by name prefers the online holder.
        assert_eq!(registry.get_by_name("worker").unwrap().id, new_id);
    }

    #[test]
    fn test_upsert_same_id_is_idempotent() {
        let mut registry = AgentRegistry::new();
        let mut a = agent("worker", &[], "conn-1");
        let id = a.id.clone();
        registry.upsert(a.clone());

        a.status = EntityStatus::Busy;
        let superseded = registry.upsert(a);
        assert!(superseded.is_empty());
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(&id).unwrap().status, EntityStatus::Busy);
    }

    #[test]
    fn test_capability_filter_is_conjunctive() {
        let mut registry = AgentRegistry::new();
        registry.upsert(agent("ab", &["a", "b"], "conn-1"));

        let matching = |caps: &[&str]| {
            registry
                .list(&EntityFilter {
                    status: None,
                    capabilities: caps.iter().map(|c| c.to_string()).collect(),
                })
                .len()
        };

        assert_eq!(matching(&["a"]), 1);
        assert_eq!(matching(&["a", "b"]), 1);
        // {a, c} must exclude an agent holding only {a, b}.
        assert_eq!(matching(&["a", "c"]), 0);
    }

    #[test]
    fn test_mark_offline_by_connection() {
        let mut registry = AgentRegistry::new();
        let a = agent("one", &[], "conn-1");
        let b = agent("two", &[], "conn-1");
        let c = agent("three", &[], "conn-2");
        let c_id = c.id.clone();
        registry.upsert(a);
        registry.upsert(b);
        registry.upsert(c);

        let marked = registry.mark_offline_by_connection("conn-1");
        assert_eq!(marked.len(), 2);
        assert_eq!(registry.get(&c_id).unwrap().status, EntityStatus::Online);
        assert_eq!(registry.list(&EntityFilter::online()).len(), 1);
    }

    #[test]
    fn test_list_by_kind_filters_services() {
        let mut registry = ServiceRegistry::new();
        registry.upsert(Service::new("calc", vec![], "conn-1", ServiceKind::Backend));
        registry.upsert(Service::new("files", vec![], "conn-2", ServiceKind::Mcp));

        let mcp = registry.list_by_kind(ServiceKind::Mcp, &EntityFilter::default());
        assert_eq!(mcp.len(), 1);
        assert_eq!(mcp[0].name, "files");
    }
}
