use crate::state_paths;
use crate::types::{Agent, AgentFilter, AgentStatus, AgentUpdate};
use chrono::Utc;
use ensemble_core::{Capability, EnsembleError, EnsembleResult};
use ensemble_state::SharedState;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Directory of agents keyed by id, with secondary indexes from capability
/// name and status to agent ids.
///
/// Every agent is mirrored into the shared state tree at `agents.<id>` so
/// other components can observe the registry without holding a reference to
/// it.
pub struct AgentRegistry {
    agents: HashMap<String, Agent>,
    capability_index: HashMap<String, HashSet<String>>,
    status_index: HashMap<AgentStatus, HashSet<String>>,
    state: SharedState,
}

impl AgentRegistry {
    /// Create an empty registry mirroring into the given state tree.
    pub fn new(state: SharedState) -> Self {
        Self {
            agents: HashMap::new(),
            capability_index: HashMap::new(),
            status_index: HashMap::new(),
            state,
        }
    }

    /// Validate agent data. Runs before any mutation so a rejected
    /// registration is never partially applied.
    fn validate(agent: &Agent) -> EnsembleResult<()> {
        if agent.id.is_empty() {
            return Err(EnsembleError::Validation(
                "agent id must not be empty".to_string(),
            ));
        }
        if agent.name.is_empty() {
            return Err(EnsembleError::Validation(format!(
                "agent {} must have a name",
                agent.id
            )));
        }
        if agent.kind.is_empty() {
            return Err(EnsembleError::Validation(format!(
                "agent {} must have a type",
                agent.id
            )));
        }
        if agent.capabilities.is_empty() {
            return Err(EnsembleError::Validation(format!(
                "agent {} must declare at least one capability",
                agent.id
            )));
        }
        Ok(())
    }

    /// Register a new agent.
    pub async fn register(&mut self, agent: Agent) -> EnsembleResult<()> {
        Self::validate(&agent)?;
        if self.agents.contains_key(&agent.id) {
            return Err(EnsembleError::DuplicateId(format!("agent {}", agent.id)));
        }

        for capability in &agent.capabilities {
            self.capability_index
                .entry(capability.name.clone())
                .or_default()
                .insert(agent.id.clone());
        }
        self.status_index
            .entry(agent.status)
            .or_default()
            .insert(agent.id.clone());

        let mirror = serde_json::to_value(&agent)?;
        self.state.set(&state_paths::agent(&agent.id), mirror).await?;

        info!(agent_id = %agent.id, name = %agent.name, kind = %agent.kind, "agent registered");
        self.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    /// Unregister an agent, removing it from every index bucket and
    /// clearing its mirrored state entry.
    pub async fn unregister(&mut self, id: &str) -> EnsembleResult<()> {
        let agent = self
            .agents
            .remove(id)
            .ok_or_else(|| EnsembleError::NotFound(format!("agent {id}")))?;

        self.remove_from_capability_index(&agent);
        self.remove_from_status_index(agent.status, id);
        self.state.remove(&state_paths::agent(id)).await;

        info!(agent_id = %id, "agent unregistered");
        Ok(())
    }

    /// Apply a partial update and re-mirror the agent.
    pub async fn update(&mut self, id: &str, update: AgentUpdate) -> EnsembleResult<()> {
        {
            let agent = self
                .agents
                .get_mut(id)
                .ok_or_else(|| EnsembleError::NotFound(format!("agent {id}")))?;
            if let Some(name) = update.name {
                agent.name = name;
            }
            if let Some(kind) = update.kind {
                agent.kind = kind;
            }
            if let Some(metadata) = update.metadata {
                agent.metadata.extend(metadata);
            }
        }
        if let Some(status) = update.status {
            self.set_status(id, status)?;
        }
        self.mirror(id).await
    }

    /// Change an agent's status, keeping the status index and mirrored
    /// state consistent and refreshing `last_active`.
    pub async fn update_status(&mut self, id: &str, status: AgentStatus) -> EnsembleResult<()> {
        self.set_status(id, status)?;
        self.state
            .set(&state_paths::agent_status(id), json!(status))
            .await?;
        debug!(agent_id = %id, status = %status, "agent status updated");
        Ok(())
    }

    fn set_status(&mut self, id: &str, status: AgentStatus) -> EnsembleResult<()> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| EnsembleError::NotFound(format!("agent {id}")))?;
        let previous = agent.status;
        agent.status = status;
        agent.last_active = Utc::now();
        let id = agent.id.clone();
        self.remove_from_status_index(previous, &id);
        self.status_index.entry(status).or_default().insert(id);
        Ok(())
    }

    /// Replace an agent's capability set. Stale index entries are removed
    /// before the new ones are added, so no dangling ids survive.
    pub async fn update_capabilities(
        &mut self,
        id: &str,
        capabilities: Vec<Capability>,
    ) -> EnsembleResult<()> {
        if capabilities.is_empty() {
            return Err(EnsembleError::Validation(format!(
                "agent {id} must declare at least one capability"
            )));
        }
        {
            let agent = self
                .agents
                .get(id)
                .ok_or_else(|| EnsembleError::NotFound(format!("agent {id}")))?
                .clone();
            self.remove_from_capability_index(&agent);
        }
        for capability in &capabilities {
            self.capability_index
                .entry(capability.name.clone())
                .or_default()
                .insert(id.to_string());
        }
        if let Some(agent) = self.agents.get_mut(id) {
            agent.capabilities = capabilities;
        }
        self.mirror(id).await
    }

    /// Record a heartbeat for an agent. An unhealthy heartbeat appends the
    /// error; a healthy one restores an agent stuck in `Error` back to
    /// `Available`.
    pub async fn record_heartbeat(
        &mut self,
        id: &str,
        healthy: bool,
        error: Option<String>,
    ) -> EnsembleResult<()> {
        let restore = {
            let agent = self
                .agents
                .get_mut(id)
                .ok_or_else(|| EnsembleError::NotFound(format!("agent {id}")))?;
            agent.health.is_healthy = healthy;
            agent.health.last_heartbeat = Utc::now();
            if let Some(error) = error {
                agent.health.errors.push(error);
            }
            healthy && agent.status == AgentStatus::Error
        };
        if restore {
            self.update_status(id, AgentStatus::Available).await?;
        }
        Ok(())
    }

    /// Copy of the agent, if registered.
    pub fn get(&self, id: &str) -> Option<Agent> {
        self.agents.get(id).cloned()
    }

    /// Copies of all agents satisfying the filter, in registration-time
    /// order.
    pub fn list(&self, filter: Option<&AgentFilter>) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .values()
            .filter(|a| filter.map_or(true, |f| f.matches(a)))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        agents
    }

    /// Agents declaring the named capability, via the secondary index.
    pub fn find_by_capability(&self, name: &str) -> Vec<Agent> {
        let Some(ids) = self.capability_index.get(name) else {
            return Vec::new();
        };
        let mut agents: Vec<Agent> = ids.iter().filter_map(|id| self.get(id)).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Agents currently in the given status, via the secondary index.
    pub fn agents_in_status(&self, status: AgentStatus) -> Vec<Agent> {
        let Some(ids) = self.status_index.get(&status) else {
            return Vec::new();
        };
        let mut agents: Vec<Agent> = ids.iter().filter_map(|id| self.get(id)).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Whether the agent may be selected: status `Available` and healthy.
    pub fn is_available(&self, id: &str) -> bool {
        self.agents
            .get(id)
            .map(|a| a.status == AgentStatus::Available && a.health.is_healthy)
            .unwrap_or(false)
    }

    /// Agent count per status, including zero counts.
    pub fn counts_by_status(&self) -> HashMap<AgentStatus, usize> {
        let mut counts: HashMap<AgentStatus, usize> =
            AgentStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for (status, ids) in &self.status_index {
            counts.insert(*status, ids.len());
        }
        counts
    }

    /// All capability names currently indexed, sorted.
    pub fn capability_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capability_index.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    async fn mirror(&self, id: &str) -> EnsembleResult<()> {
        if let Some(agent) = self.agents.get(id) {
            let mirror = serde_json::to_value(agent)?;
            self.state.set(&state_paths::agent(id), mirror).await?;
        }
        Ok(())
    }

    fn remove_from_capability_index(&mut self, agent: &Agent) {
        for capability in &agent.capabilities {
            if let Some(ids) = self.capability_index.get_mut(&capability.name) {
                ids.remove(&agent.id);
                if ids.is_empty() {
                    self.capability_index.remove(&capability.name);
                }
            }
        }
    }

    fn remove_from_status_index(&mut self, status: AgentStatus, id: &str) {
        if let Some(ids) = self.status_index.get_mut(&status) {
            ids.remove(id);
            if ids.is_empty() {
                self.status_index.remove(&status);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn researcher() -> Agent {
        Agent::new("a1", "Researcher", "worker").with_capability("research")
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let mut registry = AgentRegistry::new(SharedState::new());
        registry.register(researcher()).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a1").unwrap().name, "Researcher");
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let mut registry = AgentRegistry::new(SharedState::new());
        registry.register(researcher()).await.unwrap();
        let err = registry.register(researcher()).await.unwrap_err();
        assert!(matches!(err, EnsembleError::DuplicateId(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_rejects_before_mutation() {
        let mut registry = AgentRegistry::new(SharedState::new());

        let no_caps = Agent::new("a1", "Empty", "worker");
        let err = registry.register(no_caps).await.unwrap_err();
        assert!(matches!(err, EnsembleError::Validation(_)));

        let no_name = Agent::new("a2", "", "worker").with_capability("x");
        assert!(registry.register(no_name).await.is_err());

        assert_eq!(registry.len(), 0);
        assert!(registry.capability_names().is_empty());
    }

    #[tokio::test]
    async fn test_register_mirrors_into_state() {
        let state = SharedState::new();
        let mut registry = AgentRegistry::new(state.clone());
        registry.register(researcher()).await.unwrap();

        let mirrored = state.get("agents.a1").await.unwrap();
        assert_eq!(mirrored["type"], json!("worker"));
        assert_eq!(mirrored["status"], json!("available"));
    }

    #[tokio::test]
    async fn test_unregister_clears_every_index_bucket() {
        let state = SharedState::new();
        let mut registry = AgentRegistry::new(state.clone());
        let agent = Agent::new("a1", "Poly", "worker")
            .with_capability("research")
            .with_capability("writing");
        registry.register(agent).await.unwrap();

        registry.unregister("a1").await.unwrap();
        assert!(registry.find_by_capability("research").is_empty());
        assert!(registry.find_by_capability("writing").is_empty());
        assert!(registry.agents_in_status(AgentStatus::Available).is_empty());
        assert_eq!(state.get("agents.a1").await, None);

        let err = registry.unregister("a1").await.unwrap_err();
        assert!(matches!(err, EnsembleError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_capability_update_leaves_no_stale_entries() {
        let mut registry = AgentRegistry::new(SharedState::new());
        registry.register(researcher()).await.unwrap();

        registry
            .update_capabilities("a1", vec!["writing".into(), "editing".into()])
            .await
            .unwrap();

        assert!(registry.find_by_capability("research").is_empty());
        assert_eq!(registry.find_by_capability("writing").len(), 1);
        assert_eq!(registry.find_by_capability("editing").len(), 1);
        assert_eq!(
            registry.capability_names(),
            vec!["editing".to_string(), "writing".to_string()]
        );
    }

    #[tokio::test]
    async fn test_status_index_follows_updates() {
        let mut registry = AgentRegistry::new(SharedState::new());
        registry.register(researcher()).await.unwrap();

        registry.update_status("a1", AgentStatus::Busy).await.unwrap();
        assert!(registry.agents_in_status(AgentStatus::Available).is_empty());
        assert_eq!(registry.agents_in_status(AgentStatus::Busy).len(), 1);
    }

    #[tokio::test]
    async fn test_status_update_mirrors_into_state() {
        let state = SharedState::new();
        let mut registry = AgentRegistry::new(state.clone());
        registry.register(researcher()).await.unwrap();
        registry.update_status("a1", AgentStatus::Error).await.unwrap();
        assert_eq!(state.get("agents.a1.status").await, Some(json!("error")));
    }

    #[tokio::test]
    async fn test_availability_requires_health() {
        let mut registry = AgentRegistry::new(SharedState::new());
        registry.register(researcher()).await.unwrap();
        assert!(registry.is_available("a1"));

        registry
            .record_heartbeat("a1", false, Some("connection refused".to_string()))
            .await
            .unwrap();
        assert!(!registry.is_available("a1"));
        assert_eq!(registry.get("a1").unwrap().health.errors.len(), 1);

        registry.record_heartbeat("a1", true, None).await.unwrap();
        assert!(registry.is_available("a1"));
    }

    #[tokio::test]
    async fn test_healthy_heartbeat_restores_errored_agent() {
        let mut registry = AgentRegistry::new(SharedState::new());
        registry.register(researcher()).await.unwrap();
        registry.update_status("a1", AgentStatus::Error).await.unwrap();

        registry.record_heartbeat("a1", true, None).await.unwrap();
        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Available);
        assert!(registry.is_available("a1"));
    }

    #[tokio::test]
    async fn test_list_returns_copies() {
        let mut registry = AgentRegistry::new(SharedState::new());
        registry.register(researcher()).await.unwrap();

        let mut listed = registry.list(None);
        listed[0].name = "Mutated".to_string();
        assert_eq!(registry.get("a1").unwrap().name, "Researcher");
    }

    #[tokio::test]
    async fn test_list_filter() {
        let mut registry = AgentRegistry::new(SharedState::new());
        registry.register(researcher()).await.unwrap();
        registry
            .register(Agent::new("a2", "Writer", "worker").with_capability("writing"))
            .await
            .unwrap();

        let filter = AgentFilter {
            capabilities: Some(vec!["writing".to_string()]),
            ..AgentFilter::default()
        };
        let listed = registry.list(Some(&filter));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "a2");
    }

    #[tokio::test]
    async fn test_counts_by_status_includes_zeroes() {
        let mut registry = AgentRegistry::new(SharedState::new());
        registry.register(researcher()).await.unwrap();

        let counts = registry.counts_by_status();
        assert_eq!(counts[&AgentStatus::Available], 1);
        assert_eq!(counts[&AgentStatus::Offline], 0);
        assert_eq!(counts[&AgentStatus::Busy], 0);
        assert_eq!(counts[&AgentStatus::Error], 0);
    }

    #[tokio::test]
    async fn test_partial_update() {
        let mut registry = AgentRegistry::new(SharedState::new());
        registry.register(researcher()).await.unwrap();

        registry
            .update(
                "a1",
                AgentUpdate {
                    name: Some("Senior Researcher".to_string()),
                    metadata: Some([("team".to_string(), json!("alpha"))].into()),
                    ..AgentUpdate::default()
                },
            )
            .await
            .unwrap();

        let agent = registry.get("a1").unwrap();
        assert_eq!(agent.name, "Senior Researcher");
        assert_eq!(agent.kind, "worker");
        assert_eq!(agent.metadata["team"], json!("alpha"));
    }
}
