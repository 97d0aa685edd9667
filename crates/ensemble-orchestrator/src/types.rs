use chrono::{DateTime, Utc};
use ensemble_core::Capability;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Availability of an agent within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered but not reachable.
    Offline,
    /// Ready to accept work.
    Available,
    /// Currently executing a task.
    Busy,
    /// Last execution failed; excluded from selection until healthy again.
    Error,
}

impl AgentStatus {
    /// All states, for aggregations that report zero counts.
    pub const ALL: [AgentStatus; 4] = [
        AgentStatus::Offline,
        AgentStatus::Available,
        AgentStatus::Busy,
        AgentStatus::Error,
    ];
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Available => write!(f, "available"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// Health bookkeeping for an agent, updated via heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the agent is considered fit for selection.
    pub is_healthy: bool,
    /// Recent error messages, newest last.
    pub errors: Vec<String>,
    /// When the agent last reported in.
    pub last_heartbeat: DateTime<Utc>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            is_healthy: true,
            errors: Vec::new(),
            last_heartbeat: Utc::now(),
        }
    }
}

/// A capability-bearing worker identity.
///
/// Execution logic lives outside the core; the registry only tracks
/// identity, capability, status, and health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique id within the registry.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Free-form agent type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Declared abilities. Never empty once registered.
    pub capabilities: Vec<Capability>,
    /// Current availability.
    pub status: AgentStatus,
    /// Health bookkeeping.
    #[serde(default)]
    pub health: HealthStatus,
    /// Open key-value metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// When the agent was registered.
    pub created_at: DateTime<Utc>,
    /// When the agent last changed status or finished work.
    pub last_active: DateTime<Utc>,
}

impl Agent {
    /// Create an available agent with no capabilities yet.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            capabilities: Vec::new(),
            status: AgentStatus::Available,
            health: HealthStatus::default(),
            metadata: HashMap::new(),
            created_at: now,
            last_active: now,
        }
    }

    /// Replace the capability set.
    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Add one capability.
    pub fn with_capability(mut self, capability: impl Into<Capability>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Set the initial status.
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the agent declares the named capability.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    /// Names of all declared capabilities, in declaration order.
    pub fn capability_names(&self) -> Vec<String> {
        self.capabilities.iter().map(|c| c.name.clone()).collect()
    }
}

/// Partial update applied to a registered agent.
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    /// New name, if any.
    pub name: Option<String>,
    /// New type, if any.
    pub kind: Option<String>,
    /// New status, if any.
    pub status: Option<AgentStatus>,
    /// Metadata entries to merge in.
    pub metadata: Option<HashMap<String, Value>>,
}

/// Conjunctive filter over agents. `None` fields are unconstrained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFilter {
    /// Accepted agent types.
    pub kinds: Option<Vec<String>>,
    /// Accepted statuses.
    pub statuses: Option<Vec<AgentStatus>>,
    /// At least one of these capabilities must be declared.
    pub capabilities: Option<Vec<String>>,
    /// Metadata entries that must match exactly.
    pub metadata: Option<HashMap<String, Value>>,
}

impl AgentFilter {
    /// Whether the agent satisfies every present constraint.
    pub fn matches(&self, agent: &Agent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&agent.kind) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&agent.status) {
                return false;
            }
        }
        if let Some(capabilities) = &self.capabilities {
            if !capabilities.iter().any(|c| agent.has_capability(c)) {
                return false;
            }
        }
        if let Some(metadata) = &self.metadata {
            for (key, value) in metadata {
                if agent.metadata.get(key) != Some(value) {
                    return false;
                }
            }
        }
        true
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet assigned. The only state a blocked task may hold.
    Pending,
    /// Assigned to an agent, not yet started.
    Assigned,
    /// Dispatched to the agent's process collaborator.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before reaching a terminal outcome.
    Cancelled,
}

impl TaskStatus {
    /// Whether no further status transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// All states, for aggregations that report zero counts.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Selection hint for competing ready tasks. No preemption.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Lowest urgency.
    Low,
    /// Default.
    #[default]
    Medium,
    /// Above normal.
    High,
    /// Highest urgency.
    Urgent,
}

/// A unit of work with dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique id within the manager.
    pub id: String,
    /// Short name.
    pub name: String,
    /// What the task is about.
    pub description: String,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Selection hint.
    pub priority: TaskPriority,
    /// Ids of tasks that must complete before this one may start. Forward
    /// references are tolerated and resolved at check time.
    pub dependencies: Vec<String>,
    /// Capability names an executing agent should declare.
    pub required_capabilities: Vec<String>,
    /// Agent currently responsible for the task.
    pub assigned_agent: Option<String>,
    /// Opaque input payload handed to the agent.
    pub input: Value,
    /// Explicit prompt context. When set, it wins over context inferred
    /// from dependency outputs.
    pub context: Option<String>,
    /// Result payload from a completed run.
    pub result: Option<Value>,
    /// Error message from a failed run.
    pub error: Option<String>,
    /// Number of times the task has been requeued after failure.
    pub attempts: u32,
    /// Open key-value metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task last changed.
    pub updated_at: DateTime<Utc>,
    /// Set exactly once, on first entry to `InProgress`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly once, on first entry to a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Payload for creating a task. Missing fields fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Explicit id; generated when absent.
    pub id: Option<String>,
    /// Short name; derived from the id when empty.
    pub name: String,
    /// What the task is about.
    pub description: String,
    /// Selection hint; `Medium` when absent.
    pub priority: Option<TaskPriority>,
    /// Dependency task ids.
    pub dependencies: Vec<String>,
    /// Capability names an executing agent should declare.
    pub required_capabilities: Vec<String>,
    /// Opaque input payload.
    pub input: Value,
    /// Explicit prompt context.
    pub context: Option<String>,
    /// Open key-value metadata.
    pub metadata: HashMap<String, Value>,
}

impl TaskSpec {
    /// Create a spec with the given name and defaults everywhere else.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the dependency list.
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Set the required capability names.
    pub fn with_required_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    /// Set the input payload.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Set the explicit context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Conjunctive filter over tasks. `None` fields are unconstrained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Accepted statuses.
    pub statuses: Option<Vec<TaskStatus>>,
    /// Accepted priorities.
    pub priorities: Option<Vec<TaskPriority>>,
    /// Required assignee.
    pub assigned_agent: Option<String>,
    /// Metadata entries that must match exactly.
    pub metadata: Option<HashMap<String, Value>>,
}

impl TaskFilter {
    /// Whether the task satisfies every present constraint.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(priorities) = &self.priorities {
            if !priorities.contains(&task.priority) {
                return false;
            }
        }
        if let Some(agent) = &self.assigned_agent {
            if task.assigned_agent.as_ref() != Some(agent) {
                return false;
            }
        }
        if let Some(metadata) = &self.metadata {
            for (key, value) in metadata {
                if task.metadata.get(key) != Some(value) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_builder_defaults() {
        let agent = Agent::new("a1", "Researcher", "worker").with_capability("research");
        assert_eq!(agent.status, AgentStatus::Available);
        assert!(agent.health.is_healthy);
        assert!(agent.has_capability("research"));
        assert!(!agent.has_capability("writing"));
    }

    #[test]
    fn test_agent_filter_conjunction() {
        let agent = Agent::new("a1", "Researcher", "worker")
            .with_capability("research")
            .with_metadata("team", json!("alpha"));

        let mut filter = AgentFilter::default();
        assert!(filter.matches(&agent));

        filter.kinds = Some(vec!["worker".to_string()]);
        filter.capabilities = Some(vec!["research".to_string(), "writing".to_string()]);
        assert!(filter.matches(&agent));

        filter.metadata = Some([("team".to_string(), json!("beta"))].into());
        assert!(!filter.matches(&agent));
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Medium);
    }

    #[test]
    fn test_task_status_wire_format() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, r#""in_progress""#);
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_agent_kind_serializes_as_type() {
        let agent = Agent::new("a1", "Researcher", "worker").with_capability("research");
        let value = serde_json::to_value(&agent).unwrap();
        assert_eq!(value["type"], json!("worker"));
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn test_task_filter_assignee() {
        let spec = TaskSpec::new("t").with_id("t1");
        // Filters operate on tasks, not specs; build the minimal task by hand.
        let now = chrono::Utc::now();
        let task = Task {
            id: "t1".to_string(),
            name: spec.name.clone(),
            description: String::new(),
            status: TaskStatus::Assigned,
            priority: TaskPriority::Medium,
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            assigned_agent: Some("a1".to_string()),
            input: Value::Null,
            context: None,
            result: None,
            error: None,
            attempts: 0,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        let filter = TaskFilter {
            assigned_agent: Some("a1".to_string()),
            ..TaskFilter::default()
        };
        assert!(filter.matches(&task));

        let filter = TaskFilter {
            assigned_agent: Some("a2".to_string()),
            ..TaskFilter::default()
        };
        assert!(!filter.matches(&task));
    }
}
