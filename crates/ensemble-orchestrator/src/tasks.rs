use crate::state_paths;
use crate::types::{Task, TaskFilter, TaskSpec, TaskStatus};
use chrono::Utc;
use ensemble_core::{EnsembleError, EnsembleResult};
use ensemble_state::SharedState;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Directory of tasks keyed by id, enforcing the lifecycle state machine
/// and dependency gating.
///
/// Status transitions are monotonic along
/// `pending → assigned → in_progress → {completed|failed}`, with
/// `cancelled` reachable from any non-terminal state. Every mutation is
/// mirrored into the shared state tree at `tasks.<id>`.
pub struct TaskManager {
    tasks: HashMap<String, Task>,
    state: SharedState,
}

impl TaskManager {
    /// Create an empty manager mirroring into the given state tree.
    pub fn new(state: SharedState) -> Self {
        Self {
            tasks: HashMap::new(),
            state,
        }
    }

    /// Create a task from the spec, generating an id when absent.
    ///
    /// Dependencies may reference tasks that do not exist yet; forward
    /// references are resolved when satisfaction is checked.
    pub async fn create(&mut self, spec: TaskSpec) -> EnsembleResult<String> {
        let id = spec.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.tasks.contains_key(&id) {
            return Err(EnsembleError::DuplicateId(format!("task {id}")));
        }

        let now = Utc::now();
        let name = if spec.name.is_empty() {
            format!("task-{id}")
        } else {
            spec.name
        };
        let task = Task {
            id: id.clone(),
            name,
            description: spec.description,
            status: TaskStatus::Pending,
            priority: spec.priority.unwrap_or_default(),
            dependencies: spec.dependencies,
            required_capabilities: spec.required_capabilities,
            assigned_agent: None,
            input: spec.input,
            context: spec.context,
            result: None,
            error: None,
            attempts: 0,
            metadata: spec.metadata,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        let mirror = serde_json::to_value(&task)?;
        self.state.set(&state_paths::task(&id), mirror).await?;
        debug!(task_id = %id, name = %task.name, "task created");
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Assign a pending task to an agent.
    ///
    /// Rejects a task whose dependencies are unsatisfied (a blocked task
    /// never transitions past `Pending`) and a task that is already
    /// assigned (reassignment is a caller error, not a silent overwrite).
    pub async fn assign(&mut self, task_id: &str, agent_id: &str) -> EnsembleResult<()> {
        if !self.dependencies_satisfied(task_id)? {
            return Err(EnsembleError::Validation(format!(
                "task {task_id} has unsatisfied dependencies"
            )));
        }
        {
            let task = self.task_mut(task_id)?;
            match task.status {
                TaskStatus::Pending => {}
                TaskStatus::Assigned => {
                    return Err(EnsembleError::Validation(format!(
                        "task {task_id} is already assigned to {}",
                        task.assigned_agent.as_deref().unwrap_or("unknown")
                    )))
                }
                other => {
                    return Err(EnsembleError::Validation(format!(
                        "task {task_id} cannot be assigned while {other}"
                    )))
                }
            }
            task.assigned_agent = Some(agent_id.to_string());
            task.status = TaskStatus::Assigned;
            task.updated_at = Utc::now();
        }
        debug!(task_id = %task_id, agent_id = %agent_id, "task assigned");
        self.mirror(task_id).await
    }

    /// Transition an assigned task to `InProgress`. `started_at` is set on
    /// the first entry only.
    pub async fn start(&mut self, task_id: &str) -> EnsembleResult<()> {
        {
            let task = self.task_mut(task_id)?;
            if task.status != TaskStatus::Assigned {
                return Err(EnsembleError::Validation(format!(
                    "task {task_id} must be assigned before starting (is {})",
                    task.status
                )));
            }
            let now = Utc::now();
            task.status = TaskStatus::InProgress;
            task.updated_at = now;
            task.started_at.get_or_insert(now);
        }
        self.mirror(task_id).await
    }

    /// Complete a running task with its result payload.
    pub async fn complete(&mut self, task_id: &str, result: Value) -> EnsembleResult<()> {
        {
            let task = self.task_mut(task_id)?;
            if task.status != TaskStatus::InProgress {
                return Err(EnsembleError::Validation(format!(
                    "task {task_id} must be in progress to complete (is {})",
                    task.status
                )));
            }
            let now = Utc::now();
            task.status = TaskStatus::Completed;
            task.updated_at = now;
            task.completed_at.get_or_insert(now);
            task.result = Some(result);
        }
        info!(task_id = %task_id, "task completed");
        self.mirror(task_id).await
    }

    /// Fail an assigned or running task with an error message.
    pub async fn fail(&mut self, task_id: &str, error: impl Into<String>) -> EnsembleResult<()> {
        let error = error.into();
        {
            let task = self.task_mut(task_id)?;
            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                return Err(EnsembleError::Validation(format!(
                    "task {task_id} cannot fail while {}",
                    task.status
                )));
            }
            let now = Utc::now();
            task.status = TaskStatus::Failed;
            task.updated_at = now;
            task.completed_at.get_or_insert(now);
            task.error = Some(error.clone());
        }
        info!(task_id = %task_id, error = %error, "task failed");
        self.mirror(task_id).await
    }

    /// Cancel a task in any non-terminal state.
    pub async fn cancel(&mut self, task_id: &str) -> EnsembleResult<()> {
        {
            let task = self.task_mut(task_id)?;
            if task.status.is_terminal() {
                return Err(EnsembleError::Validation(format!(
                    "task {task_id} is already {}",
                    task.status
                )));
            }
            let now = Utc::now();
            task.status = TaskStatus::Cancelled;
            task.updated_at = now;
            task.completed_at.get_or_insert(now);
        }
        info!(task_id = %task_id, "task cancelled");
        self.mirror(task_id).await
    }

    /// Return a failed task to `Pending` for another attempt, incrementing
    /// its attempt counter and clearing assignment and error.
    pub async fn requeue(&mut self, task_id: &str) -> EnsembleResult<()> {
        {
            let task = self.task_mut(task_id)?;
            if task.status != TaskStatus::Failed {
                return Err(EnsembleError::Validation(format!(
                    "only failed tasks can be requeued (task {task_id} is {})",
                    task.status
                )));
            }
            task.status = TaskStatus::Pending;
            task.assigned_agent = None;
            task.error = None;
            task.attempts += 1;
            task.updated_at = Utc::now();
        }
        debug!(task_id = %task_id, "task requeued");
        self.mirror(task_id).await
    }

    /// Whether every dependency of the task exists and is `Completed`. A
    /// task with no dependencies is trivially satisfied.
    ///
    /// Pure: no side effects, safe to call repeatedly.
    pub fn dependencies_satisfied(&self, task_id: &str) -> EnsembleResult<bool> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| EnsembleError::NotFound(format!("task {task_id}")))?;
        Ok(task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .map(|d| d.status == TaskStatus::Completed)
                .unwrap_or(false)
        }))
    }

    /// Pending tasks whose dependencies are satisfied, in creation order.
    pub fn ready_tasks(&self) -> Vec<Task> {
        let mut ready: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && self.dependencies_satisfied(&t.id).unwrap_or(false)
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        ready
    }

    /// Copy of the task, if present.
    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).cloned()
    }

    /// Copies of all tasks satisfying the filter, in creation order.
    pub fn list(&self, filter: Option<&TaskFilter>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| filter.map_or(true, |f| f.matches(t)))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Task count per status, including zero counts.
    pub fn counts_by_status(&self) -> HashMap<TaskStatus, usize> {
        let mut counts: HashMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    /// Number of tracked tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the manager is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn task_mut(&mut self, task_id: &str) -> EnsembleResult<&mut Task> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| EnsembleError::NotFound(format!("task {task_id}")))
    }

    async fn mirror(&self, task_id: &str) -> EnsembleResult<()> {
        if let Some(task) = self.tasks.get(task_id) {
            let mirror = serde_json::to_value(task)?;
            self.state.set(&state_paths::task(task_id), mirror).await?;
        }
        Ok(())
    }
}
