use crate::registry::AgentRegistry;
use crate::tasks::TaskManager;
use crate::types::{Agent, AgentFilter, AgentStatus, Task, TaskFilter, TaskSpec, TaskStatus};
use ensemble_core::{AgentExecutor, EnsembleError, EnsembleResult, ExecutionContext};
use ensemble_state::SharedState;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bounds on concurrent execution and retry behavior.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Upper bound on tasks simultaneously assigned or in progress.
    pub max_concurrent_tasks: usize,
    /// Whether a failed task with remaining budget is requeued.
    pub enable_auto_retry: bool,
    /// How many times a failed task may be requeued.
    pub max_retry_attempts: u32,
    /// Deadline for a single collaborator call.
    pub task_timeout: Duration,
    /// Bounded wait between queue scans in the background loop.
    pub poll_interval: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            enable_auto_retry: true,
            max_retry_attempts: 3,
            task_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Glues the agent registry, task manager, and shared state into a
/// processing loop with capability-based agent selection.
///
/// Cloning yields another handle to the same coordinator.
#[derive(Clone)]
pub struct Coordinator {
    registry: Arc<RwLock<AgentRegistry>>,
    tasks: Arc<RwLock<TaskManager>>,
    executors: Arc<RwLock<HashMap<String, Arc<dyn AgentExecutor>>>>,
    state: SharedState,
    config: ExecutionConfig,
    running: Arc<AtomicBool>,
    in_flight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Coordinator {
    /// Create a coordinator with fresh registry and task manager sharing
    /// the given state tree.
    pub fn new(state: SharedState, config: ExecutionConfig) -> Self {
        Self {
            registry: Arc::new(RwLock::new(AgentRegistry::new(state.clone()))),
            tasks: Arc::new(RwLock::new(TaskManager::new(state.clone()))),
            executors: Arc::new(RwLock::new(HashMap::new())),
            state,
            config,
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The shared state tree.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// The execution configuration.
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// The underlying agent registry.
    pub fn registry(&self) -> &Arc<RwLock<AgentRegistry>> {
        &self.registry
    }

    /// The underlying task manager.
    pub fn task_manager(&self) -> &Arc<RwLock<TaskManager>> {
        &self.tasks
    }

    /// Register an agent together with its process collaborator.
    pub async fn register_agent(
        &self,
        agent: Agent,
        executor: Arc<dyn AgentExecutor>,
    ) -> EnsembleResult<()> {
        let id = agent.id.clone();
        self.registry.write().await.register(agent).await?;
        self.executors.write().await.insert(id, executor);
        Ok(())
    }

    /// Unregister an agent and drop its executor.
    pub async fn unregister_agent(&self, id: &str) -> EnsembleResult<()> {
        self.registry.write().await.unregister(id).await?;
        self.executors.write().await.remove(id);
        Ok(())
    }

    /// Create a task.
    pub async fn create_task(&self, spec: TaskSpec) -> EnsembleResult<String> {
        self.tasks.write().await.create(spec).await
    }

    /// Cancel a task. Only prevents new dispatch; an already-dispatched
    /// collaborator call is not interrupted.
    pub async fn cancel_task(&self, id: &str) -> EnsembleResult<()> {
        self.tasks.write().await.cancel(id).await
    }

    /// Copy of the agent, if registered.
    pub async fn get_agent(&self, id: &str) -> Option<Agent> {
        self.registry.read().await.get(id)
    }

    /// Copy of the task, if present.
    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id)
    }

    /// Agents satisfying the filter.
    pub async fn list_agents(&self, filter: Option<&AgentFilter>) -> Vec<Agent> {
        self.registry.read().await.list(filter)
    }

    /// Tasks satisfying the filter.
    pub async fn list_tasks(&self, filter: Option<&TaskFilter>) -> Vec<Task> {
        self.tasks.read().await.list(filter)
    }

    /// Assign a task to a specific agent, checking that the agent exists in
    /// this coordinator's context.
    pub async fn assign_task(&self, task_id: &str, agent_id: &str) -> EnsembleResult<()> {
        if self.registry.read().await.get(agent_id).is_none() {
            return Err(EnsembleError::NotFound(format!("agent {agent_id}")));
        }
        self.tasks.write().await.assign(task_id, agent_id).await
    }

    /// Select the most suitable agent for a task.
    ///
    /// Candidates are available, healthy agents whose capability set
    /// intersects the task's required capabilities (a task with no
    /// requirements accepts any available agent). Ties prefer the agent
    /// with the most matching capabilities, then the least recently active
    /// one, to spread load.
    pub async fn find_suitable_agent(&self, task: &Task) -> Option<Agent> {
        let registry = self.registry.read().await;
        let mut candidates: Vec<(usize, Agent)> = registry
            .agents_in_status(AgentStatus::Available)
            .into_iter()
            .filter(|a| registry.is_available(&a.id))
            .filter_map(|a| {
                if task.required_capabilities.is_empty() {
                    return Some((0, a));
                }
                let matching = task
                    .required_capabilities
                    .iter()
                    .filter(|c| a.has_capability(c))
                    .count();
                if matching == 0 {
                    None
                } else {
                    Some((matching, a))
                }
            })
            .collect();

        if candidates.is_empty() {
            debug!(task_id = %task.id, "no eligible agent for task");
            return None;
        }

        candidates.sort_by(|(matches_a, a), (matches_b, b)| {
            matches_b
                .cmp(matches_a)
                .then(a.last_active.cmp(&b.last_active))
        });
        candidates.into_iter().next().map(|(_, agent)| agent)
    }

    /// Select and assign an agent for the task right now.
    ///
    /// Fails with `NoEligibleAgent` when no available agent matches; that
    /// failure is recoverable — the task stays pending and may be retried
    /// on a later scan.
    pub async fn try_assign(&self, task_id: &str) -> EnsembleResult<Agent> {
        let task = self
            .get_task(task_id)
            .await
            .ok_or_else(|| EnsembleError::NotFound(format!("task {task_id}")))?;
        let agent = self.find_suitable_agent(&task).await.ok_or_else(|| {
            EnsembleError::NoEligibleAgent(format!("task {task_id}"))
        })?;
        self.tasks.write().await.assign(task_id, &agent.id).await?;
        self.registry
            .write()
            .await
            .update_status(&agent.id, AgentStatus::Busy)
            .await?;
        Ok(agent)
    }

    /// One scan over the queue: pick up ready tasks by priority, assign
    /// them to suitable agents, and spawn their execution. Returns how many
    /// tasks were dispatched.
    ///
    /// A task without an eligible agent stays pending and is retried on the
    /// next scan.
    pub async fn process_ready_tasks(&self) -> EnsembleResult<usize> {
        let mut ready = { self.tasks.read().await.ready_tasks() };
        if ready.is_empty() {
            return Ok(0);
        }
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        let active = {
            let counts = self.tasks.read().await.counts_by_status();
            counts[&TaskStatus::Assigned] + counts[&TaskStatus::InProgress]
        };
        let slots = self.config.max_concurrent_tasks.saturating_sub(active);

        let mut dispatched = 0;
        for task in ready.into_iter().take(slots) {
            match self.try_assign(&task.id).await {
                Ok(_) => {}
                Err(EnsembleError::NoEligibleAgent(_)) => {
                    debug!(task_id = %task.id, "task stays pending: no eligible agent");
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "skipping task that could not be assigned");
                    continue;
                }
            }

            let this = self.clone();
            let task_id = task.id.clone();
            let handle = tokio::spawn(async move {
                // The outcome is recorded on the task; the error here is
                // only of interest to the log.
                if let Err(e) = this.execute_assigned(&task_id).await {
                    debug!(task_id = %task_id, error = %e, "task execution ended in failure");
                }
            });
            self.in_flight.lock().await.push(handle);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Execute a task that is already assigned: start it, invoke the
    /// agent's process collaborator with the dependency outputs in context,
    /// race it against the configured timeout, and record the outcome.
    ///
    /// Returns the collaborator's result payload on success.
    pub async fn execute_assigned(&self, task_id: &str) -> EnsembleResult<Value> {
        let (task, agent_id) = {
            let tasks = self.tasks.read().await;
            let task = tasks
                .get(task_id)
                .ok_or_else(|| EnsembleError::NotFound(format!("task {task_id}")))?;
            let agent_id = task
                .assigned_agent
                .clone()
                .ok_or_else(|| EnsembleError::Validation(format!("task {task_id} is not assigned")))?;
            (task, agent_id)
        };
        let executor = self
            .executors
            .read()
            .await
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| EnsembleError::NotFound(format!("executor for agent {agent_id}")))?;

        let ctx = self.build_context(&task, &agent_id).await;
        self.tasks.write().await.start(task_id).await?;
        info!(task_id = %task_id, agent_id = %agent_id, "task dispatched");

        let outcome = tokio::time::timeout(
            self.config.task_timeout,
            executor.process(task.input.clone(), &ctx),
        )
        .await;

        match outcome {
            Ok(Ok(result)) => {
                // Restore the agent even if the task was cancelled while the
                // collaborator was still running (the result is discarded).
                let completed = self.tasks.write().await.complete(task_id, result.clone()).await;
                {
                    let mut registry = self.registry.write().await;
                    if registry.get(&agent_id).is_some() {
                        registry.update_status(&agent_id, AgentStatus::Available).await?;
                    }
                }
                completed?;
                info!(task_id = %task_id, agent_id = %agent_id, "task succeeded");
                Ok(result)
            }
            Ok(Err(e)) => {
                let err = match e {
                    EnsembleError::Collaborator(_) => e,
                    other => EnsembleError::Collaborator(other.to_string()),
                };
                self.record_failure(task_id, &agent_id, &err).await?;
                Err(err)
            }
            Err(_) => {
                let err = EnsembleError::Timeout(format!(
                    "task {task_id} exceeded {:?}",
                    self.config.task_timeout
                ));
                self.record_failure(task_id, &agent_id, &err).await?;
                Err(err)
            }
        }
    }

    /// Spawn the background processing loop: scan, dispatch, then wait
    /// `poll_interval` before the next scan. An empty ready set is normal.
    pub fn start(&self) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("coordinator started");
        let this = self.clone();
        tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                if let Err(e) = this.process_ready_tasks().await {
                    error!(error = %e, "task queue scan failed");
                }
                tokio::time::sleep(this.config.poll_interval).await;
            }
        })
    }

    /// Stop the loop. Already-dispatched tasks run to completion; only new
    /// dispatch is suppressed.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.drain().await;
        info!("coordinator stopped");
    }

    /// Whether the background loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Repeatedly scan and join dispatched work until no task is ready and
    /// nothing is running. Tasks that never find an eligible agent stay
    /// pending.
    pub async fn run_until_idle(&self) -> EnsembleResult<()> {
        loop {
            let dispatched = self.process_ready_tasks().await?;
            let in_flight = { self.in_flight.lock().await.len() };
            if dispatched == 0 && in_flight == 0 {
                return Ok(());
            }
            self.drain().await;
        }
    }

    async fn drain(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut in_flight = self.in_flight.lock().await;
                in_flight.drain(..).collect()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    /// Context for a collaborator call: the task's metadata as config and
    /// its dependencies' completed outputs, keyed by task id.
    async fn build_context(&self, task: &Task, agent_id: &str) -> ExecutionContext {
        let outputs = {
            let tasks = self.tasks.read().await;
            task.dependencies
                .iter()
                .filter_map(|dep| {
                    tasks
                        .get(dep)
                        .and_then(|d| d.result.map(|r| (dep.clone(), r)))
                })
                .collect()
        };
        ExecutionContext {
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
            config: task.metadata.clone(),
            outputs,
        }
    }

    /// Record a collaborator failure or timeout: fail the task, mark the
    /// agent errored with an unhealthy heartbeat, and requeue the task if
    /// retry budget remains.
    async fn record_failure(
        &self,
        task_id: &str,
        agent_id: &str,
        err: &EnsembleError,
    ) -> EnsembleResult<()> {
        warn!(task_id = %task_id, agent_id = %agent_id, error = %err, "task failed");
        {
            let mut registry = self.registry.write().await;
            if registry.get(agent_id).is_some() {
                registry
                    .record_heartbeat(agent_id, false, Some(err.to_string()))
                    .await?;
                registry.update_status(agent_id, AgentStatus::Error).await?;
            }
        }
        if let Err(e) = self.tasks.write().await.fail(task_id, err.to_string()).await {
            // The task was cancelled while the collaborator was running.
            debug!(task_id = %task_id, error = %e, "failure outcome discarded");
            return Ok(());
        }
        if self.config.enable_auto_retry {
            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get(task_id) {
                if task.attempts < self.config.max_retry_attempts {
                    tasks.requeue(task_id).await?;
                    info!(task_id = %task_id, attempt = task.attempts + 1, "task requeued for retry");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl AgentExecutor for Echo {
        async fn process(&self, input: Value, _ctx: &ExecutionContext) -> EnsembleResult<Value> {
            Ok(input)
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(SharedState::new(), ExecutionConfig::default())
    }

    async fn register(coordinator: &Coordinator, id: &str, capability: &str) {
        let agent = Agent::new(id, id.to_uppercase(), "worker").with_capability(capability);
        coordinator.register_agent(agent, Arc::new(Echo)).await.unwrap();
    }

    #[tokio::test]
    async fn test_selection_requires_available_status() {
        let coordinator = coordinator();
        register(&coordinator, "a1", "research").await;

        for status in [AgentStatus::Busy, AgentStatus::Offline, AgentStatus::Error] {
            coordinator
                .registry()
                .write()
                .await
                .update_status("a1", status)
                .await
                .unwrap();
            let task_id = coordinator
                .create_task(TaskSpec::new("t").with_required_capabilities(vec!["research".into()]))
                .await
                .unwrap();
            let task = coordinator.get_task(&task_id).await.unwrap();
            assert!(coordinator.find_suitable_agent(&task).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_selection_requires_health() {
        let coordinator = coordinator();
        register(&coordinator, "a1", "research").await;
        coordinator
            .registry()
            .write()
            .await
            .record_heartbeat("a1", false, Some("down".to_string()))
            .await
            .unwrap();

        let task_id = coordinator.create_task(TaskSpec::new("t")).await.unwrap();
        let task = coordinator.get_task(&task_id).await.unwrap();
        assert!(coordinator.find_suitable_agent(&task).await.is_none());
    }

    #[tokio::test]
    async fn test_selection_requires_capability_overlap() {
        let coordinator = coordinator();
        register(&coordinator, "a1", "research").await;

        let task_id = coordinator
            .create_task(TaskSpec::new("t").with_required_capabilities(vec!["writing".into()]))
            .await
            .unwrap();
        let task = coordinator.get_task(&task_id).await.unwrap();
        assert!(coordinator.find_suitable_agent(&task).await.is_none());
    }

    #[tokio::test]
    async fn test_selection_prefers_most_matching_capabilities() {
        let coordinator = coordinator();
        register(&coordinator, "a1", "research").await;
        let polyglot = Agent::new("a2", "Polyglot", "worker")
            .with_capability("research")
            .with_capability("writing");
        coordinator.register_agent(polyglot, Arc::new(Echo)).await.unwrap();

        let task_id = coordinator
            .create_task(
                TaskSpec::new("t")
                    .with_required_capabilities(vec!["research".into(), "writing".into()]),
            )
            .await
            .unwrap();
        let task = coordinator.get_task(&task_id).await.unwrap();
        let selected = coordinator.find_suitable_agent(&task).await.unwrap();
        assert_eq!(selected.id, "a2");
    }

    #[tokio::test]
    async fn test_selection_spreads_load_to_least_recently_active() {
        let coordinator = coordinator();
        register(&coordinator, "a1", "research").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        register(&coordinator, "a2", "research").await;

        // a2 became active later, so a1 is least recently active.
        let task_id = coordinator
            .create_task(TaskSpec::new("t").with_required_capabilities(vec!["research".into()]))
            .await
            .unwrap();
        let task = coordinator.get_task(&task_id).await.unwrap();
        let selected = coordinator.find_suitable_agent(&task).await.unwrap();
        assert_eq!(selected.id, "a1");
    }

    #[tokio::test]
    async fn test_concurrency_limit_bounds_dispatch() {
        let config = ExecutionConfig {
            max_concurrent_tasks: 1,
            ..ExecutionConfig::default()
        };
        let coordinator = Coordinator::new(SharedState::new(), config);
        register(&coordinator, "a1", "work").await;
        register(&coordinator, "a2", "work").await;

        coordinator.create_task(TaskSpec::new("t1")).await.unwrap();
        coordinator.create_task(TaskSpec::new("t2")).await.unwrap();

        let dispatched = coordinator.process_ready_tasks().await.unwrap();
        assert_eq!(dispatched, 1);
    }

    #[tokio::test]
    async fn test_try_assign_reports_no_eligible_agent() {
        let coordinator = coordinator();
        register(&coordinator, "a1", "research").await;

        let task_id = coordinator
            .create_task(TaskSpec::new("t").with_required_capabilities(vec!["writing".into()]))
            .await
            .unwrap();
        let err = coordinator.try_assign(&task_id).await.unwrap_err();
        assert!(matches!(err, EnsembleError::NoEligibleAgent(_)));
        assert_eq!(
            coordinator.get_task(&task_id).await.unwrap().status,
            TaskStatus::Pending
        );

        let err = coordinator.try_assign("missing").await.unwrap_err();
        assert!(matches!(err, EnsembleError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_assign_task_requires_known_agent() {
        let coordinator = coordinator();
        let task_id = coordinator.create_task(TaskSpec::new("t")).await.unwrap();
        let err = coordinator.assign_task(&task_id, "ghost").await.unwrap_err();
        assert!(matches!(err, EnsembleError::NotFound(_)));
    }

    #[test]
    fn test_config_defaults() {
        let config = ExecutionConfig::default();
        assert_eq!(config.max_concurrent_tasks, 5);
        assert!(config.enable_auto_retry);
        assert_eq!(config.max_retry_attempts, 3);
    }
}
