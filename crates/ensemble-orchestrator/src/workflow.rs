use crate::coordinator::Coordinator;
use crate::state_paths;
use crate::types::{TaskPriority, TaskSpec};
use chrono::{DateTime, Utc};
use ensemble_core::{EnsembleError, EnsembleResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// An organizational participant in a workflow. Work for a unit is carried
/// out by the agent it references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    /// Unique id within the orchestrator.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What the unit is responsible for.
    pub description: String,
    /// The registered agent that executes this unit's tasks.
    pub agent_id: String,
    /// Parent unit id; `None` marks a top-level unit.
    pub parent: Option<String>,
}

impl Unit {
    /// Create a top-level unit.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            agent_id: agent_id.into(),
            parent: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Place the unit under a parent.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

/// Status of a single workflow phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Not yet entered.
    Pending,
    /// Currently executing.
    InProgress,
    /// Finished; collaborator failures may still be recorded per unit.
    Completed,
    /// The phase's essential task failed.
    Failed,
}

/// Planning phase: a lead unit drafts, the other participants collaborate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningPhase {
    /// Unit that produces the plan. Its task blocks the fan-out.
    pub lead_unit: String,
    /// All participating unit ids; the lead is skipped in the fan-out.
    pub participants: Vec<String>,
    /// Declared status; the run's report carries the actual outcome.
    pub status: PhaseStatus,
}

impl PlanningPhase {
    /// Define a planning phase with the given lead and participants.
    pub fn new(lead_unit: impl Into<String>, participants: Vec<String>) -> Self {
        Self {
            lead_unit: lead_unit.into(),
            participants,
            status: PhaseStatus::Pending,
        }
    }
}

/// Execution phase: executor units fan out, a coordinator unit consolidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPhase {
    /// Unit that consolidates the executors' results.
    pub coordinator_unit: String,
    /// All participating unit ids; the coordinator is skipped in the
    /// fan-out.
    pub participants: Vec<String>,
    /// Declared status; the run's report carries the actual outcome.
    pub status: PhaseStatus,
}

impl ExecutionPhase {
    /// Define an execution phase with the given coordinator and
    /// participants.
    pub fn new(coordinator_unit: impl Into<String>, participants: Vec<String>) -> Self {
        Self {
            coordinator_unit: coordinator_unit.into(),
            participants,
            status: PhaseStatus::Pending,
        }
    }
}

/// A two-phase workflow definition. With neither phase declared, the
/// orchestrator runs in simple mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    /// Optional planning phase.
    pub planning: Option<PlanningPhase>,
    /// Optional execution phase.
    pub execution: Option<ExecutionPhase>,
}

/// One participant's outcome within a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOutput {
    /// The unit that worked on the task.
    pub unit_id: String,
    /// Its name, for reporting.
    pub unit_name: String,
    /// The task that carried the work.
    pub task_id: String,
    /// Whether the unit's task completed.
    pub success: bool,
    /// Result payload of a successful task.
    pub output: Option<Value>,
    /// Error message of a failed task.
    pub error: Option<String>,
}

/// Entry in the collaboration log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaboration {
    /// Phase the collaboration happened in.
    pub phase: String,
    /// Participating unit name.
    pub unit: String,
    /// Whether the unit's task completed.
    pub success: bool,
}

/// Report for one executed phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    /// Outcome of the phase.
    pub status: PhaseStatus,
    /// Per-unit outputs, in declaration order (lead/coordinator included).
    pub outputs: Vec<UnitOutput>,
}

/// Final state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// All essential tasks finished.
    Completed,
    /// An essential task or a referenced unit failed.
    Failed,
}

/// What the caller gets back from [`WorkflowOrchestrator::run`].
///
/// Anticipated failures are reported here instead of escaping as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    /// Overall outcome.
    pub status: WorkflowStatus,
    /// Message of the aborting error, if any.
    pub error: Option<String>,
    /// Planning phase report, when the phase ran.
    pub planning: Option<PhaseReport>,
    /// Execution phase report, when the phase ran.
    pub execution: Option<PhaseReport>,
    /// The workflow's final result payload.
    pub final_output: Option<Value>,
    /// Log of every fan-out participation.
    pub collaborations: Vec<Collaboration>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl WorkflowReport {
    /// Whether the run completed.
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

/// Drives two-phase workflows over units, delegating task lifecycle and
/// execution to the [`Coordinator`].
///
/// State machine per run: `pending → in_progress → {completed|failed}`,
/// mirrored at `workflow.status` with start and end timestamps. A missing
/// lead or coordinator unit aborts the whole run; a failed fan-out
/// participant does not.
pub struct WorkflowOrchestrator {
    coordinator: Arc<Coordinator>,
    units: HashMap<String, Unit>,
}

impl WorkflowOrchestrator {
    /// Create an orchestrator without units.
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            units: HashMap::new(),
        }
    }

    /// Add a unit. The referenced agent is resolved at execution time.
    pub fn add_unit(&mut self, unit: Unit) -> EnsembleResult<()> {
        if unit.id.is_empty() {
            return Err(EnsembleError::Validation(
                "unit id must not be empty".to_string(),
            ));
        }
        if unit.agent_id.is_empty() {
            return Err(EnsembleError::Validation(format!(
                "unit {} must reference an agent",
                unit.id
            )));
        }
        if self.units.contains_key(&unit.id) {
            return Err(EnsembleError::DuplicateId(format!("unit {}", unit.id)));
        }
        self.units.insert(unit.id.clone(), unit);
        Ok(())
    }

    /// The unit, if known.
    pub fn unit(&self, id: &str) -> Option<&Unit> {
        self.units.get(id)
    }

    /// All units, sorted by name.
    pub fn units(&self) -> Vec<&Unit> {
        let mut units: Vec<&Unit> = self.units.values().collect();
        units.sort_by(|a, b| a.name.cmp(&b.name));
        units
    }

    /// Run a workflow to completion and report the outcome.
    pub async fn run(&self, topic: &str, workflow: Workflow, input: Value) -> WorkflowReport {
        let started_at = Utc::now();
        self.set_state(state_paths::WORKFLOW_TOPIC, json!(topic)).await;
        self.set_state(state_paths::WORKFLOW_STATUS, json!("in_progress")).await;
        self.set_state(
            state_paths::WORKFLOW_STARTED_AT,
            json!(started_at.to_rfc3339()),
        )
        .await;
        info!(topic = %topic, "workflow started");

        let mut report = WorkflowReport {
            status: WorkflowStatus::Completed,
            error: None,
            planning: None,
            execution: None,
            final_output: None,
            collaborations: Vec::new(),
            started_at,
            finished_at: started_at,
        };

        match self.run_phases(topic, &workflow, &input, &mut report).await {
            Ok(()) => {
                self.set_state(state_paths::WORKFLOW_STATUS, json!("completed")).await;
                info!(topic = %topic, "workflow completed");
            }
            Err(e) => {
                error!(topic = %topic, error = %e, "workflow failed");
                report.status = WorkflowStatus::Failed;
                report.error = Some(e.to_string());
                self.set_state(state_paths::WORKFLOW_STATUS, json!("failed")).await;
                self.set_state(state_paths::WORKFLOW_ERROR, json!(e.to_string())).await;
            }
        }

        report.finished_at = Utc::now();
        self.set_state(
            state_paths::WORKFLOW_FINISHED_AT,
            json!(report.finished_at.to_rfc3339()),
        )
        .await;
        report
    }

    async fn run_phases(
        &self,
        topic: &str,
        workflow: &Workflow,
        input: &Value,
        report: &mut WorkflowReport,
    ) -> EnsembleResult<()> {
        if workflow.planning.is_none() && workflow.execution.is_none() {
            return self.run_simple(topic, input, report).await;
        }

        let mut planning_results = Value::Null;
        if let Some(phase) = &workflow.planning {
            let (phase_report, consolidated) =
                self.run_planning_phase(topic, phase, input, report).await?;
            planning_results = consolidated;
            report.planning = Some(phase_report);
        }
        if let Some(phase) = &workflow.execution {
            let (phase_report, final_output) = self
                .run_execution_phase(topic, phase, &planning_results, report)
                .await?;
            report.execution = Some(phase_report);
            report.final_output = Some(final_output);
        }
        Ok(())
    }

    /// Planning: the lead unit's task runs to completion first, then every
    /// other participant reviews the lead's output concurrently. A failed
    /// collaborator is logged and flagged, but the phase completes as long
    /// as the lead succeeded.
    async fn run_planning_phase(
        &self,
        topic: &str,
        phase: &PlanningPhase,
        input: &Value,
        report: &mut WorkflowReport,
    ) -> EnsembleResult<(PhaseReport, Value)> {
        self.set_state(state_paths::WORKFLOW_PLANNING_STATUS, json!("in_progress")).await;
        info!(lead = %phase.lead_unit, "planning phase started");

        let lead = self.unit_or_err(&phase.lead_unit, "planning lead")?;
        let lead_spec = TaskSpec::new(format!("Draft plan: {topic}"))
            .with_description(format!(
                "Create an implementation plan for \"{topic}\" as the {} unit.",
                lead.name
            ))
            .with_priority(TaskPriority::High)
            .with_input(input.clone())
            .with_metadata("phase", json!("planning"))
            .with_metadata("role", json!("lead"));
        let (lead_task_id, lead_outcome) = self.run_unit_task(&lead, lead_spec).await?;

        let lead_output = match lead_outcome {
            Ok(value) => value,
            Err(e) => {
                report.collaborations.push(Collaboration {
                    phase: "planning".to_string(),
                    unit: lead.name.clone(),
                    success: false,
                });
                self.set_state(state_paths::WORKFLOW_PLANNING_STATUS, json!("failed")).await;
                return Err(EnsembleError::Workflow(format!(
                    "planning lead task failed: {e}"
                )));
            }
        };
        report.collaborations.push(Collaboration {
            phase: "planning".to_string(),
            unit: lead.name.clone(),
            success: true,
        });

        let mut work = Vec::new();
        for unit_id in &phase.participants {
            if unit_id == &phase.lead_unit {
                continue;
            }
            let Some(unit) = self.units.get(unit_id).cloned() else {
                warn!(unit_id = %unit_id, "skipping unknown planning participant");
                continue;
            };
            let spec = TaskSpec::new(format!("Review plan: {topic}"))
                .with_description(format!(
                    "Review and enhance the implementation plan for \"{topic}\" as the {} unit.",
                    unit.name
                ))
                .with_priority(TaskPriority::High)
                .with_dependencies(vec![lead_task_id.clone()])
                .with_context(render_value(&lead_output))
                .with_metadata("phase", json!("planning"))
                .with_metadata("role", json!("collaborator"));
            work.push((unit, spec));
        }
        let collaborator_outputs = self.fan_out("planning", work, report).await?;

        let mut outputs = vec![UnitOutput {
            unit_id: lead.id.clone(),
            unit_name: lead.name.clone(),
            task_id: lead_task_id.clone(),
            success: true,
            output: Some(lead_output.clone()),
            error: None,
        }];
        outputs.extend(collaborator_outputs);

        let consolidated = json!({
            "topic": topic,
            "lead": { "unit": lead.name, "task_id": lead_task_id, "output": lead_output },
            "contributions": outputs.iter().map(|o| json!({
                "unit": o.unit_name,
                "unit_id": o.unit_id,
                "task_id": o.task_id,
                "success": o.success,
                "output": o.output,
                "error": o.error,
            })).collect::<Vec<_>>(),
        });
        self.set_state(state_paths::WORKFLOW_PLANNING_RESULTS, consolidated.clone()).await;
        self.set_state(state_paths::WORKFLOW_PLANNING_STATUS, json!("completed")).await;
        info!(
            lead = %lead.name,
            collaborators = outputs.len() - 1,
            "planning phase completed"
        );

        Ok((
            PhaseReport {
                status: PhaseStatus::Completed,
                outputs,
            },
            consolidated,
        ))
    }

    /// Execution: fan out over every participant except the coordinator
    /// unit, each seeded with the planning results, then run a
    /// consolidation task for the coordinator unit that depends on the
    /// executors' tasks. Its output is the workflow's final result.
    async fn run_execution_phase(
        &self,
        topic: &str,
        phase: &ExecutionPhase,
        planning_results: &Value,
        report: &mut WorkflowReport,
    ) -> EnsembleResult<(PhaseReport, Value)> {
        self.set_state(state_paths::WORKFLOW_EXECUTION_STATUS, json!("in_progress")).await;
        info!(coordinator = %phase.coordinator_unit, "execution phase started");

        let consolidator = self.unit_or_err(&phase.coordinator_unit, "execution coordinator")?;

        let mut work = Vec::new();
        for unit_id in &phase.participants {
            if unit_id == &phase.coordinator_unit {
                continue;
            }
            let Some(unit) = self.units.get(unit_id).cloned() else {
                warn!(unit_id = %unit_id, "skipping unknown execution participant");
                continue;
            };
            let mut spec = TaskSpec::new(format!("Execute plan: {topic}"))
                .with_description(format!(
                    "Implement the {} unit's part of the plan for \"{topic}\".",
                    unit.name
                ))
                .with_priority(TaskPriority::High)
                .with_metadata("phase", json!("execution"))
                .with_metadata("role", json!("executor"));
            if !planning_results.is_null() {
                spec = spec.with_context(render_value(planning_results));
            }
            work.push((unit, spec));
        }
        let executor_outputs = self.fan_out("execution", work, report).await?;

        // The consolidation joins on the completed executor tasks; failed
        // units are surfaced through their success flags instead of
        // blocking the join.
        let completed_ids: Vec<String> = executor_outputs
            .iter()
            .filter(|o| o.success)
            .map(|o| o.task_id.clone())
            .collect();
        let consolidation_spec = TaskSpec::new(format!("Consolidate results: {topic}"))
            .with_description(format!(
                "Consolidate the implementation results for \"{topic}\" into a final report as the {} unit.",
                consolidator.name
            ))
            .with_priority(TaskPriority::High)
            .with_dependencies(completed_ids)
            .with_metadata("phase", json!("execution"))
            .with_metadata("role", json!("coordinator"));
        let (task_id, outcome) = self.run_unit_task(&consolidator, consolidation_spec).await?;

        match outcome {
            Ok(final_output) => {
                report.collaborations.push(Collaboration {
                    phase: "execution".to_string(),
                    unit: consolidator.name.clone(),
                    success: true,
                });
                let mut outputs = executor_outputs;
                outputs.push(UnitOutput {
                    unit_id: consolidator.id.clone(),
                    unit_name: consolidator.name.clone(),
                    task_id,
                    success: true,
                    output: Some(final_output.clone()),
                    error: None,
                });
                self.set_state(state_paths::WORKFLOW_FINAL_RESULTS, final_output.clone()).await;
                self.set_state(state_paths::WORKFLOW_EXECUTION_STATUS, json!("completed")).await;
                info!(coordinator = %consolidator.name, "execution phase completed");
                Ok((
                    PhaseReport {
                        status: PhaseStatus::Completed,
                        outputs,
                    },
                    final_output,
                ))
            }
            Err(e) => {
                report.collaborations.push(Collaboration {
                    phase: "execution".to_string(),
                    unit: consolidator.name.clone(),
                    success: false,
                });
                self.set_state(state_paths::WORKFLOW_EXECUTION_STATUS, json!("failed")).await;
                Err(EnsembleError::Workflow(format!(
                    "consolidation task failed: {e}"
                )))
            }
        }
    }

    /// Simple mode: run one task on a single starting unit, preferring
    /// top-level units.
    async fn run_simple(
        &self,
        topic: &str,
        input: &Value,
        report: &mut WorkflowReport,
    ) -> EnsembleResult<()> {
        let units = self.units();
        let start = units
            .iter()
            .find(|u| u.parent.is_none())
            .copied()
            .or_else(|| units.first().copied())
            .ok_or_else(|| EnsembleError::Workflow("no units registered".to_string()))?
            .clone();
        info!(unit = %start.name, "running simple workflow");

        let spec = TaskSpec::new(format!("Run: {topic}"))
            .with_description(format!("Carry out \"{topic}\" as the {} unit.", start.name))
            .with_input(input.clone())
            .with_metadata("phase", json!("simple"));
        let (_task_id, outcome) = self.run_unit_task(&start, spec).await?;
        match outcome {
            Ok(value) => {
                report.collaborations.push(Collaboration {
                    phase: "simple".to_string(),
                    unit: start.name.clone(),
                    success: true,
                });
                self.set_state(state_paths::WORKFLOW_FINAL_RESULTS, value.clone()).await;
                report.final_output = Some(value);
                Ok(())
            }
            Err(e) => {
                report.collaborations.push(Collaboration {
                    phase: "simple".to_string(),
                    unit: start.name.clone(),
                    success: false,
                });
                Err(EnsembleError::Workflow(format!("task failed: {e}")))
            }
        }
    }

    /// Dispatch a set of unit tasks concurrently and join all of them,
    /// returning per-unit outputs in declaration order.
    async fn fan_out(
        &self,
        phase: &str,
        work: Vec<(Unit, TaskSpec)>,
        report: &mut WorkflowReport,
    ) -> EnsembleResult<Vec<UnitOutput>> {
        let mut join = JoinSet::new();
        let mut order: Vec<String> = Vec::new();
        for (unit, mut spec) in work {
            let prompt = self.assemble_prompt(&unit, &spec).await;
            spec.input = Value::String(prompt);
            let task_id = self.coordinator.create_task(spec).await?;
            self.coordinator.assign_task(&task_id, &unit.agent_id).await?;
            order.push(unit.id.clone());

            let coordinator = Arc::clone(&self.coordinator);
            join.spawn(async move {
                let outcome = coordinator.execute_assigned(&task_id).await;
                (unit, task_id, outcome)
            });
        }

        let mut outputs: Vec<UnitOutput> = Vec::new();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((unit, task_id, outcome)) => {
                    let output = match outcome {
                        Ok(value) => UnitOutput {
                            unit_id: unit.id.clone(),
                            unit_name: unit.name.clone(),
                            task_id,
                            success: true,
                            output: Some(value),
                            error: None,
                        },
                        Err(e) => {
                            warn!(
                                phase = %phase,
                                unit = %unit.name,
                                error = %e,
                                "fan-out task failed; phase continues"
                            );
                            UnitOutput {
                                unit_id: unit.id.clone(),
                                unit_name: unit.name.clone(),
                                task_id,
                                success: false,
                                output: None,
                                error: Some(e.to_string()),
                            }
                        }
                    };
                    report.collaborations.push(Collaboration {
                        phase: phase.to_string(),
                        unit: unit.name,
                        success: output.success,
                    });
                    outputs.push(output);
                }
                Err(e) => error!(phase = %phase, error = %e, "fan-out task panicked"),
            }
        }

        outputs.sort_by_key(|o| {
            order
                .iter()
                .position(|id| id == &o.unit_id)
                .unwrap_or(usize::MAX)
        });
        Ok(outputs)
    }

    /// Create, assign, and execute one task for a unit, applying the
    /// context-assembly contract to its input.
    async fn run_unit_task(
        &self,
        unit: &Unit,
        mut spec: TaskSpec,
    ) -> EnsembleResult<(String, EnsembleResult<Value>)> {
        let prompt = self.assemble_prompt(unit, &spec).await;
        spec.input = Value::String(prompt);
        let task_id = self.coordinator.create_task(spec).await?;
        self.coordinator.assign_task(&task_id, &unit.agent_id).await?;
        let outcome = self.coordinator.execute_assigned(&task_id).await;
        Ok((task_id, outcome))
    }

    /// Concatenate the unit's capability list, the dependency chain's
    /// completed outputs (explicit context wins), and the task's own input.
    ///
    /// Dependency outputs appear in dependency order, so downstream
    /// consolidation sees them deterministically.
    async fn assemble_prompt(&self, unit: &Unit, spec: &TaskSpec) -> String {
        let mut sections = Vec::new();
        if let Some(agent) = self.coordinator.get_agent(&unit.agent_id).await {
            sections.push(format!(
                "Unit {} capabilities: {}",
                unit.name,
                agent.capability_names().join(", ")
            ));
        }

        let context = match &spec.context {
            Some(explicit) => explicit.clone(),
            None => {
                let tasks = self.coordinator.task_manager().read().await;
                let mut parts = Vec::new();
                for dep in &spec.dependencies {
                    if let Some(result) = tasks.get(dep).and_then(|t| t.result) {
                        parts.push(format!("Output of task {dep}:\n{}", render_value(&result)));
                    }
                }
                parts.join("\n\n")
            }
        };
        if !context.is_empty() {
            sections.push(format!("Context:\n{context}"));
        }

        let input = render_value(&spec.input);
        if !input.is_empty() {
            sections.push(format!("Input:\n{input}"));
        }
        sections.join("\n\n")
    }

    fn unit_or_err(&self, id: &str, role: &str) -> EnsembleResult<Unit> {
        self.units
            .get(id)
            .cloned()
            .ok_or_else(|| EnsembleError::Workflow(format!("{role} unit {id} not found")))
    }

    /// Record workflow bookkeeping in shared state. The paths are fixed
    /// constants, so a failure here is log-worthy but never fatal.
    async fn set_state(&self, path: &str, value: Value) {
        if let Err(e) = self.coordinator.state().set(path, value).await {
            warn!(path = %path, error = %e, "failed to record workflow state");
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
