//! Workflow Engine (spec §4.10): `TaskWorkflow` realizes the task template's
//! node DAG as an `agentflow_durable::Workflow`.
//!
//! Node-type mapping onto the engine's event-driven model:
//! - **agent** → `ScheduleActivity("agent_invoke")`.
//! - **decision** → resolved synchronously against the edge table when
//!   rule-based (pure, no activity needed); `ScheduleActivity("decision_llm")`
//!   when the step asks for an LLM-driven choice.
//! - **approval** → `ScheduleActivity("approval_request")`; when that
//!   activity reports a request was created, the handler returns `vec![]` —
//!   nothing is scheduled, which is what leaves the workflow with no timer or
//!   activity in flight until a `WorkflowSignal` resumes it.
//! - **parallel** / **map_reduce** → concurrent `ScheduleActivity("agent_invoke")`
//!   calls joined by an outstanding-count, since `ScheduleChildWorkflow` has no
//!   completion callback in this engine version.
//!
//! `TaskWorkflow` holds no handle to any service — it is replayed purely from
//! its own callbacks per the engine's determinism requirement. All I/O
//! (agent RPCs, risk assessment + HITL creation, lock acquisition) happens
//! inside the activity implementations below, which *do* hold
//! `Arc<OrchestratorServices>`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use agentflow_durable::{Activity, ActivityContext, ActivityError, ActivityOptions, RetryPolicy};
use agentflow_durable::{Workflow, WorkflowAction, WorkflowError, WorkflowSignal};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clients::{AgentClient, AgentInvokeRequest};
use crate::hitl::HitlManager;
use crate::locks::ResourceLockManager;
use crate::registry::AgentRegistry;
use crate::risk::{AssessmentContext, RiskAssessor};
use crate::tools::ToolSelector;

const INSIGHT_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Agent,
    Decision,
    Approval,
    Parallel,
    MapReduce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub step_id: String,
    pub kind: StepKind,
    /// Free-form per-kind params: agent name/capability for `agent`, LLM
    /// flag + route key for `decision`, risk tags/environment for
    /// `approval`, branch step ids for `parallel`, item list + batch_size
    /// for `map_reduce`.
    pub params: Value,
    /// Default successor for agent/approval/parallel/map_reduce nodes, and
    /// the decision node's default edge when no label matches.
    pub on_success: Option<String>,
    /// Decision node's exact-match label -> step_id table.
    #[serde(default)]
    pub edges: HashMap<String, String>,
    pub on_failure: Option<String>,
    pub rollback_step: Option<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    pub max_attempts: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWorkflowInput {
    pub task_id: Uuid,
    pub description: String,
    pub steps: Vec<StepDefinition>,
    pub entry_step: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWorkflowState {
    pub current_step: Option<String>,
    pub status: RunStatus,
    pub insights: VecDeque<String>,
    pub attempts: HashMap<String, u32>,
    pub pending_approval_request_id: Option<Uuid>,
    pub outputs: HashMap<String, Value>,
    pub failure_reason: Option<String>,
    pub outstanding_branches: usize,
    pub branch_outputs: Vec<Value>,
}

impl Default for TaskWorkflowState {
    fn default() -> Self {
        Self {
            current_step: None,
            status: RunStatus::Running,
            insights: VecDeque::new(),
            attempts: HashMap::new(),
            pending_approval_request_id: None,
            outputs: HashMap::new(),
            failure_reason: None,
            outstanding_branches: 0,
            branch_outputs: Vec::new(),
        }
    }
}

impl TaskWorkflowState {
    fn push_insights(&mut self, new_insights: &[String]) {
        for insight in new_insights {
            self.insights.push_back(insight.clone());
            while self.insights.len() > INSIGHT_WINDOW {
                self.insights.pop_front();
            }
        }
    }
}

pub struct TaskWorkflow {
    input: TaskWorkflowInput,
    steps_by_id: HashMap<String, StepDefinition>,
    state: TaskWorkflowState,
    result: Option<Value>,
    error: Option<WorkflowError>,
}

fn agent_activity_id(step_id: &str, attempt: u32) -> String {
    format!("{step_id}#{attempt}")
}

impl TaskWorkflow {
    /// Live domain state, for callers that need more than the engine's own
    /// `Pending|Running|Completed|Failed|Cancelled` status (e.g. `Suspended`
    /// while an approval is outstanding, which the engine itself never sees).
    pub fn run_status(&self) -> RunStatus {
        self.state.status
    }

    pub fn current_step(&self) -> Option<&str> {
        self.state.current_step.as_deref()
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.state.outputs
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.state.failure_reason.as_deref()
    }

    pub fn pending_approval_request_id(&self) -> Option<Uuid> {
        self.state.pending_approval_request_id
    }

    pub fn total_steps(&self) -> usize {
        self.input.steps.len()
    }

    pub fn completed_step_count(&self) -> usize {
        self.state.outputs.len()
    }

    fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps_by_id.get(step_id)
    }

    fn attempt_for(&self, step_id: &str) -> u32 {
        self.state.attempts.get(step_id).copied().unwrap_or(0)
    }

    fn dispatch(&mut self, step_id: &str) -> Vec<WorkflowAction> {
        let Some(step) = self.step(step_id).cloned() else {
            self.error = Some(WorkflowError::new(format!("unknown step '{step_id}'")));
            return vec![WorkflowAction::fail(
                self.error.clone().expect("set above"),
            )];
        };
        self.state.current_step = Some(step.step_id.clone());

        match step.kind {
            StepKind::Agent => self.schedule_agent(&step),
            StepKind::Decision => self.dispatch_decision(&step),
            StepKind::Approval => self.schedule_approval(&step),
            StepKind::Parallel => self.schedule_branches(&step, branch_ids(&step)),
            StepKind::MapReduce => self.schedule_branches(&step, map_reduce_item_ids(&step)),
        }
    }

    fn schedule_agent(&mut self, step: &StepDefinition) -> Vec<WorkflowAction> {
        let attempt = self.attempt_for(&step.step_id) + 1;
        self.state.attempts.insert(step.step_id.clone(), attempt);

        let input = serde_json::json!({
            "step_id": step.step_id,
            "task_fragment": self.input.description,
            "params": step.params,
            "insights": self.state.insights.iter().collect::<Vec<_>>(),
            "needs": step.needs,
        });

        vec![WorkflowAction::ScheduleActivity {
            activity_id: agent_activity_id(&step.step_id, attempt),
            activity_type: "agent_invoke".to_string(),
            input,
            options: activity_options(step, attempt),
        }]
    }

    fn dispatch_decision(&mut self, step: &StepDefinition) -> Vec<WorkflowAction> {
        let use_llm = step.params.get("use_llm").and_then(Value::as_bool).unwrap_or(false);
        if !use_llm {
            let next = self.resolve_edge(step, None);
            return self.advance_to(next);
        }
        let attempt = self.attempt_for(&step.step_id) + 1;
        self.state.attempts.insert(step.step_id.clone(), attempt);
        vec![WorkflowAction::ScheduleActivity {
            activity_id: agent_activity_id(&step.step_id, attempt),
            activity_type: "decision_llm".to_string(),
            input: serde_json::json!({
                "step_id": step.step_id,
                "task_fragment": self.input.description,
                "params": step.params,
                "edges": step.edges,
            }),
            options: activity_options(step, attempt),
        }]
    }

    /// Matches a decision label against the edge table; unmatched labels
    /// fall through to `on_success` as the default edge, per spec.
    fn resolve_edge(&self, step: &StepDefinition, label: Option<&str>) -> Option<String> {
        match label {
            Some(label) => step
                .edges
                .get(label)
                .cloned()
                .or_else(|| step.on_success.clone()),
            None => step
                .params
                .get("route_on")
                .and_then(Value::as_str)
                .and_then(|label| step.edges.get(label).cloned())
                .or_else(|| step.on_success.clone()),
        }
    }

    fn schedule_approval(&mut self, step: &StepDefinition) -> Vec<WorkflowAction> {
        let attempt = self.attempt_for(&step.step_id) + 1;
        self.state.attempts.insert(step.step_id.clone(), attempt);
        vec![WorkflowAction::ScheduleActivity {
            activity_id: agent_activity_id(&step.step_id, attempt),
            activity_type: "approval_request".to_string(),
            input: serde_json::json!({
                "step_id": step.step_id,
                "task_id": self.input.task_id,
                "params": step.params,
            }),
            options: activity_options(step, attempt),
        }]
    }

    fn schedule_branches(&mut self, step: &StepDefinition, branch_ids: Vec<String>) -> Vec<WorkflowAction> {
        if branch_ids.is_empty() {
            let next = step.on_success.clone();
            return self.advance_to(next);
        }
        self.state.outstanding_branches = branch_ids.len();
        self.state.branch_outputs.clear();
        branch_ids
            .into_iter()
            .enumerate()
            .map(|(i, branch_step_id)| {
                let attempt = 1;
                WorkflowAction::ScheduleActivity {
                    activity_id: format!("{}:{}#{}", step.step_id, branch_step_id, i),
                    activity_type: "agent_invoke".to_string(),
                    input: serde_json::json!({
                        "step_id": branch_step_id,
                        "task_fragment": self.input.description,
                        "params": self.step(&branch_step_id).map(|s| s.params.clone()).unwrap_or(step.params.clone()),
                        "insights": self.state.insights.iter().collect::<Vec<_>>(),
                        "needs": self.step(&branch_step_id).map(|s| s.needs.clone()).unwrap_or_default(),
                    }),
                    options: activity_options(step, attempt),
                }
            })
            .collect()
    }

    fn advance_to(&mut self, next: Option<String>) -> Vec<WorkflowAction> {
        match next {
            Some(next_step) => self.dispatch(&next_step),
            None => {
                self.state.status = RunStatus::Completed;
                self.result = Some(serde_json::json!({
                    "task_id": self.input.task_id,
                    "outputs": self.state.outputs,
                }));
                vec![WorkflowAction::complete(self.result.clone().unwrap())]
            }
        }
    }

    fn fail(&mut self, reason: impl Into<String>) -> Vec<WorkflowAction> {
        let reason = reason.into();
        self.state.status = RunStatus::Failed;
        self.state.failure_reason = Some(reason.clone());

        if let Some(current) = self.state.current_step.clone() {
            if let Some(step) = self.step(&current).cloned() {
                if let Some(rollback) = step.rollback_step.clone() {
                    self.state.status = RunStatus::RolledBack;
                    let attempt = 1;
                    return vec![WorkflowAction::ScheduleActivity {
                        activity_id: format!("{current}:rollback"),
                        activity_type: "agent_invoke".to_string(),
                        input: serde_json::json!({
                            "step_id": rollback,
                            "task_fragment": self.input.description,
                            "params": self.step(&rollback).map(|s| s.params.clone()).unwrap_or(Value::Null),
                            "reason": reason,
                        }),
                        options: activity_options(&step, attempt),
                    }];
                }
            }
        }

        let error = WorkflowError::new(reason).with_code("task_failed");
        self.error = Some(error.clone());
        vec![WorkflowAction::fail(error)]
    }
}

fn branch_ids(step: &StepDefinition) -> Vec<String> {
    step.params
        .get("branches")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn map_reduce_item_ids(step: &StepDefinition) -> Vec<String> {
    step.params
        .get("items")
        .and_then(Value::as_array)
        .map(|arr| (0..arr.len()).map(|i| format!("{}:item:{i}", step.step_id)).collect())
        .unwrap_or_default()
}

fn activity_options(step: &StepDefinition, _attempt: u32) -> ActivityOptions {
    ActivityOptions::default()
        .with_retry(
            RetryPolicy::exponential()
                .with_max_attempts(step.max_attempts.max(1))
                .with_initial_interval(Duration::from_millis(25))
                .with_max_interval(Duration::from_millis(800)),
        )
        .with_start_to_close_timeout(Duration::from_millis(step.timeout_ms.max(1000)))
}

impl Workflow for TaskWorkflow {
    const TYPE: &'static str = "task_workflow";
    type Input = TaskWorkflowInput;
    type Output = Value;

    fn new(input: Self::Input) -> Self {
        let steps_by_id = input
            .steps
            .iter()
            .cloned()
            .map(|s| (s.step_id.clone(), s))
            .collect();
        Self {
            input,
            steps_by_id,
            state: TaskWorkflowState::default(),
            result: None,
            error: None,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        let entry = self.input.entry_step.clone();
        self.dispatch(&entry)
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        let Some(current) = self.state.current_step.clone() else {
            return vec![];
        };
        let Some(step) = self.step(&current).cloned() else {
            return self.fail(format!("completion for unknown step '{current}'"));
        };

        let insights: Vec<String> = result
            .get("captured_insights")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        self.state.push_insights(&insights);

        match step.kind {
            StepKind::Agent => {
                self.state.outputs.insert(step.step_id.clone(), result.get("output").cloned().unwrap_or(Value::Null));
                self.advance_to(step.on_success.clone())
            }
            StepKind::Decision => {
                let label = result.get("label").and_then(Value::as_str);
                match label {
                    Some(label) if !step.edges.contains_key(label) && step.on_success.is_none() => {
                        self.fail(format!("decision step '{}' produced unroutable label '{label}'", step.step_id))
                    }
                    _ => {
                        let next = self.resolve_edge(&step, label);
                        self.advance_to(next)
                    }
                }
            }
            StepKind::Approval => {
                let request_id = result
                    .get("request_id")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok());
                match request_id {
                    Some(id) => {
                        self.state.status = RunStatus::Suspended;
                        self.state.pending_approval_request_id = Some(id);
                        // Nothing scheduled: the engine has nothing to poll
                        // until a resume signal arrives.
                        vec![]
                    }
                    None => self.advance_to(step.on_success.clone()),
                }
            }
            StepKind::Parallel | StepKind::MapReduce => {
                self.state.branch_outputs.push(result.get("output").cloned().unwrap_or(Value::Null));
                self.state.outstanding_branches = self.state.outstanding_branches.saturating_sub(1);
                if self.state.outstanding_branches == 0 {
                    self.state.outputs.insert(
                        step.step_id.clone(),
                        Value::Array(self.state.branch_outputs.clone()),
                    );
                    self.advance_to(step.on_success.clone())
                } else {
                    vec![]
                }
            }
        }
        .into_iter()
        .inspect(|_| {
            let _ = activity_id;
        })
        .collect()
    }

    fn on_activity_failed(&mut self, _activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        let Some(current) = self.state.current_step.clone() else {
            return vec![];
        };
        let Some(step) = self.step(&current).cloned() else {
            return self.fail("unknown step failed");
        };

        if error.retryable && self.attempt_for(&step.step_id) < step.max_attempts {
            return self.dispatch(&step.step_id);
        }

        match step.on_failure.clone() {
            Some(failure_step) => self.advance_to(Some(failure_step)),
            None => self.fail(error.message.clone()),
        }
    }

    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        match signal.signal_type.as_str() {
            "approval_resolved" => {
                let decision = signal.payload.get("decision").and_then(Value::as_str);
                let current = self.state.current_step.clone();
                self.state.pending_approval_request_id = None;
                self.state.status = RunStatus::Running;
                match decision {
                    Some("approved") => {
                        let next = current.and_then(|c| self.step(&c).and_then(|s| s.on_success.clone()));
                        self.advance_to(next)
                    }
                    Some("rejected") => self.fail("rejected"),
                    Some("expired") => self.fail("expired"),
                    _ => self.fail("unknown approval decision"),
                }
            }
            "retry_from_step" => {
                let Some(step_id) = signal.payload.get("step_id").and_then(Value::as_str) else {
                    return vec![];
                };
                if self.step(step_id).is_none() {
                    return vec![];
                }
                self.state.status = RunStatus::Running;
                self.state.pending_approval_request_id = None;
                self.advance_to(Some(step_id.to_string()))
            }
            "cancel" => {
                let reason = signal
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("cancelled")
                    .to_string();
                self.state.status = RunStatus::Cancelled;
                self.error = Some(WorkflowError::new(reason).with_code("cancelled"));
                vec![WorkflowAction::fail(self.error.clone().unwrap())]
            }
            _ => vec![],
        }
    }

    fn is_completed(&self) -> bool {
        matches!(
            self.state.status,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::RolledBack
        )
    }

    fn result(&self) -> Option<Self::Output> {
        if self.state.status == RunStatus::Completed {
            self.result.clone()
        } else {
            None
        }
    }

    fn error(&self) -> Option<WorkflowError> {
        self.error.clone()
    }
}

/// Activity implementation for `"agent_invoke"`: selects tools for the
/// step's role, resolves the named agent in the registry, and performs the
/// §6.2 RPC.
pub struct AgentInvokeActivity {
    pub registry: Arc<AgentRegistry>,
    pub tools: Arc<ToolSelector>,
    pub agent_client: Arc<dyn AgentClient>,
    pub lock_manager: Arc<ResourceLockManager>,
    pub lock_ttl: Duration,
    pub lock_wait_timeout: Duration,
}

#[async_trait]
impl Activity for AgentInvokeActivity {
    const TYPE: &'static str = "agent_invoke";
    type Input = Value;
    type Output = Value;

    async fn execute(&self, ctx: &ActivityContext, input: Self::Input) -> Result<Self::Output, ActivityError> {
        let params = input.get("params").cloned().unwrap_or(Value::Null);
        let agent_name = params
            .get("agent")
            .and_then(Value::as_str)
            .ok_or_else(|| ActivityError::non_retryable("agent_invoke step missing 'params.agent'"))?;
        let role = params.get("role").and_then(Value::as_str).unwrap_or("developer");
        let capability = params.get("capability").and_then(Value::as_str).unwrap_or(agent_name);

        let candidates = self.registry.find_by_capability(capability).await;
        let agent = candidates
            .into_iter()
            .find(|a| a.agent_id == agent_name)
            .ok_or_else(|| ActivityError::retryable(format!("agent '{agent_name}' not currently discoverable")))?;

        // Per spec §4.10: locks are acquired in lexicographic order before
        // dispatching the node and released on every exit path.
        let needs: Vec<String> = input
            .get("needs")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let owner = ctx.workflow_id.to_string();
        if !needs.is_empty() {
            self.lock_manager
                .acquire_ordered(&needs, &owner, self.lock_ttl, Some(self.lock_wait_timeout))
                .await
                .map_err(|e| ActivityError::retryable(e.to_string()))?;
        }

        let result = self.invoke_agent(&agent.base_endpoint, role, capability, &input).await;

        if !needs.is_empty() {
            self.lock_manager.release_all(&needs, &owner).await;
        }
        result
    }
}

impl AgentInvokeActivity {
    async fn invoke_agent(
        &self,
        base_endpoint: &str,
        role: &str,
        _capability: &str,
        input: &Value,
    ) -> Result<Value, ActivityError> {
        let params = input.get("params").cloned().unwrap_or(Value::Null);
        let task_fragment = input
            .get("task_fragment")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tools = self
            .tools
            .select(role, &task_fragment, params.get("token_budget").and_then(Value::as_u64).unwrap_or(4000) as u32)
            .await;
        let tool_values = tools.into_iter().map(|t| t.schema).collect();

        let response = self
            .agent_client
            .invoke(
                base_endpoint,
                AgentInvokeRequest {
                    step_id: input.get("step_id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    task_fragment,
                    context: serde_json::json!({ "insights": input.get("insights").cloned().unwrap_or(Value::Null) }),
                    tools: tool_values,
                    deadline_ms: 30_000,
                },
            )
            .await
            .map_err(|e| ActivityError::retryable(e.to_string()))?;

        if let Some(err) = response.error {
            return Err(ActivityError::retryable(err.to_string()));
        }

        Ok(serde_json::json!({
            "output": response.output,
            "captured_insights": response.captured_insights,
            "next_hint": response.next_hint,
        }))
    }
}

/// Activity implementation for `"approval_request"`: pure risk assessment
/// followed by, when required, `HitlManager::create`.
pub struct ApprovalRequestActivity {
    pub risk_assessor: Arc<RiskAssessor>,
    pub hitl: Arc<HitlManager>,
}

#[async_trait]
impl Activity for ApprovalRequestActivity {
    const TYPE: &'static str = "approval_request";
    type Input = Value;
    type Output = Value;

    async fn execute(&self, ctx: &ActivityContext, input: Self::Input) -> Result<Self::Output, ActivityError> {
        let params = input.get("params").cloned().unwrap_or(Value::Null);
        let mut assessment = AssessmentContext::new();
        if let Some(env) = params.get("environment").and_then(Value::as_str) {
            assessment = assessment.with_environment(env);
        }
        if let Some(tags) = params.get("risk_tags").and_then(Value::as_array) {
            for tag in tags.iter().filter_map(Value::as_str) {
                assessment = assessment.with_tag(tag);
            }
        }
        if let Some(lines) = params.get("diff_lines").and_then(Value::as_u64) {
            assessment = assessment.with_diff_lines(lines);
        }
        let level = self.risk_assessor.assess(&assessment);

        let task_id = input
            .get("task_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::now_v7);

        let request_id = self
            .hitl
            .create(
                task_id,
                ctx.workflow_id.to_string(),
                Uuid::now_v7(),
                params.get("agent").and_then(Value::as_str).unwrap_or("unknown"),
                params,
                level,
                vec![],
            )
            .await;

        Ok(serde_json::json!({ "risk_level": level, "request_id": request_id }))
    }
}

/// Activity implementation for `"decision_llm"`: asks the configured
/// `LlmClient` for a structured `{label}` choice among the step's edges.
pub struct DecisionLlmActivity {
    pub llm: Arc<dyn crate::clients::LlmClient>,
}

#[async_trait]
impl Activity for DecisionLlmActivity {
    const TYPE: &'static str = "decision_llm";
    type Input = Value;
    type Output = Value;

    async fn execute(&self, _ctx: &ActivityContext, input: Self::Input) -> Result<Self::Output, ActivityError> {
        let edges: Vec<String> = input
            .get("edges")
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        let prompt = format!(
            "Task: {}\nChoose one label from {:?}.",
            input.get("task_fragment").and_then(Value::as_str).unwrap_or_default(),
            edges
        );
        let response = self
            .llm
            .complete(crate::clients::LlmCompletionRequest {
                prompt,
                max_tokens: 64,
                structured_output_schema: Some(serde_json::json!({
                    "type": "object",
                    "properties": { "label": { "type": "string", "enum": edges } },
                    "required": ["label"],
                })),
            })
            .await
            .map_err(|e| ActivityError::retryable(e.to_string()))?;

        let label = response
            .structured
            .as_ref()
            .and_then(|v| v.get("label"))
            .and_then(Value::as_str)
            .unwrap_or(&response.text)
            .to_string();
        Ok(serde_json::json!({ "label": label }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_step(step_id: &str, on_success: Option<&str>) -> StepDefinition {
        StepDefinition {
            step_id: step_id.to_string(),
            kind: StepKind::Agent,
            params: serde_json::json!({ "agent": "coder-1", "capability": "code_generation" }),
            on_success: on_success.map(str::to_string),
            edges: HashMap::new(),
            on_failure: None,
            rollback_step: None,
            needs: vec![],
            max_attempts: 3,
            timeout_ms: 30_000,
        }
    }

    fn input_with(steps: Vec<StepDefinition>, entry: &str) -> TaskWorkflowInput {
        TaskWorkflowInput {
            task_id: Uuid::now_v7(),
            description: "test task".to_string(),
            steps,
            entry_step: entry.to_string(),
        }
    }

    #[test]
    fn on_start_schedules_first_agent_step() {
        let input = input_with(vec![agent_step("s1", None)], "s1");
        let mut wf = TaskWorkflow::new(input);
        let actions = wf.on_start();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            WorkflowAction::ScheduleActivity { activity_type, .. } => {
                assert_eq!(activity_type, "agent_invoke");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn single_step_workflow_completes_on_agent_result() {
        let input = input_with(vec![agent_step("s1", None)], "s1");
        let mut wf = TaskWorkflow::new(input);
        wf.on_start();
        let actions = wf.on_activity_completed("s1#1", serde_json::json!({ "output": {"ok": true} }));
        assert!(wf.is_completed());
        assert!(actions.iter().any(|a| matches!(a, WorkflowAction::CompleteWorkflow { .. })));
    }

    #[test]
    fn chained_agent_steps_advance_in_order() {
        let input = input_with(
            vec![agent_step("s1", Some("s2")), agent_step("s2", None)],
            "s1",
        );
        let mut wf = TaskWorkflow::new(input);
        wf.on_start();
        let actions = wf.on_activity_completed("s1#1", serde_json::json!({ "output": {} }));
        assert!(!wf.is_completed());
        match &actions[0] {
            WorkflowAction::ScheduleActivity { activity_id, .. } => assert_eq!(activity_id, "s2#1"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn retryable_failure_reschedules_up_to_max_attempts() {
        let mut step = agent_step("s1", None);
        step.max_attempts = 2;
        let input = input_with(vec![step], "s1");
        let mut wf = TaskWorkflow::new(input);
        wf.on_start();
        let error = ActivityError::retryable("transient");
        let actions = wf.on_activity_failed("s1#1", &error);
        assert!(!wf.is_completed());
        match &actions[0] {
            WorkflowAction::ScheduleActivity { activity_id, .. } => assert_eq!(activity_id, "s1#2"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn exhausted_retries_fail_workflow() {
        let mut step = agent_step("s1", None);
        step.max_attempts = 1;
        let input = input_with(vec![step], "s1");
        let mut wf = TaskWorkflow::new(input);
        wf.on_start();
        let error = ActivityError::retryable("still failing");
        let actions = wf.on_activity_failed("s1#1", &error);
        assert!(wf.is_completed());
        assert!(actions.iter().any(|a| matches!(a, WorkflowAction::FailWorkflow { .. })));
    }

    #[test]
    fn failure_with_rollback_step_dispatches_rollback_agent() {
        let mut step = agent_step("s1", None);
        step.max_attempts = 1;
        step.rollback_step = Some("undo".to_string());
        let rollback = agent_step("undo", None);
        let input = input_with(vec![step, rollback], "s1");
        let mut wf = TaskWorkflow::new(input);
        wf.on_start();
        let error = ActivityError::retryable("fatal");
        let actions = wf.on_activity_failed("s1#1", &error);
        assert!(!wf.is_completed());
        match &actions[0] {
            WorkflowAction::ScheduleActivity { activity_id, .. } => assert_eq!(activity_id, "s1:rollback"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn approval_node_suspends_with_no_scheduled_work() {
        let approval = StepDefinition {
            step_id: "gate".to_string(),
            kind: StepKind::Approval,
            params: serde_json::json!({ "environment": "production", "risk_tags": ["deployment"] }),
            on_success: None,
            edges: HashMap::new(),
            on_failure: None,
            rollback_step: None,
            needs: vec![],
            max_attempts: 1,
            timeout_ms: 30_000,
        };
        let input = input_with(vec![approval], "gate");
        let mut wf = TaskWorkflow::new(input);
        wf.on_start();
        let request_id = Uuid::now_v7();
        let actions = wf.on_activity_completed(
            "gate#1",
            serde_json::json!({ "risk_level": "high", "request_id": request_id.to_string() }),
        );
        assert!(actions.is_empty());
        assert!(!wf.is_completed());
    }

    #[test]
    fn approval_resolved_signal_resumes_to_next_step() {
        let approval = StepDefinition {
            step_id: "gate".to_string(),
            kind: StepKind::Approval,
            params: serde_json::json!({}),
            on_success: Some("s2".to_string()),
            edges: HashMap::new(),
            on_failure: None,
            rollback_step: None,
            needs: vec![],
            max_attempts: 1,
            timeout_ms: 30_000,
        };
        let input = input_with(vec![approval, agent_step("s2", None)], "gate");
        let mut wf = TaskWorkflow::new(input);
        wf.on_start();
        wf.on_activity_completed(
            "gate#1",
            serde_json::json!({ "request_id": Uuid::now_v7().to_string() }),
        );

        let signal = WorkflowSignal::custom("approval_resolved", serde_json::json!({ "decision": "approved" }));
        let actions = wf.on_signal(&signal);
        match &actions[0] {
            WorkflowAction::ScheduleActivity { activity_id, .. } => assert_eq!(activity_id, "s2#1"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn approval_rejected_signal_fails_workflow() {
        let approval = StepDefinition {
            step_id: "gate".to_string(),
            kind: StepKind::Approval,
            params: serde_json::json!({}),
            on_success: Some("s2".to_string()),
            edges: HashMap::new(),
            on_failure: None,
            rollback_step: None,
            needs: vec![],
            max_attempts: 1,
            timeout_ms: 30_000,
        };
        let input = input_with(vec![approval, agent_step("s2", None)], "gate");
        let mut wf = TaskWorkflow::new(input);
        wf.on_start();
        wf.on_activity_completed(
            "gate#1",
            serde_json::json!({ "request_id": Uuid::now_v7().to_string() }),
        );

        let signal = WorkflowSignal::custom("approval_resolved", serde_json::json!({ "decision": "rejected" }));
        let actions = wf.on_signal(&signal);
        assert!(wf.is_completed());
        assert!(actions.iter().any(|a| matches!(a, WorkflowAction::FailWorkflow { .. })));
    }

    #[test]
    fn parallel_node_joins_after_all_branches_complete() {
        let parallel = StepDefinition {
            step_id: "fanout".to_string(),
            kind: StepKind::Parallel,
            params: serde_json::json!({ "branches": ["b1", "b2"] }),
            on_success: None,
            edges: HashMap::new(),
            on_failure: None,
            rollback_step: None,
            needs: vec![],
            max_attempts: 1,
            timeout_ms: 30_000,
        };
        let input = input_with(vec![parallel, agent_step("b1", None), agent_step("b2", None)], "fanout");
        let mut wf = TaskWorkflow::new(input);
        let actions = wf.on_start();
        assert_eq!(actions.len(), 2);

        let still_waiting = wf.on_activity_completed("fanout:b1#0", serde_json::json!({ "output": 1 }));
        assert!(still_waiting.is_empty());
        assert!(!wf.is_completed());

        let finished = wf.on_activity_completed("fanout:b2#1", serde_json::json!({ "output": 2 }));
        assert!(wf.is_completed());
        assert!(finished.iter().any(|a| matches!(a, WorkflowAction::CompleteWorkflow { .. })));
    }

    #[test]
    fn decision_node_routes_on_label() {
        let mut edges = HashMap::new();
        edges.insert("deploy".to_string(), "s_deploy".to_string());
        edges.insert("skip".to_string(), "s_skip".to_string());
        let decision = StepDefinition {
            step_id: "choose".to_string(),
            kind: StepKind::Decision,
            params: serde_json::json!({ "use_llm": true }),
            on_success: Some("s_skip".to_string()),
            edges,
            on_failure: None,
            rollback_step: None,
            needs: vec![],
            max_attempts: 1,
            timeout_ms: 30_000,
        };
        let input = input_with(
            vec![decision, agent_step("s_deploy", None), agent_step("s_skip", None)],
            "choose",
        );
        let mut wf = TaskWorkflow::new(input);
        wf.on_start();
        let actions = wf.on_activity_completed("choose#1", serde_json::json!({ "label": "deploy" }));
        match &actions[0] {
            WorkflowAction::ScheduleActivity { activity_id, .. } => assert_eq!(activity_id, "s_deploy#1"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn cancel_signal_terminates_workflow() {
        let input = input_with(vec![agent_step("s1", None)], "s1");
        let mut wf = TaskWorkflow::new(input);
        wf.on_start();
        let signal = WorkflowSignal::cancel("user requested");
        let actions = wf.on_signal(&signal);
        assert!(wf.is_completed());
        assert!(actions.iter().any(|a| matches!(a, WorkflowAction::FailWorkflow { .. })));
    }
}
