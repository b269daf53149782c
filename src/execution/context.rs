//! Execution Context and Results
//!
//! Per-invocation data: the request a caller submits, the context the
//! orchestrator builds from it, and the result it produces.

use std::fmt;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::EngineError;
use crate::monitoring::timeline::StepTiming;

/// Scheduling hint carried through to telemetry and persistence.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// What a caller submits to run a definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub definition_id: String,
    pub caller_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub priority: Priority,
}

impl ExecutionRequest {
    pub fn new(definition_id: impl Into<String>, caller_id: impl Into<String>) -> Self {
        Self {
            definition_id: definition_id.into(),
            caller_id: caller_id.into(),
            tenant_id: None,
            input: Value::Object(Map::new()),
            priority: Priority::Normal,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// State of one execution.
///
/// The request fields are fixed at creation; only step outputs accumulate.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    execution_id: String,
    definition_id: String,
    caller_id: String,
    tenant_id: Option<String>,
    input: Value,
    priority: Priority,
    started_at: DateTime<Utc>,
    outputs: Map<String, Value>,
}

impl ExecutionContext {
    /// Creates a context with a fresh execution identifier.
    pub fn new(request: ExecutionRequest) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            definition_id: request.definition_id,
            caller_id: request.caller_id,
            tenant_id: request.tenant_id,
            input: request.input,
            priority: request.priority,
            started_at: Utc::now(),
            outputs: Map::new(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn definition_id(&self) -> &str {
        &self.definition_id
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Step outputs recorded so far, keyed by step id. A step that failed and
    /// was continued past records `{ "error": { "kind", "message" } }`.
    pub fn outputs(&self) -> &Map<String, Value> {
        &self.outputs
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }

    /// Records a step output, replacing an earlier output of the same step.
    pub fn record_output(&mut self, step_id: impl Into<String>, value: Value) {
        self.outputs.insert(step_id.into(), value);
    }

    /// Document that field paths are resolved against: `{ input, steps }`.
    pub fn scope(&self) -> Value {
        json!({
            "input": self.input,
            "steps": self.outputs,
        })
    }
}

/// Lifecycle status of an execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Counters accumulated by the orchestrator.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ExecutionMetrics {
    /// Steps visited, once per visit regardless of outcome
    pub steps_executed: u32,
    pub steps_succeeded: u32,
    pub steps_failed: u32,
    /// Extra attempts made by step retry policies
    pub retries: u32,
    pub duration_ms: u64,
    /// Cost reported by step handlers
    #[serde(default)]
    pub cost: f64,
    /// Tokens reported by step handlers
    #[serde(default)]
    pub tokens: u64,
}

/// Error recorded on a failed result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl ErrorInfo {
    pub fn new(error: &EngineError, step_id: Option<&str>) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            step_id: step_id.map(str::to_string),
        }
    }
}

/// Outcome of one execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub definition_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    /// Finished step visits in execution order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepTiming>,
}

impl ExecutionResult {
    fn with_status(context: &ExecutionContext, status: ExecutionStatus) -> Self {
        Self {
            execution_id: context.execution_id.clone(),
            definition_id: context.definition_id.clone(),
            status,
            started_at: context.started_at,
            completed_at: None,
            output: Value::Null,
            error: None,
            metrics: ExecutionMetrics::default(),
            steps: Vec::new(),
        }
    }

    /// Snapshot handed to asynchronous callers before the task has run.
    pub fn pending(context: &ExecutionContext) -> Self {
        Self::with_status(context, ExecutionStatus::Pending)
    }

    pub fn running(context: &ExecutionContext) -> Self {
        Self::with_status(context, ExecutionStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transitions to `completed`. Ignored if already terminal.
    pub fn complete(&mut self, output: Value) {
        if self.guard_terminal() {
            self.status = ExecutionStatus::Completed;
            self.output = output;
            self.completed_at = Some(Utc::now());
        }
    }

    /// Transitions to `failed`. Ignored if already terminal.
    pub fn fail(&mut self, error: &EngineError, step_id: Option<&str>) {
        if self.guard_terminal() {
            self.status = ExecutionStatus::Failed;
            self.error = Some(ErrorInfo::new(error, step_id));
            self.completed_at = Some(Utc::now());
        }
    }

    fn guard_terminal(&self) -> bool {
        if self.is_terminal() {
            warn!(
                "Execution {} is already {}; ignoring transition",
                self.execution_id, self.status
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            ExecutionRequest::new("wf", "user-1")
                .with_input(json!({"date": "2024-01-31"}))
                .with_tenant("acme")
                .with_priority(Priority::High),
        )
    }

    #[test]
    fn test_context_from_request() {
        let ctx = context();
        assert_eq!(ctx.definition_id(), "wf");
        assert_eq!(ctx.caller_id(), "user-1");
        assert_eq!(ctx.tenant_id(), Some("acme"));
        assert_eq!(ctx.priority(), Priority::High);
        assert!(Uuid::parse_str(ctx.execution_id()).is_ok());
    }

    #[test]
    fn test_execution_ids_are_unique() {
        assert_ne!(context().execution_id(), context().execution_id());
    }

    #[test]
    fn test_scope_contains_input_and_outputs() {
        let mut ctx = context();
        ctx.record_output("fetch", json!({"total": 12}));

        let scope = ctx.scope();
        assert_eq!(scope["input"]["date"], "2024-01-31");
        assert_eq!(scope["steps"]["fetch"]["total"], 12);
    }

    #[test]
    fn test_result_becomes_terminal_once() {
        let ctx = context();
        let mut result = ExecutionResult::running(&ctx);
        assert!(!result.is_terminal());

        result.complete(json!({"ok": true}));
        assert_eq!(result.status, ExecutionStatus::Completed);
        let completed_at = result.completed_at;

        result.fail(&EngineError::Cancelled, None);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(result.error.is_none());
        assert_eq!(result.completed_at, completed_at);
    }

    #[test]
    fn test_failed_result_records_error() {
        let ctx = context();
        let mut result = ExecutionResult::running(&ctx);
        result.fail(&EngineError::NotFound("x".into()), Some("fetch"));

        let error = result.error.unwrap();
        assert_eq!(error.code, "NOT_FOUND");
        assert_eq!(error.step_id.as_deref(), Some("fetch"));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_value(ExecutionStatus::Completed).unwrap(),
            json!("completed")
        );
        assert_eq!(ExecutionStatus::Pending.to_string(), "pending");
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: ExecutionRequest =
            serde_json::from_value(json!({"definition_id": "wf", "caller_id": "cli"})).unwrap();
        assert_eq!(request.priority, Priority::Normal);
        assert!(request.input.is_null());
    }
}
