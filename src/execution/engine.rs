//! Execution Orchestrator
//!
//! Walks a definition's steps from its entry step, one at a time:
//! - Dispatches each step, bounded by its per-step timeout
//! - Applies the step's `on_error` policy, including retry with backoff
//! - Accumulates metrics and the step timeline
//! - Emits lifecycle telemetry and persists the terminal result
//!
//! Request-level problems (unknown definition, bad input, admission
//! rejection) are returned as `Err` before anything runs. Everything that
//! goes wrong afterwards ends up in a `failed` [`ExecutionResult`].

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::context::{ErrorInfo, ExecutionContext, ExecutionRequest, ExecutionResult};
use super::dispatcher::{StepDispatcher, StepHandler, StepOutcome, Transition};
use super::store::{ExecutionRecord, ExecutionStore};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result, StepError};
use crate::monitoring::{EventType, ExecutionTimeline, LifecycleEvent, LogTelemetry, TelemetrySink};
use crate::resilience::guard::REQUEST_BODY;
use crate::resilience::{retry_with_backoff, BreakerSnapshot, ExhaustedAction, Sleeper, TokioSleeper};
use crate::workflow::model::{Definition, OnError, Step};
use crate::workflow::DefinitionRegistry;

/// Workflow and agent execution engine.
///
/// Cheap to clone; clones share the registry, handlers, breakers and
/// resource guard.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::execution::{Engine, ExecutionRequest};
/// use flowrunner::workflow::{Definition, Step};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::default();
///     engine.register(
///         Definition::new("pause", "wait")
///             .with_step(Step::delay("wait", 50))
///             .with_step(Step::terminal("done")),
///     )?;
///
///     let result = engine
///         .execute_sync(ExecutionRequest::new("pause", "cli"))
///         .await?;
///     println!("{} in {} ms", result.status, result.metrics.duration_ms);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    registry: Arc<DefinitionRegistry>,
    dispatcher: Arc<StepDispatcher>,
    telemetry: Arc<dyn TelemetrySink>,
    store: Option<Arc<dyn ExecutionStore>>,
    sleeper: Arc<dyn Sleeper>,
}

/// Mutable state of one execution, owned outside the step walk so it
/// survives an execution timeout.
struct Run {
    context: ExecutionContext,
    result: ExecutionResult,
    timeline: ExecutionTimeline,
    current: Option<String>,
}

impl Engine {
    /// Creates an engine with breakers and limits built from `config`.
    pub fn new(config: EngineConfig) -> Self {
        let dispatcher = StepDispatcher::new(
            Arc::new(config.breaker_registry()),
            Arc::new(config.resource_guard()),
        );

        Self {
            config: Arc::new(config),
            registry: Arc::new(DefinitionRegistry::new()),
            dispatcher: Arc::new(dispatcher),
            telemetry: Arc::new(LogTelemetry),
            store: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Shares an existing definition registry.
    pub fn with_registry(mut self, registry: Arc<DefinitionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Persists every terminal result to `store`.
    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the sleeper used between retry attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &StepDispatcher {
        &self.dispatcher
    }

    /// Validates and registers a definition.
    pub fn register(&self, definition: Definition) -> Result<Arc<Definition>> {
        self.registry.register(definition)
    }

    /// Registers the handler behind an `external-call` handler name.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.dispatcher.register_handler(name, handler);
    }

    /// State of every circuit breaker created so far.
    pub fn breaker_snapshot(&self) -> Vec<BreakerSnapshot> {
        self.dispatcher.breakers().snapshot()
    }

    /// Runs an execution to completion and returns its terminal result.
    pub async fn execute_sync(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Like [`execute_sync`](Self::execute_sync), stopping early if `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let (definition, context) = self.prepare(request)?;
        Ok(self.run(definition, context, cancel).await)
    }

    /// Starts an execution as a background task and returns immediately.
    ///
    /// The returned handle carries a `pending` snapshot with the execution id.
    /// Dropping the handle detaches the task; its outcome is then only visible
    /// through telemetry and the execution store. Must be called from within
    /// a tokio runtime.
    pub fn execute_async(&self, request: ExecutionRequest) -> Result<ExecutionHandle> {
        let (definition, context) = self.prepare(request)?;
        let snapshot = ExecutionResult::pending(&context);
        let cancel = CancellationToken::new();

        let engine = self.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move { engine.run(definition, context, token).await });

        info!(
            "Execution {} of '{}' scheduled",
            snapshot.execution_id, snapshot.definition_id
        );

        Ok(ExecutionHandle {
            snapshot,
            cancel,
            join,
        })
    }

    /// Request-level validation: lookup, input, handlers, admission.
    fn prepare(&self, request: ExecutionRequest) -> Result<(Arc<Definition>, ExecutionContext)> {
        let definition = self.registry.get(&request.definition_id)?;
        if definition.deprecated {
            warn!("Definition '{}' is deprecated", definition.id);
        }

        let request = validate_request(request, &definition)?;

        let missing = self.dispatcher.missing_handlers(&definition);
        if !missing.is_empty() {
            return Err(EngineError::InvalidDefinition(format!(
                "'{}' uses unregistered handlers: {}",
                definition.id,
                missing.join(", ")
            )));
        }

        let size = serde_json::to_vec(&request.input)?.len() as u64;
        let decision = self.dispatcher.guard().check(REQUEST_BODY, size);
        if !decision.allowed {
            return Err(EngineError::RateLimited {
                resource: REQUEST_BODY.to_string(),
                reset_in_ms: decision.reset_in.as_millis() as u64,
            });
        }

        Ok((definition, ExecutionContext::new(request)))
    }

    async fn run(
        &self,
        definition: Arc<Definition>,
        context: ExecutionContext,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let mut run = Run {
            result: ExecutionResult::running(&context),
            context,
            timeline: ExecutionTimeline::new(),
            current: None,
        };

        info!(
            "Execution {} of '{}' started ({} steps)",
            run.context.execution_id(),
            definition.id,
            definition.len()
        );
        self.telemetry.emit(LifecycleEvent::Started {
            execution_id: run.context.execution_id().to_string(),
            definition_id: definition.id.clone(),
            caller_id: run.context.caller_id().to_string(),
            tenant_id: run.context.tenant_id().map(str::to_string),
            priority: run.context.priority(),
            timestamp: run.context.started_at(),
        });

        let start = Instant::now();
        let walked = match definition.timeout_ms.or(self.config.execution_timeout_ms) {
            Some(budget_ms) => {
                let limited = tokio::time::timeout(
                    Duration::from_millis(budget_ms),
                    self.walk(&definition, &mut run, &cancel),
                )
                .await;
                match limited {
                    Ok(outcome) => outcome,
                    Err(_) => Err(EngineError::Timeout {
                        scope: "execution".to_string(),
                        after_ms: budget_ms,
                    }),
                }
            }
            None => self.walk(&definition, &mut run, &cancel).await,
        };

        run.result.metrics.duration_ms = start.elapsed().as_millis() as u64;
        run.result.steps = run.timeline.summary();
        debug!("{}", run.timeline.gantt_chart());

        match walked {
            Ok(output) => {
                run.result.complete(output);
                info!(
                    "Execution {} completed in {} ms ({} steps)",
                    run.result.execution_id,
                    run.result.metrics.duration_ms,
                    run.result.metrics.steps_executed
                );
                self.telemetry.emit(LifecycleEvent::Completed {
                    execution_id: run.result.execution_id.clone(),
                    definition_id: run.result.definition_id.clone(),
                    timestamp: chrono::Utc::now(),
                    metrics: run.result.metrics.clone(),
                });
            }
            Err(e) => {
                let step_id = run.current.as_deref();
                run.result.fail(&e, step_id);
                error!("Execution {} failed: {}", run.result.execution_id, e);
                self.telemetry.emit(LifecycleEvent::Failed {
                    execution_id: run.result.execution_id.clone(),
                    definition_id: run.result.definition_id.clone(),
                    timestamp: chrono::Utc::now(),
                    metrics: run.result.metrics.clone(),
                    error: ErrorInfo::new(&e, step_id),
                });
            }
        }

        self.persist(&run.context, &run.result).await;
        run.result
    }

    /// Visits steps until one stops the execution, none is left, or a step
    /// failure is fatal.
    async fn walk(
        &self,
        definition: &Definition,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let max_steps = self.config.max_steps;
        let mut next = Some(definition.entry_step.clone());
        let mut visits: u32 = 0;

        while let Some(step_id) = next.take() {
            if cancel.is_cancelled() {
                info!("Execution {} cancelled before step '{}'", run.context.execution_id(), step_id);
                return Err(EngineError::Cancelled);
            }
            if visits >= max_steps {
                return Err(EngineError::StepLimit { limit: max_steps });
            }

            let step = definition.get_step(&step_id).ok_or_else(|| {
                EngineError::InvalidDefinition(format!("step '{}' is not defined", step_id))
            })?;

            visits += 1;
            run.current = Some(step.id.clone());
            run.result.metrics.steps_executed += 1;
            run.timeline.add_event(step.id.as_str(), EventType::Started);
            debug!("Step '{}' ({}) started", step.id, step.config.type_name());

            let attempt = self
                .run_step(step, &run.context, cancel, &mut run.result.metrics.retries)
                .await;

            match attempt {
                Ok(StepOutcome { output, transition }) => {
                    let metrics = &mut run.result.metrics;
                    metrics.steps_succeeded += 1;
                    metrics.cost += output.cost;
                    metrics.tokens += output.tokens;
                    run.timeline.add_event(step.id.as_str(), EventType::Completed);
                    debug!("Step '{}' completed", step.id);

                    match transition {
                        Transition::Stop => {
                            let result = if output.value.is_null() {
                                Value::Object(run.context.outputs().clone())
                            } else {
                                output.value.clone()
                            };
                            run.context.record_output(step.id.clone(), output.value);
                            return Ok(result);
                        }
                        Transition::Goto(target) => {
                            run.context.record_output(step.id.clone(), output.value);
                            next = Some(target);
                        }
                        Transition::Next => {
                            run.context.record_output(step.id.clone(), output.value);
                            next = successor(definition, step);
                        }
                    }
                }
                Err(StepError::Cancelled) => {
                    run.timeline.add_event(step.id.as_str(), EventType::Failed);
                    info!("Execution {} cancelled during step '{}'", run.context.execution_id(), step.id);
                    return Err(EngineError::Cancelled);
                }
                Err(e) => {
                    run.result.metrics.steps_failed += 1;
                    run.timeline.add_event(step.id.as_str(), EventType::Failed);

                    match failure_action(step) {
                        ExhaustedAction::Fail => {
                            warn!("Step '{}' failed: {}", step.id, e);
                            return Err(EngineError::from_step(&step.id, e));
                        }
                        ExhaustedAction::Continue => {
                            warn!("Step '{}' failed, continuing: {}", step.id, e);
                            run.context.record_output(
                                step.id.clone(),
                                json!({ "error": { "kind": e.kind(), "message": e.to_string() } }),
                            );
                            next = successor(definition, step);
                        }
                    }
                }
            }
        }

        Ok(Value::Object(run.context.outputs().clone()))
    }

    /// Runs a step once, or under its retry policy when `on_error` is `retry`.
    async fn run_step(
        &self,
        step: &Step,
        context: &ExecutionContext,
        cancel: &CancellationToken,
        retries: &mut u32,
    ) -> std::result::Result<StepOutcome, StepError> {
        let timeout_ms = step.timeout_ms.or(self.config.step_timeout_ms);

        let policy = match (step.on_error, step.retry.as_ref()) {
            (OnError::Retry, Some(policy)) => policy,
            _ => return self.attempt(step, context, cancel, timeout_ms).await,
        };

        let mut extra = 0;
        let retried = retry_with_backoff(
            policy,
            self.sleeper.as_ref(),
            |e: &StepError| policy.is_retryable(e),
            |attempt, e: &StepError, _| {
                extra += 1;
                debug!("Step '{}' attempt {} failed ({})", step.id, attempt, e.kind());
            },
            |_| self.attempt(step, context, cancel, timeout_ms),
        );

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            outcome = retried => outcome,
        };
        *retries += extra;
        outcome
    }

    async fn attempt(
        &self,
        step: &Step,
        context: &ExecutionContext,
        cancel: &CancellationToken,
        timeout_ms: Option<u64>,
    ) -> std::result::Result<StepOutcome, StepError> {
        self.dispatcher
            .dispatch_within(step, context, cancel, timeout_ms.map(Duration::from_millis))
            .await
    }

    async fn persist(&self, context: &ExecutionContext, result: &ExecutionResult) {
        let Some(store) = &self.store else {
            return;
        };
        let record = ExecutionRecord::new(context, result);
        if let Err(e) = store.save(&record).await {
            error!(
                "Failed to persist execution {}: {}",
                result.execution_id, e
            );
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Handle to an execution running in the background.
pub struct ExecutionHandle {
    snapshot: ExecutionResult,
    cancel: CancellationToken,
    join: JoinHandle<ExecutionResult>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.snapshot.execution_id
    }

    /// Result as it was when the execution was scheduled.
    pub fn snapshot(&self) -> &ExecutionResult {
        &self.snapshot
    }

    /// Requests cancellation; the execution ends `failed` with `CANCELLED`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the terminal result.
    pub async fn wait(self) -> Result<ExecutionResult> {
        self.join
            .await
            .map_err(|e| EngineError::TaskFailed(e.to_string()))
    }

    /// Lets the execution run on unobserved and returns the scheduled snapshot.
    pub fn detach(self) -> ExecutionResult {
        self.snapshot
    }
}

/// Checks the caller identity and the definition's required inputs.
fn validate_request(mut request: ExecutionRequest, definition: &Definition) -> Result<ExecutionRequest> {
    if request.caller_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("caller_id is required".to_string()));
    }

    if request.input.is_null() {
        request.input = Value::Object(Map::new());
    }

    let input = request.input.as_object().ok_or_else(|| {
        EngineError::InvalidInput("input must be a JSON object".to_string())
    })?;

    let missing: Vec<&str> = definition
        .required_inputs
        .iter()
        .filter(|key| input.get(key.as_str()).map_or(true, Value::is_null))
        .map(String::as_str)
        .collect();

    if !missing.is_empty() {
        return Err(EngineError::InvalidInput(format!(
            "missing required input: {}",
            missing.join(", ")
        )));
    }

    Ok(request)
}

/// Explicit `next`, else the following step in declaration order.
fn successor(definition: &Definition, step: &Step) -> Option<String> {
    step.next
        .clone()
        .or_else(|| definition.following(&step.id).map(|s| s.id.clone()))
}

/// What a failed step does to the execution.
fn failure_action(step: &Step) -> ExhaustedAction {
    match step.on_error {
        OnError::Fail => ExhaustedAction::Fail,
        OnError::Continue => ExhaustedAction::Continue,
        OnError::Retry => step
            .retry
            .as_ref()
            .map_or(ExhaustedAction::Fail, |policy| policy.on_exhausted),
    }
}
