//! Step Dispatcher
//!
//! Selects what runs for each step type and runs it:
//! - `delay` suspends on the timer
//! - `external-call` invokes a registered [`StepHandler`], metered by the
//!   resource guard and, when a dependency is named, wrapped in its breaker
//! - `conditional` evaluates conditions and picks a branch
//! - `transform` builds an object from field paths
//! - `terminal` ends the execution
//!
//! Field paths are dotted (`steps.fetch.items.0.id`) and resolve against the
//! execution scope `{ input, steps }`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::context::ExecutionContext;
use crate::error::StepError;
use crate::resilience::guard::API_CALLS;
use crate::resilience::{BreakerRegistry, ResourceGuard};
use crate::workflow::model::{
    Condition, ConditionOperator, Definition, MatchMode, Step, StepConfig,
};

/// Value produced by a step, with optional usage accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub value: Value,
    pub cost: f64,
    pub tokens: u64,
}

impl StepOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            cost: 0.0,
            tokens: 0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }
}

/// Implementation behind an `external-call` (or agent `tool`) step.
///
/// Handlers see the rendered step parameters and the execution context,
/// which carries the input and every prior step output.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(
        &self,
        params: &Value,
        context: &ExecutionContext,
    ) -> Result<StepOutput, StepError>;

    /// Value served while the step's dependency breaker is open.
    fn fallback(&self, _params: &Value) -> Option<StepOutput> {
        None
    }
}

/// Returns its parameters unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl StepHandler for EchoHandler {
    async fn execute(
        &self,
        params: &Value,
        _context: &ExecutionContext,
    ) -> Result<StepOutput, StepError> {
        Ok(StepOutput::new(params.clone()))
    }
}

/// Where control goes after a successful step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The step's `next`, or the following step in declaration order
    Next,
    /// A branch chosen by a conditional step
    Goto(String),
    /// End the execution
    Stop,
}

/// Successful result of dispatching one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub output: StepOutput,
    pub transition: Transition,
}

impl StepOutcome {
    fn next(value: Value) -> Self {
        Self {
            output: StepOutput::new(value),
            transition: Transition::Next,
        }
    }
}

/// Runs single steps on behalf of the orchestrator.
pub struct StepDispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
    breakers: Arc<BreakerRegistry>,
    guard: Arc<ResourceGuard>,
}

impl StepDispatcher {
    pub fn new(breakers: Arc<BreakerRegistry>, guard: Arc<ResourceGuard>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            breakers,
            guard,
        }
    }

    /// Registers (or replaces) the handler behind a handler name.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        let name = name.into();
        debug!("Registered step handler '{}'", name);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, handler);
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Handler names used by `definition` that are not registered.
    pub fn missing_handlers(&self, definition: &Definition) -> Vec<String> {
        definition
            .handlers()
            .into_iter()
            .filter(|name| !self.has_handler(name))
            .map(str::to_string)
            .collect()
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn guard(&self) -> &ResourceGuard {
        &self.guard
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Runs one attempt of `step`, bounded by the step's own `timeout_ms`.
    pub async fn dispatch(
        &self,
        step: &Step,
        context: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, StepError> {
        let timeout = step.timeout_ms.map(Duration::from_millis);
        self.dispatch_within(step, context, cancel, timeout).await
    }

    /// Runs one attempt of `step`, failing with `StepError::Timeout` once
    /// `timeout` elapses.
    ///
    /// Suspension points (delay timer, handler call) are raced against
    /// `cancel`; losing the race yields `StepError::Cancelled`. The timeout is
    /// applied to the handler call inside the dependency's breaker, so a
    /// timed-out call counts as a breaker failure.
    pub async fn dispatch_within(
        &self,
        step: &Step,
        context: &ExecutionContext,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<StepOutcome, StepError> {
        debug!("Dispatching {} step '{}'", step.config.type_name(), step.id);

        match &step.config {
            StepConfig::Delay { duration_ms } => {
                let requested = Duration::from_millis(*duration_ms);
                let waited = timeout.map_or(requested, |limit| limit.min(requested));
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StepError::Cancelled),
                    _ = tokio::time::sleep(waited) => {}
                }
                if waited < requested {
                    warn!("Delay step '{}' exceeded its {:?} timeout", step.id, waited);
                    return Err(StepError::Timeout(waited.as_millis() as u64));
                }
                Ok(StepOutcome::next(json!({ "delayed_ms": duration_ms })))
            }

            StepConfig::ExternalCall {
                handler,
                dependency,
                params,
            } => {
                let output = self
                    .call_external(handler, dependency.as_deref(), params, context, cancel, timeout)
                    .await?;
                Ok(StepOutcome {
                    output,
                    transition: Transition::Next,
                })
            }

            StepConfig::Conditional {
                conditions,
                mode,
                then,
                otherwise,
            } => {
                let matched = evaluate_conditions(conditions, *mode, &context.scope());
                let target = if matched { then } else { otherwise };
                debug!(
                    "Conditional '{}' evaluated to {} -> {}",
                    step.id,
                    matched,
                    target.as_deref().unwrap_or("(next)")
                );

                Ok(StepOutcome {
                    output: StepOutput::new(json!({ "matched": matched })),
                    transition: match target {
                        Some(id) => Transition::Goto(id.clone()),
                        None => Transition::Next,
                    },
                })
            }

            StepConfig::Transform { mapping } => {
                Ok(StepOutcome::next(apply_mapping(mapping, &context.scope())))
            }

            StepConfig::Terminal { output } => {
                let value = if output.is_empty() {
                    Value::Null
                } else {
                    apply_mapping(output, &context.scope())
                };
                Ok(StepOutcome {
                    output: StepOutput::new(value),
                    transition: Transition::Stop,
                })
            }
        }
    }

    async fn call_external(
        &self,
        handler_name: &str,
        dependency: Option<&str>,
        params: &Value,
        context: &ExecutionContext,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<StepOutput, StepError> {
        let handler = self.handler(handler_name).ok_or_else(|| {
            StepError::InvalidConfig(format!("no handler registered as '{}'", handler_name))
        })?;

        let decision = self.guard.check(API_CALLS, 0);
        if !decision.allowed {
            return Err(StepError::RateLimited(API_CALLS.to_string()));
        }

        let params = render_templates(params, &context.scope());

        let call = async {
            match dependency {
                Some(dependency) => {
                    let config = self.breakers.config_for(dependency).clone();
                    let fallback = handler.fallback(&params).map(|output| {
                        move || async move {
                            info!("Serving fallback for '{}'", handler_name);
                            Ok::<StepOutput, StepError>(output)
                        }
                    });
                    self.breakers
                        .execute(
                            dependency,
                            || within(handler_name, handler.execute(&params, context), timeout),
                            fallback,
                            &config,
                        )
                        .await
                }
                None => within(handler_name, handler.execute(&params, context), timeout).await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            result = call => result,
        }
    }
}

/// Awaits a handler call, failing with `StepError::Timeout` after `timeout`.
async fn within<F>(handler_name: &str, call: F, timeout: Option<Duration>) -> Result<StepOutput, StepError>
where
    F: Future<Output = Result<StepOutput, StepError>>,
{
    let Some(limit) = timeout else {
        return call.await;
    };
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Handler '{}' timed out after {:?}", handler_name, limit);
            Err(StepError::Timeout(limit.as_millis() as u64))
        }
    }
}

/// Resolves a dotted path. Numeric segments index into arrays.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Builds an object whose values are resolved from the scope; missing paths become null.
pub fn apply_mapping(mapping: &BTreeMap<String, String>, scope: &Value) -> Value {
    let object: Map<String, Value> = mapping
        .iter()
        .map(|(key, path)| {
            let value = resolve_path(scope, path).cloned().unwrap_or(Value::Null);
            (key.clone(), value)
        })
        .collect();
    Value::Object(object)
}

/// Evaluates a single condition against the scope.
pub fn evaluate_condition(condition: &Condition, scope: &Value) -> bool {
    let actual = resolve_path(scope, &condition.field).filter(|v| !v.is_null());
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Exists => actual.is_some(),
        ConditionOperator::NotExists => actual.is_none(),
        ConditionOperator::Equals => actual.map_or(expected.is_null(), |v| values_equal(v, expected)),
        ConditionOperator::NotEquals => {
            !actual.map_or(expected.is_null(), |v| values_equal(v, expected))
        }
        ConditionOperator::GreaterThan => {
            actual.and_then(|v| compare(v, expected)) == Some(Ordering::Greater)
        }
        ConditionOperator::LessThan => {
            actual.and_then(|v| compare(v, expected)) == Some(Ordering::Less)
        }
        ConditionOperator::Contains => actual.map_or(false, |v| contains(v, expected)),
        ConditionOperator::NotContains => !actual.map_or(false, |v| contains(v, expected)),
    }
}

/// Combines conditions with `all` or `any`.
pub fn evaluate_conditions(conditions: &[Condition], mode: MatchMode, scope: &Value) -> bool {
    match mode {
        MatchMode::All => conditions.iter().all(|c| evaluate_condition(c, scope)),
        MatchMode::Any => conditions.iter().any(|c| evaluate_condition(c, scope)),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().map_or(false, |n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().map_or(false, |k| map.contains_key(k)),
        _ => false,
    }
}

/// Substitutes `{{path}}` placeholders in every string of `value`.
///
/// A string that is exactly one placeholder is replaced by the resolved value
/// itself (keeping its JSON type); embedded placeholders are interpolated as
/// text. Unresolvable placeholders become null or empty text.
pub fn render_templates(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) => render_string(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_templates(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_templates(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(s: &str, scope: &Value) -> Value {
    if let Some(path) = whole_placeholder(s.trim()) {
        return resolve_path(scope, path).cloned().unwrap_or(Value::Null);
    }
    if !s.contains("{{") {
        return Value::String(s.to_string());
    }

    let mut rendered = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                match resolve_path(scope, after[..end].trim()) {
                    Some(value) => rendered.push_str(&display_value(value)),
                    None => warn!("Unresolved placeholder '{{{{{}}}}}'", after[..end].trim()),
                }
                rest = &after[end + 2..];
            }
            None => {
                let tail = &rest[start..];
                rendered.push_str(tail);
                rest = "";
            }
        }
    }
    rendered.push_str(rest);
    Value::String(rendered)
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::ExecutionRequest;
    use crate::resilience::{BreakerConfig, CircuitState, ResourceLimit};
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    struct FailingHandler {
        calls: AtomicU32,
        fallback: Option<Value>,
    }

    #[async_trait]
    impl StepHandler for FailingHandler {
        async fn execute(
            &self,
            _params: &Value,
            _context: &ExecutionContext,
        ) -> Result<StepOutput, StepError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Err(StepError::Network("connection refused".into()))
        }

        fn fallback(&self, _params: &Value) -> Option<StepOutput> {
            self.fallback.clone().map(StepOutput::new)
        }
    }

    struct PendingHandler;

    #[async_trait]
    impl StepHandler for PendingHandler {
        async fn execute(
            &self,
            _params: &Value,
            _context: &ExecutionContext,
        ) -> Result<StepOutput, StepError> {
            std::future::pending::<()>().await;
            Ok(StepOutput::new(Value::Null))
        }
    }

    fn dispatcher() -> StepDispatcher {
        let dispatcher = StepDispatcher::new(
            Arc::new(BreakerRegistry::default()),
            Arc::new(ResourceGuard::default()),
        );
        dispatcher.register_handler("echo", Arc::new(EchoHandler));
        dispatcher
    }

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            ExecutionRequest::new("wf", "tester")
                .with_input(json!({"customer": "acme", "amount": 1500, "tags": ["vip"]})),
        );
        ctx.record_output("fetch", json!({"items": [{"id": "inv-1"}, {"id": "inv-2"}], "count": 2}));
        ctx
    }

    #[test]
    fn test_resolve_path() {
        let scope = context().scope();
        assert_eq!(resolve_path(&scope, "input.customer"), Some(&json!("acme")));
        assert_eq!(resolve_path(&scope, "steps.fetch.items.1.id"), Some(&json!("inv-2")));
        assert_eq!(resolve_path(&scope, "steps.fetch.items.9.id"), None);
        assert_eq!(resolve_path(&scope, "input.customer.name"), None);
    }

    #[test]
    fn test_condition_operators() {
        let scope = context().scope();
        let check = |field: &str, operator, value| {
            evaluate_condition(&Condition::new(field, operator, value), &scope)
        };

        assert!(check("input.customer", ConditionOperator::Equals, json!("acme")));
        assert!(check("input.amount", ConditionOperator::Equals, json!(1500.0)));
        assert!(check("input.customer", ConditionOperator::NotEquals, json!("globex")));
        assert!(check("input.amount", ConditionOperator::GreaterThan, json!(1000)));
        assert!(!check("input.amount", ConditionOperator::LessThan, json!(1000)));
        assert!(check("input.tags", ConditionOperator::Contains, json!("vip")));
        assert!(check("input.customer", ConditionOperator::Contains, json!("cm")));
        assert!(check("input.tags", ConditionOperator::NotContains, json!("trial")));
        assert!(check("steps.fetch.count", ConditionOperator::Exists, Value::Null));
        assert!(check("steps.missing", ConditionOperator::NotExists, Value::Null));
        assert!(!check("steps.missing", ConditionOperator::GreaterThan, json!(0)));
    }

    #[test]
    fn test_condition_modes() {
        let scope = context().scope();
        let conditions = vec![
            Condition::new("input.customer", ConditionOperator::Equals, json!("acme")),
            Condition::new("input.amount", ConditionOperator::LessThan, json!(10)),
        ];
        assert!(!evaluate_conditions(&conditions, MatchMode::All, &scope));
        assert!(evaluate_conditions(&conditions, MatchMode::Any, &scope));
    }

    #[test]
    fn test_render_templates() {
        let scope = context().scope();
        let params = json!({
            "customer": "{{input.customer}}",
            "amount": "{{ input.amount }}",
            "label": "Invoice {{steps.fetch.items.0.id}} for {{input.customer}}",
            "missing": "{{input.nope}}",
            "nested": ["{{steps.fetch.count}}", 7],
            "literal": "no placeholders",
            "broken": "open {{input.customer"
        });

        let rendered = render_templates(&params, &scope);
        assert_eq!(rendered["customer"], "acme");
        assert_eq!(rendered["amount"], 1500);
        assert_eq!(rendered["label"], "Invoice inv-1 for acme");
        assert_eq!(rendered["missing"], Value::Null);
        assert_eq!(rendered["nested"], json!([2, 7]));
        assert_eq!(rendered["literal"], "no placeholders");
        assert_eq!(rendered["broken"], "open {{input.customer");
    }

    #[tokio::test]
    async fn test_external_call_renders_params() {
        let dispatcher = dispatcher();
        let step = Step::call("call", "echo").with_params(json!({"who": "{{input.customer}}"}));

        let outcome = dispatcher
            .dispatch(&step, &context(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.output.value, json!({"who": "acme"}));
        assert_eq!(outcome.transition, Transition::Next);
    }

    #[tokio::test]
    async fn test_unregistered_handler_is_invalid_config() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .dispatch(&Step::call("call", "ghost"), &context(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-config");

        let def = Definition::new("wf", "a")
            .with_step(Step::call("a", "ghost"))
            .with_step(Step::call("b", "echo"));
        assert_eq!(dispatcher.missing_handlers(&def), vec!["ghost".to_string()]);
    }

    #[tokio::test]
    async fn test_api_call_limit() {
        let guard = ResourceGuard::new(HashMap::from([(
            API_CALLS.to_string(),
            ResourceLimit::new(1, 0, Duration::from_secs(60)),
        )]));
        let dispatcher = StepDispatcher::new(Arc::new(BreakerRegistry::default()), Arc::new(guard));
        dispatcher.register_handler("echo", Arc::new(EchoHandler));

        let step = Step::call("call", "echo");
        let ctx = context();
        let cancel = CancellationToken::new();

        assert!(dispatcher.dispatch(&step, &ctx, &cancel).await.is_ok());
        let err = dispatcher.dispatch(&step, &ctx, &cancel).await.unwrap_err();
        assert_eq!(err, StepError::RateLimited(API_CALLS.to_string()));
    }

    #[tokio::test]
    async fn test_dependency_breaker_serves_fallback_when_open() {
        let breakers = BreakerRegistry::new(BreakerConfig::new(2, 1, Duration::from_secs(60)));
        let dispatcher = StepDispatcher::new(Arc::new(breakers), Arc::new(ResourceGuard::default()));
        let handler = Arc::new(FailingHandler {
            calls: AtomicU32::new(0),
            fallback: Some(json!({"cached": true})),
        });
        dispatcher.register_handler("llm", handler.clone());

        let step = Step::call("ask", "llm").with_dependency("openai");
        let ctx = context();
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let err = dispatcher.dispatch(&step, &ctx, &cancel).await.unwrap_err();
            assert_eq!(err.kind(), "network");
        }

        let outcome = dispatcher.dispatch(&step, &ctx, &cancel).await.unwrap();
        assert_eq!(outcome.output.value, json!({"cached": true}));
        assert_eq!(handler.calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_open_breaker_without_fallback() {
        let breakers = BreakerRegistry::new(BreakerConfig::new(1, 1, Duration::from_secs(60)));
        let dispatcher = StepDispatcher::new(Arc::new(breakers), Arc::new(ResourceGuard::default()));
        dispatcher.register_handler(
            "pay",
            Arc::new(FailingHandler {
                calls: AtomicU32::new(0),
                fallback: None,
            }),
        );

        let step = Step::call("charge", "pay").with_dependency("stripe");
        let ctx = context();
        let cancel = CancellationToken::new();

        dispatcher.dispatch(&step, &ctx, &cancel).await.unwrap_err();
        let err = dispatcher.dispatch(&step, &ctx, &cancel).await.unwrap_err();
        assert_eq!(err, StepError::CircuitOpen("stripe".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_half_open_trial_reopens_breaker() {
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::new(
            1,
            1,
            Duration::from_millis(1_000),
        )));
        let dispatcher = StepDispatcher::new(breakers.clone(), Arc::new(ResourceGuard::default()));
        dispatcher.register_handler("slow", Arc::new(PendingHandler));

        let step = Step::call("ask", "slow")
            .with_dependency("llm")
            .with_timeout_ms(100);
        let ctx = context();
        let cancel = CancellationToken::new();

        let err = dispatcher.dispatch(&step, &ctx, &cancel).await.unwrap_err();
        assert_eq!(err, StepError::Timeout(100));
        assert_eq!(breakers.breaker("llm").state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        let err = dispatcher.dispatch(&step, &ctx, &cancel).await.unwrap_err();
        assert_eq!(err, StepError::Timeout(100));
        assert_eq!(breakers.breaker("llm").state(), CircuitState::Open);

        let err = dispatcher.dispatch(&step, &ctx, &cancel).await.unwrap_err();
        assert_eq!(err, StepError::CircuitOpen("llm".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_longer_than_timeout_fails() {
        let dispatcher = dispatcher();
        let start = tokio::time::Instant::now();

        let err = dispatcher
            .dispatch_within(
                &Step::delay("wait", 5_000),
                &context(),
                &CancellationToken::new(),
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();

        assert_eq!(err, StepError::Timeout(200));
        assert!(start.elapsed() < Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_step_waits() {
        let dispatcher = dispatcher();
        let start = tokio::time::Instant::now();

        let outcome = dispatcher
            .dispatch(&Step::delay("wait", 50), &context(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(outcome.output.value, json!({"delayed_ms": 50}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_suspension() {
        let dispatcher = dispatcher();
        dispatcher.register_handler("slow", Arc::new(PendingHandler));
        let ctx = context();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = dispatcher
            .dispatch(&Step::delay("wait", 60_000), &ctx, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, StepError::Cancelled);

        let err = dispatcher
            .dispatch(&Step::call("call", "slow"), &ctx, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, StepError::Cancelled);
    }

    #[tokio::test]
    async fn test_conditional_branches() {
        let dispatcher = dispatcher();
        let ctx = context();
        let cancel = CancellationToken::new();

        let big = Step::conditional(
            "big",
            vec![Condition::new("input.amount", ConditionOperator::GreaterThan, json!(1000))],
            Some("escalate"),
            Some("archive"),
        );
        let outcome = dispatcher.dispatch(&big, &ctx, &cancel).await.unwrap();
        assert_eq!(outcome.transition, Transition::Goto("escalate".into()));
        assert_eq!(outcome.output.value, json!({"matched": true}));

        let small = Step::conditional(
            "small",
            vec![Condition::new("input.amount", ConditionOperator::LessThan, json!(10))],
            Some("escalate"),
            None,
        );
        let outcome = dispatcher.dispatch(&small, &ctx, &cancel).await.unwrap();
        assert_eq!(outcome.transition, Transition::Next);
    }

    #[tokio::test]
    async fn test_transform_and_terminal() {
        let dispatcher = dispatcher();
        let ctx = context();
        let cancel = CancellationToken::new();

        let mapping = BTreeMap::from([
            ("who".to_string(), "input.customer".to_string()),
            ("first".to_string(), "steps.fetch.items.0.id".to_string()),
            ("none".to_string(), "steps.nothing".to_string()),
        ]);

        let outcome = dispatcher
            .dispatch(&Step::transform("shape", mapping.clone()), &ctx, &cancel)
            .await
            .unwrap();
        assert_eq!(
            outcome.output.value,
            json!({"who": "acme", "first": "inv-1", "none": null})
        );

        let terminal = Step::new("end", StepConfig::Terminal { output: mapping });
        let outcome = dispatcher.dispatch(&terminal, &ctx, &cancel).await.unwrap();
        assert_eq!(outcome.transition, Transition::Stop);
        assert_eq!(outcome.output.value["who"], "acme");

        let outcome = dispatcher
            .dispatch(&Step::terminal("bare"), &ctx, &cancel)
            .await
            .unwrap();
        assert!(outcome.output.value.is_null());
    }
}
