//! Definition Data Model
//!
//! Core data structures describing workflow and agent definitions.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: daily-revenue
//! name: Daily revenue digest
//! category: automation
//! entry_step: fetch
//! required_inputs: [date]
//! steps:
//!   - id: fetch
//!     type: external-call
//!     handler: wave.get_revenue
//!     dependency: wave
//!     params:
//!       date: "{{input.date}}"
//!     on_error: retry
//!     retry:
//!       max_attempts: 3
//!       initial_delay_ms: 500
//!       on_exhausted: fail
//!
//!   - id: large
//!     type: conditional
//!     conditions:
//!       - field: steps.fetch.total
//!         operator: greater-than
//!         value: 1000
//!     then: notify
//!     otherwise: done
//!
//!   - id: notify
//!     type: external-call
//!     handler: slack.post
//!     dependency: slack
//!     on_error: continue
//!
//!   - id: done
//!     type: terminal
//!     output:
//!       total: steps.fetch.total
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use crate::resilience::retry::{ExhaustedAction, RetryPolicy};

/// Whether a definition describes a workflow or an agent.
///
/// Both run on the same state machine; agents call their external steps "tools".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DefinitionKind {
    #[default]
    Workflow,
    Agent,
}

/// Category tag used for grouping definitions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Automation,
    Reconciliation,
    Consulting,
    #[default]
    Custom,
}

/// What the orchestrator does when a step fails.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OnError {
    /// Abort the execution.
    #[default]
    Fail,
    /// Record the failure and advance anyway.
    Continue,
    /// Apply the step's retry policy, then its `on_exhausted` action.
    Retry,
}

/// Comparison applied by a condition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    NotContains,
    Exists,
    NotExists,
}

/// A single predicate over a dotted field path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Condition {
    /// Dotted path resolved against `{ input, steps }`.
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }
}

/// How the conditions of a conditional step combine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

/// Type-specific step configuration.
///
/// The set is closed: a new step type is a new variant and every `match`
/// over it must be updated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepConfig {
    /// Suspend for a fixed duration.
    Delay { duration_ms: u64 },

    /// Invoke a registered handler, optionally behind a circuit breaker.
    #[serde(alias = "tool")]
    ExternalCall {
        /// Registered handler name.
        handler: String,
        /// Breaker key; calls without one are not breaker-protected.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dependency: Option<String>,
        /// Handler parameters; `"{{path}}"` strings are substituted before the call.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        params: Value,
    },

    /// Evaluate conditions and branch.
    Conditional {
        conditions: Vec<Condition>,
        #[serde(default)]
        mode: MatchMode,
        /// Step to run when the conditions match.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        then: Option<String>,
        /// Step to run otherwise.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<String>,
    },

    /// Build an object from field paths.
    Transform {
        /// Output key -> dotted field path.
        mapping: BTreeMap<String, String>,
    },

    /// End the execution; `output` (if non-empty) becomes the execution output.
    Terminal {
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        output: BTreeMap<String, String>,
    },
}

impl StepConfig {
    /// Wire name of the step type.
    pub fn type_name(&self) -> &'static str {
        match self {
            StepConfig::Delay { .. } => "delay",
            StepConfig::ExternalCall { .. } => "external-call",
            StepConfig::Conditional { .. } => "conditional",
            StepConfig::Transform { .. } => "transform",
            StepConfig::Terminal { .. } => "terminal",
        }
    }
}

/// One unit of work within a definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Identifier, unique within the definition
    pub id: String,

    /// Human-readable label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Type and type-specific configuration
    #[serde(flatten)]
    pub config: StepConfig,

    /// Failure policy
    #[serde(default)]
    pub on_error: OnError,

    /// Required when `on_error` is `retry`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Per-step time budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Successor; defaults to the next step in declaration order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

impl Step {
    /// Creates a step with the `fail` policy.
    ///
    /// # Example
    ///
    /// ```
    /// use flowrunner::workflow::{OnError, Step};
    ///
    /// let step = Step::delay("wait", 50).with_on_error(OnError::Continue);
    /// assert_eq!(step.config.type_name(), "delay");
    /// ```
    pub fn new(id: impl Into<String>, config: StepConfig) -> Self {
        Self {
            id: id.into().trim().to_string(),
            name: None,
            config,
            on_error: OnError::Fail,
            retry: None,
            timeout_ms: None,
            next: None,
        }
    }

    pub fn delay(id: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(id, StepConfig::Delay { duration_ms })
    }

    /// External call without breaker protection.
    pub fn call(id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::new(
            id,
            StepConfig::ExternalCall {
                handler: handler.into(),
                dependency: None,
                params: Value::Null,
            },
        )
    }

    pub fn conditional(
        id: impl Into<String>,
        conditions: Vec<Condition>,
        then: Option<&str>,
        otherwise: Option<&str>,
    ) -> Self {
        Self::new(
            id,
            StepConfig::Conditional {
                conditions,
                mode: MatchMode::All,
                then: then.map(str::to_string),
                otherwise: otherwise.map(str::to_string),
            },
        )
    }

    pub fn transform(id: impl Into<String>, mapping: BTreeMap<String, String>) -> Self {
        Self::new(id, StepConfig::Transform { mapping })
    }

    pub fn terminal(id: impl Into<String>) -> Self {
        Self::new(
            id,
            StepConfig::Terminal {
                output: BTreeMap::new(),
            },
        )
    }

    /// Routes an external call through the named dependency's breaker.
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        if let StepConfig::ExternalCall { dependency, .. } = &mut self.config {
            *dependency = Some(name.into());
        }
        self
    }

    /// Sets external-call parameters.
    pub fn with_params(mut self, value: Value) -> Self {
        if let StepConfig::ExternalCall { params, .. } = &mut self.config {
            *params = value;
        }
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    /// Sets the retry policy and switches the step to `on_error: retry`.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.on_error = OnError::Retry;
        self.retry = Some(policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the explicit successor.
    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.config, StepConfig::Terminal { .. })
    }

    /// Every step id this step may transfer control to.
    pub fn references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self.next.iter().map(String::as_str).collect();
        if let StepConfig::Conditional { then, otherwise, .. } = &self.config {
            refs.extend(then.iter().map(String::as_str));
            refs.extend(otherwise.iter().map(String::as_str));
        }
        refs
    }
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_enabled() -> bool {
    true
}

/// A registered workflow or agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Definition {
    /// Unique identifier
    pub id: String,

    #[serde(default)]
    pub kind: DefinitionKind,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub category: Category,

    /// Ordered steps; order supplies the default successor of each step
    pub steps: Vec<Step>,

    /// First step to execute
    pub entry_step: String,

    /// Keys the execution input must contain
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_inputs: Vec<String>,

    /// Whole-execution time budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub deprecated: bool,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Definition {
    /// Creates an empty, enabled workflow definition.
    pub fn new(id: impl Into<String>, entry_step: impl Into<String>) -> Self {
        let now = Utc::now();
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: DefinitionKind::Workflow,
            description: None,
            version: default_version(),
            category: Category::Custom,
            steps: Vec::new(),
            entry_step: entry_step.into(),
            required_inputs: Vec::new(),
            timeout_ms: None,
            tags: Vec::new(),
            enabled: true,
            deprecated: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates an empty agent definition.
    pub fn agent(id: impl Into<String>, entry_step: impl Into<String>) -> Self {
        Self {
            kind: DefinitionKind::Agent,
            ..Self::new(id, entry_step)
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_required_input(mut self, key: impl Into<String>) -> Self {
        self.required_inputs.push(key.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Step following `id` in declaration order.
    pub fn following(&self, id: &str) -> Option<&Step> {
        let index = self.steps.iter().position(|s| s.id == id)?;
        self.steps.get(index + 1)
    }

    /// External-call handler names used by this definition, sorted and deduplicated.
    pub fn handlers(&self) -> Vec<&str> {
        let mut handlers: Vec<&str> = self
            .steps
            .iter()
            .filter_map(|s| match &s.config {
                StepConfig::ExternalCall { handler, .. } => Some(handler.as_str()),
                _ => None,
            })
            .collect();
        handlers.sort_unstable();
        handlers.dedup();
        handlers
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_builders() {
        let step = Step::call("fetch", "shopify.get_orders")
            .with_dependency("shopify")
            .with_params(json!({"date": "today"}))
            .with_timeout_ms(5_000)
            .then("done");

        assert_eq!(step.id, "fetch");
        assert_eq!(step.config.type_name(), "external-call");
        assert_eq!(step.timeout_ms, Some(5_000));
        assert_eq!(step.next.as_deref(), Some("done"));
        match &step.config {
            StepConfig::ExternalCall {
                dependency, params, ..
            } => {
                assert_eq!(dependency.as_deref(), Some("shopify"));
                assert_eq!(params["date"], "today");
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_with_retry_switches_policy() {
        let step = Step::delay("wait", 10)
            .with_retry(RetryPolicy::new(3, ExhaustedAction::Continue));
        assert_eq!(step.on_error, OnError::Retry);
        assert_eq!(step.retry.unwrap().max_attempts, 3);
    }

    #[test]
    fn test_dependency_ignored_for_non_calls() {
        let step = Step::delay("wait", 10).with_dependency("stripe");
        assert_eq!(step.config, StepConfig::Delay { duration_ms: 10 });
    }

    #[test]
    fn test_step_references() {
        let step = Step::conditional("branch", vec![], Some("yes"), Some("no")).then("after");
        assert_eq!(step.references(), vec!["after", "yes", "no"]);
        assert!(Step::terminal("end").references().is_empty());
    }

    #[test]
    fn test_definition_navigation() {
        let def = Definition::new("wf", "a")
            .with_step(Step::delay("a", 1))
            .with_step(Step::delay("b", 1))
            .with_step(Step::terminal("c"));

        assert_eq!(def.len(), 3);
        assert_eq!(def.following("a").unwrap().id, "b");
        assert_eq!(def.following("b").unwrap().id, "c");
        assert!(def.following("c").is_none());
        assert!(def.following("missing").is_none());
        assert!(def.get_step("c").unwrap().is_terminal());
    }

    #[test]
    fn test_definition_handlers_deduplicated() {
        let def = Definition::agent("assistant", "a")
            .with_step(Step::call("a", "search"))
            .with_step(Step::call("b", "llm.complete"))
            .with_step(Step::call("c", "search"));

        assert_eq!(def.kind, DefinitionKind::Agent);
        assert_eq!(def.handlers(), vec!["llm.complete", "search"]);
    }

    #[test]
    fn test_step_yaml_flattened_type() {
        let yaml = r#"
id: pause
type: delay
duration_ms: 250
on_error: continue
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.config, StepConfig::Delay { duration_ms: 250 });
        assert_eq!(step.on_error, OnError::Continue);
        assert!(step.next.is_none());
    }

    #[test]
    fn test_tool_alias_for_agent_steps() {
        let yaml = r#"
id: lookup
type: tool
handler: search
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.config.type_name(), "external-call");
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let yaml = r#"
id: mystery
type: teleport
"#;
        assert!(serde_yaml::from_str::<Step>(yaml).is_err());
    }

    #[test]
    fn test_definition_json_defaults() {
        let def: Definition = serde_json::from_value(json!({
            "id": "wf",
            "entry_step": "a",
            "steps": [{"id": "a", "type": "terminal"}]
        }))
        .unwrap();

        assert!(def.enabled);
        assert!(!def.deprecated);
        assert_eq!(def.version, "1.0.0");
        assert_eq!(def.category, Category::Custom);
        assert_eq!(def.kind, DefinitionKind::Workflow);
    }

    #[test]
    fn test_condition_yaml() {
        let yaml = r#"
field: steps.fetch.count
operator: greater-than
value: 3
"#;
        let condition: Condition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(condition.operator, ConditionOperator::GreaterThan);
        assert_eq!(condition.value, json!(3));
    }
}
