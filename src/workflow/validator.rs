//! Definition Validation
//!
//! Structural checks run before a definition is registered:
//! - Definition identifier and entry step
//! - Step identifier uniqueness
//! - Reference integrity (`next`, `then`, `otherwise`)
//! - Retry policy presence for `on_error: retry`
//! - Type-specific payload sanity

use std::collections::HashSet;

use log::{debug, info, warn};

use super::model::{Definition, OnError, Step, StepConfig};
use crate::error::{EngineError, Result};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyDefinitionId,
    EmptyDefinition,
    MissingEntryStep(String),
    DuplicateStepId(String),
    EmptyStepId,
    EmptyHandler(String),
    InvalidReference { step: String, reference: String },
    MissingRetryPolicy(String),
    InvalidRetryPolicy { step: String, reason: String },
    EmptyConditions(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDefinitionId => write!(f, "Definition has empty or whitespace-only ID"),
            Self::EmptyDefinition => write!(f, "Definition has no steps"),
            Self::MissingEntryStep(id) => {
                write!(f, "Entry step '{}' is not among the definition's steps", id)
            }
            Self::DuplicateStepId(id) => write!(f, "Duplicate step ID: '{}'", id),
            Self::EmptyStepId => write!(f, "Step has empty or whitespace-only ID"),
            Self::EmptyHandler(step) => write!(f, "Step '{}' has no handler specified", step),
            Self::InvalidReference { step, reference } => {
                write!(f, "Step '{}' references unknown step '{}'", step, reference)
            }
            Self::MissingRetryPolicy(step) => {
                write!(f, "Step '{}' uses on_error: retry but has no retry policy", step)
            }
            Self::InvalidRetryPolicy { step, reason } => {
                write!(f, "Step '{}' has an invalid retry policy: {}", step, reason)
            }
            Self::EmptyConditions(step) => {
                write!(f, "Conditional step '{}' has no conditions", step)
            }
        }
    }
}

/// Validates a single step's fields.
fn validate_step(step: &Step) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId);
        return errors;
    }

    match &step.config {
        StepConfig::ExternalCall { handler, .. } if handler.trim().is_empty() => {
            errors.push(ValidationError::EmptyHandler(step.id.clone()));
        }
        StepConfig::Conditional { conditions, .. } if conditions.is_empty() => {
            errors.push(ValidationError::EmptyConditions(step.id.clone()));
        }
        StepConfig::Conditional {
            then: None,
            otherwise: None,
            ..
        } => {
            debug!(
                "Conditional step '{}' has no branch targets; both outcomes fall through",
                step.id
            );
        }
        _ => {}
    }

    match (&step.on_error, &step.retry) {
        (OnError::Retry, None) => {
            errors.push(ValidationError::MissingRetryPolicy(step.id.clone()));
        }
        (_, Some(policy)) => {
            if policy.max_attempts == 0 {
                errors.push(ValidationError::InvalidRetryPolicy {
                    step: step.id.clone(),
                    reason: "max_attempts must be at least 1".to_string(),
                });
            }
            if policy.backoff_multiplier < 1.0 {
                errors.push(ValidationError::InvalidRetryPolicy {
                    step: step.id.clone(),
                    reason: format!(
                        "backoff_multiplier {} is below 1.0",
                        policy.backoff_multiplier
                    ),
                });
            }
            if policy.initial_delay_ms > policy.max_delay_ms {
                errors.push(ValidationError::InvalidRetryPolicy {
                    step: step.id.clone(),
                    reason: "initial_delay_ms exceeds max_delay_ms".to_string(),
                });
            }
            if step.on_error != OnError::Retry {
                warn!(
                    "Step '{}' has a retry policy but on_error is not retry; it will be ignored",
                    step.id
                );
            }
        }
        _ => {}
    }

    if step.timeout_ms == Some(0) {
        warn!("Step '{}' has a zero timeout and will always time out", step.id);
    }

    errors
}

/// Collects every structural problem in a definition.
pub fn collect_errors(definition: &Definition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if definition.id.trim().is_empty() {
        errors.push(ValidationError::EmptyDefinitionId);
    }

    if definition.steps.is_empty() {
        errors.push(ValidationError::EmptyDefinition);
        return errors;
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &definition.steps {
        if !seen_ids.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    if !seen_ids.contains(definition.entry_step.as_str()) {
        errors.push(ValidationError::MissingEntryStep(definition.entry_step.clone()));
    }

    for step in &definition.steps {
        errors.extend(validate_step(step));

        for reference in step.references() {
            if !seen_ids.contains(reference) {
                errors.push(ValidationError::InvalidReference {
                    step: step.id.clone(),
                    reference: reference.to_string(),
                });
            }
        }
    }

    errors
}

/// Validates a definition, returning `InvalidDefinition` listing every problem found.
pub fn validate_definition(definition: &Definition) -> Result<()> {
    info!(
        "Validating definition '{}' with {} steps",
        definition.id,
        definition.steps.len()
    );

    let errors = collect_errors(definition);
    if errors.is_empty() {
        debug!("Definition '{}' is valid", definition.id);
        return Ok(());
    }

    for error in &errors {
        warn!("  {}", error);
    }

    let message = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    Err(EngineError::InvalidDefinition(format!(
        "'{}': {}",
        definition.id, message
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Condition, ConditionOperator, ExhaustedAction, RetryPolicy};
    use serde_json::json;

    fn linear() -> Definition {
        Definition::new("wf", "a")
            .with_step(Step::delay("a", 1))
            .with_step(Step::call("b", "echo"))
            .with_step(Step::terminal("c"))
    }

    #[test]
    fn test_valid_definition() {
        assert!(validate_definition(&linear()).is_ok());
    }

    #[test]
    fn test_missing_entry_step() {
        let mut def = linear();
        def.entry_step = "nowhere".to_string();

        let err = validate_definition(&def).unwrap_err();
        assert_eq!(err.code(), "INVALID_DEFINITION");
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_empty_definition() {
        let def = Definition::new("wf", "a");
        assert_eq!(collect_errors(&def), vec![ValidationError::EmptyDefinition]);
    }

    #[test]
    fn test_duplicate_step_ids() {
        let def = linear().with_step(Step::delay("a", 5));
        assert!(collect_errors(&def).contains(&ValidationError::DuplicateStepId("a".into())));
    }

    #[test]
    fn test_dangling_references() {
        let def = Definition::new("wf", "a")
            .with_step(Step::delay("a", 1).then("ghost"))
            .with_step(Step::conditional(
                "b",
                vec![Condition::new("input.x", ConditionOperator::Exists, json!(null))],
                Some("a"),
                Some("phantom"),
            ));

        let errors = collect_errors(&def);
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&ValidationError::InvalidReference {
            step: "a".into(),
            reference: "ghost".into()
        }));
        assert!(errors.contains(&ValidationError::InvalidReference {
            step: "b".into(),
            reference: "phantom".into()
        }));
    }

    #[test]
    fn test_retry_requires_policy() {
        let def = Definition::new("wf", "a")
            .with_step(Step::call("a", "echo").with_on_error(OnError::Retry));
        assert_eq!(
            collect_errors(&def),
            vec![ValidationError::MissingRetryPolicy("a".into())]
        );
    }

    #[test]
    fn test_retry_policy_bounds() {
        let def = Definition::new("wf", "a").with_step(
            Step::call("a", "echo").with_retry(RetryPolicy::new(0, ExhaustedAction::Fail)),
        );
        let errors = collect_errors(&def);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("max_attempts"));
    }

    #[test]
    fn test_empty_handler_and_conditions() {
        let def = Definition::new("wf", "a")
            .with_step(Step::call("a", "  "))
            .with_step(Step::conditional("b", vec![], None, None));

        let errors = collect_errors(&def);
        assert!(errors.contains(&ValidationError::EmptyHandler("a".into())));
        assert!(errors.contains(&ValidationError::EmptyConditions("b".into())));
    }
}
