//! Definition Module
//!
//! Provides data structures and utilities for defining, parsing,
//! validating and registering workflow and agent definitions.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Definition, Step, StepConfig)
//! - [`parser`]: YAML/JSON parsing and loading
//! - [`validator`]: Structural validation rules
//! - [`registry`]: In-memory definition registry

pub mod model;
pub mod parser;
pub mod registry;
pub mod validator;

pub use model::{
    Category, Condition, ConditionOperator, Definition, DefinitionKind, MatchMode, OnError,
    Step, StepConfig,
};
pub use parser::{load_definition, parse_definition, save_definition, Format};
pub use registry::DefinitionRegistry;
pub use validator::{validate_definition, ValidationError};
