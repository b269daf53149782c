//! FlowRunner - Workflow and Agent Execution Engine
//!
//! Runs declarative workflow and agent definitions as sequences of steps
//! (delays, external calls, conditionals, transforms) against unreliable
//! dependencies, with per-step retry policies, per-dependency circuit
//! breakers and fixed-window resource limits.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: Definition model, YAML/JSON parsing, validation and the registry
//! - [`execution`]: Orchestrator, step dispatcher, execution context and stores
//! - [`resilience`]: Backoff & retry, circuit breakers, resource guard
//! - [`monitoring`]: Lifecycle telemetry and step timelines
//! - [`config`]: Engine-wide settings
//! - [`error`]: Error types shared by every module
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use flowrunner::execution::{EchoHandler, ExecutionRequest};
//! use flowrunner::{load_definition, Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(EngineConfig::default());
//!     engine.register_handler("echo", Arc::new(EchoHandler));
//!     engine.register(load_definition("reconcile.yaml")?)?;
//!
//!     let handle = engine.execute_async(ExecutionRequest::new("reconcile", "scheduler"))?;
//!     let result = handle.wait().await?;
//!     println!("{}", result.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod resilience;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, Result, StepError};
pub use execution::{Engine, ExecutionHandle, ExecutionRequest, ExecutionResult, ExecutionStatus};
pub use workflow::model::{Definition, Step};
pub use workflow::parser::load_definition;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";
