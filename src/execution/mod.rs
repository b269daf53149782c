//! Execution Module
//!
//! Runs registered definitions step by step, with synchronous and
//! background entry points, cancellation, and result persistence.
//!
//! # Architecture
//!
//! - [`engine`]: Orchestrator that walks a definition and owns the lifecycle
//! - [`dispatcher`]: Per-step-type execution and the handler seam
//! - [`context`]: Requests, per-execution context, and results
//! - [`store`]: Where terminal results are persisted

pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod store;

pub use context::{
    ErrorInfo, ExecutionContext, ExecutionMetrics, ExecutionRequest, ExecutionResult,
    ExecutionStatus, Priority,
};
pub use dispatcher::{EchoHandler, StepDispatcher, StepHandler, StepOutcome, StepOutput, Transition};
pub use engine::{Engine, ExecutionHandle};
pub use store::{ExecutionRecord, ExecutionStore, InMemoryStore, JsonFileStore};
