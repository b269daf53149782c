//! Execution Monitoring Module
//!
//! Provides lifecycle telemetry and per-execution step timelines.
//!
//! # Components
//!
//! - [`TelemetrySink`]: Receives started/completed/failed events
//! - [`ExecutionTimeline`]: Step start/end timing for reports and Gantt charts

pub mod telemetry;
pub mod timeline;

pub use telemetry::{ChannelTelemetry, FanoutTelemetry, LifecycleEvent, LogTelemetry, TelemetrySink};
pub use timeline::{EventType, ExecutionTimeline, StepTiming, TimelineEvent};
