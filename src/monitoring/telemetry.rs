//! Execution Telemetry
//!
//! Lifecycle events emitted by the orchestrator. Sinks are fire-and-forget:
//! `emit` must return promptly and never fail the execution.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::execution::context::{ErrorInfo, ExecutionMetrics, Priority};

/// A lifecycle transition of one execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum LifecycleEvent {
    Started {
        execution_id: String,
        definition_id: String,
        caller_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tenant_id: Option<String>,
        priority: Priority,
        timestamp: DateTime<Utc>,
    },
    Completed {
        execution_id: String,
        definition_id: String,
        timestamp: DateTime<Utc>,
        metrics: ExecutionMetrics,
    },
    Failed {
        execution_id: String,
        definition_id: String,
        timestamp: DateTime<Utc>,
        metrics: ExecutionMetrics,
        error: ErrorInfo,
    },
}

impl LifecycleEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Started { execution_id, .. }
            | Self::Completed { execution_id, .. }
            | Self::Failed { execution_id, .. } => execution_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Receiver of lifecycle events.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn emit(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::Started {
                execution_id,
                definition_id,
                caller_id,
                ..
            } => info!(
                "[telemetry] {} started ({} for {})",
                execution_id, definition_id, caller_id
            ),
            LifecycleEvent::Completed {
                execution_id,
                metrics,
                ..
            } => info!(
                "[telemetry] {} completed in {} ms ({}/{} steps ok, {} retries)",
                execution_id,
                metrics.duration_ms,
                metrics.steps_succeeded,
                metrics.steps_executed,
                metrics.retries
            ),
            LifecycleEvent::Failed {
                execution_id,
                metrics,
                error,
                ..
            } => warn!(
                "[telemetry] {} failed after {} ms: {} ({})",
                execution_id, metrics.duration_ms, error.message, error.code
            ),
        }
    }
}

/// Forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelTelemetry {
    sender: UnboundedSender<LifecycleEvent>,
}

impl ChannelTelemetry {
    pub fn new() -> (Self, UnboundedReceiver<LifecycleEvent>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TelemetrySink for ChannelTelemetry {
    fn emit(&self, event: LifecycleEvent) {
        if let Err(e) = self.sender.send(event) {
            debug!(
                "Telemetry receiver dropped; discarding '{}' for {}",
                e.0.name(),
                e.0.execution_id()
            );
        }
    }
}

/// Delivers every event to several sinks.
#[derive(Default, Clone)]
pub struct FanoutTelemetry {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl TelemetrySink for FanoutTelemetry {
    fn emit(&self, event: LifecycleEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
