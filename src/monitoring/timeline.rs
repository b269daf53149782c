//! Execution Timeline
//!
//! Tracks step start/end times within one execution for reporting
//! per-step durations and an ASCII Gantt chart.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// ID of the step
    pub step_id: String,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: Instant,
}

/// One finished step visit, relative to the start of the execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StepTiming {
    pub step_id: String,
    pub succeeded: bool,
    pub offset_ms: u64,
    pub duration_ms: u64,
}

/// Tracks the step timeline of an execution.
///
/// Steps run one at a time, so every `Started` event is closed by the next
/// `Completed` or `Failed` event for the same step. A step visited twice
/// produces two entries.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step_id: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finished step visits in the order they started.
    pub fn summary(&self) -> Vec<StepTiming> {
        let mut open: Option<&TimelineEvent> = None;
        let mut timings = Vec::new();

        for event in &self.events {
            match event.event_type {
                EventType::Started => open = Some(event),
                EventType::Completed | EventType::Failed => {
                    if let Some(started) = open.take().filter(|s| s.step_id == event.step_id) {
                        timings.push(StepTiming {
                            step_id: event.step_id.clone(),
                            succeeded: event.event_type == EventType::Completed,
                            offset_ms: millis(started.timestamp.duration_since(self.start_time)),
                            duration_ms: millis(event.timestamp.duration_since(started.timestamp)),
                        });
                    }
                }
            }
        }

        timings
    }

    /// Generates an ASCII Gantt chart representation.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = millis(self.elapsed());
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for timing in self.summary() {
            let start_pos = (timing.offset_ms as f64 * scale) as usize;
            let width = (timing.duration_ms as f64 * scale).max(1.0) as usize;
            let mark = if timing.succeeded { "#" } else { "x" };

            output.push_str(&format!(
                "{:12} |{}{}| ({} ms)\n",
                truncate(&timing.step_id, 12),
                " ".repeat(start_pos),
                mark.repeat(width),
                timing.duration_ms
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_summary_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("fetch", EventType::Started);
        advance(Duration::from_millis(50)).await;
        timeline.add_event("fetch", EventType::Completed);
        timeline.add_event("notify", EventType::Started);
        advance(Duration::from_millis(20)).await;
        timeline.add_event("notify", EventType::Failed);

        let summary = timeline.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].step_id, "fetch");
        assert_eq!(summary[0].duration_ms, 50);
        assert!(summary[0].succeeded);
        assert_eq!(summary[1].offset_ms, 50);
        assert_eq!(summary[1].duration_ms, 20);
        assert!(!summary[1].succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_visits_are_separate_entries() {
        let mut timeline = ExecutionTimeline::new();
        for _ in 0..3 {
            timeline.add_event("poll", EventType::Started);
            advance(Duration::from_millis(5)).await;
            timeline.add_event("poll", EventType::Completed);
        }
        assert_eq!(timeline.summary().len(), 3);
    }

    #[test]
    fn test_unfinished_step_not_summarized() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("step1", EventType::Started);
        assert!(timeline.summary().is_empty());
        assert_eq!(timeline.get_events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("step1", EventType::Started);
        advance(Duration::from_millis(50)).await;
        timeline.add_event("step1", EventType::Completed);
        timeline.add_event("step2", EventType::Started);
        advance(Duration::from_millis(50)).await;
        timeline.add_event("step2", EventType::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("step1"));
        assert!(chart.contains("step2"));
        assert!(chart.contains("x"));
        assert!(chart.contains("Total: 100 ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gantt_chart_empty() {
        let timeline = ExecutionTimeline::new();
        let chart = timeline.gantt_chart();
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains("Total"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("a-very-long-step-id", 8), "a-ver...");
    }
}
