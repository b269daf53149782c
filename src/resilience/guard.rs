//! Resource Guard
//!
//! Fixed-window counters bounding how much of a named resource (request
//! bodies, uploads, API calls) may be consumed per window. A window starts
//! on the first check after the previous one expired.
//!
//! Known limitation: this is not a sliding window, so a burst straddling a
//! window boundary can consume up to twice the configured count.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Request payload sizes.
pub const REQUEST_BODY: &str = "request_body";
/// Query string sizes.
pub const QUERY_PARAMS: &str = "query_params";
/// Uploaded file sizes.
pub const FILE_UPLOAD: &str = "file_upload";
/// Outbound calls to external dependencies.
pub const API_CALLS: &str = "api_calls";

/// Limit applied to one resource type.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimit {
    /// Maximum number of checks allowed per window.
    pub max_count: u64,
    /// Maximum accumulated size per window; 0 means size is not limited.
    #[serde(default)]
    pub max_size: u64,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl ResourceLimit {
    pub fn new(max_count: u64, max_size: u64, window: Duration) -> Self {
        Self {
            max_count,
            max_size,
            window_ms: window.as_millis() as u64,
        }
    }

    /// Built-in limits for the standard resource types.
    pub fn defaults() -> HashMap<String, ResourceLimit> {
        let minute = Duration::from_secs(60);
        HashMap::from([
            (REQUEST_BODY.to_string(), Self::new(100, 10 * 1024 * 1024, minute)),
            (QUERY_PARAMS.to_string(), Self::new(50, 8192, minute)),
            (FILE_UPLOAD.to_string(), Self::new(10, 50 * 1024 * 1024, minute)),
            (API_CALLS.to_string(), Self::new(1000, 0, minute)),
        ])
    }
}

/// Usage accumulated in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub count: u64,
    pub total_size: u64,
    pub reset_at: Instant,
}

/// Result of a guard check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardDecision {
    pub allowed: bool,
    /// Checks left in the current window.
    pub remaining: u64,
    /// Time until the current window resets.
    pub reset_in: Duration,
}

/// Shared fixed-window limiter.
pub struct ResourceGuard {
    limits: HashMap<String, ResourceLimit>,
    usage: Mutex<HashMap<String, ResourceUsage>>,
}

impl ResourceGuard {
    pub fn new(limits: HashMap<String, ResourceLimit>) -> Self {
        Self {
            limits,
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Configured limit for a resource type.
    pub fn limit(&self, resource: &str) -> Option<&ResourceLimit> {
        self.limits.get(resource)
    }

    /// Checks `size` units of `resource` against its configured limit.
    ///
    /// Resource types without a configured limit are always allowed.
    pub fn check(&self, resource: &str, size: u64) -> GuardDecision {
        match self.limits.get(resource) {
            Some(limit) => self.check_with(resource, size, *limit),
            None => {
                debug!("No limit configured for '{}', allowing", resource);
                GuardDecision {
                    allowed: true,
                    remaining: u64::MAX,
                    reset_in: Duration::ZERO,
                }
            }
        }
    }

    /// Checks against an explicit limit. Usage is only recorded when allowed.
    pub fn check_with(&self, resource: &str, size: u64, limit: ResourceLimit) -> GuardDecision {
        let now = Instant::now();
        let mut trackers = self.lock();

        let usage = trackers
            .entry(resource.to_string())
            .or_insert_with(|| ResourceUsage {
                count: 0,
                total_size: 0,
                reset_at: now + Duration::from_millis(limit.window_ms),
            });

        if now >= usage.reset_at {
            *usage = ResourceUsage {
                count: 0,
                total_size: 0,
                reset_at: now + Duration::from_millis(limit.window_ms),
            };
        }

        let reset_in = usage.reset_at.saturating_duration_since(now);

        let over_count = usage.count >= limit.max_count;
        let over_size = limit.max_size > 0 && usage.total_size.saturating_add(size) > limit.max_size;

        if over_count || over_size {
            warn!(
                "Resource limit exceeded for '{}' (count {}/{}, size {}+{}/{})",
                resource, usage.count, limit.max_count, usage.total_size, size, limit.max_size
            );
            return GuardDecision {
                allowed: false,
                remaining: 0,
                reset_in,
            };
        }

        usage.count += 1;
        usage.total_size = usage.total_size.saturating_add(size);

        GuardDecision {
            allowed: true,
            remaining: limit.max_count - usage.count,
            reset_in,
        }
    }

    /// Usage in the current window, if any.
    pub fn usage(&self, resource: &str) -> Option<ResourceUsage> {
        self.lock().get(resource).copied()
    }

    /// Drops the usage tracked for a resource type.
    pub fn reset(&self, resource: &str) {
        self.lock().remove(resource);
    }

    /// Drops every tracker whose window has expired. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut trackers = self.lock();
        let before = trackers.len();
        trackers.retain(|_, usage| now < usage.reset_at);
        before - trackers.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ResourceUsage>> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ResourceGuard {
    fn default() -> Self {
        Self::new(ResourceLimit::defaults())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(max_count: u64, max_size: u64) -> ResourceGuard {
        ResourceGuard::new(HashMap::from([(
            "uploads".to_string(),
            ResourceLimit::new(max_count, max_size, Duration::from_millis(1_000)),
        )]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_limit() {
        let guard = guard(3, 0);

        assert_eq!(guard.check("uploads", 0).remaining, 2);
        assert_eq!(guard.check("uploads", 0).remaining, 1);
        assert!(guard.check("uploads", 0).allowed);

        let rejected = guard.check("uploads", 0);
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(guard.usage("uploads").unwrap().count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_limit_does_not_record_rejected_usage() {
        let guard = guard(10, 100);

        assert!(guard.check("uploads", 60).allowed);
        assert!(!guard.check("uploads", 50).allowed);
        assert!(guard.check("uploads", 40).allowed);

        let usage = guard.usage("uploads").unwrap();
        assert_eq!(usage.count, 2);
        assert_eq!(usage.total_size, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_elapsed() {
        let guard = guard(1, 0);

        assert!(guard.check("uploads", 0).allowed);
        let rejected = guard.check("uploads", 0);
        assert!(!rejected.allowed);
        assert_eq!(rejected.reset_in, Duration::from_millis(1_000));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(guard.check("uploads", 0).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_resource_is_unlimited() {
        let guard = guard(1, 0);
        for _ in 0..10 {
            assert!(guard.check("anything", 1_000).allowed);
        }
        assert!(guard.usage("anything").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_and_cleanup() {
        let guard = guard(1, 0);
        guard.check("uploads", 0);
        guard.reset("uploads");
        assert!(guard.usage("uploads").is_none());
        assert!(guard.check("uploads", 0).allowed);

        assert_eq!(guard.cleanup_expired(), 0);
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(guard.cleanup_expired(), 1);
    }

    #[test]
    fn test_default_limits() {
        let guard = ResourceGuard::default();
        assert_eq!(guard.limit(API_CALLS).unwrap().max_count, 1000);
        assert_eq!(guard.limit(REQUEST_BODY).unwrap().max_size, 10 * 1024 * 1024);
        assert_eq!(guard.limit(FILE_UPLOAD).unwrap().max_count, 10);
    }
}
