//! Engine Configuration
//!
//! Loaded from YAML; every field has a default so an empty file is valid.
//!
//! ```yaml
//! execution_timeout_ms: 300000
//! step_timeout_ms: 30000
//! default_breaker:
//!   failure_threshold: 5
//!   timeout_ms: 60000
//! breakers:
//!   openai:
//!     failure_threshold: 3
//!     success_threshold: 1
//!     timeout_ms: 120000
//! limits:
//!   api_calls:
//!     max_count: 500
//!     window_ms: 60000
//! store_dir: .flowrunner
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::resilience::{BreakerConfig, BreakerRegistry, ResourceGuard, ResourceLimit};

/// Default cap on step visits per execution.
pub const DEFAULT_MAX_STEPS: u32 = 1000;

/// Default directory for persisted execution records.
pub const DEFAULT_STORE_DIR: &str = ".flowrunner";

fn default_max_steps() -> u32 {
    DEFAULT_MAX_STEPS
}

fn default_limits() -> HashMap<String, ResourceLimit> {
    ResourceLimit::defaults()
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_DIR)
}

/// Engine-wide settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Whole-execution budget unless the definition sets its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout_ms: Option<u64>,

    /// Per-step budget unless the step sets its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_ms: Option<u64>,

    /// Step visits allowed per execution
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Breaker settings for dependencies without an override
    #[serde(default)]
    pub default_breaker: BreakerConfig,

    /// Breaker settings per dependency name
    #[serde(default)]
    pub breakers: HashMap<String, BreakerConfig>,

    /// Resource limits by resource type; replaces the built-in set when given
    #[serde(default = "default_limits")]
    pub limits: HashMap<String, ResourceLimit>,

    /// Directory for the JSON execution store
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: None,
            step_timeout_ms: None,
            max_steps: DEFAULT_MAX_STEPS,
            default_breaker: BreakerConfig::default(),
            breakers: HashMap::new(),
            limits: default_limits(),
            store_dir: default_store_dir(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn with_execution_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.execution_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_step_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.step_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_breaker(mut self, dependency: impl Into<String>, config: BreakerConfig) -> Self {
        self.breakers.insert(dependency.into(), config);
        self
    }

    pub fn with_limit(mut self, resource: impl Into<String>, limit: ResourceLimit) -> Self {
        self.limits.insert(resource.into(), limit);
        self
    }

    /// Builds the breaker registry described by this configuration.
    pub fn breaker_registry(&self) -> BreakerRegistry {
        self.breakers.iter().fold(
            BreakerRegistry::new(self.default_breaker.clone()),
            |registry, (name, config)| registry.with_config(name.clone(), config.clone()),
        )
    }

    /// Builds the resource guard described by this configuration.
    pub fn resource_guard(&self) -> ResourceGuard {
        ResourceGuard::new(self.limits.clone())
    }
}
