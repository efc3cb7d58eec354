//! Engine configuration
//!
//! Loadable from TOML; every field has a default so a partial file is enough.
//!
//! ```toml
//! phase_timeout_ms = 500
//! theme = "classic"
//!
//! [budget]
//! max_operations = 20000
//!
//! [trace]
//! expose_headers = true
//! ```

use crate::budget::ExecutionBudget;
use crate::error::ConfigError;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Longest accepted phase timeout, one hour
pub const MAX_PHASE_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// Trace output options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Attach diagnostic headers to the response
    pub expose_headers: bool,
    /// Mirror every trace event into the log
    pub log_sink: bool,
    /// Diagnostic header prefix
    pub header_prefix: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            expose_headers: false,
            log_sink: false,
            header_prefix: "x-adapt-trace".to_string(),
        }
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Uniform per-invocation budget
    pub budget: ExecutionBudget,
    /// Wall-clock ceiling per phase
    pub phase_timeout_ms: u64,
    /// Re-run rounds allowed inside one flush
    pub max_flush_rounds: usize,
    /// Requests admitted at once
    pub max_concurrent_requests: usize,
    /// Idle instances kept per extension
    pub pool_idle_per_extension: usize,
    /// Trace output
    pub trace: TraceConfig,
    /// Active theme id; the only loaded theme when unset
    pub theme: Option<String>,
    /// Engine version manifests are checked against
    pub engine_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            budget: ExecutionBudget::default(),
            phase_timeout_ms: 2_000,
            max_flush_rounds: 8,
            max_concurrent_requests: 64,
            pool_idle_per_extension: 4,
            trace: TraceConfig::default(),
            theme: None,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text and validate
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// With a budget
    #[inline]
    #[must_use]
    pub fn with_budget(mut self, budget: ExecutionBudget) -> Self {
        self.budget = budget;
        self
    }

    /// With a phase timeout
    #[inline]
    #[must_use]
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With a flush round ceiling
    #[inline]
    #[must_use]
    pub fn with_max_flush_rounds(mut self, rounds: usize) -> Self {
        self.max_flush_rounds = rounds;
        self
    }

    /// With an admission limit
    #[inline]
    #[must_use]
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// With a pool size
    #[inline]
    #[must_use]
    pub fn with_pool_idle(mut self, idle: usize) -> Self {
        self.pool_idle_per_extension = idle;
        self
    }

    /// With trace options
    #[inline]
    #[must_use]
    pub fn with_trace(mut self, trace: TraceConfig) -> Self {
        self.trace = trace;
        self
    }

    /// With the active theme
    #[inline]
    #[must_use]
    pub fn with_theme(mut self, theme: impl Into<String>) -> Self {
        self.theme = Some(theme.into());
        self
    }

    /// Phase timeout as a duration
    #[must_use]
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }

    /// Parsed engine version
    pub fn engine_version(&self) -> Result<Version, ConfigError> {
        Version::parse(&self.engine_version).map_err(|e| ConfigError::Invalid {
            field: "engine_version",
            reason: e.to_string(),
        })
    }

    /// Reject ceilings that would make every request fail
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |field: &'static str| ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        };
        if self.budget.max_operations == 0 {
            return Err(zero("budget.max_operations"));
        }
        if self.budget.max_call_depth == 0 {
            return Err(zero("budget.max_call_depth"));
        }
        if self.phase_timeout_ms == 0 {
            return Err(zero("phase_timeout_ms"));
        }
        if self.phase_timeout_ms > MAX_PHASE_TIMEOUT_MS {
            return Err(ConfigError::Invalid {
                field: "phase_timeout_ms",
                reason: format!("must be at most {MAX_PHASE_TIMEOUT_MS}"),
            });
        }
        if self.max_flush_rounds == 0 {
            return Err(zero("max_flush_rounds"));
        }
        if self.max_concurrent_requests == 0 {
            return Err(zero("max_concurrent_requests"));
        }
        if self.trace.header_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "trace.header_prefix",
                reason: "must not be empty".to_string(),
            });
        }
        self.engine_version()?;
        Ok(())
    }
}
