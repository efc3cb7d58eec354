//! Error types for the Adapt kernel
//!
//! Provides the error taxonomy of the engine:
//! - Capability violations (fatal to one extension's load)
//! - Phase violations (abort the offending call only)
//! - Budget exhaustion (abort the current invocation only)
//! - Transform failures (sentinel returned to the script)
//! - Host protocol errors (fatal to the request)

use crate::budget::BudgetExceeded;
use crate::manifest::ExtensionKind;
use adapt_signal::{Phase, SchedulerError, SignalError};

/// Manifest loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Manifest text is not valid TOML / does not match the schema
    #[error("invalid manifest: {0}")]
    Parse(#[from] toml::de::Error),

    /// Undeclared or unknown capability requested
    #[error("capability violation in {extension}: {detail}")]
    CapabilityViolation {
        /// Offending extension
        extension: String,
        /// What was requested
        detail: String,
    },

    /// Manifest requires an engine version this build does not satisfy
    #[error("{extension} requires engine {required}, running {actual}")]
    IncompatibleEngine {
        /// Offending extension
        extension: String,
        /// Declared requirement
        required: String,
        /// Running engine version
        actual: String,
    },

    /// An extension with the same id is already loaded
    #[error("extension already loaded: {0}")]
    Duplicate(String),

    /// Structurally invalid field
    #[error("invalid manifest field `{field}`: {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Why it is invalid
        reason: String,
    },
}

impl ManifestError {
    /// Whether this is a capability violation
    #[inline]
    #[must_use]
    pub fn is_capability_violation(&self) -> bool {
        matches!(self, Self::CapabilityViolation { .. })
    }
}

/// Action invoked outside the phase it belongs to
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{action} is not permitted for a {kind} during {phase}")]
pub struct PhaseViolation {
    /// Attempted action
    pub action: String,
    /// Phase the scope was in
    pub phase: Phase,
    /// Kind of the calling extension
    pub kind: ExtensionKind,
}

/// Per-extension execution failures, all contained to that extension
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    /// Undeclared capability or unregistered host function
    #[error("capability violation in {extension}: {detail}")]
    CapabilityViolation {
        /// Offending extension
        extension: String,
        /// What was attempted
        detail: String,
    },

    /// Script propagated a phase violation
    #[error("phase violation in {extension}: {violation}")]
    PhaseViolation {
        /// Offending extension
        extension: String,
        /// The violation
        violation: PhaseViolation,
    },

    /// A budget ceiling was breached
    #[error("{extension} exceeded its budget: {exceeded}")]
    BudgetExceeded {
        /// Offending extension
        extension: String,
        /// Exceeded dimension
        exceeded: BudgetExceeded,
    },

    /// Script raised its own error
    #[error("script fault in {extension}: {message}")]
    ScriptFault {
        /// Offending extension
        extension: String,
        /// Script error message
        message: String,
    },

    /// Request was cancelled mid-invocation
    #[error("invocation of {extension} cancelled")]
    Cancelled {
        /// Extension being invoked
        extension: String,
    },

    /// Extension id is not loaded
    #[error("unknown extension: {0}")]
    UnknownExtension(String),
}

impl SandboxError {
    /// Extension the failure belongs to
    #[must_use]
    pub fn extension(&self) -> &str {
        match self {
            Self::CapabilityViolation { extension, .. }
            | Self::PhaseViolation { extension, .. }
            | Self::BudgetExceeded { extension, .. }
            | Self::ScriptFault { extension, .. }
            | Self::Cancelled { extension } => extension,
            Self::UnknownExtension(id) => id,
        }
    }

    /// Whether the failure stays within the extension (everything but cancellation)
    #[inline]
    #[must_use]
    pub fn is_contained(&self) -> bool {
        !matches!(self, Self::Cancelled { .. })
    }
}

/// Transform descriptor or computation failure
///
/// Never aborts the calling script; surfaced as an error sentinel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformFailure {
    /// Descriptor could not be decoded or is incomplete
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// Selector the rewriter cannot match
    #[error("unsupported selector: {0}")]
    UnsupportedSelector(String),

    /// Regular expression failed to compile
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    /// Unknown transform name
    #[error("unknown transform: {0}")]
    UnknownTransform(String),

    /// Signal value has the wrong shape for the transform
    #[error("transform not applicable: {0}")]
    NotApplicable(String),

    /// Reading the body failed
    #[error("body read failed: {0}")]
    Read(String),
}

impl TransformFailure {
    /// Sentinel code handed to scripts
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedDescriptor(_) => "transform_failure:malformed_descriptor",
            Self::UnsupportedSelector(_) => "transform_failure:unsupported_selector",
            Self::InvalidPattern(_) => "transform_failure:invalid_pattern",
            Self::UnknownTransform(_) => "transform_failure:unknown_transform",
            Self::NotApplicable(_) => "transform_failure:not_applicable",
            Self::Read(_) => "transform_failure:read",
        }
    }
}

/// Failures inside render collaborators
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// Template could not be rendered
    #[error("template error: {0}")]
    Template(String),

    /// Query could not be evaluated
    #[error("query error: {0}")]
    Query(String),

    /// Rewriter does not support the requested operation
    #[error("unsupported markup operation: {0}")]
    Unsupported(String),

    /// Invalid regular expression in a rewrite
    #[error("invalid regex {pattern}: {error}")]
    InvalidRegex {
        /// Pattern text
        pattern: String,
        /// Compiler error
        error: String,
    },

    /// Streaming rewriter failed
    #[error("rewrite failed: {0}")]
    Rewrite(String),

    /// Body stream failed
    #[error("body stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trace verification errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceError {
    /// Hash chain broken at `index`
    #[error("trace integrity violation at event {index}")]
    IntegrityViolation {
        /// First event that does not verify
        index: u64,
    },
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML did not parse
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// File could not be read
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Value outside its allowed range
    #[error("invalid configuration value `{field}`: {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// Why it is invalid
        reason: String,
    },
}

/// Request-level engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Host attempted an illegal phase transition
    #[error("protocol violation: cannot move from {from} to {to}")]
    Protocol {
        /// Current phase
        from: Phase,
        /// Requested phase
        to: Phase,
    },

    /// Effect scheduling failed
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Signal store failure
    #[error("signal error: {0}")]
    Signal(#[from] SignalError),

    /// Manifest rejected while building the engine
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No theme is available for Apply
    #[error("no active theme configured")]
    NoTheme,

    /// Request was cancelled (client disconnect)
    #[error("request cancelled during {phase}")]
    Cancelled {
        /// Phase at cancellation
        phase: Phase,
    },

    /// Host tried to change a signal after Observe
    #[error("signals are read-only during {phase}")]
    ReadOnly {
        /// Current phase
        phase: Phase,
    },

    /// Scope already disposed
    #[error("request scope disposed")]
    Disposed,

    /// Worker failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the error terminates the whole request
    #[inline]
    #[must_use]
    pub fn is_fatal_to_request(&self) -> bool {
        !matches!(self, Self::Manifest(_) | Self::Config(_))
    }

    /// Whether the error came from the host driving the protocol incorrectly
    #[inline]
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::ReadOnly { .. } | Self::Disposed)
    }
}
