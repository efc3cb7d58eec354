//! Adapt Kernel (adapt-kernel)
//!
//! Per-request execution engine for untrusted extensions:
//! 1. **Observe**: Plugins and the Theme read request, content and response signals
//! 2. **Propose**: Plugins submit immutable proposals; nobody mutates the response
//! 3. **Apply**: the Theme resolves the frozen proposal set and writes the response
//! 4. **Finalize**: the scope is disposed and the trace sealed
//!
//! Extensions are JavaScript sources run by [`js::JsScriptFactory`], or any
//! other implementation of the [`script::Script`] seam, under a uniform
//! [`budget::ExecutionBudget`], reach the engine only through host functions
//! their [`manifest`] registers, and are re-run by the effect scheduler when a
//! signal they read changes.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use adapt_kernel::prelude::*;
//!
//! let plugin = ScriptBuilder::new()
//!     .on(Entry::Propose, |_, host| Ok(host.propose_header("X-Foo", "bar")?));
//! let theme = ScriptBuilder::new()
//!     .on(Entry::Apply, |_, host| Ok(host.call(HostFn::ProposalsApply, &[])?));
//!
//! let engine = Engine::builder()
//!     .extension_toml(PLUGIN_TOML, Arc::new(plugin))?
//!     .extension_toml(THEME_TOML, Arc::new(theme))?
//!     .build()?;
//!
//! let response = engine
//!     .handle(RequestDescriptor::get("/blog/post-1"), ContentDescriptor::new())
//!     .await?;
//! assert_eq!(response.header("x-foo"), Some("bar"));
//! ```

pub mod budget;
pub mod config;
pub mod demo;
pub mod engine;
pub mod error;
pub mod host;
pub mod js;
pub mod logging;
pub mod manifest;
pub mod phase;
pub mod proposal;
pub mod render;
pub mod request;
pub mod resolve;
pub mod sandbox;
pub mod scope;
pub mod script;
pub mod trace;
pub mod transform;

// Re-exports
pub use config::{EngineConfig, TraceConfig};
pub use engine::{Engine, EngineBuilder, Rejected};
pub use error::*;
pub use request::{ContentDescriptor, RequestDescriptor, Response};
pub use scope::{DryRunReport, Outcome, RequestScope};

/// Commonly used types
pub mod prelude {
    pub use crate::budget::{BudgetDimension, BudgetExceeded, ExecutionBudget};
    pub use crate::config::{EngineConfig, TraceConfig};
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::error::{EngineError, ManifestError, PhaseViolation, SandboxError, TransformFailure};
    pub use crate::host::{Authorizer, Decision, PolicyTable, SecretStore, StaticSecrets};
    pub use crate::js::JsScriptFactory;
    pub use crate::manifest::{Capability, ExtensionKind, ExtensionManifest};
    pub use crate::proposal::{AggregatedProposals, HeaderOp, Proposal, ProposalKind, TransformDescriptor};
    pub use crate::request::{ContentDescriptor, RequestDescriptor, Response};
    pub use crate::scope::{DryRunReport, Outcome, RequestScope};
    pub use crate::script::{Entry, Host, HostExt, HostFn, Script, ScriptBuilder, ScriptFactory, ScriptValue};
    pub use crate::trace::{Trace, TraceKind};
    pub use adapt_signal::{BodyHandle, Phase, SignalDomain, SignalKey, SignalValue};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with strict debugging enabled
#[must_use]
pub const fn strict_debug() -> bool {
    cfg!(feature = "strict-debug")
}
