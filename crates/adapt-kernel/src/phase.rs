//! Phase Controller
//!
//! Strictly linear `Observe -> Propose -> Apply -> Finalize` state machine
//! plus the table of which actions each extension kind may take in which
//! phase. Host-originated illegal transitions are protocol errors; calls
//! made by extensions in the wrong phase are [`PhaseViolation`]s.

use crate::error::{EngineError, PhaseViolation};
use crate::manifest::ExtensionKind;
use crate::script::HostFn;
use adapt_signal::{Phase, SignalDomain};
use std::fmt;

/// Validates a phase transition.
///
/// Illegal transitions panic with the `strict-debug` feature; otherwise
/// they are returned as protocol errors.
pub fn validate_transition(from: Phase, to: Phase) -> Result<(), EngineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal phase transition attempted: {from:?} -> {to:?}");

        #[cfg(not(feature = "strict-debug"))]
        Err(EngineError::Protocol { from, to })
    }
}

/// Phases reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: Phase) -> Vec<Phase> {
    from.next().into_iter().collect()
}

fn allowed(from: Phase, to: Phase) -> bool {
    allowed_transitions(from).into_iter().any(|p| p == to)
}

/// Something an extension can attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Read a signal of a domain
    Read(SignalDomain),
    /// Compute a transform
    Transform,
    /// Submit a proposal
    Propose,
    /// Resolve aggregated proposals
    Resolve,
    /// Mutate the response
    Write,
    /// Call a render collaborator
    Render,
    /// Consult policy
    Authorize,
    /// Read a secret
    Secret,
    /// Emit a log line
    Log,
}

impl Action {
    /// Action performed by a host function; signal reads carry their domain
    #[must_use]
    pub fn of(function: HostFn, domain: Option<SignalDomain>) -> Self {
        match function {
            HostFn::SignalGet | HostFn::SignalHas => Self::Read(domain.unwrap_or(SignalDomain::Request)),
            HostFn::Transform => Self::Transform,
            HostFn::ProposeStatus | HostFn::ProposeHeader | HostFn::ProposeTransform => Self::Propose,
            HostFn::ProposalsResolve => Self::Resolve,
            HostFn::ProposalsApply | HostFn::ResponseStatus | HostFn::ResponseHeader | HostFn::ResponseBody => {
                Self::Write
            }
            HostFn::RenderTemplate => Self::Render,
            HostFn::ContentQuery => Self::Read(SignalDomain::Content),
            HostFn::PolicyAuthorize => Self::Authorize,
            HostFn::SecretGet => Self::Secret,
            HostFn::Log => Self::Log,
        }
    }

    /// Whether `kind` may take this action during `phase`
    #[must_use]
    pub fn permitted(self, phase: Phase, kind: ExtensionKind) -> bool {
        use ExtensionKind::{Plugin, Theme};
        use Phase::{Apply, Finalize, Observe, Propose};
        match (self, phase, kind) {
            (_, Finalize, _) => false,
            (Self::Read(SignalDomain::Plugins), Apply, _) => true,
            (Self::Read(SignalDomain::Plugins), _, _) => false,
            (Self::Read(_) | Self::Transform | Self::Authorize | Self::Secret | Self::Log, _, _) => true,
            (Self::Propose, Propose, Plugin) => true,
            (Self::Resolve | Self::Write | Self::Render, Apply, Theme) => true,
            (Self::Propose | Self::Resolve | Self::Write | Self::Render, Observe | Propose | Apply, _) => false,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(domain) => write!(f, "read:{domain}"),
            Self::Transform => f.write_str("transform"),
            Self::Propose => f.write_str("propose"),
            Self::Resolve => f.write_str("resolve"),
            Self::Write => f.write_str("write"),
            Self::Render => f.write_str("render"),
            Self::Authorize => f.write_str("authorize"),
            Self::Secret => f.write_str("secret"),
            Self::Log => f.write_str("log"),
        }
    }
}

/// Per-request phase state
#[derive(Debug, Clone)]
pub struct PhaseController {
    current: Phase,
    history: Vec<Phase>,
}

impl Default for PhaseController {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseController {
    /// Start in Observe
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Phase::Observe,
            history: vec![Phase::Observe],
        }
    }

    /// Current phase
    #[inline]
    #[must_use]
    pub fn current(&self) -> Phase {
        self.current
    }

    /// Phases entered so far, in order
    #[must_use]
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    /// Move to `to`; only the immediate successor is legal
    #[tracing::instrument(level = "debug", skip(self), fields(from = %self.current))]
    pub fn advance(&mut self, to: Phase) -> Result<(), EngineError> {
        validate_transition(self.current, to)?;
        self.current = to;
        self.history.push(to);
        Ok(())
    }

    /// Check `action` for `kind` against the current phase
    pub fn check(&self, action: Action, kind: ExtensionKind) -> Result<(), PhaseViolation> {
        if action.permitted(self.current, kind) {
            Ok(())
        } else {
            Err(PhaseViolation {
                action: action.to_string(),
                phase: self.current,
                kind,
            })
        }
    }

    /// Whether the terminal phase has been reached
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.current == Phase::Finalize
    }
}
