//! Error types for signals and effects

use crate::phase::Phase;
use crate::store::SignalKey;

/// Signal store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// Key already defined in this scope
    #[error("signal already defined: {0}")]
    AlreadyDefined(SignalKey),

    /// Id or key does not belong to this store
    #[error("unknown signal: {0}")]
    Unknown(String),

    /// Value could not be read as the requested type
    #[error("signal {key} is not a {expected}")]
    TypeMismatch {
        /// Offending signal
        key: SignalKey,
        /// Requested type name
        expected: &'static str,
    },

    /// Store has been disposed with its request scope
    #[error("signal store disposed")]
    Disposed,
}

/// Effect scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Effect would run outside the phase it was registered in
    #[error("effect {effect} registered in {registered} cannot run in {requested}")]
    PhaseViolation {
        /// Effect name
        effect: String,
        /// Phase the effect belongs to
        registered: Phase,
        /// Phase the run was requested for
        requested: Phase,
    },

    /// Effect id not known to this scheduler
    #[error("unknown effect: {0}")]
    UnknownEffect(u32),

    /// Re-run rounds exceeded the configured ceiling
    #[error("phase {phase} did not settle within {rounds} rounds")]
    Unsettled {
        /// Phase being flushed
        phase: Phase,
        /// Rounds executed
        rounds: usize,
    },

    /// Scheduler was disposed at finalize
    #[error("effect scheduler disposed")]
    Disposed,

    /// Store failure while tracking
    #[error(transparent)]
    Signal(#[from] SignalError),
}
