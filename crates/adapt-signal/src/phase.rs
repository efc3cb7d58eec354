//! Request phases
//!
//! The phase an effect is registered in is the only phase it may ever run in.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the Observe → Propose → Apply → Finalize protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Signals are populated; read-only introspection
    Observe,
    /// Plugins submit proposals
    Propose,
    /// The active theme resolves proposals and renders
    Apply,
    /// Response is written and the scope is torn down
    Finalize,
}

impl Phase {
    /// All phases in protocol order
    pub const ALL: [Phase; 4] = [Phase::Observe, Phase::Propose, Phase::Apply, Phase::Finalize];

    /// The phase that follows this one, if any
    #[must_use]
    pub const fn next(self) -> Option<Phase> {
        match self {
            Phase::Observe => Some(Phase::Propose),
            Phase::Propose => Some(Phase::Apply),
            Phase::Apply => Some(Phase::Finalize),
            Phase::Finalize => None,
        }
    }

    /// Stable lowercase name, used in trace headers
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::Observe => "observe",
            Phase::Propose => "propose",
            Phase::Apply => "apply",
            Phase::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_is_strictly_linear() {
        assert_eq!(Phase::Observe.next(), Some(Phase::Propose));
        assert_eq!(Phase::Propose.next(), Some(Phase::Apply));
        assert_eq!(Phase::Apply.next(), Some(Phase::Finalize));
        assert_eq!(Phase::Finalize.next(), None);
    }

    #[test]
    fn ordering_follows_protocol() {
        let mut sorted = Phase::ALL;
        sorted.sort();
        assert_eq!(sorted, Phase::ALL);
    }
}
