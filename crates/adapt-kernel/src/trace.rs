//! Trace Recorder
//!
//! Per-request, append-only audit of what extensions read, proposed and had
//! applied, and of every contained failure. Events are hash-chained so an
//! exported trace can be checked for tampering.

use crate::budget::BudgetDimension;
use crate::error::TraceError;
use adapt_signal::Phase;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Instant;

const GENESIS: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceKind {
    /// Scope entered the event's phase
    PhaseEntered,
    /// Instance taken for the request
    ExtensionActivated {
        /// Extension id
        extension: String,
        /// Whether a pooled instance was reused
        reused: bool,
    },
    /// Signal read by an extension
    SignalRead {
        /// Extension id
        extension: String,
        /// Qualified signal name
        signal: String,
    },
    /// Transform computed for an extension
    TransformComputed {
        /// Extension id
        extension: String,
        /// Qualified signal name
        signal: String,
        /// Transform op
        transform: String,
    },
    /// Transform returned an error sentinel
    TransformFailed {
        /// Extension id
        extension: String,
        /// Sentinel code
        code: String,
    },
    /// Proposal staged
    ProposalSubmitted {
        /// Extension id
        extension: String,
        /// Sequence number
        seq: u64,
        /// Proposal kind
        kind: String,
    },
    /// Staged proposals dropped with an aborted invocation
    ProposalsDropped {
        /// Extension id
        extension: String,
        /// How many
        count: usize,
    },
    /// Proposal applied by the Theme
    ProposalApplied {
        /// Sequence number
        seq: u64,
        /// Submitting extension
        extension: String,
        /// Proposal kind
        kind: String,
    },
    /// Proposal discarded during resolution
    ProposalDiscarded {
        /// Sequence number
        seq: u64,
        /// Submitting extension
        extension: String,
        /// Proposal kind
        kind: String,
        /// Why
        reason: String,
    },
    /// Action attempted in the wrong phase
    PhaseViolation {
        /// Extension id
        extension: String,
        /// Attempted action
        action: String,
    },
    /// Undeclared capability used
    CapabilityViolation {
        /// Extension id
        extension: String,
        /// What was attempted
        detail: String,
    },
    /// Budget ceiling breached
    BudgetExceeded {
        /// Extension id
        extension: String,
        /// Dimension breached
        dimension: BudgetDimension,
        /// Ceiling
        limit: u64,
        /// Observed value
        observed: u64,
    },
    /// Policy collaborator consulted
    PolicyConsulted {
        /// Extension id
        extension: String,
        /// Action
        action: String,
        /// Resource
        resource: String,
        /// Verdict
        allowed: bool,
    },
    /// Secret looked up (value never recorded)
    SecretRead {
        /// Extension id
        extension: String,
        /// Secret key
        key: String,
        /// Whether it existed
        found: bool,
    },
    /// Plugin invocation failed and was contained
    ExtensionFailed {
        /// Extension id
        extension: String,
        /// Failure
        error: String,
    },
    /// Theme failed; a generic error response was produced
    ThemeFailed {
        /// Extension id
        extension: String,
        /// Failure
        error: String,
    },
    /// Effects did not settle within the round limit
    Unsettled {
        /// Rounds run
        rounds: usize,
    },
    /// Request cancelled
    Cancelled,
    /// Scope disposed
    Disposed,
}

/// One hash-chained trace entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Position in the trace
    pub index: u64,
    /// Owning request
    pub request_id: String,
    /// Phase at the time
    pub phase: Phase,
    /// Microseconds since the scope was created
    pub at_micros: u64,
    /// Payload
    #[serde(flatten)]
    pub kind: TraceKind,
    /// Hash of the previous event
    pub prev_hash: String,
    /// Hash of this event
    pub hash: String,
}

fn compute_hash(event: &TraceEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.index.to_le_bytes());
    hasher.update(event.request_id.as_bytes());
    hasher.update([0]);
    hasher.update(event.phase.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(event.at_micros.to_le_bytes());
    hasher.update(serde_json::to_vec(&event.kind).unwrap_or_default());
    hasher.update([0]);
    hasher.update(event.prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Frozen copy of a request's trace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// Owning request
    pub request_id: String,
    /// Events in order
    pub events: Vec<TraceEvent>,
}

impl Trace {
    /// Re-check the hash chain
    pub fn verify_integrity(&self) -> Result<(), TraceError> {
        let mut prev = GENESIS.to_string();
        for event in &self.events {
            if event.prev_hash != prev || event.hash != compute_hash(event) {
                return Err(TraceError::IntegrityViolation { index: event.index });
            }
            prev.clone_from(&event.hash);
        }
        Ok(())
    }

    /// Distinct signals read, in first-read order
    #[must_use]
    pub fn signals_read(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for event in &self.events {
            if let TraceKind::SignalRead { signal, .. } | TraceKind::TransformComputed { signal, .. } = &event.kind {
                if !seen.contains(signal) {
                    seen.push(signal.clone());
                }
            }
        }
        seen
    }

    /// Applied proposals as `seq:extension:kind`
    #[must_use]
    pub fn proposals_applied(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match &e.kind {
                TraceKind::ProposalApplied { seq, extension, kind } => Some(format!("{seq}:{extension}:{kind}")),
                _ => None,
            })
            .collect()
    }

    /// Discarded proposals with their reasons
    #[must_use]
    pub fn proposals_discarded(&self) -> Vec<(u64, String, String)> {
        self.events
            .iter()
            .filter_map(|e| match &e.kind {
                TraceKind::ProposalDiscarded {
                    seq, extension, reason, ..
                } => Some((*seq, extension.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    /// Events matching a predicate
    pub fn find<'a>(&'a self, mut predicate: impl FnMut(&TraceKind) -> bool + 'a) -> impl Iterator<Item = &'a TraceEvent> + 'a {
        self.events.iter().filter(move |e| predicate(&e.kind))
    }

    /// Diagnostic response headers
    #[must_use]
    pub fn to_headers(&self, prefix: &str) -> Vec<(String, String)> {
        vec![
            (format!("{prefix}-request-id"), self.request_id.clone()),
            (format!("{prefix}-signals-read"), self.signals_read().join(", ")),
            (format!("{prefix}-proposals-applied"), self.proposals_applied().join(", ")),
        ]
    }
}

/// Per-request recorder
#[derive(Debug)]
pub struct TraceRecorder {
    request_id: String,
    started: Instant,
    log_sink: bool,
    events: Mutex<Vec<TraceEvent>>,
}

impl TraceRecorder {
    /// Recorder for one request; `log_sink` mirrors events into `tracing`
    #[must_use]
    pub fn new(request_id: impl Into<String>, log_sink: bool) -> Self {
        Self {
            request_id: request_id.into(),
            started: Instant::now(),
            log_sink,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Owning request
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Append an event; returns its index
    pub fn record(&self, phase: Phase, kind: TraceKind) -> u64 {
        let mut events = self.events.lock();
        let index = events.len() as u64;
        let prev_hash = events.last().map_or_else(|| GENESIS.to_string(), |e| e.hash.clone());
        let mut event = TraceEvent {
            index,
            request_id: self.request_id.clone(),
            phase,
            at_micros: u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX),
            kind,
            prev_hash,
            hash: String::new(),
        };
        event.hash = compute_hash(&event);
        if self.log_sink {
            tracing::info!(
                target: "adapt_kernel::trace",
                request_id = %self.request_id,
                index,
                phase = %phase,
                event = ?event.kind,
                "trace"
            );
        }
        events.push(event);
        index
    }

    /// Number of events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Copy of the trace so far
    #[must_use]
    pub fn snapshot(&self) -> Trace {
        Trace {
            request_id: self.request_id.clone(),
            events: self.events.lock().clone(),
        }
    }

    /// Re-check the hash chain
    pub fn verify_integrity(&self) -> Result<(), TraceError> {
        self.snapshot().verify_integrity()
    }
}
