//! Theme conflict policy
//!
//! Deterministic resolution of the frozen proposal set:
//!
//! - **Status**: highest manifest priority wins, then earliest submission.
//! - **Headers**: applied in `(priority, seq)` order; a `set` or `remove`
//!   supersedes every earlier live operation on the same name, `append`
//!   stacks.
//! - **Transforms**: conditions are checked against the response content
//!   type and request path; exclusive operations on the same target keep the
//!   highest priority, then the earliest. Inserts stack. Regex replacements
//!   are ordered before element transforms.
//!
//! Every proposal ends up either applied or discarded with a reason.

use crate::proposal::{AggregatedProposals, HeaderOp, HeaderProposal, Proposal, TransformDescriptor, TransformOp};
use crate::script::ScriptValue;
use serde::Serialize;
use std::collections::BTreeMap;

/// Reference to a proposal that made it into the response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Applied {
    /// Sequence number
    pub seq: u64,
    /// Submitting extension
    pub extension: String,
    /// Proposal kind
    pub kind: &'static str,
}

/// A proposal that lost
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discard {
    /// Sequence number
    pub seq: u64,
    /// Submitting extension
    pub extension: String,
    /// Proposal kind
    pub kind: &'static str,
    /// Why it lost
    pub reason: String,
}

/// Outcome of resolution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    /// Winning status code
    pub status: Option<u16>,
    /// Header operations to apply, in order
    pub headers: Vec<HeaderProposal>,
    /// Transforms to apply, in order
    pub transforms: Vec<TransformDescriptor>,
    /// Proposals that contributed
    pub applied: Vec<Applied>,
    /// Proposals that were dropped
    pub discarded: Vec<Discard>,
}

impl Resolution {
    /// Script-facing summary
    #[must_use]
    pub fn to_script(&self) -> ScriptValue {
        let mut map = BTreeMap::new();
        map.insert(
            "status".to_string(),
            self.status.map_or(ScriptValue::Null, |s| ScriptValue::Int(i64::from(s))),
        );
        map.insert(
            "headers".to_string(),
            ScriptValue::List(
                self.headers
                    .iter()
                    .map(|h| {
                        let mut entry = BTreeMap::new();
                        entry.insert("op".to_string(), ScriptValue::Str(h.op.to_string()));
                        entry.insert("name".to_string(), ScriptValue::Str(h.name.clone()));
                        entry.insert(
                            "value".to_string(),
                            h.value.clone().map_or(ScriptValue::Null, ScriptValue::Str),
                        );
                        ScriptValue::Map(entry)
                    })
                    .collect(),
            ),
        );
        map.insert("transforms".to_string(), ScriptValue::Int(self.transforms.len() as i64));
        map.insert("applied".to_string(), ScriptValue::Int(self.applied.len() as i64));
        map.insert("discarded".to_string(), ScriptValue::Int(self.discarded.len() as i64));
        ScriptValue::Map(map)
    }
}

fn applied(p: &Proposal) -> Applied {
    Applied {
        seq: p.seq,
        extension: p.source_extension_id.clone(),
        kind: p.kind.name(),
    }
}

fn discard(p: &Proposal, reason: String) -> Discard {
    Discard {
        seq: p.seq,
        extension: p.source_extension_id.clone(),
        kind: p.kind.name(),
        reason,
    }
}

/// Resolve the frozen proposal set for a response
#[must_use]
pub fn resolve(view: &AggregatedProposals, content_type: Option<&str>, path: &str) -> Resolution {
    let mut out = Resolution::default();

    let winner = view
        .statuses()
        .min_by_key(|(p, _)| (std::cmp::Reverse(p.priority), p.seq))
        .map(|(p, code)| (p.seq, code, p.source_extension_id.clone(), p.priority));
    for (p, code) in view.statuses() {
        match &winner {
            Some((seq, _, _, _)) if *seq == p.seq => {
                out.status = Some(code);
                out.applied.push(applied(p));
            }
            Some((seq, won, ext, priority)) => out.discarded.push(discard(
                p,
                format!("status {code} lost to {won} (seq {seq}) from {ext} at priority {priority}"),
            )),
            None => {}
        }
    }

    let mut headers: Vec<(&Proposal, &HeaderProposal)> = view.headers().collect();
    headers.sort_by_key(|(p, _)| (p.priority, p.seq));
    let mut live: Vec<(&Proposal, &HeaderProposal)> = Vec::new();
    for (p, header) in headers {
        if matches!(header.op, HeaderOp::Set | HeaderOp::Remove) {
            live.retain(|(earlier, existing)| {
                if existing.same_name(&header.name) {
                    out.discarded.push(discard(
                        earlier,
                        format!("{} of {} overridden by {} (seq {})", existing.op, existing.name, header.op, p.seq),
                    ));
                    false
                } else {
                    true
                }
            });
        }
        live.push((p, header));
    }
    for (p, header) in live {
        out.headers.push(header.clone());
        out.applied.push(applied(p));
    }

    let mut candidates: Vec<(&Proposal, &TransformDescriptor)> = Vec::new();
    for (p, descriptor) in view.transforms() {
        if descriptor.applies_to(content_type, path) {
            candidates.push((p, descriptor));
        } else {
            out.discarded.push(discard(
                p,
                format!("conditions not met for {} at {path}", content_type.unwrap_or("unknown content type")),
            ));
        }
    }
    let mut owners: BTreeMap<String, (i32, u64)> = BTreeMap::new();
    for (p, descriptor) in candidates.iter().filter(|(_, d)| d.is_exclusive()) {
        let best = owners.entry(descriptor.target()).or_insert((p.priority, p.seq));
        if (std::cmp::Reverse(p.priority), p.seq) < (std::cmp::Reverse(best.0), best.1) {
            *best = (p.priority, p.seq);
        }
    }
    let mut kept = Vec::new();
    for (p, descriptor) in candidates {
        if descriptor.is_exclusive() {
            let target = descriptor.target();
            if let Some((_, seq)) = owners.get(&target) {
                if *seq != p.seq {
                    out.discarded.push(discard(
                        p,
                        format!("{} on {target} overlaps seq {seq} with higher precedence", descriptor.op.name()),
                    ));
                    continue;
                }
            }
        }
        kept.push((p, descriptor));
    }
    kept.sort_by_key(|(p, d)| (!matches!(d.op, TransformOp::RegexReplace { .. }), p.seq));
    for (p, descriptor) in kept {
        out.transforms.push(descriptor.clone());
        out.applied.push(applied(p));
    }

    out.applied.sort_by_key(|a| a.seq);
    out.discarded.sort_by_key(|d| d.seq);
    out
}
