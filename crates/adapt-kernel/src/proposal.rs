//! Proposals and the Proposal Aggregator
//!
//! Plugins never mutate the response. During Propose they submit immutable,
//! phase-tagged [`Proposal`]s; the aggregator keeps them append-only and,
//! once frozen, exposes them to the Theme in a deterministic order. It never
//! resolves conflicts itself.
//!
//! Proposals made by one invocation are staged and only committed when that
//! invocation completes; an aborted invocation contributes nothing.

use crate::error::{PhaseViolation, TransformFailure};
use crate::manifest::ExtensionKind;
use crate::script::ScriptValue;
use crate::transform::parse_selector;
use adapt_signal::{Phase, SignalValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Header mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOp {
    /// Replace any existing value
    #[default]
    Set,
    /// Add another value
    Append,
    /// Remove every value
    Remove,
}

impl HeaderOp {
    /// Parse `set`, `append` or `remove`
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "set" => Some(Self::Set),
            "append" => Some(Self::Append),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Set => "set",
            Self::Append => "append",
            Self::Remove => "remove",
        })
    }
}

fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

/// Proposed header operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderProposal {
    /// Operation
    pub op: HeaderOp,
    /// Header name as written
    pub name: String,
    /// Value; absent for removals
    pub value: Option<String>,
}

impl HeaderProposal {
    /// Validated header operation
    pub fn new(op: HeaderOp, name: impl Into<String>, value: Option<String>) -> Result<Self, String> {
        let name = name.into();
        if !is_token(&name) {
            return Err(format!("invalid header name `{name}`"));
        }
        let value = match (op, value) {
            (HeaderOp::Remove, _) => None,
            (_, None) => return Err(format!("{op} of `{name}` needs a value")),
            (_, Some(v)) if v.contains(|c: char| c == '\r' || c == '\n') => {
                return Err(format!("value of `{name}` contains a line break"));
            }
            (_, Some(v)) => Some(v),
        };
        Ok(Self { op, name, value })
    }

    /// Decode `(name, value?, op?)` script arguments
    pub fn from_args(args: &[ScriptValue]) -> Result<Self, String> {
        let name = args
            .first()
            .and_then(ScriptValue::as_str)
            .ok_or("header name must be a string")?;
        let value = match args.get(1) {
            Some(ScriptValue::Str(v)) => Some(v.clone()),
            Some(ScriptValue::Int(n)) => Some(n.to_string()),
            None | Some(ScriptValue::Null) => None,
            Some(_) => return Err("header value must be a string".into()),
        };
        let op = match args.get(2) {
            None | Some(ScriptValue::Null) => HeaderOp::Set,
            Some(ScriptValue::Str(op)) => HeaderOp::parse(op).ok_or_else(|| format!("unknown header op `{op}`"))?,
            Some(_) => return Err("header op must be a string".into()),
        };
        Self::new(op, name, value)
    }

    /// Case-insensitive name comparison
    #[must_use]
    pub fn same_name(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other)
    }
}

/// Where inserted markup goes relative to the selected element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPosition {
    /// Before the opening tag
    Before,
    /// Right after the opening tag
    Prepend,
    /// Right before the closing tag
    Append,
    /// After the closing tag
    After,
}

/// Requested markup mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    /// Insert markup at `position`
    InsertHtml {
        /// Markup to insert
        html: String,
    },
    /// Replace the element's content
    ReplaceInner {
        /// New content
        html: String,
    },
    /// Set an attribute on the element
    SetAttribute {
        /// Attribute name
        name: String,
        /// Attribute value
        value: String,
    },
    /// Drop the element and its content
    RemoveElement,
    /// Regex substitution over the body text
    RegexReplace {
        /// Pattern
        pattern: String,
        /// Replacement (`$1` style groups)
        replacement: String,
    },
}

impl TransformOp {
    /// Stable name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InsertHtml { .. } => "insert_html",
            Self::ReplaceInner { .. } => "replace_inner",
            Self::SetAttribute { .. } => "set_attribute",
            Self::RemoveElement => "remove_element",
            Self::RegexReplace { .. } => "regex_replace",
        }
    }
}

/// When a transform applies
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConditions {
    /// Matching content types (essence, case-insensitive); empty matches all
    pub content_types: Vec<String>,
    /// Required request path prefix
    pub path_prefix: Option<String>,
}

impl TransformConditions {
    /// Whether the conditions hold
    #[must_use]
    pub fn holds(&self, content_type: Option<&str>, path: &str) -> bool {
        let type_ok = self.content_types.is_empty()
            || content_type.is_some_and(|ct| {
                let essence = ct.split(';').next().unwrap_or_default().trim();
                self.content_types.iter().any(|t| t.eq_ignore_ascii_case(essence))
            });
        let path_ok = self.path_prefix.as_deref().map_or(true, |prefix| path.starts_with(prefix));
        type_ok && path_ok
    }
}

/// Proposed mutation, interpreted only by the Theme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformDescriptor {
    /// Operation
    #[serde(flatten)]
    pub op: TransformOp,
    /// Target element selector; unused by regex replacements
    #[serde(default)]
    pub selector: Option<String>,
    /// Insert position; required by `insert_html`
    #[serde(default)]
    pub position: Option<InsertPosition>,
    /// Applicability
    #[serde(default)]
    pub conditions: TransformConditions,
}

impl TransformDescriptor {
    /// Decode and validate a descriptor handed over by a script
    pub fn from_script(value: &ScriptValue) -> Result<Self, TransformFailure> {
        let descriptor: Self = serde_json::from_value(value.to_json())
            .map_err(|e| TransformFailure::MalformedDescriptor(e.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Structural validation
    pub fn validate(&self) -> Result<(), TransformFailure> {
        match &self.op {
            TransformOp::RegexReplace { pattern, .. } => {
                regex::Regex::new(pattern).map_err(|e| TransformFailure::InvalidPattern(e.to_string()))?;
                return Ok(());
            }
            TransformOp::InsertHtml { .. } if self.position.is_none() => {
                return Err(TransformFailure::MalformedDescriptor("insert_html needs a position".into()));
            }
            TransformOp::SetAttribute { name, .. } if !is_token(name) => {
                return Err(TransformFailure::MalformedDescriptor(format!("invalid attribute name `{name}`")));
            }
            _ => {}
        }
        let selector = self
            .selector
            .as_deref()
            .ok_or_else(|| TransformFailure::MalformedDescriptor(format!("{} needs a selector", self.op.name())))?;
        parse_selector(selector).map(|_| ())
    }

    /// Whether the descriptor applies to this response
    #[must_use]
    pub fn applies_to(&self, content_type: Option<&str>, path: &str) -> bool {
        self.conditions.holds(content_type, path)
    }

    /// Whether the operation is exclusive for its target; inserts stack
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        !matches!(self.op, TransformOp::InsertHtml { .. })
    }

    /// Identity of the target used for overlap detection
    #[must_use]
    pub fn target(&self) -> String {
        match &self.op {
            TransformOp::RegexReplace { pattern, .. } => format!("regex:{pattern}"),
            TransformOp::SetAttribute { name, .. } => {
                format!("{}@{}", self.selector.as_deref().unwrap_or_default(), name)
            }
            TransformOp::InsertHtml { .. } | TransformOp::ReplaceInner { .. } | TransformOp::RemoveElement => {
                self.selector.clone().unwrap_or_default()
            }
        }
    }
}

/// Tagged proposal payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ProposalKind {
    /// Status candidate
    Status(u16),
    /// Header operation
    Header(HeaderProposal),
    /// Markup transform
    Transform(TransformDescriptor),
}

impl ProposalKind {
    /// Stable name of the kind
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Header(_) => "header",
            Self::Transform(_) => "transform",
        }
    }
}

/// Identity of a submitting extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalSource {
    /// Extension id
    pub extension_id: String,
    /// Registration order of the extension
    pub order: usize,
    /// Manifest priority
    pub priority: i32,
}

/// Immutable, phase-tagged proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Submission sequence number within the request
    pub seq: u64,
    /// Submitting extension
    pub source_extension_id: String,
    /// Registration order of the submitter
    pub extension_order: usize,
    /// Manifest priority of the submitter
    pub priority: i32,
    /// Phase it was submitted in
    pub phase_submitted: Phase,
    /// Payload
    #[serde(flatten)]
    pub kind: ProposalKind,
}

/// Append-only proposal collection for one request
#[derive(Debug, Default)]
pub struct ProposalAggregator {
    committed: Vec<Proposal>,
    staged: Vec<Proposal>,
    next_seq: u64,
    frozen: bool,
}

impl ProposalAggregator {
    /// Empty aggregator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a proposal for the running invocation
    ///
    /// # Errors
    /// [`PhaseViolation`] outside Propose or after freezing; nothing is recorded.
    pub fn submit(&mut self, source: &ProposalSource, phase: Phase, kind: ProposalKind) -> Result<u64, PhaseViolation> {
        if phase != Phase::Propose || self.frozen {
            return Err(PhaseViolation {
                action: format!("propose:{}", kind.name()),
                phase,
                kind: ExtensionKind::Plugin,
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.staged.push(Proposal {
            seq,
            source_extension_id: source.extension_id.clone(),
            extension_order: source.order,
            priority: source.priority,
            phase_submitted: phase,
            kind,
        });
        Ok(seq)
    }

    /// Keep everything staged by the completed invocation
    pub fn commit(&mut self) -> usize {
        let count = self.staged.len();
        self.committed.append(&mut self.staged);
        count
    }

    /// Drop everything staged by an aborted invocation
    pub fn rollback(&mut self) -> Vec<Proposal> {
        std::mem::take(&mut self.staged)
    }

    /// Committed proposals in submission order
    #[must_use]
    pub fn proposals(&self) -> &[Proposal] {
        &self.committed
    }

    /// Number of committed proposals
    #[must_use]
    pub fn len(&self) -> usize {
        self.committed.len()
    }

    /// Whether nothing has been committed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    /// Whether the set is frozen
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Stop accepting proposals and produce the ordered view
    pub fn freeze(&mut self) -> AggregatedProposals {
        if !self.staged.is_empty() {
            tracing::warn!(dropped = self.staged.len(), "uncommitted proposals dropped at freeze");
            self.staged.clear();
        }
        self.frozen = true;
        let mut entries = self.committed.clone();
        entries.sort_by_key(|p| (p.seq, p.extension_order));
        AggregatedProposals { entries }
    }
}

/// Frozen, ordered, read-only view for the Theme
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatedProposals {
    entries: Vec<Proposal>,
}

impl AggregatedProposals {
    /// Every proposal in order
    #[must_use]
    pub fn entries(&self) -> &[Proposal] {
        &self.entries
    }

    /// Status candidates in order
    pub fn statuses(&self) -> impl Iterator<Item = (&Proposal, u16)> {
        self.entries.iter().filter_map(|p| match p.kind {
            ProposalKind::Status(code) => Some((p, code)),
            _ => None,
        })
    }

    /// Header operations in order
    pub fn headers(&self) -> impl Iterator<Item = (&Proposal, &HeaderProposal)> {
        self.entries.iter().filter_map(|p| match &p.kind {
            ProposalKind::Header(h) => Some((p, h)),
            _ => None,
        })
    }

    /// Transform descriptors in order
    pub fn transforms(&self) -> impl Iterator<Item = (&Proposal, &TransformDescriptor)> {
        self.entries.iter().filter_map(|p| match &p.kind {
            ProposalKind::Transform(t) => Some((p, t)),
            _ => None,
        })
    }

    /// Number of proposals
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Values for the read-only `plugins.*` signals
    pub fn to_signals(&self) -> Result<Vec<(&'static str, SignalValue)>, serde_json::Error> {
        let list = |kind: &str| -> Result<SignalValue, serde_json::Error> {
            let items = self
                .entries
                .iter()
                .filter(|p| p.kind.name() == kind)
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SignalValue::from_json(&serde_json::Value::Array(items)))
        };
        Ok(vec![
            ("status", list("status")?),
            ("headers", list("header")?),
            ("transforms", list("transform")?),
            ("count", SignalValue::Int(i64::try_from(self.entries.len()).unwrap_or(i64::MAX))),
        ])
    }
}
