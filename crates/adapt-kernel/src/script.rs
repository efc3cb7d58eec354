//! Script seam
//!
//! An extension is backed by a [`ScriptFactory`] producing [`Script`]
//! instances; a script only ever sees the world through the [`Host`] it is
//! invoked with, which meters every step and mediates every host-function
//! call. JavaScript sources run through [`crate::js`]; [`ScriptBuilder`]
//! backs a script with host closures.

use crate::budget::{BudgetExceeded, ExecutionBudget};
use crate::error::PhaseViolation;
use crate::manifest::{Capability, ProposeScope, WriteScope};
use adapt_signal::{Phase, SignalDomain, SignalKey, SignalValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Values crossing the script boundary
///
/// Bodies never cross: a body-typed signal is handed out as a
/// [`ScriptValue::Signal`] reference usable only as a transform target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScriptValue {
    /// Absent
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// String
    Str(String),
    /// List
    List(Vec<ScriptValue>),
    /// Map
    Map(BTreeMap<String, ScriptValue>),
    /// Opaque reference to a signal
    Signal(SignalKey),
    /// Error sentinel, e.g. `transform_failure:unsupported_selector`
    Error(String),
}

impl ScriptValue {
    /// Convert a signal value read under `key`
    #[must_use]
    pub fn from_signal(key: &SignalKey, value: &SignalValue) -> Self {
        match value {
            SignalValue::Null => Self::Null,
            SignalValue::Bool(b) => Self::Bool(*b),
            SignalValue::Int(n) => Self::Int(*n),
            SignalValue::Float(f) => Self::Float(*f),
            SignalValue::Str(s) => Self::Str(s.clone()),
            SignalValue::List(items) => Self::List(items.iter().map(|v| Self::from_signal(key, v)).collect()),
            SignalValue::Map(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_signal(key, v)))
                    .collect(),
            ),
            SignalValue::Body(_) => Self::Signal(key.clone()),
        }
    }

    /// Convert from JSON
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or_default()), Self::Int),
            serde_json::Value::String(s) => Self::Str(s.clone()),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(map) => {
                Self::Map(map.iter().map(|(k, v)| (k.clone(), Self::from_json(v))).collect())
            }
        }
    }

    /// Convert to JSON; signal references become their qualified name
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => (*b).into(),
            Self::Int(n) => (*n).into(),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, Into::into),
            Self::Str(s) | Self::Error(s) => s.clone().into(),
            Self::List(items) => items.iter().map(Self::to_json).collect(),
            Self::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            Self::Signal(key) => key.to_string().into(),
        }
    }

    /// String content, if any
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if any
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Whether this is an error sentinel
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Script entry point, one per executable phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entry {
    /// Read-only introspection
    Observe,
    /// Plugin proposals
    Propose,
    /// Theme rendering
    Apply,
}

impl Entry {
    /// Phase this entry runs in
    #[must_use]
    pub const fn phase(self) -> Phase {
        match self {
            Self::Observe => Phase::Observe,
            Self::Propose => Phase::Propose,
            Self::Apply => Phase::Apply,
        }
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observe => "observe",
            Self::Propose => "propose",
            Self::Apply => "apply",
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of host functions a manifest may register
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HostFn {
    /// `signal.get(key)`
    SignalGet,
    /// `signal.has(key, member)`
    SignalHas,
    /// `transform(key, request)`
    Transform,
    /// `propose.status(code)`
    ProposeStatus,
    /// `propose.header(name, value, op?)`
    ProposeHeader,
    /// `propose.transform(descriptor)`
    ProposeTransform,
    /// `proposals.resolve()`
    ProposalsResolve,
    /// `proposals.apply()`
    ProposalsApply,
    /// `response.status(code)`
    ResponseStatus,
    /// `response.header(name, value, op?)`
    ResponseHeader,
    /// `response.body(text)`
    ResponseBody,
    /// `render.template(template, model)`
    RenderTemplate,
    /// `content.query(pointer)`
    ContentQuery,
    /// `policy.authorize(action, resource)`
    PolicyAuthorize,
    /// `secret.get(key)`
    SecretGet,
    /// `log(message)`
    Log,
}

impl HostFn {
    /// Every host function
    pub const ALL: [HostFn; 16] = [
        HostFn::SignalGet,
        HostFn::SignalHas,
        HostFn::Transform,
        HostFn::ProposeStatus,
        HostFn::ProposeHeader,
        HostFn::ProposeTransform,
        HostFn::ProposalsResolve,
        HostFn::ProposalsApply,
        HostFn::ResponseStatus,
        HostFn::ResponseHeader,
        HostFn::ResponseBody,
        HostFn::RenderTemplate,
        HostFn::ContentQuery,
        HostFn::PolicyAuthorize,
        HostFn::SecretGet,
        HostFn::Log,
    ];

    /// Namespace name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SignalGet => "signal.get",
            Self::SignalHas => "signal.has",
            Self::Transform => "transform",
            Self::ProposeStatus => "propose.status",
            Self::ProposeHeader => "propose.header",
            Self::ProposeTransform => "propose.transform",
            Self::ProposalsResolve => "proposals.resolve",
            Self::ProposalsApply => "proposals.apply",
            Self::ResponseStatus => "response.status",
            Self::ResponseHeader => "response.header",
            Self::ResponseBody => "response.body",
            Self::RenderTemplate => "render.template",
            Self::ContentQuery => "content.query",
            Self::PolicyAuthorize => "policy.authorize",
            Self::SecretGet => "secret.get",
            Self::Log => "log",
        }
    }

    /// Look up by namespace name
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }

    /// Capabilities that must be declared to register this function
    ///
    /// Signal reads are checked per domain at call time instead.
    #[must_use]
    pub const fn requires(self) -> &'static [Capability] {
        match self {
            Self::SignalGet | Self::SignalHas | Self::Log => &[],
            Self::Transform => &[Capability::Transform],
            Self::ProposeStatus => &[Capability::Propose(ProposeScope::Status)],
            Self::ProposeHeader => &[Capability::Propose(ProposeScope::Header)],
            Self::ProposeTransform => &[Capability::Propose(ProposeScope::Transform)],
            Self::ProposalsResolve => &[Capability::Read(SignalDomain::Plugins)],
            Self::ProposalsApply => &[
                Capability::Read(SignalDomain::Plugins),
                Capability::Write(WriteScope::Status),
                Capability::Write(WriteScope::Header),
                Capability::Write(WriteScope::Body),
            ],
            Self::ResponseStatus => &[Capability::Write(WriteScope::Status)],
            Self::ResponseHeader => &[Capability::Write(WriteScope::Header)],
            Self::ResponseBody | Self::RenderTemplate => &[Capability::Write(WriteScope::Body)],
            Self::ContentQuery => &[Capability::Read(SignalDomain::Content)],
            Self::PolicyAuthorize => &[Capability::Authorize],
            Self::SecretGet => &[Capability::Secrets],
        }
    }
}

impl fmt::Display for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single host interaction
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HostCallError {
    /// Function not registered in this instance's namespace
    #[error("host function `{0}` is not registered")]
    Unregistered(HostFn),

    /// Registered, but the target is outside the declared capabilities
    #[error("capability denied: {0}")]
    CapabilityDenied(String),

    /// Called outside its phase
    #[error(transparent)]
    Phase(#[from] PhaseViolation),

    /// Budget ceiling breached
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),

    /// Request cancelled
    #[error("request cancelled")]
    Cancelled,

    /// Arguments of the wrong shape
    #[error("bad arguments to `{function}`: {reason}")]
    BadArguments {
        /// Function called
        function: HostFn,
        /// What was wrong
        reason: String,
    },

    /// Collaborator failure
    #[error("{0}")]
    Failed(String),
}

/// Error leaving a script invocation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    /// Propagated host failure
    #[error(transparent)]
    Host(#[from] HostCallError),

    /// Raised by the script itself
    #[error("{0}")]
    Thrown(String),
}

/// What a script sees of the engine
pub trait Host {
    /// Calling extension
    fn extension_id(&self) -> &str;

    /// Per-extension configuration from the manifest
    fn config(&self) -> &serde_json::Value;

    /// Ceilings governing this invocation
    fn budget(&self) -> ExecutionBudget {
        ExecutionBudget::default()
    }

    /// Charge `ops` interpreter steps
    fn step(&mut self, ops: u64) -> Result<(), HostCallError>;

    /// Enter a nested call frame
    fn enter(&mut self) -> Result<(), HostCallError>;

    /// Leave a nested call frame
    fn leave(&mut self);

    /// Account for a value the script retains
    fn hold(&mut self, value: &ScriptValue) -> Result<(), HostCallError>;

    /// Invoke a registered host function
    fn call(&mut self, function: HostFn, args: &[ScriptValue]) -> Result<ScriptValue, HostCallError>;
}

/// Typed conveniences over [`Host::call`]
pub trait HostExt: Host {
    /// `signal.get`
    fn get(&mut self, key: &str) -> Result<ScriptValue, HostCallError> {
        self.call(HostFn::SignalGet, &[key.into()])
    }

    /// `signal.has`
    fn has(&mut self, key: &str, member: &str) -> Result<bool, HostCallError> {
        Ok(matches!(
            self.call(HostFn::SignalHas, &[key.into(), member.into()])?,
            ScriptValue::Bool(true)
        ))
    }

    /// `transform`
    fn transform(&mut self, key: &str, request: serde_json::Value) -> Result<ScriptValue, HostCallError> {
        self.call(HostFn::Transform, &[key.into(), ScriptValue::from_json(&request)])
    }

    /// `propose.status`
    fn propose_status(&mut self, code: u16) -> Result<ScriptValue, HostCallError> {
        self.call(HostFn::ProposeStatus, &[ScriptValue::Int(i64::from(code))])
    }

    /// `propose.header` with a set operation
    fn propose_header(&mut self, name: &str, value: &str) -> Result<ScriptValue, HostCallError> {
        self.call(HostFn::ProposeHeader, &[name.into(), value.into()])
    }

    /// `propose.transform`
    fn propose_transform(&mut self, descriptor: serde_json::Value) -> Result<ScriptValue, HostCallError> {
        self.call(HostFn::ProposeTransform, &[ScriptValue::from_json(&descriptor)])
    }

    /// `response.status`
    fn set_status(&mut self, code: u16) -> Result<ScriptValue, HostCallError> {
        self.call(HostFn::ResponseStatus, &[ScriptValue::Int(i64::from(code))])
    }

    /// `response.header` with a set operation
    fn set_header(&mut self, name: &str, value: &str) -> Result<ScriptValue, HostCallError> {
        self.call(HostFn::ResponseHeader, &[name.into(), value.into()])
    }

    /// `response.body`
    fn write_body(&mut self, text: &str) -> Result<ScriptValue, HostCallError> {
        self.call(HostFn::ResponseBody, &[text.into()])
    }

    /// `log`
    fn log(&mut self, message: &str) -> Result<ScriptValue, HostCallError> {
        self.call(HostFn::Log, &[message.into()])
    }
}

impl<H: Host + ?Sized> HostExt for H {}

/// A live script instance
pub trait Script: Send + Sync {
    /// Run one entry point
    fn invoke(&mut self, entry: Entry, host: &mut dyn Host) -> Result<ScriptValue, ScriptError>;

    /// Drop all script-global state
    fn reset(&mut self);
}

/// Produces fresh script instances for one extension
pub trait ScriptFactory: Send + Sync {
    /// New instance with empty globals
    fn instantiate(&self) -> Box<dyn Script>;
}

impl<F> ScriptFactory for F
where
    F: Fn() -> Box<dyn Script> + Send + Sync,
{
    fn instantiate(&self) -> Box<dyn Script> {
        self()
    }
}

/// Script-global state of a closure-backed script
pub type Globals = BTreeMap<String, ScriptValue>;

/// Closure implementing one entry point
pub type EntryFn = Arc<dyn Fn(&mut Globals, &mut dyn Host) -> Result<ScriptValue, ScriptError> + Send + Sync>;

/// Factory for closure-backed scripts
///
/// Each entry point is a host closure; script globals live in a map that is
/// cleared by [`Script::reset`].
#[derive(Clone, Default)]
pub struct ScriptBuilder {
    entries: BTreeMap<Entry, EntryFn>,
}

impl fmt::Debug for ScriptBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptBuilder")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ScriptBuilder {
    /// Script with no entry points
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an entry point
    #[must_use]
    pub fn on<F>(mut self, entry: Entry, run: F) -> Self
    where
        F: Fn(&mut Globals, &mut dyn Host) -> Result<ScriptValue, ScriptError> + Send + Sync + 'static,
    {
        self.entries.insert(entry, Arc::new(run));
        self
    }

    /// Entry points present
    pub fn entries(&self) -> impl Iterator<Item = Entry> + '_ {
        self.entries.keys().copied()
    }
}

impl ScriptFactory for ScriptBuilder {
    fn instantiate(&self) -> Box<dyn Script> {
        Box::new(FnScript {
            entries: self.entries.clone(),
            globals: Globals::new(),
        })
    }
}

struct FnScript {
    entries: BTreeMap<Entry, EntryFn>,
    globals: Globals,
}

impl Script for FnScript {
    fn invoke(&mut self, entry: Entry, host: &mut dyn Host) -> Result<ScriptValue, ScriptError> {
        match self.entries.get(&entry) {
            Some(run) => {
                let run = Arc::clone(run);
                run(&mut self.globals, host)
            }
            None => Ok(ScriptValue::Null),
        }
    }

    fn reset(&mut self) {
        self.globals.clear();
    }
}
