//! Signal values
//!
//! The value space is closed: scalars, lists, string-keyed maps and streamed
//! bodies. Bodies are handles over a re-openable chunk source and are never
//! materialised by the store.

use bytes::Bytes;
use serde::{Serialize, Serializer};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Iterator over body chunks
pub type ChunkIter<'a> = Box<dyn Iterator<Item = io::Result<Bytes>> + Send + 'a>;

/// A re-openable source of body bytes
///
/// Every call to [`BodySource::open`] starts a fresh pass over the body.
pub trait BodySource: Send + Sync + fmt::Debug {
    /// Start reading the body from the beginning
    fn open(&self) -> ChunkIter<'_>;

    /// Total length, when known up front
    fn len_hint(&self) -> Option<u64> {
        None
    }
}

/// Body held as pre-split chunks
#[derive(Debug, Clone, Default)]
struct ChunkedBody {
    chunks: Vec<Bytes>,
}

impl BodySource for ChunkedBody {
    fn open(&self) -> ChunkIter<'_> {
        Box::new(self.chunks.iter().cloned().map(Ok))
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.chunks.iter().map(|c| c.len() as u64).sum())
    }
}

/// Body produced on demand by a generator
struct GeneratedBody<F> {
    generate: F,
}

impl<F> fmt::Debug for GeneratedBody<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedBody").finish_non_exhaustive()
    }
}

impl<F> BodySource for GeneratedBody<F>
where
    F: Fn() -> ChunkIter<'static> + Send + Sync,
{
    fn open(&self) -> ChunkIter<'_> {
        (self.generate)()
    }
}

/// Lightweight handle to a (possibly large) streamed body
#[derive(Clone)]
pub struct BodyHandle(Arc<dyn BodySource>);

impl BodyHandle {
    /// Wrap an arbitrary source
    pub fn new(source: impl BodySource + 'static) -> Self {
        Self(Arc::new(source))
    }

    /// Body from a list of chunks
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self::new(ChunkedBody {
            chunks: chunks.into_iter().map(Into::into).collect(),
        })
    }

    /// Body held in a single chunk
    pub fn from_static(text: &'static str) -> Self {
        Self::from_chunks([Bytes::from_static(text.as_bytes())])
    }

    /// Empty body
    #[must_use]
    pub fn empty() -> Self {
        Self::new(ChunkedBody::default())
    }

    /// Body generated lazily; each open calls `generate` again
    pub fn generated<F>(generate: F) -> Self
    where
        F: Fn() -> ChunkIter<'static> + Send + Sync + 'static,
    {
        Self::new(GeneratedBody { generate })
    }

    /// Start a fresh pass over the body
    pub fn chunks(&self) -> ChunkIter<'_> {
        self.0.open()
    }

    /// Known length, if any
    #[must_use]
    pub fn len_hint(&self) -> Option<u64> {
        self.0.len_hint()
    }

    /// Whether two handles refer to the same source
    #[must_use]
    pub fn same_source(&self, other: &BodyHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for BodyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BodyHandle({:?})", self.0)
    }
}

impl PartialEq for BodyHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_source(other)
    }
}

impl Serialize for BodyHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.len_hint() {
            Some(len) => serializer.serialize_str(&format!("<body {len} bytes>")),
            None => serializer.serialize_str("<body stream>"),
        }
    }
}

/// Value held by a signal
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalValue {
    /// Absent
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// UTF-8 text
    Str(String),
    /// Ordered list
    List(Vec<SignalValue>),
    /// String-keyed map
    Map(BTreeMap<String, SignalValue>),
    /// Streamed body handle
    Body(BodyHandle),
}

impl SignalValue {
    /// Type name used in diagnostics
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            SignalValue::Null => "null",
            SignalValue::Bool(_) => "bool",
            SignalValue::Int(_) => "int",
            SignalValue::Float(_) => "float",
            SignalValue::Str(_) => "string",
            SignalValue::List(_) => "list",
            SignalValue::Map(_) => "map",
            SignalValue::Body(_) => "body",
        }
    }

    /// Map lookup; `None` for non-map values
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SignalValue> {
        match self {
            SignalValue::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Text view of a string value
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SignalValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON document (content metadata, manifest config)
    #[must_use]
    pub fn from_json(value: &Json) -> Self {
        match value {
            Json::Null => SignalValue::Null,
            Json::Bool(b) => SignalValue::Bool(*b),
            Json::Number(n) => n
                .as_i64()
                .map(SignalValue::Int)
                .unwrap_or_else(|| SignalValue::Float(n.as_f64().unwrap_or(0.0))),
            Json::String(s) => SignalValue::Str(s.clone()),
            Json::Array(items) => SignalValue::List(items.iter().map(Self::from_json).collect()),
            Json::Object(map) => SignalValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON view; bodies become a placeholder string
    #[must_use]
    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}

impl From<&str> for SignalValue {
    fn from(value: &str) -> Self {
        SignalValue::Str(value.to_string())
    }
}

impl From<String> for SignalValue {
    fn from(value: String) -> Self {
        SignalValue::Str(value)
    }
}

impl From<i64> for SignalValue {
    fn from(value: i64) -> Self {
        SignalValue::Int(value)
    }
}

impl From<bool> for SignalValue {
    fn from(value: bool) -> Self {
        SignalValue::Bool(value)
    }
}

impl From<BodyHandle> for SignalValue {
    fn from(value: BodyHandle) -> Self {
        SignalValue::Body(value)
    }
}

impl From<BTreeMap<String, SignalValue>> for SignalValue {
    fn from(value: BTreeMap<String, SignalValue>) -> Self {
        SignalValue::Map(value)
    }
}

impl From<Vec<SignalValue>> for SignalValue {
    fn from(value: Vec<SignalValue>) -> Self {
        SignalValue::List(value)
    }
}

/// Rust types that can be read out of a signal
pub trait SignalType: Sized {
    /// Name used in type mismatch errors
    const NAME: &'static str;

    /// Borrowing conversion; `None` on mismatch
    fn from_value(value: &SignalValue) -> Option<Self>;
}

impl SignalType for SignalValue {
    const NAME: &'static str = "value";

    fn from_value(value: &SignalValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl SignalType for bool {
    const NAME: &'static str = "bool";

    fn from_value(value: &SignalValue) -> Option<Self> {
        match value {
            SignalValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl SignalType for i64 {
    const NAME: &'static str = "int";

    fn from_value(value: &SignalValue) -> Option<Self> {
        match value {
            SignalValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl SignalType for f64 {
    const NAME: &'static str = "float";

    fn from_value(value: &SignalValue) -> Option<Self> {
        match value {
            SignalValue::Float(f) => Some(*f),
            #[allow(clippy::cast_precision_loss)]
            SignalValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl SignalType for String {
    const NAME: &'static str = "string";

    fn from_value(value: &SignalValue) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl SignalType for BodyHandle {
    const NAME: &'static str = "body";

    fn from_value(value: &SignalValue) -> Option<Self> {
        match value {
            SignalValue::Body(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl SignalType for Vec<SignalValue> {
    const NAME: &'static str = "list";

    fn from_value(value: &SignalValue) -> Option<Self> {
        match value {
            SignalValue::List(items) => Some(items.clone()),
            _ => None,
        }
    }
}

impl SignalType for BTreeMap<String, SignalValue> {
    const NAME: &'static str = "map";

    fn from_value(value: &SignalValue) -> Option<Self> {
        match value {
            SignalValue::Map(map) => Some(map.clone()),
            _ => None,
        }
    }
}
