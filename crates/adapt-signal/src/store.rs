//! Signal Store
//!
//! Holds the typed reactive state of one request. Reads are cheap (cloned
//! scalars or body handles) and, while an effect is being tracked, record a
//! dependency edge. Writes are host-only and bump the signal's version.

use crate::error::SignalError;
use crate::value::{SignalType, SignalValue};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;

/// Closed set of signal domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDomain {
    /// Incoming request
    Request,
    /// Content resolved for the request
    Content,
    /// Response under construction
    Response,
    /// Aggregated plugin proposals (Apply only)
    Plugins,
}

impl SignalDomain {
    /// All domains
    pub const ALL: [SignalDomain; 4] = [
        SignalDomain::Request,
        SignalDomain::Content,
        SignalDomain::Response,
        SignalDomain::Plugins,
    ];

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SignalDomain::Request => "request",
            SignalDomain::Content => "content",
            SignalDomain::Response => "response",
            SignalDomain::Plugins => "plugins",
        }
    }

    /// Parse a domain name
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == name)
    }
}

impl fmt::Display for SignalDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-qualified signal name, e.g. `request.path`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignalKey {
    /// Owning domain
    pub domain: SignalDomain,
    /// Name within the domain
    pub name: String,
}

impl SignalKey {
    /// Create a key
    pub fn new(domain: SignalDomain, name: impl Into<String>) -> Self {
        Self {
            domain,
            name: name.into(),
        }
    }

    /// Parse `domain.name`
    #[must_use]
    pub fn parse(qualified: &str) -> Option<Self> {
        let (domain, name) = qualified.split_once('.')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(SignalDomain::parse(domain)?, name))
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.name)
    }
}

/// Dense index of a signal within its store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignalId(pub u32);

impl SignalId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Typed read handle; carries no ownership
pub struct Signal<T> {
    id: SignalId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Signal<T> {
    /// Wrap an id with a type
    #[must_use]
    pub const fn new(id: SignalId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Untyped id
    #[must_use]
    pub const fn id(&self) -> SignalId {
        self.id
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Signal<T> {}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal({})", self.id.0)
    }
}

#[derive(Debug)]
struct Cell {
    value: SignalValue,
    version: u64,
}

/// Per-request signal storage
#[derive(Debug, Default)]
pub struct SignalStore {
    cells: IndexMap<SignalKey, Cell>,
    /// Dependencies read by the effect currently being tracked
    tracking: Mutex<Option<BTreeSet<SignalId>>>,
    /// Signals changed since the last drain
    pending: Vec<SignalId>,
    disposed: bool,
}

impl SignalStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_live(&self) -> Result<(), SignalError> {
        if self.disposed {
            Err(SignalError::Disposed)
        } else {
            Ok(())
        }
    }

    fn cell(&self, id: SignalId) -> Result<(&SignalKey, &Cell), SignalError> {
        self.ensure_live()?;
        self.cells
            .get_index(id.index())
            .ok_or_else(|| SignalError::Unknown(format!("#{}", id.0)))
    }

    fn track(&self, id: SignalId) {
        if let Some(deps) = self.tracking.lock().as_mut() {
            deps.insert(id);
        }
    }

    /// Define a new signal with its initial value (version 1)
    pub fn define(&mut self, key: SignalKey, value: SignalValue) -> Result<SignalId, SignalError> {
        self.ensure_live()?;
        if self.cells.contains_key(&key) {
            return Err(SignalError::AlreadyDefined(key));
        }
        let id = SignalId(u32::try_from(self.cells.len()).map_err(|_| SignalError::Unknown(key.to_string()))?);
        self.cells.insert(key, Cell { value, version: 1 });
        Ok(id)
    }

    /// Typed variant of [`SignalStore::define`]
    pub fn define_typed<T: SignalType>(
        &mut self,
        key: SignalKey,
        value: SignalValue,
    ) -> Result<Signal<T>, SignalError> {
        let id = self.define(key.clone(), value)?;
        let (_, cell) = self.cell(id)?;
        if T::from_value(&cell.value).is_none() {
            return Err(SignalError::TypeMismatch {
                key,
                expected: T::NAME,
            });
        }
        Ok(Signal::new(id))
    }

    /// Resolve a key to its id
    #[must_use]
    pub fn lookup(&self, key: &SignalKey) -> Option<SignalId> {
        if self.disposed {
            return None;
        }
        self.cells
            .get_index_of(key)
            .and_then(|i| u32::try_from(i).ok())
            .map(SignalId)
    }

    /// Key of a signal
    pub fn key(&self, id: SignalId) -> Result<&SignalKey, SignalError> {
        self.cell(id).map(|(k, _)| k)
    }

    /// Read a value, registering a dependency for the tracked effect
    pub fn get(&self, id: SignalId) -> Result<SignalValue, SignalError> {
        let (_, cell) = self.cell(id)?;
        self.track(id);
        Ok(cell.value.clone())
    }

    /// Typed read
    pub fn get_typed<T: SignalType>(&self, signal: Signal<T>) -> Result<T, SignalError> {
        let (key, cell) = self.cell(signal.id())?;
        self.track(signal.id());
        T::from_value(&cell.value).ok_or_else(|| SignalError::TypeMismatch {
            key: key.clone(),
            expected: T::NAME,
        })
    }

    /// Key membership for map-typed signals; tracked like a read
    pub fn has(&self, id: SignalId, key: &str) -> Result<bool, SignalError> {
        let (signal_key, cell) = self.cell(id)?;
        self.track(id);
        match &cell.value {
            SignalValue::Map(map) => Ok(map.contains_key(key)),
            _ => Err(SignalError::TypeMismatch {
                key: signal_key.clone(),
                expected: "map",
            }),
        }
    }

    /// Current version of a signal; not tracked
    pub fn version(&self, id: SignalId) -> Result<u64, SignalError> {
        self.cell(id).map(|(_, c)| c.version)
    }

    /// Host-only write
    ///
    /// Returns the resulting version. Writing an equal value leaves the
    /// version untouched and wakes nobody.
    pub fn set(&mut self, id: SignalId, value: SignalValue) -> Result<u64, SignalError> {
        self.ensure_live()?;
        let (_, cell) = self
            .cells
            .get_index_mut(id.index())
            .ok_or_else(|| SignalError::Unknown(format!("#{}", id.0)))?;
        if cell.value == value {
            return Ok(cell.version);
        }
        cell.value = value;
        cell.version += 1;
        if !self.pending.contains(&id) {
            self.pending.push(id);
        }
        Ok(cell.version)
    }

    /// Take the list of signals changed since the last call
    pub fn drain_changes(&mut self) -> Vec<SignalId> {
        std::mem::take(&mut self.pending)
    }

    /// Start recording reads for one effect run
    pub fn begin_tracking(&self) {
        *self.tracking.lock() = Some(BTreeSet::new());
    }

    /// Stop recording and return the reads
    pub fn end_tracking(&self) -> BTreeSet<SignalId> {
        self.tracking.lock().take().unwrap_or_default()
    }

    /// Number of defined signals
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no signal is defined
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Keys in definition order
    pub fn keys(&self) -> impl Iterator<Item = &SignalKey> {
        self.cells.keys()
    }

    /// Drop every cell; later access fails with [`SignalError::Disposed`]
    pub fn dispose(&mut self) {
        self.cells.clear();
        self.pending.clear();
        self.tracking.lock().take();
        self.disposed = true;
    }

    /// Whether the store has been disposed
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}
