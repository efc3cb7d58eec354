//! External collaborators
//!
//! Policy and secret stores are consulted synchronously when an extension
//! calls a privileged host function; the engine only relies on the
//! allow/deny-with-reason and value-or-absent contracts defined here.

use crate::render::RenderEngines;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Policy verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "lowercase")]
pub enum Decision {
    /// Permitted
    Allow,
    /// Refused, with a reason
    Deny(String),
}

impl Decision {
    /// Whether the decision allows
    #[inline]
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Authorization collaborator
pub trait Authorizer: Send + Sync {
    /// Decide whether `identity` may perform `action` on `resource`
    fn authorize(&self, identity: Option<&str>, action: &str, resource: &str) -> Decision;
}

/// Secret collaborator
pub trait SecretStore: Send + Sync {
    /// Secret value, if present
    fn get_secret(&self, key: &str) -> Option<String>;
}

/// Denies everything
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn authorize(&self, _identity: Option<&str>, action: &str, resource: &str) -> Decision {
        Decision::Deny(format!("no policy grants {action} on {resource}"))
    }
}

/// Fixed table of `(action, resource)` grants; identity is ignored
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    grants: BTreeSet<(String, String)>,
}

impl PolicyTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `action` on `resource`
    #[must_use]
    pub fn allow(mut self, action: impl Into<String>, resource: impl Into<String>) -> Self {
        self.grants.insert((action.into(), resource.into()));
        self
    }
}

impl Authorizer for PolicyTable {
    fn authorize(&self, identity: Option<&str>, action: &str, resource: &str) -> Decision {
        if self.grants.contains(&(action.to_string(), resource.to_string())) {
            Decision::Allow
        } else {
            Decision::Deny(format!(
                "{} may not {action} {resource}",
                identity.unwrap_or("anonymous")
            ))
        }
    }
}

/// In-memory secrets
#[derive(Clone, Default)]
pub struct StaticSecrets {
    values: BTreeMap<String, String>,
}

impl fmt::Debug for StaticSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticSecrets")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StaticSecrets {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl SecretStore for StaticSecrets {
    fn get_secret(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Everything outside the engine that extensions may reach
#[derive(Clone)]
pub struct Collaborators {
    /// Policy decisions
    pub authorizer: Arc<dyn Authorizer>,
    /// Secret lookups
    pub secrets: Arc<dyn SecretStore>,
    /// Render engines used during Apply
    pub render: RenderEngines,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            authorizer: Arc::new(DenyAll),
            secrets: Arc::new(StaticSecrets::new()),
            render: RenderEngines::default(),
        }
    }
}
