//! Extension manifests
//!
//! A manifest is consumed as TOML, validated once at load time and turned
//! into a [`CapabilityManifest`]: the checked capability set plus the exact
//! host-function namespace registered into every instance of the extension.
//!
//! ```toml
//! id = "reading-time"
//! kind = "plugin"
//! version = "1.2.0"
//! engine = ">=0.1"
//! priority = 10
//! capabilities = ["read:content", "propose:header", "transform:compute"]
//! host_functions = ["signal.get", "transform", "propose.header"]
//!
//! [config]
//! words_per_minute = 220
//! ```

use crate::error::ManifestError;
use crate::script::HostFn;
use adapt_signal::SignalDomain;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Plugin or Theme
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionKind {
    /// Observes and proposes
    Plugin,
    /// Resolves proposals and renders
    Theme,
}

impl ExtensionKind {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plugin => "plugin",
            Self::Theme => "theme",
        }
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target of a `propose:` grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposeScope {
    /// Status candidates
    Status,
    /// Header operations
    Header,
    /// Transform descriptors
    Transform,
}

/// Target of a `write:` grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteScope {
    /// Response status
    Status,
    /// Response headers
    Header,
    /// Response body
    Body,
}

/// One declared permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// `read:<domain>`
    Read(SignalDomain),
    /// `propose:<scope>`
    Propose(ProposeScope),
    /// `write:<scope>`
    Write(WriteScope),
    /// `policy:authorize`
    Authorize,
    /// `secret:read`
    Secrets,
    /// `transform:compute`
    Transform,
}

impl Capability {
    /// Parse one capability string; wildcards expand to every scope
    #[must_use]
    pub fn parse(text: &str) -> Option<Vec<Capability>> {
        let (family, scope) = text.split_once(':')?;
        let caps = match (family, scope) {
            ("read", domain) => vec![Self::Read(SignalDomain::parse(domain)?)],
            ("propose", "*") => vec![
                Self::Propose(ProposeScope::Status),
                Self::Propose(ProposeScope::Header),
                Self::Propose(ProposeScope::Transform),
            ],
            ("propose", "status") => vec![Self::Propose(ProposeScope::Status)],
            ("propose", "header") => vec![Self::Propose(ProposeScope::Header)],
            ("propose", "transform") => vec![Self::Propose(ProposeScope::Transform)],
            ("write", "*") => vec![
                Self::Write(WriteScope::Status),
                Self::Write(WriteScope::Header),
                Self::Write(WriteScope::Body),
            ],
            ("write", "status") => vec![Self::Write(WriteScope::Status)],
            ("write", "header") => vec![Self::Write(WriteScope::Header)],
            ("write", "body") => vec![Self::Write(WriteScope::Body)],
            ("policy", "authorize") => vec![Self::Authorize],
            ("secret", "read") => vec![Self::Secrets],
            ("transform", "compute") => vec![Self::Transform],
            _ => return None,
        };
        Some(caps)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(domain) => write!(f, "read:{domain}"),
            Self::Propose(ProposeScope::Status) => f.write_str("propose:status"),
            Self::Propose(ProposeScope::Header) => f.write_str("propose:header"),
            Self::Propose(ProposeScope::Transform) => f.write_str("propose:transform"),
            Self::Write(WriteScope::Status) => f.write_str("write:status"),
            Self::Write(WriteScope::Header) => f.write_str("write:header"),
            Self::Write(WriteScope::Body) => f.write_str("write:body"),
            Self::Authorize => f.write_str("policy:authorize"),
            Self::Secrets => f.write_str("secret:read"),
            Self::Transform => f.write_str("transform:compute"),
        }
    }
}

/// Checked set of capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Whether `cap` was declared
    #[inline]
    #[must_use]
    pub fn grants(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    /// Whether the extension may read `domain`
    #[inline]
    #[must_use]
    pub fn reads(&self, domain: SignalDomain) -> bool {
        self.grants(Capability::Read(domain))
    }

    /// Iterate declared capabilities
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn default_engine() -> String {
    "*".to_string()
}

/// Manifest as written by the extension author
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionManifest {
    /// Unique extension id
    pub id: String,
    /// Plugin or Theme
    pub kind: ExtensionKind,
    /// Extension version (semver)
    pub version: String,
    /// Engine version requirement (semver)
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Conflict-resolution priority; higher wins
    #[serde(default)]
    pub priority: i32,
    /// Declared capabilities
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Host functions to register
    #[serde(default)]
    pub host_functions: Vec<String>,
    /// Free-form configuration handed to the script
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ExtensionManifest {
    /// Parse TOML manifest text
    pub fn from_toml_str(text: &str) -> Result<Self, ManifestError> {
        Ok(toml::from_str(text)?)
    }

    fn violation(&self, detail: impl Into<String>) -> ManifestError {
        ManifestError::CapabilityViolation {
            extension: self.id.clone(),
            detail: detail.into(),
        }
    }

    /// Validate against the running engine and produce the checked form
    pub fn validate(&self, engine_version: &Version) -> Result<CapabilityManifest, ManifestError> {
        if self.id.is_empty()
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ManifestError::InvalidField {
                field: "id",
                reason: format!("`{}` must be non-empty ascii alphanumerics, '-', '_' or '.'", self.id),
            });
        }
        let version = Version::parse(&self.version).map_err(|e| ManifestError::InvalidField {
            field: "version",
            reason: e.to_string(),
        })?;
        let requirement = VersionReq::parse(&self.engine).map_err(|e| ManifestError::InvalidField {
            field: "engine",
            reason: e.to_string(),
        })?;
        if !requirement.matches(engine_version) {
            return Err(ManifestError::IncompatibleEngine {
                extension: self.id.clone(),
                required: self.engine.clone(),
                actual: engine_version.to_string(),
            });
        }

        let mut caps = BTreeSet::new();
        for text in &self.capabilities {
            let parsed = Capability::parse(text).ok_or_else(|| self.violation(format!("unknown capability `{text}`")))?;
            caps.extend(parsed);
        }
        for cap in &caps {
            match (self.kind, cap) {
                (ExtensionKind::Plugin, Capability::Write(_)) => {
                    return Err(self.violation(format!("plugins may not declare `{cap}`")));
                }
                (ExtensionKind::Theme, Capability::Propose(_)) => {
                    return Err(self.violation(format!("themes may not declare `{cap}`")));
                }
                _ => {}
            }
        }
        let capabilities = CapabilitySet(caps);

        let mut namespace = BTreeSet::new();
        for name in &self.host_functions {
            let function = HostFn::parse(name).ok_or_else(|| self.violation(format!("unknown host function `{name}`")))?;
            if let Some(missing) = function.requires().iter().find(|cap| !capabilities.grants(**cap)) {
                return Err(self.violation(format!("host function `{name}` requires undeclared `{missing}`")));
            }
            namespace.insert(function);
        }

        tracing::debug!(
            extension = %self.id,
            kind = %self.kind,
            capabilities = capabilities.0.len(),
            functions = namespace.len(),
            "manifest validated"
        );
        Ok(CapabilityManifest {
            id: self.id.clone(),
            kind: self.kind,
            version,
            priority: self.priority,
            capabilities,
            namespace,
            config: self.config.clone(),
        })
    }
}

/// Validated manifest; the only form the sandbox accepts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityManifest {
    /// Unique extension id
    pub id: String,
    /// Plugin or Theme
    pub kind: ExtensionKind,
    /// Parsed extension version
    pub version: Version,
    /// Conflict-resolution priority
    pub priority: i32,
    /// Checked capabilities
    pub capabilities: CapabilitySet,
    /// Host functions registered into the script namespace
    pub namespace: BTreeSet<HostFn>,
    /// Script configuration
    pub config: serde_json::Value,
}

impl CapabilityManifest {
    /// Whether `function` is registered for this extension
    #[inline]
    #[must_use]
    pub fn registers(&self, function: HostFn) -> bool {
        self.namespace.contains(&function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Version {
        Version::new(0, 1, 0)
    }

    const PLUGIN: &str = r#"
id = "seo"
kind = "plugin"
version = "1.0.0"
engine = ">=0.1"
priority = 5
capabilities = ["read:request", "propose:*"]
host_functions = ["signal.get", "propose.header", "propose.status"]

[config]
suffix = " | Blog"
"#;

    #[test]
    fn plugin_manifest_validates() {
        let manifest = ExtensionManifest::from_toml_str(PLUGIN).unwrap();
        let checked = manifest.validate(&engine()).unwrap();
        assert_eq!(checked.kind, ExtensionKind::Plugin);
        assert_eq!(checked.priority, 5);
        assert!(checked.capabilities.grants(Capability::Propose(ProposeScope::Transform)));
        assert!(checked.registers(HostFn::ProposeHeader));
        assert!(!checked.registers(HostFn::ProposeTransform));
        assert_eq!(checked.config["suffix"], " | Blog");
    }

    #[test]
    fn unknown_capability_is_a_violation() {
        let mut manifest = ExtensionManifest::from_toml_str(PLUGIN).unwrap();
        manifest.capabilities.push("read:filesystem".into());
        assert!(manifest.validate(&engine()).unwrap_err().is_capability_violation());
    }

    #[test]
    fn host_function_needs_its_capability() {
        let mut manifest = ExtensionManifest::from_toml_str(PLUGIN).unwrap();
        manifest.host_functions.push("secret.get".into());
        let err = manifest.validate(&engine()).unwrap_err();
        assert!(err.to_string().contains("secret:read"));
    }

    #[test]
    fn plugins_cannot_write_and_themes_cannot_propose() {
        let mut plugin = ExtensionManifest::from_toml_str(PLUGIN).unwrap();
        plugin.capabilities.push("write:body".into());
        assert!(plugin.validate(&engine()).unwrap_err().is_capability_violation());

        let mut theme = ExtensionManifest::from_toml_str(PLUGIN).unwrap();
        theme.kind = ExtensionKind::Theme;
        assert!(theme.validate(&engine()).unwrap_err().is_capability_violation());
    }

    #[test]
    fn engine_requirement_is_enforced() {
        let mut manifest = ExtensionManifest::from_toml_str(PLUGIN).unwrap();
        manifest.engine = ">=2.0".into();
        assert!(matches!(
            manifest.validate(&engine()),
            Err(ManifestError::IncompatibleEngine { .. })
        ));
    }

    #[test]
    fn malformed_fields_are_rejected() {
        let mut manifest = ExtensionManifest::from_toml_str(PLUGIN).unwrap();
        manifest.version = "one".into();
        assert!(matches!(
            manifest.validate(&engine()),
            Err(ManifestError::InvalidField { field: "version", .. })
        ));
        assert!(ExtensionManifest::from_toml_str("id = 3").is_err());
    }

    #[test]
    fn capability_strings_round_trip() {
        for text in ["read:plugins", "write:body", "policy:authorize", "secret:read", "transform:compute"] {
            let caps = Capability::parse(text).unwrap();
            assert_eq!(caps.len(), 1);
            assert_eq!(caps[0].to_string(), text);
        }
        assert_eq!(Capability::parse("write:*").unwrap().len(), 3);
        assert!(Capability::parse("propose").is_none());
    }
}
