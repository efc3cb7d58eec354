//! Built-in demo extensions used by the `adapt-kernel` binary
//!
//! Three plugins and one theme, written in JavaScript and run by
//! [`JsScriptFactory`]:
//!
//! | id | kind | does |
//! |----|------|------|
//! | `reading-time` | plugin | counts words in Observe, proposes a header and a badge |
//! | `draft-guard` | plugin | proposes 404 for content marked `draft` |
//! | `security-headers` | plugin | proposes hardening headers at priority 10 |
//! | `starter` | theme | renders `layout = "page"` content, applies proposals |

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineBuilder};
use crate::error::EngineError;
use crate::js::JsScriptFactory;
use std::sync::Arc;

const READING_TIME: &str = r#"
id = "reading-time"
kind = "plugin"
version = "1.0.0"
engine = ">=0.1"
capabilities = ["read:content", "transform:compute", "propose:header", "propose:transform"]
host_functions = ["transform", "propose.header", "propose.transform", "log"]

[config]
words_per_minute = 200
"#;

const DRAFT_GUARD: &str = r#"
id = "draft-guard"
kind = "plugin"
version = "1.0.0"
capabilities = ["read:content", "propose:status", "propose:header"]
host_functions = ["signal.get", "propose.status", "propose.header"]
"#;

const SECURITY_HEADERS: &str = r#"
id = "security-headers"
kind = "plugin"
version = "1.0.0"
priority = 10
capabilities = ["propose:header"]
host_functions = ["propose.header"]
"#;

const STARTER: &str = r#"
id = "starter"
kind = "theme"
version = "1.0.0"
capabilities = ["read:content", "read:plugins", "write:*"]
host_functions = ["content.query", "render.template", "proposals.apply", "response.header", "log"]
"#;

fn script(name: &str, source: &'static str) -> Arc<JsScriptFactory> {
    Arc::new(JsScriptFactory::new(name, source))
}

/// Builder preloaded with the demo extensions
pub fn builder(config: EngineConfig) -> Result<EngineBuilder, EngineError> {
    Ok(Engine::builder()
        .config(config)
        .extension_toml(READING_TIME, script("reading-time", include_str!("demo/reading_time.js")))?
        .extension_toml(DRAFT_GUARD, script("draft-guard", include_str!("demo/draft_guard.js")))?
        .extension_toml(SECURITY_HEADERS, script("security-headers", include_str!("demo/security_headers.js")))?
        .extension_toml(STARTER, script("starter", include_str!("demo/starter.js")))?)
}

/// Engine running the demo extensions
pub fn engine(config: EngineConfig) -> Result<Engine, EngineError> {
    builder(config)?.build()
}
