//! Testing utilities for the Adapt workspace
//!
//! Shared fixtures: manifests, scripted and JavaScript plugin factories, and a
//! streamed word body that counts how much of itself was read.

#![allow(missing_docs)]

use adapt_kernel::config::EngineConfig;
use adapt_kernel::js::JsScriptFactory;
use adapt_kernel::manifest::{ExtensionKind, ExtensionManifest};
use adapt_kernel::script::{Entry, HostExt, HostFn, ScriptBuilder, ScriptFactory};
use adapt_kernel::{ContentDescriptor, Engine, EngineError};
use adapt_signal::{BodyHandle, BodySource, ChunkIter};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub type Extension = (ExtensionManifest, Arc<dyn ScriptFactory>);

pub fn manifest(id: &str, kind: ExtensionKind, capabilities: &[&str], functions: &[&str]) -> ExtensionManifest {
    ExtensionManifest {
        id: id.to_string(),
        kind,
        version: "1.0.0".to_string(),
        engine: "*".to_string(),
        priority: 0,
        capabilities: capabilities.iter().map(ToString::to_string).collect(),
        host_functions: functions.iter().map(ToString::to_string).collect(),
        config: serde_json::Value::Null,
    }
}

pub fn plugin_manifest(id: &str, capabilities: &[&str], functions: &[&str]) -> ExtensionManifest {
    manifest(id, ExtensionKind::Plugin, capabilities, functions)
}

pub fn with_priority(mut manifest: ExtensionManifest, priority: i32) -> ExtensionManifest {
    manifest.priority = priority;
    manifest
}

/// Plugin that may propose anything and read request and content signals
pub fn proposing_plugin(id: &str, script: ScriptBuilder) -> Extension {
    let manifest = plugin_manifest(
        id,
        &["read:request", "read:content", "propose:*", "transform:compute"],
        &[
            "signal.get",
            "signal.has",
            "transform",
            "propose.status",
            "propose.header",
            "propose.transform",
            "log",
        ],
    );
    (manifest, Arc::new(script))
}

/// JavaScript plugin with the same namespace as [`proposing_plugin`]
pub fn js_plugin(id: &str, source: &str) -> Extension {
    let (manifest, _) = proposing_plugin(id, ScriptBuilder::new());
    (manifest, Arc::new(JsScriptFactory::new(id, source)))
}

pub fn header_plugin(id: &str, name: &'static str, value: &'static str) -> Extension {
    proposing_plugin(
        id,
        ScriptBuilder::new().on(Entry::Propose, move |_, host| Ok(host.propose_header(name, value)?)),
    )
}

pub fn status_plugin(id: &str, code: u16) -> Extension {
    proposing_plugin(
        id,
        ScriptBuilder::new().on(Entry::Propose, move |_, host| Ok(host.propose_status(code)?)),
    )
}

/// Proposes a status, then spins until the operation budget runs out
pub fn spinning_plugin(id: &str) -> Extension {
    proposing_plugin(
        id,
        ScriptBuilder::new().on(Entry::Propose, |_, host| {
            host.propose_status(500)?;
            loop {
                host.step(1)?;
            }
        }),
    )
}

/// Theme that applies the resolved proposals and returns the resolution
pub fn applying_theme(id: &str) -> Extension {
    let manifest = manifest(
        id,
        ExtensionKind::Theme,
        &["read:plugins", "read:request", "read:content", "write:*"],
        &["signal.get", "proposals.resolve", "proposals.apply", "response.body", "log"],
    );
    let script = ScriptBuilder::new().on(Entry::Apply, |_, host| Ok(host.call(HostFn::ProposalsApply, &[])?));
    (manifest, Arc::new(script))
}

/// Theme whose Apply entry always throws
pub fn failing_theme(id: &str) -> Extension {
    let manifest = manifest(id, ExtensionKind::Theme, &["write:body"], &["response.body"]);
    let script = ScriptBuilder::new().on(Entry::Apply, |_, host| {
        host.write_body("partial")?;
        Err(adapt_kernel::script::ScriptError::Thrown("template exploded".into()))
    });
    (manifest, Arc::new(script))
}

pub fn engine_with(config: EngineConfig, extensions: Vec<Extension>) -> Result<Engine, EngineError> {
    extensions
        .into_iter()
        .fold(Engine::builder().config(config), |builder, (manifest, factory)| {
            builder.extension(manifest, factory)
        })
        .build()
}

pub fn engine(extensions: Vec<Extension>) -> Engine {
    engine_with(EngineConfig::default(), extensions).unwrap()
}

pub fn html(body: &'static str) -> ContentDescriptor {
    ContentDescriptor::new()
        .with_body(BodyHandle::from_static(body))
        .with_content_type("text/html; charset=utf-8")
}

/// Streamed body of `words` words, served in fixed-size chunks
#[derive(Debug, Clone)]
pub struct WordBody {
    words: usize,
    per_chunk: usize,
    served: Arc<AtomicUsize>,
}

impl WordBody {
    pub fn new(words: usize, per_chunk: usize) -> Self {
        Self {
            words,
            per_chunk: per_chunk.max(1),
            served: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Chunks handed out so far, across every pass
    pub fn served(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.served)
    }

    /// Largest chunk in bytes
    pub fn chunk_bytes(&self) -> usize {
        chunk_text(self.words.saturating_sub(1), self.per_chunk).len()
    }

    pub fn handle(self) -> BodyHandle {
        BodyHandle::new(self)
    }
}

fn chunk_text(first: usize, count: usize) -> String {
    (first..first + count).map(|i| format!("word{i} ")).collect()
}

impl BodySource for WordBody {
    fn open(&self) -> ChunkIter<'_> {
        let served = Arc::clone(&self.served);
        let words = self.words;
        let per_chunk = self.per_chunk;
        Box::new((0..words).step_by(per_chunk).map(move |first| {
            served.fetch_add(1, Ordering::Relaxed);
            Ok(Bytes::from(chunk_text(first, per_chunk.min(words - first))))
        }))
    }
}
