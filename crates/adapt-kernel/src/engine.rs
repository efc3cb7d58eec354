//! Engine
//!
//! Long-lived entry point. Holds the loaded extensions, the instance pool and
//! the collaborators; every request gets its own [`RequestScope`] on a
//! blocking worker so scripts never stall the async runtime.

use crate::config::EngineConfig;
use crate::error::{EngineError, ManifestError};
use crate::host::{Authorizer, Collaborators, SecretStore};
use crate::manifest::{ExtensionKind, ExtensionManifest};
use crate::render::RenderEngines;
use crate::request::{ContentDescriptor, RequestDescriptor, Response};
use crate::sandbox::SandboxManager;
use crate::scope::{DryRunReport, Outcome, RequestScope, ScopeContext};
use crate::script::ScriptFactory;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Manifest that failed validation at build time
#[derive(Debug)]
pub struct Rejected {
    /// Declared id
    pub id: String,
    /// Why it was refused
    pub error: ManifestError,
}

/// Builder for [`Engine`]
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    extensions: Vec<(ExtensionManifest, Arc<dyn ScriptFactory>)>,
    collaborators: Collaborators,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field(
                "extensions",
                &self.extensions.iter().map(|(m, _)| m.id.as_str()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Builder with default configuration and no extensions
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config`
    #[inline]
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an extension; registration order follows call order
    #[must_use]
    pub fn extension(mut self, manifest: ExtensionManifest, factory: Arc<dyn ScriptFactory>) -> Self {
        self.extensions.push((manifest, factory));
        self
    }

    /// Add an extension from TOML manifest text
    pub fn extension_toml(self, manifest: &str, factory: Arc<dyn ScriptFactory>) -> Result<Self, ManifestError> {
        let manifest = ExtensionManifest::from_toml_str(manifest)?;
        Ok(self.extension(manifest, factory))
    }

    /// Policy collaborator
    #[inline]
    #[must_use]
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.collaborators.authorizer = authorizer;
        self
    }

    /// Secret collaborator
    #[inline]
    #[must_use]
    pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.collaborators.secrets = secrets;
        self
    }

    /// Render collaborators
    #[inline]
    #[must_use]
    pub fn render(mut self, render: RenderEngines) -> Self {
        self.collaborators.render = render;
        self
    }

    /// Validate configuration, load extensions and pick the theme
    ///
    /// A manifest that fails validation is refused and kept in
    /// [`Engine::rejected`]; the remaining extensions still load.
    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;
        let version = self.config.engine_version()?;
        let mut sandbox = SandboxManager::new(
            self.config.budget,
            version,
            self.config.pool_idle_per_extension,
            self.config.max_concurrent_requests,
        );

        let mut rejected = Vec::new();
        for (manifest, factory) in self.extensions {
            if let Err(error) = sandbox.load(&manifest, factory) {
                rejected.push(Rejected { id: manifest.id, error });
            }
        }

        let theme = match &self.config.theme {
            Some(id) => match sandbox.extension(id) {
                Some(ext) if ext.manifest().kind == ExtensionKind::Theme => Some(id.clone()),
                _ => {
                    tracing::error!(theme = %id, "configured theme is not loaded");
                    return Err(EngineError::NoTheme);
                }
            },
            None => sandbox
                .extensions()
                .find(|e| e.manifest().kind == ExtensionKind::Theme)
                .map(|e| e.manifest().id.clone()),
        };

        tracing::info!(
            extensions = sandbox.extensions().count(),
            rejected = rejected.len(),
            theme = theme.as_deref().unwrap_or("-"),
            "engine ready"
        );
        Ok(Engine {
            ctx: ScopeContext {
                sandbox: Arc::new(sandbox),
                collaborators: self.collaborators,
                config: Arc::new(self.config),
                theme,
            },
            rejected,
        })
    }
}

/// Sets the cancel flag unless disarmed; dropped with the request future
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl CancelOnDrop {
    fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::Release);
        }
    }
}

/// Extension execution engine
#[derive(Debug)]
pub struct Engine {
    ctx: ScopeContext,
    rejected: Vec<Rejected>,
}

impl Engine {
    /// Start building an engine
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Manifests refused at build time
    #[must_use]
    pub fn rejected(&self) -> &[Rejected] {
        &self.rejected
    }

    /// Loaded extensions and pool
    #[must_use]
    pub fn sandbox(&self) -> &SandboxManager {
        &self.ctx.sandbox
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Active theme id
    #[must_use]
    pub fn theme(&self) -> Option<&str> {
        self.ctx.theme.as_deref()
    }

    /// Open a scope to drive by hand
    pub fn open_scope(&self, request: RequestDescriptor, content: ContentDescriptor) -> Result<RequestScope, EngineError> {
        RequestScope::new(&self.ctx, request, content)
    }

    /// Run one request through every phase on the calling thread
    pub fn handle_blocking(&self, request: RequestDescriptor, content: ContentDescriptor) -> Result<Outcome, EngineError> {
        run_phases(&self.ctx, request, content, Arc::new(AtomicBool::new(false)))
    }

    /// Run one request and return the response
    pub async fn handle(&self, request: RequestDescriptor, content: ContentDescriptor) -> Result<Response, EngineError> {
        Ok(self.execute(request, content).await?.response)
    }

    /// Run one request and return the response with its trace
    ///
    /// Dropping the future cancels the request; the worker notices at its
    /// next host interaction and disposes the scope.
    #[tracing::instrument(level = "info", skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn execute(&self, request: RequestDescriptor, content: ContentDescriptor) -> Result<Outcome, EngineError> {
        if self.ctx.theme.is_none() {
            return Err(EngineError::NoTheme);
        }
        let _permit = self.ctx.sandbox.admit().await?;
        let cancel = Arc::new(AtomicBool::new(false));
        let guard = CancelOnDrop::new(Arc::clone(&cancel));
        let ctx = self.ctx.clone();
        let outcome = tokio::task::spawn_blocking(move || run_phases(&ctx, request, content, cancel))
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        guard.disarm();
        outcome
    }

    /// Run Observe and Propose only
    #[tracing::instrument(level = "info", skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn dry_run(&self, request: RequestDescriptor, content: ContentDescriptor) -> Result<DryRunReport, EngineError> {
        let _permit = self.ctx.sandbox.admit().await?;
        let cancel = Arc::new(AtomicBool::new(false));
        let guard = CancelOnDrop::new(Arc::clone(&cancel));
        let ctx = self.ctx.clone();
        let report = tokio::task::spawn_blocking(move || {
            let mut scope = RequestScope::open(&ctx, request, content, cancel)?;
            scope.run_observe()?;
            scope.run_propose()?;
            scope.conclude_dry_run()
        })
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))?;
        guard.disarm();
        report
    }
}

fn run_phases(
    ctx: &ScopeContext,
    request: RequestDescriptor,
    content: ContentDescriptor,
    cancel: Arc<AtomicBool>,
) -> Result<Outcome, EngineError> {
    let mut scope = RequestScope::open(ctx, request, content, cancel)?;
    let request_id = scope.request_id().to_string();
    let outcome = drive(&mut scope);
    if let Err(error) = &outcome {
        tracing::warn!(%request_id, %error, "request aborted");
    }
    outcome
}

fn drive(scope: &mut RequestScope) -> Result<Outcome, EngineError> {
    scope.run_observe()?;
    scope.run_propose()?;
    scope.run_apply()?;
    scope.finalize()
}
