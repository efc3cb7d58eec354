//! Request scope
//!
//! Aggregate root for one request. Owns the signal store, the effect
//! scheduler, the proposal aggregator, the trace and every extension instance
//! activated for the request. Each extension entry point is registered as an
//! effect of its phase, so dependency tracking and re-execution come from the
//! scheduler.
//!
//! The host drives the scope through the phases in order:
//!
//! ```rust,ignore
//! let mut scope = RequestScope::open(&ctx, request, content, cancel)?;
//! scope.run_observe()?;
//! scope.run_propose()?;
//! scope.run_apply()?;
//! let outcome = scope.finalize()?;
//! ```
//!
//! Anything out of order is an [`EngineError::Protocol`].

use crate::budget::Meter;
use crate::config::{EngineConfig, TraceConfig};
use crate::error::{EngineError, PhaseViolation, SandboxError};
use crate::host::{Collaborators, Decision};
use crate::manifest::{CapabilityManifest, ExtensionKind};
use crate::phase::{Action, PhaseController};
use crate::proposal::{
    AggregatedProposals, HeaderOp, HeaderProposal, Proposal, ProposalAggregator, ProposalKind, ProposalSource,
    TransformDescriptor,
};
use crate::request::{ContentDescriptor, RequestDescriptor, Response};
use crate::resolve::{resolve, Resolution};
use crate::sandbox::{signal_arg, ExtensionInstance, HostBridge, SandboxManager};
use crate::script::{Entry, HostCallError, HostFn, ScriptValue};
use crate::trace::{Trace, TraceKind, TraceRecorder};
use crate::transform::{self, TransformRequest};
use adapt_signal::{
    BodyHandle, EffectFault, EffectHost, EffectScheduler, FlushReport, Phase, SchedulerError, SignalDomain, SignalError,
    SignalId, SignalKey, SignalStore, SignalValue,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Engine-wide parts every scope is opened against
#[derive(Debug, Clone)]
pub struct ScopeContext {
    /// Loaded extensions and instance pool
    pub sandbox: Arc<SandboxManager>,
    /// Policy, secrets and render engines
    pub collaborators: Collaborators,
    /// Engine configuration
    pub config: Arc<EngineConfig>,
    /// Active theme id
    pub theme: Option<String>,
}

/// Response plus the request's trace
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Finished response
    pub response: Response,
    /// Complete trace
    pub trace: Trace,
}

/// Result of running Observe and Propose only
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    /// Request id
    pub request_id: String,
    /// Frozen proposal set
    pub proposals: AggregatedProposals,
    /// Trace up to the end of Propose
    pub trace: Trace,
}

#[derive(Debug, Clone, Copy)]
struct Seeded {
    content_metadata: SignalId,
    response_status: SignalId,
    response_headers: SignalId,
    response_body: SignalId,
}

#[derive(Debug)]
struct Draft {
    status: u16,
    headers: Vec<(String, String)>,
    body: BodyHandle,
}

impl Draft {
    fn apply_header(&mut self, header: &HeaderProposal) {
        let value = header.value.clone().unwrap_or_default();
        match header.op {
            HeaderOp::Set => {
                self.headers.retain(|(name, _)| !header.same_name(name));
                self.headers.push((header.name.clone(), value));
            }
            HeaderOp::Append => self.headers.push((header.name.clone(), value)),
            HeaderOp::Remove => self.headers.retain(|(name, _)| !header.same_name(name)),
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn headers_signal(&self) -> SignalValue {
        let mut map: BTreeMap<String, SignalValue> = BTreeMap::new();
        for (name, value) in &self.headers {
            let key = name.to_ascii_lowercase();
            let joined = match map.remove(&key) {
                Some(SignalValue::Str(previous)) => format!("{previous}, {value}"),
                _ => value.clone(),
            };
            map.insert(key, SignalValue::Str(joined));
        }
        SignalValue::Map(map)
    }
}

fn failed(error: impl fmt::Display) -> HostCallError {
    HostCallError::Failed(error.to_string())
}

fn str_arg(function: HostFn, args: &[ScriptValue], index: usize, what: &str) -> Result<String, HostCallError> {
    args.get(index)
        .and_then(ScriptValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| HostCallError::BadArguments {
            function,
            reason: format!("{what} must be a string"),
        })
}

fn status_arg(function: HostFn, args: &[ScriptValue]) -> Result<u16, HostCallError> {
    args.first()
        .and_then(ScriptValue::as_int)
        .and_then(|n| u16::try_from(n).ok())
        .filter(|code| (100..=599).contains(code))
        .ok_or_else(|| HostCallError::BadArguments {
            function,
            reason: "status must be an integer between 100 and 599".into(),
        })
}

/// Effect context: everything an extension invocation can reach
struct State {
    request_id: String,
    store: SignalStore,
    phase: PhaseController,
    aggregator: ProposalAggregator,
    view: Option<AggregatedProposals>,
    resolution: Option<Resolution>,
    trace: TraceRecorder,
    sandbox: Arc<SandboxManager>,
    collaborators: Collaborators,
    instances: Vec<Option<ExtensionInstance>>,
    identity: Option<String>,
    path: String,
    content_type: Option<String>,
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
    response: Draft,
    ids: Seeded,
    theme_failure: Option<String>,
}

impl EffectHost for State {
    fn signals(&self) -> &SignalStore {
        &self.store
    }

    fn signals_mut(&mut self) -> &mut SignalStore {
        &mut self.store
    }
}

impl State {
    fn record(&self, kind: TraceKind) {
        self.trace.record(self.phase.current(), kind);
    }

    fn order_of(&self, id: &str) -> usize {
        self.sandbox.extension(id).map_or(usize::MAX, |e| e.order())
    }

    fn current_content_type(&self) -> Option<String> {
        self.response
            .header("content-type")
            .map(str::to_string)
            .or_else(|| self.content_type.clone())
    }

    /// Invoke one entry point of the instance in `slot`
    fn run_extension(&mut self, slot: usize, entry: Entry) -> Result<(), EffectFault> {
        let Some(mut instance) = self.instances.get_mut(slot).and_then(Option::take) else {
            return Ok(());
        };
        let sandbox = Arc::clone(&self.sandbox);
        let deadline = self.deadline;
        let outcome = sandbox.invoke(&mut instance, entry, self, deadline);
        let extension = instance.id().to_string();
        let kind = instance.kind();
        self.instances[slot] = Some(instance);

        let error = match outcome {
            Ok(_) => {
                let kept = self.aggregator.commit();
                if kept > 0 {
                    tracing::debug!(%extension, kept, "proposals committed");
                }
                return Ok(());
            }
            Err(error) => error,
        };

        let dropped = self.aggregator.rollback();
        if !dropped.is_empty() {
            self.record(TraceKind::ProposalsDropped {
                extension: extension.clone(),
                count: dropped.len(),
            });
        }
        if !error.is_contained() {
            return Err(EffectFault(error.to_string()));
        }
        if let SandboxError::BudgetExceeded { exceeded, .. } = &error {
            self.record(TraceKind::BudgetExceeded {
                extension: extension.clone(),
                dimension: exceeded.dimension,
                limit: exceeded.limit,
                observed: exceeded.observed,
            });
        }
        if kind == ExtensionKind::Theme && entry == Entry::Apply {
            tracing::error!(request_id = %self.request_id, %extension, %error, "theme failed");
            self.theme_failure = Some(error.to_string());
            self.record(TraceKind::ThemeFailed {
                extension,
                error: error.to_string(),
            });
        } else {
            tracing::warn!(request_id = %self.request_id, %extension, %entry, %error, "extension invocation contained");
            self.record(TraceKind::ExtensionFailed {
                extension,
                error: error.to_string(),
            });
        }
        Err(EffectFault(error.to_string()))
    }

    fn sync_response(&mut self) -> Result<(), HostCallError> {
        let ids = self.ids;
        self.store
            .set(ids.response_status, SignalValue::Int(i64::from(self.response.status)))
            .map_err(failed)?;
        self.store
            .set(ids.response_headers, self.response.headers_signal())
            .map_err(failed)?;
        self.store
            .set(ids.response_body, SignalValue::Body(self.response.body.clone()))
            .map_err(failed)?;
        Ok(())
    }

    fn read_signal(&mut self, caller: &CapabilityManifest, args: &[ScriptValue]) -> Result<ScriptValue, HostCallError> {
        let key = signal_arg(HostFn::SignalGet, args)?;
        let Some(id) = self.store.lookup(&key) else {
            return Ok(ScriptValue::Null);
        };
        let value = self.store.get(id).map_err(failed)?;
        self.record(TraceKind::SignalRead {
            extension: caller.id.clone(),
            signal: key.to_string(),
        });
        Ok(ScriptValue::from_signal(&key, &value))
    }

    fn has_member(&mut self, caller: &CapabilityManifest, args: &[ScriptValue]) -> Result<ScriptValue, HostCallError> {
        let key = signal_arg(HostFn::SignalHas, args)?;
        let member = str_arg(HostFn::SignalHas, args, 1, "member")?;
        let Some(id) = self.store.lookup(&key) else {
            return Ok(ScriptValue::Bool(false));
        };
        let present = match self.store.has(id, &member) {
            Ok(present) => present,
            Err(SignalError::TypeMismatch { .. }) => false,
            Err(other) => return Err(failed(other)),
        };
        self.record(TraceKind::SignalRead {
            extension: caller.id.clone(),
            signal: key.to_string(),
        });
        Ok(ScriptValue::Bool(present))
    }

    fn transform_failed(&self, caller: &CapabilityManifest, code: &str) -> ScriptValue {
        self.record(TraceKind::TransformFailed {
            extension: caller.id.clone(),
            code: code.to_string(),
        });
        ScriptValue::Error(code.to_string())
    }

    fn compute_transform(
        &mut self,
        caller: &CapabilityManifest,
        args: &[ScriptValue],
        meter: &mut Meter,
    ) -> Result<ScriptValue, HostCallError> {
        let key = signal_arg(HostFn::Transform, args)?;
        let descriptor = args.get(1).ok_or_else(|| HostCallError::BadArguments {
            function: HostFn::Transform,
            reason: "missing transform descriptor".into(),
        })?;
        let request = match TransformRequest::from_script(descriptor) {
            Ok(request) => request,
            Err(failure) => return Ok(self.transform_failed(caller, failure.code())),
        };
        let Some(id) = self.store.lookup(&key) else {
            return Ok(self.transform_failed(caller, "transform_failure:not_applicable"));
        };
        meter.check_deadline()?;
        match transform::execute(&self.store, id, &request) {
            Ok(value) => {
                self.record(TraceKind::TransformComputed {
                    extension: caller.id.clone(),
                    signal: key.to_string(),
                    transform: request.name().to_string(),
                });
                Ok(value)
            }
            Err(failure) => Ok(self.transform_failed(caller, failure.code())),
        }
    }

    fn propose(&mut self, caller: &CapabilityManifest, kind: ProposalKind) -> Result<ScriptValue, HostCallError> {
        let source = ProposalSource {
            extension_id: caller.id.clone(),
            order: self.order_of(&caller.id),
            priority: caller.priority,
        };
        let name = kind.name();
        let seq = self.aggregator.submit(&source, self.phase.current(), kind)?;
        self.record(TraceKind::ProposalSubmitted {
            extension: caller.id.clone(),
            seq,
            kind: name.to_string(),
        });
        Ok(ScriptValue::Int(i64::try_from(seq).unwrap_or(i64::MAX)))
    }

    fn resolution(&mut self) -> Result<Resolution, HostCallError> {
        if let Some(resolution) = &self.resolution {
            return Ok(resolution.clone());
        }
        let view = self
            .view
            .as_ref()
            .ok_or_else(|| HostCallError::Failed("proposals are not frozen".into()))?;
        let content_type = self.current_content_type();
        let resolution = resolve(view, content_type.as_deref(), &self.path);
        for applied in &resolution.applied {
            self.record(TraceKind::ProposalApplied {
                seq: applied.seq,
                extension: applied.extension.clone(),
                kind: applied.kind.to_string(),
            });
        }
        for discard in &resolution.discarded {
            self.record(TraceKind::ProposalDiscarded {
                seq: discard.seq,
                extension: discard.extension.clone(),
                kind: discard.kind.to_string(),
                reason: discard.reason.clone(),
            });
        }
        self.resolution = Some(resolution.clone());
        Ok(resolution)
    }

    fn apply_proposals(&mut self, meter: &mut Meter) -> Result<ScriptValue, HostCallError> {
        let resolution = self.resolution()?;
        if let Some(status) = resolution.status {
            self.response.status = status;
        }
        for header in &resolution.headers {
            self.response.apply_header(header);
        }
        if !resolution.transforms.is_empty() {
            meter.check_deadline()?;
            self.response.body = self
                .collaborators
                .render
                .markup
                .rewrite(&self.response.body, &resolution.transforms)
                .map_err(failed)?;
        }
        self.sync_response()?;
        Ok(resolution.to_script())
    }

    fn render_template(&mut self, args: &[ScriptValue], meter: &mut Meter) -> Result<ScriptValue, HostCallError> {
        let template = str_arg(HostFn::RenderTemplate, args, 0, "template")?;
        let model = args.get(1).map_or(serde_json::Value::Null, ScriptValue::to_json);
        meter.check_deadline()?;
        let rendered = self
            .collaborators
            .render
            .template
            .render(&template, &model)
            .map_err(failed)?;
        let len = i64::try_from(rendered.len()).unwrap_or(i64::MAX);
        self.response.body = BodyHandle::from_chunks(std::iter::once(rendered));
        self.sync_response()?;
        Ok(ScriptValue::Int(len))
    }

    fn query_content(&mut self, caller: &CapabilityManifest, args: &[ScriptValue]) -> Result<ScriptValue, HostCallError> {
        let query = str_arg(HostFn::ContentQuery, args, 0, "query")?;
        let metadata = self.store.get(self.ids.content_metadata).map_err(failed)?;
        self.record(TraceKind::SignalRead {
            extension: caller.id.clone(),
            signal: "content.metadata".to_string(),
        });
        let result = self
            .collaborators
            .render
            .query
            .query(&metadata.to_json(), &query)
            .map_err(failed)?;
        Ok(ScriptValue::from_json(&result))
    }

    fn authorize(&mut self, caller: &CapabilityManifest, args: &[ScriptValue]) -> Result<ScriptValue, HostCallError> {
        let action = str_arg(HostFn::PolicyAuthorize, args, 0, "action")?;
        let resource = str_arg(HostFn::PolicyAuthorize, args, 1, "resource")?;
        let decision = self
            .collaborators
            .authorizer
            .authorize(self.identity.as_deref(), &action, &resource);
        self.record(TraceKind::PolicyConsulted {
            extension: caller.id.clone(),
            action,
            resource,
            allowed: decision.is_allowed(),
        });
        let mut verdict = BTreeMap::new();
        verdict.insert("allowed".to_string(), ScriptValue::Bool(decision.is_allowed()));
        verdict.insert(
            "reason".to_string(),
            match decision {
                Decision::Allow => ScriptValue::Null,
                Decision::Deny(reason) => ScriptValue::Str(reason),
            },
        );
        Ok(ScriptValue::Map(verdict))
    }

    fn secret(&mut self, caller: &CapabilityManifest, args: &[ScriptValue]) -> Result<ScriptValue, HostCallError> {
        let key = str_arg(HostFn::SecretGet, args, 0, "secret key")?;
        let value = self.collaborators.secrets.get_secret(&key);
        self.record(TraceKind::SecretRead {
            extension: caller.id.clone(),
            key,
            found: value.is_some(),
        });
        Ok(value.map_or(ScriptValue::Null, ScriptValue::Str))
    }
}

impl HostBridge for State {
    fn check_phase(&self, action: Action, kind: ExtensionKind) -> Result<(), PhaseViolation> {
        self.phase.check(action, kind)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn dispatch(
        &mut self,
        caller: &CapabilityManifest,
        function: HostFn,
        args: &[ScriptValue],
        meter: &mut Meter,
    ) -> Result<ScriptValue, HostCallError> {
        match function {
            HostFn::SignalGet => self.read_signal(caller, args),
            HostFn::SignalHas => self.has_member(caller, args),
            HostFn::Transform => self.compute_transform(caller, args, meter),
            HostFn::ProposeStatus => {
                let code = status_arg(function, args)?;
                self.propose(caller, ProposalKind::Status(code))
            }
            HostFn::ProposeHeader => {
                let header =
                    HeaderProposal::from_args(args).map_err(|reason| HostCallError::BadArguments { function, reason })?;
                self.propose(caller, ProposalKind::Header(header))
            }
            HostFn::ProposeTransform => {
                let raw = args.first().cloned().unwrap_or(ScriptValue::Null);
                match TransformDescriptor::from_script(&raw) {
                    Ok(descriptor) => self.propose(caller, ProposalKind::Transform(descriptor)),
                    Err(failure) => Ok(self.transform_failed(caller, failure.code())),
                }
            }
            HostFn::ProposalsResolve => Ok(self.resolution()?.to_script()),
            HostFn::ProposalsApply => self.apply_proposals(meter),
            HostFn::ResponseStatus => {
                self.response.status = status_arg(function, args)?;
                self.sync_response()?;
                Ok(ScriptValue::Null)
            }
            HostFn::ResponseHeader => {
                let header =
                    HeaderProposal::from_args(args).map_err(|reason| HostCallError::BadArguments { function, reason })?;
                self.response.apply_header(&header);
                self.sync_response()?;
                Ok(ScriptValue::Null)
            }
            HostFn::ResponseBody => {
                let text = str_arg(function, args, 0, "body")?;
                self.response.body = BodyHandle::from_chunks(std::iter::once(text));
                self.sync_response()?;
                Ok(ScriptValue::Null)
            }
            HostFn::RenderTemplate => self.render_template(args, meter),
            HostFn::ContentQuery => self.query_content(caller, args),
            HostFn::PolicyAuthorize => self.authorize(caller, args),
            HostFn::SecretGet => self.secret(caller, args),
            HostFn::Log => {
                let message = match args.first() {
                    Some(ScriptValue::Str(text)) => text.clone(),
                    Some(other) => other.to_json().to_string(),
                    None => String::new(),
                };
                tracing::info!(
                    target: "adapt_kernel::extension",
                    request_id = %self.request_id,
                    extension = %caller.id,
                    "{message}"
                );
                Ok(ScriptValue::Null)
            }
        }
    }

    fn denied(&mut self, caller: &CapabilityManifest, error: &HostCallError) {
        tracing::warn!(request_id = %self.request_id, extension = %caller.id, %error, "host call refused");
        let kind = match error {
            HostCallError::Phase(violation) => TraceKind::PhaseViolation {
                extension: caller.id.clone(),
                action: violation.action.clone(),
            },
            other => TraceKind::CapabilityViolation {
                extension: caller.id.clone(),
                detail: other.to_string(),
            },
        };
        self.record(kind);
    }
}

/// One request's execution
pub struct RequestScope {
    state: State,
    scheduler: EffectScheduler<State>,
    phase_timeout: Duration,
    trace_config: TraceConfig,
    has_theme: bool,
    disposed: bool,
}

impl fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("request_id", &self.state.request_id)
            .field("phase", &self.state.phase.current())
            .field("effects", &self.scheduler.len())
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl RequestScope {
    /// Open a scope with its own cancellation flag
    pub fn new(ctx: &ScopeContext, request: RequestDescriptor, content: ContentDescriptor) -> Result<Self, EngineError> {
        Self::open(ctx, request, content, Arc::new(AtomicBool::new(false)))
    }

    /// Seed signals, activate extensions and register their entry points
    pub fn open(
        ctx: &ScopeContext,
        request: RequestDescriptor,
        content: ContentDescriptor,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, EngineError> {
        let request_id = Uuid::new_v4().to_string();
        let mut store = SignalStore::new();
        let mut define = |domain: SignalDomain, name: &str, value: SignalValue| {
            store.define(SignalKey::new(domain, name), value)
        };

        define(SignalDomain::Request, "id", request_id.clone().into())?;
        define(SignalDomain::Request, "method", request.method.clone().into())?;
        define(SignalDomain::Request, "path", request.path.clone().into())?;
        define(SignalDomain::Request, "version", request.version.clone().into())?;
        define(SignalDomain::Request, "headers", request.headers_signal())?;
        define(SignalDomain::Request, "query", request.query_signal())?;
        define(SignalDomain::Request, "body", request.body.clone().into())?;
        define(
            SignalDomain::Request,
            "identity",
            request.identity.clone().map_or(SignalValue::Null, SignalValue::Str),
        )?;

        let content_metadata = define(SignalDomain::Content, "metadata", SignalValue::from_json(&content.metadata))?;
        define(SignalDomain::Content, "body", content.body.clone().into())?;
        define(
            SignalDomain::Content,
            "type",
            content.content_type.clone().map_or(SignalValue::Null, SignalValue::Str),
        )?;

        let response = Draft {
            status: 200,
            headers: content
                .content_type
                .iter()
                .map(|ct| ("content-type".to_string(), ct.clone()))
                .collect(),
            body: content.body.clone(),
        };
        let response_status = define(SignalDomain::Response, "status", SignalValue::Int(200))?;
        let response_headers = define(SignalDomain::Response, "headers", response.headers_signal())?;
        let response_body = define(SignalDomain::Response, "body", response.body.clone().into())?;

        for (name, value) in AggregatedProposals::default()
            .to_signals()
            .map_err(|e| EngineError::Internal(e.to_string()))?
        {
            define(SignalDomain::Plugins, name, value)?;
        }

        let trace = TraceRecorder::new(request_id.clone(), ctx.config.trace.log_sink);
        let state = State {
            request_id,
            store,
            phase: PhaseController::new(),
            aggregator: ProposalAggregator::new(),
            view: None,
            resolution: None,
            trace,
            sandbox: Arc::clone(&ctx.sandbox),
            collaborators: ctx.collaborators.clone(),
            instances: Vec::new(),
            identity: request.identity,
            path: request.path,
            content_type: content.content_type,
            cancel,
            deadline: Instant::now().checked_add(ctx.config.phase_timeout()),
            response,
            ids: Seeded {
                content_metadata,
                response_status,
                response_headers,
                response_body,
            },
            theme_failure: None,
        };

        let mut scope = Self {
            state,
            scheduler: EffectScheduler::new(ctx.config.max_flush_rounds),
            phase_timeout: ctx.config.phase_timeout(),
            trace_config: ctx.config.trace.clone(),
            has_theme: false,
            disposed: false,
        };
        scope.state.record(TraceKind::PhaseEntered);
        scope.activate(ctx)?;
        tracing::debug!(
            request_id = %scope.state.request_id,
            extensions = scope.state.instances.len(),
            "request scope opened"
        );
        Ok(scope)
    }

    fn activate(&mut self, ctx: &ScopeContext) -> Result<(), EngineError> {
        let chosen: Vec<(String, ExtensionKind)> = ctx
            .sandbox
            .extensions()
            .filter(|e| match e.manifest().kind {
                ExtensionKind::Plugin => true,
                ExtensionKind::Theme => ctx.theme.as_deref() == Some(e.manifest().id.as_str()),
            })
            .map(|e| (e.manifest().id.clone(), e.manifest().kind))
            .collect();

        for (id, kind) in chosen {
            let instance = ctx
                .sandbox
                .activate(&id)
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            self.state.record(TraceKind::ExtensionActivated {
                extension: id.clone(),
                reused: instance.was_reused(),
            });
            let slot = self.state.instances.len();
            self.state.instances.push(Some(instance));

            let entries: &[Entry] = match kind {
                ExtensionKind::Plugin => &[Entry::Observe, Entry::Propose],
                ExtensionKind::Theme => {
                    self.has_theme = true;
                    &[Entry::Observe, Entry::Apply]
                }
            };
            for &entry in entries {
                self.scheduler.register(
                    format!("{id}:{entry}"),
                    entry.phase(),
                    Box::new(move |state: &mut State| state.run_extension(slot, entry)),
                )?;
            }
        }
        Ok(())
    }

    /// Request id
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.state.request_id
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.state.phase.current()
    }

    /// Phases entered so far
    #[must_use]
    pub fn phase_history(&self) -> &[Phase] {
        self.state.phase.history()
    }

    /// Committed proposals so far
    #[must_use]
    pub fn proposals(&self) -> &[Proposal] {
        self.state.aggregator.proposals()
    }

    /// Frozen view, once Apply has been entered
    #[must_use]
    pub fn aggregated(&self) -> Option<&AggregatedProposals> {
        self.state.view.as_ref()
    }

    /// Registered effects; zero once disposed
    #[must_use]
    pub fn effect_count(&self) -> usize {
        self.scheduler.len()
    }

    /// Whether the scope has been torn down
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Copy of the trace so far
    #[must_use]
    pub fn trace(&self) -> Trace {
        self.state.trace.snapshot()
    }

    /// Flag that cancels the request when set
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.state.cancel)
    }

    /// Cancel the request; takes effect at the next host interaction
    pub fn cancel(&self) {
        self.state.cancel.store(true, Ordering::Release);
    }

    /// Current value of a signal
    pub fn signal(&self, key: &SignalKey) -> Result<SignalValue, EngineError> {
        let id = self
            .state
            .store
            .lookup(key)
            .ok_or_else(|| SignalError::Unknown(key.to_string()))?;
        Ok(self.state.store.get(id)?)
    }

    /// Host write to a request or content signal; only legal during Observe
    ///
    /// Dependent effects re-run on the next [`run_observe`](Self::run_observe).
    pub fn set_signal(&mut self, key: &SignalKey, value: SignalValue) -> Result<u64, EngineError> {
        self.ensure_live()?;
        let phase = self.state.phase.current();
        if phase != Phase::Observe || matches!(key.domain, SignalDomain::Response | SignalDomain::Plugins) {
            return Err(EngineError::ReadOnly { phase });
        }
        let id = self
            .state
            .store
            .lookup(key)
            .ok_or_else(|| SignalError::Unknown(key.to_string()))?;
        Ok(self.state.store.set(id, value)?)
    }

    fn ensure_live(&mut self) -> Result<(), EngineError> {
        if self.disposed {
            return Err(EngineError::Disposed);
        }
        if self.state.cancelled() {
            let phase = self.state.phase.current();
            tracing::info!(request_id = %self.state.request_id, %phase, "request cancelled");
            self.state.record(TraceKind::Cancelled);
            self.dispose();
            return Err(EngineError::Cancelled { phase });
        }
        Ok(())
    }

    fn advance(&mut self, to: Phase) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.state.phase.advance(to)?;
        self.state.deadline = Instant::now().checked_add(self.phase_timeout);
        self.state.record(TraceKind::PhaseEntered);
        Ok(())
    }

    fn flush(&mut self, phase: Phase) -> Result<FlushReport, EngineError> {
        self.ensure_live()?;
        let report = match self.scheduler.flush(phase, &mut self.state) {
            Ok(report) => report,
            Err(SchedulerError::Unsettled { rounds, .. }) => {
                tracing::warn!(request_id = %self.state.request_id, %phase, rounds, "effects did not settle");
                self.state.record(TraceKind::Unsettled { rounds });
                FlushReport {
                    rounds,
                    ..FlushReport::default()
                }
            }
            Err(other) => return Err(other.into()),
        };
        if !report.cross_phase.is_empty() {
            tracing::debug!(request_id = %self.state.request_id, skipped = report.cross_phase.len(), "cross-phase dependents skipped");
        }
        self.ensure_live()?;
        Ok(report)
    }

    /// Run (or re-run) the Observe effects
    #[tracing::instrument(level = "debug", skip_all, fields(request_id = %self.state.request_id))]
    pub fn run_observe(&mut self) -> Result<FlushReport, EngineError> {
        self.ensure_live()?;
        let current = self.state.phase.current();
        if current != Phase::Observe {
            return Err(EngineError::Protocol {
                from: current,
                to: Phase::Observe,
            });
        }
        self.flush(Phase::Observe)
    }

    /// Enter Propose and run the Plugins' proposal entry points
    #[tracing::instrument(level = "debug", skip_all, fields(request_id = %self.state.request_id))]
    pub fn run_propose(&mut self) -> Result<FlushReport, EngineError> {
        self.advance(Phase::Propose)?;
        self.flush(Phase::Propose)
    }

    /// Freeze proposals, publish `plugins.*` and run the Theme
    #[tracing::instrument(level = "debug", skip_all, fields(request_id = %self.state.request_id))]
    pub fn run_apply(&mut self) -> Result<FlushReport, EngineError> {
        if !self.has_theme {
            return Err(EngineError::NoTheme);
        }
        self.advance(Phase::Apply)?;
        let view = self.state.aggregator.freeze();
        let signals = view.to_signals().map_err(|e| EngineError::Internal(e.to_string()))?;
        for (name, value) in signals {
            let key = SignalKey::new(SignalDomain::Plugins, name);
            let id = self
                .state
                .store
                .lookup(&key)
                .ok_or_else(|| SignalError::Unknown(key.to_string()))?;
            self.state.store.set(id, value)?;
        }
        tracing::debug!(request_id = %self.state.request_id, proposals = view.len(), "proposals frozen");
        self.state.view = Some(view);
        self.flush(Phase::Apply)
    }

    /// Enter Finalize, build the response and dispose the scope
    #[tracing::instrument(level = "debug", skip_all, fields(request_id = %self.state.request_id))]
    pub fn finalize(&mut self) -> Result<Outcome, EngineError> {
        self.advance(Phase::Finalize)?;
        let mut response = if self.state.theme_failure.is_some() {
            Response::internal_error()
        } else {
            Response {
                status: self.state.response.status,
                headers: self.state.response.headers.clone(),
                body: self.state.response.body.clone(),
            }
        };
        self.dispose();
        let trace = self.state.trace.snapshot();
        if self.trace_config.expose_headers {
            response.headers.extend(trace.to_headers(&self.trace_config.header_prefix));
        }
        tracing::info!(
            request_id = %self.state.request_id,
            status = response.status,
            events = trace.events.len(),
            "request finalized"
        );
        Ok(Outcome { response, trace })
    }

    /// End a dry run after Propose without entering Apply
    pub fn conclude_dry_run(&mut self) -> Result<DryRunReport, EngineError> {
        self.ensure_live()?;
        let current = self.state.phase.current();
        if current != Phase::Propose {
            return Err(EngineError::Protocol {
                from: current,
                to: Phase::Propose,
            });
        }
        let proposals = self.state.aggregator.freeze();
        self.dispose();
        Ok(DryRunReport {
            request_id: self.state.request_id.clone(),
            proposals,
            trace: self.state.trace.snapshot(),
        })
    }

    /// Tear everything down; idempotent
    ///
    /// Effects are dropped, instances go back to the pool with their globals
    /// reset and the signal store is cleared.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.scheduler.dispose();
        for instance in self.state.instances.drain(..).flatten() {
            self.state.sandbox.release(instance);
        }
        self.state.store.dispose();
        self.state.record(TraceKind::Disposed);
        tracing::debug!(request_id = %self.state.request_id, "request scope disposed");
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::ExecutionBudget;
    use crate::manifest::ExtensionManifest;
    use crate::script::{HostExt, ScriptBuilder, ScriptFactory};
    use semver::Version;

    fn manifest(id: &str, kind: ExtensionKind, caps: &[&str], functions: &[&str]) -> ExtensionManifest {
        ExtensionManifest {
            id: id.into(),
            kind,
            version: "1.0.0".into(),
            engine: "*".into(),
            priority: 0,
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            host_functions: functions.iter().map(|s| s.to_string()).collect(),
            config: serde_json::Value::Null,
        }
    }

    fn context(extensions: Vec<(ExtensionManifest, Arc<dyn ScriptFactory>)>) -> ScopeContext {
        let mut sandbox = SandboxManager::new(ExecutionBudget::default(), Version::new(0, 1, 0), 2, 4);
        let mut theme = None;
        for (manifest, factory) in extensions {
            if manifest.kind == ExtensionKind::Theme {
                theme = Some(manifest.id.clone());
            }
            sandbox.load(&manifest, factory).unwrap();
        }
        ScopeContext {
            sandbox: Arc::new(sandbox),
            collaborators: Collaborators::default(),
            config: Arc::new(EngineConfig::default()),
            theme,
        }
    }

    fn header_plugin() -> (ExtensionManifest, Arc<dyn ScriptFactory>) {
        let script = ScriptBuilder::new().on(Entry::Propose, |_, host| Ok(host.propose_header("X-Foo", "bar")?));
        (
            manifest("headers", ExtensionKind::Plugin, &["propose:header"], &["propose.header"]),
            Arc::new(script),
        )
    }

    fn applying_theme() -> (ExtensionManifest, Arc<dyn ScriptFactory>) {
        let script = ScriptBuilder::new().on(Entry::Apply, |_, host| Ok(host.call(HostFn::ProposalsApply, &[])?));
        (
            manifest(
                "theme",
                ExtensionKind::Theme,
                &["read:plugins", "write:*"],
                &["proposals.apply"],
            ),
            Arc::new(script),
        )
    }

    #[test]
    fn full_lifecycle_applies_headers() {
        let ctx = context(vec![header_plugin(), applying_theme()]);
        let mut scope = RequestScope::new(&ctx, RequestDescriptor::get("/blog/post-1"), ContentDescriptor::new()).unwrap();
        scope.run_observe().unwrap();
        scope.run_propose().unwrap();
        assert_eq!(scope.proposals().len(), 1);
        scope.run_apply().unwrap();
        assert_eq!(scope.aggregated().map(AggregatedProposals::len), Some(1));
        let outcome = scope.finalize().unwrap();
        assert_eq!(outcome.response.header("x-foo"), Some("bar"));
        assert!(outcome.trace.verify_integrity().is_ok());
        assert!(scope.is_disposed());
        assert_eq!(scope.effect_count(), 0);
    }

    #[test]
    fn skipping_propose_is_a_protocol_error() {
        let ctx = context(vec![header_plugin(), applying_theme()]);
        let mut scope = RequestScope::new(&ctx, RequestDescriptor::get("/"), ContentDescriptor::new()).unwrap();
        let err = scope.run_apply().unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(err.is_fatal_to_request());
    }

    #[test]
    fn nothing_runs_after_finalize() {
        let ctx = context(vec![header_plugin(), applying_theme()]);
        let mut scope = RequestScope::new(&ctx, RequestDescriptor::get("/"), ContentDescriptor::new()).unwrap();
        scope.run_observe().unwrap();
        scope.run_propose().unwrap();
        scope.run_apply().unwrap();
        scope.finalize().unwrap();
        assert!(matches!(scope.run_observe(), Err(EngineError::Disposed)));
        assert!(matches!(scope.finalize(), Err(EngineError::Disposed)));
    }

    #[test]
    fn host_writes_are_limited_to_observe() {
        let ctx = context(vec![header_plugin(), applying_theme()]);
        let mut scope = RequestScope::new(&ctx, RequestDescriptor::get("/"), ContentDescriptor::new()).unwrap();
        let path = SignalKey::new(SignalDomain::Request, "path");
        assert_eq!(scope.set_signal(&path, "/about".into()).unwrap(), 2);
        assert!(matches!(
            scope.set_signal(&SignalKey::new(SignalDomain::Response, "status"), SignalValue::Int(404)),
            Err(EngineError::ReadOnly { .. })
        ));
        scope.run_observe().unwrap();
        scope.run_propose().unwrap();
        assert!(matches!(
            scope.set_signal(&path, "/late".into()),
            Err(EngineError::ReadOnly { phase: Phase::Propose })
        ));
        assert_eq!(scope.signal(&path).unwrap(), SignalValue::from("/about"));
    }

    #[test]
    fn cancellation_disposes_the_scope() {
        let ctx = context(vec![header_plugin(), applying_theme()]);
        let mut scope = RequestScope::new(&ctx, RequestDescriptor::get("/"), ContentDescriptor::new()).unwrap();
        scope.run_observe().unwrap();
        scope.cancel();
        assert!(matches!(
            scope.run_propose(),
            Err(EngineError::Cancelled { phase: Phase::Observe })
        ));
        assert!(scope.is_disposed());
        assert_eq!(ctx.sandbox.stats().active, 0);
        assert!(scope.trace().find(|k| matches!(k, TraceKind::Cancelled)).next().is_some());
    }

    #[test]
    fn dry_run_stops_after_propose() {
        let ctx = context(vec![header_plugin(), applying_theme()]);
        let mut scope = RequestScope::new(&ctx, RequestDescriptor::get("/"), ContentDescriptor::new()).unwrap();
        scope.run_observe().unwrap();
        scope.run_propose().unwrap();
        let report = scope.conclude_dry_run().unwrap();
        assert_eq!(report.proposals.len(), 1);
        assert!(!scope.phase_history().contains(&Phase::Apply));
    }
}
