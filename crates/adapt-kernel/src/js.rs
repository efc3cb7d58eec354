//! JavaScript scripts
//!
//! [`JsScriptFactory`] runs extension sources in an embedded `boa_engine`
//! interpreter. A boa [`Context`] cannot leave the thread that created it, so
//! every instance owns a worker thread holding its context. The invoking
//! thread drives the worker over channels and answers each host call with the
//! [`Host`] the invocation was handed, so metering and gating stay on the
//! engine side.
//!
//! A script registers its entry points on the `extension` global:
//!
//! ```js
//! extension.propose = (config) => {
//!   const words = transform("content.body", { op: "word_count" });
//!   return propose.header("X-Words", String(words));
//! };
//! ```
//!
//! Host functions are exposed under their namespace names (`signal.get`,
//! `propose.status`, `render.template`, ...) and exchange JSON values. A
//! refused host call throws; an uncaught refusal surfaces as that host error.
//!
//! Budget mapping: `max_operations` becomes boa's per-loop iteration limit
//! and `max_call_depth` its recursion limit. Value sizes are checked on every
//! host call argument and on the entry's result. While the script runs the
//! invoking thread keeps polling the phase deadline and cancellation; a
//! breach abandons the worker and the next invocation starts a fresh one.

use crate::budget::{BudgetDimension, BudgetExceeded, ExecutionBudget};
use crate::script::{Entry, Host, HostCallError, HostFn, Script, ScriptError, ScriptFactory, ScriptValue};
use boa_engine::{js_string, Context, JsArgs, JsError, JsNativeError, JsResult, JsString, JsValue, NativeFunction, Source};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How often a waiting invocation re-checks the deadline and cancellation
const POLL: Duration = Duration::from_millis(5);

/// Frames the prelude itself adds between the host and an entry point
const PRELUDE_FRAMES: usize = 3;

const PRELUDE: &str = r#"
"use strict";
(() => {
  const call = (name, args) => {
    const reply = JSON.parse(__host(name, JSON.stringify(args)));
    if ("err" in reply) {
      throw new Error(reply.err);
    }
    return reply.ok;
  };
  const withOp = (args, op) => (op === undefined ? args : args.concat([op]));
  const define = (name, value) =>
    Object.defineProperty(globalThis, name, { value: Object.freeze(value), writable: false });

  Object.defineProperty(globalThis, "extension", { value: {}, writable: false });
  define("signal", {
    get: (key) => call("signal.get", [key]),
    has: (key, member) => call("signal.has", [key, member]),
  });
  define("transform", (key, request) => call("transform", [key, request]));
  define("propose", {
    status: (code) => call("propose.status", [code]),
    header: (name, value, op) => call("propose.header", withOp([name, value], op)),
    transform: (descriptor) => call("propose.transform", [descriptor]),
  });
  define("proposals", {
    resolve: () => call("proposals.resolve", []),
    apply: () => call("proposals.apply", []),
  });
  define("response", {
    status: (code) => call("response.status", [code]),
    header: (name, value, op) => call("response.header", withOp([name, value], op)),
    body: (text) => call("response.body", [text]),
  });
  define("render", { template: (template, model) => call("render.template", [template, model]) });
  define("content", { query: (pointer) => call("content.query", [pointer]) });
  define("policy", { authorize: (action, resource) => call("policy.authorize", [action, resource]) });
  define("secret", { get: (key) => call("secret.get", [key]) });
  define("log", (message) => call("log", [String(message)]));
  define("__invoke", (entry, config) => {
    const run = globalThis.extension[entry];
    if (typeof run !== "function") {
      return "null";
    }
    const text = JSON.stringify(run(config));
    return text === undefined ? "null" : text;
  });
})();
"#;

enum Command {
    Invoke {
        entry: Entry,
        config: String,
        budget: ExecutionBudget,
    },
    Reset,
}

enum Event {
    Call { function: String, args: String },
    Done(Result<String, Failure>),
}

enum Failure {
    Limit(BudgetDimension),
    Thrown(String),
}

type Reply = Result<String, String>;

thread_local! {
    static LINK: RefCell<Option<(Sender<Event>, Receiver<Reply>)>> = const { RefCell::new(None) };
}

/// `__host(name, argsJson)`: forward one call to the invoking thread
fn host_call(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let function = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
    let payload = args.get_or_undefined(1).to_string(context)?.to_std_string_escaped();
    let reply = LINK.with(|link| {
        let link = link.borrow();
        let (events, replies) = link.as_ref()?;
        events.send(Event::Call { function, args: payload }).ok()?;
        replies.recv().ok()
    });
    let envelope = match reply {
        Some(Ok(value)) => format!("{{\"ok\":{value}}}"),
        Some(Err(message)) => serde_json::json!({ "err": message }).to_string(),
        None => return Err(JsNativeError::error().with_message("host unavailable").into()),
    };
    Ok(JsValue::from(JsString::from(envelope.as_str())))
}

fn limit_of(message: &str) -> Option<BudgetDimension> {
    if message.contains("loop iteration limit") {
        Some(BudgetDimension::Operations)
    } else if message.contains("recursion limit") || message.contains("stack size") {
        Some(BudgetDimension::CallDepth)
    } else {
        None
    }
}

fn classify(error: &JsError) -> Failure {
    let message = error.to_string();
    limit_of(&message).map_or(Failure::Thrown(message), Failure::Limit)
}

fn apply_limits(context: &mut Context, budget: ExecutionBudget) {
    let limits = context.runtime_limits_mut();
    limits.set_loop_iteration_limit(budget.max_operations);
    limits.set_recursion_limit(budget.max_call_depth as usize + PRELUDE_FRAMES);
}

fn boot(source: &str, budget: ExecutionBudget) -> Result<Context, Failure> {
    let mut context = Context::default();
    apply_limits(&mut context, budget);
    context
        .register_global_builtin_callable(js_string!("__host"), 2, NativeFunction::from_fn_ptr(host_call))
        .map_err(|e| classify(&e))?;
    context
        .eval(Source::from_bytes(PRELUDE.as_bytes()))
        .map_err(|e| classify(&e))?;
    context
        .eval(Source::from_bytes(source.as_bytes()))
        .map_err(|e| classify(&e))?;
    Ok(context)
}

fn run_entry(
    slot: &mut Option<Context>,
    source: &str,
    entry: Entry,
    config: &str,
    budget: ExecutionBudget,
) -> Result<String, Failure> {
    if slot.is_none() {
        *slot = Some(boot(source, budget)?);
    }
    let Some(context) = slot.as_mut() else {
        return Err(Failure::Thrown("script context missing".into()));
    };
    apply_limits(context, budget);
    let entry_name = serde_json::Value::from(entry.as_str());
    let call = format!("__invoke({entry_name}, {config})");
    let value = context
        .eval(Source::from_bytes(call.as_bytes()))
        .map_err(|e| classify(&e))?;
    let text = value.to_string(context).map_err(|e| classify(&e))?;
    Ok(text.to_std_string_escaped())
}

fn run_worker(source: &str, commands: &Receiver<Command>, events: &Sender<Event>, replies: Receiver<Reply>) {
    LINK.with(|link| *link.borrow_mut() = Some((events.clone(), replies)));
    let mut context = None;
    for command in commands {
        match command {
            Command::Reset => context = None,
            Command::Invoke { entry, config, budget } => {
                let result = run_entry(&mut context, source, entry, &config, budget);
                if events.send(Event::Done(result)).is_err() {
                    break;
                }
            }
        }
    }
    tracing::trace!("script worker stopped");
}

struct Link {
    commands: Sender<Command>,
    events: Receiver<Event>,
    replies: Sender<Reply>,
}

fn spawn(source: &Arc<str>, name: &str) -> Option<Link> {
    let (commands, command_rx) = channel::unbounded();
    let (event_tx, events) = channel::unbounded();
    let (replies, reply_rx) = channel::unbounded();
    let source = Arc::clone(source);
    let spawned = std::thread::Builder::new()
        .name(format!("adapt-js-{name}"))
        .spawn(move || run_worker(&source, &command_rx, &event_tx, reply_rx));
    match spawned {
        Ok(_) => Some(Link {
            commands,
            events,
            replies,
        }),
        Err(error) => {
            tracing::error!(%error, script = name, "failed to start script worker");
            None
        }
    }
}

/// Factory for JavaScript-backed scripts
#[derive(Clone)]
pub struct JsScriptFactory {
    name: Arc<str>,
    source: Arc<str>,
}

impl fmt::Debug for JsScriptFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsScriptFactory")
            .field("name", &self.name)
            .field("source_bytes", &self.source.len())
            .finish()
    }
}

impl JsScriptFactory {
    /// Script named `name` for diagnostics, running `source`
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, source: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Script source text
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl ScriptFactory for JsScriptFactory {
    fn instantiate(&self) -> Box<dyn Script> {
        Box::new(JsScript {
            name: Arc::clone(&self.name),
            source: Arc::clone(&self.source),
            link: None,
        })
    }
}

struct JsScript {
    name: Arc<str>,
    source: Arc<str>,
    link: Option<Link>,
}

fn answer(host: &mut dyn Host, function: &str, args: &str) -> Result<String, HostCallError> {
    let function =
        HostFn::parse(function).ok_or_else(|| HostCallError::Failed(format!("unknown host function `{function}`")))?;
    let args = match serde_json::from_str(args) {
        Ok(serde_json::Value::Array(items)) => items.iter().map(ScriptValue::from_json).collect::<Vec<_>>(),
        _ => {
            return Err(HostCallError::BadArguments {
                function,
                reason: "arguments must be a JSON array".into(),
            })
        }
    };
    Ok(host.call(function, &args)?.to_json().to_string())
}

/// Serve host calls until the worker reports; `Err` abandons the worker
fn drive(link: &Link, host: &mut dyn Host) -> Result<(Result<String, Failure>, Option<HostCallError>), ScriptError> {
    let mut refused = None;
    loop {
        let event = match link.events.recv_timeout(POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                host.step(0)?;
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return Err(ScriptError::Thrown("script runtime stopped".into())),
        };
        match event {
            Event::Call { function, args } => {
                let reply = answer(host, &function, &args).map_err(|error| {
                    let message = error.to_string();
                    refused = Some(error);
                    message
                });
                if link.replies.send(reply).is_err() {
                    return Err(ScriptError::Thrown("script runtime stopped".into()));
                }
            }
            Event::Done(result) => return Ok((result, refused)),
        }
    }
}

fn settle(
    result: Result<String, Failure>,
    refused: Option<HostCallError>,
    host: &mut dyn Host,
) -> Result<ScriptValue, ScriptError> {
    match result {
        Ok(text) => {
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| ScriptError::Thrown(format!("entry result is not JSON: {e}")))?;
            let value = ScriptValue::from_json(&json);
            host.hold(&value)?;
            Ok(value)
        }
        Err(Failure::Limit(dimension)) => {
            let budget = host.budget();
            let limit = match dimension {
                BudgetDimension::CallDepth => u64::from(budget.max_call_depth),
                _ => budget.max_operations,
            };
            Err(ScriptError::Host(HostCallError::Budget(BudgetExceeded {
                dimension,
                limit,
                observed: limit.saturating_add(1),
            })))
        }
        Err(Failure::Thrown(message)) => match refused {
            Some(error) if message.contains(&error.to_string()) => Err(ScriptError::Host(error)),
            _ => Err(ScriptError::Thrown(message)),
        },
    }
}

impl Script for JsScript {
    fn invoke(&mut self, entry: Entry, host: &mut dyn Host) -> Result<ScriptValue, ScriptError> {
        if self.link.is_none() {
            self.link = spawn(&self.source, &self.name);
        }
        let Some(link) = self.link.as_ref() else {
            return Err(ScriptError::Thrown("script runtime unavailable".into()));
        };
        let command = Command::Invoke {
            entry,
            config: host.config().to_string(),
            budget: host.budget(),
        };
        let driven = if link.commands.send(command).is_ok() {
            drive(link, host)
        } else {
            Err(ScriptError::Thrown("script runtime stopped".into()))
        };
        match driven {
            Ok((result, refused)) => settle(result, refused, host),
            Err(error) => {
                tracing::debug!(script = %self.name, %error, "abandoning script worker");
                self.link = None;
                Err(error)
            }
        }
    }

    fn reset(&mut self) {
        if let Some(link) = &self.link {
            if link.commands.send(Command::Reset).is_err() {
                self.link = None;
            }
        }
    }
}
