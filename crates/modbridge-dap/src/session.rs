//! One debug session: run state, breakpoints and the stop-scoped reference
//! table, driven through the [`TargetControl`] capability interface.
//!
//! Request methods do their bookkeeping and enqueue target commands
//! synchronously, then return a `'static` future that completes the request.
//! Callers that invoke methods one after another therefore get their target
//! commands in that order, even if they await the futures concurrently.

use std::{fmt, future::Future, pin::Pin, sync::Arc, time::Instant};

use modbridge_wire::wire::{
    ArmedBreakpointInfo, BreakpointSpec, ScopeKind, StepDepth, TargetControl, TargetEvent,
    TargetFuture, TargetHandle, OutputStream, StopReason, VariableInfo, WireError,
};
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};

use crate::{
    breakpoints::{BreakpointManager, BreakpointPlan},
    dap::types::{
        Breakpoint, EvaluateArguments, EvaluateResult, OutputEvent, Scope, ScopesArguments,
        SetBreakpointsArguments, SetVariableArguments, SetVariableResponseBody, Source,
        SourceBreakpoint, StackFrame, StackTraceArguments, Thread, Variable,
        VariablePresentationHint, VariablesArguments,
    },
    error::{SessionError, SessionResult},
    eval_context::{duration_ms, EvalContext},
    format::ValueFormatter,
    references::{Reference, ReferenceTable},
};

/// The only thread exposed to the client.
pub const THREAD_ID: i64 = 1;
pub const THREAD_NAME: &str = "thread 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Target spawned or connected; the debug hook has not reported in yet.
    Launching,
    Initialized,
    /// The client has started sending configuration.
    Configuring,
    Running,
    Stopped,
    Terminated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Launching => "launching",
            RunState::Initialized => "initialized",
            RunState::Configuring => "configuring",
            RunState::Running => "running",
            RunState::Stopped => "stopped",
            RunState::Terminated => "terminated",
        })
    }
}

/// A DAP event produced by the session, without its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct DapEvent {
    pub event: &'static str,
    pub body: Option<JsonValue>,
}

impl DapEvent {
    fn new(event: &'static str, body: Option<JsonValue>) -> Self {
        Self { event, body }
    }

    fn output(category: &str, output: String) -> Self {
        let body = OutputEvent {
            category: category.to_string(),
            output,
        };
        Self::new("output", serde_json::to_value(body).ok())
    }

    fn breakpoint_changed(breakpoint: Breakpoint) -> Self {
        Self::new(
            "breakpoint",
            Some(json!({ "reason": "changed", "breakpoint": breakpoint })),
        )
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub stop_on_entry: bool,
    pub max_string_len: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            stop_on_entry: false,
            max_string_len: ValueFormatter::default().max_string_len,
        }
    }
}

struct State {
    run: RunState,
    /// Bumped whenever the target resumes or stops. Replies that arrive for an
    /// older generation must not touch the reference table.
    generation: u64,
    breakpoints: BreakpointManager,
    references: ReferenceTable,
    closed: bool,
}

impl State {
    fn require(&self, command: &'static str, allowed: &[RunState]) -> SessionResult<u64> {
        if allowed.contains(&self.run) {
            Ok(self.generation)
        } else {
            Err(SessionError::InvalidState {
                command,
                state: self.run,
            })
        }
    }

    fn require_stopped(&self, command: &'static str) -> SessionResult<u64> {
        self.require(command, &[RunState::Stopped])
    }

    fn check_generation(&self, generation: u64) -> SessionResult<()> {
        if self.generation == generation && self.run == RunState::Stopped {
            Ok(())
        } else {
            Err(SessionError::Resumed)
        }
    }

    fn invalidate(&mut self) {
        self.generation += 1;
        self.references.reset();
    }
}

/// Where a container handle comes from: already known, or a scope that still
/// has to be resolved on the target.
enum HandleSource {
    Known(TargetHandle),
    Scope {
        id: i64,
        resolve: TargetFuture<TargetHandle>,
    },
}

type BreakpointsFuture = Pin<Box<dyn Future<Output = Vec<Breakpoint>> + Send + 'static>>;

pub struct Session {
    target: Arc<dyn TargetControl>,
    formatter: ValueFormatter,
    stop_on_entry: bool,
    state: Mutex<State>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn scope_name(kind: ScopeKind) -> &'static str {
    match kind {
        ScopeKind::Locals => "Locals",
        ScopeKind::Upvalues => "Upvalues",
        ScopeKind::RuntimeGlobal => "Runtime Global",
        ScopeKind::HostGlobal => "Host Globals",
    }
}

fn to_spec(breakpoint: SourceBreakpoint) -> BreakpointSpec {
    BreakpointSpec {
        line: breakpoint.line,
        condition: breakpoint.condition.filter(|c| !c.trim().is_empty()),
        hit_condition: breakpoint.hit_condition.filter(|c| !c.trim().is_empty()),
        log_message: breakpoint.log_message,
    }
}

fn file_name(path: &str) -> Option<String> {
    path.rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

impl Session {
    pub fn new(target: Arc<dyn TargetControl>, options: SessionOptions) -> Arc<Self> {
        Arc::new(Self {
            target,
            formatter: ValueFormatter::new(options.max_string_len),
            stop_on_entry: options.stop_on_entry,
            state: Mutex::new(State {
                run: RunState::Launching,
                generation: 0,
                breakpoints: BreakpointManager::new(),
                references: ReferenceTable::new(),
                closed: false,
            }),
        })
    }

    pub fn state(&self) -> RunState {
        self.state.lock().run
    }

    /// The target exposes its scripting runtime as a single thread.
    pub fn threads() -> JsonValue {
        json!({
            "threads": [Thread {
                id: THREAD_ID,
                name: THREAD_NAME.to_string(),
            }]
        })
    }

    // ---------------------------------------------------------------------
    // Target events
    // ---------------------------------------------------------------------

    /// Translate one target event, updating the session state. The returned
    /// events are in emission order.
    pub async fn on_event(self: &Arc<Self>, event: TargetEvent) -> Vec<DapEvent> {
        match event {
            TargetEvent::Ready => {
                let mut events = self
                    .settle(|state| {
                        if state.run == RunState::Launching {
                            state.run = RunState::Initialized;
                        }
                    })
                    .await;
                tracing::debug!(target: "modbridge.session", "debug hook ready");
                events.push(DapEvent::new("initialized", None));
                events
            }
            TargetEvent::Stopped {
                reason,
                thread_id,
                description,
            } => {
                if self.state.lock().closed {
                    return Vec::new();
                }
                let mut events = self
                    .settle(|state| {
                        state.run = RunState::Stopped;
                        state.invalidate();
                    })
                    .await;
                tracing::debug!(target: "modbridge.session", ?reason, "target stopped");
                let mut body = json!({
                    "reason": reason.as_dap_reason(),
                    "threadId": thread_id,
                    "allThreadsStopped": true,
                });
                if let Some(description) = description {
                    body["description"] = JsonValue::String(description);
                } else if reason == StopReason::Exception {
                    body["description"] = JsonValue::String("exception".to_string());
                }
                events.push(DapEvent::new("stopped", Some(body)));
                events
            }
            TargetEvent::Console { category, text } => {
                let category = category.unwrap_or_else(|| "console".to_string());
                vec![DapEvent::output(&category, ensure_newline(text))]
            }
            TargetEvent::Output { stream, text } => {
                let category = match stream {
                    OutputStream::Stdout => "stdout",
                    OutputStream::Stderr => "stderr",
                };
                vec![DapEvent::output(category, ensure_newline(text))]
            }
            TargetEvent::ProtocolError { message } => {
                tracing::warn!(target: "modbridge.session", %message, "control protocol error");
                vec![DapEvent::output(
                    "important",
                    format!("debug hook protocol error: {message}\n"),
                )]
            }
            TargetEvent::Terminating => {
                tracing::debug!(target: "modbridge.session", "target is shutting down");
                Vec::new()
            }
            TargetEvent::Closed { exit_code } => {
                let first = {
                    let mut state = self.state.lock();
                    let first = !state.closed;
                    state.closed = true;
                    state.run = RunState::Terminated;
                    state.invalidate();
                    first
                };
                if !first {
                    return Vec::new();
                }
                tracing::info!(target: "modbridge.session", ?exit_code, "target closed");
                let mut events = Vec::with_capacity(2);
                if let Some(code) = exit_code {
                    events.push(DapEvent::new("exited", Some(json!({ "exitCode": code }))));
                }
                events.push(DapEvent::new("terminated", None));
                events
            }
        }
    }

    /// Arm every deferred breakpoint request, then run `finish` under the same
    /// lock that observed the deferred set empty.
    async fn settle(self: &Arc<Self>, finish: impl FnOnce(&mut State) + Send) -> Vec<DapEvent> {
        let mut finish = Some(finish);
        let mut events = Vec::new();
        loop {
            let plans = {
                let mut state = self.state.lock();
                if !state.breakpoints.has_deferred() {
                    if let Some(finish) = finish.take() {
                        finish(&mut state);
                    }
                    return events;
                }
                state.breakpoints.take_deferred()
            };
            let pending: Vec<BreakpointsFuture> = plans
                .into_iter()
                .map(|plan| self.dispatch_plan(plan))
                .collect();
            for armed in pending {
                events.extend(armed.await.into_iter().map(DapEvent::breakpoint_changed));
            }
        }
    }

    fn dispatch_plan(self: &Arc<Self>, plan: BreakpointPlan) -> BreakpointsFuture {
        let this = Arc::clone(self);
        if plan.is_noop() {
            tracing::trace!(target: "modbridge.session", path = %plan.path, "breakpoints unchanged");
            return Box::pin(async move { this.state.lock().breakpoints.commit(plan, Ok(Vec::new())) });
        }
        let clear = (!plan.remove.is_empty())
            .then(|| self.target.clear_breakpoints(plan.remove.clone()));
        let arm = (!plan.add.is_empty())
            .then(|| self.target.arm_breakpoints(plan.path.clone(), plan.add.clone()));
        Box::pin(async move {
            if let Some(clear) = clear {
                if let Err(err) = clear.await {
                    tracing::warn!(
                        target: "modbridge.session",
                        path = %plan.path,
                        error = %err,
                        "failed to clear breakpoints"
                    );
                }
            }
            let armed: Result<Vec<ArmedBreakpointInfo>, String> = match arm {
                Some(arm) => arm.await.map_err(|err| err.to_string()),
                None => Ok(Vec::new()),
            };
            this.state.lock().breakpoints.commit(plan, armed)
        })
    }

    // ---------------------------------------------------------------------
    // Configuration and execution control
    // ---------------------------------------------------------------------

    pub fn set_breakpoints(
        self: &Arc<Self>,
        args: SetBreakpointsArguments,
    ) -> impl Future<Output = SessionResult<JsonValue>> + Send + 'static {
        let next = (|| -> SessionResult<Result<Vec<Breakpoint>, BreakpointsFuture>> {
            let path = args
                .source
                .path
                .clone()
                .ok_or_else(|| SessionError::InvalidArguments {
                    command: "setBreakpoints",
                    message: "source.path is required".to_string(),
                })?;
            let requested: Vec<BreakpointSpec> =
                args.requested().into_iter().map(to_spec).collect();

            let mut state = self.state.lock();
            let run = state.run;
            match run {
                RunState::Launching | RunState::Running => {
                    tracing::debug!(
                        target: "modbridge.session",
                        path = %path,
                        state = %run,
                        "deferring breakpoints until the target stops"
                    );
                    Ok(Ok(state.breakpoints.defer(&path, requested)))
                }
                RunState::Terminated => Err(SessionError::InvalidState {
                    command: "setBreakpoints",
                    state: run,
                }),
                RunState::Initialized | RunState::Configuring | RunState::Stopped => {
                    if run == RunState::Initialized {
                        state.run = RunState::Configuring;
                    }
                    let plan = state.breakpoints.plan(&path, requested);
                    drop(state);
                    Ok(Err(self.dispatch_plan(plan)))
                }
            }
        })();

        async move {
            let breakpoints = match next? {
                Ok(placeholders) => placeholders,
                Err(armed) => armed.await,
            };
            Ok(json!({ "breakpoints": breakpoints }))
        }
    }

    /// Let the target start running the program.
    pub fn configuration_done(
        self: &Arc<Self>,
    ) -> impl Future<Output = SessionResult<()>> + Send + 'static {
        let started = {
            let mut state = self.state.lock();
            state
                .require(
                    "configurationDone",
                    &[RunState::Initialized, RunState::Configuring],
                )
                .map(|generation| {
                    let previous = state.run;
                    state.run = RunState::Running;
                    (generation, previous, self.target.run(self.stop_on_entry))
                })
        };
        let this = Arc::clone(self);
        async move {
            let (generation, previous, run) = started?;
            run.await
                .map_err(|err| this.revert_resume(generation, previous, err))
        }
    }

    pub fn resume(self: &Arc<Self>) -> impl Future<Output = SessionResult<()>> + Send + 'static {
        self.resume_with("continue", |target| target.resume())
    }

    pub fn step(
        self: &Arc<Self>,
        command: &'static str,
        depth: StepDepth,
    ) -> impl Future<Output = SessionResult<()>> + Send + 'static {
        self.resume_with(command, move |target| target.step(depth))
    }

    /// Move to `running` before the command is sent so that a stop that
    /// arrives right after the acknowledgement is never overwritten, and drop
    /// every reference the client holds.
    fn resume_with(
        self: &Arc<Self>,
        command: &'static str,
        send: impl FnOnce(&dyn TargetControl) -> TargetFuture<()>,
    ) -> impl Future<Output = SessionResult<()>> + Send + 'static {
        let sent = {
            let mut state = self.state.lock();
            state.require_stopped(command).map(|_| {
                state.run = RunState::Running;
                state.invalidate();
                (state.generation, send(self.target.as_ref()))
            })
        };
        let this = Arc::clone(self);
        async move {
            let (generation, reply) = sent?;
            reply
                .await
                .map_err(|err| this.revert_resume(generation, RunState::Stopped, err))
        }
    }

    /// The target refused to resume: it is still where it was.
    fn revert_resume(&self, generation: u64, previous: RunState, err: WireError) -> SessionError {
        if matches!(err, WireError::Target(_)) {
            let mut state = self.state.lock();
            if state.run == RunState::Running && state.generation == generation {
                state.run = previous;
            }
        }
        SessionError::Target(err)
    }

    /// Ask the target to shut down. Resolves once the target acknowledged (or
    /// the channel is already gone).
    pub fn terminate(self: &Arc<Self>) -> impl Future<Output = SessionResult<()>> + Send + 'static {
        let request = {
            let state = self.state.lock();
            (!state.closed).then(|| self.target.terminate())
        };
        async move {
            match request {
                None => Ok(()),
                Some(request) => match request.await {
                    Ok(()) | Err(WireError::ChannelClosed) => Ok(()),
                    Err(err) => Err(err.into()),
                },
            }
        }
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    pub fn stack_trace(
        self: &Arc<Self>,
        args: StackTraceArguments,
    ) -> impl Future<Output = SessionResult<JsonValue>> + Send + 'static {
        let start = args.start_frame.unwrap_or(0);
        let levels = args.levels.filter(|levels| *levels > 0);
        let request = self
            .state
            .lock()
            .require_stopped("stackTrace")
            .map(|generation| {
                let fetch = levels.map(|levels| start.saturating_add(levels));
                (generation, self.target.stack_trace(fetch))
            });
        let this = Arc::clone(self);
        async move {
            let (generation, reply) = request?;
            let reply = reply.await?;
            let total = reply.total.unwrap_or(reply.frames.len() as u32);

            let mut state = this.state.lock();
            state.check_generation(generation)?;
            let frames: Vec<StackFrame> = reply
                .frames
                .into_iter()
                .skip(start as usize)
                .take(levels.map_or(usize::MAX, |levels| levels as usize))
                .map(|frame| {
                    // Report sources the way the client spelled them when it set
                    // breakpoints, so editors match frames to open documents.
                    let path = state
                        .breakpoints
                        .client_path(&frame.source)
                        .map_or(frame.source, str::to_string);
                    StackFrame {
                        id: state.references.insert(Reference::Frame { frame: frame.id }),
                        name: frame.name,
                        source: Some(Source {
                            name: file_name(&path),
                            path: Some(path),
                        }),
                        line: frame.line,
                        column: 1,
                    }
                })
                .collect();
            Ok(json!({ "stackFrames": frames, "totalFrames": total }))
        }
    }

    /// Always the four scopes, in fixed order. Nothing is fetched until a
    /// scope is expanded.
    pub fn scopes(&self, args: ScopesArguments) -> SessionResult<JsonValue> {
        let mut state = self.state.lock();
        state.require_stopped("scopes")?;
        let Reference::Frame { frame } = state.references.get(args.frame_id)? else {
            return Err(SessionError::NotAFrame(args.frame_id));
        };
        let scopes: Vec<Scope> = ScopeKind::ALL
            .iter()
            .map(|&kind| Scope {
                name: scope_name(kind).to_string(),
                variables_reference: state.references.insert(Reference::Scope {
                    frame,
                    kind,
                    handle: None,
                }),
                expensive: matches!(kind, ScopeKind::RuntimeGlobal | ScopeKind::HostGlobal),
                presentation_hint: (kind == ScopeKind::Locals).then(|| "locals".to_string()),
            })
            .collect();
        Ok(json!({ "scopes": scopes }))
    }

    fn container(
        &self,
        command: &'static str,
        reference: i64,
    ) -> SessionResult<(u64, HandleSource)> {
        let state = self.state.lock();
        let generation = state.require_stopped(command)?;
        let source = match state.references.get(reference)? {
            Reference::Container { handle }
            | Reference::Scope {
                handle: Some(handle),
                ..
            } => HandleSource::Known(handle),
            Reference::Scope {
                frame,
                kind,
                handle: None,
            } => HandleSource::Scope {
                id: reference,
                resolve: self.target.scope(frame, kind),
            },
            Reference::Frame { .. } => return Err(SessionError::NotAContainer(reference)),
        };
        Ok((generation, source))
    }

    async fn resolve(&self, generation: u64, source: HandleSource) -> SessionResult<TargetHandle> {
        match source {
            HandleSource::Known(handle) => Ok(handle),
            HandleSource::Scope { id, resolve } => {
                let handle = resolve.await?;
                let mut state = self.state.lock();
                state.check_generation(generation)?;
                state.references.resolve_scope(id, handle);
                Ok(handle)
            }
        }
    }

    fn to_variable(&self, references: &mut ReferenceTable, info: VariableInfo) -> Variable {
        let variables_reference = info
            .value
            .handle
            .map_or(0, |handle| references.insert(Reference::Container { handle }));
        if info.is_virtual {
            return Variable {
                name: info.name,
                value: info.value.value,
                type_: None,
                variables_reference,
                presentation_hint: Some(VariablePresentationHint {
                    kind: Some("virtual".to_string()),
                }),
            };
        }
        Variable {
            name: info.name,
            value: self.formatter.render(&info.value),
            type_: Some(info.value.type_name),
            variables_reference,
            presentation_hint: None,
        }
    }

    pub fn variables(
        self: &Arc<Self>,
        args: VariablesArguments,
    ) -> impl Future<Output = SessionResult<JsonValue>> + Send + 'static {
        let container = self.container("variables", args.variables_reference);
        let this = Arc::clone(self);
        async move {
            let (generation, source) = container?;
            let handle = this.resolve(generation, source).await?;
            let variables = this.target.variables(handle).await?;

            let mut state = this.state.lock();
            state.check_generation(generation)?;
            let variables: Vec<Variable> = variables
                .into_iter()
                .skip(args.start.unwrap_or(0))
                .take(args.count.filter(|count| *count > 0).unwrap_or(usize::MAX))
                .map(|info| this.to_variable(&mut state.references, info))
                .collect();
            Ok(json!({ "variables": variables }))
        }
    }

    /// Assign `args.value` (a literal in the target's syntax) and report the
    /// value the target actually stored.
    pub fn set_variable(
        self: &Arc<Self>,
        args: SetVariableArguments,
    ) -> impl Future<Output = SessionResult<JsonValue>> + Send + 'static {
        let container = self.container("setVariable", args.variables_reference);
        let this = Arc::clone(self);
        async move {
            let (generation, source) = container?;
            let handle = this.resolve(generation, source).await?;
            let value = this
                .target
                .set_variable(handle, args.name, args.value)
                .await?;

            let mut state = this.state.lock();
            state.check_generation(generation)?;
            let variables_reference = value
                .handle
                .map_or(0, |handle| state.references.insert(Reference::Container { handle }));
            let body = SetVariableResponseBody {
                value: this.formatter.render(&value),
                type_: Some(value.type_name),
                variables_reference,
            };
            Ok(serde_json::to_value(body).unwrap_or(JsonValue::Null))
        }
    }

    /// Evaluate in a stopped frame, or against the host-global namespace when
    /// no frame is given.
    pub fn evaluate(
        self: &Arc<Self>,
        args: EvaluateArguments,
    ) -> impl Future<Output = SessionResult<JsonValue>> + Send + 'static {
        let context = EvalContext::from_dap_context(args.context.as_deref());
        let request = (|| {
            let state = self.state.lock();
            if state.run == RunState::Terminated {
                return Err(SessionError::InvalidState {
                    command: "evaluate",
                    state: state.run,
                });
            }
            let frame = match args.frame_id {
                Some(id) => match state.references.get(id)? {
                    Reference::Frame { frame } => Some(frame),
                    _ => return Err(SessionError::NotAFrame(id)),
                },
                None => None,
            };
            let started = Instant::now();
            Ok((
                state.generation,
                started,
                self.target.evaluate(frame, args.expression),
            ))
        })();
        let this = Arc::clone(self);
        async move {
            let (generation, started, reply) = request?;
            let reply = reply.await?;
            let measured = duration_ms(started.elapsed());

            let variables_reference = {
                let mut state = this.state.lock();
                match reply.value.handle {
                    Some(handle) if state.check_generation(generation).is_ok() => {
                        state.references.insert(Reference::Container { handle })
                    }
                    _ => 0,
                }
            };
            let rendered = this.formatter.render(&reply.value);
            let result = context.present(rendered, reply.elapsed_ms.unwrap_or(measured));
            let body = EvaluateResult {
                result,
                type_: Some(reply.value.type_name),
                variables_reference,
            };
            Ok(serde_json::to_value(body).unwrap_or(JsonValue::Null))
        }
    }
}

fn ensure_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}
