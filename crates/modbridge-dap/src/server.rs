//! The DAP server loop.
//!
//! Requests are read one at a time. Each session method performs its state
//! transition and enqueues its target command before the next request is
//! read; completion runs on a spawned task, so a slow `variables` or
//! `evaluate` never holds up the client. Responses and events share one
//! outgoing queue whose writer assigns sequence numbers.

use std::{future::Future, sync::Arc, time::Duration};

use modbridge_config::BridgeConfig;
use modbridge_process::spawn_detached;
use modbridge_wire::wire::{
    StepDepth, TargetChannel, TargetClient, TargetClientConfig, TargetEvent, WireError,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
};

use crate::{
    dap::{
        codec::{DapError, DapReader, DapWriter},
        messages::{make_event, make_response, Request},
        types::{
            AttachArguments, DisconnectArguments, EvaluateArguments, ScopesArguments,
            SetBreakpointsArguments, SetVariableArguments, StackTraceArguments,
            VariablesArguments,
        },
    },
    error::{SessionError, SessionResult},
    launch::{self, LaunchArguments, LaunchError},
    session::{Session, SessionOptions},
};

/// Extra time allowed for the control channel to report closure after a
/// target has been killed.
const CLOSE_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Dap(#[from] DapError),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Run the adapter over stdio.
pub async fn run_stdio(config: BridgeConfig) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    run(stdin, stdout, config).await.map_err(anyhow::Error::from)
}

/// Serve one client until it disconnects or its input ends.
pub async fn run<R, W>(reader: R, writer: W, config: BridgeConfig) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer_task = spawn_writer(writer, out_rx);

    let mut server = Server {
        config,
        outbox: Outbox { tx: out_tx },
        target: None,
    };
    let mut reader = DapReader::new(reader);

    let result = loop {
        let request = match reader.read_request().await {
            Ok(Some(request)) => request,
            Ok(None) => break Ok(()),
            Err(err) => break Err(ServerError::from(err)),
        };
        if request.message_type != "request" {
            continue;
        }
        if server.handle(request).await == Flow::Stop {
            break Ok(());
        }
    };

    if let Err(err) = &result {
        tracing::warn!(target: "modbridge.dap", error = %err, "client stream failed");
    }
    server.shutdown().await;
    drop(server);
    let _ = writer_task.await;
    result
}

enum Outgoing {
    Response {
        request_seq: i64,
        command: String,
        outcome: std::result::Result<Option<Value>, String>,
    },
    Event {
        event: String,
        body: Option<Value>,
    },
}

#[derive(Clone)]
struct Outbox {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    fn respond(&self, request: &Request, outcome: SessionResult<Option<Value>>) {
        let outcome = outcome.map_err(|err| {
            tracing::debug!(
                target: "modbridge.dap",
                command = %request.command,
                seq = request.seq,
                error = %err,
                "request failed"
            );
            err.to_string()
        });
        let _ = self.tx.send(Outgoing::Response {
            request_seq: request.seq,
            command: request.command.clone(),
            outcome,
        });
    }

    fn event(&self, event: impl Into<String>, body: Option<Value>) {
        let _ = self.tx.send(Outgoing::Event {
            event: event.into(),
            body,
        });
    }
}

fn spawn_writer<W>(writer: W, mut rx: mpsc::UnboundedReceiver<Outgoing>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut writer = DapWriter::new(writer);
        let mut seq: i64 = 1;
        while let Some(message) = rx.recv().await {
            let written = match message {
                Outgoing::Response {
                    request_seq,
                    command,
                    outcome,
                } => {
                    writer
                        .write_message(&make_response(seq, request_seq, &command, outcome))
                        .await
                }
                Outgoing::Event { event, body } => {
                    writer.write_message(&make_event(seq, event, body)).await
                }
            };
            seq += 1;
            if let Err(err) = written {
                tracing::warn!(target: "modbridge.dap", error = %err, "failed to write to client");
                break;
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// A freshly opened control channel, not yet announced to the client.
struct Connected {
    session: Arc<Session>,
    client: TargetClient,
    events: mpsc::UnboundedReceiver<TargetEvent>,
    launched: bool,
    name: String,
}

struct Target {
    session: Arc<Session>,
    client: TargetClient,
    launched: bool,
    pump: JoinHandle<()>,
}

struct Server {
    config: BridgeConfig,
    outbox: Outbox,
    target: Option<Target>,
}

fn capabilities() -> Value {
    json!({
        "supportsConfigurationDoneRequest": true,
        "supportsSetVariable": true,
        "supportsConditionalBreakpoints": true,
        "supportsHitConditionalBreakpoints": true,
        "supportsLogPoints": true,
        "supportsTerminateRequest": true,
        "supportsEvaluateForHovers": true,
        "supportsDelayedStackTraceLoading": true,
        "supportsStepBack": false,
        "supportsRestartRequest": false,
    })
}

/// Decode `request.arguments`; a missing object counts as `{}`.
fn arguments<T: DeserializeOwned>(request: &Request, command: &'static str) -> SessionResult<T> {
    let value = match &request.arguments {
        Value::Null => json!({}),
        other => other.clone(),
    };
    serde_json::from_value(value).map_err(|err| SessionError::invalid_arguments(command, err))
}

impl Server {
    fn client_config(&self) -> TargetClientConfig {
        TargetClientConfig {
            max_line_bytes: self.config.adapter.max_output_line_bytes,
            exit_grace: self.config.adapter.kill_grace(),
        }
    }

    /// Respond once `pending` completes, without blocking the request loop.
    fn reply<F>(&self, request: Request, pending: SessionResult<F>)
    where
        F: Future<Output = SessionResult<Option<Value>>> + Send + 'static,
    {
        match pending {
            Ok(pending) => {
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    let outcome = pending.await;
                    outbox.respond(&request, outcome);
                });
            }
            Err(err) => self.outbox.respond(&request, Err(err)),
        }
    }

    async fn handle(&mut self, request: Request) -> Flow {
        tracing::debug!(
            target: "modbridge.dap",
            seq = request.seq,
            command = %request.command,
            "request"
        );

        match request.command.as_str() {
            "initialize" => self.outbox.respond(&request, Ok(Some(capabilities()))),
            "launch" => {
                let connected = self.launch(&request).await;
                self.announce(&request, connected, "launch");
            }
            "attach" => {
                let connected = self.attach(&request).await;
                self.announce(&request, connected, "attach");
            }
            "threads" => self.outbox.respond(&request, Ok(Some(Session::threads()))),
            "disconnect" => {
                self.disconnect(&request).await;
                return Flow::Stop;
            }
            _ => self.handle_session_request(request),
        }
        Flow::Continue
    }

    fn handle_session_request(&self, request: Request) {
        let Some(target) = &self.target else {
            let err = SessionError::NoTarget(request.command.clone());
            self.outbox.respond(&request, Err(err));
            return;
        };
        let session = &target.session;

        match request.command.as_str() {
            "setBreakpoints" => {
                let pending = arguments::<SetBreakpointsArguments>(&request, "setBreakpoints")
                    .map(|args| with_body(session.set_breakpoints(args)));
                self.reply(request, pending);
            }
            "configurationDone" => {
                let pending = session.configuration_done();
                self.reply(request, Ok(without_body(pending)));
            }
            "continue" => {
                let pending = session.resume();
                self.reply(
                    request,
                    Ok(async move {
                        pending.await?;
                        Ok::<_, SessionError>(Some(json!({ "allThreadsContinued": true })))
                    }),
                );
            }
            // Some clients still send the pre-1.0 name.
            "next" | "stepOver" => {
                let pending = session.step("next", StepDepth::Over);
                self.reply(request, Ok(without_body(pending)));
            }
            "stepIn" => {
                let pending = session.step("stepIn", StepDepth::In);
                self.reply(request, Ok(without_body(pending)));
            }
            "stepOut" => {
                let pending = session.step("stepOut", StepDepth::Out);
                self.reply(request, Ok(without_body(pending)));
            }
            "stackTrace" => {
                let pending = arguments::<StackTraceArguments>(&request, "stackTrace")
                    .map(|args| with_body(session.stack_trace(args)));
                self.reply(request, pending);
            }
            "scopes" => {
                let outcome = arguments::<ScopesArguments>(&request, "scopes")
                    .and_then(|args| session.scopes(args))
                    .map(Some);
                self.outbox.respond(&request, outcome);
            }
            "variables" => {
                let pending = arguments::<VariablesArguments>(&request, "variables")
                    .map(|args| with_body(session.variables(args)));
                self.reply(request, pending);
            }
            "setVariable" => {
                let pending = arguments::<SetVariableArguments>(&request, "setVariable")
                    .map(|args| with_body(session.set_variable(args)));
                self.reply(request, pending);
            }
            "evaluate" => {
                let pending = arguments::<EvaluateArguments>(&request, "evaluate")
                    .map(|args| with_body(session.evaluate(args)));
                self.reply(request, pending);
            }
            "terminate" => {
                let pending = session.terminate();
                let client = target.client.clone();
                let grace = self.config.adapter.kill_grace();
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    let outcome = pending.await;
                    let acknowledged = outcome.is_ok();
                    outbox.respond(&request, outcome.map(|()| None));
                    if acknowledged {
                        escalate(&client, grace).await;
                    }
                });
            }
            other => {
                let err = SessionError::Unsupported(other.to_string());
                self.outbox.respond(&request, Err(err));
            }
        }
    }

    fn ensure_no_target(&self, command: &'static str) -> SessionResult<()> {
        match &self.target {
            Some(target) => Err(SessionError::InvalidState {
                command,
                state: target.session.state(),
            }),
            None => Ok(()),
        }
    }

    async fn launch(&self, request: &Request) -> SessionResult<Connected> {
        self.ensure_no_target("launch")?;
        let arguments: LaunchArguments = arguments(request, "launch")?;
        let plan = launch::prepare(arguments, &self.config.adapter).await?;

        let name = plan.command.display_name();
        let process = spawn_detached(&plan.command).map_err(|source| LaunchError::Spawn {
            program: name.clone(),
            source,
        })?;
        tracing::info!(target: "modbridge.dap", pid = ?process.id(), program = %name, "target spawned");

        let channel = TargetChannel::from_process(process)?;
        Ok(self.connect(channel, plan.stop_on_entry, true, name))
    }

    async fn attach(&self, request: &Request) -> SessionResult<Connected> {
        self.ensure_no_target("attach")?;
        let arguments: AttachArguments = arguments(request, "attach")?;
        let host = arguments.host.as_deref().unwrap_or("127.0.0.1");

        let addr = tokio::net::lookup_host((host, arguments.port))
            .await
            .map_err(WireError::Io)?
            .next()
            .ok_or_else(|| SessionError::InvalidArguments {
                command: "attach",
                message: format!("could not resolve {host}"),
            })?;
        let channel = TargetChannel::connect(addr).await?;
        tracing::info!(target: "modbridge.dap", %addr, "attached to target");

        Ok(self.connect(channel, arguments.stop_on_entry, false, addr.to_string()))
    }

    fn connect(
        &self,
        channel: TargetChannel,
        stop_on_entry: bool,
        launched: bool,
        name: String,
    ) -> Connected {
        let (client, events) = TargetClient::start(channel, self.client_config());
        let session = Session::new(
            Arc::new(client.clone()),
            SessionOptions {
                stop_on_entry,
                max_string_len: self.config.adapter.max_string_len,
            },
        );
        Connected {
            session,
            client,
            events,
            launched,
            name,
        }
    }

    /// Answer `launch`/`attach`, then start forwarding target events. The
    /// response always precedes `process` and `initialized`.
    fn announce(
        &mut self,
        request: &Request,
        connected: SessionResult<Connected>,
        start_method: &str,
    ) {
        let connected = match connected {
            Ok(connected) => connected,
            Err(err) => {
                self.outbox.respond(request, Err(err));
                return;
            }
        };
        self.outbox.respond(request, Ok(None));

        let mut process = json!({
            "name": connected.name,
            "isLocalProcess": connected.launched,
            "startMethod": start_method,
        });
        if let Some(pid) = connected.client.pid() {
            process["systemProcessId"] = json!(pid);
        }
        self.outbox.event("process", Some(process));

        let Connected {
            session,
            client,
            mut events,
            launched,
            ..
        } = connected;
        let outbox = self.outbox.clone();
        let pump_session = Arc::clone(&session);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closed = matches!(event, TargetEvent::Closed { .. });
                for event in pump_session.on_event(event).await {
                    outbox.event(event.event, event.body);
                }
                if closed {
                    break;
                }
            }
        });

        self.target = Some(Target {
            session,
            client,
            launched,
            pump,
        });
    }

    async fn disconnect(&mut self, request: &Request) {
        let arguments: DisconnectArguments = match arguments(request, "disconnect") {
            Ok(arguments) => arguments,
            Err(err) => {
                self.outbox.respond(request, Err(err));
                return;
            }
        };
        if let Some(target) = &self.target {
            let terminate = arguments.terminate_debuggee.unwrap_or(target.launched);
            if terminate {
                let grace = self.config.adapter.kill_grace();
                match tokio::time::timeout(grace, target.session.terminate()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::debug!(target: "modbridge.dap", error = %err, "terminate failed during disconnect")
                    }
                    Err(_) => {
                        tracing::debug!(target: "modbridge.dap", "terminate timed out during disconnect")
                    }
                }
            }
        }
        self.shutdown().await;
        self.outbox.respond(request, Ok(None));
    }

    /// Bring the target down (or detach from it) and flush its final events.
    async fn shutdown(&mut self) {
        let Some(target) = self.target.take() else {
            return;
        };
        let grace = if target.launched {
            self.config.adapter.kill_grace()
        } else {
            Duration::ZERO
        };

        let closed = target.client.closed_token();
        if !closed.is_cancelled() {
            target.client.kill(grace);
            if tokio::time::timeout(grace + CLOSE_SLACK, closed.cancelled())
                .await
                .is_err()
            {
                tracing::warn!(target: "modbridge.dap", "target did not close after kill");
            }
        }

        let mut pump = target.pump;
        if tokio::time::timeout(CLOSE_SLACK, &mut pump).await.is_err() {
            pump.abort();
        }
    }
}

/// Give a target that acknowledged `terminate` `grace` to close on its own
/// before forcing it down.
async fn escalate(client: &TargetClient, grace: Duration) {
    let closed = client.closed_token();
    if tokio::time::timeout(grace, closed.cancelled()).await.is_err() {
        tracing::info!(target: "modbridge.dap", "target still running after terminate; killing it");
        client.kill(grace);
    }
}

fn with_body(
    pending: impl Future<Output = SessionResult<Value>> + Send + 'static,
) -> impl Future<Output = SessionResult<Option<Value>>> + Send + 'static {
    async move { pending.await.map(Some) }
}

fn without_body(
    pending: impl Future<Output = SessionResult<()>> + Send + 'static,
) -> impl Future<Output = SessionResult<Option<Value>>> + Send + 'static {
    async move { pending.await.map(|()| None) }
}
