use std::{collections::VecDeque, future::Future, net::SocketAddr, pin::Pin, time::Duration};

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};

use modbridge_process::{exit_code, TargetProcess};

use super::{
    codec::{decode_line, encode_command, Decoded, Line, LineCodec, DEFAULT_MAX_LINE_BYTES},
    types::{
        ArmBreakpointsReply, ArmedBreakpointInfo, BreakpointSpec, Command, EvaluateReply,
        OutputStream, Result, ScopeKind, ScopeReply, StackTraceReply, StepDepth, TargetBreakpointId,
        TargetEvent, TargetFrame, TargetFrameId, TargetHandle, Value, VariableInfo,
        VariablesReply, WireError,
    },
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type ReplyResult = Result<Option<serde_json::Value>>;

/// Boxed `'static` future returned by [`TargetControl`] methods.
pub type TargetFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// The capabilities the adapter needs from a debug target.
///
/// Every method enqueues its command synchronously, before the returned future
/// is first polled, so callers that issue commands one after another observe
/// them on the channel in the same order.
pub trait TargetControl: Send + Sync {
    fn run(&self, stop_on_entry: bool) -> TargetFuture<()>;
    fn resume(&self) -> TargetFuture<()>;
    fn step(&self, depth: StepDepth) -> TargetFuture<()>;
    fn arm_breakpoints(
        &self,
        source: String,
        breakpoints: Vec<BreakpointSpec>,
    ) -> TargetFuture<Vec<ArmedBreakpointInfo>>;
    fn clear_breakpoints(&self, ids: Vec<TargetBreakpointId>) -> TargetFuture<()>;
    fn stack_trace(&self, levels: Option<u32>) -> TargetFuture<StackTraceReply>;
    fn scope(&self, frame: TargetFrameId, kind: ScopeKind) -> TargetFuture<TargetHandle>;
    fn variables(&self, handle: TargetHandle) -> TargetFuture<Vec<VariableInfo>>;
    fn set_variable(
        &self,
        container: TargetHandle,
        name: String,
        value: String,
    ) -> TargetFuture<Value>;
    fn evaluate(&self, frame: Option<TargetFrameId>, expression: String)
        -> TargetFuture<EvaluateReply>;
    fn terminate(&self) -> TargetFuture<()>;
}

/// The byte streams behind a control channel.
pub struct TargetChannel {
    reader: BoxedReader,
    writer: BoxedWriter,
    stderr: Option<BoxedReader>,
    process: Option<TargetProcess>,
}

impl std::fmt::Debug for TargetChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetChannel")
            .field("process", &self.process)
            .field("stderr", &self.stderr.is_some())
            .finish_non_exhaustive()
    }
}

impl TargetChannel {
    /// Use a spawned target's stdio as the control channel.
    pub fn from_process(mut process: TargetProcess) -> Result<Self> {
        let missing =
            |name: &str| WireError::Io(std::io::Error::other(format!("target {name} is not piped")));
        let reader = process.stdout.take().ok_or_else(|| missing("stdout"))?;
        let writer = process.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stderr = process.stderr.take();
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            stderr: stderr.map(|stderr| Box::new(stderr) as BoxedReader),
            process: Some(process),
        })
    }

    /// Connect to a target that exposes the control channel on a TCP socket.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Ok(Self::from_io(reader, writer))
    }

    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            stderr: None,
            process: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(TargetProcess::id)
    }
}

#[derive(Debug, Clone)]
pub struct TargetClientConfig {
    /// Longest stdout/stderr line kept intact; longer ones are chunked as output.
    pub max_line_bytes: usize,
    /// How long a process gets to exit after its stdout closed before it is killed.
    pub exit_grace: Duration,
}

impl Default for TargetClientConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            exit_grace: Duration::from_secs(2),
        }
    }
}

enum Message {
    Submit {
        command: Command,
        reply: oneshot::Sender<ReplyResult>,
    },
    Kill {
        grace: Duration,
    },
}

/// Single-flight command client for the control channel.
///
/// The protocol carries no correlation ids: replies arrive strictly in command
/// order. The client therefore keeps exactly one command on the wire and
/// queues the rest in submission order.
#[derive(Clone)]
pub struct TargetClient {
    tx: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
    pid: Option<u32>,
}

impl std::fmt::Debug for TargetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetClient")
            .field("pid", &self.pid)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl TargetClient {
    /// Start the channel actor.
    ///
    /// The returned receiver yields out-of-band [`TargetEvent`]s and ends with
    /// exactly one [`TargetEvent::Closed`].
    pub fn start(
        channel: TargetChannel,
        config: TargetClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TargetEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let pid = channel.pid();

        let TargetChannel {
            reader,
            writer,
            stderr,
            process,
        } = channel;

        let actor = Actor {
            writer,
            writer_broken: false,
            in_flight: None,
            queue: VecDeque::new(),
            events: events_tx,
            process,
            exit_status: None,
            exit_grace: config.exit_grace,
            max_line_bytes: config.max_line_bytes,
        };
        let stdout = FramedRead::new(reader, LineCodec::control(config.max_line_bytes));
        let stderr = stderr.map(|stderr| FramedRead::new(stderr, LineCodec::new(config.max_line_bytes)));
        tokio::spawn(actor.run(stdout, stderr, rx, closed.clone()));

        (Self { tx, closed, pid }, events_rx)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// A token that is cancelled once the channel has closed and every
    /// outstanding command has been failed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Enqueue `command` now; the returned future resolves with the reply body.
    pub fn submit(&self, command: Command) -> impl Future<Output = ReplyResult> + Send + 'static {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .tx
            .send(Message::Submit {
                command,
                reply: reply_tx,
            })
            .is_ok();

        async move {
            if !sent {
                return Err(WireError::ChannelClosed);
            }
            reply_rx.await.unwrap_or_else(|_| Err(WireError::ChannelClosed))
        }
    }

    /// Force the target down: terminate the process tree (after `grace`) or,
    /// for socket channels, drop the connection.
    pub fn kill(&self, grace: Duration) {
        let _ = self.tx.send(Message::Kill { grace });
    }

    fn request<T>(&self, command: Command) -> TargetFuture<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let name = command.name();
        let reply = self.submit(command);
        Box::pin(async move {
            let body = reply.await?.unwrap_or(serde_json::Value::Null);
            serde_json::from_value(body).map_err(|source| WireError::Body {
                command: name,
                source,
            })
        })
    }

    fn request_unit(&self, command: Command) -> TargetFuture<()> {
        let reply = self.submit(command);
        Box::pin(async move { reply.await.map(|_| ()) })
    }
}

impl TargetControl for TargetClient {
    fn run(&self, stop_on_entry: bool) -> TargetFuture<()> {
        self.request_unit(Command::Run { stop_on_entry })
    }

    fn resume(&self) -> TargetFuture<()> {
        self.request_unit(Command::Continue)
    }

    fn step(&self, depth: StepDepth) -> TargetFuture<()> {
        self.request_unit(Command::Step { depth })
    }

    fn arm_breakpoints(
        &self,
        source: String,
        breakpoints: Vec<BreakpointSpec>,
    ) -> TargetFuture<Vec<ArmedBreakpointInfo>> {
        let reply = self.request::<ArmBreakpointsReply>(Command::ArmBreakpoints {
            source,
            breakpoints,
        });
        Box::pin(async move { Ok(reply.await?.breakpoints) })
    }

    fn clear_breakpoints(&self, ids: Vec<TargetBreakpointId>) -> TargetFuture<()> {
        self.request_unit(Command::ClearBreakpoints { ids })
    }

    fn stack_trace(&self, levels: Option<u32>) -> TargetFuture<StackTraceReply> {
        self.request(Command::StackTrace { levels })
    }

    fn scope(&self, frame: TargetFrameId, kind: ScopeKind) -> TargetFuture<TargetHandle> {
        let reply = self.request::<ScopeReply>(Command::Scope { frame, kind });
        Box::pin(async move { Ok(reply.await?.handle) })
    }

    fn variables(&self, handle: TargetHandle) -> TargetFuture<Vec<VariableInfo>> {
        let reply = self.request::<VariablesReply>(Command::Variables { handle });
        Box::pin(async move { Ok(reply.await?.variables) })
    }

    fn set_variable(
        &self,
        container: TargetHandle,
        name: String,
        value: String,
    ) -> TargetFuture<Value> {
        self.request(Command::SetVariable {
            container,
            name,
            value,
        })
    }

    fn evaluate(
        &self,
        frame: Option<TargetFrameId>,
        expression: String,
    ) -> TargetFuture<EvaluateReply> {
        self.request(Command::Evaluate { frame, expression })
    }

    fn terminate(&self) -> TargetFuture<()> {
        self.request_unit(Command::Terminate)
    }
}

struct Pending {
    command: Command,
    reply: oneshot::Sender<ReplyResult>,
}

struct InFlight {
    name: &'static str,
    reply: oneshot::Sender<ReplyResult>,
}

struct Actor {
    writer: BoxedWriter,
    writer_broken: bool,
    in_flight: Option<InFlight>,
    queue: VecDeque<Pending>,
    events: mpsc::UnboundedSender<TargetEvent>,
    process: Option<TargetProcess>,
    exit_status: Option<std::process::ExitStatus>,
    exit_grace: Duration,
    max_line_bytes: usize,
}

async fn next_line(
    stream: &mut Option<FramedRead<BoxedReader, LineCodec>>,
) -> Option<std::io::Result<Line>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(
        mut self,
        mut stdout: FramedRead<BoxedReader, LineCodec>,
        mut stderr: Option<FramedRead<BoxedReader, LineCodec>>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        closed: CancellationToken,
    ) {
        let mut rx_open = true;
        loop {
            tokio::select! {
                line = stdout.next() => match line {
                    Some(Ok(line)) => self.handle_line(line).await,
                    Some(Err(err)) => {
                        tracing::warn!(target: "modbridge.wire", error = %err, "control channel read failed");
                        break;
                    }
                    None => break,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(Ok(Line::Complete(text) | Line::Partial(text))) => {
                        self.emit(TargetEvent::Output { stream: OutputStream::Stderr, text });
                    }
                    // stderr is read with an output codec, which never yields these.
                    Some(Ok(Line::Oversized { .. })) => {}
                    Some(Err(_)) | None => stderr = None,
                },
                msg = rx.recv(), if rx_open => match msg {
                    Some(Message::Submit { command, reply }) => {
                        self.queue.push_back(Pending { command, reply });
                        self.dispatch().await;
                    }
                    Some(Message::Kill { grace }) => {
                        if !self.kill(grace).await {
                            break;
                        }
                    }
                    None => rx_open = false,
                },
            }
        }

        let exit_code = self.reap().await;

        if let Some(in_flight) = self.in_flight.take() {
            tracing::debug!(target: "modbridge.wire", command = in_flight.name, "failing in-flight command; channel closed");
            let _ = in_flight.reply.send(Err(WireError::ChannelClosed));
        }
        for pending in self.queue.drain(..) {
            let _ = pending.reply.send(Err(WireError::ChannelClosed));
        }

        // Anything still buffered in `rx` fails when the receiver is dropped.
        rx.close();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Submit { reply, .. } = msg {
                let _ = reply.send(Err(WireError::ChannelClosed));
            }
        }

        tracing::debug!(target: "modbridge.wire", ?exit_code, "control channel closed");
        self.emit(TargetEvent::Closed { exit_code });
        closed.cancel();
    }

    fn emit(&self, event: TargetEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_line(&mut self, line: Line) {
        for decoded in decode_line(&line) {
            match decoded {
                Decoded::Output(text) => self.emit(TargetEvent::Output {
                    stream: OutputStream::Stdout,
                    text,
                }),
                Decoded::Malformed { line, error } => {
                    tracing::warn!(target: "modbridge.wire", %error, %line, "malformed control frame");
                    self.emit(TargetEvent::ProtocolError {
                        message: format!("malformed control frame ({error}): {line}"),
                    });
                }
                Decoded::Frame(frame) => self.handle_frame(frame).await,
                Decoded::Oversized { kind, len } => self.handle_oversized(kind, len).await,
            }
        }
    }

    /// A frame too long to read. When it may have been the reply, the
    /// command in flight fails so the queue keeps moving.
    async fn handle_oversized(&mut self, kind: Option<String>, len: usize) {
        let limit = self.max_line_bytes;
        tracing::warn!(target: "modbridge.wire", kind = kind.as_deref(), len, limit, "oversized control frame");
        self.emit(TargetEvent::ProtocolError {
            message: format!(
                "dropped a {} control frame of {len} bytes; the limit is {limit}",
                kind.as_deref().unwrap_or("truncated"),
            ),
        });
        if kind.as_deref().is_some_and(|kind| kind != "reply") {
            return;
        }
        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight.reply.send(Err(WireError::Oversized {
                command: in_flight.name,
                limit,
            }));
            self.dispatch().await;
        }
    }

    async fn handle_frame(&mut self, frame: TargetFrame) {
        match frame {
            TargetFrame::Reply { ok, body, error } => {
                let Some(in_flight) = self.in_flight.take() else {
                    tracing::warn!(target: "modbridge.wire", ok, "reply with no command in flight");
                    self.emit(TargetEvent::ProtocolError {
                        message: "received a reply with no command in flight".to_string(),
                    });
                    return;
                };
                tracing::trace!(target: "modbridge.wire", command = in_flight.name, ok, "reply");
                let result = if ok {
                    Ok(body)
                } else {
                    Err(WireError::Target(
                        error.unwrap_or_else(|| format!("`{}` failed", in_flight.name)),
                    ))
                };
                let _ = in_flight.reply.send(result);
                self.dispatch().await;
            }
            TargetFrame::Ready => self.emit(TargetEvent::Ready),
            TargetFrame::Stopped {
                reason,
                thread_id,
                description,
            } => self.emit(TargetEvent::Stopped {
                reason,
                thread_id,
                description,
            }),
            TargetFrame::Output { category, text } => {
                self.emit(TargetEvent::Console { category, text })
            }
            TargetFrame::Terminating => self.emit(TargetEvent::Terminating),
        }
    }

    /// Put the next queued command on the wire if nothing is in flight.
    async fn dispatch(&mut self) {
        while self.in_flight.is_none() {
            let Some(Pending { command, reply }) = self.queue.pop_front() else {
                return;
            };
            if self.writer_broken {
                let _ = reply.send(Err(WireError::ChannelClosed));
                continue;
            }

            let bytes = match encode_command(&command) {
                Ok(bytes) => bytes,
                Err(err) => {
                    let _ = reply.send(Err(err));
                    continue;
                }
            };

            tracing::trace!(target: "modbridge.wire", command = command.name(), "send");
            let written = async {
                self.writer.write_all(&bytes).await?;
                self.writer.flush().await
            }
            .await;
            match written {
                Ok(()) => {
                    self.in_flight = Some(InFlight {
                        name: command.name(),
                        reply,
                    });
                }
                Err(err) => {
                    tracing::warn!(target: "modbridge.wire", error = %err, command = command.name(), "control channel write failed");
                    self.writer_broken = true;
                    let _ = reply.send(Err(WireError::Io(err)));
                }
            }
        }
    }

    /// Returns `false` when the channel should be treated as closed right away.
    async fn kill(&mut self, grace: Duration) -> bool {
        let Some(process) = self.process.as_mut() else {
            tracing::debug!(target: "modbridge.wire", "dropping socket channel");
            return false;
        };
        match process.terminate(grace).await {
            Ok(status) => {
                tracing::debug!(target: "modbridge.wire", %status, "target terminated");
                self.exit_status = Some(status);
            }
            Err(err) => {
                tracing::warn!(target: "modbridge.wire", error = %err, "failed to terminate target");
            }
        }
        true
    }

    async fn reap(&mut self) -> Option<i32> {
        if let Some(status) = self.exit_status {
            return Some(exit_code(&status));
        }
        let process = self.process.as_mut()?;
        let status = match tokio::time::timeout(self.exit_grace, process.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::debug!(target: "modbridge.wire", "target closed its output but kept running; terminating");
                process.terminate(self.exit_grace).await
            }
        };
        match status {
            Ok(status) => Some(exit_code(&status)),
            Err(err) => {
                tracing::warn!(target: "modbridge.wire", error = %err, "failed to reap target");
                None
            }
        }
    }
}
