//! A scripted stand-in for the in-process debug hook.
//!
//! It runs one fixed scenario script (an `on_tick` handler calling a helper)
//! and speaks the target side of the control protocol, so the adapter can be
//! exercised end-to-end without the real host application.
//!
//! ```lua
//! script.on_event(defines.events.on_tick, function()
//!   local foo = true
//!   count_tick(foo)
//! end)
//!
//! function count_tick(flag)
//!   global.ticks = (global.ticks or 0) + 1
//! end
//! ```

use std::{fmt::Write as _, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    time::Instant,
};

use crate::source::normalize_source_path;

use super::{
    codec::{decode_command, encode_frame},
    types::{
        ArmBreakpointsReply, ArmedBreakpointInfo, BreakpointSpec, Command, EvaluateReply,
        FrameInfo, ScopeKind, ScopeReply, StackTraceReply, StepDepth, StopReason, TargetFrame,
        Value, VariableInfo, VariablesReply,
    },
};

/// Text of the scenario script the mock pretends to execute.
pub const CONTROL_LUA: &str = "script.on_event(defines.events.on_tick, function()
  local foo = true
  count_tick(foo)
end)

function count_tick(flag)
  global.ticks = (global.ticks or 0) + 1
end
";

/// Lines of [`CONTROL_LUA`] that hold executable statements.
pub const EXECUTABLE_LINES: [u32; 3] = [2, 3, 7];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockScenario {
    /// Ticks forever.
    Run,
    /// Runs a few ticks, then shuts down on its own.
    Terminate,
}

impl MockScenario {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "run" => Some(Self::Run),
            "terminate" => Some(Self::Terminate),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Terminate => "terminate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockRuntimeConfig {
    /// Path reported for the scenario script in stack frames.
    pub script_path: String,
    pub scenario: MockScenario,
    pub tick_interval: Duration,
    pub max_ticks: Option<u64>,
    /// When `false` the runtime never announces `ready` and ignores commands,
    /// as if the debug hook mod were not loaded.
    pub hook_enabled: bool,
}

impl MockRuntimeConfig {
    pub fn new(script_path: impl Into<String>, scenario: MockScenario) -> Self {
        Self {
            script_path: script_path.into(),
            scenario,
            tick_interval: Duration::from_millis(10),
            max_ticks: match scenario {
                MockScenario::Run => None,
                MockScenario::Terminate => Some(3),
            },
            hook_enabled: true,
        }
    }
}

pub struct MockRuntime {
    config: MockRuntimeConfig,
}

impl MockRuntime {
    pub fn new(config: MockRuntimeConfig) -> Self {
        Self { config }
    }

    /// Serve one adapter: read commands from `commands`, write frames and
    /// program output to `output`. Returns once the scenario ends, the adapter
    /// sends `terminate`, or the command stream closes.
    pub async fn serve<R, W>(self, commands: R, output: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let vm = Vm::new(&self.config.script_path);
        let mut hook = Hook {
            lines: BufReader::new(commands).lines(),
            out: output,
            vm,
            breakpoints: Vec::new(),
            next_breakpoint_id: 1,
            config: self.config,
        };
        hook.run().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Terminate,
}

enum Resume {
    Continue,
    Step(StepDepth),
    Terminate,
}

#[derive(Debug, Clone, Copy)]
struct PendingStep {
    /// `None` stops at the very first statement (stop on entry).
    depth: Option<StepDepth>,
    frames: usize,
    tick: u64,
}

#[derive(Debug, Clone)]
struct MockBreakpoint {
    id: u64,
    line: u32,
    condition: Option<String>,
    hit_condition: Option<HitCondition>,
    log_message: Option<String>,
    hits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HitCondition {
    Equal(u64),
    AtLeast(u64),
    Greater(u64),
    Every(u64),
}

impl HitCondition {
    fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (ctor, rest): (fn(u64) -> Self, &str) = if let Some(rest) = text.strip_prefix(">=") {
            (Self::AtLeast, rest)
        } else if let Some(rest) = text.strip_prefix("==") {
            (Self::Equal, rest)
        } else if let Some(rest) = text.strip_prefix('>') {
            (Self::Greater, rest)
        } else if let Some(rest) = text.strip_prefix('%') {
            (Self::Every, rest)
        } else {
            (Self::Equal, text)
        };
        let n = rest.trim().parse::<u64>().ok()?;
        if matches!(ctor(n), Self::Every(0)) {
            return None;
        }
        Some(ctor(n))
    }

    fn matches(self, hits: u64) -> bool {
        match self {
            Self::Equal(n) => hits == n,
            Self::AtLeast(n) => hits >= n,
            Self::Greater(n) => hits > n,
            Self::Every(n) => hits % n == 0,
        }
    }
}

struct Hook<R, W> {
    lines: Lines<BufReader<R>>,
    out: W,
    vm: Vm,
    breakpoints: Vec<MockBreakpoint>,
    next_breakpoint_id: u64,
    config: MockRuntimeConfig,
}

impl<R, W> Hook<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(&mut self) -> std::io::Result<()> {
        self.print(&format!(
            "loading scenario {} ({})",
            self.config.scenario.name(),
            self.config.script_path
        ))
        .await?;

        if !self.config.hook_enabled {
            return self.run_without_hook().await;
        }

        self.send(TargetFrame::Ready).await?;

        let stop_on_entry = loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(());
            };
            match decode_command(&line) {
                Ok(Command::Run { stop_on_entry }) => {
                    self.reply_ok(None).await?;
                    break stop_on_entry;
                }
                Ok(command) => {
                    if let Some(Resume::Terminate) = self.handle_command(command, false).await? {
                        return Ok(());
                    }
                }
                Err(err) => self.reply_err(err).await?,
            }
        };

        if stop_on_entry {
            self.vm.step = Some(PendingStep {
                depth: None,
                frames: 0,
                tick: 0,
            });
        }

        loop {
            if self.config.max_ticks.is_some_and(|max| self.vm.tick >= max) {
                return self.send(TargetFrame::Terminating).await;
            }
            if self.idle(self.config.tick_interval).await? == Flow::Terminate {
                return Ok(());
            }
            if self.run_tick().await? == Flow::Terminate {
                return Ok(());
            }
        }
    }

    async fn run_without_hook(&mut self) -> std::io::Result<()> {
        loop {
            if self.config.max_ticks.is_some_and(|max| self.vm.tick >= max) {
                return Ok(());
            }
            tokio::time::sleep(self.config.tick_interval).await;
            self.vm.tick += 1;
            self.vm.increment_ticks();
        }
    }

    /// Wait out the gap between ticks while still serving commands.
    async fn idle(&mut self, gap: Duration) -> std::io::Result<Flow> {
        let deadline = Instant::now() + gap;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(Flow::Continue),
                line = self.lines.next_line() => {
                    let Some(line) = line? else {
                        return Ok(Flow::Terminate);
                    };
                    match decode_command(&line) {
                        Ok(command) => {
                            if let Some(Resume::Terminate) = self.handle_command(command, false).await? {
                                return Ok(Flow::Terminate);
                            }
                        }
                        Err(err) => self.reply_err(err).await?,
                    }
                }
            }
        }
    }

    async fn run_tick(&mut self) -> std::io::Result<Flow> {
        self.vm.tick += 1;
        let tick = self.vm.tick;
        self.vm.enter(
            "on_tick handler",
            vec![("(*temporary)".to_string(), MockValue::Number(tick as f64))],
        );

        if self.statement(2).await? == Flow::Terminate {
            return Ok(Flow::Terminate);
        }
        self.vm.declare_local("foo", MockValue::Bool(true));

        if self.statement(3).await? == Flow::Terminate {
            return Ok(Flow::Terminate);
        }
        let flag = self.vm.lookup_local(0, "foo").unwrap_or(MockValue::Nil);
        self.vm.enter("count_tick", Vec::new());
        self.vm.declare_local("flag", flag);

        if self.statement(7).await? == Flow::Terminate {
            return Ok(Flow::Terminate);
        }
        self.vm.increment_ticks();
        self.vm.leave();
        self.vm.leave();
        Ok(Flow::Continue)
    }

    /// Called right before the statement on `line` executes.
    async fn statement(&mut self, line: u32) -> std::io::Result<Flow> {
        self.vm.set_line(line);

        let (hit, logs) = self.check_breakpoints(line);
        for text in logs {
            self.send(TargetFrame::Output {
                category: Some("console".to_string()),
                text: format!("{text}\n"),
            })
            .await?;
        }

        let reason = if hit {
            Some(StopReason::Breakpoint)
        } else {
            self.step_reason()
        };
        let Some(reason) = reason else {
            return Ok(Flow::Continue);
        };

        self.vm.step = None;
        self.send(TargetFrame::Stopped {
            reason,
            thread_id: 1,
            description: None,
        })
        .await?;

        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(Flow::Terminate);
            };
            let command = match decode_command(&line) {
                Ok(command) => command,
                Err(err) => {
                    self.reply_err(err).await?;
                    continue;
                }
            };
            match self.handle_command(command, true).await? {
                None => {}
                Some(Resume::Continue) => {
                    self.vm.resume();
                    return Ok(Flow::Continue);
                }
                Some(Resume::Step(depth)) => {
                    self.vm.resume();
                    self.vm.step = Some(PendingStep {
                        depth: Some(depth),
                        frames: self.vm.frames.len(),
                        tick: self.vm.tick,
                    });
                    return Ok(Flow::Continue);
                }
                Some(Resume::Terminate) => return Ok(Flow::Terminate),
            }
        }
    }

    fn step_reason(&self) -> Option<StopReason> {
        let step = self.vm.step?;
        let frames = self.vm.frames.len();
        let new_tick = self.vm.tick != step.tick;
        match step.depth {
            None => Some(StopReason::Entry),
            Some(StepDepth::In) => Some(StopReason::Step),
            Some(StepDepth::Over) if frames <= step.frames || new_tick => Some(StopReason::Step),
            Some(StepDepth::Out) if frames < step.frames || new_tick => Some(StopReason::Step),
            Some(_) => None,
        }
    }

    /// Returns whether to stop, plus the rendered logpoint messages.
    fn check_breakpoints(&mut self, line: u32) -> (bool, Vec<String>) {
        let mut stop = false;
        let mut logs = Vec::new();
        for bp in self.breakpoints.iter_mut().filter(|bp| bp.line == line) {
            if let Some(condition) = &bp.condition {
                match self.vm.evaluate(Some(0), condition) {
                    Ok(value) if value.is_truthy() => {}
                    _ => continue,
                }
            }
            bp.hits += 1;
            if let Some(hit) = bp.hit_condition {
                if !hit.matches(bp.hits) {
                    continue;
                }
            }
            if let Some(message) = &bp.log_message {
                logs.push(self.vm.interpolate(message));
                continue;
            }
            stop = true;
        }
        (stop, logs)
    }

    async fn handle_command(
        &mut self,
        command: Command,
        stopped: bool,
    ) -> std::io::Result<Option<Resume>> {
        match command {
            Command::Run { .. } => {
                self.reply_err("already running".to_string()).await?;
            }
            Command::Continue => {
                self.reply_ok(None).await?;
                if stopped {
                    return Ok(Some(Resume::Continue));
                }
            }
            Command::Step { depth } => {
                if !stopped {
                    self.reply_err("cannot step while running".to_string()).await?;
                } else {
                    self.reply_ok(None).await?;
                    return Ok(Some(Resume::Step(depth)));
                }
            }
            Command::ArmBreakpoints {
                source,
                breakpoints,
            } => {
                let armed = self.arm(&source, breakpoints);
                self.reply_body(&ArmBreakpointsReply { breakpoints: armed })
                    .await?;
            }
            Command::ClearBreakpoints { ids } => {
                self.breakpoints.retain(|bp| !ids.contains(&bp.id));
                self.reply_ok(None).await?;
            }
            Command::Terminate => {
                self.reply_ok(None).await?;
                self.send(TargetFrame::Terminating).await?;
                return Ok(Some(Resume::Terminate));
            }
            Command::StackTrace { levels } if stopped => {
                let reply = self.vm.stack_trace(&self.config.script_path, levels);
                self.reply_body(&reply).await?;
            }
            Command::Scope { frame, kind } if stopped => match self.vm.scope(frame, kind) {
                Ok(handle) => self.reply_body(&ScopeReply { handle }).await?,
                Err(err) => self.reply_err(err).await?,
            },
            Command::Variables { handle } if stopped => match self.vm.variables(handle) {
                Ok(variables) => self.reply_body(&VariablesReply { variables }).await?,
                Err(err) => self.reply_err(err).await?,
            },
            Command::SetVariable {
                container,
                name,
                value,
            } if stopped => match self.vm.set_variable(container, &name, &value) {
                Ok(value) => self.reply_body(&value).await?,
                Err(err) => self.reply_err(err).await?,
            },
            Command::Evaluate { frame, expression } => {
                let start = std::time::Instant::now();
                let frame = match frame {
                    Some(_) if !stopped => {
                        self.reply_err("no frame while running".to_string()).await?;
                        return Ok(None);
                    }
                    Some(id) => match self.vm.frame_index(id) {
                        Some(_) => Some(id),
                        None => {
                            self.reply_err(format!("unknown frame {id}")).await?;
                            return Ok(None);
                        }
                    },
                    None => None,
                };
                match self.vm.evaluate(frame, &expression) {
                    Ok(value) => {
                        let value = self.vm.to_wire(&value);
                        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                        self.reply_body(&EvaluateReply {
                            value,
                            elapsed_ms: Some(elapsed_ms),
                        })
                        .await?;
                    }
                    Err(err) => self.reply_err(err).await?,
                }
            }
            Command::StackTrace { .. }
            | Command::Scope { .. }
            | Command::Variables { .. }
            | Command::SetVariable { .. } => {
                self.reply_err("target is running".to_string()).await?;
            }
        }
        Ok(None)
    }

    fn arm(&mut self, source: &str, specs: Vec<BreakpointSpec>) -> Vec<ArmedBreakpointInfo> {
        let known_source =
            normalize_source_path(source) == normalize_source_path(&self.config.script_path);
        specs
            .into_iter()
            .map(|spec| {
                let rejection = if !known_source {
                    Some(format!("source {source} is not loaded"))
                } else if !EXECUTABLE_LINES.contains(&spec.line) {
                    Some(format!("no executable code at line {}", spec.line))
                } else {
                    None
                };
                let hit_condition = match spec.hit_condition.as_deref().map(HitCondition::parse) {
                    Some(None) => {
                        return ArmedBreakpointInfo {
                            id: None,
                            line: spec.line,
                            verified: false,
                            message: Some("invalid hit condition".to_string()),
                        };
                    }
                    Some(Some(hit)) => Some(hit),
                    None => None,
                };
                if let Some(message) = rejection {
                    return ArmedBreakpointInfo {
                        id: None,
                        line: spec.line,
                        verified: false,
                        message: Some(message),
                    };
                }

                let id = self.next_breakpoint_id;
                self.next_breakpoint_id += 1;
                self.breakpoints.push(MockBreakpoint {
                    id,
                    line: spec.line,
                    condition: spec.condition,
                    hit_condition,
                    log_message: spec.log_message,
                    hits: 0,
                });
                ArmedBreakpointInfo {
                    id: Some(id),
                    line: spec.line,
                    verified: true,
                    message: None,
                }
            })
            .collect()
    }

    async fn print(&mut self, text: &str) -> std::io::Result<()> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await
    }

    async fn send(&mut self, frame: TargetFrame) -> std::io::Result<()> {
        let bytes = encode_frame(&frame).map_err(std::io::Error::other)?;
        self.out.write_all(&bytes).await?;
        self.out.flush().await
    }

    async fn reply_ok(&mut self, body: Option<serde_json::Value>) -> std::io::Result<()> {
        self.send(TargetFrame::Reply {
            ok: true,
            body,
            error: None,
        })
        .await
    }

    async fn reply_body<T: serde::Serialize>(&mut self, body: &T) -> std::io::Result<()> {
        let body = serde_json::to_value(body).map_err(std::io::Error::other)?;
        self.reply_ok(Some(body)).await
    }

    async fn reply_err(&mut self, error: String) -> std::io::Result<()> {
        self.send(TargetFrame::Reply {
            ok: false,
            body: None,
            error: Some(error),
        })
        .await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockValue {
    Nil,
    Bool(bool),
    Number(f64),
    Str(String),
    Table(usize),
    Function(String),
    Userdata(String),
}

impl MockValue {
    fn is_truthy(&self) -> bool {
        !matches!(self, MockValue::Nil | MockValue::Bool(false))
    }

    fn type_name(&self) -> &'static str {
        match self {
            MockValue::Nil => "nil",
            MockValue::Bool(_) => "boolean",
            MockValue::Number(_) => "number",
            MockValue::Str(_) => "string",
            MockValue::Table(_) => "table",
            MockValue::Function(_) => "function",
            MockValue::Userdata(_) => "userdata",
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Parse a value using the runtime's literal grammar.
///
/// Accepts `nil`, `true`, `false`, decimal/hex/float numbers (optionally
/// negative) and single- or double-quoted strings.
pub fn parse_literal(text: &str) -> Result<MockValue, String> {
    let trimmed = text.trim();
    let reject = || format!("cannot parse literal {text}");
    match trimmed {
        "nil" => return Ok(MockValue::Nil),
        "true" => return Ok(MockValue::Bool(true)),
        "false" => return Ok(MockValue::Bool(false)),
        _ => {}
    }
    if trimmed.starts_with('"') || trimmed.starts_with('\'') {
        let mut lexer = Lexer::new(trimmed);
        return match lexer.next_token() {
            Ok(Token::Str(s)) if lexer.at_end() => Ok(MockValue::Str(s)),
            _ => Err(reject()),
        };
    }
    parse_number(trimmed).map(MockValue::Number).ok_or_else(reject)
}

fn parse_number(text: &str) -> Option<f64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok()? as f64
    } else {
        let valid = !digits.is_empty()
            && digits.starts_with(|c: char| c.is_ascii_digit() || c == '.')
            && digits
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
        if !valid {
            return None;
        }
        digits.parse::<f64>().ok()?
    };
    Some(if negative { -value } else { value })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Number(f64),
    Str(String),
    Op(&'static str),
    Eof,
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.pos >= self.src.len()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.src[self.pos..].chars().next() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn next_token(&mut self) -> Result<Token, String> {
        self.skip_ws();
        let rest = &self.src[self.pos..];
        let Some(c) = rest.chars().next() else {
            return Ok(Token::Eof);
        };

        for op in ["==", "~=", "<=", ">=", "..", "(", ")", ".", "<", ">", "-", "#"] {
            if rest.starts_with(op) && !(op == "." && rest[1..].starts_with(|c: char| c.is_ascii_digit())) {
                self.pos += op.len();
                return Ok(Token::Op(op));
            }
        }

        if c == '"' || c == '\'' {
            return self.string(c);
        }

        if c.is_ascii_digit() || c == '.' {
            let len = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '.'))
                .unwrap_or(rest.len());
            let text = &rest[..len];
            self.pos += len;
            return parse_number(text)
                .map(Token::Number)
                .ok_or_else(|| format!("malformed number near '{text}'"));
        }

        if c.is_alphabetic() || c == '_' {
            let len = rest
                .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            self.pos += len;
            return Ok(Token::Name(rest[..len].to_string()));
        }

        Err(format!("unexpected symbol near '{c}'"))
    }

    fn string(&mut self, quote: char) -> Result<Token, String> {
        let mut out = String::new();
        let mut chars = self.src[self.pos + 1..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                c if c == quote => {
                    self.pos += 1 + i + c.len_utf8();
                    return Ok(Token::Str(out));
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, '\\')) => out.push('\\'),
                    Some((_, '"')) => out.push('"'),
                    Some((_, '\'')) => out.push('\''),
                    _ => return Err("invalid escape sequence".to_string()),
                },
                '\n' => break,
                c => out.push(c),
            }
        }
        Err("unfinished string".to_string())
    }
}

struct Parser<'v, 'a> {
    lexer: Lexer<'a>,
    peeked: Option<Token>,
    vm: &'v Vm,
    frame: Option<usize>,
}

impl Parser<'_, '_> {
    fn peek(&mut self) -> Result<&Token, String> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lexer.next_token()?);
        }
        Ok(self.peeked.get_or_insert(Token::Eof))
    }

    fn bump(&mut self) -> Result<Token, String> {
        match self.peeked.take() {
            Some(token) => Ok(token),
            None => self.lexer.next_token(),
        }
    }

    fn eat_name(&mut self, keyword: &str) -> Result<bool, String> {
        if matches!(self.peek()?, Token::Name(name) if name == keyword) {
            self.bump()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn expression(&mut self) -> Result<MockValue, String> {
        let mut lhs = self.and_expr()?;
        while self.eat_name("or")? {
            let rhs = self.and_expr()?;
            if !lhs.is_truthy() {
                lhs = rhs;
            }
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<MockValue, String> {
        let mut lhs = self.comparison()?;
        while self.eat_name("and")? {
            let rhs = self.comparison()?;
            if lhs.is_truthy() {
                lhs = rhs;
            }
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<MockValue, String> {
        let lhs = self.concat()?;
        let op = match self.peek()?.clone() {
            Token::Op(op @ ("==" | "~=" | "<" | ">" | "<=" | ">=")) => op,
            _ => return Ok(lhs),
        };
        self.bump()?;
        let rhs = self.concat()?;
        let result = match op {
            "==" => lhs == rhs,
            "~=" => lhs != rhs,
            _ => match (&lhs, &rhs) {
                (MockValue::Number(a), MockValue::Number(b)) => match op {
                    "<" => a < b,
                    ">" => a > b,
                    "<=" => a <= b,
                    _ => a >= b,
                },
                (MockValue::Str(a), MockValue::Str(b)) => match op {
                    "<" => a < b,
                    ">" => a > b,
                    "<=" => a <= b,
                    _ => a >= b,
                },
                _ => {
                    return Err(format!(
                        "attempt to compare {} with {}",
                        lhs.type_name(),
                        rhs.type_name()
                    ))
                }
            },
        };
        Ok(MockValue::Bool(result))
    }

    fn concat(&mut self) -> Result<MockValue, String> {
        let lhs = self.unary()?;
        if !matches!(self.peek()?, Token::Op("..")) {
            return Ok(lhs);
        }
        self.bump()?;
        let rhs = self.concat()?;
        let piece = |value: &MockValue| match value {
            MockValue::Str(s) => Ok(s.clone()),
            MockValue::Number(n) => Ok(format_number(*n)),
            other => Err(format!(
                "attempt to concatenate a {} value",
                other.type_name()
            )),
        };
        Ok(MockValue::Str(piece(&lhs)? + &piece(&rhs)?))
    }

    fn unary(&mut self) -> Result<MockValue, String> {
        if self.eat_name("not")? {
            let value = self.unary()?;
            return Ok(MockValue::Bool(!value.is_truthy()));
        }
        let next = self.peek()?.clone();
        match next {
            Token::Op("-") => {
                self.bump()?;
                match self.unary()? {
                    MockValue::Number(n) => Ok(MockValue::Number(-n)),
                    other => Err(format!(
                        "attempt to perform arithmetic on a {} value",
                        other.type_name()
                    )),
                }
            }
            Token::Op("#") => {
                self.bump()?;
                match self.unary()? {
                    MockValue::Str(s) => Ok(MockValue::Number(s.len() as f64)),
                    MockValue::Table(id) => {
                        Ok(MockValue::Number(self.vm.tables[id].entries.len() as f64))
                    }
                    other => Err(format!(
                        "attempt to get length of a {} value",
                        other.type_name()
                    )),
                }
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<MockValue, String> {
        let mut value = match self.bump()? {
            Token::Number(n) => return Ok(MockValue::Number(n)),
            Token::Str(s) => return Ok(MockValue::Str(s)),
            Token::Op("(") => {
                let value = self.expression()?;
                match self.bump()? {
                    Token::Op(")") => value,
                    _ => return Err("')' expected".to_string()),
                }
            }
            Token::Name(name) => match name.as_str() {
                "nil" => return Ok(MockValue::Nil),
                "true" => return Ok(MockValue::Bool(true)),
                "false" => return Ok(MockValue::Bool(false)),
                "and" | "or" | "not" => return Err(format!("unexpected symbol near '{name}'")),
                _ => self.vm.resolve(self.frame, &name),
            },
            Token::Eof => return Err("unexpected symbol near <eof>".to_string()),
            Token::Op(op) => return Err(format!("unexpected symbol near '{op}'")),
        };

        while matches!(self.peek()?, Token::Op(".")) {
            self.bump()?;
            let Token::Name(field) = self.bump()? else {
                return Err("<name> expected after '.'".to_string());
            };
            value = match value {
                MockValue::Table(id) => self.vm.tables[id].get(&field),
                other => {
                    return Err(format!(
                        "attempt to index a {} value (field '{field}')",
                        other.type_name()
                    ))
                }
            };
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Default)]
struct Table {
    entries: Vec<(String, MockValue)>,
}

impl Table {
    fn get(&self, key: &str) -> MockValue {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or(MockValue::Nil)
    }

    fn set(&mut self, key: &str, value: MockValue) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }
}

#[derive(Debug, Clone)]
struct Frame {
    function: &'static str,
    line: u32,
    locals: Vec<(String, MockValue)>,
    temporaries: Vec<(String, MockValue)>,
}

#[derive(Debug, Clone, Copy)]
enum Container {
    Locals(usize),
    Temporaries(usize),
    Upvalues(usize),
    Table(usize),
}

struct Vm {
    tables: Vec<Table>,
    host_global: usize,
    runtime_global: usize,
    frames: Vec<Frame>,
    tick: u64,
    step: Option<PendingStep>,
    handles: Vec<Container>,
}

impl Vm {
    fn new(script_path: &str) -> Self {
        let mut tables = vec![Table::default(); 4];
        let (host_global, runtime_global, defines, events) = (0, 1, 2, 3);
        tables[events].set("on_tick", MockValue::Number(0.0));
        tables[defines].set("events", MockValue::Table(events));
        let host = &mut tables[host_global];
        host.set("count_tick", MockValue::Function("count_tick".to_string()));
        host.set("defines", MockValue::Table(defines));
        host.set("game", MockValue::Userdata("LuaGameScript".to_string()));
        host.set("global", MockValue::Table(runtime_global));
        host.set("script", MockValue::Userdata("LuaBootstrap".to_string()));
        host.set("script_path", MockValue::Str(script_path.to_string()));
        Self {
            tables,
            host_global,
            runtime_global,
            frames: Vec::new(),
            tick: 0,
            step: None,
            handles: Vec::new(),
        }
    }

    fn enter(&mut self, function: &'static str, temporaries: Vec<(String, MockValue)>) {
        self.frames.push(Frame {
            function,
            line: 0,
            locals: Vec::new(),
            temporaries,
        });
    }

    fn leave(&mut self) {
        self.frames.pop();
    }

    fn set_line(&mut self, line: u32) {
        if let Some(frame) = self.frames.last_mut() {
            frame.line = line;
        }
    }

    fn declare_local(&mut self, name: &str, value: MockValue) {
        if let Some(frame) = self.frames.last_mut() {
            frame.locals.push((name.to_string(), value));
        }
    }

    fn increment_ticks(&mut self) {
        let table = &mut self.tables[self.runtime_global];
        let next = match table.get("ticks") {
            MockValue::Number(n) => n + 1.0,
            _ => 1.0,
        };
        table.set("ticks", MockValue::Number(next));
    }

    /// Target-side handles die with the stop that produced them.
    fn resume(&mut self) {
        self.handles.clear();
    }

    /// Frame ids count from the innermost frame (`0`).
    fn frame_index(&self, id: u64) -> Option<usize> {
        let id = usize::try_from(id).ok()?;
        self.frames.len().checked_sub(id + 1)
    }

    fn lookup_local(&self, frame_id: u64, name: &str) -> Option<MockValue> {
        let index = self.frame_index(frame_id)?;
        self.frames[index]
            .locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    fn resolve(&self, frame: Option<usize>, name: &str) -> MockValue {
        if let Some(index) = frame {
            if let Some((_, value)) = self.frames[index]
                .locals
                .iter()
                .rev()
                .find(|(n, _)| n == name)
            {
                return value.clone();
            }
        }
        self.tables[self.host_global].get(name)
    }

    fn evaluate(&self, frame_id: Option<u64>, expression: &str) -> Result<MockValue, String> {
        let frame = match frame_id {
            Some(id) => Some(
                self.frame_index(id)
                    .ok_or_else(|| format!("unknown frame {id}"))?,
            ),
            None => None,
        };
        let mut parser = Parser {
            lexer: Lexer::new(expression),
            peeked: None,
            vm: self,
            frame,
        };
        let value = parser.expression()?;
        match parser.peek()? {
            Token::Eof => Ok(value),
            token => Err(format!("unexpected symbol near {token:?}")),
        }
    }

    fn interpolate(&self, template: &str) -> String {
        let mut out = String::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                return out;
            };
            let expression = &after[..close];
            match self.evaluate(Some(0), expression) {
                Ok(value) => out.push_str(&self.render(&value, 1)),
                Err(err) => {
                    let _ = write!(out, "{{error: {err}}}");
                }
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        out
    }

    fn render(&self, value: &MockValue, depth: usize) -> String {
        match value {
            MockValue::Nil => "nil".to_string(),
            MockValue::Bool(b) => b.to_string(),
            MockValue::Number(n) => format_number(*n),
            MockValue::Str(s) => s.clone(),
            MockValue::Function(name) => format!("function {name}"),
            MockValue::Userdata(name) => name.clone(),
            MockValue::Table(id) => {
                if depth == 0 {
                    return "{...}".to_string();
                }
                let entries = &self.tables[*id].entries;
                if entries.is_empty() {
                    return "{}".to_string();
                }
                let mut out = String::from("{");
                for (i, (key, value)) in entries.iter().take(3).enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let rendered = match value {
                        MockValue::Str(s) => format!("{s:?}"),
                        other => self.render(other, depth - 1),
                    };
                    let _ = write!(out, "{key} = {rendered}");
                }
                if entries.len() > 3 {
                    out.push_str(", ...");
                }
                out.push('}');
                out
            }
        }
    }

    fn alloc(&mut self, container: Container) -> u64 {
        self.handles.push(container);
        self.handles.len() as u64
    }

    fn to_wire(&mut self, value: &MockValue) -> Value {
        let mut wire = Value::new(value.type_name(), self.render(value, 1));
        if let MockValue::Table(id) = value {
            wire.handle = Some(self.alloc(Container::Table(*id)));
        }
        wire
    }

    fn stack_trace(&self, script_path: &str, levels: Option<u32>) -> StackTraceReply {
        let total = self.frames.len();
        let take = levels
            .filter(|levels| *levels > 0)
            .map_or(total, |levels| levels as usize);
        let frames = self
            .frames
            .iter()
            .rev()
            .enumerate()
            .take(take)
            .map(|(id, frame)| FrameInfo {
                id: id as u64,
                name: frame.function.to_string(),
                source: script_path.to_string(),
                line: frame.line,
            })
            .collect();
        StackTraceReply {
            frames,
            total: Some(total as u32),
        }
    }

    fn scope(&mut self, frame_id: u64, kind: ScopeKind) -> Result<u64, String> {
        let index = self
            .frame_index(frame_id)
            .ok_or_else(|| format!("unknown frame {frame_id}"))?;
        let container = match kind {
            ScopeKind::Locals => Container::Locals(index),
            ScopeKind::Upvalues => Container::Upvalues(index),
            ScopeKind::RuntimeGlobal => Container::Table(self.runtime_global),
            ScopeKind::HostGlobal => Container::Table(self.host_global),
        };
        Ok(self.alloc(container))
    }

    fn container(&self, handle: u64) -> Result<Container, String> {
        usize::try_from(handle)
            .ok()
            .and_then(|handle| handle.checked_sub(1))
            .and_then(|index| self.handles.get(index))
            .copied()
            .ok_or_else(|| format!("invalid handle {handle}"))
    }

    fn variables(&mut self, handle: u64) -> Result<Vec<VariableInfo>, String> {
        let container = self.container(handle)?;
        let mut out = Vec::new();
        let entries = match container {
            Container::Locals(index) => {
                let frame = &self.frames[index];
                let entries = frame.locals.clone();
                if !frame.temporaries.is_empty() {
                    let handle = self.alloc(Container::Temporaries(index));
                    out.push(VariableInfo {
                        name: "<temporaries>".to_string(),
                        value: Value {
                            type_name: "temporaries".to_string(),
                            value: "<temporaries>".to_string(),
                            handle: Some(handle),
                        },
                        is_virtual: true,
                    });
                }
                entries
            }
            Container::Temporaries(index) => self.frames[index].temporaries.clone(),
            Container::Upvalues(_) => Vec::new(),
            Container::Table(id) => self.tables[id].entries.clone(),
        };
        for (name, value) in entries {
            let value = self.to_wire(&value);
            out.push(VariableInfo {
                name,
                value,
                is_virtual: false,
            });
        }
        Ok(out)
    }

    fn set_variable(&mut self, handle: u64, name: &str, literal: &str) -> Result<Value, String> {
        let container = self.container(handle)?;
        let value = parse_literal(literal)?;
        let slot = |slots: &mut Vec<(String, MockValue)>| -> Result<(), String> {
            let slot = slots
                .iter_mut()
                .rev()
                .find(|(n, _)| n == name)
                .ok_or_else(|| format!("no variable named {name}"))?;
            slot.1 = value.clone();
            Ok(())
        };
        match container {
            Container::Locals(index) => slot(&mut self.frames[index].locals)?,
            Container::Temporaries(index) => slot(&mut self.frames[index].temporaries)?,
            Container::Upvalues(_) => return Err(format!("no upvalue named {name}")),
            Container::Table(id) => self.tables[id].set(name, value.clone()),
        }
        Ok(self.to_wire(&value))
    }
}
