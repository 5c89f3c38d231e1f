use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WireError>;

/// Target-side handle for an expandable value (table, scope container, ...).
///
/// Handles are only meaningful while the target is stopped; the target is free
/// to recycle them once it resumes.
pub type TargetHandle = u64;

/// Target-side call frame id, valid for one stop.
pub type TargetFrameId = u64;

/// Target-side breakpoint id.
pub type TargetBreakpointId = u64;

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("control channel closed")]
    ChannelClosed,

    /// The target executed the command and reported a failure.
    #[error("{0}")]
    Target(String),

    /// The reply was longer than the control channel's line limit.
    #[error("`{command}` reply exceeds the {limit}-byte line limit")]
    Oversized { command: &'static str, limit: usize },

    #[error("malformed `{command}` reply: {source}")]
    Body {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepDepth {
    In,
    Over,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeKind {
    Locals,
    Upvalues,
    RuntimeGlobal,
    HostGlobal,
}

impl ScopeKind {
    /// Fixed presentation order of the four scopes of a frame.
    pub const ALL: [ScopeKind; 4] = [
        ScopeKind::Locals,
        ScopeKind::Upvalues,
        ScopeKind::RuntimeGlobal,
        ScopeKind::HostGlobal,
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointSpec {
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(
        default,
        rename = "hitCondition",
        skip_serializing_if = "Option::is_none"
    )]
    pub hit_condition: Option<String>,
    #[serde(default, rename = "logMessage", skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
}

impl BreakpointSpec {
    pub fn at_line(line: u32) -> Self {
        Self {
            line,
            ..Self::default()
        }
    }
}

/// Adapter -> target command.
///
/// Serialized as `{"command": <name>, "arguments": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "arguments", rename_all = "camelCase")]
pub enum Command {
    Run {
        #[serde(rename = "stopOnEntry", default)]
        stop_on_entry: bool,
    },
    Continue,
    Step {
        depth: StepDepth,
    },
    ArmBreakpoints {
        source: String,
        breakpoints: Vec<BreakpointSpec>,
    },
    ClearBreakpoints {
        ids: Vec<TargetBreakpointId>,
    },
    StackTrace {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        levels: Option<u32>,
    },
    Scope {
        frame: TargetFrameId,
        kind: ScopeKind,
    },
    Variables {
        handle: TargetHandle,
    },
    SetVariable {
        container: TargetHandle,
        name: String,
        value: String,
    },
    Evaluate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame: Option<TargetFrameId>,
        expression: String,
    },
    Terminate,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Run { .. } => "run",
            Command::Continue => "continue",
            Command::Step { .. } => "step",
            Command::ArmBreakpoints { .. } => "armBreakpoints",
            Command::ClearBreakpoints { .. } => "clearBreakpoints",
            Command::StackTrace { .. } => "stackTrace",
            Command::Scope { .. } => "scope",
            Command::Variables { .. } => "variables",
            Command::SetVariable { .. } => "setVariable",
            Command::Evaluate { .. } => "evaluate",
            Command::Terminate => "terminate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Breakpoint,
    Step,
    Entry,
    Exception,
    #[serde(other)]
    Other,
}

impl StopReason {
    /// DAP `stopped.reason` value.
    pub fn as_dap_reason(self) -> &'static str {
        match self {
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
            StopReason::Entry => "entry",
            StopReason::Exception => "exception",
            StopReason::Other => "pause",
        }
    }
}

fn default_thread_id() -> i64 {
    1
}

/// Target -> adapter control frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TargetFrame {
    Reply {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Ready,
    Stopped {
        reason: StopReason,
        #[serde(rename = "threadId", default = "default_thread_id")]
        thread_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Output {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        text: String,
    },
    Terminating,
}

/// A runtime value as rendered by the target.
///
/// `value` is the target's raw rendering; strings are not quoted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub handle: Option<TargetHandle>,
}

impl Value {
    pub fn new(type_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            value: value.into(),
            handle: None,
        }
    }

    pub fn nil() -> Self {
        Self::new("nil", "nil")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    #[serde(flatten)]
    pub value: Value,
    /// Synthetic entries (such as the temporaries pseudo-variable) that do not
    /// correspond to a named binding.
    #[serde(default, rename = "virtual", skip_serializing_if = "std::ops::Not::not")]
    pub is_virtual: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub id: TargetFrameId,
    pub name: String,
    pub source: String,
    pub line: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackTraceReply {
    pub frames: Vec<FrameInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeReply {
    pub handle: TargetHandle,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariablesReply {
    pub variables: Vec<VariableInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmedBreakpointInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TargetBreakpointId>,
    pub line: u32,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmBreakpointsReply {
    pub breakpoints: Vec<ArmedBreakpointInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateReply {
    #[serde(flatten)]
    pub value: Value,
    #[serde(default, rename = "elapsedMs", skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Out-of-band notifications produced by the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetEvent {
    /// The debug hook is installed and accepts configuration.
    Ready,
    Stopped {
        reason: StopReason,
        thread_id: i64,
        description: Option<String>,
    },
    /// Console output produced by the hook itself (logpoints, `print` in the REPL, ...).
    Console {
        category: Option<String>,
        text: String,
    },
    /// Raw program output that did not carry the control sentinel.
    Output { stream: OutputStream, text: String },
    /// A frame that could not be decoded, or a reply nobody asked for.
    ProtocolError { message: String },
    Terminating,
    /// Emitted exactly once, after which no further events follow.
    Closed { exit_code: Option<i32> },
}
