//! Wire-level control protocol.
//!
//! This module speaks the line protocol exchanged with the debug hook running
//! inside the target. It is `tokio`-based and never blocks on the target.

mod client;
pub mod codec;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod types;

pub use client::{
    TargetChannel, TargetClient, TargetClientConfig, TargetControl, TargetFuture,
};
pub use types::{
    ArmedBreakpointInfo, BreakpointSpec, Command, EvaluateReply, FrameInfo, OutputStream,
    ScopeKind, StackTraceReply, StepDepth, StopReason, TargetBreakpointId, TargetEvent,
    TargetFrame, TargetFrameId, TargetHandle, Value, VariableInfo, WireError,
};
