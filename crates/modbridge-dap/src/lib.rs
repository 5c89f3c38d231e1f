//! Debug Adapter Protocol bridge for an embedded scripting runtime.
//!
//! The target application runs a debug hook inside its scripting runtime and
//! talks to the adapter over a private control channel (see
//! [`modbridge_wire`]). This crate provides:
//! - the DAP server loop speaking to the client over stdio,
//! - launch validation and launch-time mod list overrides,
//! - the per-target [`session::Session`]: run state, breakpoint
//!   reconciliation, stop-scoped variable references and value rendering.

pub mod breakpoints;
pub mod dap;
pub mod error;
pub mod eval_context;
pub mod format;
pub mod hardening;
pub mod launch;
pub mod mod_list;
pub mod references;
pub mod server;
pub mod session;

pub use crate::dap::types::{EvaluateResult, OutputEvent, Scope, Variable, VariablePresentationHint};
pub use crate::error::{SessionError, SessionResult};
pub use crate::format::ValueFormatter;
pub use crate::session::{DapEvent, RunState, Session, SessionOptions};
