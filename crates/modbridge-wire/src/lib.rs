//! Control channel between the debug adapter and the debug hook injected into
//! the target's scripting runtime.
//!
//! The hook has no native debug protocol; it prints control frames on the
//! target's stdout (marked by a reserved sentinel) and reads commands from
//! stdin or a socket. [`wire::TargetClient`] turns that into an ordered,
//! single-flight request/reply API plus an event stream, and
//! [`wire::TargetControl`] is the capability interface the adapter programs
//! against.

pub mod source;
pub mod wire;

pub use source::normalize_source_path;
pub use wire::{
    TargetChannel, TargetClient, TargetClientConfig, TargetControl, TargetEvent, TargetFuture,
    WireError,
};
