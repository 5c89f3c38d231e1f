use modbridge_wire::WireError;
use thiserror::Error;

use crate::{launch::LaunchError, references::ReferenceError, session::RunState};

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{command} is not allowed while the session is {state}")]
    InvalidState {
        command: &'static str,
        state: RunState,
    },
    #[error("invalid {command} arguments: {message}")]
    InvalidArguments {
        command: &'static str,
        message: String,
    },
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error("reference {0} does not name a stack frame")]
    NotAFrame(i64),
    #[error("reference {0} does not name a variable container")]
    NotAContainer(i64),
    #[error("the target resumed before the request completed")]
    Resumed,
    #[error("{0} requires a target; send launch or attach first")]
    NoTarget(String),
    #[error("unsupported request {0:?}")]
    Unsupported(String),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Target(#[from] WireError),
}

impl SessionError {
    pub(crate) fn invalid_arguments(command: &'static str, err: serde_json::Error) -> Self {
        Self::InvalidArguments {
            command,
            message: err.to_string(),
        }
    }

    /// Errors the target reported for this request alone; the session stays
    /// usable.
    pub fn is_target_reported(&self) -> bool {
        matches!(self, Self::Target(WireError::Target(_)))
    }
}
