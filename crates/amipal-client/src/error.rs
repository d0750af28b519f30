use amipal_core::control::FrameError;
use amipal_core::ProtocolError;
use std::io;
use thiserror::Error;

/// Rejections raised while validating an action before it reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("action name cannot be empty")]
    EmptyAction,
    #[error("{field} cannot contain line breaks or be empty")]
    InvalidText { field: String },
    #[error("{action} requires {}", .required.join(", "))]
    MissingRequired {
        action: String,
        required: Vec<String>,
    },
    #[error("{action} takes positional or keyword arguments, not both")]
    MixedArguments { action: String },
    #[error("{action} takes {expected} positional arguments, got {found}")]
    PositionalCount {
        action: String,
        expected: usize,
        found: usize,
    },
    #[error("{0} is not in the action catalog and cannot bind positional arguments")]
    UnknownAction(String),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control command name cannot be empty")]
    EmptyCommand,
    #[error("control command already registered: {0}")]
    DuplicateCommand(String),
    #[error("control connection closed before a reply arrived")]
    Closed,
    #[error("control reply timed out")]
    Timeout,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("control socket error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum AmiError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] ArgumentError),
    #[error("not connected to the manager interface")]
    NotConnected,
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("outbound queue closed")]
    QueueClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Control(#[from] ControlError),
}
