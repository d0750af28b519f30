use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("event must contain at least one line")]
    EmptyEvent,
    #[error("stream buffer exceeds max size without terminator: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
}
