use std::io;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("record exceeds max size: {size} > {max}")]
    OversizedRecord { size: usize, max: usize },
    #[error("record is not structured json: {0}")]
    Desync(String),
    #[error("event encode failed: {0}")]
    Encode(String),
}

/// Rejection of an inbound message or a requested state change. The caller
/// reports it on the same channel and leaves its state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("message exceeds max size: {size} > {max}")]
    TooLarge { size: usize, max: usize },
    #[error("message text is empty")]
    EmptyInstruction,
    #[error("directory path is empty")]
    EmptyPath,
    #[error("not a directory: {0}")]
    NotADirectory(String),
}

#[derive(Debug, Error)]
#[error("failed to spawn {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: io::Error,
}

impl SpawnError {
    pub fn new(program: impl Into<String>, source: io::Error) -> Self {
        Self {
            program: program.into(),
            source,
        }
    }
}
