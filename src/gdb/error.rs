//! Error kinds for the MI session

use crate::gdb::types::DebuggerState;
use std::time::Duration;
use thiserror::Error;

/// Failures of the pipe transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to start gdb: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("gdb closed its output")]
    Eof,
    #[error("failed to read from gdb: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write to gdb: {0}")]
    Write(#[source] std::io::Error),
    #[error("no output from gdb for {0:?}")]
    Timeout(Duration),
    #[error("transport already closed")]
    Closed,
}

/// Malformed MI text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GdbError {
    #[error(transparent)]
    Io(#[from] TransportError),
    #[error("malformed MI output: {0}")]
    Parse(#[from] ParseError),
    #[error("unexpected MI record: {0}")]
    Protocol(String),
    #[error("cannot connect: {0}")]
    Connect(String),
    #[error("gdb: {0}")]
    Mi(String),
    #[error("gdb session is not connected")]
    NotConnected,
    #[error("variable object is no longer valid")]
    InvalidVariable,
    #[error("not allowed while {0}")]
    InvalidState(DebuggerState),
}

pub type Result<T> = std::result::Result<T, GdbError>;
