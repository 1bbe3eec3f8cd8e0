// error.rs — protocol-layer error taxonomy

use thiserror::Error;

use crate::grammar::CommandKind;

/// Caller error: a parameter was out of range or unencodable. Never reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} rejected: {reason}")]
pub struct RejectedCommand {
    pub kind: CommandKind,
    pub reason: String,
}

impl RejectedCommand {
    pub fn new(kind: CommandKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// A canonical command or response string that does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed command {input:?}: {reason}")]
pub struct MalformedCommand {
    pub input: String,
    pub reason: &'static str,
}

impl MalformedCommand {
    pub(crate) fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// Wire-format violations detected while unwrapping a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedFrame {
    #[error("frame shorter than header: {got} bytes")]
    ShortHeader { got: usize },
    #[error("declared payload length {declared} but {available} bytes follow the header")]
    LengthMismatch { declared: usize, available: usize },
    #[error("payload of {0} bytes cannot hold an authentication tag")]
    PayloadTooShort(usize),
    #[error("declared payload length {0} exceeds the frame limit")]
    Oversized(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("authentication tag mismatch")]
    AuthenticationFailed,
    #[error("replayed sequence {sequence} (last accepted {last_accepted})")]
    ReplayRejected { sequence: u32, last_accepted: u32 },
    #[error("outbound sequence space exhausted; open a new session")]
    SequenceExhausted,
    #[error("plaintext of {0} bytes does not fit in one frame")]
    PlaintextTooLarge(usize),
    #[error("invalid session material: {0}")]
    InvalidMaterial(&'static str),
}
