// commands/mod.rs — caller-visible outcome of an issued command
pub mod tracker;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use vehicle_protocol::{CommandKind, CommandResponse};

/// What the caller's completion handle is fulfilled with, exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Completion {
    /// The vehicle answered. A non-zero result code is still an answer.
    Success { response: CommandResponse },
    /// No answer before the deadline; the effect on the vehicle is unknown.
    TimedOut,
    Failed { reason: FailureReason },
}

impl Completion {
    pub fn is_success(&self) -> bool {
        matches!(self, Completion::Success { response } if response.is_success())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("{0} consecutive authentication failures")]
    AuthenticationFailures(u32),
    #[error("transport closed")]
    Closed,
    #[error("session sequence space exhausted")]
    SessionExhausted,
}

/// Handle for one in-flight command. Dropping it without awaiting cancels.
#[derive(Debug)]
pub struct PendingCommand {
    token: u32,
    kind: CommandKind,
    rx: oneshot::Receiver<Completion>,
    cancel: mpsc::UnboundedSender<u32>,
    settled: bool,
}

impl PendingCommand {
    pub(crate) fn new(
        token: u32,
        kind: CommandKind,
        rx: oneshot::Receiver<Completion>,
        cancel: mpsc::UnboundedSender<u32>,
    ) -> Self {
        Self { token, kind, rx, cancel, settled: false }
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub async fn completion(mut self) -> Completion {
        let out = match (&mut self.rx).await {
            Ok(c) => c,
            // the relay task went away without resolving us
            Err(_) => Completion::Failed {
                reason: FailureReason::ConnectionLost("relay task ended".into()),
            },
        };
        self.settled = true;
        out
    }

    /// Stop waiting. The command may already be on the wire and still take effect.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for PendingCommand {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.cancel.send(self.token);
        }
    }
}
