// lib.rs — OVMS v2 command channel: relay transport and command tracking
pub mod commands;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod logging;
pub mod net;
pub mod transport;

pub use commands::{Completion, FailureReason, PendingCommand};
pub use errors::ChannelError;
pub use transport::{RelayHandle, RelayTransport, TransportConfig};
