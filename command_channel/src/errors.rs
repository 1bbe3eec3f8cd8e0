// errors.rs — connection-level failures of the command channel
use thiserror::Error;
use vehicle_protocol::{CipherError, MalformedFrame};

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("IO: {0}")] Io(#[from] std::io::Error),
    #[error("Framing: {0}")] Framing(#[from] MalformedFrame),
    #[error("Cipher: {0}")] Cipher(#[from] CipherError),
}
