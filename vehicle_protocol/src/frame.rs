// frame.rs — fixed header + authenticated ciphertext
//
// On-wire layout (big endian):
//   [sequence u32] [correlation token u32] [payload length u32] [payload]
// where payload = ciphertext || 16-byte tag.

use crate::cipher::TAG_LEN;
use crate::error::MalformedFrame;

pub const HEADER_LEN: usize = 12;
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Token reserved for traffic that answers no command (keepalive, relay pushes).
pub const UNSOLICITED_TOKEN: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u32,
    pub correlation_token: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn wrap(sequence: u32, correlation_token: u32, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            correlation_token,
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.correlation_token.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Declared payload length of a buffered header, if the header is complete.
    pub fn declared_len(buf: &[u8]) -> Option<usize> {
        let len = buf.get(8..HEADER_LEN)?;
        Some(u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize)
    }

    /// Parse exactly one frame; `bytes` must hold the header and the declared payload, no more.
    pub fn unwrap(bytes: &[u8]) -> Result<Frame, MalformedFrame> {
        if bytes.len() < HEADER_LEN {
            return Err(MalformedFrame::ShortHeader { got: bytes.len() });
        }
        let word = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let sequence = word(0);
        let correlation_token = word(4);
        let declared = word(8) as usize;

        if declared > MAX_PAYLOAD {
            return Err(MalformedFrame::Oversized(declared));
        }
        let available = bytes.len() - HEADER_LEN;
        if declared != available {
            return Err(MalformedFrame::LengthMismatch {
                declared,
                available,
            });
        }
        if declared < TAG_LEN {
            return Err(MalformedFrame::PayloadTooShort(declared));
        }

        Ok(Frame {
            sequence,
            correlation_token,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}
