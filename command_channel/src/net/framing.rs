// net/framing.rs — length-prefixed frame codec for the relay byte stream
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use vehicle_protocol::{Frame, MalformedFrame, HEADER_LEN, MAX_PAYLOAD};

use crate::errors::ChannelError;

/// Splits the stream into whole frames and hands each one to `Frame::unwrap`.
///
/// A frame that is complete but malformed is consumed and yielded as `Err`,
/// so the connection keeps going. An oversized length prefix cannot be
/// skipped reliably and fails the stream.
#[derive(Debug, Default, Clone)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Result<Frame, MalformedFrame>;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(len) = Frame::declared_len(src) else {
            return Ok(None);
        };
        if len > MAX_PAYLOAD {
            return Err(MalformedFrame::Oversized(len).into());
        }
        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let raw = src.split_to(total);
        Ok(Some(Frame::unwrap(&raw)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ChannelError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(MalformedFrame::Oversized(frame.payload.len()).into());
        }
        dst.reserve(frame.encoded_len());
        dst.put_u32(frame.sequence);
        dst.put_u32(frame.correlation_token);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
