//! Frame codec.
//!
//! Frames are laid out as:
//! - 1 byte: message kind
//! - 4 bytes: big-endian request id
//! - 4 bytes: big-endian payload length
//! - N bytes: payload

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{MAX_BUFFERED_BYTES, MAX_FRAME_PAYLOAD};
use crate::error::{P2pError, P2pResult};
use crate::protocol::{Frame, MessageKind};

/// Header size: kind + request id + length.
pub const HEADER_SIZE: usize = 9;

/// Decoded but not yet complete frame header.
#[derive(Debug, Clone, Copy)]
struct PendingHeader {
    kind: MessageKind,
    request_id: u32,
    length: usize,
}

/// Codec for the binary frame format.
#[derive(Debug, Default)]
pub struct FrameCodec {
    current: Option<PendingHeader>,
}

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self { current: None }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = P2pError;

    fn decode(&mut self, src: &mut BytesMut) -> P2pResult<Option<Self::Item>> {
        if src.len() > MAX_BUFFERED_BYTES + HEADER_SIZE {
            return Err(P2pError::BufferOverrun {
                buffered: src.len(),
                max: MAX_BUFFERED_BYTES,
            });
        }

        let header = match self.current {
            Some(header) => header,
            None => {
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }

                let kind = MessageKind::try_from(src[0])?;
                let request_id = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
                let length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;

                if length > MAX_FRAME_PAYLOAD {
                    return Err(P2pError::FrameTooLarge {
                        size: length,
                        max: MAX_FRAME_PAYLOAD,
                    });
                }

                src.advance(HEADER_SIZE);
                let header = PendingHeader {
                    kind,
                    request_id,
                    length,
                };
                self.current = Some(header);
                header
            }
        };

        if src.len() < header.length {
            src.reserve(header.length - src.len());
            return Ok(None);
        }

        let payload = src.split_to(header.length).freeze();
        self.current = None;

        Ok(Some(Frame::new(header.kind, header.request_id, payload)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = P2pError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> P2pResult<()> {
        let length = frame.payload.len();
        if length > MAX_FRAME_PAYLOAD {
            return Err(P2pError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_PAYLOAD,
            });
        }

        dst.reserve(HEADER_SIZE + length);
        dst.put_u8(frame.kind as u8);
        dst.put_u32(frame.request_id);
        dst.put_u32(length as u32);
        dst.put_slice(&frame.payload);

        Ok(())
    }
}
