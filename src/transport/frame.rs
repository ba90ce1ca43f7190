//! Length-prefixed framing shared by both channels.
//!
//! Each frame is a 2-byte big-endian length followed by exactly that many
//! payload bytes: `[u16 length][payload bytes]`. No magic, version or
//! checksum; corrupt payloads surface at the codec layer.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{MemberError, Result};
use crate::frame_error;

pub const LENGTH_PREFIX_LEN: usize = 2;
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Splits a byte stream into frame payloads.
///
/// One instance belongs to one connection. A frame that is not fully
/// buffered yet leaves the buffer untouched and yields `None`, so bytes
/// from later reads are appended and decoding resumes where it stopped.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCodec {
    // Declared length of the frame currently being assembled
    pending: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = MemberError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let len = match self.pending {
            Some(len) => len,
            None => {
                if src.len() < LENGTH_PREFIX_LEN {
                    return Ok(None);
                }
                let len = src.get_u16() as usize;
                self.pending = Some(len);
                len
            }
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.pending = None;
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.pending.is_none() => Ok(None),
            None => {
                let buffered = src.len();
                let declared = self.pending.take();
                src.clear();
                Err(frame_error!(
                    "connection closed mid-frame ({} bytes buffered, {:?} declared)",
                    buffered,
                    declared
                ))
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = MemberError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        let len = u16::try_from(payload.len()).map_err(|_| {
            frame_error!(
                "payload of {} bytes exceeds {} byte frame limit",
                payload.len(),
                MAX_FRAME_LEN
            )
        })?;
        dst.reserve(LENGTH_PREFIX_LEN + payload.len());
        dst.put_u16(len);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Encode a single payload as a complete frame.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    FrameCodec::new().encode(Bytes::copy_from_slice(payload), &mut dst)?;
    Ok(dst.freeze())
}
