//! Message codecs
//!
//! Turns a frame payload into a typed message. The transport only knows
//! the [`MessageCodec`] trait; [`BincodeCodec`] is the default binary
//! encoding used between members.
pub mod messages;

use bytes::Bytes;

pub use messages::{milliseconds_since_midnight, Envelope, GossipMessage};

pub use crate::error::DecodeError;

use crate::error::Result;
use crate::transport::frame::MAX_FRAME_LEN;

// Ceiling on what one decoded payload may claim in memory. Every element
// costs at least one byte on the wire and at most 64 bytes once decoded,
// so no payload that fits in a frame can reach it.
const DECODE_LIMIT: usize = 64 * MAX_FRAME_LEN;

/// Pure, synchronous payload decoding for both channels.
pub trait MessageCodec: Send + Sync {
    fn decode_gossip(&self, payload: &[u8]) -> std::result::Result<GossipMessage, DecodeError>;

    fn decode_envelope(&self, payload: &[u8]) -> std::result::Result<Envelope, DecodeError>;
}

/// Bincode (big endian, varint) payload codec
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeCodec;

impl BincodeCodec {
    fn config() -> impl bincode::config::Config {
        bincode::config::standard().with_big_endian()
    }

    // Length prefixes are checked against the limit before anything is
    // allocated for them.
    fn decode_config() -> impl bincode::config::Config {
        bincode::config::standard()
            .with_big_endian()
            .with_limit::<{ DECODE_LIMIT }>()
    }

    pub fn encode_gossip(&self, message: &GossipMessage) -> Result<Bytes> {
        Ok(Bytes::from(bincode::encode_to_vec(message, Self::config())?))
    }

    pub fn encode_envelope(&self, envelope: &Envelope) -> Result<Bytes> {
        Ok(Bytes::from(bincode::encode_to_vec(envelope, Self::config())?))
    }
}

fn ensure_consumed(consumed: usize, total: usize) -> std::result::Result<(), DecodeError> {
    if consumed != total {
        return Err(DecodeError::Malformed(format!(
            "{} trailing bytes after message",
            total - consumed
        )));
    }
    Ok(())
}

impl MessageCodec for BincodeCodec {
    fn decode_gossip(&self, payload: &[u8]) -> std::result::Result<GossipMessage, DecodeError> {
        let (message, consumed): (GossipMessage, usize) =
            bincode::decode_from_slice(payload, Self::decode_config()).map_err(DecodeError::Gossip)?;
        ensure_consumed(consumed, payload.len())?;
        Ok(message)
    }

    fn decode_envelope(&self, payload: &[u8]) -> std::result::Result<Envelope, DecodeError> {
        let (envelope, consumed): (Envelope, usize) =
            bincode::decode_from_slice(payload, Self::decode_config()).map_err(DecodeError::Envelope)?;
        ensure_consumed(consumed, payload.len())?;
        Ok(envelope)
    }
}
