//! Per-connection processing pipeline
//!
//! Every accepted connection runs the same three stages: frame splitting,
//! payload decoding, and dispatch. Only the codec entry point and the
//! dispatch stage depend on the channel role.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::MessageCodec;
use crate::dispatch::{DataForwarder, GossipBus};
use crate::error::Result;
use crate::transport::frame::FrameCodec;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Gossip,
    Data,
}

impl std::fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelRole::Gossip => write!(f, "gossip"),
            ChannelRole::Data => write!(f, "data"),
        }
    }
}

/// Where decoded messages go
#[derive(Clone, Debug)]
pub enum DispatchStage {
    /// Publish onto the asynchronous fan-out bus
    Gossip(Arc<GossipBus>),
    /// Hand off synchronously to the outbound registry
    Data(DataForwarder),
}

#[derive(Clone)]
pub struct ConnectionPipeline {
    codec: Arc<dyn MessageCodec>,
    dispatch: DispatchStage,
}

impl std::fmt::Debug for ConnectionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPipeline")
            .field("role", &self.role())
            .finish()
    }
}

impl ConnectionPipeline {
    pub fn gossip(codec: Arc<dyn MessageCodec>, bus: Arc<GossipBus>) -> Self {
        Self {
            codec,
            dispatch: DispatchStage::Gossip(bus),
        }
    }

    pub fn data(codec: Arc<dyn MessageCodec>, forwarder: DataForwarder) -> Self {
        Self {
            codec,
            dispatch: DispatchStage::Data(forwarder),
        }
    }

    pub fn role(&self) -> ChannelRole {
        match self.dispatch {
            DispatchStage::Gossip(_) => ChannelRole::Gossip,
            DispatchStage::Data(_) => ChannelRole::Data,
        }
    }

    /// Fresh frame splitter for a new connection
    pub fn framer(&self) -> FrameCodec {
        FrameCodec::new()
    }

    /// Decode one frame payload and dispatch the result.
    pub fn handle_frame(&self, payload: &[u8]) -> Result<()> {
        match &self.dispatch {
            DispatchStage::Gossip(bus) => {
                let message = self.codec.decode_gossip(payload)?;
                bus.publish(message)
            }
            DispatchStage::Data(forwarder) => {
                let envelope = self.codec.decode_envelope(payload)?;
                forwarder.forward(envelope)
            }
        }
    }
}
