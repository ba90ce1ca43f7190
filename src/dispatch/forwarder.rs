//! Data channel forwarding
//!
//! Envelopes decoded off the data channel are handed, one at a time and
//! synchronously, to the member's outbound send path.
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use crate::codec::Envelope;
use crate::error::{MemberError, Result};

/// Process-wide send/route path: re-transmission to another member or
/// local delivery. Failures are reported as `MemberError::Io`.
pub trait OutboundRegistry: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<()>;
}

/// Hands decoded data envelopes to an [`OutboundRegistry`]
#[derive(Clone)]
pub struct DataForwarder {
    registry: Arc<dyn OutboundRegistry>,
}

impl std::fmt::Debug for DataForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataForwarder").finish_non_exhaustive()
    }
}

impl DataForwarder {
    pub fn new(registry: Arc<dyn OutboundRegistry>) -> Self {
        Self { registry }
    }

    pub fn forward(&self, mut envelope: Envelope) -> Result<()> {
        envelope.mark_undecoded();
        trace!(
            "Forwarding envelope from {} on topic {}",
            envelope.sender_key,
            envelope.topic
        );
        self.registry.send(envelope)
    }
}

/// Registry that delivers every envelope to a local channel
#[derive(Clone, Debug)]
pub struct LocalDelivery {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl LocalDelivery {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutboundRegistry for LocalDelivery {
    fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx.send(envelope).map_err(|_| {
            MemberError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "local envelope receiver dropped",
            ))
        })
    }
}
