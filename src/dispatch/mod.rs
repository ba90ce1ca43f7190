//! Dispatch of decoded messages
//!
//! Gossip messages fan out asynchronously through [`GossipBus`]; data
//! envelopes are forwarded synchronously through [`DataForwarder`].
pub mod bus;
pub mod forwarder;

pub use bus::{FrozenBusStats, GossipBus, GossipListener, SubscriptionId};
pub use forwarder::{DataForwarder, LocalDelivery, OutboundRegistry};
