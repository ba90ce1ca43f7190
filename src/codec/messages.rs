//! Member Message Types
//!
//! Both channels carry opaque payloads; these are the typed forms the
//! default codec produces. All messages derive serde traits as well as
//! bincode traits but are serialized differently based on context:
//!
//! - Wire payloads (gossip and data channels): bincode, big endian
//! - Logs and diagnostics: serde_json
//!
use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::member::MemberIdentity;

/// Milliseconds elapsed since UTC midnight, the timestamp both message
/// types carry.
pub fn milliseconds_since_midnight() -> u32 {
    let now = Utc::now();
    now.num_seconds_from_midnight() * 1000 + now.timestamp_subsec_millis().min(999)
}

/// Control-plane membership message
#[derive(Clone, Debug, Default, Decode, Encode, Deserialize, Serialize, PartialEq)]
pub struct GossipMessage {
    pub ip: String,
    pub gossip_port: u16,
    pub data_port: u16,
    pub milliseconds_since_midnight: u32,
    pub public_key: Option<Vec<u8>>,
    pub tags: BTreeMap<String, String>,
    /// Known members as `ip:gossip_port:data_port` keys
    pub members: Vec<String>,
    /// Vector clock, one entry per entry in `members`
    pub clock: Vec<u32>,
    /// Topic registrations per member key
    pub event_listeners: BTreeMap<String, Vec<String>>,
}

impl GossipMessage {
    /// Start a message describing `identity`, stamped with the current time.
    pub fn from_identity(identity: &MemberIdentity) -> Self {
        Self {
            ip: identity.ip().to_string(),
            gossip_port: identity.gossip_port(),
            data_port: identity.data_port(),
            milliseconds_since_midnight: milliseconds_since_midnight(),
            ..Self::default()
        }
    }

    pub fn sender_key(&self) -> String {
        format!("{}:{}:{}", self.ip, self.gossip_port, self.data_port)
    }
}

/// Data-plane message awaiting application-level interpretation
#[derive(Clone, Debug, Default, Decode, Encode, Deserialize, Serialize, PartialEq)]
pub struct Envelope {
    pub sender_key: String,
    pub encrypted: bool,
    pub key: Option<Vec<u8>>,
    pub execute_time: i64,
    pub milliseconds_since_midnight: u32,
    pub topic: String,
    pub partition: String,
    pub class_name: String,
    pub payload: Vec<u8>,
    /// False until the application layer has interpreted `payload`
    pub decoded: bool,
}

impl Envelope {
    pub fn new(sender_key: impl Into<String>, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            sender_key: sender_key.into(),
            topic: topic.into(),
            payload,
            milliseconds_since_midnight: milliseconds_since_midnight(),
            ..Self::default()
        }
    }

    /// Envelopes arriving off the wire still need higher-level decoding.
    pub fn mark_undecoded(&mut self) {
        self.decoded = false;
    }
}
