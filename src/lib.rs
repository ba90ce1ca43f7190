//! Network transport and dispatch engine for a gossip cluster member.
//!
//! A member runs two TCP channels sharing one length-prefixed framing:
//! the gossip channel fans decoded messages out to listeners through an
//! asynchronous bus, and the data channel forwards decoded envelopes to
//! the outbound registry.
pub mod cli;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod member;
pub mod settings;
pub mod transport;

pub use error::{MemberError, Result};
pub use member::{Member, MemberIdentity, MemberStatus};
