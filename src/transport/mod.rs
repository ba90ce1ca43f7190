//! TCP Transport Module
//!
//! Both member channels share one wire format (u16 length-prefixed frames)
//! and one server implementation. A server is parameterized by its
//! [`ConnectionPipeline`], which picks the codec entry point and dispatch
//! stage for the channel role.

pub mod frame;
pub mod pipeline;
pub mod server;
pub mod stats;

pub use frame::{encode_frame, FrameCodec, MAX_FRAME_LEN};
pub use pipeline::{ChannelRole, ConnectionPipeline, DispatchStage};
pub use server::{ChannelServer, ServerState};
pub use stats::{FrozenServerStats, ServerStats};
