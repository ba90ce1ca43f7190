//! Channel server counters
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared between a server's accept loop and its connections
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_closed: AtomicU64,
    pub frames_received: AtomicU64,
    pub messages_dispatched: AtomicU64,
    pub decode_errors: AtomicU64,
    pub dispatch_errors: AtomicU64,
    pub io_errors: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrozenServerStats {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub frames_received: u64,
    pub messages_dispatched: u64,
    pub decode_errors: u64,
    pub dispatch_errors: u64,
    pub io_errors: u64,
}

impl ServerStats {
    pub fn freeze(&self) -> FrozenServerStats {
        FrozenServerStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}
