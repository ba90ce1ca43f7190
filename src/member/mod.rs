//! Local cluster member
//!
//! [`Member`] owns the gossip dispatch bus and both channel servers and
//! coordinates their startup and shutdown.
pub mod identity;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

use crate::codec::{BincodeCodec, Envelope, MessageCodec};
use crate::dispatch::{
    DataForwarder, FrozenBusStats, GossipBus, GossipListener, OutboundRegistry, SubscriptionId,
};
use crate::error::{MemberError, Result};
use crate::lifecycle_error;
use crate::settings::Settings;
use crate::transport::{
    ChannelRole, ChannelServer, ConnectionPipeline, FrozenServerStats, ServerState,
};
pub use identity::{MemberIdentity, MemberStatus};

pub struct Member {
    identity: MemberIdentity,
    settings: Settings,
    codec: Arc<dyn MessageCodec>,
    registry: Arc<dyn OutboundRegistry>,
    bus: Option<Arc<GossipBus>>,
    gossip_server: Option<ChannelServer>,
    data_server: Option<ChannelServer>,
    status: MemberStatus,
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("identity", &self.identity)
            .field("status", &self.status)
            .field("gossip_state", &self.gossip_state())
            .field("data_state", &self.data_state())
            .finish()
    }
}

impl Member {
    /// Member using the default bincode payload codec
    pub fn new(settings: Settings, registry: Arc<dyn OutboundRegistry>) -> Self {
        Self::with_codec(settings, registry, Arc::new(BincodeCodec))
    }

    pub fn with_codec(
        settings: Settings,
        registry: Arc<dyn OutboundRegistry>,
        codec: Arc<dyn MessageCodec>,
    ) -> Self {
        Self {
            identity: settings.identity(),
            settings,
            codec,
            registry,
            bus: None,
            gossip_server: None,
            data_server: None,
            status: MemberStatus::Unknown,
        }
    }

    pub fn identity(&self) -> &MemberIdentity {
        &self.identity
    }

    pub fn status(&self) -> MemberStatus {
        self.status
    }

    /// Start the gossip bus, then both channel servers, each launched on
    /// its own thread. A bind failure on one channel does not stop the
    /// other; the first failure is returned once both launches finish.
    pub fn initialize(&mut self) -> Result<()> {
        if self.status != MemberStatus::Unknown {
            return Err(lifecycle_error!(
                "member {} cannot initialize from status {}",
                self.identity,
                self.status
            ));
        }
        self.settings.validate()?;
        info!(
            "[Member<{}>] Initializing gossip server on {}:{}",
            self.identity,
            self.identity.ip(),
            self.identity.gossip_port()
        );

        let bus = Arc::new(GossipBus::start()?);
        self.bus = Some(Arc::clone(&bus));

        let mut gossip = ChannelServer::new(
            self.settings.channel_config(ChannelRole::Gossip),
            ConnectionPipeline::gossip(Arc::clone(&self.codec), bus),
        );
        let mut data = ChannelServer::new(
            self.settings.channel_config(ChannelRole::Data),
            ConnectionPipeline::data(
                Arc::clone(&self.codec),
                DataForwarder::new(Arc::clone(&self.registry)),
            ),
        );

        let outcomes: Vec<Result<SocketAddr>> = thread::scope(|scope| {
            let launches: Vec<_> = [&mut gossip, &mut data]
                .into_iter()
                .map(|server| {
                    thread::Builder::new()
                        .name(format!("{}-server", server.role()))
                        .spawn_scoped(scope, move || server.start())
                })
                .collect();
            launches
                .into_iter()
                .map(|launched| match launched {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        Err(MemberError::Concurrency("server launcher panicked".to_string()))
                    }),
                    Err(e) => Err(MemberError::Io(e)),
                })
                .collect()
        });

        let mut failures = Vec::new();
        for (mut server, outcome) in [gossip, data].into_iter().zip(outcomes) {
            if let Err(e) = settle_launch(&mut server, outcome) {
                failures.push(e);
            }
            self.store(server);
        }

        let listening = [self.gossip_state(), self.data_state()]
            .iter()
            .any(|state| *state == ServerState::Listening);
        self.status = if listening {
            MemberStatus::Alive
        } else {
            MemberStatus::Failed
        };

        if failures.is_empty() {
            info!("[Member<{}>] Member is {}", self.identity, self.status);
            return Ok(());
        }
        for e in &failures {
            error!("[Member<{}>] Channel failed to start: {}", self.identity, e);
        }
        Err(failures.swap_remove(0))
    }

    fn store(&mut self, server: ChannelServer) {
        match server.role() {
            ChannelRole::Gossip => self.gossip_server = Some(server),
            ChannelRole::Data => self.data_server = Some(server),
        }
    }

    /// Register a listener for every gossip message decoded from now on.
    pub fn subscribe_gossip<L>(&self, listener: L) -> Result<SubscriptionId>
    where
        L: GossipListener + 'static,
    {
        self.bus()?.subscribe(listener)
    }

    pub fn unsubscribe_gossip(&self, id: SubscriptionId) -> Result<bool> {
        self.bus()?.unsubscribe(id)
    }

    fn bus(&self) -> Result<&Arc<GossipBus>> {
        self.bus
            .as_ref()
            .ok_or_else(|| lifecycle_error!("gossip bus is not initialized"))
    }

    /// Hand an envelope to the outbound send path.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.registry.send(envelope)
    }

    /// Stop both servers and close the bus. Every step runs even if an
    /// earlier one failed; all failures are returned together.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.status == MemberStatus::Left {
            return Ok(());
        }
        info!("[Member<{}>] Shutting down", self.identity);

        let mut failures = Vec::new();
        let servers = [self.gossip_server.as_mut(), self.data_server.as_mut()];
        let results: Vec<Result<()>> = thread::scope(|scope| {
            let stops: Vec<_> = servers
                .into_iter()
                .flatten()
                .map(|server| scope.spawn(move || server.stop()))
                .collect();
            stops
                .into_iter()
                .map(|stop| {
                    stop.join().unwrap_or_else(|_| {
                        Err(MemberError::Concurrency("server stop panicked".to_string()))
                    })
                })
                .collect()
        });
        failures.extend(results.into_iter().filter_map(|r| r.err()));

        if let Some(bus) = &self.bus {
            if let Err(e) = bus.close(self.settings.shutdown_timeout()) {
                failures.push(e);
            }
        }
        self.status = MemberStatus::Left;

        if failures.is_empty() {
            info!("[Member<{}>] Shutdown complete", self.identity);
            return Ok(());
        }
        for e in &failures {
            warn!("[Member<{}>] Shutdown step failed: {}", self.identity, e);
        }
        Err(MemberError::Shutdown(failures))
    }

    pub fn gossip_state(&self) -> ServerState {
        state_of(self.gossip_server.as_ref())
    }

    pub fn data_state(&self) -> ServerState {
        state_of(self.data_server.as_ref())
    }

    /// Bound gossip address once listening
    pub fn gossip_addr(&self) -> Option<SocketAddr> {
        self.gossip_server.as_ref().and_then(|s| s.local_addr())
    }

    /// Bound data address once listening
    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.data_server.as_ref().and_then(|s| s.local_addr())
    }

    pub fn gossip_stats(&self) -> Option<FrozenServerStats> {
        self.gossip_server.as_ref().map(|s| s.stats())
    }

    pub fn data_stats(&self) -> Option<FrozenServerStats> {
        self.data_server.as_ref().map(|s| s.stats())
    }

    pub fn bus_stats(&self) -> Option<FrozenBusStats> {
        self.bus.as_ref().map(|b| b.stats())
    }
}

fn state_of(server: Option<&ChannelServer>) -> ServerState {
    server.map(|s| s.state()).unwrap_or(ServerState::Unstarted)
}

// A server whose launch did not end in listening is marked stopped, so a
// spawn failure or launcher panic never leaves a channel reported unstarted.
fn settle_launch(server: &mut ChannelServer, outcome: Result<SocketAddr>) -> Result<SocketAddr> {
    if server.state() != ServerState::Listening {
        server.stop()?;
    }
    outcome
}
