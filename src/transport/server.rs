//! TCP channel server
//!
//! One server per channel role. Each owns its listening socket plus two
//! runtimes of its own: an acceptor pool that only accepts connections and
//! a worker pool that runs every connection's read, decode and dispatch
//! work. Nothing is shared with the sibling channel.
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use socket2::SockRef;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::{self, Runtime};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::pipeline::{ChannelRole, ConnectionPipeline};
use super::stats::{FrozenServerStats, ServerStats};
use crate::error::{MemberError, Result};
use crate::lifecycle_error;
use crate::settings::ChannelConfig;

// Grace period for runtime threads after the connection drain
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Unstarted,
    Binding,
    Listening,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Unstarted => write!(f, "unstarted"),
            ServerState::Binding => write!(f, "binding"),
            ServerState::Listening => write!(f, "listening"),
            ServerState::ShuttingDown => write!(f, "shutting-down"),
            ServerState::Stopped => write!(f, "stopped"),
        }
    }
}

struct RunningServer {
    acceptor: Runtime,
    workers: Runtime,
    shutdown: CancellationToken,
    connections: TaskTracker,
    accept_loop: JoinHandle<()>,
}

/// Accepts connections for one channel and runs each through the
/// channel's [`ConnectionPipeline`].
///
/// `start` and `stop` block the calling thread and must not be called
/// from inside an async context.
pub struct ChannelServer {
    config: ChannelConfig,
    pipeline: ConnectionPipeline,
    state: ServerState,
    local_addr: Option<SocketAddr>,
    stats: Arc<ServerStats>,
    running: Option<RunningServer>,
}

impl std::fmt::Debug for ChannelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelServer")
            .field("role", &self.config.role)
            .field("state", &self.state)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl ChannelServer {
    pub fn new(config: ChannelConfig, pipeline: ConnectionPipeline) -> Self {
        Self {
            config,
            pipeline,
            state: ServerState::Unstarted,
            local_addr: None,
            stats: Arc::new(ServerStats::default()),
            running: None,
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.config.role
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Bound address once listening; resolves port 0 to the real port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> FrozenServerStats {
        self.stats.freeze()
    }

    /// Bind the listening socket and start accepting connections.
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.state != ServerState::Unstarted {
            return Err(lifecycle_error!(
                "{} server cannot start from state {}",
                self.config.role,
                self.state
            ));
        }

        self.state = ServerState::Binding;
        match self.bind_and_listen() {
            Ok(addr) => {
                self.state = ServerState::Listening;
                self.local_addr = Some(addr);
                info!("[{}] Listening on {}", self.config.role, addr);
                Ok(addr)
            }
            Err(e) => {
                self.state = ServerState::Stopped;
                error!("[{}] Cannot initialize server: {}", self.config.role, e);
                Err(e)
            }
        }
    }

    fn bind_and_listen(&mut self) -> Result<SocketAddr> {
        let role = self.config.role;
        let ip = self.config.listen_address.parse::<IpAddr>()?;
        let addr = SocketAddr::new(ip, self.config.port);

        let workers = runtime::Builder::new_multi_thread()
            .worker_threads(self.config.worker_threads)
            .thread_name(format!("{}-worker", role))
            .enable_all()
            .build()?;
        let acceptor = runtime::Builder::new_multi_thread()
            .worker_threads(self.config.acceptor_threads)
            .thread_name(format!("{}-acceptor", role))
            .enable_all()
            .build()?;

        let listener = {
            let _guard = acceptor.enter();
            bind_listener(addr, self.config.backlog)
                .map_err(|source| MemberError::Bind { addr, source })?
        };
        let local_addr = listener
            .local_addr()
            .map_err(|source| MemberError::Bind { addr, source })?;

        let shutdown = CancellationToken::new();
        let connections = TaskTracker::new();
        let accept_loop = acceptor.spawn(accept_loop(
            listener,
            AcceptContext {
                workers: workers.handle().clone(),
                pipeline: self.pipeline.clone(),
                shutdown: shutdown.clone(),
                connections: connections.clone(),
                stats: Arc::clone(&self.stats),
                keepalive: self.config.keepalive,
            },
        ));

        self.running = Some(RunningServer {
            acceptor,
            workers,
            shutdown,
            connections,
            accept_loop,
        });
        Ok(local_addr)
    }

    /// Stop accepting, signal open connections to close, and release the
    /// socket and both pools. Connections still open after the configured
    /// timeout are force-closed. Safe to call in any state.
    pub fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            if self.state != ServerState::Stopped {
                debug!("[{}] Stop requested before start", self.config.role);
                self.state = ServerState::Stopped;
            }
            return Ok(());
        };

        let role = self.config.role;
        let deadline = self.config.shutdown_timeout;
        self.state = ServerState::ShuttingDown;
        info!("[{}] Shutting down server", role);

        let RunningServer {
            acceptor,
            workers,
            shutdown,
            connections,
            accept_loop,
        } = running;

        shutdown.cancel();
        connections.close();
        let drained = workers.block_on(async move {
            tokio::time::timeout(deadline, async move {
                if let Err(e) = accept_loop.await {
                    warn!("[{}] Accept loop ended abnormally: {}", role, e);
                }
                connections.wait().await;
            })
            .await
            .is_ok()
        });

        acceptor.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
        workers.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
        self.state = ServerState::Stopped;

        if drained {
            info!("[{}] Server stopped", role);
            Ok(())
        } else {
            let remaining = self.stats.connections_active.load(Ordering::Relaxed);
            warn!(
                "[{}] {} connections still open after {:?}, force-closed",
                role, remaining, deadline
            );
            Err(MemberError::Interrupted(format!(
                "{} server force-closed connections after {:?}",
                role, deadline
            )))
        }
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.cancel();
            running.acceptor.shutdown_background();
            running.workers.shutdown_background();
        }
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

struct AcceptContext {
    workers: runtime::Handle,
    pipeline: ConnectionPipeline,
    shutdown: CancellationToken,
    connections: TaskTracker,
    stats: Arc<ServerStats>,
    keepalive: bool,
}

async fn accept_loop(listener: TcpListener, ctx: AcceptContext) {
    let role = ctx.pipeline.role();
    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => {
                debug!("[{}] No longer accepting connections", role);
                break;
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                ctx.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] TCP accept failed: {}", role, e);
                continue;
            }
        };

        // Re-register the socket with the worker pool's reactor
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                ctx.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] Could not hand off connection from {}: {}", role, peer_addr, e);
                continue;
            }
        };
        if ctx.keepalive {
            if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
                warn!("[{}] Could not enable keep-alive for {}: {}", role, peer_addr, e);
            }
        }

        ctx.stats.connection_opened();
        let guard = ConnectionGuard(Arc::clone(&ctx.stats));
        ctx.connections.spawn_on(
            serve_connection(
                stream,
                peer_addr,
                ctx.pipeline.clone(),
                ctx.shutdown.child_token(),
                guard,
            ),
            &ctx.workers,
        );
    }
}

// Keeps the active-connection gauge right even when a task is dropped by
// a forced runtime shutdown.
struct ConnectionGuard(Arc<ServerStats>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

async fn serve_connection(
    stream: std::net::TcpStream,
    peer_addr: SocketAddr,
    pipeline: ConnectionPipeline,
    shutdown: CancellationToken,
    guard: ConnectionGuard,
) {
    let role = pipeline.role();
    let stats = Arc::clone(&guard.0);
    let stream = match TcpStream::from_std(stream) {
        Ok(stream) => stream,
        Err(e) => {
            stats.io_errors.fetch_add(1, Ordering::Relaxed);
            warn!("[{}] Could not register connection from {}: {}", role, peer_addr, e);
            return;
        }
    };
    debug!("[{}] TCP client connected: {}", role, peer_addr);

    let mut frames = FramedRead::new(stream, pipeline.framer());
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("[{}] Closing {} for shutdown", role, peer_addr);
                break;
            }
            next = frames.next() => next,
        };

        let payload = match next {
            Some(Ok(payload)) => payload,
            Some(Err(MemberError::Io(e))) => {
                stats.io_errors.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] Error in TCP client {}: {}", role, peer_addr, e);
                break;
            }
            Some(Err(e)) => {
                warn!("[{}] Dropping connection from {}: {}", role, peer_addr, e);
                break;
            }
            None => {
                debug!("[{}] TCP client disconnected: {}", role, peer_addr);
                break;
            }
        };

        stats.frames_received.fetch_add(1, Ordering::Relaxed);
        match pipeline.handle_frame(&payload) {
            Ok(()) => {
                stats.messages_dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(MemberError::Decode(e)) => {
                stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                error!("[{}] Error decoding message from {}: {}", role, peer_addr, e);
            }
            Err(MemberError::Interrupted(msg)) => {
                info!("[{}] Closing {}: {}", role, peer_addr, msg);
                break;
            }
            Err(e) => {
                stats.dispatch_errors.fetch_add(1, Ordering::Relaxed);
                error!("[{}] Error dispatching message from {}: {}", role, peer_addr, e);
            }
        }
    }
    drop(guard);
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::time::Instant;

    use super::*;
    use crate::codec::{BincodeCodec, DecodeError, Envelope, GossipMessage, MessageCodec};
    use crate::dispatch::{DataForwarder, OutboundRegistry};
    use crate::settings::Settings;
    use crate::transport::frame::encode_frame;

    // Treats every payload as the raw body of an envelope; "bad" fails.
    struct RawCodec;

    impl MessageCodec for RawCodec {
        fn decode_gossip(&self, _: &[u8]) -> std::result::Result<GossipMessage, DecodeError> {
            Err(DecodeError::Malformed("not a gossip codec".to_string()))
        }

        fn decode_envelope(&self, payload: &[u8]) -> std::result::Result<Envelope, DecodeError> {
            if payload == b"bad" {
                return Err(DecodeError::Malformed("bad payload".to_string()));
            }
            Ok(Envelope {
                payload: payload.to_vec(),
                decoded: true,
                ..Envelope::default()
            })
        }
    }

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Envelope>>,
        fail: bool,
    }

    impl OutboundRegistry for Recording {
        fn send(&self, envelope: Envelope) -> Result<()> {
            self.sent.lock().unwrap().push(envelope);
            if self.fail {
                return Err(MemberError::Io(std::io::Error::other("peer unreachable")));
            }
            Ok(())
        }
    }

    // Holds the connection's worker for `hold` inside every send
    struct Stalled {
        entered: AtomicBool,
        hold: Duration,
    }

    impl OutboundRegistry for Stalled {
        fn send(&self, _: Envelope) -> Result<()> {
            self.entered.store(true, Ordering::SeqCst);
            std::thread::sleep(self.hold);
            Ok(())
        }
    }

    fn data_server(registry: Arc<Recording>) -> ChannelServer {
        let mut settings = Settings::loopback();
        settings.shutdown_timeout_ms = 1000;
        let pipeline = ConnectionPipeline::data(Arc::new(RawCodec), DataForwarder::new(registry));
        ChannelServer::new(settings.channel_config(ChannelRole::Data), pipeline)
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn test_lifecycle_states() {
        let mut server = data_server(Arc::new(Recording::default()));
        assert_eq!(server.state(), ServerState::Unstarted);

        let addr = server.start().unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        assert_ne!(addr.port(), 0);
        assert!(server.start().is_err());

        server.stop().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        // idempotent
        server.stop().unwrap();
        assert!(std::net::TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_stop_before_start() {
        let mut server = data_server(Arc::new(Recording::default()));
        server.stop().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_bind_failure() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let registry = Arc::new(Recording::default());
        let mut settings = Settings::loopback();
        settings.data_port = port;
        let pipeline = ConnectionPipeline::data(Arc::new(RawCodec), DataForwarder::new(registry));
        let mut server = ChannelServer::new(settings.channel_config(ChannelRole::Data), pipeline);

        let err = server.start().unwrap_err();
        assert!(matches!(err, MemberError::Bind { .. }));
        assert_eq!(server.state(), ServerState::Stopped);
        server.stop().unwrap();
    }

    #[test]
    fn test_decode_error_keeps_connection_open() {
        let registry = Arc::new(Recording::default());
        let mut server = data_server(registry.clone());
        let addr = server.start().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(&encode_frame(b"bad").unwrap()).unwrap();
        client.write_all(&encode_frame(b"good").unwrap()).unwrap();

        assert!(wait_until(|| registry.sent.lock().unwrap().len() == 1));
        let sent = registry.sent.lock().unwrap().clone();
        assert_eq!(sent[0].payload, b"good");
        assert!(!sent[0].decoded);

        let stats = server.stats();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.connections_active, 1);

        server.stop().unwrap();
        assert!(wait_until(|| server.stats().connections_active == 0));
    }

    #[test]
    fn test_send_failure_keeps_connection_open() {
        let registry = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let mut server = data_server(registry.clone());
        let addr = server.start().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(&encode_frame(b"one").unwrap()).unwrap();
        client.write_all(&encode_frame(b"two").unwrap()).unwrap();

        assert!(wait_until(|| registry.sent.lock().unwrap().len() == 2));
        assert_eq!(server.stats().dispatch_errors, 2);
        server.stop().unwrap();
    }

    #[test]
    fn test_fragmented_writes() {
        let registry = Arc::new(Recording::default());
        let mut server = data_server(registry.clone());
        let addr = server.start().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nodelay(true).unwrap();
        for byte in encode_frame(b"split").unwrap().iter() {
            client.write_all(&[*byte]).unwrap();
            client.flush().unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }

        assert!(wait_until(|| registry.sent.lock().unwrap().len() == 1));
        assert_eq!(registry.sent.lock().unwrap()[0].payload, b"split");
        server.stop().unwrap();
    }

    #[test]
    fn test_truncated_connection_does_not_affect_siblings() {
        let registry = Arc::new(Recording::default());
        let mut server = data_server(registry.clone());
        let addr = server.start().unwrap();

        let mut healthy = std::net::TcpStream::connect(addr).unwrap();
        {
            let mut broken = std::net::TcpStream::connect(addr).unwrap();
            broken.write_all(&[0x00, 0x10, b'x']).unwrap();
        }
        assert!(wait_until(|| server.stats().connections_closed == 1));

        healthy.write_all(&encode_frame(b"still here").unwrap()).unwrap();
        assert!(wait_until(|| registry.sent.lock().unwrap().len() == 1));

        let mut late = std::net::TcpStream::connect(addr).unwrap();
        late.write_all(&encode_frame(b"new client").unwrap()).unwrap();
        assert!(wait_until(|| registry.sent.lock().unwrap().len() == 2));
        server.stop().unwrap();
    }

    #[test]
    fn test_stop_force_closes_stuck_connection() {
        let registry = Arc::new(Stalled {
            entered: AtomicBool::new(false),
            hold: Duration::from_secs(5),
        });
        let mut settings = Settings::loopback();
        settings.shutdown_timeout_ms = 300;
        let pipeline =
            ConnectionPipeline::data(Arc::new(RawCodec), DataForwarder::new(registry.clone()));
        let mut server = ChannelServer::new(settings.channel_config(ChannelRole::Data), pipeline);
        let addr = server.start().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(&encode_frame(b"stuck").unwrap()).unwrap();
        assert!(wait_until(|| registry.entered.load(Ordering::SeqCst)));

        let started = Instant::now();
        let result = server.stop();
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(MemberError::Interrupted(_))));
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(2), "stop took {:?}", elapsed);
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(std::net::TcpStream::connect(addr).is_err());
    }
}
