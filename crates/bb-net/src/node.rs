//! Node: one identity, published on a transport, dialing peers through the pool

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bb_core::config::BbConfig;
use bb_core::proto::bb_peer_client::BbPeerClient;
use bb_core::proto::bb_peer_server::{BbPeer, BbPeerServer};
use bb_core::PEER_MAX_MESSAGE_BYTES;
use bb_crypto::{Identity, NodeAddress};
use bb_tls::{
    acceptor_config, connect_channel, initiator_config, secure_incoming, DialFn, PeerPin,
};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tonic::transport::{Channel, Server};
use tracing::{debug, info, warn};

use crate::peer_service::PeerService;
use crate::pool::{ConnectionPool, Evictor};
use crate::transport::{Registration, Transport};
use crate::{NetError, NetResult};

/// Raw connections waiting for a TLS handshake.
const INCOMING_BACKLOG: usize = 64;
/// How long stop waits for in-flight peer RPCs before aborting the server.
const SERVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub idle_timeout: Duration,
    pub evict_interval: Duration,
    /// Bound for dial plus handshake, outbound and inbound.
    pub dial_timeout: Duration,
    pub max_message_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            evict_interval: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(60),
            max_message_bytes: PEER_MAX_MESSAGE_BYTES,
        }
    }
}

impl NodeConfig {
    pub fn from_config(config: &BbConfig) -> Self {
        Self {
            idle_timeout: config.pool.idle_timeout(),
            evict_interval: config.pool.evict_interval(),
            dial_timeout: config.pool.dial_timeout(),
            max_message_bytes: config.peer.max_message_bytes,
        }
    }
}

/// Peer RPC server capped at `limit` bytes per message in both directions.
pub fn peer_server<S: BbPeer>(service: S, limit: usize) -> BbPeerServer<S> {
    BbPeerServer::new(service)
        .max_decoding_message_size(limit)
        .max_encoding_message_size(limit)
}

/// Peer RPC client with the same cap as [`peer_server`].
pub fn peer_client(channel: Channel, limit: usize) -> BbPeerClient<Channel> {
    BbPeerClient::new(channel)
        .max_decoding_message_size(limit)
        .max_encoding_message_size(limit)
}

struct Running {
    registration: Registration,
    evictor: Evictor,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<Result<(), tonic::transport::Error>>,
    started_at: Instant,
}

enum Lifecycle {
    Created,
    /// `start` is waiting on the transport; the lock is not held meanwhile.
    Starting,
    Running(Running),
    Stopped,
}

/// Puts a cancelled or failed start back to `Created`.
struct StartGuard<'a> {
    lifecycle: &'a Mutex<Lifecycle>,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut lifecycle = lock(self.lifecycle);
            if matches!(*lifecycle, Lifecycle::Starting) {
                *lifecycle = Lifecycle::Created;
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Node {
    identity: Identity,
    address: NodeAddress,
    transport: Arc<dyn Transport>,
    config: NodeConfig,
    pool: Arc<ConnectionPool<Channel>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Node {
    pub fn new(identity: Identity, transport: Arc<dyn Transport>, config: NodeConfig) -> Self {
        let address = identity.address();
        Self {
            identity,
            address,
            transport,
            config,
            pool: Arc::new(ConnectionPool::new()),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Time since a successful start; zero when not running.
    pub fn uptime(&self) -> Duration {
        match &*lock(&self.lifecycle) {
            Lifecycle::Running(running) => running.started_at.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.lifecycle), Lifecycle::Running(_))
    }

    /// Publish the node and begin serving peer RPCs.
    ///
    /// Either everything is up afterwards or nothing stays registered.
    /// A node starts once; later calls fail with [`NetError::AlreadyStarted`].
    pub async fn start(&self) -> NetResult<()> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if !matches!(*lifecycle, Lifecycle::Created) {
                return Err(NetError::AlreadyStarted);
            }
            *lifecycle = Lifecycle::Starting;
        }
        let mut guard = StartGuard {
            lifecycle: &self.lifecycle,
            armed: true,
        };

        // Any peer may connect; the RPC layer sees who it was.
        let acceptor = acceptor_config(PeerPin::AnyEd25519, self.identity.signing_key())?;

        let (raw_tx, raw_rx) = mpsc::channel(INCOMING_BACKLOG);
        let registration = self
            .transport
            .serve(&self.address, &self.identity, raw_tx)
            .await?;

        let service = peer_server(
            PeerService::new(self.address.clone()),
            self.config.max_message_bytes,
        );
        let incoming = secure_incoming(raw_rx, acceptor, self.config.dial_timeout);
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, async move {
                    let _ = shutdown_rx.await;
                }),
        );

        let evictor = self
            .pool
            .spawn_evictor(self.config.evict_interval, self.config.idle_timeout);

        info!(address = %self.address, "node started");
        *lock(&self.lifecycle) = Lifecycle::Running(Running {
            registration,
            evictor,
            shutdown,
            server,
            started_at: Instant::now(),
        });
        guard.armed = false;
        Ok(())
    }

    /// Stop eviction, unpublish, stop serving, drop pooled connections.
    /// Only the first call after a completed start does anything; a start
    /// still in progress is not interrupted.
    pub async fn stop(&self) -> NetResult<()> {
        let running = {
            let mut lifecycle = lock(&self.lifecycle);
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    *lifecycle = other;
                    return Ok(());
                }
            }
        };

        // Evictor first so nothing is evicted after close_all.
        running.evictor.stop().await;

        let mut registration = running.registration;
        let unregistered = registration.unregister().await;
        if let Err(e) = &unregistered {
            warn!(error = %e, "transport unregister failed");
        }

        let _ = running.shutdown.send(());
        let mut server = running.server;
        match tokio::time::timeout(SERVER_SHUTDOWN_GRACE, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "peer RPC server failed"),
            Ok(Err(e)) => warn!(error = %e, "peer RPC server task panicked"),
            Err(_) => {
                warn!("peer RPC server did not drain in time, aborting");
                server.abort();
            }
        }

        let closed = self.pool.close_all().await;
        info!(address = %self.address, closed, "node stopped");
        unregistered
    }

    /// A peer RPC client for `addr` (`<onion>` or `<onion>:<port>`), pinned to
    /// the key the address encodes. Connections are pooled per address.
    pub async fn dial_peer(&self, addr: &str) -> NetResult<BbPeerClient<Channel>> {
        let peer = NodeAddress::parse(addr)?;
        let channel = self
            .pool
            .get_or_dial(peer.as_str(), || self.connect(addr, &peer))
            .await?;

        Ok(peer_client(channel, self.config.max_message_bytes))
    }

    async fn connect(&self, addr: &str, peer: &NodeAddress) -> NetResult<Channel> {
        let pin = PeerPin::Key(peer.public_key()?);
        let config = initiator_config(pin, self.identity.signing_key())?;
        let timeout = self.config.dial_timeout;

        // The first stream is opened here so transport errors keep their type;
        // later reconnects by the channel dial again.
        let first = tokio::time::timeout(timeout, self.transport.dial(addr))
            .await
            .map_err(|_| NetError::Dial {
                addr: addr.to_string(),
                reason: format!("timed out after {timeout:?}"),
            })??;
        let first = Arc::new(Mutex::new(Some(first)));

        let transport = self.transport.clone();
        let target = addr.to_string();
        let dial: DialFn = Arc::new(move || {
            let first = lock(&first).take();
            let transport = transport.clone();
            let target = target.clone();
            async move {
                match first {
                    Some(io) => Ok(io),
                    None => transport.dial(&target).await.map_err(io::Error::other),
                }
            }
            .boxed()
        });

        let channel = connect_channel(config, dial, timeout).await?;
        debug!(peer = %peer, "peer channel established");
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTransport;
    use bb_crypto::{derive_identity, NODE_IDENTITY_PURPOSE};

    fn node(seed: u8, transport: &MemoryTransport) -> Node {
        let identity = derive_identity(&[seed; 64], NODE_IDENTITY_PURPOSE).unwrap();
        Node::new(identity, Arc::new(transport.clone()), NodeConfig::default())
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let net = MemoryTransport::new();
        let n = node(1, &net);
        n.start().await.unwrap();
        assert!(net.is_registered(n.address().as_str()));
        assert!(matches!(n.start().await, Err(NetError::AlreadyStarted)));

        n.stop().await.unwrap();
        // Stopped is terminal.
        assert!(matches!(n.start().await, Err(NetError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let net = MemoryTransport::new();
        let n = node(2, &net);

        // Before start: nothing to do, and start still works afterwards.
        n.stop().await.unwrap();
        assert_eq!(n.uptime(), Duration::ZERO);

        n.start().await.unwrap();
        assert!(n.is_running());
        n.stop().await.unwrap();
        n.stop().await.unwrap();
        assert!(!n.is_running());
        assert!(!net.is_registered(n.address().as_str()));
    }

    #[tokio::test]
    async fn test_failed_serve_leaves_node_startable() {
        let net = MemoryTransport::new();
        let first = node(3, &net);
        let twin = node(3, &net);

        first.start().await.unwrap();
        assert!(matches!(twin.start().await, Err(NetError::AddressInUse(_))));
        assert!(!twin.is_running());

        first.stop().await.unwrap();
        twin.start().await.unwrap();
        twin.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_peer_rejects_malformed_address() {
        let net = MemoryTransport::new();
        let n = node(4, &net);
        let err = n.dial_peer("not-an-onion").await.unwrap_err();
        assert!(matches!(err, NetError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn test_dial_peer_unknown_address() {
        let net = MemoryTransport::new();
        let n = node(5, &net);
        let stranger = derive_identity(&[6u8; 64], NODE_IDENTITY_PURPOSE).unwrap();

        let err = n.dial_peer(stranger.address().as_str()).await.unwrap_err();
        assert!(matches!(err, NetError::UnknownAddress(_)));
    }

    /// Holds `serve` until released, then publishes on the memory network.
    struct GatedTransport {
        inner: MemoryTransport,
        open: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl Transport for GatedTransport {
        async fn serve(
            &self,
            address: &NodeAddress,
            identity: &Identity,
            incoming: mpsc::Sender<bb_tls::BoxedIo>,
        ) -> NetResult<Registration> {
            self.open.notified().await;
            self.inner.serve(address, identity, incoming).await
        }

        async fn dial(&self, address: &str) -> NetResult<bb_tls::BoxedIo> {
            self.inner.dial(address).await
        }
    }

    fn gated_node(seed: u8, net: &MemoryTransport) -> (Arc<Node>, Arc<GatedTransport>) {
        let gated = Arc::new(GatedTransport {
            inner: net.clone(),
            open: tokio::sync::Notify::new(),
        });
        let identity = derive_identity(&[seed; 64], NODE_IDENTITY_PURPOSE).unwrap();
        let node = Arc::new(Node::new(identity, gated.clone(), NodeConfig::default()));
        (node, gated)
    }

    #[tokio::test]
    async fn test_slow_start_does_not_block_queries() {
        let net = MemoryTransport::new();
        let (n, gated) = gated_node(7, &net);

        let starting = tokio::spawn({
            let n = n.clone();
            async move { n.start().await }
        });
        while !matches!(*lock(&n.lifecycle), Lifecycle::Starting) {
            tokio::task::yield_now().await;
        }

        // Answered immediately while the transport is still publishing.
        assert!(!n.is_running());
        assert_eq!(n.uptime(), Duration::ZERO);
        assert!(matches!(n.start().await, Err(NetError::AlreadyStarted)));
        n.stop().await.unwrap();

        gated.open.notify_one();
        starting.await.unwrap().unwrap();
        assert!(n.is_running());
        n.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_start_leaves_node_startable() {
        let net = MemoryTransport::new();
        let (n, gated) = gated_node(8, &net);

        let starting = tokio::spawn({
            let n = n.clone();
            async move { n.start().await }
        });
        while !matches!(*lock(&n.lifecycle), Lifecycle::Starting) {
            tokio::task::yield_now().await;
        }
        starting.abort();
        assert!(starting.await.unwrap_err().is_cancelled());

        gated.open.notify_one();
        n.start().await.unwrap();
        assert!(net.is_registered(n.address().as_str()));
        n.stop().await.unwrap();
    }
}
