//! The bitshare daemon: three listeners sharing one seed registry and one peer registry.
//!
//! - local control (TCP, loopback): Seed announcements from local callers
//! - remote discovery (UDP, all interfaces): Discovery requests and responses from the LAN
//! - remote transfer-announce (TCP, all interfaces): accepts and logs packets
//!
//! `start` binds all three, runs them until `stop` is called from any thread, and returns
//! once every listener has exited (or the shutdown grace period has elapsed).

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitshare_core::{
    DiscoveryRequestPacket, DiscoveryResponsePacket, Packet, PeerRegistry, SeedRegistry,
};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::discovery;
use crate::shutdown::StopSignal;
use crate::transfer::{
    broadcast_datagram, send_datagram, DatagramPackets, StreamPackets, TransferError,
    IDLE_READ_TIMEOUT,
};

/// Interval at which `start` polls each listener for completion.
pub const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// After the stop signal, listeners still running past this are aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const LISTEN_BACKLOG: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    Running,
    Stopping,
}

/// Addresses the three listeners are actually bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerAddrs {
    pub local: SocketAddr,
    pub discovery: SocketAddr,
    pub transfer: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon already running")]
    AlreadyRunning,
    #[error("daemon not running")]
    NotRunning,
    #[error("cannot bind {endpoint} listener on {addr}: {source}")]
    Bind {
        endpoint: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// State shared by the listener tasks.
#[derive(Clone)]
struct Context {
    seeds: Arc<SeedRegistry>,
    peers: Arc<PeerRegistry>,
    stop: StopSignal,
    own_ips: Arc<HashSet<IpAddr>>,
    discovery_port: u16,
}

impl Context {
    /// Datagram sent by our own discovery socket (looped-back broadcast).
    fn is_self(&self, from: SocketAddr) -> bool {
        from.port() == self.discovery_port && self.own_ips.contains(&from.ip())
    }
}

struct Bound {
    local: TcpListener,
    discovery: Arc<UdpSocket>,
    transfer: TcpListener,
}

pub struct Daemon {
    config: Config,
    stop: StopSignal,
    state: Mutex<DaemonState>,
    seeds: Arc<SeedRegistry>,
    peers: Arc<PeerRegistry>,
    addrs: Mutex<Option<ListenerAddrs>>,
    discovery_socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            stop: StopSignal::new(),
            state: Mutex::new(DaemonState::Idle),
            seeds: Arc::new(SeedRegistry::new()),
            peers: Arc::new(PeerRegistry::new()),
            addrs: Mutex::new(None),
            discovery_socket: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DaemonState {
        *self.state.lock()
    }

    pub fn seeds(&self) -> &SeedRegistry {
        &self.seeds
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Bound listener addresses while running.
    pub fn listener_addrs(&self) -> Option<ListenerAddrs> {
        *self.addrs.lock()
    }

    /// Run the three listeners until [`Daemon::stop`]. Returns once they have all exited.
    pub async fn start(&self) -> Result<(), DaemonError> {
        {
            let mut state = self.state.lock();
            if *state != DaemonState::Idle {
                return Err(DaemonError::AlreadyRunning);
            }
            self.stop.clear();
            *state = DaemonState::Running;
        }

        let (bound, addrs) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                *self.state.lock() = DaemonState::Idle;
                return Err(e);
            }
        };
        *self.addrs.lock() = Some(addrs);
        *self.discovery_socket.lock() = Some(bound.discovery.clone());

        let ctx = Context {
            seeds: self.seeds.clone(),
            peers: self.peers.clone(),
            stop: self.stop.clone(),
            own_ips: Arc::new(own_ips()),
            discovery_port: addrs.discovery.port(),
        };
        info!(
            local = %addrs.local,
            discovery = %addrs.discovery,
            transfer = %addrs.transfer,
            "daemon started"
        );

        let handles = vec![
            (
                "remote-discovery",
                tokio::spawn(remote_discovery_server(bound.discovery, ctx.clone())),
            ),
            (
                "remote-transfer",
                tokio::spawn(remote_transfer_server(bound.transfer, ctx.clone())),
            ),
            (
                "local-control",
                tokio::spawn(local_control_server(bound.local, ctx)),
            ),
        ];
        self.join_listeners(handles).await;

        *self.discovery_socket.lock() = None;
        *self.addrs.lock() = None;
        *self.state.lock() = DaemonState::Idle;
        info!("daemon stopped");
        Ok(())
    }

    /// Signal every listener to exit. Idempotent; safe from any thread.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        self.stop.set();
        if *state == DaemonState::Running {
            info!("daemon shutting down");
            *state = DaemonState::Stopping;
        }
    }

    /// Broadcast a Discovery request from the daemon's own discovery socket, so that
    /// responses land in this daemon's peer registry.
    pub async fn request_discovery(&self, hash: &str) -> Result<usize, DaemonError> {
        let port = match self.listener_addrs() {
            Some(addrs) => addrs.discovery.port(),
            None => return Err(DaemonError::NotRunning),
        };
        let destinations = discovery::broadcast_destinations(port);
        self.request_discovery_to(hash, &destinations).await
    }

    /// Like [`Daemon::request_discovery`] with explicit destinations.
    pub async fn request_discovery_to(
        &self,
        hash: &str,
        destinations: &[SocketAddr],
    ) -> Result<usize, DaemonError> {
        let socket = self
            .discovery_socket
            .lock()
            .clone()
            .ok_or(DaemonError::NotRunning)?;
        let packet = DiscoveryRequestPacket::from_hash(hash).into();
        Ok(broadcast_datagram(&socket, &packet, destinations).await?)
    }

    async fn bind(&self) -> Result<(Bound, ListenerAddrs), DaemonError> {
        let local_addr = self.config.local_addr();
        let local = bind_tcp(local_addr).map_err(|source| DaemonError::Bind {
            endpoint: "local-control",
            addr: local_addr,
            source,
        })?;
        let discovery_addr = self.config.discovery_addr();
        let discovery = bind_udp(discovery_addr)
            .await
            .map_err(|source| DaemonError::Bind {
                endpoint: "remote-discovery",
                addr: discovery_addr,
                source,
            })?;
        let transfer_addr = self.config.transfer_addr();
        let transfer = bind_tcp(transfer_addr).map_err(|source| DaemonError::Bind {
            endpoint: "remote-transfer",
            addr: transfer_addr,
            source,
        })?;
        let addrs = ListenerAddrs {
            local: local.local_addr()?,
            discovery: discovery.local_addr()?,
            transfer: transfer.local_addr()?,
        };
        let bound = Bound {
            local,
            discovery: Arc::new(discovery),
            transfer,
        };
        Ok((bound, addrs))
    }

    /// Wait for every listener, polling with a bounded timeout. Once stopping, listeners
    /// that outlive [`SHUTDOWN_GRACE`] are aborted.
    async fn join_listeners(
        &self,
        mut pending: Vec<(&'static str, JoinHandle<Result<(), TransferError>>)>,
    ) {
        let mut stopping_since: Option<Instant> = None;
        while !pending.is_empty() {
            let mut still_running = Vec::with_capacity(pending.len());
            for (name, mut handle) in pending {
                match timeout(JOIN_POLL_INTERVAL, &mut handle).await {
                    Ok(joined) => self.listener_exited(name, joined),
                    Err(_) => still_running.push((name, handle)),
                }
            }
            pending = still_running;

            if self.stop.is_set() && !pending.is_empty() {
                let since = *stopping_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= SHUTDOWN_GRACE {
                    for (name, handle) in &pending {
                        warn!(listener = name, "listener did not stop in time; aborting");
                        handle.abort();
                    }
                    return;
                }
            }
        }
    }

    fn listener_exited(
        &self,
        name: &'static str,
        joined: Result<Result<(), TransferError>, JoinError>,
    ) {
        match joined {
            Ok(Ok(())) => debug!(listener = name, "listener exited"),
            Ok(Err(e)) => {
                error!(listener = name, error = %e, "listener failed; stopping daemon");
                self.stop();
            }
            Err(e) => {
                error!(listener = name, error = %e, "listener task died; stopping daemon");
                self.stop();
            }
        }
    }
}

fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

async fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Every local address, for recognising our own looped-back datagrams.
fn own_ips() -> HashSet<IpAddr> {
    let mut out: HashSet<IpAddr> = discovery::local_interfaces()
        .unwrap_or_default()
        .into_iter()
        .flat_map(|iface| iface.v4.into_iter().map(|(ip, _)| IpAddr::V4(ip)))
        .collect();
    out.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
    out
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Accept connections one at a time and feed every packet on each to `handler`. A bad
/// connection is closed; only the stop signal or a fatal accept error ends the loop.
async fn run_stream_server<F>(
    listener: TcpListener,
    stop: StopSignal,
    endpoint: &'static str,
    mut handler: F,
) -> Result<(), TransferError>
where
    F: FnMut(Packet, SocketAddr),
{
    while !stop.is_set() {
        let (conn, peer) = match timeout(IDLE_READ_TIMEOUT, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) if is_transient_accept_error(&e) => {
                warn!(endpoint, error = %e, "accept failed");
                continue;
            }
            Ok(Err(e)) => return Err(e.into()),
        };
        debug!(endpoint, %peer, "connection accepted");
        let mut packets = StreamPackets::new(conn, stop.clone());
        loop {
            match packets.next().await {
                Ok(Some(packet)) => handler(packet, peer),
                Ok(None) => break,
                Err(e) => {
                    warn!(endpoint, %peer, error = %e, "closing connection");
                    break;
                }
            }
        }
        debug!(endpoint, %peer, "connection closed");
    }
    Ok(())
}

async fn local_control_server(listener: TcpListener, ctx: Context) -> Result<(), TransferError> {
    info!(addr = %listener.local_addr()?, "local control server (TCP) listening");
    let stop = ctx.stop.clone();
    run_stream_server(listener, stop, "local-control", |packet, peer| {
        handle_local_control(&ctx, packet, peer)
    })
    .await
}

async fn remote_transfer_server(listener: TcpListener, ctx: Context) -> Result<(), TransferError> {
    info!(addr = %listener.local_addr()?, "remote transfer server (TCP) listening");
    run_stream_server(listener, ctx.stop, "remote-transfer", |packet, peer| {
        info!(
            %peer,
            packet_type = %packet.packet_type(),
            size = packet.payload().len(),
            "remote transfer packet received"
        );
    })
    .await
}

async fn remote_discovery_server(
    socket: Arc<UdpSocket>,
    ctx: Context,
) -> Result<(), TransferError> {
    info!(addr = %socket.local_addr()?, "remote discovery server (UDP) listening");
    let mut packets = DatagramPackets::new(&socket, ctx.stop.clone());
    while let Some((packet, from)) = packets.next().await? {
        handle_remote_discovery(&ctx, &socket, packet, from).await;
    }
    Ok(())
}

fn handle_local_control(ctx: &Context, packet: Packet, peer: SocketAddr) {
    match packet {
        Packet::Seed(p) => match p.seed() {
            Ok(seed) => {
                info!(hash = %seed.hash(), path = %seed.path().display(), "seed announced");
                ctx.seeds.insert(seed);
            }
            Err(e) => warn!(%peer, error = %e, "rejecting invalid seed packet"),
        },
        other => debug!(
            %peer,
            packet_type = %other.packet_type(),
            "ignoring packet on local control endpoint"
        ),
    }
}

async fn handle_remote_discovery(
    ctx: &Context,
    socket: &UdpSocket,
    packet: Packet,
    from: SocketAddr,
) {
    if ctx.is_self(from) {
        return;
    }
    match packet {
        Packet::DiscoveryRequest(req) => {
            let hash = match req.hash() {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(%from, error = %e, "invalid discovery request");
                    return;
                }
            };
            debug!(%from, %hash, "discovery request");
            let Some(seed) = ctx.seeds.lookup(&hash) else {
                return;
            };
            let response = DiscoveryResponsePacket::from_seed(&seed).into();
            match send_datagram(socket, &response, from).await {
                Ok(_) => info!(%from, %hash, "answered discovery request"),
                Err(e) => warn!(%from, %hash, error = %e, "discovery response failed"),
            }
        }
        Packet::DiscoveryResponse(resp) => match resp.hash() {
            Ok(hash) => {
                if ctx.peers.insert(&hash, from) {
                    info!(%from, %hash, "peer holds hash");
                }
            }
            Err(e) => warn!(%from, error = %e, "invalid discovery response"),
        },
        Packet::Seed(_) => debug!(%from, "ignoring seed packet on discovery endpoint"),
    }
}
