//! Client API: originate Seed and Discovery packets against a running daemon.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use bitshare_core::{
    DiscoveryRequestPacket, DiscoveryResponsePacket, Manifest, Packet, Seed, SeedPacket,
};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::config::Config;
use crate::discovery;
use crate::transfer::{
    broadcast_datagram, recv_datagram, send_datagram, send_stream, TransferError,
};

pub struct Client {
    local_addr: SocketAddr,
    discovery_port: u16,
}

impl Client {
    /// `local_addr`: the daemon's local control endpoint. `discovery_port`: the LAN
    /// discovery port broadcasts are sent to.
    pub fn new(local_addr: SocketAddr, discovery_port: u16) -> Self {
        Self {
            local_addr,
            discovery_port,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.local_addr(), config.discovery_port)
    }

    /// Announce to the local daemon that `path` holds `manifest`'s content.
    pub async fn seed(
        &self,
        manifest: Manifest,
        path: impl Into<PathBuf>,
    ) -> Result<usize, TransferError> {
        let packet = SeedPacket::from_seed(&Seed::new(manifest, path))?;
        let mut stream = TcpStream::connect(self.local_addr).await?;
        send_stream(&mut stream, &packet.into()).await
    }

    /// Broadcast a Discovery request on every local interface. Returns total bytes sent.
    pub async fn discover_request(&self, hash: &str) -> Result<usize, TransferError> {
        let destinations = discovery::broadcast_destinations(self.discovery_port);
        self.discover_request_to(hash, &destinations).await
    }

    pub async fn discover_request_to(
        &self,
        hash: &str,
        destinations: &[SocketAddr],
    ) -> Result<usize, TransferError> {
        let socket = open_udp().await?;
        broadcast_datagram(&socket, &request(hash), destinations).await
    }

    /// Tell `destination` that this host holds `seed`'s content.
    pub async fn discover_response(
        &self,
        seed: &Seed,
        destination: SocketAddr,
    ) -> Result<usize, TransferError> {
        let socket = open_udp().await?;
        let packet = DiscoveryResponsePacket::from_seed(seed).into();
        send_datagram(&socket, &packet, destination).await
    }

    /// Broadcast a Discovery request and collect the peers answering for `hash` within `wait`.
    pub async fn discover(
        &self,
        hash: &str,
        wait: Duration,
    ) -> Result<BTreeSet<SocketAddr>, TransferError> {
        let destinations = discovery::broadcast_destinations(self.discovery_port);
        self.discover_from(hash, &destinations, wait).await
    }

    pub async fn discover_from(
        &self,
        hash: &str,
        destinations: &[SocketAddr],
        wait: Duration,
    ) -> Result<BTreeSet<SocketAddr>, TransferError> {
        let socket = open_udp().await?;
        broadcast_datagram(&socket, &request(hash), destinations).await?;

        let deadline = Instant::now() + wait;
        let mut peers = BTreeSet::new();
        loop {
            match timeout_at(deadline, recv_datagram(&socket)).await {
                Err(_) => break,
                Ok(Ok((Packet::DiscoveryResponse(resp), from))) => {
                    if resp.hash().ok().as_deref() == Some(hash) {
                        peers.insert(from);
                    }
                }
                Ok(Ok((other, from))) => {
                    debug!(%from, packet_type = %other.packet_type(), "ignoring unexpected packet");
                }
                Ok(Err(TransferError::Decode(e))) => {
                    debug!(error = %e, "dropping malformed datagram");
                }
                Ok(Err(e)) => return Err(e),
            }
        }
        Ok(peers)
    }
}

fn request(hash: &str) -> Packet {
    DiscoveryRequestPacket::from_hash(hash).into()
}

async fn open_udp() -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::FrameReader;
    use tokio::net::TcpListener;

    fn sample_manifest() -> Manifest {
        Manifest::new("notes", vec![("notes/todo.txt".to_string(), 12)])
    }

    #[tokio::test]
    async fn seed_sends_one_frame_to_local_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = Client::new(listener.local_addr().unwrap(), 0);
        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            FrameReader::new(conn).recv().await.unwrap()
        });

        let sent = client.seed(sample_manifest(), "/home/me/notes").await.unwrap();
        let packet = server.await.unwrap().unwrap();
        assert_eq!(sent, bitshare_core::encode_frame(&packet).unwrap().len());
        match packet {
            Packet::Seed(p) => {
                let seed = p.seed().unwrap();
                assert_eq!(seed.manifest(), &sample_manifest());
                assert_eq!(seed.path(), std::path::Path::new("/home/me/notes"));
            }
            other => panic!("unexpected {}", other.packet_type()),
        }
    }

    #[tokio::test]
    async fn seed_without_daemon_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = Client::new(addr, 0);
        assert!(matches!(
            client.seed(sample_manifest(), "/tmp").await,
            Err(TransferError::Io(_))
        ));
    }

    fn unused_udp_port() -> u16 {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn discover_request_sends_one_frame_per_destination() {
        let port = unused_udp_port();
        let client = Client::new("127.0.0.1:1".parse().unwrap(), port);
        let frame_len = bitshare_core::encode_datagram(&request("h")).unwrap().len();
        let destinations = discovery::broadcast_destinations(port);

        let sent = client.discover_request("h").await.unwrap();
        assert_eq!(sent % frame_len, 0);
        assert!(sent <= destinations.len() * frame_len);
    }

    #[tokio::test]
    async fn discover_without_peers_is_empty_after_wait() {
        let client = Client::new("127.0.0.1:1".parse().unwrap(), unused_udp_port());
        let started = Instant::now();
        let peers = client
            .discover("nobody-has-this", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(peers.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn discover_request_to_rejects_empty_destinations() {
        let client = Client::new("127.0.0.1:1".parse().unwrap(), 1);
        assert!(matches!(
            client.discover_request_to("h", &[]).await,
            Err(TransferError::NoDestination)
        ));
    }

    #[tokio::test]
    async fn discover_response_reaches_destination() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = Client::new("127.0.0.1:1".parse().unwrap(), 1);
        let seed = Seed::new(sample_manifest(), "/tmp/notes");
        client
            .discover_response(&seed, receiver.local_addr().unwrap())
            .await
            .unwrap();
        let (packet, _) = recv_datagram(&receiver).await.unwrap();
        match packet {
            Packet::DiscoveryResponse(resp) => assert_eq!(resp.hash().unwrap(), seed.hash()),
            other => panic!("unexpected {}", other.packet_type()),
        }
    }

    #[tokio::test]
    async fn discover_from_collects_matching_responses() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        let seed = Seed::new(sample_manifest(), "/tmp/notes");
        let hash = seed.hash();
        let task = tokio::spawn(async move {
            let (packet, from) = recv_datagram(&responder).await.unwrap();
            assert!(matches!(packet, Packet::DiscoveryRequest(_)));
            let wrong = DiscoveryResponsePacket::from_hash("other").into();
            send_datagram(&responder, &wrong, from).await.unwrap();
            let right = DiscoveryResponsePacket::from_seed(&seed).into();
            send_datagram(&responder, &right, from).await.unwrap();
        });

        let client = Client::new("127.0.0.1:1".parse().unwrap(), 1);
        let peers = client
            .discover_from(&hash, &[responder_addr], Duration::from_millis(500))
            .await
            .unwrap();
        task.await.unwrap();
        assert_eq!(peers.into_iter().collect::<Vec<_>>(), vec![responder_addr]);
    }
}
