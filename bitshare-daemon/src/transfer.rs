//! Framed packet I/O over tokio sockets: send to a stream, a datagram destination or a set
//! of destinations; receive whole datagrams or reassemble stream frames; and stop-aware
//! "next packet" loops for the daemon's listeners.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bitshare_core::wire::{decode_datagram, decode_frame, encode_datagram, encode_frame};
use bitshare_core::{FrameDecodeError, FrameEncodeError, Packet, PacketError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::shutdown::StopSignal;

/// How long a listener blocks in one read before re-checking the stop signal.
pub const IDLE_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A stream connection silent for this long is closed.
pub const CONNECTION_IDLE_LIMIT: Duration = Duration::from_secs(30);

const RECV_BUF_LEN: usize = 65_536;
const READ_CHUNK_LEN: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("connection closed with {buffered} bytes of an incomplete frame")]
    ConnectionClosed { buffered: usize },
    #[error("no destination given for datagram send")]
    NoDestination,
}

/// Write one frame to a stream. Returns bytes sent.
pub async fn send_stream<W>(stream: &mut W, packet: &Packet) -> Result<usize, TransferError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(packet)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(frame.len())
}

/// Send one frame to a single destination. Send failures propagate.
pub async fn send_datagram(
    socket: &UdpSocket,
    packet: &Packet,
    destination: SocketAddr,
) -> Result<usize, TransferError> {
    let frame = encode_datagram(packet)?;
    Ok(socket.send_to(&frame, destination).await?)
}

/// Send the same frame to every distinct destination. A failed destination is logged and
/// skipped; the result is the total bytes sent. An empty destination list is rejected
/// before any I/O.
pub async fn broadcast_datagram(
    socket: &UdpSocket,
    packet: &Packet,
    destinations: &[SocketAddr],
) -> Result<usize, TransferError> {
    if destinations.is_empty() {
        return Err(TransferError::NoDestination);
    }
    let frame = encode_datagram(packet)?;
    let mut seen = HashSet::with_capacity(destinations.len());
    let mut total = 0;
    for &dest in destinations {
        if !seen.insert(dest) {
            continue;
        }
        match socket.send_to(&frame, dest).await {
            Ok(n) => total += n,
            Err(e) => warn!(%dest, error = %e, "datagram send failed"),
        }
    }
    Ok(total)
}

/// Receive and decode one datagram.
pub async fn recv_datagram(socket: &UdpSocket) -> Result<(Packet, SocketAddr), TransferError> {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    let (n, from) = socket.recv_from(&mut buf).await?;
    Ok((decode_datagram(&buf[..n])?, from))
}

/// Reassembles frames from a byte stream. Reads are cancel-safe: bytes are only
/// buffered once a read has completed.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Next packet, or `None` when the peer closed cleanly between frames. A close in the
    /// middle of a frame is [`TransferError::ConnectionClosed`].
    pub async fn recv(&mut self) -> Result<Option<Packet>, TransferError> {
        loop {
            if let Some(packet) = self.try_decode()? {
                return Ok(Some(packet));
            }
            if self.fill().await? == 0 {
                return self.closed();
            }
        }
    }

    fn try_decode(&mut self) -> Result<Option<Packet>, TransferError> {
        match decode_frame(&self.buf) {
            Ok((packet, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(packet))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_LEN];
        let n = self.inner.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn closed(&self) -> Result<Option<Packet>, TransferError> {
        if self.buf.is_empty() {
            Ok(None)
        } else {
            Err(TransferError::ConnectionClosed {
                buffered: self.buf.len(),
            })
        }
    }
}

/// Packets arriving on one stream connection until the stop signal is set, the peer closes,
/// the connection sits idle past its limit, or an error occurs.
pub struct StreamPackets<R> {
    reader: FrameReader<R>,
    stop: StopSignal,
    read_timeout: Duration,
    idle_limit: Duration,
    done: bool,
}

impl<R: AsyncRead + Unpin> StreamPackets<R> {
    pub fn new(stream: R, stop: StopSignal) -> Self {
        Self {
            reader: FrameReader::new(stream),
            stop,
            read_timeout: IDLE_READ_TIMEOUT,
            idle_limit: CONNECTION_IDLE_LIMIT,
            done: false,
        }
    }

    pub fn with_idle_limit(mut self, idle_limit: Duration) -> Self {
        self.idle_limit = idle_limit;
        self
    }

    /// `Ok(None)` ends the sequence cleanly; an error also ends it.
    pub async fn next(&mut self) -> Result<Option<Packet>, TransferError> {
        if self.done {
            return Ok(None);
        }
        let result = self.next_inner().await;
        if !matches!(result, Ok(Some(_))) {
            self.done = true;
        }
        result
    }

    async fn next_inner(&mut self) -> Result<Option<Packet>, TransferError> {
        let mut idle = Duration::ZERO;
        loop {
            if self.stop.is_set() {
                return Ok(None);
            }
            if let Some(packet) = self.reader.try_decode()? {
                return Ok(Some(packet));
            }
            match timeout(self.read_timeout, self.reader.fill()).await {
                Err(_) => {
                    idle += self.read_timeout;
                    if idle >= self.idle_limit {
                        debug!(?idle, "closing idle connection");
                        return Ok(None);
                    }
                }
                Ok(Ok(0)) => return self.reader.closed(),
                Ok(Ok(_)) => idle = Duration::ZERO,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Datagrams arriving on a socket, with their sender, until the stop signal is set or the
/// socket fails. Malformed datagrams are logged and dropped.
pub struct DatagramPackets<'a> {
    socket: &'a UdpSocket,
    stop: StopSignal,
    read_timeout: Duration,
    buf: Vec<u8>,
}

impl<'a> DatagramPackets<'a> {
    pub fn new(socket: &'a UdpSocket, stop: StopSignal) -> Self {
        Self {
            socket,
            stop,
            read_timeout: IDLE_READ_TIMEOUT,
            buf: vec![0u8; RECV_BUF_LEN],
        }
    }

    pub async fn next(&mut self) -> Result<Option<(Packet, SocketAddr)>, TransferError> {
        loop {
            if self.stop.is_set() {
                return Ok(None);
            }
            let received = timeout(self.read_timeout, self.socket.recv_from(&mut self.buf)).await;
            let (n, from) = match received {
                Err(_) => continue,
                Ok(Ok(received)) => received,
                Ok(Err(e)) if is_icmp_echo(&e) => {
                    debug!(error = %e, "ignoring icmp error on datagram socket");
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
            };
            match decode_datagram(&self.buf[..n]) {
                Ok(packet) => return Ok(Some((packet, from))),
                Err(e) => warn!(%from, error = %e, "dropping malformed datagram"),
            }
        }
    }
}

/// Errors a datagram socket reports for an earlier send that drew an ICMP reply.
fn is_icmp_echo(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}
