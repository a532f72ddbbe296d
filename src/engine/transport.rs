//! UDP and TCP transport primitives.
//!
//! UDP is a single datagram each way on a connected socket. TCP frames every
//! message with a two-byte big-endian length prefix in both directions and
//! keeps the stream open for the multi-message receive loop zone transfers
//! need. All sockets, outstanding sends, and outstanding receives are counted
//! so the engine can assert it shut down clean.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::trace;

pub const UDP_TIMEOUT: Duration = Duration::from_secs(5);
pub const TCP_TIMEOUT: Duration = Duration::from_secs(10);
/// Rotation timeout while more servers are waiting in the lookup's list.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(1);

/// While a transfer is in progress the active timeout is stretched so
/// transient stalls do not abort the stream.
const XFR_TIMEOUT_MULTIPLIER: u32 = 4;
const XFR_TIMEOUT_CAP: Duration = Duration::from_secs(600);

/// The timeout to arm for the currently active query.
pub(crate) fn query_timeout(tcp: bool, xfr: bool, configured: Option<Duration>, has_successor: bool) -> Duration {
    let base = match configured {
        Some(timeout) => timeout,
        None if has_successor => SERVER_TIMEOUT,
        None if tcp => TCP_TIMEOUT,
        None => UDP_TIMEOUT,
    };
    if xfr {
        std::cmp::min(base * XFR_TIMEOUT_MULTIPLIER, XFR_TIMEOUT_CAP)
    } else {
        base
    }
}

/// Live socket, outstanding send, and outstanding receive counts.
#[derive(Debug, Default)]
pub struct Counters {
    sockets: AtomicI64,
    sends: AtomicI64,
    recvs: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub sockets: i64,
    pub sends: i64,
    pub recvs: i64,
}

impl CounterSnapshot {
    pub fn all_zero(&self) -> bool {
        self.sockets == 0 && self.sends == 0 && self.recvs == 0
    }
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            sockets: self.sockets.load(Ordering::SeqCst),
            sends: self.sends.load(Ordering::SeqCst),
            recvs: self.recvs.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn socket_guard(self: &Arc<Self>) -> CounterGuard {
        CounterGuard::new(self.clone(), Kind::Socket)
    }

    pub(crate) fn send_guard(self: &Arc<Self>) -> CounterGuard {
        CounterGuard::new(self.clone(), Kind::Send)
    }

    pub(crate) fn recv_guard(self: &Arc<Self>) -> CounterGuard {
        CounterGuard::new(self.clone(), Kind::Recv)
    }

    fn cell(&self, kind: Kind) -> &AtomicI64 {
        match kind {
            Kind::Socket => &self.sockets,
            Kind::Send => &self.sends,
            Kind::Recv => &self.recvs,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Socket,
    Send,
    Recv,
}

/// Holds one count for as long as the guarded resource or operation lives.
#[derive(Debug)]
pub(crate) struct CounterGuard {
    counters: Arc<Counters>,
    kind: Kind,
}

impl CounterGuard {
    fn new(counters: Arc<Counters>, kind: Kind) -> CounterGuard {
        counters.cell(kind).fetch_add(1, Ordering::SeqCst);
        CounterGuard { counters, kind }
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.counters.cell(self.kind).fetch_sub(1, Ordering::SeqCst);
    }
}

fn any_addr(ipv4: bool) -> SocketAddr {
    if ipv4 {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16, 0, 0, 0, 0, 0, 0, 0], 0))
    }
}

/// A bound and connected UDP socket. The socket is shared so a receive can
/// stay posted while the engine resends on the same channel.
#[derive(Debug)]
pub(crate) struct UdpChannel {
    sock: Arc<UdpSocket>,
    _guard: CounterGuard,
}

impl UdpChannel {
    pub(crate) async fn open(
        dest: SocketAddr,
        source: Option<IpAddr>,
        counters: &Arc<Counters>,
    ) -> io::Result<UdpChannel> {
        let bind_addr = match source {
            Some(src) => SocketAddr::new(src, 0),
            None => any_addr(dest.is_ipv4()),
        };
        let sock = UdpSocket::bind(bind_addr).await?;
        sock.connect(dest).await?;
        trace!("UDP socket bound to {}", sock.local_addr()?);
        Ok(UdpChannel {
            sock: Arc::new(sock),
            _guard: counters.socket_guard(),
        })
    }

    pub(crate) async fn send(&self, payload: &[u8], counters: &Arc<Counters>) -> io::Result<()> {
        let _guard = counters.send_guard();
        self.sock.send(payload).await?;
        Ok(())
    }

    pub(crate) fn socket(&self) -> Arc<UdpSocket> {
        self.sock.clone()
    }
}

/// One posted receive on a connected UDP socket.
pub(crate) async fn udp_recv(
    sock: Arc<UdpSocket>,
    buf_size: usize,
    counters: Arc<Counters>,
) -> io::Result<(Vec<u8>, SocketAddr)> {
    let _guard = counters.recv_guard();
    let peer = sock.peer_addr()?;
    let mut buf = vec![0u8; buf_size];
    let len = sock.recv(&mut buf).await?;
    buf.truncate(len);
    Ok((buf, peer))
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RecvError {
    #[error("message length {length} exceeds the receive buffer of {limit} octets")]
    Oversized { length: usize, limit: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A connected TCP stream speaking length-prefixed DNS.
#[derive(Debug)]
pub(crate) struct TcpChannel {
    stream: TcpStream,
    peer: SocketAddr,
    _guard: CounterGuard,
}

impl TcpChannel {
    pub(crate) async fn connect(
        dest: SocketAddr,
        source: Option<IpAddr>,
        counters: &Arc<Counters>,
    ) -> io::Result<TcpChannel> {
        let socket = if dest.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(src) = source {
            socket.bind(SocketAddr::new(src, 0))?;
        }
        let stream = socket.connect(dest).await?;
        trace!("TCP stream connected to {}", dest);
        Ok(TcpChannel {
            stream,
            peer: dest,
            _guard: counters.socket_guard(),
        })
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) async fn send_message(&mut self, payload: &[u8], counters: &Arc<Counters>) -> io::Result<()> {
        debug_assert!(payload.len() <= u16::MAX as usize);
        let _guard = counters.send_guard();
        let prefix = (payload.len() as u16).to_be_bytes();
        self.stream.write_all(&prefix).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await
    }

    /// Reads one length-prefixed message. A declared length above `limit` is
    /// unrecoverable, the engine cannot grow the buffer.
    pub(crate) async fn recv_message(&mut self, limit: usize, counters: &Arc<Counters>) -> Result<Vec<u8>, RecvError> {
        let _guard = counters.recv_guard();
        let mut prefix = [0u8; 2];
        self.stream.read_exact(&mut prefix).await?;
        let length = u16::from_be_bytes(prefix) as usize;
        if length > limit {
            return Err(RecvError::Oversized { length, limit });
        }
        let mut buf = vec![0u8; length];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }
}
