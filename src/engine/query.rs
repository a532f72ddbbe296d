//! One in-flight dialog with one server.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::engine::xfr::XfrTracker;
use crate::nameserver::ServerSpec;

/// One outstanding dialog with one server for one lookup. Queries live in
/// their lookup's query table and are addressed by index, so there is no
/// owning back-reference.
#[derive(Debug)]
pub struct Query {
    server: ServerSpec,
    sockaddr: Option<SocketAddr>,
    time_sent: Option<Instant>,
    xfr: Option<XfrTracker>,
}

impl Query {
    pub(crate) fn new(server: ServerSpec) -> Query {
        Query {
            server,
            sockaddr: None,
            time_sent: None,
            xfr: None,
        }
    }

    pub fn server(&self) -> &ServerSpec {
        &self.server
    }

    /// The resolved destination, once the query has been dialed.
    pub fn sockaddr(&self) -> Option<SocketAddr> {
        self.sockaddr
    }

    pub(crate) fn set_sockaddr(&mut self, addr: SocketAddr) {
        self.sockaddr = Some(addr);
    }

    /// Stamps the send time for RTT reporting.
    pub(crate) fn mark_sent(&mut self) {
        self.time_sent = Some(Instant::now());
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.time_sent.map(|sent| Instant::now() - sent)
    }

    pub(crate) fn start_xfr(&mut self, tracker: XfrTracker) {
        self.xfr = Some(tracker);
    }

    pub(crate) fn xfr_mut(&mut self) -> Option<&mut XfrTracker> {
        self.xfr.as_mut()
    }

    /// Transfer progress of this query, if it is consuming a transfer stream.
    pub fn xfr(&self) -> Option<&XfrTracker> {
        self.xfr.as_ref()
    }

    /// Releases per-query resources. Sockets are dropped by the transport
    /// driver; this only forgets the dialing state.
    pub(crate) fn clear(&mut self) {
        self.sockaddr = None;
        self.time_sent = None;
    }
}
