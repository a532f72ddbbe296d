//! Name server handles.
//!
//! A [`ServerSpec`] is the textual identity of a server as the user gave it, a
//! hostname or a presentation-form address. Resolution to a socket address is
//! deferred until a query is about to be sent, so a lookup can carry servers
//! it never contacts.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use resolv_conf::ScopedIp;
use serde::Serialize;
use smallvec::SmallVec;
use tokio::net::lookup_host;
use tracing::debug;

use crate::{Error, Result};

pub const DEFAULT_DNS_PORT: u16 = 53;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ServerHost {
    Ip(IpAddr),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSpec {
    host: ServerHost,
    port: u16,
}

impl ServerSpec {
    pub fn new<T: Into<IpAddr>>(ip_addr: T, port: u16) -> Self {
        ServerSpec {
            host: ServerHost::Ip(ip_addr.into()),
            port,
        }
    }

    pub fn from_name<S: Into<String>>(name: S, port: u16) -> Self {
        ServerSpec {
            host: ServerHost::Name(name.into()),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn host(&self) -> &ServerHost {
        &self.host
    }

    /// Resolves this server to the socket addresses to dial.
    ///
    /// Hostnames go through the operating system resolver. This await runs on
    /// the runtime's blocking pool, so the engine's control flow is never
    /// stalled by a slow `getaddrinfo`.
    pub async fn resolve(&self) -> Result<SmallVec<[SocketAddr; 4]>> {
        match &self.host {
            ServerHost::Ip(ip) => Ok(SmallVec::from_elem(SocketAddr::new(*ip, self.port), 1)),
            ServerHost::Name(name) => {
                let addrs: SmallVec<[SocketAddr; 4]> = lookup_host((name.as_str(), self.port)).await?.collect();
                debug!("Resolved {} to {} addresses", name, addrs.len());
                if addrs.is_empty() {
                    Err(Error::ParserError {
                        what: name.clone(),
                        to: "SocketAddr",
                        why: "hostname did not resolve to any address".to_string(),
                    })
                } else {
                    Ok(addrs)
                }
            }
        }
    }

    /// Picks the dial address: the address family of `source` wins when a
    /// source address is configured, otherwise IPv4 is preferred, otherwise
    /// the first resolved address is taken.
    pub async fn dial_addr(&self, source: Option<IpAddr>) -> Result<SocketAddr> {
        let addrs = self.resolve().await?;
        let preferred = match source {
            Some(src) => addrs.iter().find(|a| family_matches(a.ip(), src)),
            None => addrs.iter().find(|a| a.is_ipv4()),
        };
        Ok(preferred.copied().unwrap_or(addrs[0]))
    }
}

/// True if both addresses belong to the same address family.
pub fn family_matches(a: IpAddr, b: IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let str = match &self.host {
            ServerHost::Ip(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            ServerHost::Ip(IpAddr::V4(ip)) => format!("{}:{}", ip, self.port),
            ServerHost::Name(name) => format!("{}:{}", name, self.port),
        };
        fmt.write_str(&str)
    }
}

impl FromStr for ServerSpec {
    type Err = Error;

    /// Parses `@server` style notation: an address literal, a `[v6]:port`
    /// literal, a hostname, or a hostname followed by `:port`.
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(ip) = IpAddr::from_str(s) {
            return Ok(ServerSpec::new(ip, DEFAULT_DNS_PORT));
        }
        if let Ok(sock) = SocketAddr::from_str(s) {
            return Ok(ServerSpec::new(sock.ip(), sock.port()));
        }
        match s.rsplit_once(':') {
            Some((name, port)) if !name.is_empty() && !name.contains(':') => {
                let port: u16 = port.parse().map_err(|_| Error::ParserError {
                    what: s.to_string(),
                    to: "ServerSpec",
                    why: "invalid port".to_string(),
                })?;
                Ok(ServerSpec::from_name(name, port))
            }
            None if !s.is_empty() => Ok(ServerSpec::from_name(s, DEFAULT_DNS_PORT)),
            _ => Err(Error::ParserError {
                what: s.to_string(),
                to: "ServerSpec",
                why: "neither an address, nor a [v6]:port literal, nor a hostname".to_string(),
            }),
        }
    }
}

/// The process-wide default server list, usually from `/etc/resolv.conf`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerGroup(Vec<ServerSpec>);

impl ServerGroup {
    pub fn new<T: Into<Vec<ServerSpec>>>(servers: T) -> Self {
        ServerGroup(servers.into())
    }

    pub fn from_system_config() -> Result<Self> {
        crate::system_config::load_from_system_config()
    }

    pub fn servers(&self) -> &[ServerSpec] {
        &self.0
    }

    pub fn into_servers(self) -> Vec<ServerSpec> {
        self.0
    }
}

#[doc(hidden)]
impl From<resolv_conf::Config> for ServerGroup {
    fn from(config: resolv_conf::Config) -> Self {
        let mut servers: Vec<_> = config
            .nameservers
            .into_iter()
            .map(|x| match x {
                ScopedIp::V4(ipv4) => ServerSpec::new(ipv4, DEFAULT_DNS_PORT),
                ScopedIp::V6(ipv6, _) => ServerSpec::new(ipv6, DEFAULT_DNS_PORT),
            })
            .collect();
        if servers.is_empty() {
            servers.push(ServerSpec::new([127, 0, 0, 1], DEFAULT_DNS_PORT));
        }

        ServerGroup(servers)
    }
}
