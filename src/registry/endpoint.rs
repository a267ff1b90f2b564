use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("invalid endpoint: {0}")]
    Invalid(String),
}

/// Transport address plus scheme, rendered as `scheme://address`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: String,
    address: String,
}

impl Endpoint {
    pub fn new(scheme: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            address: address.into(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("://") {
            Some((scheme, address)) if !scheme.is_empty() && !address.is_empty() => {
                Ok(Endpoint::new(scheme, address))
            }
            _ => Err(EndpointError::Invalid(s.to_string())),
        }
    }
}

/// Address peers should dial to reach a server bound at `bound`.
///
/// An unspecified bind host is replaced by `advertise_host` when given,
/// otherwise by the detected local IP. Loopback is the last resort.
pub fn advertise_address(bound: SocketAddr, advertise_host: Option<&str>) -> String {
    if !bound.ip().is_unspecified() {
        return bound.to_string();
    }

    if let Some(host) = advertise_host {
        return match host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, bound.port()).to_string(),
            Err(_) => format!("{host}:{}", bound.port()),
        };
    }

    let ip = detect_local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    SocketAddr::new(ip, bound.port()).to_string()
}

/// Detect the local IP address of this process.
///
/// Tries two methods:
/// 1. Resolve the HOSTNAME environment variable (set by Docker and Kubernetes)
/// 2. UDP socket routing table query (no data is actually sent)
pub fn detect_local_ip() -> Option<IpAddr> {
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if let Ok(addrs) = (hostname.as_str(), 0u16).to_socket_addrs() {
            for addr in addrs {
                if !addr.ip().is_loopback() {
                    return Some(addr.ip());
                }
            }
        }
    }

    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}
