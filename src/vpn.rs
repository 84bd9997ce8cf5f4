//! Platform VPN service seam: networks, tunnel configuration, packet pipes.
//!
//! The platform creates the tun device and protected sockets; the session
//! only ever sees their file descriptors wrapped in [`FdPacketPipe`]
//! handles that it owns exclusively.

use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::RawFd;

/// Kind of platform network a socket can be bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    Cellular,
    Wifi,
    Ethernet,
    Unknown,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkType::Cellular => "CELLULAR",
            NetworkType::Wifi => "WIFI",
            NetworkType::Ethernet => "ETHERNET",
            NetworkType::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// A platform network as reported to `SetNetwork`.
///
/// The id is absent when the platform cannot identify the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub network_id: Option<u32>,
    pub network_type: NetworkType,
}

impl NetworkInfo {
    pub fn new(network_id: Option<u32>, network_type: NetworkType) -> Self {
        Self {
            network_id,
            network_type,
        }
    }
}

impl fmt::Display for NetworkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network_id {
            Some(id) => write!(f, "{}/{}", self.network_type, id),
            None => write!(f, "{}/-", self.network_type),
        }
    }
}

/// Address family of a tunnel address entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpFamily {
    V4,
    V6,
}

/// An address range handed to the platform when building the tunnel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub family: IpFamily,
    pub ip_range: String,
    pub prefix: u32,
}

impl IpRange {
    pub fn v4(ip_range: impl Into<String>, prefix: u32) -> Self {
        Self {
            family: IpFamily::V4,
            ip_range: ip_range.into(),
            prefix,
        }
    }

    pub fn v6(ip_range: impl Into<String>, prefix: u32) -> Self {
        Self {
            family: IpFamily::V6,
            ip_range: ip_range.into(),
            prefix,
        }
    }

    /// Parse a `"addr/prefix"` string into a range of the given family.
    pub fn parse(family: IpFamily, s: &str) -> Result<Self, Status> {
        let (addr, prefix) = s
            .rsplit_once('/')
            .ok_or_else(|| Status::invalid_argument(format!("missing prefix in range: {}", s)))?;
        let prefix: u32 = prefix
            .parse()
            .map_err(|_| Status::invalid_argument(format!("bad prefix in range: {}", s)))?;
        if addr.is_empty() {
            return Err(Status::invalid_argument(format!("empty address in range: {}", s)));
        }
        Ok(Self {
            family,
            ip_range: addr.to_string(),
            prefix,
        })
    }
}

/// Everything the platform needs to create the tun device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub tunnel_ip_addresses: Vec<IpRange>,
    pub tunnel_dns_addresses: Vec<IpRange>,
    pub is_metered: bool,
}

impl TunnelConfig {
    /// The fixed public resolvers routed through the tunnel.
    pub fn default_dns_addresses() -> Vec<IpRange> {
        vec![
            IpRange::v4("8.8.8.8", 32),
            IpRange::v4("8.8.8.4", 32),
            IpRange::v6("2001:4860:4860::8888", 128),
            IpRange::v6("2001:4860:4860::8844", 128),
        ]
    }
}

/// An opaque handle around a platform file descriptor.
///
/// The session owns at most one tunnel pipe and one network pipe at a
/// time; datapath only ever borrows them across a synchronous call. The
/// descriptor's lifetime is managed by the platform VPN service, so
/// dropping the pipe releases the session's claim without closing the fd.
#[derive(Debug, PartialEq, Eq)]
pub struct FdPacketPipe {
    fd: RawFd,
}

impl FdPacketPipe {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    /// The wrapped file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Display for FdPacketPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.fd)
    }
}

/// Platform VPN integration seam.
pub trait VpnServiceInterface: Send + Sync {
    /// Create the tun device for the given tunnel configuration.
    fn create_tunnel(&self, config: &TunnelConfig) -> Result<FdPacketPipe, Status>;

    /// Create a socket bound to `network_info` whose traffic bypasses the
    /// VPN routing rules.
    fn create_protected_network_socket(
        &self,
        network_info: &NetworkInfo,
    ) -> Result<FdPacketPipe, Status>;
}
