use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;

/// A candidate rally-point relay server, as supplied by the caller.
///
/// Identity for probing purposes is the (address4, address6, port) triple,
/// not the whole descriptor: an update that keeps the endpoint but edits the
/// description is the same server, an update that moves the endpoint is a
/// different one even under the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: u32,
    pub description: String,
    #[serde(default)]
    pub address4: Option<Ipv4Addr>,
    #[serde(default)]
    pub address6: Option<Ipv6Addr>,
    pub port: u16,
}

impl ServerDescriptor {
    /// Whether `other` points at the same network endpoint.
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.address4 == other.address4
            && self.address6 == other.address6
            && self.port == other.port
    }

    /// Socket addresses to probe: one per populated address family.
    /// Empty when the descriptor carries no addresses at all.
    pub fn probe_targets(&self) -> Vec<SocketAddr> {
        let mut targets = Vec::with_capacity(2);
        if let Some(v4) = self.address4 {
            targets.push(SocketAddr::from((v4, self.port)));
        }
        if let Some(v6) = self.address6 {
            targets.push(SocketAddr::from((v6, self.port)));
        }
        targets
    }
}

/// A cached latency measurement for one server.
#[derive(Debug, Clone, Copy)]
pub struct PingResult {
    /// Lower-median round-trip time across the sampled rounds.
    pub ping: Duration,
    /// When the measurement was written.
    pub last_pinged: Instant,
}
