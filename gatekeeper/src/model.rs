use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use gatekeeper_common::{ClientInfo, FlowCounters, FlowKey, Ipv4Key};
use ipnet::Ipv4Net;

use crate::error::TunnelError;

pub const KEY_LEN: usize = 32;

/// A Curve25519 key as WireGuard uses it; printed in base64 like `wg(8)` does.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PeerKey([u8; KEY_LEN]);

impl PeerKey {
    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for PeerKey {
    type Error = TunnelError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| TunnelError::invalid("key length", bytes.len().to_string()))?;
        Ok(Self(bytes))
    }
}

impl FromStr for PeerKey {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = BASE64
            .decode(s.trim())
            .map_err(|_| TunnelError::invalid("base64 key", s))?;
        Self::try_from(decoded.as_slice())
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

// Keep private keys out of logs.
impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = BASE64.encode(self.0);
        write!(f, "PeerKey({}…)", &encoded[..8])
    }
}

/// The authoritative tunnel interface record.
#[derive(Clone, Debug, PartialEq)]
pub struct DeclaredInterface {
    pub id: i64,
    pub name: String,
    pub private_key: PeerKey,
    pub listen_port: u16,
    /// Address of the gateway with the client subnet's prefix, e.g. `10.8.0.1/24`.
    pub subnet: Ipv4Net,
    /// Egress link for masquerading; empty disables NAT.
    pub nat_iface: String,
    pub external_ip: String,
    pub dns: String,
}

/// Throttle and accounting identity of one client.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ClientAccount {
    pub client_id: u32,
    pub account_id: u32,
    pub inbound_rate: u32,
    pub outbound_rate: u32,
}

impl ClientAccount {
    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            account_id: self.account_id,
            inbound_rate: self.inbound_rate,
            outbound_rate: self.outbound_rate,
        }
    }
}

/// One joined client/account row for the active interface.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientRow {
    pub public_key: PeerKey,
    pub address: Ipv4Addr,
    pub account: ClientAccount,
}

/// Byte limits are stored as signed 64-bit; the kernel map holds u32.
pub fn clamp_rate(limit: i64) -> u32 {
    u32::try_from(limit.max(0)).unwrap_or(u32::MAX)
}

pub fn ipv4_key(addr: Ipv4Addr) -> Ipv4Key {
    Ipv4Key::from_octets(addr.octets())
}

pub fn key_addr(key: Ipv4Key) -> Ipv4Addr {
    Ipv4Addr::from(key.octets())
}

/// Numeric form used in telemetry rows; anything but IPv4 packs as 0.
pub fn pack_ipv4(addr: IpAddr) -> u32 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(u32::from).unwrap_or(0),
    }
}

/// Flow identity in host types, as drained from the kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Flow {
    pub client: Ipv4Addr,
    pub remote: Ipv4Addr,
    pub remote_port: u16,
}

impl Flow {
    /// Destination label used by the usage table.
    pub fn destination(&self) -> String {
        format!("{}:{}", self.remote, self.remote_port)
    }
}

impl From<FlowKey> for Flow {
    fn from(key: FlowKey) -> Self {
        Self {
            client: key_addr(key.client),
            remote: key_addr(key.remote),
            remote_port: key.port(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Usage {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.bytes_in = self.bytes_in.wrapping_add(other.bytes_in);
        self.bytes_out = self.bytes_out.wrapping_add(other.bytes_out);
    }

    pub fn is_zero(&self) -> bool {
        self.bytes_in == 0 && self.bytes_out == 0
    }
}

impl From<FlowCounters> for Usage {
    fn from(c: FlowCounters) -> Self {
        Self {
            bytes_in: c.bytes_in,
            bytes_out: c.bytes_out,
        }
    }
}
