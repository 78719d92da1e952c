#![no_std]

// Kernel map layouts shared between the daemon and the tc classifier.
// Keep this crate `no_std` friendly so it can be used from eBPF code.
//
// Every address and port stored in a map is in network byte order, exactly as
// it appears in the packet headers. The classifier copies header fields into
// keys without swapping, so userspace must build keys from octets.

pub const MAP_CLIENT_ACCOUNTS: &str = "client_accounts";
pub const MAP_FLOW_METRICS: &str = "flow_metrics";
pub const MAP_CONTROL: &str = "gatekeeper_control";
pub const PROGRAM_NAME: &str = "gatekeeper_tc";
pub const CONTROL_SLOT_RUNTIME: u32 = 0;

/// Pacing bucket used for traffic from addresses that are not clients.
pub const UNKNOWN_BUCKET: u32 = 0;
/// Set on the pacing bucket id of outbound traffic when buckets are independent.
pub const OUTBOUND_BUCKET_BIT: u32 = 1 << 31;

/// IPv4 address as stored in a map key: the four octets in wire order.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Ipv4Key(pub u32);

impl Ipv4Key {
    pub const fn from_octets(octets: [u8; 4]) -> Self {
        Self(u32::from_ne_bytes(octets))
    }

    pub const fn octets(self) -> [u8; 4] {
        self.0.to_ne_bytes()
    }
}

/// Value of the `client_accounts` hash map. Rates are bytes per second; zero
/// disables pacing for that direction.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ClientInfo {
    pub account_id: u32,
    pub inbound_rate: u32,
    pub outbound_rate: u32,
}

/// Key of the per-CPU `flow_metrics` map.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub client: Ipv4Key,
    pub remote: Ipv4Key,
    /// Remote TCP/UDP port in network byte order, zero for other protocols.
    pub remote_port: u16,
    pub pad: u16,
}

impl FlowKey {
    pub const fn new(client: Ipv4Key, remote: Ipv4Key, remote_port_be: u16) -> Self {
        Self {
            client,
            remote,
            remote_port: remote_port_be,
            pad: 0,
        }
    }

    /// Remote port in host byte order.
    pub const fn port(&self) -> u16 {
        u16::from_be(self.remote_port)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ControlConfig {
    /// Non-zero collapses inbound and outbound pacing into one bucket per account.
    pub shared_bucket: u8,
    pub reserved: [u8; 3],
    /// Pacing rate for traffic that matches no client, bytes per second.
    pub unknown_rate: u32,
    pub dropped_packets: u64,
}

// When compiled for userspace with the `user` feature enabled the crate
// exposes an implementation of `aya::Pod` for these types so they can be
// used with aya's typed map APIs. We keep this behind a feature so the
// no_std eBPF side doesn't pull in userspace-only dependencies.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{ClientInfo, ControlConfig, FlowCounters, FlowKey, Ipv4Key};
    use aya::Pod;

    unsafe impl Pod for Ipv4Key {}
    unsafe impl Pod for ClientInfo {}
    unsafe impl Pod for FlowKey {}
    unsafe impl Pod for FlowCounters {}
    unsafe impl Pod for ControlConfig {}
}
