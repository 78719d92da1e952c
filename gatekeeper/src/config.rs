//! Runtime tunables that have no command-line flag.

use std::time::Duration;

/// How often the meter drains the kernel flow map into its accumulator.
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// Default period of the reconciler's metrics tick (seconds).
pub const METRICS_INTERVAL_SECS: u64 = 30;

/// Default period after which the telemetry writer commits its batch (seconds).
pub const COMMIT_INTERVAL_SECS: u64 = 30;

/// Capacity of the telemetry writer's command queue.
pub const WRITER_QUEUE_CAPACITY: usize = 128;

/// Queries with fewer client addresses than this reuse a cached statement.
pub const STATEMENT_CACHE_ARITY: usize = 10;

/// Width of a usage aggregation bucket (seconds).
pub const USAGE_BUCKET_SECS: i64 = 60 * 60;

/// Usage rows where both directions stay under this many bytes are dropped.
pub const USAGE_NOISE_FLOOR_BYTES: u64 = 4096;

/// Firewall mark for tunnel ingress is this base plus the link index.
pub const NAT_MARK_BASE: u32 = 0x500;

/// Pacing rate for traffic from addresses that belong to no client (bytes/s).
pub const DEFAULT_UNKNOWN_RATE: u32 = 1_000_000;

pub const DEFAULT_EBPF_OBJECT: &str = "/usr/lib/gatekeeper/gatekeeper-ebpf";
pub const DEFAULT_DECLARED_DB: &str = "db.sqlite";
pub const DEFAULT_TELEMETRY_DB: &str = "telemetry.sqlite";

pub const IP_FORWARD_SYSCTL: &str = "/proc/sys/net/ipv4/ip_forward";

/// Command used to configure WireGuard devices.
pub const WG_BIN: &str = "wg";
pub const IPTABLES_BIN: &str = "iptables";

#[derive(Clone, Debug)]
pub struct MeterOptions {
    pub ebpf_object: std::path::PathBuf,
    pub unknown_rate: u32,
    pub shared_bucket: bool,
}

impl Default for MeterOptions {
    fn default() -> Self {
        Self {
            ebpf_object: DEFAULT_EBPF_OBJECT.into(),
            unknown_rate: DEFAULT_UNKNOWN_RATE,
            shared_bucket: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_bucket_is_one_hour() {
        assert_eq!(USAGE_BUCKET_SECS, 3600);
    }

    #[test]
    fn intervals_positive() {
        const _: () = assert!(METRICS_INTERVAL_SECS > 0);
        const _: () = assert!(COMMIT_INTERVAL_SECS > 0);
        const _: () = assert!(WRITER_QUEUE_CAPACITY > 0);
        assert!(!DRAIN_INTERVAL.is_zero());
    }

    #[test]
    fn mark_for_first_link_indices() {
        assert_eq!(format!("0x{:x}", NAT_MARK_BASE + 7), "0x507");
    }
}
