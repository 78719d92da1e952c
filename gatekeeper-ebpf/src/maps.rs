// Map definitions for the gatekeeper classifier. Names and layouts are the
// daemon's ABI; see gatekeeper-common for the key/value types.

use aya_ebpf::macros::map;
use aya_ebpf::maps::{Array, HashMap, PerCpuHashMap};
use gatekeeper_common::{ClientInfo, ControlConfig, FlowCounters, FlowKey, Ipv4Key};

const BPF_F_NO_PREALLOC: u32 = 1;

/// Client address => account and pacing rates, written by the daemon.
#[map(name = "client_accounts")]
pub static CLIENT_ACCOUNTS: HashMap<Ipv4Key, ClientInfo> =
    HashMap::<Ipv4Key, ClientInfo>::with_max_entries(65536, BPF_F_NO_PREALLOC);

/// Pacing bucket => next departure timestamp (ns).
#[map(name = "pacing_state")]
pub static PACING_STATE: HashMap<u32, u64> =
    HashMap::<u32, u64>::with_max_entries(65536, BPF_F_NO_PREALLOC);

/// Per-flow byte counters, drained by the daemon every second.
#[map(name = "flow_metrics")]
pub static FLOW_METRICS: PerCpuHashMap<FlowKey, FlowCounters> =
    PerCpuHashMap::<FlowKey, FlowCounters>::with_max_entries(65536, 0);

#[map(name = "gatekeeper_control")]
pub static CONTROL: Array<ControlConfig> = Array::<ControlConfig>::with_max_entries(1, 0);
