#![no_std]
#![no_main]

mod maps;

use aya_ebpf::bindings::{BPF_ANY, BPF_EXIST, TC_ACT_OK, TC_ACT_SHOT, __sk_buff};
use aya_ebpf::helpers::bpf_ktime_get_ns;
use aya_ebpf::helpers::gen::bpf_skb_ecn_set_ce;
use aya_ebpf::macros::classifier;
use aya_ebpf::programs::TcContext;
use gatekeeper_common::{
    CONTROL_SLOT_RUNTIME, FlowCounters, FlowKey, Ipv4Key, OUTBOUND_BUCKET_BIT, UNKNOWN_BUCKET,
};

use maps::{CLIENT_ACCOUNTS, CONTROL, FLOW_METRICS, PACING_STATE};

const IPV4_MIN_HEADER_BYTES: usize = 20;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

/// The maximum delay we are willing to add; packets beyond it are dropped.
const TIME_HORIZON_NS: u64 = 2_000_000_000;
const ECN_HORIZON_NS: u64 = 5_000_000;
const NS_PER_SEC: u64 = 1_000_000_000;
const DEFAULT_UNKNOWN_RATE: u32 = 1_000_000;

struct Packet {
    src: Ipv4Key,
    dst: Ipv4Key,
    src_port: u16,
    dst_port: u16,
}

// The tunnel is an L3 device: skb data starts at the IP header.
#[classifier]
pub fn gatekeeper_tc(ctx: TcContext) -> i32 {
    let skb = ctx.skb.skb;
    let action = match parse_ipv4(ctx.data() as *const u8, ctx.data_end() as *const u8) {
        Some(pkt) => classify(skb, &pkt),
        None => pace(skb, UNKNOWN_BUCKET, unknown_rate()),
    };
    if action == TC_ACT_SHOT {
        record_drop();
    }
    action
}

fn classify(skb: *mut __sk_buff, pkt: &Packet) -> i32 {
    let wire_len = unsafe { (*skb).wire_len } as u64;
    let shared = shared_bucket();

    if let Some(cli) = CLIENT_ACCOUNTS.get_ptr(&pkt.src) {
        let cli = unsafe { *cli };
        count(FlowKey::new(pkt.src, pkt.dst, pkt.dst_port), 0, wire_len);
        let bucket = if shared {
            cli.account_id
        } else {
            OUTBOUND_BUCKET_BIT | cli.account_id
        };
        return pace(skb, bucket, cli.outbound_rate);
    }

    if let Some(cli) = CLIENT_ACCOUNTS.get_ptr(&pkt.dst) {
        let cli = unsafe { *cli };
        count(FlowKey::new(pkt.dst, pkt.src, pkt.src_port), wire_len, 0);
        let rate = if shared {
            cli.outbound_rate
        } else {
            cli.inbound_rate
        };
        return pace(skb, cli.account_id, rate);
    }

    pace(skb, UNKNOWN_BUCKET, unknown_rate())
}

fn parse_ipv4(data: *const u8, data_end: *const u8) -> Option<Packet> {
    if unsafe { data.add(IPV4_MIN_HEADER_BYTES) } > data_end {
        return None;
    }

    let version_ihl = unsafe { *data };
    if version_ihl >> 4 != 4 {
        return None;
    }
    let ihl_words = (version_ihl & 0x0f) as usize;
    if ihl_words < 5 {
        return None;
    }
    let header_len = ihl_words * 4;

    let proto = unsafe { *data.add(9) };
    // Copied without swapping: keys hold addresses in wire order.
    let src = unsafe { core::ptr::read_unaligned(data.add(12) as *const u32) };
    let dst = unsafe { core::ptr::read_unaligned(data.add(16) as *const u32) };

    let (src_port, dst_port) = if proto == PROTO_TCP || proto == PROTO_UDP {
        parse_ports(data, data_end, header_len).unwrap_or((0, 0))
    } else {
        (0, 0)
    };

    Some(Packet {
        src: Ipv4Key(src),
        dst: Ipv4Key(dst),
        src_port,
        dst_port,
    })
}

fn parse_ports(data: *const u8, data_end: *const u8, offset: usize) -> Option<(u16, u16)> {
    if unsafe { data.add(offset + 4) } > data_end {
        return None;
    }

    unsafe {
        let src = core::ptr::read_unaligned(data.add(offset) as *const u16);
        let dst = core::ptr::read_unaligned(data.add(offset + 2) as *const u16);
        Some((src, dst))
    }
}

fn count(key: FlowKey, bytes_in: u64, bytes_out: u64) {
    match FLOW_METRICS.get_ptr_mut(&key) {
        Some(ptr) => {
            let counters = unsafe { &mut *ptr };
            counters.bytes_in = counters.bytes_in.wrapping_add(bytes_in);
            counters.bytes_out = counters.bytes_out.wrapping_add(bytes_out);
        }
        None => {
            let init = FlowCounters {
                bytes_in,
                bytes_out,
            };
            let _ = FLOW_METRICS.insert(&key, &init, 0);
        }
    }
}

// Earliest-departure-time pacing; the fq qdisc on the link honours skb->tstamp.
fn pace(skb: *mut __sk_buff, bucket: u32, rate: u32) -> i32 {
    if rate == 0 {
        return TC_ACT_OK;
    }

    let wire_len = unsafe { (*skb).wire_len } as u64;
    let delay_ns = wire_len * NS_PER_SEC / rate as u64;
    let now = unsafe { bpf_ktime_get_ns() };

    let next = match PACING_STATE.get_ptr(&bucket) {
        Some(last) => unsafe { *last } + delay_ns,
        None => 0,
    };

    if next <= now {
        if PACING_STATE.insert(&bucket, &now, BPF_ANY as u64).is_err() {
            return TC_ACT_SHOT;
        }
        return TC_ACT_OK;
    }

    if next - now >= TIME_HORIZON_NS {
        return TC_ACT_SHOT;
    }

    if next - now >= ECN_HORIZON_NS {
        unsafe {
            bpf_skb_ecn_set_ce(skb as *mut _);
        }
    }

    if PACING_STATE.insert(&bucket, &next, BPF_EXIST as u64).is_err() {
        return TC_ACT_SHOT;
    }
    unsafe {
        (*skb).tstamp = next;
    }

    TC_ACT_OK
}

fn shared_bucket() -> bool {
    match CONTROL.get_ptr(CONTROL_SLOT_RUNTIME) {
        Some(ptr) => unsafe { (*ptr).shared_bucket != 0 },
        None => false,
    }
}

fn unknown_rate() -> u32 {
    match CONTROL.get_ptr(CONTROL_SLOT_RUNTIME) {
        Some(ptr) => unsafe { (*ptr).unknown_rate },
        None => DEFAULT_UNKNOWN_RATE,
    }
}

fn record_drop() {
    if let Some(ptr) = CONTROL.get_ptr_mut(CONTROL_SLOT_RUNTIME) {
        unsafe {
            (*ptr).dropped_packets = (*ptr).dropped_packets.wrapping_add(1);
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
