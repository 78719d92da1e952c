//! Loads the tc classifier onto the tunnel link and owns its maps.

pub mod accumulator;
pub mod throttle;

use std::{collections::HashMap, ffi::CStr, io, net::Ipv4Addr, sync::Arc};

use anyhow::{Context, Result};
use aya::{
    Ebpf, EbpfLoader,
    maps::{Array, HashMap as BpfHashMap, MapData, PerCpuHashMap},
    programs::tc::{SchedClassifier, TcAttachType},
};
use gatekeeper_common::{
    CONTROL_SLOT_RUNTIME, ClientInfo, ControlConfig, FlowCounters, FlowKey, Ipv4Key,
    MAP_CLIENT_ACCOUNTS, MAP_CONTROL, MAP_FLOW_METRICS, PROGRAM_NAME,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{DRAIN_INTERVAL, MeterOptions};
use crate::model::{ClientAccount, Flow, Usage};
use crate::tc;

use accumulator::{FlowAccumulator, spawn_drain_ticker};
use throttle::{ThrottleDelta, ThrottleSync};

#[cfg(feature = "embed-ebpf")]
const EBPF_BYTES: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/gatekeeper-ebpf"));

type ClientMap = BpfHashMap<MapData, Ipv4Key, ClientInfo>;
type FlowMap = PerCpuHashMap<MapData, FlowKey, FlowCounters>;

/// The classifier attached to one link. Dropping it detaches the program.
pub struct MeterHandle {
    ifindex: u32,
    ebpf: Ebpf,
    throttle: ThrottleSync<ClientMap>,
    accumulator: Arc<FlowAccumulator>,
    drain_token: CancellationToken,
    drain_task: JoinHandle<()>,
}

impl MeterHandle {
    /// Loads the classifier, resets the link's clsact qdisc and attaches at
    /// ingress and egress. On error everything loaded so far is dropped.
    pub async fn attach(
        netlink: &rtnetlink::Handle,
        ifindex: u32,
        opts: &MeterOptions,
    ) -> Result<Self> {
        let mut ebpf = load_object(opts)?;
        write_control_config(&mut ebpf, control_block(opts))?;

        let clients = ebpf
            .take_map(MAP_CLIENT_ACCOUNTS)
            .with_context(|| format!("map {MAP_CLIENT_ACCOUNTS} not found"))?;
        let clients =
            ClientMap::try_from(clients).context("client map has unexpected type")?;
        let flows = ebpf
            .take_map(MAP_FLOW_METRICS)
            .with_context(|| format!("map {MAP_FLOW_METRICS} not found"))?;
        let flows = FlowMap::try_from(flows).context("flow map has unexpected type")?;

        tc::reset_clsact(netlink, ifindex as i32)
            .await
            .with_context(|| format!("failed to reset clsact on ifindex {ifindex}"))?;
        let iface = interface_name(ifindex)?;
        attach_tc(&mut ebpf, &iface)?;

        let accumulator = Arc::new(FlowAccumulator::new());
        let drain_token = CancellationToken::new();
        let drain_task = spawn_drain_ticker(
            flows,
            accumulator.clone(),
            drain_token.clone(),
            DRAIN_INTERVAL,
        );

        info!(ifindex, iface = %iface, shared_bucket = opts.shared_bucket, "meter attached");
        Ok(Self {
            ifindex,
            ebpf,
            throttle: ThrottleSync::new(clients),
            accumulator,
            drain_token,
            drain_task,
        })
    }

    pub fn update_client_accounts(
        &mut self,
        desired: &HashMap<Ipv4Addr, ClientAccount>,
    ) -> Result<ThrottleDelta> {
        let delta = self.throttle.update(desired)?;
        if delta != ThrottleDelta::default() {
            info!(
                ifindex = self.ifindex,
                written = delta.written,
                removed = delta.removed,
                "throttle table updated"
            );
        }
        Ok(delta)
    }

    /// Flow deltas drained since the previous call.
    pub fn metrics(&self) -> HashMap<Flow, Usage> {
        self.accumulator.take()
    }

    /// Packets the classifier dropped past its pacing horizon.
    pub fn dropped_packets(&self) -> Result<u64> {
        let map = self
            .ebpf
            .map(MAP_CONTROL)
            .with_context(|| format!("map {MAP_CONTROL} not found"))?;
        let array =
            Array::<_, ControlConfig>::try_from(map).context("control map has unexpected type")?;
        let cfg = array
            .get(&CONTROL_SLOT_RUNTIME, 0)
            .context("failed to read control block")?;
        Ok(cfg.dropped_packets)
    }

    /// Stops the drain ticker and releases programs and maps.
    pub fn close(self) {
        self.drain_token.cancel();
        self.drain_task.abort();
        info!(ifindex = self.ifindex, "meter closed");
    }
}

fn control_block(opts: &MeterOptions) -> ControlConfig {
    ControlConfig {
        shared_bucket: opts.shared_bucket as u8,
        reserved: [0; 3],
        unknown_rate: opts.unknown_rate,
        dropped_packets: 0,
    }
}

#[cfg(feature = "embed-ebpf")]
fn load_object(_opts: &MeterOptions) -> Result<Ebpf> {
    EbpfLoader::new()
        .load(EBPF_BYTES)
        .context("failed to load embedded eBPF object")
}

#[cfg(not(feature = "embed-ebpf"))]
fn load_object(opts: &MeterOptions) -> Result<Ebpf> {
    EbpfLoader::new()
        .load_file(&opts.ebpf_object)
        .with_context(|| {
            format!(
                "failed to load eBPF object {}",
                opts.ebpf_object.display()
            )
        })
}

fn write_control_config(ebpf: &mut Ebpf, cfg: ControlConfig) -> Result<()> {
    let map = ebpf
        .map_mut(MAP_CONTROL)
        .with_context(|| format!("map {MAP_CONTROL} not found"))?;
    let mut array =
        Array::<_, ControlConfig>::try_from(map).context("control map has unexpected type")?;
    array
        .set(CONTROL_SLOT_RUNTIME, cfg, 0)
        .context("failed to write control block")?;
    Ok(())
}

fn attach_tc(ebpf: &mut Ebpf, iface: &str) -> Result<()> {
    let program: &mut SchedClassifier = ebpf
        .program_mut(PROGRAM_NAME)
        .with_context(|| format!("program {PROGRAM_NAME} not found"))?
        .try_into()
        .context("tc program has wrong type")?;
    program.load().context("failed to load tc program")?;
    for attach_type in [TcAttachType::Ingress, TcAttachType::Egress] {
        program
            .attach(iface, attach_type)
            .with_context(|| format!("failed to attach tc {attach_type:?} on {iface}"))?;
    }
    Ok(())
}

fn interface_name(ifindex: u32) -> Result<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let ptr = unsafe { libc::if_indextoname(ifindex, buf.as_mut_ptr()) };
    if ptr.is_null() {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("no interface with index {ifindex}"));
    }
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}
