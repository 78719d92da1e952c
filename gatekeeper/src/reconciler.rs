//! Drives kernel state towards the declared state.
//!
//! One task runs every handler in turn. Triggers are depth-1 channels, so a
//! burst of notifications of the same kind collapses into one pending wake.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::{
    sync::mpsc,
    task,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MeterOptions, USAGE_BUCKET_SECS, USAGE_NOISE_FLOOR_BYTES};
use crate::declared::DeclaredStore;
use crate::meter::MeterHandle;
use crate::model::{ClientAccount, ClientRow, Flow, Usage};
use crate::telemetry::{TelemetryStore, UsageBatch, UsageDelta};
use crate::tunnel::{
    TunnelInterface,
    peers::{PeerMap, TunnelControl},
};

/// Fire-and-forget notifications into the reconciler loop.
#[derive(Clone)]
pub struct ReconcilerHandle {
    interface: mpsc::Sender<()>,
    accounts: mpsc::Sender<()>,
    clients: mpsc::Sender<()>,
    delete: mpsc::Sender<()>,
}

impl ReconcilerHandle {
    pub fn update_interface(&self) {
        notify(&self.interface);
    }

    pub fn update_accounts(&self) {
        notify(&self.accounts);
    }

    pub fn update_clients(&self) {
        notify(&self.clients);
    }

    pub fn delete_interface(&self) {
        notify(&self.delete);
    }
}

// A full channel already holds a pending wake.
fn notify(tx: &mpsc::Sender<()>) {
    let _ = tx.try_send(());
}

struct Triggers {
    interface: mpsc::Receiver<()>,
    accounts: mpsc::Receiver<()>,
    clients: mpsc::Receiver<()>,
    delete: mpsc::Receiver<()>,
}

fn triggers() -> (ReconcilerHandle, Triggers) {
    let (interface_tx, interface_rx) = mpsc::channel(1);
    let (accounts_tx, accounts_rx) = mpsc::channel(1);
    let (clients_tx, clients_rx) = mpsc::channel(1);
    let (delete_tx, delete_rx) = mpsc::channel(1);
    (
        ReconcilerHandle {
            interface: interface_tx,
            accounts: accounts_tx,
            clients: clients_tx,
            delete: delete_tx,
        },
        Triggers {
            interface: interface_rx,
            accounts: accounts_rx,
            clients: clients_rx,
            delete: delete_rx,
        },
    )
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Event {
    InterfaceChanged,
    AccountsChanged,
    ClientsChanged,
    InterfaceDeleted,
    Tick,
}

pub struct Reconciler<C> {
    netlink: rtnetlink::Handle,
    control: C,
    declared: DeclaredStore,
    telemetry: Arc<TelemetryStore>,
    meter_opts: MeterOptions,
    metrics_interval: Duration,

    handle: ReconcilerHandle,
    triggers: Triggers,

    tunnel: Option<TunnelInterface<C>>,
    meter: Option<MeterHandle>,
    /// Interface row the live tunnel was built from.
    active: Option<i64>,
    /// Attribution for usage rows, as of the last client sync.
    clients: HashMap<Ipv4Addr, ClientAccount>,
}

impl<C: TunnelControl + Clone> Reconciler<C> {
    pub fn new(
        netlink: rtnetlink::Handle,
        control: C,
        declared: DeclaredStore,
        telemetry: Arc<TelemetryStore>,
        meter_opts: MeterOptions,
        metrics_interval: Duration,
    ) -> Self {
        let (handle, triggers) = triggers();
        Self {
            netlink,
            control,
            declared,
            telemetry,
            meter_opts,
            metrics_interval,
            handle,
            triggers,
            tunnel: None,
            meter: None,
            active: None,
            clients: HashMap::new(),
        }
    }

    pub fn handle(&self) -> ReconcilerHandle {
        self.handle.clone()
    }

    /// Serves triggers until `token` is cancelled or a handler fails. A
    /// failing handler ends the loop with its error.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let mut ticker = time::interval(self.metrics_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(metrics_interval = ?self.metrics_interval, "reconciler started");
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(()) = self.triggers.delete.recv() => Event::InterfaceDeleted,
                Some(()) = self.triggers.interface.recv() => Event::InterfaceChanged,
                Some(()) = self.triggers.accounts.recv() => Event::AccountsChanged,
                Some(()) = self.triggers.clients.recv() => Event::ClientsChanged,
                _ = ticker.tick() => Event::Tick,
            };
            debug!(?event, "reconciling");
            self.dispatch(event).await?;
        }

        self.shutdown();
        Ok(())
    }

    async fn dispatch(&mut self, event: Event) -> Result<()> {
        match event {
            Event::InterfaceChanged => self.interface_changed().await,
            Event::AccountsChanged => {
                self.handle.update_clients();
                Ok(())
            }
            Event::ClientsChanged => self.clients_changed().await,
            Event::InterfaceDeleted => self.interface_deleted().await,
            Event::Tick => {
                self.tick();
                Ok(())
            }
        }
    }

    async fn interface_changed(&mut self) -> Result<()> {
        let Some(declared) = self.declared.interface()? else {
            info!("no interface declared");
            return Ok(());
        };

        let tunnel = TunnelInterface::open(self.netlink.clone(), self.control.clone(), &declared)
            .await
            .with_context(|| format!("failed to bring up {}", declared.name))?;
        tunnel
            .assign_address(declared.subnet)
            .await
            .with_context(|| format!("failed to address {}", declared.name))?;
        tunnel
            .apply_nat(&declared.nat_iface)
            .await
            .with_context(|| format!("failed to configure NAT for {}", declared.name))?;
        tunnel
            .link_up()
            .await
            .with_context(|| format!("failed to bring {} up", declared.name))?;

        let meter = MeterHandle::attach(&self.netlink, tunnel.index(), &self.meter_opts)
            .await
            .with_context(|| format!("failed to attach meter to {}", declared.name))?;
        if let Some(previous) = self.meter.replace(meter) {
            self.record_usage(previous.metrics());
            previous.close();
        }

        let ifindex = tunnel.index();
        if let Some(previous) = self.tunnel.replace(tunnel) {
            if previous.index() != ifindex {
                info!(old = previous.name(), new = %declared.name, "tunnel renamed; removing old link");
                previous.clear_nat().await?;
                previous.delete().await?;
            }
        }
        self.active = Some(declared.id);

        info!(device = %declared.name, ifindex, address = %declared.subnet, "interface reconciled");
        self.handle.update_accounts();
        self.handle.update_clients();
        Ok(())
    }

    async fn clients_changed(&mut self) -> Result<()> {
        let (Some(tunnel), Some(interface_id)) = (self.tunnel.as_mut(), self.active) else {
            info!("no tunnel yet; skipping client sync");
            return Ok(());
        };

        let rows = self.declared.client_rows(interface_id)?;
        let (peers, accounts) = desired_state(&rows);

        let peer_ops = tunnel
            .sync_peers(peers)
            .await
            .with_context(|| format!("failed to sync peers on {}", tunnel.name()))?;
        if let Some(meter) = self.meter.as_mut() {
            meter
                .update_client_accounts(&accounts)
                .context("failed to sync throttle table")?;
        }

        info!(clients = accounts.len(), peer_ops, "clients reconciled");
        self.clients = accounts;
        Ok(())
    }

    async fn interface_deleted(&mut self) -> Result<()> {
        if let Some(meter) = self.meter.take() {
            self.record_usage(meter.metrics());
            meter.close();
        }
        if let Some(tunnel) = self.tunnel.take() {
            tunnel
                .clear_nat()
                .await
                .with_context(|| format!("failed to clear NAT for {}", tunnel.name()))?;
            tunnel.delete().await.context("failed to delete tunnel link")?;
        }
        self.active = None;
        self.clients.clear();
        Ok(())
    }

    fn tick(&mut self) {
        let Some(meter) = self.meter.as_ref() else {
            return;
        };
        let flows = meter.metrics();
        match meter.dropped_packets() {
            Ok(0) => {}
            Ok(dropped) => debug!(dropped, "packets dropped past pacing horizon"),
            Err(err) => warn!(error = %err, "failed to read drop counter"),
        }
        self.record_usage(flows);
    }

    fn record_usage(&self, flows: HashMap<Flow, Usage>) {
        if flows.is_empty() {
            return;
        }
        let batch = usage_batch(flows, &self.clients, Utc::now());
        if batch.deltas.is_empty() {
            return;
        }
        let deltas = batch.deltas.len();
        // The writer queue is bounded; a full queue blocks this worker.
        match task::block_in_place(|| self.telemetry.record_usage(batch)) {
            Ok(()) => debug!(deltas, "usage queued"),
            Err(err) => warn!(error = %err, deltas, "failed to queue usage"),
        }
    }

    /// Final drain, then release the meter. The link stays up for the next
    /// process to adopt.
    fn shutdown(&mut self) {
        if let Some(meter) = self.meter.take() {
            self.record_usage(meter.metrics());
            meter.close();
        }
        if let Err(err) = task::block_in_place(|| self.telemetry.flush()) {
            warn!(error = %err, "failed to flush telemetry");
        }
        info!("reconciler stopped");
    }
}

/// Peers the device should carry and the accounts the throttle table should
/// hold. Peer addresses use the form the device reports them in.
fn desired_state(rows: &[ClientRow]) -> (PeerMap, HashMap<Ipv4Addr, ClientAccount>) {
    let peers = rows
        .iter()
        .map(|row| (row.public_key, row.address.to_string()))
        .collect();
    let accounts = rows.iter().map(|row| (row.address, row.account)).collect();
    (peers, accounts)
}

/// Start of the usage bucket holding `now`, in epoch milliseconds.
fn bucket_start_ms(now: DateTime<Utc>) -> i64 {
    let secs = now.timestamp();
    (secs - secs.rem_euclid(USAGE_BUCKET_SECS)) * 1000
}

/// Attributes drained flows to clients. Flows from addresses that are no
/// longer declared keep zero ids; flows under the noise floor in both
/// directions are left out.
fn usage_batch(
    flows: HashMap<Flow, Usage>,
    clients: &HashMap<Ipv4Addr, ClientAccount>,
    now: DateTime<Utc>,
) -> UsageBatch {
    let bucket_start_ms = bucket_start_ms(now);
    let mut deltas: Vec<UsageDelta> = flows
        .into_iter()
        .filter(|(_, usage)| {
            usage.bytes_in >= USAGE_NOISE_FLOOR_BYTES || usage.bytes_out >= USAGE_NOISE_FLOOR_BYTES
        })
        .map(|(flow, usage)| {
            let account = clients.get(&flow.client).copied().unwrap_or_default();
            UsageDelta {
                client_ip: flow.client.to_string(),
                account_id: account.account_id,
                client_id: account.client_id,
                destination: flow.destination(),
                bytes_in: usage.bytes_in,
                bytes_out: usage.bytes_out,
            }
        })
        .collect();
    deltas.sort_by(|a, b| {
        (a.client_ip.as_str(), a.destination.as_str())
            .cmp(&(b.client_ip.as_str(), b.destination.as_str()))
    });

    UsageBatch {
        bucket_start_ms,
        bucket_end_ms: bucket_start_ms + USAGE_BUCKET_SECS * 1000,
        deltas,
    }
}
