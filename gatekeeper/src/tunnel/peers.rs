use std::{collections::HashMap, future::Future};

use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::model::PeerKey;

/// Peer public key => allowed IP (bare address, no prefix).
pub type PeerMap = HashMap<PeerKey, String>;

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum PeerOp {
    Remove(PeerKey),
    /// Add the peer, or replace its allowed IP with this `/32`.
    Set(PeerKey, String),
}

/// The tunnel device's control API.
pub trait TunnelControl {
    fn configure(
        &self,
        device: &str,
        private_key: &PeerKey,
        listen_port: u16,
    ) -> impl Future<Output = Result<(), TunnelError>> + Send;

    fn peers(&self, device: &str) -> impl Future<Output = Result<PeerMap, TunnelError>> + Send;

    /// Applies every op in one call.
    fn apply(
        &self,
        device: &str,
        ops: &[PeerOp],
    ) -> impl Future<Output = Result<(), TunnelError>> + Send;
}

/// Ops turning `live` into `desired`: removals first, each group sorted by key.
pub fn diff_peers(live: &PeerMap, desired: &PeerMap) -> Vec<PeerOp> {
    let mut removals: Vec<PeerOp> = live
        .keys()
        .filter(|key| !desired.contains_key(*key))
        .map(|key| PeerOp::Remove(*key))
        .collect();
    let mut sets: Vec<PeerOp> = desired
        .iter()
        .filter(|(key, ip)| live.get(*key) != Some(*ip))
        .map(|(key, ip)| PeerOp::Set(*key, ip.clone()))
        .collect();
    removals.sort();
    sets.sort();
    removals.extend(sets);
    removals
}

/// Shadow of the device's peer table; the only writer of peers.
pub struct PeerTable<C> {
    control: C,
    device: String,
    live: Option<PeerMap>,
}

impl<C: TunnelControl> PeerTable<C> {
    pub fn new(control: C, device: impl Into<String>) -> Self {
        Self {
            control,
            device: device.into(),
            live: None,
        }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// Number of ops issued.
    pub async fn sync(&mut self, desired: PeerMap) -> Result<usize, TunnelError> {
        let live = match self.live.take() {
            Some(live) => live,
            None => {
                let live = self.control.peers(&self.device).await?;
                debug!(device = %self.device, peers = live.len(), "hydrated peer table");
                live
            }
        };

        let ops = diff_peers(&live, &desired);
        // The shadow follows `desired` even when the call below fails.
        self.live = Some(desired);
        if ops.is_empty() {
            return Ok(0);
        }

        for op in &ops {
            debug!(device = %self.device, ?op, "peer op");
        }
        if let Err(err) = self.control.apply(&self.device, &ops).await {
            warn!(device = %self.device, error = %err, "peer sync failed");
            return Err(err);
        }
        info!(device = %self.device, ops = ops.len(), "peers synced");
        Ok(ops.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-memory device recording every call.
    #[derive(Clone, Default)]
    struct FakeControl {
        pub state: Arc<Mutex<FakeState>>,
    }

    #[derive(Default)]
    struct FakeState {
        pub peers: PeerMap,
        pub apply_calls: usize,
        pub ops: usize,
        pub configured: Option<(String, u16)>,
        pub fail_apply: bool,
    }

    impl TunnelControl for FakeControl {
        async fn configure(
            &self,
            device: &str,
            _private_key: &PeerKey,
            listen_port: u16,
        ) -> Result<(), TunnelError> {
            self.state.lock().unwrap().configured = Some((device.to_string(), listen_port));
            Ok(())
        }

        async fn peers(&self, _device: &str) -> Result<PeerMap, TunnelError> {
            Ok(self.state.lock().unwrap().peers.clone())
        }

        async fn apply(&self, _device: &str, ops: &[PeerOp]) -> Result<(), TunnelError> {
            let mut state = self.state.lock().unwrap();
            state.apply_calls += 1;
            if state.fail_apply {
                return Err(TunnelError::invalid("peer op", "rejected"));
            }
            state.ops += ops.len();
            for op in ops {
                match op {
                    PeerOp::Remove(key) => {
                        state.peers.remove(key);
                    }
                    PeerOp::Set(key, ip) => {
                        state.peers.insert(*key, ip.clone());
                    }
                }
            }
            Ok(())
        }
    }

    fn key(n: u8) -> PeerKey {
        PeerKey::new([n; 32])
    }

    fn peers(entries: &[(u8, &str)]) -> PeerMap {
        entries
            .iter()
            .map(|(n, ip)| (key(*n), ip.to_string()))
            .collect()
    }

    #[test]
    fn diff_orders_removals_first() {
        let live = peers(&[(1, "10.0.0.2"), (2, "10.0.0.3")]);
        let desired = peers(&[(2, "10.0.0.9"), (3, "10.0.0.4")]);
        assert_eq!(
            diff_peers(&live, &desired),
            vec![
                PeerOp::Remove(key(1)),
                PeerOp::Set(key(2), "10.0.0.9".into()),
                PeerOp::Set(key(3), "10.0.0.4".into()),
            ]
        );
    }

    #[test]
    fn diff_of_equal_maps_is_empty() {
        let live = peers(&[(1, "10.0.0.2")]);
        assert!(diff_peers(&live, &live.clone()).is_empty());
    }

    #[tokio::test]
    async fn sync_converges_with_minimal_ops() {
        let control = FakeControl::default();
        let mut table = PeerTable::new(control.clone(), "wg0");

        let p1 = peers(&[(1, "10.0.0.2"), (2, "10.0.0.3"), (3, "10.0.0.4")]);
        let p2 = peers(&[(2, "10.0.0.3"), (3, "10.0.0.5"), (4, "10.0.0.6")]);

        assert_eq!(table.sync(p1).await.unwrap(), 3);
        // remove 1, replace 3, add 4
        assert_eq!(table.sync(p2.clone()).await.unwrap(), 3);
        assert_eq!(table.sync(p2.clone()).await.unwrap(), 0);

        let state = control.state.lock().unwrap();
        assert_eq!(state.peers, p2);
        assert_eq!(state.apply_calls, 2);
        assert_eq!(state.ops, 6);
    }

    #[tokio::test]
    async fn first_sync_hydrates_from_device() {
        let control = FakeControl::default();
        control.state.lock().unwrap().peers = peers(&[(1, "10.0.0.2"), (9, "10.0.0.99")]);
        let mut table = PeerTable::new(control.clone(), "wg0");

        assert_eq!(table.sync(peers(&[(1, "10.0.0.2")])).await.unwrap(), 1);
        assert_eq!(
            control.state.lock().unwrap().peers,
            peers(&[(1, "10.0.0.2")])
        );
    }

    #[tokio::test]
    async fn shadow_follows_desired_after_failure() {
        let control = FakeControl::default();
        let mut table = PeerTable::new(control.clone(), "wg0");
        control.state.lock().unwrap().fail_apply = true;

        let p1 = peers(&[(1, "10.0.0.2")]);
        assert!(table.sync(p1.clone()).await.is_err());

        control.state.lock().unwrap().fail_apply = false;
        assert_eq!(table.sync(p1).await.unwrap(), 0);
        assert_eq!(control.state.lock().unwrap().apply_calls, 1);
    }
}
