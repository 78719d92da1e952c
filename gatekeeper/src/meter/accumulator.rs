use std::{
    collections::HashMap,
    mem,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use aya::maps::{MapData, MapError, PerCpuHashMap, PerCpuValues};
use gatekeeper_common::{FlowCounters, FlowKey};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{Flow, Usage};

/// Something that hands out per-CPU flow counters and forgets them.
pub trait FlowSource {
    /// Every entry with its per-CPU values.
    fn snapshot(&self) -> Result<Vec<(FlowKey, Vec<FlowCounters>)>>;
    /// Drops `key`; an entry that is already gone counts as dropped.
    fn forget(&mut self, key: &FlowKey) -> Result<()>;
}

impl FlowSource for PerCpuHashMap<MapData, FlowKey, FlowCounters> {
    fn snapshot(&self) -> Result<Vec<(FlowKey, Vec<FlowCounters>)>> {
        let mut entries = Vec::new();
        for item in self.iter() {
            let (key, per_cpu): (FlowKey, PerCpuValues<FlowCounters>) =
                item.context("failed to iterate flow map")?;
            entries.push((key, per_cpu.iter().copied().collect()));
        }
        Ok(entries)
    }

    fn forget(&mut self, key: &FlowKey) -> Result<()> {
        match self.remove(key) {
            Ok(()) | Err(MapError::KeyNotFound) => Ok(()),
            Err(err) => Err(err).context("failed to delete flow entry"),
        }
    }
}

/// Flow byte deltas merged between two `take` calls.
#[derive(Default)]
pub struct FlowAccumulator {
    flows: Mutex<HashMap<Flow, Usage>>,
}

impl FlowAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&self, flow: Flow, usage: Usage) {
        if usage.is_zero() {
            return;
        }
        let mut guard = self.flows.lock().expect("flow accumulator mutex poisoned");
        guard.entry(flow).or_default().add(usage);
    }

    /// Swaps out everything merged so far.
    pub fn take(&self) -> HashMap<Flow, Usage> {
        let mut guard = self.flows.lock().expect("flow accumulator mutex poisoned");
        mem::take(&mut *guard)
    }

    /// Drains `source` once; returns the number of flows visited. Each entry
    /// is merged as soon as it is gone from the source, so a failed delete
    /// leaves that entry for the next drain and loses nothing already read.
    pub fn drain_from<S: FlowSource>(&self, source: &mut S) -> Result<usize> {
        let mut visited = 0;
        for (key, per_cpu) in source.snapshot()? {
            source.forget(&key)?;
            self.merge(Flow::from(key), sum_counters(per_cpu.iter()));
            visited += 1;
        }
        Ok(visited)
    }
}

fn sum_counters<'a, I>(values: I) -> Usage
where
    I: IntoIterator<Item = &'a FlowCounters>,
{
    let mut total = Usage::default();
    for v in values {
        total.add(Usage::from(*v));
    }
    total
}

/// Runs `drain_from` every `period` until `token` is cancelled. The source is
/// dropped when the task ends.
pub fn spawn_drain_ticker<S>(
    mut source: S,
    accumulator: Arc<FlowAccumulator>,
    token: CancellationToken,
    period: Duration,
) -> JoinHandle<()>
where
    S: FlowSource + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match accumulator.drain_from(&mut source) {
                Ok(0) => {}
                Ok(flows) => debug!(flows, "drained flow counters"),
                Err(err) => warn!(error = %err, "flow drain failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ipv4_key;
    use std::net::Ipv4Addr;

    /// Serves the front batch until every key in it has been forgotten.
    #[derive(Default)]
    struct ScriptedSource {
        batches: Vec<Vec<(FlowKey, Vec<FlowCounters>)>>,
        /// Deleting this key fails once.
        refuse: Option<FlowKey>,
    }

    impl FlowSource for ScriptedSource {
        fn snapshot(&self) -> Result<Vec<(FlowKey, Vec<FlowCounters>)>> {
            Ok(self.batches.first().cloned().unwrap_or_default())
        }

        fn forget(&mut self, key: &FlowKey) -> Result<()> {
            if self.refuse == Some(*key) {
                self.refuse = None;
                anyhow::bail!("delete refused");
            }
            if let Some(front) = self.batches.first_mut() {
                front.retain(|(k, _)| k != key);
                if front.is_empty() {
                    self.batches.remove(0);
                }
            }
            Ok(())
        }
    }

    fn key(port: u16) -> FlowKey {
        FlowKey::new(
            ipv4_key(Ipv4Addr::new(10, 8, 0, 2)),
            ipv4_key(Ipv4Addr::new(93, 184, 216, 34)),
            port.to_be(),
        )
    }

    fn counters(bytes_in: u64, bytes_out: u64) -> FlowCounters {
        FlowCounters {
            bytes_in,
            bytes_out,
        }
    }

    #[test]
    fn sum_counters_accumulates_multiple_cpus() {
        let cpus = [counters(100, 2), counters(50, 1)];
        assert_eq!(
            sum_counters(cpus.iter()),
            Usage {
                bytes_in: 150,
                bytes_out: 3
            }
        );
    }

    #[test]
    fn drains_merge_additively() {
        let acc = FlowAccumulator::new();
        let mut source = ScriptedSource {
            batches: vec![
                vec![(key(443), vec![counters(10, 1), counters(5, 0)])],
                vec![
                    (key(443), vec![counters(1, 1)]),
                    (key(80), vec![counters(7, 7)]),
                ],
            ],
            ..ScriptedSource::default()
        };

        assert_eq!(acc.drain_from(&mut source).unwrap(), 1);
        assert_eq!(acc.drain_from(&mut source).unwrap(), 2);

        let taken = acc.take();
        assert_eq!(taken.len(), 2);
        assert_eq!(
            taken[&Flow::from(key(443))],
            Usage {
                bytes_in: 16,
                bytes_out: 2
            }
        );
        assert_eq!(
            taken[&Flow::from(key(80))],
            Usage {
                bytes_in: 7,
                bytes_out: 7
            }
        );
    }

    #[test]
    fn take_does_not_return_the_same_bytes_twice() {
        let acc = FlowAccumulator::new();
        acc.merge(
            Flow::from(key(53)),
            Usage {
                bytes_in: 3,
                bytes_out: 4,
            },
        );
        assert_eq!(acc.take().len(), 1);
        assert!(acc.take().is_empty());
    }

    #[test]
    fn zero_deltas_are_not_recorded() {
        let acc = FlowAccumulator::new();
        let mut source = ScriptedSource {
            batches: vec![vec![(key(22), vec![counters(0, 0)])]],
            ..ScriptedSource::default()
        };
        assert_eq!(acc.drain_from(&mut source).unwrap(), 1);
        assert!(acc.take().is_empty());
    }

    #[test]
    fn failed_delete_keeps_bytes_already_removed() {
        let acc = FlowAccumulator::new();
        let mut source = ScriptedSource {
            batches: vec![vec![
                (key(443), vec![counters(100, 10)]),
                (key(80), vec![counters(7, 7)]),
            ]],
            refuse: Some(key(80)),
        };

        assert!(acc.drain_from(&mut source).is_err());
        let taken = acc.take();
        assert_eq!(taken.len(), 1);
        assert_eq!(
            taken[&Flow::from(key(443))],
            Usage {
                bytes_in: 100,
                bytes_out: 10
            }
        );

        // The refused entry is still in the source and is picked up next time.
        assert_eq!(acc.drain_from(&mut source).unwrap(), 1);
        let taken = acc.take();
        assert_eq!(taken.len(), 1);
        assert_eq!(
            taken[&Flow::from(key(80))],
            Usage {
                bytes_in: 7,
                bytes_out: 7
            }
        );
        assert_eq!(acc.drain_from(&mut source).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_drains_until_cancelled() {
        let acc = Arc::new(FlowAccumulator::new());
        let token = CancellationToken::new();
        let source = ScriptedSource {
            batches: vec![vec![(key(443), vec![counters(1, 2)])]],
            ..ScriptedSource::default()
        };
        let handle = spawn_drain_ticker(
            source,
            acc.clone(),
            token.clone(),
            Duration::from_secs(1),
        );

        time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
        handle.await.unwrap();

        let taken = acc.take();
        assert_eq!(
            taken[&Flow::from(key(443))],
            Usage {
                bytes_in: 1,
                bytes_out: 2
            }
        );
    }
}
