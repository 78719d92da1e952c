use std::{collections::HashMap, io, net::Ipv4Addr};

use anyhow::{Context, Result};
use aya::maps::{HashMap as BpfHashMap, MapData, MapError};
use gatekeeper_common::{ClientInfo, Ipv4Key};
use tracing::debug;

use crate::model::{ClientAccount, ipv4_key, key_addr};

/// The kernel-resident client table the classifier paces against.
pub trait ThrottleMap {
    fn entries(&self) -> Result<Vec<(Ipv4Key, ClientInfo)>>;
    fn write(&mut self, key: Ipv4Key, value: ClientInfo) -> Result<()>;
    /// Removing a key that is already gone succeeds.
    fn remove(&mut self, key: Ipv4Key) -> Result<()>;
}

impl ThrottleMap for BpfHashMap<MapData, Ipv4Key, ClientInfo> {
    fn entries(&self) -> Result<Vec<(Ipv4Key, ClientInfo)>> {
        self.iter()
            .map(|item| item.context("failed to iterate client map"))
            .collect()
    }

    fn write(&mut self, key: Ipv4Key, value: ClientInfo) -> Result<()> {
        self.insert(key, value, 0)
            .with_context(|| format!("failed to write client {}", key_addr(key)))
    }

    fn remove(&mut self, key: Ipv4Key) -> Result<()> {
        match BpfHashMap::remove(self, &key) {
            Ok(()) | Err(MapError::KeyNotFound) => Ok(()),
            Err(MapError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::NotFound => {
                Ok(())
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to delete client {}", key_addr(key)))
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ThrottleDelta {
    pub written: usize,
    pub removed: usize,
}

/// Keeps the client table equal to the last desired set with minimal writes.
pub struct ThrottleSync<T> {
    map: T,
    shadow: Option<HashMap<Ipv4Key, ClientInfo>>,
}

impl<T: ThrottleMap> ThrottleSync<T> {
    pub fn new(map: T) -> Self {
        Self { map, shadow: None }
    }

    pub fn update(&mut self, desired: &HashMap<Ipv4Addr, ClientAccount>) -> Result<ThrottleDelta> {
        if self.shadow.is_none() {
            let current: HashMap<_, _> = self.map.entries()?.into_iter().collect();
            debug!(entries = current.len(), "hydrated throttle shadow");
            self.shadow = Some(current);
        }
        let shadow = self.shadow.get_or_insert_with(HashMap::new);

        let mut delta = ThrottleDelta::default();
        let mut wanted = HashMap::with_capacity(desired.len());
        for (addr, account) in desired {
            let key = ipv4_key(*addr);
            let value = account.info();
            wanted.insert(key, value);
            if shadow.get(&key) == Some(&value) {
                continue;
            }
            debug!(client = %addr, account = value.account_id, "writing throttle entry");
            self.map.write(key, value)?;
            shadow.insert(key, value);
            delta.written += 1;
        }

        let stale: Vec<Ipv4Key> = shadow
            .keys()
            .filter(|key| !wanted.contains_key(*key))
            .copied()
            .collect();
        for key in stale {
            debug!(client = %key_addr(key), "removing throttle entry");
            self.map.remove(key)?;
            shadow.remove(&key);
            delta.removed += 1;
        }

        Ok(delta)
    }
}
