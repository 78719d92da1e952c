//! The WireGuard link: creation, address, NAT, peers and teardown.

pub mod nat;
pub mod peers;
pub mod wg;

use std::{net::IpAddr, num::NonZeroI32, path::Path, process::Stdio};

use futures::TryStreamExt as _;
use ipnet::Ipv4Net;
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::{LinkUnspec, LinkWireguard};
use tokio::{io::AsyncWriteExt as _, process::Command};
use tracing::{debug, info};

use crate::config::IP_FORWARD_SYSCTL;
use crate::error::TunnelError;
use crate::model::DeclaredInterface;
use crate::tc;

use nat::Firewall;
use peers::{PeerMap, PeerTable, TunnelControl};

/// Runs `program`, feeding `stdin` if given, and returns its stdout.
pub(crate) async fn run(
    program: &str,
    args: &[&str],
    stdin: Option<&[u8]>,
) -> Result<String, TunnelError> {
    let command = format!("{program} {}", args.first().copied().unwrap_or_default());
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| TunnelError::Spawn {
            command: command.clone(),
            source,
        })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await?;
        drop(pipe);
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(TunnelError::Command {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.code.map(|code| -NonZeroI32::get(code)),
        _ => None,
    }
}

pub async fn link_index(netlink: &rtnetlink::Handle, name: &str) -> Result<Option<u32>, TunnelError> {
    let mut links = netlink.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(Some(link.header.index)),
        Ok(None) => Ok(None),
        Err(err) if errno(&err) == Some(libc::ENODEV) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// A WireGuard link this process created or adopted.
pub struct TunnelInterface<C> {
    name: String,
    index: u32,
    netlink: rtnetlink::Handle,
    peers: PeerTable<C>,
    firewall: Firewall,
}

impl<C: TunnelControl> TunnelInterface<C> {
    /// Adopts the link named in `declared` or creates it, then installs the
    /// pacing qdisc and configures key and port. A link created here is
    /// removed again if a later step fails.
    pub async fn open(
        netlink: rtnetlink::Handle,
        control: C,
        declared: &DeclaredInterface,
    ) -> Result<Self, TunnelError> {
        let name = declared.name.clone();
        let (index, created) = match link_index(&netlink, &name).await? {
            Some(index) => {
                info!(device = %name, ifindex = index, "adopting existing link");
                (index, false)
            }
            None => {
                netlink
                    .link()
                    .add(LinkWireguard::new(&name).build())
                    .execute()
                    .await?;
                let index = link_index(&netlink, &name)
                    .await?
                    .ok_or_else(|| TunnelError::LinkNotFound(name.clone()))?;
                info!(device = %name, ifindex = index, "created wireguard link");
                (index, true)
            }
        };

        let tunnel = Self {
            name,
            index,
            netlink,
            peers: PeerTable::new(control, declared.name.clone()),
            firewall: Firewall::default(),
        };
        match tunnel.prepare(declared).await {
            Ok(()) => Ok(tunnel),
            Err(err) => {
                if created {
                    let _ = tunnel.netlink.link().del(index).execute().await;
                }
                Err(err)
            }
        }
    }

    async fn prepare(&self, declared: &DeclaredInterface) -> Result<(), TunnelError> {
        tc::replace_fq_root(&self.netlink, self.index as i32).await?;
        self.peers
            .control()
            .configure(&self.name, &declared.private_key, declared.listen_port)
            .await?;
        debug!(device = %self.name, port = declared.listen_port, "configured key and port");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Leaves `subnet` as the only IPv4 address on the link.
    pub async fn assign_address(&self, subnet: Ipv4Net) -> Result<(), TunnelError> {
        let mut addresses = self
            .netlink
            .address()
            .get()
            .set_link_index_filter(self.index)
            .execute();
        let mut stale = Vec::new();
        while let Some(msg) = addresses.try_next().await? {
            if msg.header.family == AddressFamily::Inet {
                stale.push(msg);
            }
        }
        for msg in stale {
            match self.netlink.address().del(msg).execute().await {
                Ok(()) => {}
                Err(err) if errno(&err) == Some(libc::EADDRNOTAVAIL) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let added = self
            .netlink
            .address()
            .add(self.index, IpAddr::V4(subnet.addr()), subnet.prefix_len())
            .execute()
            .await;
        match added {
            Ok(()) => {}
            Err(err) if errno(&err) == Some(libc::EEXIST) => {}
            Err(err) => return Err(err.into()),
        }
        info!(device = %self.name, address = %subnet, "address assigned");
        Ok(())
    }

    /// Enables forwarding and replaces this link's NAT rules.
    pub async fn apply_nat(&self, egress: &str) -> Result<(), TunnelError> {
        nat::ensure_ip_forward(Path::new(IP_FORWARD_SYSCTL)).await?;
        self.firewall.apply(&self.name, self.index, egress).await
    }

    pub async fn clear_nat(&self) -> Result<(), TunnelError> {
        self.firewall.clear(self.index).await
    }

    pub async fn link_up(&self) -> Result<(), TunnelError> {
        self.netlink
            .link()
            .set(LinkUnspec::new_with_index(self.index).up().build())
            .execute()
            .await?;
        info!(device = %self.name, "link up");
        Ok(())
    }

    pub async fn sync_peers(&mut self, desired: PeerMap) -> Result<usize, TunnelError> {
        self.peers.sync(desired).await
    }

    /// Removes the link. Peers go with it.
    pub async fn delete(self) -> Result<(), TunnelError> {
        match self.netlink.link().del(self.index).execute().await {
            Ok(()) => {}
            Err(err) if errno(&err) == Some(libc::ENODEV) => {}
            Err(err) => return Err(err.into()),
        }
        info!(device = %self.name, ifindex = self.index, "link deleted");
        Ok(())
    }
}
