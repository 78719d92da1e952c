use crate::config::WG_BIN;
use crate::error::TunnelError;
use crate::model::PeerKey;

use super::peers::{PeerMap, PeerOp, TunnelControl};
use super::run;

/// Drives WireGuard devices through `wg(8)`.
#[derive(Clone, Debug)]
pub struct WgCli {
    program: String,
}

impl Default for WgCli {
    fn default() -> Self {
        Self {
            program: WG_BIN.to_string(),
        }
    }
}

impl TunnelControl for WgCli {
    async fn configure(
        &self,
        device: &str,
        private_key: &PeerKey,
        listen_port: u16,
    ) -> Result<(), TunnelError> {
        let port = listen_port.to_string();
        let key = format!("{private_key}\n");
        run(
            &self.program,
            &[
                "set",
                device,
                "listen-port",
                &port,
                "private-key",
                "/dev/stdin",
            ],
            Some(key.as_bytes()),
        )
        .await?;
        Ok(())
    }

    async fn peers(&self, device: &str) -> Result<PeerMap, TunnelError> {
        let output = run(&self.program, &["show", device, "allowed-ips"], None).await?;
        parse_allowed_ips(&output)
    }

    async fn apply(&self, device: &str, ops: &[PeerOp]) -> Result<(), TunnelError> {
        let args = set_peer_args(device, ops);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run(&self.program, &args, None).await?;
        Ok(())
    }
}

/// Arguments of the single `wg set` call that applies `ops`.
pub fn set_peer_args(device: &str, ops: &[PeerOp]) -> Vec<String> {
    let mut args = vec!["set".to_string(), device.to_string()];
    for op in ops {
        match op {
            PeerOp::Remove(key) => {
                args.extend(["peer".to_string(), key.to_string(), "remove".to_string()]);
            }
            PeerOp::Set(key, ip) => {
                args.extend([
                    "peer".to_string(),
                    key.to_string(),
                    "allowed-ips".to_string(),
                    format!("{ip}/32"),
                ]);
            }
        }
    }
    args
}

/// Parses `wg show <dev> allowed-ips`: one peer per line, key then a
/// tab, then space-separated CIDRs or `(none)`. Only the first address counts.
pub fn parse_allowed_ips(output: &str) -> Result<PeerMap, TunnelError> {
    let mut peers = PeerMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(key) = fields.next() else {
            continue;
        };
        let key: PeerKey = key.parse()?;
        let ip = match fields.next() {
            Some("(none)") | None => String::new(),
            Some(cidr) => cidr.split('/').next().unwrap_or(cidr).to_string(),
        };
        peers.insert(key, ip);
    }
    Ok(peers)
}
