use std::path::Path;

use tracing::{debug, info};

use crate::config::{IPTABLES_BIN, NAT_MARK_BASE};
use crate::error::TunnelError;

use super::run;

/// Chains that may hold rules owned by a tunnel, as (table, chain).
const OWNED_CHAINS: [(&str, &str); 3] = [
    ("filter", "FORWARD"),
    ("nat", "POSTROUTING"),
    ("mangle", "PREROUTING"),
];

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl Rule {
    fn new(table: &'static str, chain: &'static str, spec: &[&str], tag: &str) -> Self {
        let mut spec: Vec<String> = spec.iter().map(|s| s.to_string()).collect();
        spec.extend(["-m", "comment", "--comment", tag].map(String::from));
        Self { table, chain, spec }
    }

    fn args(&self, action: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.to_string(),
            action.to_string(),
            self.chain.to_string(),
        ];
        args.extend(self.spec.iter().cloned());
        args
    }
}

/// Comment carried by every rule owned by the tunnel at `ifindex`.
pub fn owner_tag(ifindex: u32) -> String {
    format!("gatekeeper-{ifindex}")
}

pub fn mark(ifindex: u32) -> String {
    format!("0x{:x}", NAT_MARK_BASE + ifindex)
}

/// Forward both ways, mark tunnel ingress, masquerade marked egress.
pub fn nat_rules(device: &str, ifindex: u32, egress: &str) -> Vec<Rule> {
    let tag = owner_tag(ifindex);
    let mark = mark(ifindex);
    vec![
        Rule::new("filter", "FORWARD", &["-i", device, "-j", "ACCEPT"], &tag),
        Rule::new(
            "filter",
            "FORWARD",
            &["-o", device, "-i", egress, "-j", "ACCEPT"],
            &tag,
        ),
        Rule::new(
            "mangle",
            "PREROUTING",
            &["-i", device, "-j", "MARK", "--set-mark", &mark],
            &tag,
        ),
        Rule::new(
            "nat",
            "POSTROUTING",
            &["-o", egress, "-m", "mark", "--mark", &mark, "-j", "MASQUERADE"],
            &tag,
        ),
    ]
}

/// Picks the rules in an `iptables -S <chain>` listing that carry `tag`,
/// returned as the spec following `-A <chain>`.
pub fn owned_rules(listing: &str, chain: &str, tag: &str) -> Vec<Vec<String>> {
    let prefix = format!("-A {chain} ");
    listing
        .lines()
        .filter_map(|line| line.trim().strip_prefix(&prefix))
        .filter(|rest| rest.split_whitespace().any(|word| word.trim_matches('"') == tag))
        .map(|rest| {
            rest.split_whitespace()
                .map(|word| word.trim_matches('"').to_string())
                .collect()
        })
        .collect()
}

/// Firewall state owned by one tunnel, driven through `iptables(8)`.
#[derive(Clone, Debug)]
pub struct Firewall {
    program: String,
}

impl Default for Firewall {
    fn default() -> Self {
        Self {
            program: IPTABLES_BIN.to_string(),
        }
    }
}

impl Firewall {
    /// Replaces the rules owned by `ifindex`. An empty `egress` only clears.
    pub async fn apply(&self, device: &str, ifindex: u32, egress: &str) -> Result<(), TunnelError> {
        self.clear(ifindex).await?;
        if egress.is_empty() {
            info!(device, "no egress link; NAT disabled");
            return Ok(());
        }

        for rule in nat_rules(device, ifindex, egress) {
            let args = rule.args("-A");
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            run(&self.program, &args, None).await?;
        }
        info!(device, egress, mark = %mark(ifindex), "NAT rules installed");
        Ok(())
    }

    /// Deletes exactly the rules tagged for `ifindex`.
    pub async fn clear(&self, ifindex: u32) -> Result<(), TunnelError> {
        let tag = owner_tag(ifindex);
        for (table, chain) in OWNED_CHAINS {
            let listing = run(&self.program, &["-t", table, "-S", chain], None).await?;
            for spec in owned_rules(&listing, chain, &tag) {
                debug!(table, chain, rule = %spec.join(" "), "deleting owned rule");
                let mut args = vec!["-t", table, "-D", chain];
                args.extend(spec.iter().map(String::as_str));
                run(&self.program, &args, None).await?;
            }
        }
        Ok(())
    }
}

pub async fn ensure_ip_forward(path: &Path) -> Result<(), TunnelError> {
    let current = tokio::fs::read_to_string(path).await?;
    if current.trim() == "1" {
        return Ok(());
    }
    tokio::fs::write(path, "1\n").await?;
    info!("enabled ipv4 forwarding");
    Ok(())
}
