//! Interface enumeration and hostname resolution inside the target netns.

use std::net::IpAddr;

use serde::Deserialize;

use faultbox_engine::sidecar::{SidecarExecutor, SidecarSpec};
use faultbox_engine::TargetConfig;
use faultbox_error::{FaultError, Result};

/// A link as reported by `ip -json link show`.
#[derive(Debug, Clone, Deserialize)]
pub struct Interface {
    /// Interface index.
    #[serde(rename = "ifindex")]
    pub index: u32,
    /// Interface name.
    #[serde(rename = "ifname")]
    pub name: String,
    /// Link type.
    #[serde(rename = "link_type", default)]
    pub link_type: String,
    /// Link flags.
    #[serde(default)]
    pub flags: Vec<String>,
}

impl Interface {
    /// True when the link carries the given flag.
    #[must_use]
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// True for links an attack should touch by default: up and not
    /// loopback.
    #[must_use]
    pub fn is_attackable(&self) -> bool {
        self.has_flag("UP") && !self.has_flag("LOOPBACK")
    }
}

/// Lists the attackable interfaces inside the target's netns.
pub async fn list_interfaces(
    executor: &SidecarExecutor,
    target: &TargetConfig,
) -> Result<Vec<Interface>> {
    let output = executor
        .run(
            target,
            SidecarSpec::netns(
                "ip-link-show",
                vec![
                    "ip".to_string(),
                    "-json".to_string(),
                    "link".to_string(),
                    "show".to_string(),
                ],
            ),
        )
        .await?;

    let interfaces: Vec<Interface> = serde_json::from_slice(&output.stdout)
        .map_err(|e| FaultError::internal(format!("could not parse interface listing: {e}")))?;
    let attackable: Vec<Interface> = interfaces
        .into_iter()
        .filter(Interface::is_attackable)
        .collect();
    tracing::trace!(count = attackable.len(), "listed network interfaces");
    Ok(attackable)
}

/// Resolves hostnames with the target's own resolver.
///
/// The sidecar joins the network *and* mount namespaces so `dig` sees the
/// target's `/etc/resolv.conf` and uses its DNS path. Hostnames that do not
/// resolve contribute no addresses; that is deliberate and only logged.
pub async fn resolve_hostnames(
    executor: &SidecarExecutor,
    target: &TargetConfig,
    hostnames: &[String],
) -> Result<Vec<IpAddr>> {
    if hostnames.is_empty() {
        return Ok(Vec::new());
    }

    let mut args = vec!["dig".to_string(), "+short".to_string(), "+timeout=2".to_string()];
    for name in hostnames {
        args.push(name.clone());
        args.push("A".to_string());
        args.push(name.clone());
        args.push("AAAA".to_string());
    }

    let output = executor
        .run(
            target,
            SidecarSpec::netns("dns-resolve", args).join_mountns(),
        )
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let addrs: Vec<IpAddr> = stdout
        .lines()
        .filter_map(|line| line.trim().parse::<IpAddr>().ok())
        .collect();

    if addrs.is_empty() {
        tracing::warn!(
            hostnames = ?hostnames,
            "no hostname resolved to an address; the effect will not apply to them"
        );
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_show_json_parses() {
        let json = br#"[
            {"ifindex": 1, "ifname": "lo", "link_type": "loopback",
             "flags": ["LOOPBACK", "UP", "LOWER_UP"]},
            {"ifindex": 2, "ifname": "eth0", "link_type": "ether",
             "flags": ["BROADCAST", "MULTICAST", "UP", "LOWER_UP"]},
            {"ifindex": 3, "ifname": "eth1", "link_type": "ether",
             "flags": ["BROADCAST"]}
        ]"#;
        let interfaces: Vec<Interface> = serde_json::from_slice(json).unwrap();
        let attackable: Vec<&Interface> =
            interfaces.iter().filter(|i| i.is_attackable()).collect();
        assert_eq!(attackable.len(), 1);
        assert_eq!(attackable[0].name, "eth0");
    }

    #[test]
    fn loopback_is_never_attackable() {
        let lo = Interface {
            index: 1,
            name: "lo".to_string(),
            link_type: "loopback".to_string(),
            flags: vec!["LOOPBACK".to_string(), "UP".to_string()],
        };
        assert!(!lo.is_attackable());
    }
}
