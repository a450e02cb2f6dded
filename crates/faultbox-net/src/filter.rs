//! Traffic filter normalization.
//!
//! A filter is the `{include, exclude}` description of which egress flows
//! an effect applies to. Normalization splits it by address family, merges
//! the agent's restricted endpoints into the exclude side, and sorts and
//! deduplicates every rule list so downstream compilation is deterministic.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use faultbox_error::{FaultError, Result};

/// An inclusive port range. `0..=65535` means "all ports".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRange {
    /// First port of the range.
    pub from: u16,
    /// Last port of the range, inclusive.
    pub to: u16,
}

impl PortRange {
    /// The full port space.
    pub const ALL: Self = Self { from: 0, to: 65535 };

    /// A single port.
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self {
            from: port,
            to: port,
        }
    }

    /// True when the range spans every port.
    #[must_use]
    pub const fn is_all(self) -> bool {
        self.from == 0 && self.to == 65535
    }

    /// True when two ranges share at least one port.
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.from <= other.to && other.from <= self.to
    }

    /// Parses `"80"`, `"80-90"`, or `"80:90"`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let parts: Vec<&str> = if s.contains('-') {
            s.splitn(2, '-').collect()
        } else if s.contains(':') {
            s.splitn(2, ':').collect()
        } else {
            vec![s]
        };
        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| FaultError::invalid_config(format!("invalid port '{p}'")))
        };
        match parts.as_slice() {
            [single] => Ok(Self::single(parse_port(single)?)),
            [from, to] => {
                let (from, to) = (parse_port(from)?, parse_port(to)?);
                if from > to {
                    return Err(FaultError::invalid_config(format!(
                        "port range '{s}' is inverted"
                    )));
                }
                Ok(Self { from, to })
            }
            _ => Err(FaultError::invalid_config(format!("invalid port range '{s}'"))),
        }
    }
}

/// One filter tuple: a CIDR plus the ports the rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidrWithPorts {
    /// Destination network.
    pub cidr: IpNetwork,
    /// Destination ports.
    pub ports: PortRange,
}

impl CidrWithPorts {
    /// A tuple covering one address on all ports.
    #[must_use]
    pub fn host(addr: IpAddr) -> Self {
        Self {
            cidr: IpNetwork::from(addr),
            ports: PortRange::ALL,
        }
    }

    /// True for IPv4 tuples.
    #[must_use]
    pub const fn is_ipv4(&self) -> bool {
        matches!(self.cidr, IpNetwork::V4(_))
    }

    /// True when two tuples can match the same flow.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if !self.ports.overlaps(other.ports) {
            return false;
        }
        match (self.cidr, other.cidr) {
            (IpNetwork::V4(a), IpNetwork::V4(b)) => a.overlaps(b),
            (IpNetwork::V6(a), IpNetwork::V6(b)) => a.overlaps(b),
            _ => false,
        }
    }
}

/// A CIDR + port window the orchestrator requires to stay reachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictedEndpoint {
    /// Network that must remain reachable.
    pub cidr: IpNetwork,
    /// First protected port.
    #[serde(default)]
    pub port_min: u16,
    /// Last protected port; 0 is treated as 65535.
    #[serde(default)]
    pub port_max: u16,
}

impl RestrictedEndpoint {
    fn to_tuple(&self) -> CidrWithPorts {
        let to = if self.port_max == 0 {
            65535
        } else {
            self.port_max
        };
        CidrWithPorts {
            cidr: self.cidr,
            ports: PortRange {
                from: self.port_min,
                to,
            },
        }
    }
}

/// A normalized traffic filter, split by address family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFilter {
    /// True when the user supplied no include tuples at all: the effect
    /// applies to all egress of both families (minus excludes).
    pub include_all: bool,
    /// IPv4 include tuples, sorted and deduplicated.
    pub include_v4: Vec<CidrWithPorts>,
    /// IPv6 include tuples.
    pub include_v6: Vec<CidrWithPorts>,
    /// IPv4 exclude tuples (always contains the restricted endpoints).
    pub exclude_v4: Vec<CidrWithPorts>,
    /// IPv6 exclude tuples.
    pub exclude_v6: Vec<CidrWithPorts>,
}

impl NetworkFilter {
    /// Normalizes raw include/exclude tuples, merging the restricted
    /// endpoints into the exclude side unconditionally.
    #[must_use]
    pub fn normalize(
        include: Vec<CidrWithPorts>,
        exclude: Vec<CidrWithPorts>,
        restricted: &[RestrictedEndpoint],
    ) -> Self {
        let include_all = include.is_empty();

        let (include_v4, include_v6) = split_by_family(include);

        let mut exclude = exclude;
        exclude.extend(restricted.iter().map(RestrictedEndpoint::to_tuple));
        let (exclude_v4, exclude_v6) = split_by_family(exclude);

        Self {
            include_all,
            include_v4,
            include_v6,
            exclude_v4,
            exclude_v6,
        }
    }

    /// True when the filter produces IPv4 state.
    #[must_use]
    pub fn has_v4(&self) -> bool {
        self.include_all || !self.include_v4.is_empty()
    }

    /// True when the filter produces IPv6 state.
    #[must_use]
    pub fn has_v6(&self) -> bool {
        self.include_all || !self.include_v6.is_empty()
    }

    /// True when two filters can match the same flow (used for conflict
    /// detection between attacks).
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.include_all || other.include_all {
            return true;
        }
        let v4 = self
            .include_v4
            .iter()
            .any(|a| other.include_v4.iter().any(|b| a.overlaps(b)));
        let v6 = self
            .include_v6
            .iter()
            .any(|a| other.include_v6.iter().any(|b| a.overlaps(b)));
        v4 || v6
    }
}

fn split_by_family(tuples: Vec<CidrWithPorts>) -> (Vec<CidrWithPorts>, Vec<CidrWithPorts>) {
    let (mut v4, mut v6): (Vec<_>, Vec<_>) = tuples.into_iter().partition(CidrWithPorts::is_ipv4);
    sort_dedup(&mut v4);
    sort_dedup(&mut v6);
    (v4, v6)
}

fn sort_dedup(tuples: &mut Vec<CidrWithPorts>) {
    tuples.sort_by(|a, b| {
        a.cidr
            .network()
            .cmp(&b.cidr.network())
            .then(a.cidr.prefix().cmp(&b.cidr.prefix()))
            .then(a.ports.cmp(&b.ports))
    });
    tuples.dedup();
}

/// Parses an `ip` / `CIDR` config string into a network.
pub fn parse_cidr(s: &str) -> Result<IpNetwork> {
    let s = s.trim();
    if let Ok(network) = s.parse::<IpNetwork>() {
        return Ok(network);
    }
    s.parse::<IpAddr>()
        .map(IpNetwork::from)
        .map_err(|_| FaultError::invalid_config(format!("invalid ip or CIDR '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(cidr: &str, ports: PortRange) -> CidrWithPorts {
        CidrWithPorts {
            cidr: cidr.parse().unwrap(),
            ports,
        }
    }

    #[test]
    fn port_range_parsing() {
        assert_eq!(PortRange::parse("80").unwrap(), PortRange::single(80));
        assert_eq!(
            PortRange::parse("80-90").unwrap(),
            PortRange { from: 80, to: 90 }
        );
        assert_eq!(
            PortRange::parse("5000:5010").unwrap(),
            PortRange {
                from: 5000,
                to: 5010
            }
        );
        assert!(PortRange::parse("90-80").is_err());
        assert!(PortRange::parse("http").is_err());
    }

    #[test]
    fn families_are_split_and_sorted() {
        let filter = NetworkFilter::normalize(
            vec![
                tuple("2001:db8::/64", PortRange::ALL),
                tuple("192.168.1.0/24", PortRange::ALL),
                tuple("10.0.0.0/8", PortRange::single(80)),
                tuple("10.0.0.0/8", PortRange::single(80)),
            ],
            vec![],
            &[],
        );
        assert!(!filter.include_all);
        assert_eq!(filter.include_v4.len(), 2);
        assert_eq!(filter.include_v4[0].cidr.to_string(), "10.0.0.0/8");
        assert_eq!(filter.include_v6.len(), 1);
    }

    #[test]
    fn restricted_endpoints_always_land_in_exclude() {
        let filter = NetworkFilter::normalize(
            vec![],
            vec![],
            &[RestrictedEndpoint {
                cidr: "10.40.0.3/32".parse().unwrap(),
                port_min: 8080,
                port_max: 8088,
            }],
        );
        assert!(filter.include_all);
        assert_eq!(filter.exclude_v4.len(), 1);
        assert_eq!(
            filter.exclude_v4[0].ports,
            PortRange {
                from: 8080,
                to: 8088
            }
        );
    }

    #[test]
    fn restricted_port_max_zero_means_all_remaining() {
        let filter = NetworkFilter::normalize(
            vec![],
            vec![],
            &[RestrictedEndpoint {
                cidr: "10.40.0.3/32".parse().unwrap(),
                port_min: 0,
                port_max: 0,
            }],
        );
        assert!(filter.exclude_v4[0].ports.is_all());
    }

    #[test]
    fn family_without_includes_produces_no_state() {
        let filter = NetworkFilter::normalize(
            vec![tuple("2001:db8::/64", PortRange::ALL)],
            vec![],
            &[],
        );
        assert!(!filter.has_v4());
        assert!(filter.has_v6());
    }

    #[test]
    fn include_all_covers_both_families() {
        let filter = NetworkFilter::normalize(vec![], vec![], &[]);
        assert!(filter.has_v4());
        assert!(filter.has_v6());
    }

    #[test]
    fn overlap_requires_shared_cidr_and_ports() {
        let a = NetworkFilter::normalize(
            vec![tuple("10.0.0.0/24", PortRange::single(80))],
            vec![],
            &[],
        );
        let b = NetworkFilter::normalize(
            vec![tuple("10.0.0.0/16", PortRange::single(80))],
            vec![],
            &[],
        );
        let c = NetworkFilter::normalize(
            vec![tuple("10.0.0.0/16", PortRange::single(443))],
            vec![],
            &[],
        );
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));

        let all = NetworkFilter::normalize(vec![], vec![], &[]);
        assert!(all.overlaps(&c));
    }

    #[test]
    fn bare_ip_parses_as_host_network() {
        assert_eq!(parse_cidr("10.1.2.3").unwrap().to_string(), "10.1.2.3/32");
        assert_eq!(
            parse_cidr("2001:db8::1").unwrap().prefix(),
            128
        );
        assert!(parse_cidr("example.com").is_err());
    }
}
