//! The filter compiler: from a normalized filter to a shaping plan.
//!
//! Pure by construction. Everything environmental (resolved hostnames,
//! interface enumeration, class allocation) is an input; two calls with
//! equal inputs produce byte-equal batch renderings.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::filter::{CidrWithPorts, NetworkFilter, PortRange};
use crate::plan::{
    FirewallPlan, FirewallRule, InterfacePlan, QdiscEffect, ShapingPlan, TcFilterRule, TcProtocol,
};

/// Class allocation for one interface, decided before compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAssignment {
    /// Interface name.
    pub interface: String,
    /// Class id allocated to the action on this interface.
    pub class: u32,
    /// True when no other faultbox root exists on the interface yet.
    pub install_root: bool,
}

/// Firewall-level effect of an attack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallEffect {
    /// Drop matching egress entirely.
    Blackhole,
    /// Drop DNS egress on the given port.
    DnsBlock {
        /// DNS port, usually 53.
        port: u16,
    },
}

/// Everything the compiler needs.
#[derive(Debug)]
pub struct CompileInput<'a> {
    /// Tag identifying the action instance.
    pub action_tag: &'a str,
    /// Qdisc effect for delay/loss/corrupt/bandwidth attacks.
    pub qdisc: Option<QdiscEffect>,
    /// Firewall effect for blackhole/DNS-block attacks.
    pub firewall: Option<FirewallEffect>,
    /// The normalized traffic filter.
    pub filter: &'a NetworkFilter,
    /// Interfaces with their class allocations.
    pub interfaces: &'a [InterfaceAssignment],
}

/// Compiles a shaping plan.
#[must_use]
pub fn compile(input: &CompileInput<'_>) -> ShapingPlan {
    let interfaces = input.qdisc.as_ref().map_or_else(Vec::new, |effect| {
        input
            .interfaces
            .iter()
            .map(|assignment| InterfacePlan {
                interface: assignment.interface.clone(),
                class: assignment.class,
                install_root: assignment.install_root,
                effect: effect.clone(),
                filters: classifier_rules(input.filter, assignment.class),
            })
            .collect()
    });

    let firewall = match &input.firewall {
        Some(FirewallEffect::Blackhole) => blackhole_rules(input.filter, input.action_tag),
        Some(FirewallEffect::DnsBlock { port }) => {
            dns_block_rules(input.filter, *port, input.action_tag)
        }
        None => FirewallPlan::default(),
    };

    ShapingPlan {
        action_tag: input.action_tag.to_string(),
        interfaces,
        firewall,
    }
}

/// Decomposes an inclusive port range into `(value, mask)` pairs for u32
/// matching.
#[must_use]
pub fn port_mask_pairs(range: PortRange) -> Vec<(u16, u16)> {
    let mut pairs = Vec::new();
    let mut a = u32::from(range.from);
    let b = u32::from(range.to);
    while a <= b {
        let mut size = 1u32;
        while a % (size * 2) == 0 && a + size * 2 - 1 <= b && size * 2 <= 0x10000 {
            size *= 2;
        }
        #[allow(clippy::cast_possible_truncation)]
        pairs.push((a as u16, (!(size - 1) & 0xffff) as u16));
        a += size;
    }
    pairs
}

fn classifier_rules(filter: &NetworkFilter, class: u32) -> Vec<TcFilterRule> {
    // Priorities are derived from the class so two actions sharing a root
    // never collide; excludes carry lower numbers and match first.
    let base = class * 100;
    let mut rules = Vec::new();

    if filter.has_v4() {
        for tuple in &filter.exclude_v4 {
            rules.extend(tuple_rules(tuple, TcProtocol::Ip, base, false));
        }
    }
    if filter.has_v6() {
        for tuple in &filter.exclude_v6 {
            rules.extend(tuple_rules(tuple, TcProtocol::Ipv6, base + 1, false));
        }
    }

    if filter.include_all {
        if filter.has_v4() {
            rules.push(TcFilterRule {
                protocol: TcProtocol::Ip,
                prio: base + 2,
                matches: vec!["u32 0 0".to_string()],
                affected: true,
            });
        }
        if filter.has_v6() {
            rules.push(TcFilterRule {
                protocol: TcProtocol::Ipv6,
                prio: base + 3,
                matches: vec!["u32 0 0".to_string()],
                affected: true,
            });
        }
    } else {
        for tuple in &filter.include_v4 {
            rules.extend(tuple_rules(tuple, TcProtocol::Ip, base + 2, true));
        }
        for tuple in &filter.include_v6 {
            rules.extend(tuple_rules(tuple, TcProtocol::Ipv6, base + 3, true));
        }
    }

    rules
}

fn tuple_rules(
    tuple: &CidrWithPorts,
    protocol: TcProtocol,
    prio: u32,
    affected: bool,
) -> Vec<TcFilterRule> {
    let key = match protocol {
        TcProtocol::Ip => "ip",
        TcProtocol::Ipv6 => "ip6",
    };
    let dst = format!("{key} dst {}", tuple.cidr);

    if tuple.ports.is_all() {
        return vec![TcFilterRule {
            protocol,
            prio,
            matches: vec![dst],
            affected,
        }];
    }

    port_mask_pairs(tuple.ports)
        .into_iter()
        .map(|(value, mask)| TcFilterRule {
            protocol,
            prio,
            matches: vec![dst.clone(), format!("{key} dport {value} 0x{mask:04x}")],
            affected,
        })
        .collect()
}

fn blackhole_rules(filter: &NetworkFilter, tag: &str) -> FirewallPlan {
    FirewallPlan {
        v4: family_drop_rules(
            filter.has_v4(),
            &filter.exclude_v4,
            filter.include_all,
            &filter.include_v4,
            tag,
        ),
        v6: family_drop_rules(
            filter.has_v6(),
            &filter.exclude_v6,
            filter.include_all,
            &filter.include_v6,
            tag,
        ),
    }
}

fn family_drop_rules(
    active: bool,
    excludes: &[CidrWithPorts],
    include_all: bool,
    includes: &[CidrWithPorts],
    tag: &str,
) -> Vec<FirewallRule> {
    if !active {
        return Vec::new();
    }
    let mut rules = Vec::new();
    for tuple in excludes {
        rules.extend(tuple_fw_rules(Some(tuple), "ACCEPT", tag));
    }
    if include_all {
        rules.extend(tuple_fw_rules(None, "DROP", tag));
    } else {
        for tuple in includes {
            rules.extend(tuple_fw_rules(Some(tuple), "DROP", tag));
        }
    }
    rules
}

fn dns_block_rules(filter: &NetworkFilter, port: u16, tag: &str) -> FirewallPlan {
    let dns = CidrWithPorts {
        cidr: "0.0.0.0/0".parse::<IpNetwork>().expect("static cidr"),
        ports: PortRange::single(port),
    };
    let dns6 = CidrWithPorts {
        cidr: "::/0".parse::<IpNetwork>().expect("static cidr"),
        ports: PortRange::single(port),
    };

    let mut v4 = Vec::new();
    for tuple in &filter.exclude_v4 {
        v4.extend(tuple_fw_rules(Some(tuple), "ACCEPT", tag));
    }
    v4.extend(tuple_fw_rules(Some(&dns), "DROP", tag));

    let mut v6 = Vec::new();
    for tuple in &filter.exclude_v6 {
        v6.extend(tuple_fw_rules(Some(tuple), "ACCEPT", tag));
    }
    v6.extend(tuple_fw_rules(Some(&dns6), "DROP", tag));

    FirewallPlan { v4, v6 }
}

fn tuple_fw_rules(tuple: Option<&CidrWithPorts>, verb: &str, tag: &str) -> Vec<FirewallRule> {
    let tail = |args: &mut Vec<String>| {
        args.push("-j".to_string());
        args.push(verb.to_string());
        args.push("-m".to_string());
        args.push("comment".to_string());
        args.push("--comment".to_string());
        args.push(tag.to_string());
    };

    let Some(tuple) = tuple else {
        // Match-all rule.
        let mut args = Vec::new();
        tail(&mut args);
        return vec![FirewallRule {
            chain: "OUTPUT".to_string(),
            args,
        }];
    };

    let dst = |args: &mut Vec<String>| {
        args.push("-d".to_string());
        args.push(tuple.cidr.to_string());
    };

    if tuple.ports.is_all() {
        let mut args = Vec::new();
        dst(&mut args);
        tail(&mut args);
        return vec![FirewallRule {
            chain: "OUTPUT".to_string(),
            args,
        }];
    }

    // Port-qualified rules need a protocol; cover tcp and udp.
    let ports = if tuple.ports.from == tuple.ports.to {
        tuple.ports.from.to_string()
    } else {
        format!("{}:{}", tuple.ports.from, tuple.ports.to)
    };
    ["tcp", "udp"]
        .iter()
        .map(|proto| {
            let mut args = Vec::new();
            dst(&mut args);
            args.push("-p".to_string());
            args.push((*proto).to_string());
            args.push("--dport".to_string());
            args.push(ports.clone());
            tail(&mut args);
            FirewallRule {
                chain: "OUTPUT".to_string(),
                args,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RestrictedEndpoint;

    fn tuple(cidr: &str, ports: PortRange) -> CidrWithPorts {
        CidrWithPorts {
            cidr: cidr.parse().unwrap(),
            ports,
        }
    }

    fn eth0() -> Vec<InterfaceAssignment> {
        vec![InterfaceAssignment {
            interface: "eth0".to_string(),
            class: 4,
            install_root: true,
        }]
    }

    fn restricted() -> Vec<RestrictedEndpoint> {
        vec![RestrictedEndpoint {
            cidr: "10.40.0.3/32".parse().unwrap(),
            port_min: 8080,
            port_max: 8080,
        }]
    }

    #[test]
    fn equal_inputs_render_byte_equal_plans() {
        let filter = NetworkFilter::normalize(
            vec![tuple("10.0.0.0/8", PortRange::single(5001))],
            vec![],
            &restricted(),
        );
        let interfaces = eth0();
        let input = || CompileInput {
            action_tag: "fb-1",
            qdisc: Some(QdiscEffect::Loss { percent: 10.0 }),
            firewall: None,
            filter: &filter,
            interfaces: &interfaces,
        };
        let a = compile(&input());
        let b = compile(&input());
        assert_eq!(a, b);
        assert_eq!(a.render_tc_apply(), b.render_tc_apply());
        assert_eq!(a.render_tc_revert(), b.render_tc_revert());
    }

    #[test]
    fn empty_include_matches_all_minus_excludes() {
        let filter = NetworkFilter::normalize(vec![], vec![], &restricted());
        let interfaces = eth0();
        let plan = compile(&CompileInput {
            action_tag: "fb-1",
            qdisc: Some(QdiscEffect::Delay {
                delay_ms: 200,
                jitter_ms: None,
            }),
            firewall: None,
            filter: &filter,
            interfaces: &interfaces,
        });

        let batch = plan.render_tc_apply();
        // The restricted endpoint is steered to the unaffected class first.
        assert!(batch.contains("match ip dst 10.40.0.3/32"));
        assert!(batch.contains("flowid 7e1:1"));
        // Everything else lands in the affected class.
        assert!(batch.contains("match u32 0 0"));
        assert!(batch.contains("flowid 7e1:4"));
    }

    #[test]
    fn non_empty_include_produces_no_match_all() {
        let filter = NetworkFilter::normalize(
            vec![tuple("192.168.7.0/24", PortRange::ALL)],
            vec![],
            &[],
        );
        let interfaces = eth0();
        let plan = compile(&CompileInput {
            action_tag: "fb-1",
            qdisc: Some(QdiscEffect::Loss { percent: 10.0 }),
            firewall: None,
            filter: &filter,
            interfaces: &interfaces,
        });
        let batch = plan.render_tc_apply();
        assert!(batch.contains("match ip dst 192.168.7.0/24"));
        assert!(!batch.contains("u32 0 0"));
    }

    #[test]
    fn family_without_includes_emits_no_rules() {
        let filter = NetworkFilter::normalize(
            vec![tuple("2001:db8::/64", PortRange::ALL)],
            vec![tuple("10.0.0.1/32", PortRange::ALL)],
            &[],
        );
        let interfaces = eth0();
        let plan = compile(&CompileInput {
            action_tag: "fb-1",
            qdisc: Some(QdiscEffect::Loss { percent: 5.0 }),
            firewall: Some(FirewallEffect::Blackhole),
            filter: &filter,
            interfaces: &interfaces,
        });

        // No IPv4 includes: no IPv4 tc rules and no IPv4 firewall rules,
        // not even for the IPv4 exclude.
        let batch = plan.render_tc_apply();
        assert!(!batch.contains("protocol ip prio"));
        assert!(batch.contains("protocol ipv6"));
        assert!(plan.render_fw_apply_v4().is_none());
        assert!(plan.render_fw_apply_v6().is_some());
    }

    #[test]
    fn single_port_uses_exact_mask() {
        let pairs = port_mask_pairs(PortRange::single(5001));
        assert_eq!(pairs, vec![(5001, 0xffff)]);
    }

    #[test]
    fn all_ports_is_a_single_zero_mask() {
        assert_eq!(port_mask_pairs(PortRange::ALL), vec![(0, 0)]);
    }

    #[test]
    fn port_range_decomposition_covers_exactly_the_range() {
        let range = PortRange {
            from: 5000,
            to: 5010,
        };
        let pairs = port_mask_pairs(range);
        let mut covered: Vec<u16> = Vec::new();
        for (value, mask) in &pairs {
            for port in 0..=65535u16 {
                if port & mask == *value {
                    covered.push(port);
                }
            }
        }
        covered.sort_unstable();
        let expected: Vec<u16> = (5000..=5010).collect();
        assert_eq!(covered, expected);
    }

    #[test]
    fn blackhole_tags_every_rule_and_orders_accepts_first() {
        let filter = NetworkFilter::normalize(
            vec![tuple("203.0.113.0/24", PortRange::ALL)],
            vec![],
            &restricted(),
        );
        let plan = compile(&CompileInput {
            action_tag: "fb-9",
            qdisc: None,
            firewall: Some(FirewallEffect::Blackhole),
            filter: &filter,
            interfaces: &[],
        });
        assert!(plan.interfaces.is_empty());
        for rule in &plan.firewall.v4 {
            assert_eq!(rule.args.last().map(String::as_str), Some("fb-9"));
        }
        assert!(plan.firewall.v4[0].args.contains(&"ACCEPT".to_string()));
        let last = plan.firewall.v4.last().unwrap();
        assert!(last.args.contains(&"DROP".to_string()));
        assert!(last.args.contains(&"203.0.113.0/24".to_string()));
    }

    #[test]
    fn dns_block_drops_udp_and_tcp_to_the_port_only() {
        let filter = NetworkFilter::normalize(vec![], vec![], &restricted());
        let plan = compile(&CompileInput {
            action_tag: "fb-5",
            qdisc: None,
            firewall: Some(FirewallEffect::DnsBlock { port: 53 }),
            filter: &filter,
            interfaces: &[],
        });

        let drops: Vec<&FirewallRule> = plan
            .firewall
            .v4
            .iter()
            .filter(|r| r.args.contains(&"DROP".to_string()))
            .collect();
        assert_eq!(drops.len(), 2);
        for drop in drops {
            assert!(drop.args.contains(&"--dport".to_string()));
            assert!(drop.args.contains(&"53".to_string()));
        }
        // The agent's restricted endpoint stays reachable.
        assert!(plan.firewall.v4[0].args.contains(&"ACCEPT".to_string()));
        // IPv6 DNS is covered as well.
        assert!(!plan.firewall.v6.is_empty());
    }

    #[test]
    fn compile_decode_encode_round_trip_is_stable() {
        let filter = NetworkFilter::normalize(
            vec![tuple("10.0.0.0/8", PortRange { from: 80, to: 90 })],
            vec![tuple("10.1.0.0/16", PortRange::ALL)],
            &restricted(),
        );
        let encoded = serde_json::to_string(&filter).unwrap();
        let decoded: NetworkFilter = serde_json::from_str(&encoded).unwrap();
        let interfaces = eth0();

        let direct = compile(&CompileInput {
            action_tag: "fb-7",
            qdisc: Some(QdiscEffect::Corrupt { percent: 2.0 }),
            firewall: None,
            filter: &filter,
            interfaces: &interfaces,
        });
        let via_codec = compile(&CompileInput {
            action_tag: "fb-7",
            qdisc: Some(QdiscEffect::Corrupt { percent: 2.0 }),
            firewall: None,
            filter: &decoded,
            interfaces: &interfaces,
        });
        assert_eq!(direct, via_codec);
    }
}
