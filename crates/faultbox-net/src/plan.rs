//! The shaping plan: a deterministic description of the `tc` and firewall
//! state one action installs, and how to take it back out.
//!
//! Handles and class ids come from a reserved range so faultbox state is
//! recognizable on the wire; every firewall rule carries the action tag as
//! a comment match. Rendering is plain string assembly over sorted inputs,
//! so equal plans render byte-equal batches.

use serde::{Deserialize, Serialize};

/// Major handle of the prio root qdisc faultbox installs (hex on the wire).
pub const ROOT_HANDLE: u32 = 0x7e1;

/// Base for per-class child qdisc handles.
pub const CHILD_HANDLE_BASE: u32 = 0x7a0;

/// Class receiving traffic that must stay unaffected.
pub const UNAFFECTED_CLASS: u32 = 1;

/// First class available to an action's affected band.
pub const FIRST_ACTION_CLASS: u32 = 4;

/// Last class available to an action's affected band.
pub const LAST_ACTION_CLASS: u32 = 7;

/// The qdisc-level effect attached to the affected band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QdiscEffect {
    /// netem delay with optional jitter.
    Delay {
        /// Delay in milliseconds.
        delay_ms: u64,
        /// Jitter in milliseconds, when enabled.
        jitter_ms: Option<u64>,
    },
    /// netem packet loss.
    Loss {
        /// Loss percentage.
        percent: f64,
    },
    /// netem packet corruption.
    Corrupt {
        /// Corruption percentage.
        percent: f64,
    },
    /// tbf bandwidth limit.
    Bandwidth {
        /// Rate in tc notation, e.g. `5mbit`.
        rate: String,
    },
}

impl QdiscEffect {
    fn qdisc_args(&self) -> String {
        match self {
            Self::Delay {
                delay_ms,
                jitter_ms: Some(jitter),
            } => format!("netem delay {delay_ms}ms {jitter}ms"),
            Self::Delay {
                delay_ms,
                jitter_ms: None,
            } => format!("netem delay {delay_ms}ms"),
            Self::Loss { percent } => format!("netem loss {}%", format_percent(*percent)),
            Self::Corrupt { percent } => {
                format!("netem corrupt {}%", format_percent(*percent))
            }
            Self::Bandwidth { rate } => {
                format!("tbf rate {rate} burst 32kbit latency 400ms")
            }
        }
    }
}

/// The protocol a tc filter matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcProtocol {
    /// IPv4.
    Ip,
    /// IPv6.
    Ipv6,
}

impl TcProtocol {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Ipv6 => "ipv6",
        }
    }
}

/// One u32 classifier rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcFilterRule {
    /// Match protocol.
    pub protocol: TcProtocol,
    /// Filter priority; unique per action and rule group.
    pub prio: u32,
    /// u32 selector fragments, each rendered as `match <fragment>`.
    pub matches: Vec<String>,
    /// Destination class: the action's affected band or the unaffected one.
    pub affected: bool,
}

/// Per-interface part of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfacePlan {
    /// Interface name.
    pub interface: String,
    /// Class id (1-based prio band) allocated to this action.
    pub class: u32,
    /// True when this action installs the prio root; false when it joins a
    /// root installed by a concurrent action.
    pub install_root: bool,
    /// Effect attached under the affected class.
    pub effect: QdiscEffect,
    /// Classifier rules, excludes before includes.
    pub filters: Vec<TcFilterRule>,
}

impl InterfacePlan {
    fn child_handle(&self) -> u32 {
        CHILD_HANDLE_BASE + self.class
    }

    fn render_apply(&self, out: &mut String) {
        let ifc = &self.interface;
        if self.install_root {
            out.push_str(&format!(
                "qdisc add dev {ifc} root handle {ROOT_HANDLE:x}: prio bands 8 priomap 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0\n"
            ));
        }
        out.push_str(&format!(
            "qdisc add dev {ifc} parent {ROOT_HANDLE:x}:{} handle {:x}: {}\n",
            self.class,
            self.child_handle(),
            self.effect.qdisc_args()
        ));
        for rule in &self.filters {
            let flowid = if rule.affected {
                self.class
            } else {
                UNAFFECTED_CLASS
            };
            let matches: Vec<String> =
                rule.matches.iter().map(|m| format!("match {m}")).collect();
            out.push_str(&format!(
                "filter add dev {ifc} parent {ROOT_HANDLE:x}: protocol {} prio {} u32 {} flowid {ROOT_HANDLE:x}:{flowid}\n",
                rule.protocol.as_str(),
                rule.prio,
                matches.join(" ")
            ));
        }
    }

    fn render_revert(&self, out: &mut String) {
        let ifc = &self.interface;
        let mut prios: Vec<(u32, TcProtocol)> = self
            .filters
            .iter()
            .map(|r| (r.prio, r.protocol))
            .collect();
        prios.sort_unstable_by_key(|(prio, _)| *prio);
        prios.dedup();
        for (prio, protocol) in prios.into_iter().rev() {
            out.push_str(&format!(
                "filter del dev {ifc} parent {ROOT_HANDLE:x}: protocol {} prio {prio} u32\n",
                protocol.as_str()
            ));
        }
        out.push_str(&format!(
            "qdisc del dev {ifc} parent {ROOT_HANDLE:x}:{} handle {:x}:\n",
            self.class,
            self.child_handle()
        ));
        if self.install_root {
            out.push_str(&format!(
                "qdisc del dev {ifc} root handle {ROOT_HANDLE:x}: prio\n"
            ));
        }
    }
}

/// One firewall rule, stored as the argument list after the chain verb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Chain the rule lives in.
    pub chain: String,
    /// Rule specification arguments.
    pub args: Vec<String>,
}

impl FirewallRule {
    fn render(&self, verb: char) -> String {
        format!("-{verb} {} {}", self.chain, self.args.join(" "))
    }
}

/// Firewall side of a plan, per address family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallPlan {
    /// IPv4 rules in apply order (ACCEPT excludes before DROPs).
    pub v4: Vec<FirewallRule>,
    /// IPv6 rules in apply order.
    pub v6: Vec<FirewallRule>,
}

/// The complete, deterministic shaping state of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapingPlan {
    /// Action tag carried by every firewall rule.
    pub action_tag: String,
    /// Per-interface qdisc trees; empty for firewall-only attacks.
    pub interfaces: Vec<InterfacePlan>,
    /// Firewall rules; empty for qdisc-only attacks.
    pub firewall: FirewallPlan,
}

impl ShapingPlan {
    /// True when the plan installs nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty() && self.firewall.v4.is_empty() && self.firewall.v6.is_empty()
    }

    /// `tc -batch` input installing the qdisc state.
    #[must_use]
    pub fn render_tc_apply(&self) -> String {
        let mut out = String::new();
        for plan in &self.interfaces {
            plan.render_apply(&mut out);
        }
        out
    }

    /// `tc -batch` input removing the qdisc state, in reverse order.
    #[must_use]
    pub fn render_tc_revert(&self) -> String {
        let mut out = String::new();
        for plan in self.interfaces.iter().rev() {
            plan.render_revert(&mut out);
        }
        out
    }

    /// `iptables-restore --noflush` input adding the IPv4 rules.
    #[must_use]
    pub fn render_fw_apply_v4(&self) -> Option<String> {
        render_restore(&self.firewall.v4, false)
    }

    /// `ip6tables-restore --noflush` input adding the IPv6 rules.
    #[must_use]
    pub fn render_fw_apply_v6(&self) -> Option<String> {
        render_restore(&self.firewall.v6, false)
    }

    /// `iptables-restore --noflush` input deleting the IPv4 rules.
    #[must_use]
    pub fn render_fw_revert_v4(&self) -> Option<String> {
        render_restore(&self.firewall.v4, true)
    }

    /// `ip6tables-restore --noflush` input deleting the IPv6 rules.
    #[must_use]
    pub fn render_fw_revert_v6(&self) -> Option<String> {
        render_restore(&self.firewall.v6, true)
    }
}

fn render_restore(rules: &[FirewallRule], delete: bool) -> Option<String> {
    if rules.is_empty() {
        return None;
    }
    let mut out = String::from("*filter\n");
    if delete {
        for rule in rules.iter().rev() {
            out.push_str(&rule.render('D'));
            out.push('\n');
        }
    } else {
        for rule in rules {
            out.push_str(&rule.render('A'));
            out.push('\n');
        }
    }
    out.push_str("COMMIT\n");
    Some(out)
}

/// Formats a percentage without a trailing `.0`, matching tc notation.
#[must_use]
pub fn format_percent(percent: f64) -> String {
    if (percent.fract()).abs() < f64::EPSILON {
        format!("{}", percent as i64)
    } else {
        format!("{percent}")
    }
}
