//! Action kinds and their configuration envelopes.
//!
//! The orchestrator sends `{target, config, executionContext}`; this module
//! gives each action kind a typed view of `config` and the shared parts of
//! the envelope. Field names follow the wire protocol (camelCase).

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use faultbox_error::{FaultError, Result};
use faultbox_net::filter::RestrictedEndpoint;

/// Attribute carrying the target container id.
pub const CONTAINER_ID_ATTRIBUTE: &str = "container.id";

/// All action kinds the agent serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Stop the container.
    StopContainer,
    /// Pause and later unpause the container.
    Pause,
    /// CPU stress.
    StressCpu,
    /// Memory stress.
    StressMem,
    /// I/O stress.
    StressIo,
    /// Drop matching egress.
    NetworkBlackhole,
    /// Drop DNS egress.
    NetworkBlockDns,
    /// Delay egress.
    NetworkDelay,
    /// Limit egress bandwidth.
    NetworkBandwidth,
    /// Drop a percentage of egress packets.
    NetworkPackageLoss,
    /// Corrupt a percentage of egress packets.
    NetworkPackageCorruption,
}

impl ActionKind {
    /// All kinds, for the manifest.
    #[must_use]
    pub const fn all() -> [Self; 11] {
        [
            Self::StopContainer,
            Self::Pause,
            Self::StressCpu,
            Self::StressMem,
            Self::StressIo,
            Self::NetworkBlackhole,
            Self::NetworkBlockDns,
            Self::NetworkDelay,
            Self::NetworkBandwidth,
            Self::NetworkPackageLoss,
            Self::NetworkPackageCorruption,
        ]
    }

    /// Wire name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StopContainer => "stop",
            Self::Pause => "pause",
            Self::StressCpu => "stress_cpu",
            Self::StressMem => "stress_mem",
            Self::StressIo => "stress_io",
            Self::NetworkBlackhole => "network_blackhole",
            Self::NetworkBlockDns => "network_block_dns",
            Self::NetworkDelay => "network_delay",
            Self::NetworkBandwidth => "network_bandwidth",
            Self::NetworkPackageLoss => "network_package_loss",
            Self::NetworkPackageCorruption => "network_package_corruption",
        }
    }

    /// Parses the wire name.
    pub fn parse(s: &str) -> Result<Self> {
        Self::all()
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| FaultError::invalid_config(format!("unknown action '{s}'")))
    }

    /// True for attacks that mutate the target's network namespace.
    #[must_use]
    pub const fn is_network(self) -> bool {
        matches!(
            self,
            Self::NetworkBlackhole
                | Self::NetworkBlockDns
                | Self::NetworkDelay
                | Self::NetworkBandwidth
                | Self::NetworkPackageLoss
                | Self::NetworkPackageCorruption
        )
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `target` part of the request envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetRef {
    /// Discovery attributes; values are lists on the wire.
    #[serde(default)]
    pub attributes: HashMap<String, Vec<String>>,
}

impl TargetRef {
    /// The container id attribute.
    pub fn container_id(&self) -> Result<&str> {
        self.attributes
            .get(CONTAINER_ID_ATTRIBUTE)
            .and_then(|values| values.first())
            .map(String::as_str)
            .ok_or_else(|| {
                FaultError::invalid_config(format!(
                    "target attribute '{CONTAINER_ID_ATTRIBUTE}' is missing"
                ))
            })
    }
}

/// The `executionContext` part of the request envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// Endpoints that must stay reachable from the target.
    #[serde(default)]
    pub restricted_endpoints: Vec<RestrictedEndpoint>,
}

/// A full action request envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    /// The attack target.
    #[serde(default)]
    pub target: TargetRef,
    /// Action-kind-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Agent execution context from the orchestrator.
    #[serde(default)]
    pub execution_context: ExecutionContext,
}

impl ActionRequest {
    /// Deserializes `config` into the kind-specific type.
    pub fn config_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.config.clone())
            .map_err(|e| FaultError::invalid_config(format!("bad action config: {e}")))
    }
}

/// A port value on the wire: a number or a `"from-to"` string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// Single numeric port.
    Number(u16),
    /// Port or range in string form.
    Text(String),
}

impl PortSpec {
    /// Converts to a port range.
    pub fn to_range(&self) -> Result<faultbox_net::PortRange> {
        match self {
            Self::Number(port) => Ok(faultbox_net::PortRange::single(*port)),
            Self::Text(text) => faultbox_net::PortRange::parse(text),
        }
    }
}

fn default_true() -> bool {
    true
}

fn duration_from_ms<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

/// `stop` action configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopConfig {
    /// Send the stop signal and wait instead of killing.
    #[serde(default = "default_true")]
    pub graceful: bool,
}

/// `pause` action configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseConfig {
    /// How long the container stays paused.
    #[serde(deserialize_with = "duration_from_ms")]
    pub duration: Duration,
}

/// `stress_cpu` action configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressCpuConfig {
    /// Attack duration.
    #[serde(deserialize_with = "duration_from_ms")]
    pub duration: Duration,
    /// Worker count; 0 uses one per core.
    #[serde(default)]
    pub workers: u32,
    /// Load percentage per worker.
    #[serde(default = "default_cpu_load")]
    pub cpu_load: u8,
}

fn default_cpu_load() -> u8 {
    100
}

/// `stress_mem` action configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressMemConfig {
    /// Attack duration.
    #[serde(deserialize_with = "duration_from_ms")]
    pub duration: Duration,
    /// Percentage of available memory to hold.
    pub percentage: u8,
    /// Fail the action when the payload is OOM-killed.
    #[serde(default)]
    pub fail_on_oom_kill: bool,
}

/// `stress_io` action configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressIoConfig {
    /// Attack duration.
    #[serde(deserialize_with = "duration_from_ms")]
    pub duration: Duration,
    /// Directory the disk workers write into, inside the target.
    #[serde(default = "default_io_path")]
    pub path: String,
    /// Worker count.
    #[serde(default = "default_one")]
    pub workers: u32,
    /// Percentage of free disk space per worker.
    #[serde(default = "default_io_percentage")]
    pub percentage: u8,
    /// Sub-mode: `default`, `flush`, or `read_write`.
    #[serde(default)]
    pub mode: String,
}

fn default_io_path() -> String {
    "/tmp".to_string()
}

const fn default_one() -> u32 {
    1
}

const fn default_io_percentage() -> u8 {
    50
}

/// Filter fields shared by the network actions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFilterConfig {
    /// Destination IPs or CIDRs to include.
    #[serde(default)]
    pub ip: Vec<String>,
    /// Destination hostnames to include, resolved in the target netns.
    #[serde(default)]
    pub hostname: Vec<String>,
    /// Destination ports or ranges to include.
    #[serde(default)]
    pub port: Vec<PortSpec>,
    /// Interfaces to shape; all attackable ones when empty.
    #[serde(default)]
    pub network_interface: Vec<String>,
    /// Refuse the attack when the target uses the host network.
    #[serde(default = "default_true")]
    pub fail_on_host_network: bool,
}

/// `network_blackhole` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlackholeConfig {
    /// Attack duration.
    #[serde(deserialize_with = "duration_from_ms")]
    pub duration: Duration,
    /// Filter fields.
    #[serde(flatten)]
    pub filter: NetworkFilterConfig,
}

/// `network_block_dns` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDnsConfig {
    /// Attack duration.
    #[serde(deserialize_with = "duration_from_ms")]
    pub duration: Duration,
    /// DNS port to block.
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    /// Filter fields (host-network refusal applies here too).
    #[serde(flatten)]
    pub filter: NetworkFilterConfig,
}

const fn default_dns_port() -> u16 {
    53
}

/// `network_delay` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayConfig {
    /// Attack duration.
    #[serde(deserialize_with = "duration_from_ms")]
    pub duration: Duration,
    /// Added delay in milliseconds.
    pub network_delay: u64,
    /// Add +/-30% jitter to the delay.
    #[serde(default)]
    pub network_delay_jitter: bool,
    /// Filter fields.
    #[serde(flatten)]
    pub filter: NetworkFilterConfig,
}

/// `network_bandwidth` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthConfig {
    /// Attack duration.
    #[serde(deserialize_with = "duration_from_ms")]
    pub duration: Duration,
    /// Rate limit in tc notation, e.g. `5mbit`.
    pub bandwidth: String,
    /// Filter fields.
    #[serde(flatten)]
    pub filter: NetworkFilterConfig,
}

/// `network_package_loss` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageLossConfig {
    /// Attack duration.
    #[serde(deserialize_with = "duration_from_ms")]
    pub duration: Duration,
    /// Loss percentage.
    pub network_loss: f64,
    /// Filter fields.
    #[serde(flatten)]
    pub filter: NetworkFilterConfig,
}

/// `network_package_corruption` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageCorruptionConfig {
    /// Attack duration.
    #[serde(deserialize_with = "duration_from_ms")]
    pub duration: Duration,
    /// Corruption percentage.
    pub network_corruption: f64,
    /// Filter fields.
    #[serde(flatten)]
    pub filter: NetworkFilterConfig,
}

/// Validates a tc rate string like `5mbit`.
pub fn validate_rate(rate: &str) -> Result<()> {
    let rate = rate.trim();
    let digits = rate.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return Err(FaultError::invalid_config(format!(
            "invalid bandwidth '{rate}'"
        )));
    }
    let unit = &rate[digits..];
    const UNITS: &[&str] = &[
        "bit", "kbit", "mbit", "gbit", "tbit", "bps", "kbps", "mbps", "gbps",
    ];
    if UNITS.contains(&unit) {
        Ok(())
    } else {
        Err(FaultError::invalid_config(format!(
            "invalid bandwidth unit in '{rate}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_names_round_trip() {
        for kind in ActionKind::all() {
            assert_eq!(ActionKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(ActionKind::parse("reboot").is_err());
    }

    #[test]
    fn envelope_deserializes() {
        let request: ActionRequest = serde_json::from_value(json!({
            "target": {
                "attributes": {"container.id": ["4f5e6d7c8b9a"]}
            },
            "config": {
                "duration": 30000,
                "networkDelay": 200,
                "networkDelayJitter": true,
                "hostname": ["example.com"],
                "port": [5001, "8080-8090"]
            },
            "executionContext": {
                "restrictedEndpoints": [
                    {"cidr": "10.40.0.3/32", "portMin": 8080, "portMax": 8088}
                ]
            }
        }))
        .unwrap();

        assert_eq!(request.target.container_id().unwrap(), "4f5e6d7c8b9a");
        assert_eq!(request.execution_context.restricted_endpoints.len(), 1);

        let config: DelayConfig = request.config_as().unwrap();
        assert_eq!(config.duration, Duration::from_secs(30));
        assert_eq!(config.network_delay, 200);
        assert!(config.network_delay_jitter);
        assert_eq!(config.filter.hostname, vec!["example.com"]);
        assert_eq!(config.filter.port.len(), 2);
        assert_eq!(
            config.filter.port[0].to_range().unwrap(),
            faultbox_net::PortRange::single(5001)
        );
        assert_eq!(
            config.filter.port[1].to_range().unwrap(),
            faultbox_net::PortRange {
                from: 8080,
                to: 8090
            }
        );
    }

    #[test]
    fn missing_container_id_is_invalid_config() {
        let request = ActionRequest::default();
        let err = request.target.container_id().unwrap_err();
        assert_eq!(err.kind(), "InvalidConfig");
    }

    #[test]
    fn stress_mem_defaults() {
        let config: StressMemConfig =
            serde_json::from_value(json!({"duration": 5000, "percentage": 80})).unwrap();
        assert!(!config.fail_on_oom_kill);
        assert_eq!(config.percentage, 80);
    }

    #[test]
    fn fail_on_host_network_defaults_on() {
        let config: BlackholeConfig =
            serde_json::from_value(json!({"duration": 5000})).unwrap();
        assert!(config.filter.fail_on_host_network);
        assert!(config.filter.ip.is_empty());
    }

    #[test]
    fn rate_validation() {
        assert!(validate_rate("5mbit").is_ok());
        assert!(validate_rate("512kbit").is_ok());
        assert!(validate_rate("fast").is_err());
        assert!(validate_rate("5 mbit").is_err());
    }
}
