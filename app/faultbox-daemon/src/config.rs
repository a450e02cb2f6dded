//! Agent configuration.
//!
//! Sources, in order of precedence:
//!
//! 1. Environment variables (`FAULTBOX_*`, e.g. `FAULTBOX_PORTS_SERVICE`)
//! 2. Configuration file (`/etc/faultbox/config.toml`)
//! 3. Default values
//!
//! ## Example configuration file
//!
//! ```toml
//! [ports]
//! service = 8086
//! health = 8081
//!
//! [engine]
//! runtime = "containerd"
//! namespace = "k8s.io"
//!
//! [runc]
//! systemd_cgroup = true
//!
//! [discovery]
//! interval = 30
//! excludes = ["internal.label/*"]
//! ```

use std::path::PathBuf;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

const SYSTEM_CONFIG_PATH: &str = "/etc/faultbox/config.toml";

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener ports.
    pub ports: Ports,
    /// Engine detection settings.
    pub engine: EngineSettings,
    /// OCI runtime flags.
    pub runc: RuncSettings,
    /// Discovery settings.
    pub discovery: DiscoverySettings,
    /// Sidecar settings.
    pub sidecar: SidecarSettings,
}

/// Listener ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ports {
    /// Action protocol port.
    pub service: u16,
    /// Health endpoint port.
    pub health: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            service: 8086,
            health: 8081,
        }
    }
}

/// Engine detection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Runtime hint (`docker`, `containerd`, `cri-o`); empty probes all.
    pub runtime: String,
    /// Socket path override.
    pub socket: Option<PathBuf>,
    /// containerd namespace.
    pub namespace: Option<String>,
    /// Runtimes to probe, in order (used by the e2e harness).
    pub candidates: Vec<String>,
}

/// OCI runtime flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuncSettings {
    /// State root override; the detected engine's default otherwise.
    pub root: Option<PathBuf>,
    /// Runtime debug output.
    pub debug: bool,
    /// systemd cgroup manager.
    pub systemd_cgroup: bool,
    /// Rootless mode (`true`, `false`, `auto`); empty omits the flag.
    pub rootless: Option<String>,
}

/// Discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Poll interval in seconds.
    pub interval: u64,
    /// Label-key globs dropped from reported attributes.
    pub excludes: Vec<String>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            interval: 30,
            excludes: Vec::new(),
        }
    }
}

/// Sidecar settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarSettings {
    /// Scratch directory for bundles.
    pub scratch: PathBuf,
    /// Sidecar rootfs archive override; the embedded one otherwise.
    pub image: Option<PathBuf>,
    /// Concurrent sidecar launch cap; 0 uses CPU count x 4.
    pub launch_limit: usize,
}

impl Default for SidecarSettings {
    fn default() -> Self {
        Self {
            scratch: PathBuf::from("/tmp/faultbox/containers"),
            image: None,
            launch_limit: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: Ports::default(),
            engine: EngineSettings::default(),
            runc: RuncSettings::default(),
            discovery: DiscoverySettings::default(),
            sidecar: SidecarSettings::default(),
        }
    }
}

impl Config {
    /// Loads configuration from file and environment.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Env::prefixed("FAULTBOX_").split("_"))
            .extract()
    }

    /// Loads configuration from a specific file plus environment.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("FAULTBOX_").split("_"))
            .extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.ports.service, 8086);
        assert_eq!(config.ports.health, 8081);
        assert_eq!(config.discovery.interval, 30);
        assert_eq!(
            config.sidecar.scratch,
            PathBuf::from("/tmp/faultbox/containers")
        );
        assert_eq!(config.sidecar.launch_limit, 0);
        assert!(config.engine.runtime.is_empty());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [ports]
            service = 9090

            [engine]
            runtime = "containerd"
            namespace = "moby"

            [runc]
            systemd_cgroup = true
            "#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.ports.service, 9090);
        assert_eq!(config.ports.health, 8081);
        assert_eq!(config.engine.runtime, "containerd");
        assert_eq!(config.engine.namespace.as_deref(), Some("moby"));
        assert!(config.runc.systemd_cgroup);
    }
}
