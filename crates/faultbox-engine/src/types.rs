//! Shared engine-facing types.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use faultbox_runc::NamespaceKind;

/// The container engines faultbox can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Docker daemon.
    Docker,
    /// containerd.
    Containerd,
    /// CRI-O.
    CriO,
}

impl EngineKind {
    /// Engine name as used in configuration and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Containerd => "containerd",
            Self::CriO => "cri-o",
        }
    }

    /// Default socket path for the engine.
    #[must_use]
    pub fn default_socket(self) -> PathBuf {
        PathBuf::from(match self {
            Self::Docker => "/var/run/docker.sock",
            Self::Containerd => "/run/containerd/containerd.sock",
            Self::CriO => "/var/run/crio/crio.sock",
        })
    }

    /// Default OCI runtime state root used by the engine's runtime shim.
    ///
    /// Passing this as `--root` lets the sidecar runtime share state with
    /// the engine-managed one, keeping `runc list` style tooling coherent.
    #[must_use]
    pub fn default_runc_root(self) -> PathBuf {
        PathBuf::from(match self {
            Self::Docker => "/run/docker/runtime-runc/moby",
            Self::Containerd => "/run/containerd/runc/k8s.io",
            Self::CriO => "/run/runc",
        })
    }

    /// Parses a configuration hint.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Some(Self::Docker),
            "containerd" => Some(Self::Containerd),
            "cri-o" | "crio" => Some(Self::CriO),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live namespace of a target, captured at inspection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceEntry {
    /// Namespace kind.
    pub kind: NamespaceKind,
    /// Inode of the namespace file when it was collected.
    pub inode: u64,
    /// `/proc/<pid>/ns/<kind>` path the sidecar joins.
    pub path: PathBuf,
}

/// A container as reported by `list`.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    /// Engine-specific container id.
    pub id: String,
    /// Primary name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Container labels.
    pub labels: HashMap<String, String>,
}

/// Full inspection result for one container.
#[derive(Debug, Clone)]
pub struct ContainerDescriptor {
    /// Engine-specific container id.
    pub id: String,
    /// Engine the container runs under.
    pub engine: EngineKind,
    /// Primary name.
    pub name: String,
    /// PID of the container init process on the host.
    pub pid: i32,
    /// Cgroup path of the init process.
    pub cgroup_path: String,
    /// Namespace inodes and paths collected at inspection time.
    pub namespaces: Vec<NamespaceEntry>,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Image reference.
    pub image: String,
    /// True when the container shares the host network namespace.
    pub host_network: bool,
}

impl ContainerDescriptor {
    /// Freezes the descriptor into the target configuration an attack
    /// carries through its lifecycle.
    #[must_use]
    pub fn target_config(&self) -> TargetConfig {
        TargetConfig {
            container_id: self.id.clone(),
            pid: self.pid,
            namespaces: self.namespaces.clone(),
        }
    }
}

/// The resolved target an attack operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Engine-specific container id.
    pub container_id: String,
    /// PID of the container init process.
    pub pid: i32,
    /// Namespaces frozen at prepare time.
    pub namespaces: Vec<NamespaceEntry>,
}

impl TargetConfig {
    /// Path of one namespace kind, if it was collected.
    #[must_use]
    pub fn ns_path(&self, kind: NamespaceKind) -> Option<&Path> {
        self.namespaces
            .iter()
            .find(|ns| ns.kind == kind)
            .map(|ns| ns.path.as_path())
    }

    /// `(kind, path)` pairs for the selected namespace kinds, in the given
    /// order, skipping kinds that were not collected.
    #[must_use]
    pub fn selected_ns_paths(&self, kinds: &[NamespaceKind]) -> Vec<(NamespaceKind, PathBuf)> {
        kinds
            .iter()
            .filter_map(|kind| self.ns_path(*kind).map(|p| (*kind, p.to_path_buf())))
            .collect()
    }
}
