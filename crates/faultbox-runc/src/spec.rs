//! Partial model of the OCI runtime `config.json`.
//!
//! The runtime generates a complete baseline spec; faultbox only edits the
//! handful of fields a sidecar needs (namespaces, capabilities, args,
//! mounts, cgroup placement). Everything else round-trips untouched through
//! flattened passthrough maps, so a newer runtime's spec fields survive the
//! load-edit-save cycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use faultbox_error::{FaultError, Result};

/// Linux namespace kinds as named in the OCI spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    /// Network namespace.
    Network,
    /// Mount namespace.
    Mount,
    /// PID namespace.
    Pid,
    /// IPC namespace.
    Ipc,
    /// UTS namespace.
    Uts,
    /// Cgroup namespace.
    Cgroup,
    /// User namespace.
    User,
}

impl NamespaceKind {
    /// The entry name under `/proc/<pid>/ns/` for this kind.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Network => "net",
            Self::Mount => "mnt",
            Self::Pid => "pid",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Cgroup => "cgroup",
            Self::User => "user",
        }
    }

    /// All kinds, in the order they are collected at inspection time.
    #[must_use]
    pub const fn all() -> [Self; 7] {
        [
            Self::Network,
            Self::Mount,
            Self::Pid,
            Self::Ipc,
            Self::Uts,
            Self::Cgroup,
            Self::User,
        ]
    }
}

/// A namespace entry in the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace kind.
    #[serde(rename = "type")]
    pub kind: NamespaceKind,
    /// Path to join; absent means a fresh namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// A mount entry in the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    /// Mount destination inside the container.
    pub destination: PathBuf,
    /// Filesystem type.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    /// Mount source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Mount options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Process capability sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inheritable: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permitted: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ambient: Option<Vec<String>>,
}

/// The container process description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Process {
    /// Process arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Capability sets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    /// Fields faultbox does not edit (cwd, env, user, rlimits, ...).
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// Linux platform section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Linux {
    /// Namespace configuration.
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    /// Cgroups path for the container.
    #[serde(rename = "cgroupsPath", skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
    /// Untouched platform fields (resources, seccomp, devices, ...).
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// Partial OCI runtime spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    /// Spec version written by the runtime.
    #[serde(rename = "ociVersion")]
    pub oci_version: String,
    /// Container hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Process to run.
    pub process: Process,
    /// Mount table.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    /// Linux platform section.
    #[serde(default)]
    pub linux: Linux,
    /// Untouched top-level fields (root, hooks, ...).
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl Spec {
    /// Loads the spec from a bundle directory.
    pub fn load(bundle: &Path) -> Result<Self> {
        let path = bundle.join("config.json");
        let data = std::fs::read(&path)?;
        serde_json::from_slice(&data).map_err(|e| {
            FaultError::internal(format!("could not parse {}: {e}", path.display()))
        })
    }

    /// Writes the spec back into the bundle directory.
    pub fn save(&self, bundle: &Path) -> Result<()> {
        let path = bundle.join("config.json");
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| FaultError::internal(format!("could not serialize spec: {e}")))?;
        std::fs::write(&path, data)?;
        Ok(())
    }

    /// Sets the container hostname.
    pub fn set_hostname(&mut self, hostname: impl Into<String>) -> &mut Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Merges annotations into the spec.
    pub fn set_annotations<I, K, V>(&mut self, annotations: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in annotations {
            self.annotations.insert(k.into(), v.into());
        }
        self
    }

    /// Replaces the process arguments.
    pub fn set_process_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.process.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets every capability set to exactly the given capabilities.
    pub fn set_capabilities(&mut self, caps: &[&str]) -> &mut Self {
        let caps: Vec<String> = caps.iter().map(|c| (*c).to_string()).collect();
        self.process.capabilities = Some(Capabilities {
            bounding: Some(caps.clone()),
            effective: Some(caps.clone()),
            inheritable: Some(caps.clone()),
            permitted: Some(caps.clone()),
            ambient: Some(caps),
        });
        self
    }

    /// Points the selected namespace kinds at the given target paths.
    ///
    /// Namespaces not listed keep whatever the baseline spec says, i.e.
    /// they stay fresh. A selected kind missing from the baseline is
    /// appended.
    pub fn set_namespace_paths(&mut self, paths: &[(NamespaceKind, PathBuf)]) -> &mut Self {
        for (kind, path) in paths {
            match self
                .linux
                .namespaces
                .iter_mut()
                .find(|ns| ns.kind == *kind)
            {
                Some(ns) => ns.path = Some(path.clone()),
                None => self.linux.namespaces.push(Namespace {
                    kind: *kind,
                    path: Some(path.clone()),
                }),
            }
        }
        self
    }

    /// Adds a bind mount. Read-only unless `read_only` is false.
    pub fn add_bind_mount(
        &mut self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        read_only: bool,
    ) -> &mut Self {
        let mut options = vec!["bind".to_string(), "nosuid".to_string(), "nodev".to_string()];
        if read_only {
            options.push("ro".to_string());
        }
        self.mounts.push(Mount {
            destination: destination.into(),
            fs_type: Some("bind".to_string()),
            source: Some(source.into()),
            options,
        });
        self
    }

    /// Sets the container cgroups path.
    pub fn set_cgroups_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.linux.cgroups_path = Some(path.into());
        self
    }

    /// Mounts the cgroup hierarchy at `/sys/fs/cgroup` unless the baseline
    /// spec already mounts something there.
    ///
    /// Needed by stress sidecars that must land inside the target's cgroup
    /// while observing its limits.
    pub fn mount_cgroup_hierarchy(&mut self) -> &mut Self {
        let destination = PathBuf::from("/sys/fs/cgroup");
        if self.mounts.iter().any(|m| m.destination == destination) {
            return self;
        }
        self.mounts.push(Mount {
            destination,
            fs_type: Some("cgroup".to_string()),
            source: Some(PathBuf::from("cgroup")),
            options: vec!["nosuid".to_string(), "noexec".to_string(), "nodev".to_string()],
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASELINE: &str = r#"{
        "ociVersion": "1.0.2",
        "process": {
            "terminal": true,
            "user": {"uid": 0, "gid": 0},
            "args": ["sh"],
            "cwd": "/",
            "capabilities": {
                "bounding": ["CAP_AUDIT_WRITE", "CAP_KILL"],
                "effective": ["CAP_AUDIT_WRITE", "CAP_KILL"],
                "permitted": ["CAP_AUDIT_WRITE", "CAP_KILL"]
            }
        },
        "root": {"path": "rootfs", "readonly": true},
        "mounts": [
            {"destination": "/proc", "type": "proc", "source": "proc"}
        ],
        "linux": {
            "namespaces": [
                {"type": "pid"},
                {"type": "network"},
                {"type": "ipc"},
                {"type": "uts"},
                {"type": "mount"}
            ],
            "maskedPaths": ["/proc/kcore"]
        }
    }"#;

    fn baseline() -> Spec {
        serde_json::from_str(BASELINE).unwrap()
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let spec = baseline();
        let json = serde_json::to_value(&spec).unwrap();
        // Fields the model does not type must still be present.
        assert_eq!(json["root"]["path"], "rootfs");
        assert_eq!(json["process"]["cwd"], "/");
        assert_eq!(json["process"]["terminal"], true);
        assert_eq!(json["linux"]["maskedPaths"][0], "/proc/kcore");
    }

    #[test]
    fn selected_namespaces_get_target_paths_others_stay_fresh() {
        let mut spec = baseline();
        spec.set_namespace_paths(&[(
            NamespaceKind::Network,
            PathBuf::from("/proc/4711/ns/net"),
        )]);

        let net = spec
            .linux
            .namespaces
            .iter()
            .find(|ns| ns.kind == NamespaceKind::Network)
            .unwrap();
        assert_eq!(net.path.as_deref(), Some(Path::new("/proc/4711/ns/net")));

        let pid = spec
            .linux
            .namespaces
            .iter()
            .find(|ns| ns.kind == NamespaceKind::Pid)
            .unwrap();
        assert!(pid.path.is_none());
    }

    #[test]
    fn missing_selected_namespace_is_appended() {
        let mut spec = baseline();
        spec.set_namespace_paths(&[(
            NamespaceKind::Cgroup,
            PathBuf::from("/proc/4711/ns/cgroup"),
        )]);
        assert!(spec
            .linux
            .namespaces
            .iter()
            .any(|ns| ns.kind == NamespaceKind::Cgroup
                && ns.path.as_deref() == Some(Path::new("/proc/4711/ns/cgroup"))));
    }

    #[test]
    fn capabilities_replace_every_set() {
        let mut spec = baseline();
        spec.set_capabilities(&["CAP_NET_ADMIN"]);
        let caps = spec.process.capabilities.as_ref().unwrap();
        let expected = vec!["CAP_NET_ADMIN".to_string()];
        assert_eq!(caps.bounding.as_ref(), Some(&expected));
        assert_eq!(caps.effective.as_ref(), Some(&expected));
        assert_eq!(caps.inheritable.as_ref(), Some(&expected));
        assert_eq!(caps.permitted.as_ref(), Some(&expected));
        assert_eq!(caps.ambient.as_ref(), Some(&expected));
    }

    #[test]
    fn bind_mount_defaults_to_read_only() {
        let mut spec = baseline();
        spec.add_bind_mount("/tmp/batch", "/input", true);
        let mount = spec.mounts.last().unwrap();
        assert!(mount.options.contains(&"ro".to_string()));
        assert_eq!(mount.fs_type.as_deref(), Some("bind"));
    }

    #[test]
    fn cgroup_hierarchy_mount_is_not_duplicated() {
        let mut spec = baseline();
        spec.mount_cgroup_hierarchy();
        spec.mount_cgroup_hierarchy();
        let count = spec
            .mounts
            .iter()
            .filter(|m| m.destination == Path::new("/sys/fs/cgroup"))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn edits_compose_and_save(){
        let dir = tempfile::tempdir().unwrap();
        let mut spec = baseline();
        spec.set_hostname("tc-sb-42")
            .set_annotations([("com.faultbox.sidecar", "true")])
            .set_process_args(["tc", "-force", "-batch", "-"])
            .set_cgroups_path("/faultbox/sb-42");
        spec.save(dir.path()).unwrap();

        let loaded = Spec::load(dir.path()).unwrap();
        assert_eq!(loaded.hostname.as_deref(), Some("tc-sb-42"));
        assert_eq!(
            loaded.annotations.get("com.faultbox.sidecar").map(String::as_str),
            Some("true")
        );
        assert_eq!(loaded.process.args, vec!["tc", "-force", "-batch", "-"]);
        assert_eq!(loaded.linux.cgroups_path.as_deref(), Some("/faultbox/sb-42"));
    }
}
