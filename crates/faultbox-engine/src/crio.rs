//! CRI-O engine client.
//!
//! CRI-O speaks the Kubernetes CRI; `crictl` is its canonical client and
//! ships wherever CRI-O does, so the agent drives it as a subprocess with
//! JSON output. Pausing is not part of the CRI and fails as unsupported.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use faultbox_error::{FaultError, Result};

use crate::client::EngineClient;
use crate::resolver;
use crate::types::{ContainerDescriptor, ContainerSummary, EngineKind};

/// Client for CRI-O via `crictl`.
#[derive(Debug, Clone)]
pub struct CrioClient {
    socket: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CrictlVersion {
    #[serde(rename = "runtimeVersion", default)]
    runtime_version: String,
}

#[derive(Debug, Deserialize)]
struct CrictlPs {
    #[serde(default)]
    containers: Vec<CrictlContainer>,
}

#[derive(Debug, Deserialize)]
struct CrictlContainer {
    id: String,
    #[serde(default)]
    metadata: CrictlMetadata,
    #[serde(default)]
    image: CrictlImage,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct CrictlMetadata {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct CrictlImage {
    #[serde(default)]
    image: String,
}

#[derive(Debug, Deserialize)]
struct CrictlInspect {
    status: CrictlContainer,
    #[serde(default)]
    info: CrictlInfo,
}

#[derive(Debug, Default, Deserialize)]
struct CrictlInfo {
    #[serde(default)]
    pid: i32,
}

impl CrioClient {
    /// Creates a client for the given CRI socket.
    #[must_use]
    pub const fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    async fn crictl(&self, args: &[&str]) -> Result<Vec<u8>> {
        let endpoint = format!("unix://{}", self.socket.display());
        let output = Command::new("crictl")
            .arg("--runtime-endpoint")
            .arg(&endpoint)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| FaultError::CommandFailed {
                command: format!("crictl --runtime-endpoint {endpoint} {}", args.join(" ")),
                exit_code: None,
                stderr: e.to_string(),
            })?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if stderr.contains("not found") {
                return Err(FaultError::target_gone(stderr));
            }
            Err(FaultError::CommandFailed {
                command: format!("crictl --runtime-endpoint {endpoint} {}", args.join(" ")),
                exit_code: output.status.code(),
                stderr,
            })
        }
    }
}

#[async_trait]
impl EngineClient for CrioClient {
    fn kind(&self) -> EngineKind {
        EngineKind::CriO
    }

    fn socket(&self) -> &Path {
        &self.socket
    }

    async fn version(&self) -> Result<String> {
        let body = self.crictl(&["version", "-o", "json"]).await?;
        let version: CrictlVersion = parse(&body)?;
        Ok(version.runtime_version)
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        let body = self
            .crictl(&["ps", "--state", "running", "-o", "json"])
            .await?;
        let ps: CrictlPs = parse(&body)?;
        Ok(ps
            .containers
            .into_iter()
            .map(|c| ContainerSummary {
                name: c.metadata.name,
                id: c.id,
                image: c.image.image,
                labels: c.labels,
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDescriptor> {
        let body = self.crictl(&["inspect", "-o", "json", id]).await?;
        let inspect: CrictlInspect = parse(&body)?;
        let pid = inspect.info.pid;
        if pid == 0 {
            return Err(FaultError::target_gone(format!(
                "container {id} has no running process"
            )));
        }

        let namespaces = resolver::collect_namespaces(pid)?;
        let cgroup_path = resolver::cgroup_of(pid)?;
        let host_network = resolver::is_host_network(pid)?;

        Ok(ContainerDescriptor {
            id: inspect.status.id,
            engine: EngineKind::CriO,
            name: inspect.status.metadata.name,
            pid,
            cgroup_path,
            namespaces,
            labels: inspect.status.labels,
            image: inspect.status.image.image,
            host_network,
        })
    }

    async fn pause(&self, _id: &str) -> Result<()> {
        Err(FaultError::unsupported("cri-o", "pause"))
    }

    async fn unpause(&self, _id: &str) -> Result<()> {
        Err(FaultError::unsupported("cri-o", "unpause"))
    }

    async fn stop(&self, id: &str, graceful: bool) -> Result<()> {
        if graceful {
            self.crictl(&["stop", id]).await?;
        } else {
            self.crictl(&["stop", "--timeout", "0", id]).await?;
        }
        Ok(())
    }
}

fn parse<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| FaultError::internal(format!("unexpected crictl output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_output_parses() {
        let body = br#"{
            "containers": [{
                "id": "8c3f2a",
                "metadata": {"name": "web", "attempt": 0},
                "image": {"image": "docker.io/library/nginx:1.25"},
                "labels": {"io.kubernetes.container.name": "web"},
                "state": "CONTAINER_RUNNING"
            }]
        }"#;
        let ps: CrictlPs = parse(body).unwrap();
        assert_eq!(ps.containers.len(), 1);
        assert_eq!(ps.containers[0].metadata.name, "web");
        assert_eq!(ps.containers[0].image.image, "docker.io/library/nginx:1.25");
    }

    #[test]
    fn inspect_output_carries_pid() {
        let body = br#"{
            "status": {
                "id": "8c3f2a",
                "metadata": {"name": "web"},
                "image": {"image": "nginx"},
                "labels": {}
            },
            "info": {"pid": 4711}
        }"#;
        let inspect: CrictlInspect = parse(body).unwrap();
        assert_eq!(inspect.info.pid, 4711);
        assert_eq!(inspect.status.id, "8c3f2a");
    }

    #[tokio::test]
    async fn pause_is_unsupported() {
        let client = CrioClient::new(PathBuf::from("/var/run/crio/crio.sock"));
        let err = client.pause("abc").await.unwrap_err();
        assert_eq!(err.kind(), "UnsupportedOnRuntime");
    }
}
