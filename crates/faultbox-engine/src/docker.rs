//! Docker engine client: REST over the daemon's unix socket.
//!
//! One short-lived HTTP/1.1 connection per request, driven by a spawned
//! connection task. The daemon's JSON is deserialized into just the fields
//! faultbox reads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HOST;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::UnixStream;

use faultbox_error::{FaultError, Result};

use crate::client::EngineClient;
use crate::resolver;
use crate::types::{ContainerDescriptor, ContainerSummary, EngineKind};

/// Client for the Docker daemon API.
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket: PathBuf,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(rename = "Version")]
    version: String,
}

#[derive(Debug, Deserialize)]
struct ListedContainer {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Config")]
    config: InspectConfig,
    #[serde(rename = "HostConfig")]
    host_config: InspectHostConfig,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Pid")]
    pid: i32,
    #[serde(rename = "Running", default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InspectHostConfig {
    #[serde(rename = "NetworkMode", default)]
    network_mode: String,
}

impl DockerClient {
    /// Creates a client for the given daemon socket.
    #[must_use]
    pub const fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    async fn request(&self, method: Method, path: &str) -> Result<Bytes> {
        let stream = UnixStream::connect(&self.socket).await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| FaultError::internal(format!("docker handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(error = %err, "docker connection closed with error");
            }
        });

        let request = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(HOST, "docker")
            .body(Full::new(Bytes::new()))
            .map_err(|e| FaultError::internal(format!("could not build request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| FaultError::internal(format!("docker request failed: {e}")))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| FaultError::internal(format!("docker response read failed: {e}")))?
            .to_bytes();

        match status {
            s if s.is_success() => Ok(body),
            StatusCode::NOT_FOUND => Err(FaultError::target_gone(format!(
                "docker: {method} {path} -> 404"
            ))),
            s => Err(FaultError::internal(format!(
                "docker: {method} {path} -> {s}: {}",
                String::from_utf8_lossy(&body).trim()
            ))),
        }
    }
}

#[async_trait]
impl EngineClient for DockerClient {
    fn kind(&self) -> EngineKind {
        EngineKind::Docker
    }

    fn socket(&self) -> &Path {
        &self.socket
    }

    async fn version(&self) -> Result<String> {
        let body = self.request(Method::GET, "/version").await?;
        let version: VersionResponse = parse(&body)?;
        Ok(version.version)
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        let body = self.request(Method::GET, "/containers/json").await?;
        let listed: Vec<ListedContainer> = parse(&body)?;
        Ok(listed
            .into_iter()
            .map(|c| ContainerSummary {
                name: c
                    .names
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| c.id.clone()),
                id: c.id,
                image: c.image,
                labels: c.labels,
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDescriptor> {
        let body = self
            .request(Method::GET, &format!("/containers/{id}/json"))
            .await?;
        let inspect: InspectResponse = parse(&body)?;
        if !inspect.state.running || inspect.state.pid == 0 {
            return Err(FaultError::target_gone(format!(
                "container {id} is not running"
            )));
        }

        let pid = inspect.state.pid;
        let namespaces = resolver::collect_namespaces(pid)?;
        let cgroup_path = resolver::cgroup_of(pid)?;
        let host_network =
            inspect.host_config.network_mode == "host" || resolver::is_host_network(pid)?;

        Ok(ContainerDescriptor {
            id: inspect.id,
            engine: EngineKind::Docker,
            name: inspect.name.trim_start_matches('/').to_string(),
            pid,
            cgroup_path,
            namespaces,
            labels: inspect.config.labels,
            image: inspect.config.image,
            host_network,
        })
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.request(Method::POST, &format!("/containers/{id}/pause"))
            .await
            .map(|_| ())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        self.request(Method::POST, &format!("/containers/{id}/unpause"))
            .await
            .map(|_| ())
    }

    async fn stop(&self, id: &str, graceful: bool) -> Result<()> {
        let path = if graceful {
            format!("/containers/{id}/stop")
        } else {
            format!("/containers/{id}/kill")
        };
        self.request(Method::POST, &path).await.map(|_| ())
    }
}

fn parse<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| FaultError::internal(format!("unexpected docker response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_response_parses_daemon_json() {
        let body = Bytes::from_static(
            br#"{
                "Id": "4f5e6d7c8b9a",
                "Name": "/nginx-main",
                "State": {"Pid": 4711, "Running": true, "Status": "running"},
                "Config": {
                    "Image": "nginx:1.25",
                    "Labels": {"io.kubernetes.pod.name": "web-0"}
                },
                "HostConfig": {"NetworkMode": "container:abc"}
            }"#,
        );
        let inspect: InspectResponse = parse(&body).unwrap();
        assert_eq!(inspect.id, "4f5e6d7c8b9a");
        assert_eq!(inspect.name, "/nginx-main");
        assert_eq!(inspect.state.pid, 4711);
        assert!(inspect.state.running);
        assert_eq!(inspect.config.image, "nginx:1.25");
        assert_eq!(inspect.host_config.network_mode, "container:abc");
    }

    #[test]
    fn list_strips_leading_slash_from_names() {
        let body = Bytes::from_static(
            br#"[{"Id": "abc", "Names": ["/web"], "Image": "nginx", "Labels": {}}]"#,
        );
        let listed: Vec<ListedContainer> = parse(&body).unwrap();
        assert_eq!(listed[0].names[0], "/web");
    }

    #[tokio::test]
    async fn request_fails_cleanly_without_daemon() {
        let client = DockerClient::new(PathBuf::from("/nonexistent/docker.sock"));
        assert!(client.version().await.is_err());
    }
}
