//! The engine client trait and socket auto-detection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use faultbox_error::{FaultError, Result};

use crate::containerd::ContainerdClient;
use crate::crio::CrioClient;
use crate::docker::DockerClient;
use crate::types::{ContainerDescriptor, ContainerSummary, EngineKind};

/// Narrow, engine-agnostic client surface.
///
/// Everything faultbox needs from an engine: enumeration, inspection with
/// host PID / namespaces / host-network flag, and the three lifecycle
/// verbs the stop and pause attacks use.
#[async_trait]
pub trait EngineClient: Send + Sync + std::fmt::Debug {
    /// Engine kind.
    fn kind(&self) -> EngineKind;

    /// Socket the client is connected to.
    fn socket(&self) -> &Path;

    /// Engine version string.
    async fn version(&self) -> Result<String>;

    /// Lists running containers.
    async fn list(&self) -> Result<Vec<ContainerSummary>>;

    /// Inspects one container down to PID, cgroup, and namespaces.
    async fn inspect(&self, id: &str) -> Result<ContainerDescriptor>;

    /// Freezes the container.
    async fn pause(&self, id: &str) -> Result<()>;

    /// Thaws the container.
    async fn unpause(&self, id: &str) -> Result<()>;

    /// Stops the container; `graceful` sends the stop signal and waits,
    /// otherwise the container is killed.
    async fn stop(&self, id: &str, graceful: bool) -> Result<()>;
}

/// How to find the engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Forces one engine kind instead of probing.
    pub hint: Option<EngineKind>,
    /// Overrides the engine socket path.
    pub socket: Option<PathBuf>,
    /// Engines to probe, in order. Empty means all.
    pub candidates: Vec<EngineKind>,
    /// containerd namespace to operate in.
    pub containerd_namespace: String,
}

impl EngineConfig {
    fn probe_order(&self) -> Vec<EngineKind> {
        if let Some(hint) = self.hint {
            return vec![hint];
        }
        if self.candidates.is_empty() {
            vec![EngineKind::Docker, EngineKind::Containerd, EngineKind::CriO]
        } else {
            self.candidates.clone()
        }
    }

    fn socket_for(&self, kind: EngineKind) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| kind.default_socket())
    }
}

/// Probes the configured engines and returns the first that responds.
pub async fn detect(config: &EngineConfig) -> Result<Arc<dyn EngineClient>> {
    let mut probed = Vec::new();
    for kind in config.probe_order() {
        let socket = config.socket_for(kind);
        probed.push(format!("{kind} ({})", socket.display()));
        if !socket.exists() {
            tracing::debug!(%kind, socket = %socket.display(), "engine socket absent");
            continue;
        }
        match connect(kind, &socket, config).await {
            Ok(client) => match client.version().await {
                Ok(version) => {
                    tracing::info!(%kind, socket = %socket.display(), %version, "detected container engine");
                    return Ok(client);
                }
                Err(err) => {
                    tracing::debug!(%kind, error = %err, "engine probe failed");
                }
            },
            Err(err) => {
                tracing::debug!(%kind, error = %err, "engine connection failed");
            }
        }
    }
    Err(FaultError::internal(format!(
        "no container engine found, probed: {}",
        probed.join(", ")
    )))
}

async fn connect(
    kind: EngineKind,
    socket: &Path,
    config: &EngineConfig,
) -> Result<Arc<dyn EngineClient>> {
    Ok(match kind {
        EngineKind::Docker => Arc::new(DockerClient::new(socket.to_path_buf())),
        EngineKind::Containerd => Arc::new(
            ContainerdClient::connect(socket.to_path_buf(), config.containerd_namespace.clone())
                .await?,
        ),
        EngineKind::CriO => Arc::new(CrioClient::new(socket.to_path_buf())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_narrows_probe_order() {
        let config = EngineConfig {
            hint: Some(EngineKind::CriO),
            ..Default::default()
        };
        assert_eq!(config.probe_order(), vec![EngineKind::CriO]);
    }

    #[test]
    fn default_probe_order_is_docker_first() {
        let config = EngineConfig::default();
        assert_eq!(
            config.probe_order(),
            vec![EngineKind::Docker, EngineKind::Containerd, EngineKind::CriO]
        );
    }

    #[test]
    fn candidates_restrict_probing() {
        let config = EngineConfig {
            candidates: vec![EngineKind::Containerd],
            ..Default::default()
        };
        assert_eq!(config.probe_order(), vec![EngineKind::Containerd]);
    }

    #[tokio::test]
    async fn detect_fails_without_sockets() {
        let config = EngineConfig {
            socket: Some(PathBuf::from("/nonexistent/engine.sock")),
            ..Default::default()
        };
        let err = detect(&config).await.unwrap_err();
        assert!(err.to_string().contains("no container engine found"));
    }
}
