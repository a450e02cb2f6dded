//! Periodic container discovery.
//!
//! Enumerates containers on a fixed interval, filters out infrastructure
//! containers (pause sandboxes), strips excluded label keys, and keeps the
//! latest snapshot for the orchestrator-facing discovery endpoint. A failed
//! poll cycle is logged and skipped; discovery never takes the agent down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::sync::RwLock;

use faultbox_error::Result;

use crate::client::EngineClient;
use crate::types::EngineKind;

/// Labels that mark a container as a pod sandbox.
const SANDBOX_LABELS: &[(&str, &str)] = &[
    ("io.cri-containerd.kind", "sandbox"),
    ("io.kubernetes.docker.type", "podsandbox"),
];

/// Image name substring that marks pause containers.
const PAUSE_IMAGE_MARKER: &str = "pause";

/// Discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Poll interval.
    pub interval: Duration,
    /// Glob patterns for label keys to drop from reported attributes.
    pub label_exclude_globs: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            label_exclude_globs: Vec::new(),
        }
    }
}

/// One attackable container as reported to the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Engine-specific container id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Engine the container runs under.
    pub engine: EngineKind,
    /// Labels, minus excluded keys.
    pub labels: HashMap<String, String>,
}

/// The discovery poller.
pub struct Discovery {
    client: Arc<dyn EngineClient>,
    config: DiscoveryConfig,
    exclude: Vec<Regex>,
    targets: RwLock<Vec<Target>>,
}

impl Discovery {
    /// Creates a poller over the given engine client.
    #[must_use]
    pub fn new(client: Arc<dyn EngineClient>, config: DiscoveryConfig) -> Self {
        let exclude = config
            .label_exclude_globs
            .iter()
            .filter_map(|glob| match compile_glob(glob) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::warn!(%glob, error = %err, "ignoring invalid label exclude glob");
                    None
                }
            })
            .collect();
        Self {
            client,
            config,
            exclude,
            targets: RwLock::new(Vec::new()),
        }
    }

    /// Runs the poll loop until the task is cancelled.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = self.poll_once().await {
                tracing::warn!(error = %err, "discovery poll failed, skipping cycle");
            }
        }
    }

    /// One poll cycle: refreshes the target snapshot.
    pub async fn poll_once(&self) -> Result<()> {
        let listed = self.client.list().await?;
        let engine = self.client.kind();
        let targets: Vec<Target> = listed
            .into_iter()
            .filter(|c| !is_infra_container(&c.image, &c.labels))
            .map(|c| Target {
                id: c.id,
                name: c.name,
                image: c.image,
                engine,
                labels: self.filter_labels(c.labels),
            })
            .collect();

        tracing::debug!(count = targets.len(), "discovered containers");
        *self.targets.write().await = targets;
        Ok(())
    }

    /// Latest discovery snapshot.
    pub async fn snapshot(&self) -> Vec<Target> {
        self.targets.read().await.clone()
    }

    fn filter_labels(&self, labels: HashMap<String, String>) -> HashMap<String, String> {
        labels
            .into_iter()
            .filter(|(key, _)| !self.exclude.iter().any(|re| re.is_match(key)))
            .collect()
    }
}

fn is_infra_container(image: &str, labels: &HashMap<String, String>) -> bool {
    if image.contains(PAUSE_IMAGE_MARKER) {
        return true;
    }
    SANDBOX_LABELS
        .iter()
        .any(|(key, value)| labels.get(*key).map(String::as_str) == Some(*value))
}

fn compile_glob(glob: &str) -> std::result::Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContainerDescriptor, ContainerSummary};
    use async_trait::async_trait;
    use faultbox_error::FaultError;
    use std::path::Path;

    #[derive(Debug)]
    struct FakeEngine {
        containers: Vec<ContainerSummary>,
    }

    #[async_trait]
    impl EngineClient for FakeEngine {
        fn kind(&self) -> EngineKind {
            EngineKind::Docker
        }
        fn socket(&self) -> &Path {
            Path::new("/var/run/docker.sock")
        }
        async fn version(&self) -> Result<String> {
            Ok("24.0".to_string())
        }
        async fn list(&self) -> Result<Vec<ContainerSummary>> {
            Ok(self.containers.clone())
        }
        async fn inspect(&self, id: &str) -> Result<ContainerDescriptor> {
            Err(FaultError::target_gone(id.to_string()))
        }
        async fn pause(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn unpause(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn stop(&self, _id: &str, _graceful: bool) -> Result<()> {
            Ok(())
        }
    }

    fn summary(id: &str, image: &str, labels: &[(&str, &str)]) -> ContainerSummary {
        ContainerSummary {
            id: id.to_string(),
            name: id.to_string(),
            image: image.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn pause_sandboxes_are_excluded() {
        let engine = Arc::new(FakeEngine {
            containers: vec![
                summary("c1", "registry.k8s.io/pause:3.9", &[]),
                summary("c2", "nginx:1.25", &[("io.cri-containerd.kind", "sandbox")]),
                summary("c3", "nginx:1.25", &[]),
            ],
        });
        let discovery = Discovery::new(engine, DiscoveryConfig::default());
        discovery.poll_once().await.unwrap();
        let targets = discovery.snapshot().await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, "c3");
    }

    #[tokio::test]
    async fn excluded_label_keys_are_dropped() {
        let engine = Arc::new(FakeEngine {
            containers: vec![summary(
                "c1",
                "nginx:1.25",
                &[
                    ("io.kubernetes.pod.name", "web-0"),
                    ("internal.secret/token", "abc"),
                ],
            )],
        });
        let discovery = Discovery::new(
            engine,
            DiscoveryConfig {
                interval: Duration::from_secs(30),
                label_exclude_globs: vec!["internal.secret/*".to_string()],
            },
        );
        discovery.poll_once().await.unwrap();
        let targets = discovery.snapshot().await;
        assert!(targets[0].labels.contains_key("io.kubernetes.pod.name"));
        assert!(!targets[0].labels.contains_key("internal.secret/token"));
    }

    #[test]
    fn glob_translation_anchors_both_ends() {
        let re = compile_glob("app.*/version").unwrap();
        assert!(re.is_match("app.kubernetes.io/version"));
        assert!(!re.is_match("prefix-app.kubernetes.io/version-suffix"));
    }
}
