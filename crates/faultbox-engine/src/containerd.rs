//! containerd engine client over its gRPC socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::version_client::VersionClient;
use containerd_client::services::v1::{
    GetContainerRequest, GetRequest as GetTaskRequest, KillRequest, ListContainersRequest,
    ListTasksRequest, PauseTaskRequest, ResumeTaskRequest,
};
use containerd_client::with_namespace;
use tonic::transport::Channel;
use tonic::Request;

use faultbox_error::{FaultError, Result};

use crate::client::EngineClient;
use crate::resolver;
use crate::types::{ContainerDescriptor, ContainerSummary, EngineKind};

/// Task status value for a running process in the containerd API.
const TASK_STATUS_RUNNING: i32 = 2;

/// Signal numbers for the stop verb.
const SIGTERM: u32 = 15;
const SIGKILL: u32 = 9;

/// Client for containerd.
#[derive(Debug, Clone)]
pub struct ContainerdClient {
    socket: PathBuf,
    namespace: String,
    channel: Channel,
}

impl ContainerdClient {
    /// Connects to the containerd socket.
    pub async fn connect(socket: PathBuf, namespace: String) -> Result<Self> {
        let channel = containerd_client::connect(&socket).await.map_err(|e| {
            FaultError::internal(format!(
                "failed to connect to containerd at {}: {e}",
                socket.display()
            ))
        })?;
        Ok(Self {
            socket,
            namespace,
            channel,
        })
    }

    async fn task_pid(&self, id: &str) -> Result<i32> {
        let mut tasks = TasksClient::new(self.channel.clone());
        let req = GetTaskRequest {
            container_id: id.to_string(),
            ..Default::default()
        };
        let req = with_namespace!(req, &self.namespace);
        let resp = tasks.get(req).await.map_err(|e| grpc_err(id, &e))?;
        let process = resp
            .into_inner()
            .process
            .ok_or_else(|| FaultError::target_gone(format!("container {id} has no task")))?;
        if process.status != TASK_STATUS_RUNNING {
            return Err(FaultError::target_gone(format!(
                "container {id} task is not running"
            )));
        }
        i32::try_from(process.pid)
            .map_err(|_| FaultError::internal(format!("task pid {} out of range", process.pid)))
    }
}

#[async_trait]
impl EngineClient for ContainerdClient {
    fn kind(&self) -> EngineKind {
        EngineKind::Containerd
    }

    fn socket(&self) -> &Path {
        &self.socket
    }

    async fn version(&self) -> Result<String> {
        let mut client = VersionClient::new(self.channel.clone());
        let resp = client
            .version(())
            .await
            .map_err(|e| FaultError::internal(format!("containerd version failed: {e}")))?;
        Ok(resp.into_inner().version)
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        let mut containers = ContainersClient::new(self.channel.clone());
        let req = ListContainersRequest::default();
        let req = with_namespace!(req, &self.namespace);
        let listed = containers
            .list(req)
            .await
            .map_err(|e| FaultError::internal(format!("containerd list failed: {e}")))?
            .into_inner()
            .containers;

        let mut tasks = TasksClient::new(self.channel.clone());
        let req = ListTasksRequest::default();
        let req = with_namespace!(req, &self.namespace);
        let running: HashMap<String, u32> = tasks
            .list(req)
            .await
            .map_err(|e| FaultError::internal(format!("containerd task list failed: {e}")))?
            .into_inner()
            .tasks
            .into_iter()
            .filter(|t| t.status == TASK_STATUS_RUNNING)
            .map(|t| (t.container_id, t.pid))
            .collect();

        Ok(listed
            .into_iter()
            .filter(|c| running.contains_key(&c.id))
            .map(|c| ContainerSummary {
                name: c.id.clone(),
                id: c.id,
                image: c.image,
                labels: c.labels,
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDescriptor> {
        let mut containers = ContainersClient::new(self.channel.clone());
        let req = GetContainerRequest { id: id.to_string() };
        let req = with_namespace!(req, &self.namespace);
        let container = containers
            .get(req)
            .await
            .map_err(|e| grpc_err(id, &e))?
            .into_inner()
            .container
            .ok_or_else(|| FaultError::target_gone(format!("container {id} not found")))?;

        let pid = self.task_pid(id).await?;
        let namespaces = resolver::collect_namespaces(pid)?;
        let cgroup_path = resolver::cgroup_of(pid)?;
        let host_network = resolver::is_host_network(pid)?;

        Ok(ContainerDescriptor {
            id: container.id.clone(),
            engine: EngineKind::Containerd,
            name: container.id,
            pid,
            cgroup_path,
            namespaces,
            labels: container.labels,
            image: container.image,
            host_network,
        })
    }

    async fn pause(&self, id: &str) -> Result<()> {
        let mut tasks = TasksClient::new(self.channel.clone());
        let req = PauseTaskRequest {
            container_id: id.to_string(),
        };
        let req = with_namespace!(req, &self.namespace);
        tasks.pause(req).await.map_err(|e| grpc_err(id, &e))?;
        Ok(())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        let mut tasks = TasksClient::new(self.channel.clone());
        let req = ResumeTaskRequest {
            container_id: id.to_string(),
        };
        let req = with_namespace!(req, &self.namespace);
        tasks.resume(req).await.map_err(|e| grpc_err(id, &e))?;
        Ok(())
    }

    async fn stop(&self, id: &str, graceful: bool) -> Result<()> {
        let mut tasks = TasksClient::new(self.channel.clone());
        let req = KillRequest {
            container_id: id.to_string(),
            signal: if graceful { SIGTERM } else { SIGKILL },
            all: true,
            ..Default::default()
        };
        let req = with_namespace!(req, &self.namespace);
        tasks.kill(req).await.map_err(|e| grpc_err(id, &e))?;
        Ok(())
    }
}

fn grpc_err(id: &str, status: &tonic::Status) -> FaultError {
    if status.code() == tonic::Code::NotFound {
        FaultError::target_gone(format!("container {id} not found"))
    } else {
        FaultError::internal(format!("containerd request for {id} failed: {status}"))
    }
}
