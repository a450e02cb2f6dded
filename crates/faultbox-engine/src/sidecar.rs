//! Sidecar execution against resolved targets.
//!
//! Every privileged operation faultbox performs inside a target runs as a
//! short-lived runc container that joins a subset of the target's
//! namespaces. The executor owns the common choreography: re-verify the
//! target's namespace inodes, build a bundle, edit its spec, run, and tear
//! everything down on every exit path. Long-running payloads (stress) use
//! [`SidecarExecutor::spawn`] and are killed through the runtime.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use faultbox_error::{FaultError, Result};
use faultbox_runc::runc::RunOutput;
use faultbox_runc::{next_sidecar_id, Bundle, IoStreams, NamespaceKind, Runc, SidecarImage};

use crate::resolver;
use crate::types::TargetConfig;

/// Annotation marking helper containers in runtime listings.
pub const SIDECAR_ANNOTATION: &str = "com.faultbox.sidecar";

/// What a sidecar should do and which namespaces it joins.
#[derive(Debug, Clone)]
pub struct SidecarSpec {
    /// Hostname prefix; the sidecar id is appended.
    pub name: &'static str,
    /// Process argv.
    pub args: Vec<String>,
    /// Capabilities granted to the payload.
    pub capabilities: Vec<&'static str>,
    /// Target namespaces to join.
    pub join: Vec<NamespaceKind>,
    /// Optional stdin fed to the payload (batch input).
    pub stdin: Option<Vec<u8>>,
    /// Cgroups path for the sidecar itself; stress sidecars point this at
    /// the target's cgroup so the load counts against its limits.
    pub cgroups_path: Option<String>,
    /// Mount the cgroup hierarchy inside the sidecar.
    pub mount_cgroup: bool,
}

impl SidecarSpec {
    /// A network-namespace sidecar with `CAP_NET_ADMIN`.
    #[must_use]
    pub fn netns(name: &'static str, args: Vec<String>) -> Self {
        Self {
            name,
            args,
            capabilities: vec!["CAP_NET_ADMIN", "CAP_NET_RAW"],
            join: vec![NamespaceKind::Network],
            stdin: None,
            cgroups_path: None,
            mount_cgroup: false,
        }
    }

    /// A stress sidecar joining cgroup, mount, and PID namespaces (not the
    /// network), confined to the target's cgroup.
    #[must_use]
    pub fn stress(name: &'static str, args: Vec<String>, cgroups_path: String) -> Self {
        Self {
            name,
            args,
            capabilities: vec!["CAP_SYS_RESOURCE"],
            join: vec![
                NamespaceKind::Cgroup,
                NamespaceKind::Mount,
                NamespaceKind::Pid,
            ],
            stdin: None,
            cgroups_path: Some(cgroups_path),
            mount_cgroup: true,
        }
    }

    /// Adds batch stdin.
    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Also joins the target mount namespace (needed to see the target's
    /// resolver configuration).
    #[must_use]
    pub fn join_mountns(mut self) -> Self {
        self.join.push(NamespaceKind::Mount);
        self
    }
}

/// Runs sidecars against targets.
///
/// Concurrent launches are capped by a semaphore (default CPU count x 4)
/// so a burst of actions cannot storm the runtime.
#[derive(Debug, Clone)]
pub struct SidecarExecutor {
    runc: Runc,
    image: SidecarImage,
    scratch: PathBuf,
    launch_permits: Arc<Semaphore>,
}

impl SidecarExecutor {
    /// Creates an executor with the default launch cap.
    #[must_use]
    pub fn new(runc: Runc, image: SidecarImage, scratch: PathBuf) -> Self {
        let cpus = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        Self::with_launch_limit(runc, image, scratch, cpus * 4)
    }

    /// Creates an executor with an explicit launch cap.
    #[must_use]
    pub fn with_launch_limit(
        runc: Runc,
        image: SidecarImage,
        scratch: PathBuf,
        limit: usize,
    ) -> Self {
        Self {
            runc,
            image,
            scratch,
            launch_permits: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// The scratch root bundles are created under.
    #[must_use]
    pub fn scratch(&self) -> &PathBuf {
        &self.scratch
    }

    /// Runs one sidecar to completion and returns its captured output.
    ///
    /// The target's namespace inodes are re-verified immediately before
    /// the launch; a recycled PID aborts with `TargetGone` and no sidecar
    /// is started.
    pub async fn run(&self, target: &TargetConfig, spec: SidecarSpec) -> Result<RunOutput> {
        let _permit = self.acquire_permit().await?;
        let (id, bundle) = self.prepare(target, &spec).await?;
        let result = self.runc.run(&id, bundle.path(), take_io(&spec)).await;

        // The runtime container must be deleted even when `run` failed.
        if let Err(err) = self.runc.delete(&id, true).await {
            tracing::debug!(sidecar = %id, error = %err, "sidecar delete after run");
        }
        bundle.remove();
        result
    }

    /// Starts a long-running sidecar and hands back a handle that can wait
    /// for it or kill it.
    pub async fn spawn(&self, target: &TargetConfig, spec: SidecarSpec) -> Result<SpawnedSidecar> {
        let permit = self.acquire_permit().await?;
        let (id, bundle) = self.prepare(target, &spec).await?;
        let io = take_io(&spec);
        let runc = self.runc.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            // The launch permit is held for the payload's lifetime.
            let _permit = permit;
            let result = runc.run(&task_id, bundle.path(), io).await;
            if let Err(err) = runc.delete(&task_id, true).await {
                tracing::debug!(sidecar = %task_id, error = %err, "sidecar delete after run");
            }
            bundle.remove();
            result
        });
        Ok(SpawnedSidecar {
            id,
            runc: self.runc.clone(),
            task,
        })
    }

    async fn acquire_permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.launch_permits)
            .acquire_owned()
            .await
            .map_err(|_| FaultError::internal("sidecar launch semaphore closed"))
    }

    async fn prepare(
        &self,
        target: &TargetConfig,
        spec: &SidecarSpec,
    ) -> Result<(String, Bundle)> {
        resolver::verify_namespaces(&target.namespaces)?;

        let id = next_sidecar_id(&target.container_id);
        let bundle = Bundle::prepare(&self.scratch, self.image.path(), &id, &self.runc).await?;

        if let Err(err) = self.edit_spec(target, spec, &id, &bundle) {
            bundle.remove();
            return Err(err);
        }
        Ok((id, bundle))
    }

    fn edit_spec(
        &self,
        target: &TargetConfig,
        spec: &SidecarSpec,
        id: &str,
        bundle: &Bundle,
    ) -> Result<()> {
        let mut oci = bundle.spec()?;
        oci.set_hostname(format!("{}-{id}", spec.name))
            .set_annotations([(SIDECAR_ANNOTATION, "true")])
            .set_process_args(spec.args.iter().cloned())
            .set_capabilities(&spec.capabilities)
            .set_namespace_paths(&target.selected_ns_paths(&spec.join));
        if let Some(path) = &spec.cgroups_path {
            oci.set_cgroups_path(path.clone());
        }
        if spec.mount_cgroup {
            oci.mount_cgroup_hierarchy();
        }
        bundle.save_spec(&oci)
    }
}

fn take_io(spec: &SidecarSpec) -> IoStreams {
    spec.stdin
        .clone()
        .map_or_else(IoStreams::default, IoStreams::with_stdin)
}

/// Handle to a long-running sidecar.
#[derive(Debug)]
pub struct SpawnedSidecar {
    id: String,
    runc: Runc,
    task: JoinHandle<Result<RunOutput>>,
}

impl SpawnedSidecar {
    /// Sidecar id in the runtime.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True once the payload has exited and its bundle is gone.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the payload to exit and returns its output.
    pub async fn wait(self) -> Result<RunOutput> {
        self.task
            .await
            .map_err(|e| FaultError::internal(format!("sidecar task failed: {e}")))?
    }

    /// Kills the payload through the runtime. The spawned task still
    /// performs the cleanup; waiting afterwards observes the exit.
    pub async fn kill(&self) {
        if let Err(err) = self.runc.delete(&self.id, true).await {
            tracing::debug!(sidecar = %self.id, error = %err, "sidecar kill");
        }
    }

    /// A detached handle that can kill the payload while another task owns
    /// the waiter.
    #[must_use]
    pub fn kill_handle(&self) -> SidecarKill {
        SidecarKill {
            id: self.id.clone(),
            runc: self.runc.clone(),
        }
    }
}

/// Detached kill switch for a spawned sidecar.
#[derive(Debug, Clone)]
pub struct SidecarKill {
    id: String,
    runc: Runc,
}

impl SidecarKill {
    /// Kills the payload through the runtime.
    pub async fn kill(&self) {
        if let Err(err) = self.runc.delete(&self.id, true).await {
            tracing::debug!(sidecar = %self.id, error = %err, "sidecar kill");
        }
    }
}
