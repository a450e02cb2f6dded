//! Running stress payloads against a target.

use faultbox_engine::sidecar::{SidecarExecutor, SidecarKill, SidecarSpec, SpawnedSidecar};
use faultbox_engine::TargetConfig;
use faultbox_error::{FaultError, Result, EXIT_CODE_SIGKILL};

use crate::opts::StressOpts;

/// Launches stress sidecars.
pub struct StressRunner {
    executor: SidecarExecutor,
}

/// A stress payload in flight.
pub struct RunningStress {
    sidecar: SpawnedSidecar,
    /// Treat a SIGKILL exit of the payload as success. Memory stress uses
    /// this when `failOnOomKill` is off: hitting the container's limit is
    /// an expected outcome, not a failure.
    tolerate_oom_kill: bool,
}

impl StressRunner {
    /// Creates a runner over the sidecar executor.
    #[must_use]
    pub const fn new(executor: SidecarExecutor) -> Self {
        Self { executor }
    }

    /// Starts `stress-ng` with the given options inside the target's
    /// cgroup, mount, and PID namespaces.
    pub async fn start(
        &self,
        target: &TargetConfig,
        cgroup_path: &str,
        opts: &StressOpts,
        tolerate_oom_kill: bool,
    ) -> Result<RunningStress> {
        let spec = SidecarSpec::stress("stress", opts.to_args(), cgroup_path.to_string());
        let sidecar = self.executor.spawn(target, spec).await?;
        tracing::debug!(
            sidecar = sidecar.id(),
            cgroup = cgroup_path,
            "started stress payload"
        );
        Ok(RunningStress {
            sidecar,
            tolerate_oom_kill,
        })
    }
}

impl RunningStress {
    /// Sidecar id of the payload.
    #[must_use]
    pub fn id(&self) -> &str {
        self.sidecar.id()
    }

    /// True once the payload has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.sidecar.is_finished()
    }

    /// Kills the payload; the exit is observed by [`Self::wait`].
    pub async fn kill(&self) {
        self.sidecar.kill().await;
    }

    /// A detached kill switch usable while [`Self::wait`] owns the payload.
    #[must_use]
    pub fn kill_handle(&self) -> SidecarKill {
        self.sidecar.kill_handle()
    }

    /// Waits for the payload to finish and applies the exit policy.
    ///
    /// Exit 137 means the payload was SIGKILLed, which under memory
    /// pressure is indistinguishable from a kernel OOM kill. With
    /// `tolerate_oom_kill` it converts to success; otherwise it surfaces
    /// as [`FaultError::OomKilled`].
    pub async fn wait(self) -> Result<()> {
        match self.sidecar.wait().await {
            Ok(output) => {
                tracing::debug!(exit_code = output.exit_code, "stress payload finished");
                Ok(())
            }
            Err(err) if err.is_sigkill_exit() => {
                if self.tolerate_oom_kill {
                    tracing::debug!(
                        exit_code = EXIT_CODE_SIGKILL,
                        "stress payload was killed; treated as completion"
                    );
                    Ok(())
                } else {
                    Err(FaultError::OomKilled)
                }
            }
            Err(err) => Err(err),
        }
    }
}
