//! OCI runtime invocation as a subprocess.
//!
//! Mirrors the runtime's CLI one to one: every method is a single
//! invocation of the `runc` binary (or a compatible runtime) with the
//! configured global flags. Stderr is captured and returned verbatim in
//! errors so the caller can see exactly what the runtime said.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use faultbox_error::{FaultError, Result};

/// Global flags passed to every runtime invocation.
#[derive(Debug, Clone, Default)]
pub struct RuncConfig {
    /// Runtime state root (`--root`). `None` uses the runtime default.
    pub root: Option<PathBuf>,
    /// Enable runtime debug output.
    pub debug: bool,
    /// Use systemd cgroup manager.
    pub systemd_cgroup: bool,
    /// Rootless mode (`true`, `false`, or `auto`). `None` omits the flag.
    pub rootless: Option<String>,
}

/// Driver for the OCI runtime binary.
#[derive(Debug, Clone)]
pub struct Runc {
    binary: String,
    config: RuncConfig,
}

/// Runtime state record as reported by `runc state`.
#[derive(Debug, Clone, Deserialize)]
pub struct RuncState {
    /// Container id.
    pub id: String,
    /// PID of the container init process.
    #[serde(default)]
    pub pid: i32,
    /// Lifecycle status string (`created`, `running`, `stopped`).
    pub status: String,
    /// Bundle directory.
    #[serde(default)]
    pub bundle: PathBuf,
    /// Rootfs directory.
    #[serde(default)]
    pub rootfs: PathBuf,
    /// Annotations from the bundle spec.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Stdio wiring for [`Runc::run`].
///
/// Stdout and stderr are always captured; stdin is fed from a buffer when
/// provided (used for batch input such as `tc -batch -`).
#[derive(Debug, Default)]
pub struct IoStreams {
    /// Bytes written to the child's stdin before it is closed.
    pub stdin: Option<Vec<u8>>,
}

impl IoStreams {
    /// Stdio with the given stdin contents.
    #[must_use]
    pub fn with_stdin(input: impl Into<Vec<u8>>) -> Self {
        Self {
            stdin: Some(input.into()),
        }
    }
}

/// Captured output of a completed sidecar run.
#[derive(Debug)]
pub struct RunOutput {
    /// Exit code of the runtime invocation. Signal terminations are mapped
    /// to `128 + signal`, matching shell convention.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl Runc {
    /// Creates a driver for the given runtime configuration.
    #[must_use]
    pub fn new(config: RuncConfig) -> Self {
        Self {
            binary: "runc".to_string(),
            config,
        }
    }

    /// Overrides the runtime binary name (tests, alternative runtimes).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Generates the default spec (`config.json`) inside `bundle`.
    pub async fn spec(&self, bundle: &Path) -> Result<()> {
        tracing::trace!(bundle = %bundle.display(), "creating container spec");
        self.checked_output(&[
            "spec".to_string(),
            "--bundle".to_string(),
            bundle.display().to_string(),
        ])
        .await
        .map(|_| ())
    }

    /// Queries the state of a runtime container.
    pub async fn state(&self, id: &str) -> Result<RuncState> {
        let output = self
            .checked_output(&["state".to_string(), id.to_string()])
            .await?;
        serde_json::from_slice(&output)
            .map_err(|e| FaultError::internal(format!("could not parse runc state: {e}")))
    }

    /// Runs a container to completion in the foreground.
    ///
    /// The child is spawned with kill-on-drop so that cancelling the
    /// calling task SIGKILLs the runtime; tokio reaps the process in the
    /// background, leaving no zombie behind.
    pub async fn run(&self, id: &str, bundle: &Path, io: IoStreams) -> Result<RunOutput> {
        tracing::trace!(id, bundle = %bundle.display(), "running container");

        let args = [
            "run".to_string(),
            "--bundle".to_string(),
            bundle.display().to_string(),
            id.to_string(),
        ];
        let mut cmd = self.command(&args);
        cmd.stdin(if io.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| self.spawn_error(&args, &e))?;

        if let Some(input) = io.stdin {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| FaultError::internal("child stdin not captured"))?;
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let exit_code = exit_code_of(&output.status);
        tracing::trace!(id, exit_code, "container exited");

        if output.status.success() {
            Ok(RunOutput {
                exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            Err(FaultError::CommandFailed {
                command: self.render_command(&args),
                exit_code: Some(exit_code),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    /// Deletes a runtime container.
    pub async fn delete(&self, id: &str, force: bool) -> Result<()> {
        tracing::trace!(id, force, "deleting container");
        self.checked_output(&[
            "delete".to_string(),
            format!("--force={force}"),
            id.to_string(),
        ])
        .await
        .map(|_| ())
    }

    fn global_args(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(root) = &self.config.root {
            out.push("--root".to_string());
            out.push(root.display().to_string());
        }
        if self.config.debug {
            out.push("--debug".to_string());
        }
        if self.config.systemd_cgroup {
            out.push("--systemd-cgroup".to_string());
        }
        if let Some(rootless) = &self.config.rootless {
            out.push("--rootless".to_string());
            out.push(rootless.clone());
        }
        out
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.global_args());
        cmd.args(args);
        cmd.kill_on_drop(true);
        cmd
    }

    fn render_command(&self, args: &[String]) -> String {
        let mut parts = vec![self.binary.clone()];
        parts.extend(self.global_args());
        parts.extend(args.iter().cloned());
        parts.join(" ")
    }

    fn spawn_error(&self, args: &[String], err: &std::io::Error) -> FaultError {
        FaultError::CommandFailed {
            command: self.render_command(args),
            exit_code: None,
            stderr: err.to_string(),
        }
    }

    async fn checked_output(&self, args: &[String]) -> Result<Vec<u8>> {
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(args, &e))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(FaultError::CommandFailed {
                command: self.render_command(args),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(config: RuncConfig) -> Runc {
        Runc::new(config)
    }

    #[test]
    fn global_args_default_is_empty() {
        assert!(driver(RuncConfig::default()).global_args().is_empty());
    }

    #[test]
    fn global_args_include_configured_flags() {
        let config = RuncConfig {
            root: Some(PathBuf::from("/run/docker/runtime-runc/moby")),
            debug: true,
            systemd_cgroup: true,
            rootless: Some("auto".to_string()),
        };
        assert_eq!(
            driver(config).global_args(),
            vec![
                "--root",
                "/run/docker/runtime-runc/moby",
                "--debug",
                "--systemd-cgroup",
                "--rootless",
                "auto",
            ]
        );
    }

    #[tokio::test]
    async fn run_captures_stdout() {
        // Stand in an `echo`-like binary for the runtime; `run` passes its
        // arguments through, so stdout capture and exit handling are
        // exercised without a real runtime.
        let runc = driver(RuncConfig::default()).with_binary("echo");
        let out = runc
            .run("sb-test-0", Path::new("/tmp/none"), IoStreams::default())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(String::from_utf8_lossy(&out.stdout).contains("sb-test-0"));
    }

    #[tokio::test]
    async fn run_feeds_stdin() {
        use std::os::unix::fs::PermissionsExt;

        // A shim that ignores the runtime arguments and echoes stdin, like
        // a sidecar payload consuming batch input would.
        let dir = tempfile::tempdir().unwrap();
        let shim = dir.path().join("fake-runc");
        std::fs::write(&shim, "#!/bin/sh\ncat\n").unwrap();
        std::fs::set_permissions(&shim, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runc = driver(RuncConfig::default()).with_binary(shim.display().to_string());
        let out = runc
            .run(
                "sb-test-1",
                Path::new("/tmp/none"),
                IoStreams::with_stdin("qdisc add dev eth0\n"),
            )
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&out.stdout).contains("qdisc add dev eth0"));
    }

    #[tokio::test]
    async fn failure_surfaces_stderr_and_exit_code() {
        let runc = driver(RuncConfig::default()).with_binary("sh");
        // `sh -c ...` would not match the driver call shape; use `false`
        // via a missing bundle path on the real arg layout instead.
        let err = runc
            .run("nonexistent", Path::new("/nonexistent"), IoStreams::default())
            .await
            .unwrap_err();
        match err {
            FaultError::CommandFailed { exit_code, .. } => {
                assert!(exit_code.is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_command_failed() {
        let runc = driver(RuncConfig::default()).with_binary("faultbox-does-not-exist");
        let err = runc.delete("x", true).await.unwrap_err();
        match err {
            FaultError::CommandFailed {
                command,
                exit_code: None,
                ..
            } => assert!(command.starts_with("faultbox-does-not-exist")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
