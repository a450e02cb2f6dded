//! The shared fault-injection error enum.

use thiserror::Error;

/// Exit code a process receives when killed by SIGKILL, which is also what
/// the kernel OOM killer delivers.
pub const EXIT_CODE_SIGKILL: i32 = 137;

/// Errors that can occur while preparing, running, or reverting an attack.
#[derive(Debug, Error)]
pub enum FaultError {
    /// I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The action configuration could not be interpreted.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The target container is gone or was recycled to another workload.
    ///
    /// Raised when a container no longer exists, or when its namespace
    /// inodes no longer match those collected at inspection time (PID
    /// reuse).
    #[error("target gone: {0}")]
    TargetGone(String),

    /// The operation is not supported on the detected container engine.
    #[error("unsupported on {engine}: {operation}")]
    Unsupported {
        /// Engine name (docker, containerd, cri-o).
        engine: String,
        /// The refused operation.
        operation: String,
    },

    /// An incompatible attack already holds the same interface.
    #[error("conflicting attack: {0}")]
    Conflict(String),

    /// Network attack refused because the target shares the host netns.
    #[error("container is using host network and failOnHostNetwork is enabled")]
    HostNetworkRefused,

    /// A runtime subprocess (runc, tar, or a sidecar payload) failed.
    ///
    /// Carries the exit code and stderr verbatim so callers can apply
    /// policy (e.g. exit 137 under memory stress).
    #[error("'{command}' failed with exit code {}: {stderr}", exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// Exit code, if the process exited rather than being signalled.
        exit_code: Option<i32>,
        /// Captured standard error, untrimmed.
        stderr: String,
    },

    /// The stress workload was OOM-killed and the action asked to fail on it.
    #[error("stress process was killed: exit status {EXIT_CODE_SIGKILL}")]
    OomKilled,

    /// An operation exceeded its allowed time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FaultError {
    /// Creates an invalid-configuration error.
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Creates a target-gone error.
    #[must_use]
    pub fn target_gone(msg: impl Into<String>) -> Self {
        Self::TargetGone(msg.into())
    }

    /// Creates an unsupported-operation error.
    #[must_use]
    pub fn unsupported(engine: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            engine: engine.into(),
            operation: operation.into(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this error is a subprocess failure with the SIGKILL
    /// exit code, which is how an OOM kill of the payload surfaces.
    #[must_use]
    pub fn is_sigkill_exit(&self) -> bool {
        matches!(
            self,
            Self::CommandFailed {
                exit_code: Some(EXIT_CODE_SIGKILL),
                ..
            }
        )
    }

    /// Returns true if the target container is gone.
    #[must_use]
    pub const fn is_target_gone(&self) -> bool {
        matches!(self, Self::TargetGone(_))
    }

    /// Protocol error kind for the orchestrator-facing response.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "Internal",
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::TargetGone(_) => "TargetGone",
            Self::Unsupported { .. } => "UnsupportedOnRuntime",
            Self::Conflict(_) => "Conflict",
            Self::HostNetworkRefused => "HostNetworkRefused",
            Self::CommandFailed { .. } => "RuntimeCommandFailed",
            Self::OomKilled => "OOMKilled",
            Self::Timeout(_) => "Timeout",
            Self::Internal(_) => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_keeps_stderr_verbatim() {
        let err = FaultError::CommandFailed {
            command: "runc run sb-1".to_string(),
            exit_code: Some(1),
            stderr: "container_linux.go:380: starting container process caused\n".to_string(),
        };
        assert!(err.to_string().contains("exit code 1"));
        assert!(err
            .to_string()
            .contains("container_linux.go:380: starting container process caused"));
    }

    #[test]
    fn sigkill_exit_is_detected() {
        let err = FaultError::CommandFailed {
            command: "runc run sb-2".to_string(),
            exit_code: Some(137),
            stderr: String::new(),
        };
        assert!(err.is_sigkill_exit());

        let err = FaultError::CommandFailed {
            command: "runc run sb-3".to_string(),
            exit_code: Some(1),
            stderr: String::new(),
        };
        assert!(!err.is_sigkill_exit());
    }

    #[test]
    fn kinds_match_protocol_names() {
        assert_eq!(FaultError::invalid_config("x").kind(), "InvalidConfig");
        assert_eq!(FaultError::target_gone("x").kind(), "TargetGone");
        assert_eq!(
            FaultError::unsupported("cri-o", "pause").kind(),
            "UnsupportedOnRuntime"
        );
        assert_eq!(FaultError::HostNetworkRefused.kind(), "HostNetworkRefused");
        assert_eq!(FaultError::OomKilled.kind(), "OOMKilled");
    }

    #[test]
    fn unsupported_names_engine_and_operation() {
        let err = FaultError::unsupported("cri-o", "pause");
        assert_eq!(err.to_string(), "unsupported on cri-o: pause");
    }
}
