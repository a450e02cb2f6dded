//! Translation of action parameters into `stress-ng` arguments.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use faultbox_error::{FaultError, Result};

/// Sub-modes of the I/O stress action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Flush and read/write combined.
    #[default]
    Default,
    /// Sync-heavy workers only (`--io`).
    Flush,
    /// Disk write workers only (`--hdd`).
    ReadWrite,
}

impl IoMode {
    /// Parses the config string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "default" => Ok(Self::Default),
            "flush" => Ok(Self::Flush),
            "read_write" => Ok(Self::ReadWrite),
            other => Err(FaultError::invalid_config(format!(
                "unknown io stress mode '{other}'"
            ))),
        }
    }
}

/// The `stress-ng` invocation for one stress action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressOpts {
    /// CPU workers (`--cpu`); 0 means one per core.
    pub cpu_workers: Option<u32>,
    /// CPU load percentage per worker (`--cpu-load`).
    pub cpu_load: Option<u8>,
    /// VM workers (`--vm`).
    pub vm_workers: Option<u32>,
    /// Bytes per VM worker (`--vm-bytes`), e.g. `80%`.
    pub vm_bytes: Option<String>,
    /// Keep memory allocated (`--vm-keep`).
    pub vm_keep: bool,
    /// Disk write workers (`--hdd`).
    pub hdd_workers: Option<u32>,
    /// Bytes per disk worker (`--hdd-bytes`), e.g. `50%`.
    pub hdd_bytes: Option<String>,
    /// Sync workers (`--io`).
    pub io_workers: Option<u32>,
    /// Working directory for disk workers (`--temp-path`), interpreted in
    /// the target's mount namespace.
    pub temp_path: Option<PathBuf>,
    /// Self-expiry (`--timeout`).
    pub timeout: Duration,
}

impl StressOpts {
    /// CPU pressure: `workers` stressors at `cpu_load` percent each.
    #[must_use]
    pub fn cpu(duration: Duration, workers: u32, cpu_load: u8) -> Self {
        Self {
            cpu_workers: Some(workers),
            cpu_load: Some(cpu_load),
            timeout: duration,
            ..Self::default()
        }
    }

    /// Memory pressure: one VM worker holding `percentage` percent of
    /// available memory.
    #[must_use]
    pub fn memory(duration: Duration, percentage: u8) -> Self {
        Self {
            vm_workers: Some(1),
            vm_bytes: Some(format!("{percentage}%")),
            vm_keep: true,
            timeout: duration,
            ..Self::default()
        }
    }

    /// I/O pressure in one of the three sub-modes.
    #[must_use]
    pub fn io(
        duration: Duration,
        path: PathBuf,
        workers: u32,
        percentage: u8,
        mode: IoMode,
    ) -> Self {
        let mut opts = Self {
            temp_path: Some(path),
            timeout: duration,
            ..Self::default()
        };
        if matches!(mode, IoMode::Default | IoMode::ReadWrite) {
            opts.hdd_workers = Some(workers);
            opts.hdd_bytes = Some(format!("{percentage}%"));
        }
        if matches!(mode, IoMode::Default | IoMode::Flush) {
            opts.io_workers = Some(workers);
        }
        opts
    }

    /// Renders the full `stress-ng` argv.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["stress-ng".to_string()];
        if let Some(workers) = self.cpu_workers {
            args.push("--cpu".to_string());
            args.push(workers.to_string());
        }
        if let Some(load) = self.cpu_load {
            args.push("--cpu-load".to_string());
            args.push(load.to_string());
        }
        if let Some(workers) = self.vm_workers {
            args.push("--vm".to_string());
            args.push(workers.to_string());
        }
        if let Some(bytes) = &self.vm_bytes {
            args.push("--vm-bytes".to_string());
            args.push(bytes.clone());
        }
        if self.vm_keep {
            args.push("--vm-keep".to_string());
        }
        if let Some(workers) = self.hdd_workers {
            args.push("--hdd".to_string());
            args.push(workers.to_string());
        }
        if let Some(bytes) = &self.hdd_bytes {
            args.push("--hdd-bytes".to_string());
            args.push(bytes.clone());
        }
        if let Some(workers) = self.io_workers {
            args.push("--io".to_string());
            args.push(workers.to_string());
        }
        if let Some(path) = &self.temp_path {
            args.push("--temp-path".to_string());
            args.push(path.display().to_string());
        }
        args.push("--timeout".to_string());
        args.push(format!("{}s", self.timeout.as_secs()));
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_default_mode_sets_hdd_and_io_workers() {
        let opts = StressOpts::io(
            Duration::from_millis(1000),
            PathBuf::from("/somepath"),
            1,
            50,
            IoMode::Default,
        );
        assert_eq!(
            opts,
            StressOpts {
                hdd_workers: Some(1),
                hdd_bytes: Some("50%".to_string()),
                io_workers: Some(1),
                temp_path: Some(PathBuf::from("/somepath")),
                timeout: Duration::from_secs(1),
                ..StressOpts::default()
            }
        );
    }

    #[test]
    fn io_flush_mode_sets_only_io_workers() {
        let opts = StressOpts::io(
            Duration::from_millis(1000),
            PathBuf::from("/somepath"),
            1,
            50,
            IoMode::Flush,
        );
        assert_eq!(
            opts,
            StressOpts {
                io_workers: Some(1),
                temp_path: Some(PathBuf::from("/somepath")),
                timeout: Duration::from_secs(1),
                ..StressOpts::default()
            }
        );
    }

    #[test]
    fn io_read_write_mode_sets_only_hdd_workers() {
        let opts = StressOpts::io(
            Duration::from_millis(1000),
            PathBuf::from("/somepath"),
            1,
            50,
            IoMode::ReadWrite,
        );
        assert_eq!(
            opts,
            StressOpts {
                hdd_workers: Some(1),
                hdd_bytes: Some("50%".to_string()),
                temp_path: Some(PathBuf::from("/somepath")),
                timeout: Duration::from_secs(1),
                ..StressOpts::default()
            }
        );
    }

    #[test]
    fn cpu_args_render_workers_and_load() {
        let args = StressOpts::cpu(Duration::from_secs(30), 0, 80).to_args();
        assert_eq!(
            args,
            vec![
                "stress-ng",
                "--cpu",
                "0",
                "--cpu-load",
                "80",
                "--timeout",
                "30s"
            ]
        );
    }

    #[test]
    fn memory_args_keep_allocation() {
        let args = StressOpts::memory(Duration::from_secs(10), 80).to_args();
        assert_eq!(
            args,
            vec![
                "stress-ng",
                "--vm",
                "1",
                "--vm-bytes",
                "80%",
                "--vm-keep",
                "--timeout",
                "10s"
            ]
        );
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(IoMode::parse("").unwrap(), IoMode::Default);
        assert_eq!(IoMode::parse("default").unwrap(), IoMode::Default);
        assert_eq!(IoMode::parse("flush").unwrap(), IoMode::Flush);
        assert_eq!(IoMode::parse("read_write").unwrap(), IoMode::ReadWrite);
        assert!(IoMode::parse("fsync").is_err());
    }
}
