//! Embedded sidecar rootfs archive.
//!
//! The sidecar image ships inside the agent binary and is materialized to
//! the scratch directory once per process, on first use. The archive holds
//! the minimal toolset the attacks need (`ip`, `tc`, `iptables`,
//! `ip6tables`, `dig`, `stress-ng` and their dependencies); the build
//! pipeline injects the full archive, this crate only carries the contract.

use std::path::{Path, PathBuf};

use faultbox_error::{FaultError, Result};

static SIDECAR_ROOTFS_TAR: &[u8] = include_bytes!("../sidecar-rootfs.tar");

/// Handle to the sidecar rootfs archive on disk.
#[derive(Debug, Clone)]
pub struct SidecarImage {
    path: PathBuf,
}

impl SidecarImage {
    /// Returns the archive, extracting the embedded one under
    /// `scratch_root` unless it is already there.
    ///
    /// With an `override_path` the file must already exist; the embedded
    /// archive is ignored.
    pub fn materialize(scratch_root: &Path, override_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = override_path {
            if !path.is_file() {
                return Err(FaultError::invalid_config(format!(
                    "sidecar image override {} does not exist",
                    path.display()
                )));
            }
            return Ok(Self {
                path: path.to_path_buf(),
            });
        }

        let path = scratch_root.join("sidecar.tar");
        if !path.is_file() {
            std::fs::create_dir_all(scratch_root)?;

            // Write-then-rename so a concurrent agent start never reads a
            // half-written archive.
            let tmp = scratch_root.join(format!("sidecar.tar.{}", std::process::id()));
            std::fs::write(&tmp, SIDECAR_ROOTFS_TAR)?;
            std::fs::rename(&tmp, &path)?;
            tracing::debug!(path = %path.display(), bytes = SIDECAR_ROOTFS_TAR.len(), "materialized sidecar image");
        }
        Ok(Self { path })
    }

    /// Path to the archive on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_must_exist() {
        let err = SidecarImage::materialize(
            Path::new("/tmp"),
            Some(Path::new("/nonexistent/sidecar.tar")),
        )
        .unwrap_err();
        assert!(matches!(err, FaultError::InvalidConfig(_)));
    }

    #[test]
    fn embedded_archive_is_materialized_once() {
        let dir = tempfile::tempdir().unwrap();
        let first = SidecarImage::materialize(dir.path(), None).unwrap();
        assert!(first.path().is_file());
        let second = SidecarImage::materialize(dir.path(), None).unwrap();
        assert_eq!(first.path(), second.path());
    }
}
