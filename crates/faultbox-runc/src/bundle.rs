//! Sidecar bundle lifecycle.
//!
//! A bundle is a scratch directory `<scratch>/<sidecar-id>/` holding
//! `rootfs/` extracted from the sidecar archive plus the runtime-generated
//! `config.json`. Bundles are created per sidecar invocation and never
//! reused; removal is guaranteed on every exit path (explicit `remove`
//! with a `Drop` fallback).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::process::Command;

use faultbox_error::{FaultError, Result};

use crate::runc::Runc;
use crate::spec::Spec;

static SIDECAR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Derives a fresh sidecar id for a target container.
///
/// Ids combine a target prefix with a process-wide monotonic counter so
/// concurrent operations against the same target never collide.
#[must_use]
pub fn next_sidecar_id(target_id: &str) -> String {
    let prefix: String = target_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(12)
        .collect();
    let n = SIDECAR_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sb-{prefix}-{n}")
}

/// An on-disk OCI bundle owned by one sidecar invocation.
#[derive(Debug)]
pub struct Bundle {
    dir: PathBuf,
    removed: bool,
}

impl Bundle {
    /// Creates the bundle: extracts the sidecar rootfs and generates the
    /// baseline spec via the runtime.
    ///
    /// On failure the partially created directory is removed before the
    /// error is returned.
    pub async fn prepare(
        scratch_root: &Path,
        image_tar: &Path,
        sidecar_id: &str,
        runc: &Runc,
    ) -> Result<Self> {
        let dir = scratch_root.join(sidecar_id);
        let rootfs = dir.join("rootfs");

        // A stale directory from a crashed run must not leak into this one.
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&rootfs)?;

        let bundle = Self {
            dir,
            removed: false,
        };

        tracing::trace!(bundle = %bundle.dir.display(), image = %image_tar.display(), "extracting sidecar rootfs");
        if let Err(err) = extract_tar(image_tar, &rootfs).await {
            bundle.remove();
            return Err(err);
        }

        if let Err(err) = runc.spec(&bundle.dir).await {
            bundle.remove();
            return Err(err);
        }

        tracing::trace!(bundle = %bundle.dir.display(), sidecar_id, "prepared sidecar bundle");
        Ok(bundle)
    }

    /// Bundle directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Rootfs directory inside the bundle.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.dir.join("rootfs")
    }

    /// Loads the bundle spec for editing.
    pub fn spec(&self) -> Result<Spec> {
        Spec::load(&self.dir)
    }

    /// Writes an edited spec back into the bundle.
    pub fn save_spec(&self, spec: &Spec) -> Result<()> {
        spec.save(&self.dir)
    }

    /// Removes the bundle directory. Safe to call once; `Drop` covers the
    /// paths that skip it.
    pub fn remove(mut self) {
        self.remove_inner();
    }

    fn remove_inner(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(bundle = %self.dir.display(), error = %err, "could not remove sidecar bundle");
            }
        } else {
            tracing::trace!(bundle = %self.dir.display(), "removed sidecar bundle");
        }
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        self.remove_inner();
    }
}

async fn extract_tar(image_tar: &Path, rootfs: &Path) -> Result<()> {
    let output = Command::new("tar")
        .arg("-xf")
        .arg(image_tar)
        .arg("-C")
        .arg(rootfs)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    if output.status.success() {
        Ok(())
    } else {
        Err(FaultError::CommandFailed {
            command: format!("tar -xf {} -C {}", image_tar.display(), rootfs.display()),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::SidecarImage;
    use crate::runc::RuncConfig;

    #[test]
    fn sidecar_ids_are_unique_per_target() {
        let a = next_sidecar_id("4f5e6d7c8b9a0f1e2d3c");
        let b = next_sidecar_id("4f5e6d7c8b9a0f1e2d3c");
        assert_ne!(a, b);
        assert!(a.starts_with("sb-4f5e6d7c8b9a-"));
        assert!(b.starts_with("sb-4f5e6d7c8b9a-"));
    }

    #[test]
    fn sidecar_id_sanitizes_target() {
        let id = next_sidecar_id("k8s://pod/abc!!");
        assert!(id.starts_with("sb-k8spodabc-"));
    }

    #[tokio::test]
    async fn failed_prepare_cleans_up() {
        let scratch = tempfile::tempdir().unwrap();
        // Nonexistent archive: tar fails, the bundle dir must be gone.
        let runc = Runc::new(RuncConfig::default());
        let err = Bundle::prepare(
            scratch.path(),
            Path::new("/nonexistent/image.tar"),
            "sb-test-1",
            &runc,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FaultError::CommandFailed { .. }));
        assert!(!scratch.path().join("sb-test-1").exists());
    }

    #[tokio::test]
    async fn prepare_extracts_rootfs() {
        let scratch = tempfile::tempdir().unwrap();
        let image = SidecarImage::materialize(scratch.path(), None).unwrap();
        // `true` stands in for the runtime: `true spec --bundle <dir>`
        // succeeds without writing config.json, which is fine here; the
        // extraction is what is under test.
        let runc = Runc::new(RuncConfig::default()).with_binary("true");
        let bundle = Bundle::prepare(scratch.path(), image.path(), "sb-test-2", &runc)
            .await
            .unwrap();
        assert!(bundle.rootfs().join("etc/passwd").is_file());
        let dir = bundle.path().to_path_buf();
        bundle.remove();
        assert!(!dir.exists());
    }
}
