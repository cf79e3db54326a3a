use crate::error::{CapsuleError, CapsuleResult};
use crate::secret::Secret;
use std::path::{Path, PathBuf};

/// Where the volume mount point appears inside the container.
pub const VOLUME_TARGET: &str = "/capsule";
/// Where the workspace root appears inside the container.
pub const WORKSPACE_TARGET: &str = "/workspace";

/// Result of asking the volume driver to open a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOutcome {
    Mounted(PathBuf),
    AlreadyMounted(PathBuf),
}

impl MountOutcome {
    pub fn mount_point(&self) -> &Path {
        match self {
            MountOutcome::Mounted(path) | MountOutcome::AlreadyMounted(path) => path,
        }
    }

    pub fn was_already_mounted(&self) -> bool {
        matches!(self, MountOutcome::AlreadyMounted(_))
    }
}

/// Callback run against the freshly created, still mounted volume.
pub type PopulateFn<'a> = &'a mut dyn FnMut(&Path) -> CapsuleResult<()>;

/// Abstraction over an encrypted disk-image primitive.
///
/// Implementations wrap host tooling (hdiutil, cryptsetup) so the coordinator
/// can be exercised against in-memory fakes.
pub trait VolumeDriver: Send + Sync {
    /// Create a volume of `capacity_gb` at `path`, mount it once for
    /// `on_ready`, then close it. Fails with `AlreadyExists` if `path` exists.
    fn create(
        &self,
        path: &Path,
        capacity_gb: u32,
        secret: &Secret,
        on_ready: PopulateFn<'_>,
    ) -> CapsuleResult<()>;

    /// Mount the volume, or report the live session if one already exists.
    fn open(&self, path: &Path, secret: &Secret) -> CapsuleResult<MountOutcome>;

    /// Unmount. Unknown or already-closed mount points are not an error.
    fn close(&self, mount_point: &Path) -> CapsuleResult<()>;

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Ask the driver's own bookkeeping whether `path` is currently mounted.
    fn find_mount_point(&self, path: &Path) -> CapsuleResult<Option<PathBuf>>;

    /// File name used for volumes created by this driver.
    fn volume_file_name(&self) -> &'static str;
}

/// Observed container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Absent,
    Stopped,
    Running,
}

/// Everything the runtime needs to launch a workspace container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub volume_mount: PathBuf,
    pub workspace_root: PathBuf,
}

impl ContainerConfig {
    /// Both bind sources must be absolute, existing directories.
    pub fn validate(&self) -> CapsuleResult<()> {
        if self.name.trim().is_empty() {
            return Err(CapsuleError::InvalidConfig(
                "container name must not be empty".to_string(),
            ));
        }
        if self.image.trim().is_empty() {
            return Err(CapsuleError::InvalidConfig(
                "container image must not be empty".to_string(),
            ));
        }
        for (label, path) in [
            ("volume mount point", &self.volume_mount),
            ("workspace root", &self.workspace_root),
        ] {
            if !path.is_absolute() {
                return Err(CapsuleError::InvalidConfig(format!(
                    "{label} must be an absolute path: {}",
                    path.display()
                )));
            }
            if !path.is_dir() {
                return Err(CapsuleError::InvalidConfig(format!(
                    "{label} does not exist: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Abstraction over the container runtime.
pub trait ContainerDriver: Send + Sync {
    /// Fail with a `Driver` error when the runtime daemon is unreachable.
    fn ping(&self) -> CapsuleResult<()>;

    fn image_exists(&self, image: &str) -> CapsuleResult<bool>;

    fn build_image(&self, image: &str) -> CapsuleResult<()>;

    fn exists(&self, name: &str) -> CapsuleResult<bool>;

    fn is_running(&self, name: &str) -> CapsuleResult<bool>;

    fn state(&self, name: &str) -> CapsuleResult<ContainerState> {
        if !self.exists(name)? {
            return Ok(ContainerState::Absent);
        }
        if self.is_running(name)? {
            Ok(ContainerState::Running)
        } else {
            Ok(ContainerState::Stopped)
        }
    }

    /// Create and start a detached container. Implementations call
    /// `config.validate()` before touching the runtime.
    fn start(&self, config: &ContainerConfig) -> CapsuleResult<()>;

    /// Graceful stop, forced kill, then removal. A missing container is fine.
    fn stop(&self, name: &str) -> CapsuleResult<()>;

    /// Remove the container if it exists. Returns whether anything was removed.
    fn remove_if_present(&self, name: &str) -> CapsuleResult<bool>;

    /// Attach the caller's terminal to a shell and return its exit code.
    fn exec_interactive(&self, name: &str, shell: &str) -> CapsuleResult<i32>;

    /// Run a non-interactive command inside the container.
    fn exec(&self, name: &str, args: &[&str]) -> CapsuleResult<String>;

    /// Best-effort hint that the contents under `mount_point` changed.
    fn refresh_cache_for(&self, mount_point: &Path) -> CapsuleResult<()>;

    /// Best-effort global cache drop.
    fn clear_host_cache(&self) -> CapsuleResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn validate_rejects_relative_and_missing_sources() {
        let dir = tempdir().unwrap();
        let mut config = ContainerConfig {
            name: "capsule-1234abcd".into(),
            image: "capsule:latest".into(),
            volume_mount: PathBuf::from("relative/mount"),
            workspace_root: dir.path().to_path_buf(),
        };
        assert!(matches!(
            config.validate(),
            Err(CapsuleError::InvalidConfig(msg)) if msg.contains("absolute")
        ));

        config.volume_mount = dir.path().join("missing");
        assert!(matches!(
            config.validate(),
            Err(CapsuleError::InvalidConfig(msg)) if msg.contains("does not exist")
        ));

        config.volume_mount = dir.path().to_path_buf();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mount_outcome_exposes_mount_point() {
        let outcome = MountOutcome::AlreadyMounted(PathBuf::from("/tmp/capsule-abc"));
        assert!(outcome.was_already_mounted());
        assert_eq!(outcome.mount_point(), Path::new("/tmp/capsule-abc"));
    }
}
